//! Handles on a bot's standard streams and, optionally, on the bot process itself.

use std::io::{Read, Write};
use std::process::Child;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};

/// The three standard streams of a bot, seen from the engine side.
///
/// `input` is written to (the bot's stdin), `output` and `error` are read from (the bot's
/// stdout and stderr). When built with [`BotStreams::from_child`] the process itself travels
/// along so the channel can kill it on stop.
pub struct BotStreams {
    pub(crate) input: Box<dyn Write + Send>,
    pub(crate) output: Box<dyn Read + Send>,
    pub(crate) error: Box<dyn Read + Send>,
    pub(crate) child: Option<OwnedChild>,
}

impl BotStreams {
    /// Take the piped stdio of a spawned bot along with the process itself.
    ///
    /// # Errors
    /// Returned when one of stdin, stdout or stderr was not set to [`Stdio::piped`](std::process::Stdio::piped).
    /// The child is killed in that case.
    pub fn from_child(mut child: Child) -> anyhow::Result<BotStreams> {
        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(input), Some(output), Some(error)) = pipes else {
            let mut owned = OwnedChild::new(child);
            let _ = owned.try_kill(Duration::from_millis(100));
            return Err(anyhow!("bot process must have piped stdin, stdout and stderr"));
        };

        Ok(BotStreams {
            input: Box::new(input),
            output: Box::new(output),
            error: Box::new(error),
            child: Some(OwnedChild::new(child)),
        })
    }

    /// Use arbitrary streams, no process attached.
    ///
    /// Reader threads then only notice a stop once their blocking read returns.
    pub fn from_parts(
        input: impl Write + Send + 'static,
        output: impl Read + Send + 'static,
        error: impl Read + Send + 'static,
    ) -> BotStreams {
        BotStreams {
            input: Box::new(input),
            output: Box::new(output),
            error: Box::new(error),
            child: None,
        }
    }

    /// Process id of the attached bot, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(OwnedChild::id)
    }
}

impl std::fmt::Debug for BotStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotStreams")
            .field("child", &self.child)
            .finish_non_exhaustive()
    }
}

/// A bot process exclusively owned by its channel.
#[derive(Debug)]
pub struct OwnedChild {
    child: Child,
    cleaned_up: bool,
}

impl OwnedChild {
    fn new(child: Child) -> Self {
        OwnedChild {
            child,
            cleaned_up: false,
        }
    }

    /// OS process id.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Kill the process and wait up to `max_duration` for it to be reaped.
    ///
    /// Killing a process that already exited is not an error.
    pub fn try_kill(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        if self
            .child
            .try_wait()
            .context("could not query process status")?
            .is_none()
        {
            // may race with a natural exit, the wait below settles it
            let _ = self.child.kill();
        }

        let deadline = Instant::now() + max_duration;
        loop {
            if self
                .child
                .try_wait()
                .context("could not query process status")?
                .is_some()
            {
                self.cleaned_up = true;
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(anyhow!("process cleanup timed out"));
            }
            std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
        }
    }
}

impl Drop for OwnedChild {
    fn drop(&mut self) {
        static CLEANUP_DURATION: Duration = Duration::from_millis(100);
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                tracing::warn!(pid = self.child.id(), "could not clean up bot process: {e:#}");
            }
        }
    }
}
