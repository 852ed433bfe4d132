use std::fmt::Display;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use tracing::{debug, instrument, trace};

use crate::channel_state::SharedState;

/// Which of the bot's streams a reader is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderRole {
    /// stdout, one command per round, awaited by the driver.
    Output,
    /// stderr, free-form diagnostics, polled by the driver.
    Error,
}

impl Display for ReaderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderRole::Output => write!(f, "output"),
            ReaderRole::Error => write!(f, "error"),
        }
    }
}

/// Cooperative stop request shared between a channel and its readers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Blocking line reader publishing into the channel's shared state.
#[derive(Debug)]
pub struct StreamReader {
    role: ReaderRole,
    shared: Arc<SharedState>,
    cancel: CancellationToken,
}

impl StreamReader {
    pub fn new(role: ReaderRole, shared: Arc<SharedState>, cancel: CancellationToken) -> Self {
        StreamReader {
            role,
            shared,
            cancel,
        }
    }

    /// Run the read loop on a dedicated thread until end of stream, read failure or cancellation.
    pub fn spawn(self, stream: Box<dyn Read + Send>) -> anyhow::Result<JoinHandle<()>> {
        let role = self.role;
        thread::Builder::new()
            .name(format!("bot-{role}-reader"))
            .spawn(move || self.run(BufReader::new(stream)))
            .with_context(|| format!("could not spawn {role} reader thread"))
    }

    /// The read loop. Never fails: every way out is a normal exit and the slot keeps its last value.
    #[instrument(skip_all, fields(role = %self.role))]
    pub fn run<R: BufRead>(&self, mut reader: R) {
        let mut buf = String::new();
        loop {
            if self.cancel.is_cancelled() {
                debug!("reader cancelled");
                break;
            }
            buf.clear();
            match reader.read_line(&mut buf) {
                Ok(0) => {
                    debug!("stream closed");
                    break;
                }
                Ok(_) => {
                    // a line that arrives after stop is dropped
                    if self.cancel.is_cancelled() {
                        debug!("reader cancelled");
                        break;
                    }
                    self.publish(strip_line_ending(&buf).to_owned());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("stream read failed: {e}");
                    break;
                }
            }
        }
    }

    /// Store then signal, both under the channel lock.
    fn publish(&self, line: String) {
        let mut state = self.shared.lock();
        if state.is_stopped() {
            return;
        }
        match self.role {
            ReaderRole::Output => {
                trace!(round = state.round, command = %line, "received command");
                state.command.store(line);
                self.shared.command_available.notify_all();
            }
            ReaderRole::Error => {
                trace!(round = state.round, error = %line, "received error output");
                state.error.store(line);
            }
        }
    }
}

fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}
