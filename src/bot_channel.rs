//! Round-by-round synchronization with a bot subprocess.
//!
//! This module defines the [`BotChannel`] type, which sits between a match driver and a bot.
//! Its responsibilities include:
//!
//! - Telling the bot a new round started, by writing the round number on its stdin
//! - Waiting, up to a configured timeout, for the single line the bot answers on its stdout
//! - Keeping the latest line the bot wrote on its stderr for diagnostics
//! - Shutting everything down so that no thread stays blocked on the bot
//!
//! # Threads
//!
//! Three threads share a channel: the driver, which calls [`signal_new_round`](BotChannel::signal_new_round)
//! then [`get_command`](BotChannel::get_command) once per round, and two reader threads started by
//! [`start`](BotChannel::start), one per output stream. They meet on a single lock and two
//! condition variables.
//!
//! # Protocol
//!
//! - Engine -> Bot : the round number in decimal followed by a line separator
//! - Bot -> Engine : one line per round, the command, handed over verbatim
//! - Bot stderr : any text, the last line is kept
//!
//! The channel does not check that a command answers the round that was last signaled. A bot
//! that answers late hands its late line to the next [`get_command`](BotChannel::get_command).
//! Bots are expected to answer synchronously, once per round.
//!
//! # Example
//!
//! ```no_run
//! use std::process::{Command, Stdio};
//! use std::time::Duration;
//! use bot_runner::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::new().with_timeout(Duration::from_millis(500));
//!     let channel = BotChannel::new(config)?;
//!
//!     let child = Command::new("./my_bot")
//!         .stdin(Stdio::piped())
//!         .stdout(Stdio::piped())
//!         .stderr(Stdio::piped())
//!         .spawn()?;
//!     channel.attach(BotStreams::from_child(child)?)?;
//!     channel.start()?;
//!
//!     for round in 0..10 {
//!         channel.signal_new_round(round);
//!         let command = channel.get_command();
//!         if command.is_empty() {
//!             println!("round {round} forfeited: {}", channel.get_error());
//!         } else {
//!             println!("round {round}: {command}");
//!         }
//!     }
//!
//!     channel.stop();
//!     Ok(())
//! }
//! ```

use std::io::{Read, Write};
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::bail;
use tracing::{debug, error, instrument, trace, warn};

use crate::bot_streams::{BotStreams, OwnedChild};
use crate::channel_state::{Lifecycle, SharedState};
use crate::configuration::Configuration;
use crate::logger::init_logger;
use crate::stream_reader::{CancellationToken, ReaderRole, StreamReader};

#[cfg(windows)]
const LINE_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
const LINE_SEPARATOR: &str = "\n";

/// Synchronizer between a match driver and one bot process.
///
/// Every method takes `&self`, a channel is meant to be shared (e.g. in an `Arc`) between the
/// driver and whoever may need to stop it. Once [`stop`](BotChannel::stop) ran, every operation
/// returns immediately with an empty result.
pub struct BotChannel {
    config: Configuration,
    shared: Arc<SharedState>,
    cancel: CancellationToken,
    /// Outside the state lock, so `stop()` can kill the bot while a write to it is blocked.
    child: Mutex<Option<OwnedChild>>,
}

impl BotChannel {
    /// Create a channel. Streams are attached later, once the bot is spawned.
    ///
    /// Installs the file logger when [`Configuration::with_log`] is set.
    ///
    /// # Errors
    /// Returned when the timeout is zero or when the file logger cannot be created.
    pub fn new(config: Configuration) -> anyhow::Result<BotChannel> {
        if config.timeout.is_zero() {
            bail!("bot timeout must be strictly positive");
        }
        if config.log {
            init_logger(&config)?;
        }
        trace!(?config);

        Ok(BotChannel {
            config,
            shared: Arc::new(SharedState::new()),
            cancel: CancellationToken::new(),
            child: Mutex::new(None),
        })
    }

    /// Hand the bot's streams over to the channel. The channel owns them from now on.
    ///
    /// # Errors
    /// Returned when streams were already attached or the channel was started or stopped.
    pub fn attach(&self, streams: BotStreams) -> anyhow::Result<()> {
        let mut state = self.shared.lock();
        if state.lifecycle != Lifecycle::Created {
            bail!("streams can only be attached before start");
        }
        if state.input.is_some() {
            bail!("bot streams already attached");
        }
        debug!(pid = streams.pid(), "bot streams attached");

        let BotStreams {
            input,
            output,
            error,
            child,
        } = streams;
        state.input = Some(input);
        state.output_stream = Some(output);
        state.error_stream = Some(error);
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = child;
        Ok(())
    }

    /// Launch both reader threads, give them a short grace period, then release any
    /// [`signal_new_round`](BotChannel::signal_new_round) waiting for readiness.
    ///
    /// # Errors
    /// Returned when no streams are attached, when the channel was already started or stopped,
    /// or when a reader thread cannot be spawned. In the last case the channel is stopped.
    #[instrument(skip_all)]
    pub fn start(&self) -> anyhow::Result<()> {
        self.start_with(StreamReader::spawn)
    }

    fn start_with<F>(&self, mut spawn: F) -> anyhow::Result<()>
    where
        F: FnMut(StreamReader, Box<dyn Read + Send>) -> anyhow::Result<JoinHandle<()>>,
    {
        let mut state = self.shared.lock();
        match state.lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Started => bail!("bot channel already started"),
            Lifecycle::Stopped => bail!("bot channel already stopped"),
        }
        let (Some(output), Some(error)) = (state.output_stream.take(), state.error_stream.take())
        else {
            bail!("no bot streams attached");
        };

        for (role, stream) in [(ReaderRole::Output, output), (ReaderRole::Error, error)] {
            let reader = StreamReader::new(role, self.shared.clone(), self.cancel.clone());
            match spawn(reader, stream) {
                Ok(handle) => state.readers.push(handle),
                Err(e) => {
                    // readers already running and the bot must not outlive a failed start
                    drop(state);
                    self.stop();
                    return Err(e);
                }
            }
        }
        state.lifecycle = Lifecycle::Started;

        // best effort: lets the readers reach their first blocking read
        thread::sleep(self.config.startup_grace);

        self.shared.ready.notify_all();
        debug!("bot channel started");
        Ok(())
    }

    /// Stop listening to the bot. Only the first call does anything.
    ///
    /// Cancels both readers, releases any thread waiting in [`get_command`](BotChannel::get_command)
    /// or [`signal_new_round`](BotChannel::signal_new_round), closes the bot's input and kills the
    /// bot process if the channel owns it. Then waits, at most for the configured stop grace,
    /// for the reader threads to finish. Readers still blocked after that are detached.
    #[instrument(skip_all)]
    pub fn stop(&self) {
        let deadline = Instant::now() + self.config.stop_grace;
        self.cancel.cancel();
        // a driver blocked writing to a bot that no longer reads holds the state lock
        // until the bot dies
        self.kill_child();

        let (input, readers) = {
            let mut state = self.shared.lock();
            if state.is_stopped() {
                return;
            }
            state.lifecycle = Lifecycle::Stopped;
            self.shared.command_available.notify_all();
            self.shared.ready.notify_all();

            state.output_stream = None;
            state.error_stream = None;
            (state.input.take(), mem::take(&mut state.readers))
        };

        drop(input);
        // attached between the first kill and the lifecycle change
        self.kill_child();
        wait_for_readers(readers, deadline);
        debug!("bot channel stopped");
    }

    fn kill_child(&self) {
        let child = self.child.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut child) = child {
            if let Err(e) = child.try_kill(self.config.stop_grace) {
                warn!(pid = child.id(), "could not kill bot process: {e:#}");
            }
        }
    }

    /// Tell the bot that `round` started.
    ///
    /// Blocks, without timeout, until [`start`](BotChannel::start) signaled readiness. A write
    /// failure is logged and swallowed: the round counts as sent and the bot will most likely
    /// time out on it.
    pub fn signal_new_round(&self, round: u32) {
        let state = self.shared.lock();
        let mut state = self
            .shared
            .ready
            .wait_while(state, |s| !s.is_started())
            .unwrap_or_else(PoisonError::into_inner);

        state.round = round;
        if state.is_stopped() {
            return;
        }

        if let Some(input) = state.input.as_mut() {
            match write_round(input, round) {
                Ok(()) => trace!(round, "round sent to bot"),
                Err(e) => error!(round, "failed to notify bot of new round: {e}"),
            }
        }
    }

    /// Wait, up to the configured timeout, for the bot's command.
    ///
    /// Returns an empty string when the bot stays silent (the round is forfeited, the bot keeps
    /// running) or when the channel is stopped before or during the wait.
    pub fn get_command(&self) -> String {
        let state = self.shared.lock();
        if state.is_stopped() {
            return String::new();
        }

        let (mut state, wait) = self
            .shared
            .command_available
            .wait_timeout_while(state, self.config.timeout, |s| {
                !s.command.is_fresh() && !s.is_stopped()
            })
            .unwrap_or_else(PoisonError::into_inner);

        if state.is_stopped() {
            debug!(round = state.round, "channel stopped while waiting for a command");
            return String::new();
        }
        if wait.timed_out() && !state.command.is_fresh() {
            warn!(
                round = state.round,
                timeout_ms = self.config.timeout.as_millis() as u64,
                "bot exceeded time limit"
            );
            return String::new();
        }
        state.command.take()
    }

    /// Latest line the bot wrote on its error stream, empty if none or if stopped.
    ///
    /// Never blocks on the bot and does not clear the stored line.
    pub fn get_error(&self) -> String {
        let state = self.shared.lock();
        if state.is_stopped() {
            return String::new();
        }
        state.error.last_error().to_owned()
    }

    /// Last line read from the bot's output, whether or not it was already returned by
    /// [`get_command`](BotChannel::get_command). Empty before the first line.
    pub fn last_received_command(&self) -> String {
        self.shared.lock().command.last_received().to_owned()
    }

    /// Current lifecycle stage.
    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lock().lifecycle
    }

    /// True once [`stop`](BotChannel::stop) ran.
    pub fn is_stopped(&self) -> bool {
        self.shared.lock().is_stopped()
    }

    /// Round number last signaled to the bot.
    pub fn round(&self) -> u32 {
        self.shared.lock().round
    }

    /// The per-round command timeout.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }
}

impl Drop for BotChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for BotChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotChannel")
            .field("config", &self.config)
            .field("state", &*self.shared.lock())
            .field(
                "child",
                &*self.child.lock().unwrap_or_else(PoisonError::into_inner),
            )
            .finish()
    }
}

fn write_round(input: &mut (dyn Write + Send), round: u32) -> std::io::Result<()> {
    write!(input, "{round}{LINE_SEPARATOR}")?;
    input.flush()
}

fn wait_for_readers(readers: Vec<JoinHandle<()>>, deadline: Instant) {
    while readers.iter().any(|h| !h.is_finished()) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    for handle in readers {
        if handle.is_finished() {
            if handle.join().is_err() {
                error!("bot reader thread panicked");
            }
        } else {
            warn!("bot reader thread still blocked after stop, detaching it");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex;

    use super::*;

    /// Bot side of a pipe: every message sent is readable, dropping the sender closes it.
    struct ScriptedStream {
        rx: Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(bytes) => self.pending = bytes,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    fn scripted() -> (Sender<Vec<u8>>, ScriptedStream) {
        let (tx, rx) = mpsc::channel();
        (
            tx,
            ScriptedStream {
                rx,
                pending: vec![],
            },
        )
    }

    #[derive(Clone, Default)]
    struct RecordedInput(Arc<Mutex<Vec<u8>>>);

    impl RecordedInput {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for RecordedInput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "bot is gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        // senders first: they drop before the channel, so the readers see end of stream
        stdout: Sender<Vec<u8>>,
        stderr: Sender<Vec<u8>>,
        input: RecordedInput,
        channel: Arc<BotChannel>,
    }

    fn config(timeout_ms: u64) -> Configuration {
        Configuration::new()
            .with_timeout(Duration::from_millis(timeout_ms))
            .with_startup_grace(Duration::from_millis(5))
            .with_stop_grace(Duration::from_millis(50))
    }

    fn harness(timeout_ms: u64) -> Harness {
        let channel = BotChannel::new(config(timeout_ms)).unwrap();
        let (stdout, out_stream) = scripted();
        let (stderr, err_stream) = scripted();
        let input = RecordedInput::default();
        channel
            .attach(BotStreams::from_parts(input.clone(), out_stream, err_stream))
            .unwrap();
        Harness {
            stdout,
            stderr,
            input,
            channel: Arc::new(channel),
        }
    }

    fn line(s: &str) -> Vec<u8> {
        format!("{s}\n").into_bytes()
    }

    #[test]
    fn round_number_is_written_once() {
        let h = harness(100);
        h.channel.start().unwrap();
        h.channel.signal_new_round(3);
        assert_eq!(h.input.contents(), format!("3{LINE_SEPARATOR}"));
        assert_eq!(h.channel.round(), 3);

        h.channel.signal_new_round(4);
        assert_eq!(
            h.input.contents(),
            format!("3{LINE_SEPARATOR}4{LINE_SEPARATOR}")
        );
    }

    #[test]
    fn command_arriving_in_time_is_returned() {
        let h = harness(100);
        h.channel.start().unwrap();
        h.channel.signal_new_round(3);

        let stdout = h.stdout.clone();
        let bot = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stdout.send(line("ATTACK 5")).unwrap();
        });

        let begin = Instant::now();
        let command = h.channel.get_command();
        let elapsed = begin.elapsed();
        bot.join().unwrap();

        assert_eq!(command, "ATTACK 5");
        assert!(elapsed >= Duration::from_millis(15), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(100), "{elapsed:?}");
    }

    #[test]
    fn command_sent_before_waiting_is_not_lost() {
        let h = harness(200);
        h.channel.start().unwrap();
        h.channel.signal_new_round(0);
        h.stdout.send(line("BUILD 1 1")).unwrap();
        thread::sleep(Duration::from_millis(20));

        let begin = Instant::now();
        assert_eq!(h.channel.get_command(), "BUILD 1 1");
        assert!(begin.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn silent_bot_forfeits_after_timeout() {
        let h = harness(50);
        h.channel.start().unwrap();
        h.channel.signal_new_round(1);

        let begin = Instant::now();
        let command = h.channel.get_command();
        let elapsed = begin.elapsed();

        assert_eq!(command, "");
        assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
        assert!(!h.channel.is_stopped());
    }

    #[test]
    fn a_command_is_handed_out_once() {
        let h = harness(40);
        h.channel.start().unwrap();
        h.channel.signal_new_round(1);
        h.stdout.send(line("MOVE")).unwrap();
        assert_eq!(h.channel.get_command(), "MOVE");

        h.channel.signal_new_round(2);
        assert_eq!(h.channel.get_command(), "");
        assert_eq!(h.channel.last_received_command(), "MOVE");
    }

    #[test]
    fn late_answer_goes_to_the_next_round() {
        let h = harness(30);
        h.channel.start().unwrap();
        h.channel.signal_new_round(1);
        assert_eq!(h.channel.get_command(), "");

        h.stdout.send(line("LATE")).unwrap();
        thread::sleep(Duration::from_millis(20));
        h.channel.signal_new_round(2);
        assert_eq!(h.channel.get_command(), "LATE");
    }

    #[test]
    fn stop_releases_a_waiting_driver() {
        let h = harness(2000);
        h.channel.start().unwrap();
        h.channel.signal_new_round(1);

        let channel = h.channel.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            channel.stop();
        });

        let begin = Instant::now();
        let command = h.channel.get_command();
        let elapsed = begin.elapsed();
        stopper.join().unwrap();

        assert_eq!(command, "");
        assert!(elapsed < Duration::from_millis(1000), "{elapsed:?}");
        assert_eq!(h.channel.lifecycle(), Lifecycle::Stopped);
    }

    #[test]
    fn signal_waits_for_start() {
        let h = harness(100);

        let channel = h.channel.clone();
        let driver = thread::spawn(move || {
            channel.signal_new_round(0);
            Instant::now()
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(h.input.contents(), "");
        assert!(!driver.is_finished());

        let start_called = Instant::now();
        h.channel.start().unwrap();
        let signaled = driver.join().unwrap();

        assert!(signaled >= start_called);
        assert_eq!(h.input.contents(), format!("0{LINE_SEPARATOR}"));
    }

    #[test]
    fn stop_releases_a_driver_waiting_for_start() {
        let h = harness(100);

        let channel = h.channel.clone();
        let driver = thread::spawn(move || channel.signal_new_round(7));

        thread::sleep(Duration::from_millis(20));
        h.channel.stop();
        driver.join().unwrap();

        assert_eq!(h.input.contents(), "");
    }

    #[test]
    fn stopped_channel_is_inert() {
        let h = harness(1000);
        h.channel.start().unwrap();
        h.stderr.send(line("something broke")).unwrap();
        thread::sleep(Duration::from_millis(20));
        h.channel.stop();
        h.channel.stop();

        let begin = Instant::now();
        h.channel.signal_new_round(5);
        assert_eq!(h.channel.get_command(), "");
        assert_eq!(h.channel.get_error(), "");
        assert!(begin.elapsed() < Duration::from_millis(100));
        assert_eq!(h.input.contents(), "");
        assert!(h.channel.start().is_err());
    }

    #[test]
    fn stop_without_start() {
        let h = harness(1000);
        h.channel.stop();
        assert_eq!(h.channel.lifecycle(), Lifecycle::Stopped);

        let begin = Instant::now();
        h.channel.signal_new_round(0);
        assert_eq!(h.channel.get_command(), "");
        assert!(begin.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn error_snapshot_keeps_the_last_line() {
        let h = harness(100);
        h.channel.start().unwrap();
        assert_eq!(h.channel.get_error(), "");

        h.stderr.send(line("warming up")).unwrap();
        h.stderr.send(line("index out of bounds")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        while h.channel.get_error() != "index out of bounds" && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(h.channel.get_error(), "index out of bounds");
        // reading does not clear it
        assert_eq!(h.channel.get_error(), "index out of bounds");
    }

    #[test]
    fn write_failure_degrades_to_timeout() {
        let channel = BotChannel::new(config(30)).unwrap();
        let (_stdout, out_stream) = scripted();
        let (_stderr, err_stream) = scripted();
        channel
            .attach(BotStreams::from_parts(BrokenPipe, out_stream, err_stream))
            .unwrap();
        channel.start().unwrap();

        channel.signal_new_round(1);
        assert_eq!(channel.round(), 1);
        assert_eq!(channel.get_command(), "");
    }

    #[test]
    fn closed_output_means_forfeits() {
        let h = harness(30);
        h.channel.start().unwrap();
        h.stdout.send(line("FIRST")).unwrap();
        let Harness {
            stdout,
            stderr: _stderr,
            input: _input,
            channel,
        } = h;
        drop(stdout);

        channel.signal_new_round(0);
        assert_eq!(channel.get_command(), "FIRST");
        channel.signal_new_round(1);
        assert_eq!(channel.get_command(), "");
    }

    #[test]
    fn failed_start_stops_the_channel() {
        let h = harness(100);

        let channel = h.channel.clone();
        let driver = thread::spawn(move || channel.signal_new_round(0));
        thread::sleep(Duration::from_millis(20));

        let mut spawned = 0;
        let result = h.channel.start_with(|reader, stream| {
            spawned += 1;
            if spawned == 1 {
                reader.spawn(stream)
            } else {
                Err(anyhow::anyhow!("thread limit reached"))
            }
        });

        assert!(result.is_err());
        driver.join().unwrap();
        assert_eq!(h.channel.lifecycle(), Lifecycle::Stopped);
        assert_eq!(h.input.contents(), "");
        assert_eq!(h.channel.get_command(), "");
    }

    #[test]
    fn lifecycle_errors() {
        assert!(BotChannel::new(config(0)).is_err());

        let channel = BotChannel::new(config(10)).unwrap();
        assert!(channel.start().is_err(), "start without streams");

        let h = harness(10);
        let (_out, out_stream) = scripted();
        let (_err, err_stream) = scripted();
        assert!(h
            .channel
            .attach(BotStreams::from_parts(io::sink(), out_stream, err_stream))
            .is_err());

        h.channel.start().unwrap();
        assert_eq!(h.channel.lifecycle(), Lifecycle::Started);
        assert!(h.channel.start().is_err(), "second start");
    }
}
