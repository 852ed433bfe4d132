//! Shared monitor between the driving thread and the two stream readers.
//!
//! One [`Mutex`] guards every mutable field of a channel. Two [`Condvar`]s hang off it:
//! `ready` (start has happened) and `command_available` (a fresh command was stored or the
//! channel stopped).

use std::io::{Read, Write};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

/// Where a channel is in its session.
///
/// `Stopped` is terminal, nothing leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Built, streams maybe attached, readers not running yet.
    Created,
    /// `start()` ran, rounds can be signaled.
    Started,
    /// `stop()` ran, every operation is a no-op.
    Stopped,
}

/// Last command line read from the bot's output.
#[derive(Debug, Default)]
pub struct CommandSlot {
    last: String,
    fresh: bool,
}

impl CommandSlot {
    /// Store a complete line. The caller must notify `command_available` afterwards, while
    /// still holding the lock.
    pub fn store(&mut self, command: String) {
        self.last = command;
        self.fresh = true;
    }

    /// True when a line was stored and has not been handed out yet.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Hand out the last line. The slot keeps its value.
    pub fn take(&mut self) -> String {
        self.fresh = false;
        self.last.clone()
    }

    pub fn last_received(&self) -> &str {
        &self.last
    }
}

/// Last diagnostic line read from the bot's error stream. Replaced on every write.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    last: String,
}

impl ErrorSlot {
    pub fn store(&mut self, error: String) {
        self.last = error;
    }

    pub fn last_error(&self) -> &str {
        &self.last
    }
}

/// Everything the channel lock protects.
pub struct ChannelState {
    pub lifecycle: Lifecycle,
    /// Round number last sent to the bot.
    pub round: u32,
    pub command: CommandSlot,
    pub error: ErrorSlot,
    pub input: Option<Box<dyn Write + Send>>,
    /// Attached but not yet handed to a reader thread.
    pub output_stream: Option<Box<dyn Read + Send>>,
    pub error_stream: Option<Box<dyn Read + Send>>,
    pub readers: Vec<JoinHandle<()>>,
}

impl ChannelState {
    pub fn is_started(&self) -> bool {
        self.lifecycle != Lifecycle::Created
    }

    pub fn is_stopped(&self) -> bool {
        self.lifecycle == Lifecycle::Stopped
    }
}

impl std::fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelState")
            .field("lifecycle", &self.lifecycle)
            .field("round", &self.round)
            .field("command", &self.command)
            .field("error", &self.error)
            .field("input", &self.input.is_some())
            .field("readers", &self.readers.len())
            .finish()
    }
}

/// Lock plus the two condition signals, shared through an `Arc` with the reader threads.
#[derive(Debug)]
pub struct SharedState {
    state: Mutex<ChannelState>,
    pub ready: Condvar,
    pub command_available: Condvar,
}

impl SharedState {
    pub fn new() -> Self {
        SharedState {
            state: Mutex::new(ChannelState {
                lifecycle: Lifecycle::Created,
                round: 0,
                command: CommandSlot::default(),
                error: ErrorSlot::default(),
                input: None,
                output_stream: None,
                error_stream: None,
                readers: Vec::new(),
            }),
            ready: Condvar::new(),
            command_available: Condvar::new(),
        }
    }

    /// Acquire the channel lock.
    ///
    /// A thread panicking while holding the lock leaves the state consistent field by field,
    /// so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
