//! # Bot Runner
//!
//! Round-based synchronization between a turn-based game engine and a long-running bot process.
//!
//! It provides:
//! - A per-bot synchronizer (`BotChannel`) exchanging plain-text lines over the bot's standard streams
//! - Per-round timeouts: a bot that stays silent forfeits the round, the match goes on
//! - Capture of the bot's error output for diagnostics
//! - Clean shutdown: no thread stays blocked on the bot once the channel is stopped
//!
//! Each bot is a separate OS process. The engine writes the round number on the bot's stdin,
//! the bot answers with one line on its stdout.
//!
//! # Documentation Overview
//!
//! - For the round protocol and the channel lifecycle, see the [`bot_channel`] module.
//! - For timeouts and logging, see [`Configuration`](crate::configuration::Configuration).
//! - For writing a match driver, see the [`Bot`](crate::bot_interface::Bot) trait and [`play_round`](crate::bot_interface::play_round).
//!
//! # Example Bot
//!
//! A bot reads one round number per line and answers one command per line:
//!
//! ```no_run
//! use std::io::{self, BufRead, Write};
//!
//! fn main() -> io::Result<()> {
//!     let stdin = io::stdin();
//!     let mut stdout = io::stdout();
//!     for line in stdin.lock().lines() {
//!         let round: u32 = line?.trim().parse().unwrap_or(0);
//!         eprintln!("playing round {round}");
//!         writeln!(stdout, "MOVE {round}")?;
//!         stdout.flush()?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Bot Requirements
//!
//! - Answer each round with exactly one line, before the configured timeout
//! - Flush stdout after each answer
//! - Anything written on stderr is kept for diagnostics only
#![warn(missing_docs)]

pub use anyhow;
pub mod bot_channel;
pub mod bot_interface;
pub mod bot_streams;
mod channel_state;
pub mod configuration;
mod logger;
mod stream_reader;

pub use channel_state::Lifecycle;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use bot_runner::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bot_channel::BotChannel;
    pub use crate::bot_interface::{play_round, Bot, RoundOutcome};
    pub use crate::bot_streams::BotStreams;
    pub use crate::configuration::Configuration;
    pub use crate::Lifecycle;
}
