//! Module defining what a match driver needs from a bot

use crate::bot_channel::BotChannel;

/// The operations a match driver uses to play rounds against a bot.
///
/// [`BotChannel`] is the implementation backed by a subprocess. Drivers written against this
/// trait can be tested with in-process bots.
pub trait Bot {
    /// Begin listening to the bot.
    fn start(&self) -> anyhow::Result<()>;

    /// Stop listening. Safe to call several times.
    fn stop(&self);

    /// Notify the bot that `round` started.
    fn signal_new_round(&self, round: u32);

    /// The bot's command for the current round, empty if none came in time.
    fn get_command(&self) -> String;

    /// Latest diagnostic text, empty if none.
    fn get_error(&self) -> String;
}

impl Bot for BotChannel {
    fn start(&self) -> anyhow::Result<()> {
        BotChannel::start(self)
    }

    fn stop(&self) {
        BotChannel::stop(self)
    }

    fn signal_new_round(&self, round: u32) {
        BotChannel::signal_new_round(self, round)
    }

    fn get_command(&self) -> String {
        BotChannel::get_command(self)
    }

    fn get_error(&self) -> String {
        BotChannel::get_error(self)
    }
}

/// What came out of one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The bot answered in time.
    Command(String),
    /// No command this round. `error` is the bot's latest diagnostic line, possibly empty.
    Forfeit {
        /// Snapshot of the bot's error stream.
        error: String,
    },
}

impl RoundOutcome {
    /// The command, if the round was not forfeited.
    pub fn command(&self) -> Option<&str> {
        match self {
            RoundOutcome::Command(command) => Some(command),
            RoundOutcome::Forfeit { .. } => None,
        }
    }

    /// True when no command came in time.
    pub fn is_forfeit(&self) -> bool {
        matches!(self, RoundOutcome::Forfeit { .. })
    }
}

/// Signal `round` then wait for the bot's answer, in that order.
///
/// An empty command is a forfeit, even if the bot deliberately wrote an empty line.
pub fn play_round<B: Bot + ?Sized>(bot: &B, round: u32) -> RoundOutcome {
    bot.signal_new_round(round);
    let command = bot.get_command();
    if command.is_empty() {
        RoundOutcome::Forfeit {
            error: bot.get_error(),
        }
    } else {
        RoundOutcome::Command(command)
    }
}
