//! Config for the bot channel behaviors
//!
//! This module provides configuration options for controlling how a [`BotChannel`](crate::bot_channel::BotChannel)
//! waits on its bot and how it reports what happens.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! The following environment variables can be used to override configuration values. All
//! values are optional. Flags are case-insensitive, set the value to `"true"` to enable one.
//!
//! - `BOT_TIMEOUT_MS`: Maximum wait for a bot command each round (default: `2000`)
//! - `BOT_STARTUP_GRACE_MS`: Pause given to the readers at start (default: `50`)
//! - `BOT_STOP_GRACE_MS`: Maximum wait for the readers at stop (default: `1000`)
//! - `BOT_VERBOSE`: Log at debug level instead of warnings only (default: `false`)
//! - `BOT_LOG`: Enable logging to a file (default: `false`)
//! - `BOT_LOG_DIR`: Directory receiving `match.log` (default: `.`)

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for bot channel behaviors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) timeout: Duration,
    pub(crate) startup_grace: Duration,
    pub(crate) stop_grace: Duration,
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) log_dir: PathBuf,
}

impl Configuration {
    const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);
    const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(50);
    const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);

    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - A bot has 2 seconds to answer each round.
    /// - Reader threads get 50ms to start listening before the first round.
    /// - Stopping waits up to one second for the reader threads.
    /// - Only warnings and errors are logged.
    /// - Logging to file is disabled.
    pub fn new() -> Self {
        Self {
            timeout: Self::DEFAULT_TIMEOUT,
            startup_grace: Self::DEFAULT_STARTUP_GRACE,
            stop_grace: Self::DEFAULT_STOP_GRACE,
            verbose: false,
            log: false,
            log_dir: PathBuf::from("."),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Any unset or unparsable variable results in the default value for its field.
    /// See the [module documentation](crate::configuration) for the list of recognized variables.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_millis(var: &str, default: Duration) -> Duration {
            std::env::var(var)
                .ok()
                .and_then(|val| val.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        }

        Self {
            timeout: get_env_millis("BOT_TIMEOUT_MS", Self::DEFAULT_TIMEOUT),
            startup_grace: get_env_millis("BOT_STARTUP_GRACE_MS", Self::DEFAULT_STARTUP_GRACE),
            stop_grace: get_env_millis("BOT_STOP_GRACE_MS", Self::DEFAULT_STOP_GRACE),
            verbose: get_env_flag("BOT_VERBOSE", false),
            log: get_env_flag("BOT_LOG", false),
            log_dir: std::env::var_os("BOT_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Maximum time [`get_command`](crate::bot_channel::BotChannel::get_command) waits for the bot.
    ///
    /// Must be strictly positive, otherwise channel creation fails.
    pub fn with_timeout(mut self, value: Duration) -> Self {
        self.timeout = value;
        self
    }

    /// Pause taken by `start()` so the reader threads can begin their reads.
    ///
    /// This is a best-effort delay, not a readiness guarantee.
    pub fn with_startup_grace(mut self, value: Duration) -> Self {
        self.startup_grace = value;
        self
    }

    /// Maximum time `stop()` waits for the reader threads before detaching them.
    pub fn with_stop_grace(mut self, value: Duration) -> Self {
        self.stop_grace = value;
        self
    }

    /// Enable or disable debug level logs.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Directory where `match.log` is written when logging to file.
    pub fn with_log_dir(mut self, value: impl Into<PathBuf>) -> Self {
        self.log_dir = value.into();
        self
    }

    /// The per-round command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
