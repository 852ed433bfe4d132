use std::fs::{self, File};
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use time::format_description;
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

use crate::configuration::Configuration;

/// Set once a subscriber was actually installed.
static INSTALLED: Mutex<bool> = Mutex::new(false);

/// Install a global subscriber writing to `<log_dir>/match.log`.
///
/// Only the first successful call does anything, so every channel of a match can ask for it.
/// A failed call installs nothing and the next one tries again.
pub fn init_logger(config: &Configuration) -> anyhow::Result<()> {
    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    if *installed {
        return Ok(());
    }
    install(config)?;
    *installed = true;
    Ok(())
}

fn install(config: &Configuration) -> anyhow::Result<()> {
    fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("could not create log directory {:?}", config.log_dir))?;
    let path = config.log_dir.join("match.log");
    let file = File::create(&path).with_context(|| format!("could not create {path:?}"))?;
    let writer = BoxMakeWriter::new(Mutex::new(file));

    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[hour]:[minute]:[second],[subsecond digits:3]")
            .context("invalid log time format")?,
    );

    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(false)
        .with_target(false)
        .with_timer(timer)
        .with_writer(writer)
        .finish();

    set_global_default(subscriber)
        .context("could not set global default tracing subscriber, one is already installed")
}
