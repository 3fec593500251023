//! console logging through log4rs

use anyhow::Result;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l})} {T} {t} - {m}{n}";

/// Install a console logger at `level`.  Only the first call in a process wins;
/// later calls return an error from log4rs which callers may ignore.
pub fn init_logging(level: LevelFilter) -> Result<()> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))?;

    log4rs::init_config(config)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_fails() {
        // another test may have installed the logger first
        let _ = init_logging(LevelFilter::Debug);
        assert!(init_logging(LevelFilter::Info).is_err());
        log::info!("logging initialized");
    }
}
