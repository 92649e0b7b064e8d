use std::io::{self, IsTerminal};
use std::str::FromStr;
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::FmtSubscriber;

pub const LOG_ENV: &str = "BSW_LOG";

pub fn parse_level(raw: &str) -> Option<Level> {
    Level::from_str(raw.trim()).ok()
}

/// `--verbose` wins, then `BSW_LOG`, then the configured level. Unparseable
/// values fall through to the next source.
pub fn resolve_level(verbose: bool, env_level: Option<&str>, configured: &str) -> Level {
    if verbose {
        return Level::DEBUG;
    }
    env_level
        .and_then(parse_level)
        .or_else(|| parse_level(configured))
        .unwrap_or(Level::WARN)
}

/// Installs the stderr subscriber. Stdout stays reserved for command output
/// so `--json` remains machine-readable.
pub fn init_logger(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(io::stderr().is_terminal())
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    // a second init (tests, embedding) keeps the first subscriber
    let _ = set_global_default(subscriber);
}
