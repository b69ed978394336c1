use std::str::FromStr;
use tracing::Level;

/// Unknown level names fall back to `info`.
pub fn parse_level(level: &str) -> Level {
    Level::from_str(level.trim()).unwrap_or(Level::INFO)
}

/// Installs the global fmt subscriber. Call once, before the server starts.
pub fn init_tracing(level: &str) {
    let level = parse_level(level);
    if tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::warn!("tracing subscriber already installed");
    }
}
