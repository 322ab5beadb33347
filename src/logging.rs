use std::io::IsTerminal;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Installs the stderr subscriber. `RUST_LOG` directives win; `LOG_LEVEL`
/// sets the floor (default info).
pub fn init_logging() {
    let level = std::env::var("LOG_LEVEL")
        .map(|level| parse_level(&level))
        .unwrap_or(Level::INFO);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

fn parse_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}
