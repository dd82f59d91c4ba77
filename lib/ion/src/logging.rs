pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the root logger for a binary from a sloggers TOML snippet.
pub fn from_toml(config: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(config).expect("Error parsing logger config");
    config.build_logger().expect("Error building logger")
}

/// Builds the default terminal logger.
pub fn init() -> Logger {
    from_toml(DEFAULT_CONFIG)
}

/// Logger that swallows all records. Components constructed without a parent
/// logger fall back to this.
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}

/// Derives a component logger from an optional parent.
pub fn child<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        None => null(),
    }
}
