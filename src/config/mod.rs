pub mod config;
pub mod logging_config;

pub use config::{Config, ConfigError};
pub use logging_config::LoggingConfig;
