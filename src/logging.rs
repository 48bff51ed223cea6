//! tracing-subscriber setup for the binary

use std::fs::File;
use std::path::Path;

use thiserror::Error;
use tracing_subscriber::{self, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Cannot open log file {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to initialize logging: {0}")]
    Init(String),
}

/// Filter from `RUST_LOG` when set, else the configured level
fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: stdout always, plus a file when configured
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    if config.log_to_file {
        if let Some(parent) = Path::new(&config.log_file_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| LoggingError::File {
                    path: config.log_file_path.clone(),
                    source,
                })?;
            }
        }
        let file = File::create(&config.log_file_path).map_err(|source| LoggingError::File {
            path: config.log_file_path.clone(),
            source,
        })?;
        let file_layer = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_writer(file);

        tracing_subscriber::registry()
            .with(env_filter(config))
            .with(file_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string()))
    } else {
        tracing_subscriber::registry()
            .with(env_filter(config))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritable_log_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened as the log file
        let config = LoggingConfig {
            level: "debug".into(),
            log_to_file: true,
            log_file_path: dir.path().to_string_lossy().into_owned(),
        };
        assert!(matches!(
            init_logging(&config),
            Err(LoggingError::File { .. })
        ));
    }

    #[test]
    fn test_both_subscriber_shapes_install() {
        // only one global subscriber per process; a second install reports Init
        let stdout_only = init_logging(&LoggingConfig::default());
        assert!(matches!(stdout_only, Ok(()) | Err(LoggingError::Init(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("dicomnet.log");
        let with_file = init_logging(&LoggingConfig {
            level: "debug".into(),
            log_to_file: true,
            log_file_path: path.to_string_lossy().into_owned(),
        });
        assert!(matches!(with_file, Ok(()) | Err(LoggingError::Init(_))));
        assert!(path.exists());
    }

    #[test]
    fn test_bad_level_falls_back() {
        let config = LoggingConfig {
            level: "[[not a filter".into(),
            ..LoggingConfig::default()
        };
        // must not panic
        let _ = env_filter(&config);
    }
}
