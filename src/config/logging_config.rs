use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `dicomnet=debug,dimse=trace`
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default = "default_log_file_path")]
    pub log_file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            log_to_file: false,
            log_file_path: default_log_file_path(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_log_file_path() -> String {
    "./tmp/dicomnet.log".to_string()
}
