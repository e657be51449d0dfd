// Configuration errors.
// Every variant is fatal at startup: the watch loop refuses to run with a bad rule set.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {}\nSuggestion: create livesync.toml in the project root or pass --config", path.display())]
    NotFound { path: PathBuf },

    #[error("Failed to read config file {}: {source}\nSuggestion: check file permissions", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {}: {source}\nSuggestion: fix the syntax error reported above", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Empty or whitespace-only entry in {field}\nSuggestion: remove the entry")]
    EmptyEntry { field: &'static str },

    #[error("{field} entry does not exist: {}\nSuggestion: fix the path or remove it from {field}", path.display())]
    MissingPath { field: &'static str, path: PathBuf },

    #[error("{field} entry is a directory, not a file: {}\nSuggestion: move it to watched_folders", path.display())]
    NotAFile { field: &'static str, path: PathBuf },

    #[error("Invalid glob pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("Invalid port {port} in {field}\nSuggestion: use a port between 1 and 65535")]
    InvalidPort { field: &'static str, port: i64 },

    #[error("Device '{id}' is configured more than once\nSuggestion: give every device a unique id")]
    DuplicateDevice { id: String },

    #[error("Device '{id}' has an invalid address '{address}'\nSuggestion: use host:port or a bare host")]
    InvalidAddress { id: String, address: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
