use std::path::PathBuf;
use thiserror::Error;

/// Core error type for npmget setup and configuration.
///
/// Install failures use [`crate::pkg::PkgError`] instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
