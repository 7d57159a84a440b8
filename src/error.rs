//! Error types for planq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("task {task} has an empty provenance chain")]
    EmptyProvenance { task: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
