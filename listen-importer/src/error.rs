use std::io;

use listen_common::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Enumeration of errors that abort an import run.
/// Bad lines and failed batches are counted and logged, they never end up here.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to read input: {0}")]
    Input(#[from] io::Error),
    #[error("failed to open the listen store: {0}")]
    Store(#[from] StoreError),
    #[error("no writer is left to consume batches")]
    NoWriters,
    #[error("a writer task panicked: {0}")]
    WorkerPanicked(String),
}
