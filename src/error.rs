//! Error type shared by the admission filter and the gateway around it.
//!
//! Request evaluation itself never fails: every request is either admitted
//! or rejected with a reason. Errors only surface while building a filter,
//! loading its options, or talking to the upstream.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Options could not be turned into a filter configuration
    #[error("Config error: {0}")]
    Config(String),

    /// The filter needs a tokio runtime for its eviction sweep
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Forwarding to the upstream failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Upstream(msg.into())
    }
}
