//! Crate-level errors for startup and wiring.
//!
//! Runtime errors live with their layer (`DeviceError`, `PoolError`,
//! `SessionError`); this type covers what can stop the miner from starting.

use std::path::PathBuf;

use thiserror::Error;

use crate::pool::PoolError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("cannot open share log {}: {source}", path.display())]
    ShareLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
