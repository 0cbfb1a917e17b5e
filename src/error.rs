//! Crate-wide error taxonomy (spec §7).
//!
//! `InvalidPosition`, `MissingItem` and `SchemaMismatch` are the only
//! variants that ever propagate out of [`crate::repository::Repository`] as
//! an `Err`. `Storage` and `Transport` are constructed at the boundaries
//! that spec §7 calls "swallowed" and are logged rather than returned.

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("invalid position: {0}")]
    InvalidPosition(String),

    #[error("missing item: {0}")]
    MissingItem(String),

    #[error("schema mismatch: expected {expected}, got {actual}")]
    SchemaMismatch { expected: String, actual: String },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("dataset generation mismatch: server is now at {0}")]
    DatasetGenerationMismatch(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Self::Storage(msg.to_string())
    }

    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Transport(_))
    }
}
