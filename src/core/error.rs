//! Core capability errors (identity parsing and validation).
//!
//! These are bounded and stable: core errors represent refusal states on input,
//! not library implementation details.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// Invalid identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("node id `{raw}` is invalid: {reason}")]
    Node { raw: String, reason: String },
    #[error("client owner `{raw}` is invalid: {reason}")]
    ClientOwner { raw: String, reason: String },
    #[error("file handle `{raw}` is invalid: {reason}")]
    FileHandle { raw: String, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
