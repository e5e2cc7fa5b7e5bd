//! compression/types.rs
//! Error type for the compression stage and its scratch arena.

use thiserror::Error;

use crate::buffer::ContractViolation;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("deflate codec failure: {0}")]
    Codec(String),

    #[error("scratch arena exhausted: requested {requested} bytes, {available} available")]
    ArenaExhausted { requested: usize, available: usize },

    #[error("scratch arena of {size} bytes is below the {min}-byte minimum")]
    ArenaTooSmall { size: usize, min: usize },

    #[error("scratch arena free out of order: block ends at {block_end}, top is {top}")]
    ArenaOrder { block_end: usize, top: usize },

    #[error("scratch arena still holds {in_use} bytes at end of session")]
    ArenaNotDrained { in_use: usize },

    #[error("no scratch memory bound to the compression stage")]
    NoArena,

    #[error("invalid compression padding")]
    BadPadding,

    #[error("{extra} bytes of trailing data after the compressed stream")]
    TrailingData { extra: usize },

    #[error("compressed stream ended before its final block")]
    Truncated,

    #[error("compression stage already active")]
    AlreadyActive,

    #[error("compression stage not active")]
    NotActive,

    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

impl From<flate2::CompressError> for CompressionError {
    fn from(e: flate2::CompressError) -> Self {
        CompressionError::Codec(e.to_string())
    }
}

impl From<flate2::DecompressError> for CompressionError {
    fn from(e: flate2::DecompressError) -> Self {
        CompressionError::Codec(e.to_string())
    }
}
