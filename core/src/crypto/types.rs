//! crypto/types.rs
//! Key-material and cipher-stage errors.
//!
//! `KeyError` is kept apart from `CryptoError` so callers can tell "right
//! format, wrong password" from a corrupt payload.

use thiserror::Error;

use crate::buffer::ContractViolation;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("file is encrypted but no password was given")]
    MissingPassword,

    #[error("key unwrap failed: wrong password or damaged key material")]
    UnwrapFailed,

    #[error("key wrap failed: {0}")]
    WrapFailed(String),

    #[error("requested {requested} key pairs, at most {max} allowed")]
    TooManyPairs { requested: usize, max: usize },

    #[error("encryption needs at least one key pair")]
    NoPairs,

    #[error("key material is {actual} bytes, expected {expected}")]
    BadKeyMaterial { expected: usize, actual: usize },

    #[error("KDF iteration count must be non-zero")]
    ZeroIterations,

    #[error("no cipher selected")]
    NoCipher,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext length {len} is not a multiple of the cipher block")]
    Unaligned { len: u64 },

    #[error("invalid cipher padding")]
    BadPadding,

    #[error("data unit size {size} is not a multiple of the cipher block")]
    InvalidUnitSize { size: u32 },

    #[error("operation does not support {0}")]
    WrongDirection(&'static str),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Contract(#[from] ContractViolation),
}
