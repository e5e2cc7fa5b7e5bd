use std::io;

use thiserror::Error;

use crate::{
    buffer::ContractViolation,
    compression::CompressionError,
    crypto::{CryptoError, KeyError},
    envelope::FormatError,
};

/// Unified error covering I/O, envelope, key, cipher, compression and
/// contract failures.
/// - `From<T>` impls let `?` cross every layer of the pipeline.
/// - The classifiers below let callers tell "corrupt" from "wrong
///   password" from "bug" without matching every variant.
#[derive(Debug, Error)]
pub enum XfrmError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl XfrmError {
    /// Bug in this layer or its caller. The session that raised it is
    /// poisoned.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            XfrmError::Contract(_)
                | XfrmError::Crypto(CryptoError::Contract(_))
                | XfrmError::Compression(CompressionError::Contract(_))
        )
    }

    /// Right format, unusable key material.
    pub fn is_key_error(&self) -> bool {
        matches!(self, XfrmError::Key(_) | XfrmError::Crypto(CryptoError::Key(_)))
    }

    pub fn is_format_error(&self) -> bool {
        matches!(self, XfrmError::Format(_))
    }
}

impl From<XfrmError> for io::Error {
    fn from(e: XfrmError) -> Self {
        match e {
            XfrmError::Io(inner) => inner,
            XfrmError::Config(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
