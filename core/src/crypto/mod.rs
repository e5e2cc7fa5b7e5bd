//! crypto/mod.rs
//! Key derivation, key wrapping, and AES-256 CBC/XTS streaming sessions.

pub mod types;
pub mod kdf;
pub mod keywrap;
pub mod keys;
pub mod cipher;
pub mod operation;

pub use types::*;
pub use keys::KeyContext;
pub use cipher::UnitCipher;
pub use operation::{CipherOperation, Direction, ReverseCipherOperation};
