//! crypto/kdf.rs
//! Password-based derivation of key material.
//!
//! Design:
//! - PBKDF2-HMAC-SHA256(password, salt, iterations) fills the caller's
//!   buffer directly, so a derived key never sits in a temporary.
//! - Salts are 32 random bytes, one per derived pair (or one for the
//!   key-encryption key in wrap mode).

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::constants::SALT_LEN;
use crate::crypto::types::KeyError;

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Fill `out` with PBKDF2-HMAC-SHA256 output.
pub fn derive_into(password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) -> Result<(), KeyError> {
    if iterations == 0 {
        return Err(KeyError::ZeroIterations);
    }
    pbkdf2_hmac::<Sha256>(password, salt, iterations, out);
    Ok(())
}
