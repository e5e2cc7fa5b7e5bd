//! crypto/keywrap.rs
//! AES key wrap (RFC 3394) of the raw key pairs under a password-derived
//! key-encryption key.
//!
//! Unwrap carries an integrity check, which is what lets `open` tell a
//! wrong password apart from a damaged file.

use aes::cipher::generic_array::GenericArray;
use aes_kw::KekAes256;
use zeroize::Zeroizing;

use crate::constants::{CBC_KEY_LEN, KEY_WRAP_OVERHEAD};
use crate::crypto::kdf::derive_into;
use crate::crypto::types::KeyError;

fn kek(password: &[u8], salt: &[u8], iterations: u32) -> Result<KekAes256, KeyError> {
    let mut k = Zeroizing::new([0u8; CBC_KEY_LEN]);
    derive_into(password, salt, iterations, &mut k[..])?;
    Ok(KekAes256::new(GenericArray::from_slice(&k[..])))
}

/// Wrap `plain` (a multiple of 8 bytes, at least 16) into `out`, which must
/// be exactly 8 bytes longer.
pub fn wrap(password: &[u8], salt: &[u8], iterations: u32, plain: &[u8], out: &mut [u8]) -> Result<(), KeyError> {
    if out.len() != plain.len() + KEY_WRAP_OVERHEAD {
        return Err(KeyError::BadKeyMaterial { expected: plain.len() + KEY_WRAP_OVERHEAD, actual: out.len() });
    }
    kek(password, salt, iterations)?
        .wrap(plain, out)
        .map_err(|e| KeyError::WrapFailed(e.to_string()))
}

/// Reverse of [`wrap`]. Any integrity failure is reported as
/// [`KeyError::UnwrapFailed`].
pub fn unwrap(password: &[u8], salt: &[u8], iterations: u32, blob: &[u8], out: &mut [u8]) -> Result<(), KeyError> {
    if blob.len() < KEY_WRAP_OVERHEAD || out.len() != blob.len() - KEY_WRAP_OVERHEAD {
        return Err(KeyError::BadKeyMaterial {
            expected: out.len() + KEY_WRAP_OVERHEAD,
            actual: blob.len(),
        });
    }
    kek(password, salt, iterations)?
        .unwrap(blob, out)
        .map_err(|_| KeyError::UnwrapFailed)
}
