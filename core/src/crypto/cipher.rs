//! crypto/cipher.rs
//! AES-256 block modes at single-block granularity.
//!
//! Both modes restart at every data-unit boundary:
//! - CBC: the chain value is reset to the unit's IV.
//! - XTS: the tweak is E(k2, IV xor unit index) and is multiplied by the
//!   primitive element of GF(2^128) after every block. Walking a unit
//!   backward divides it instead.
//!
//! Streams handed to these modes are always whole blocks, so XTS never
//! needs ciphertext stealing.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;

use crate::constants::{AES_BLOCK_SIZE, CBC_KEY_LEN, IV_LEN};
use crate::envelope::CipherKind;

pub type Block = [u8; AES_BLOCK_SIZE];

/// Reduction constant for x^128 + x^7 + x^2 + x + 1.
const GF_POLY: u8 = 0x87;

/// Multiply a little-endian tweak by x.
pub fn gf_double(t: &mut Block) {
    let mut carry = 0u8;
    for b in t.iter_mut() {
        let next = *b >> 7;
        *b = (*b << 1) | carry;
        carry = next;
    }
    if carry != 0 {
        t[0] ^= GF_POLY;
    }
}

/// Divide a little-endian tweak by x. Inverse of [`gf_double`].
pub fn gf_halve(t: &mut Block) {
    let low = t[0] & 1;
    if low != 0 {
        t[0] ^= GF_POLY;
    }
    let mut carry = low;
    for b in t.iter_mut().rev() {
        let next = *b & 1;
        *b = (*b >> 1) | (carry << 7);
        carry = next;
    }
}

#[inline]
fn xor_into(dst: &mut Block, src: &Block) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

/// Keyed AES instance(s) for one (key, IV) selection.
pub enum UnitCipher {
    Cbc { aes: Aes256 },
    Xts { data: Aes256, tweak: Aes256 },
}

impl UnitCipher {
    pub fn new(cipher: CipherKind, key: &[u8]) -> Option<Self> {
        match cipher {
            CipherKind::Cbc if key.len() == CBC_KEY_LEN => {
                Some(UnitCipher::Cbc { aes: Aes256::new(GenericArray::from_slice(key)) })
            }
            CipherKind::Xts if key.len() == 2 * CBC_KEY_LEN => Some(UnitCipher::Xts {
                data: Aes256::new(GenericArray::from_slice(&key[..CBC_KEY_LEN])),
                tweak: Aes256::new(GenericArray::from_slice(&key[CBC_KEY_LEN..])),
            }),
            _ => None,
        }
    }

    /// Chain value (CBC) or first tweak (XTS) for a unit.
    pub fn unit_start_state(&self, iv: &[u8; IV_LEN], unit: u64) -> Block {
        match self {
            UnitCipher::Cbc { .. } => *iv,
            UnitCipher::Xts { tweak, .. } => {
                let mut t = *iv;
                let idx = u128::from(unit).to_le_bytes();
                xor_into(&mut t, &idx);
                tweak.encrypt_block(GenericArray::from_mut_slice(&mut t));
                t
            }
        }
    }

    pub fn encrypt(&self, state: &mut Block, block: &mut Block) {
        match self {
            UnitCipher::Cbc { aes } => {
                xor_into(block, state);
                aes.encrypt_block(GenericArray::from_mut_slice(block));
                *state = *block;
            }
            UnitCipher::Xts { data, .. } => {
                xor_into(block, state);
                data.encrypt_block(GenericArray::from_mut_slice(block));
                xor_into(block, state);
                gf_double(state);
            }
        }
    }

    pub fn decrypt(&self, state: &mut Block, block: &mut Block) {
        match self {
            UnitCipher::Cbc { aes } => {
                let c = *block;
                aes.decrypt_block(GenericArray::from_mut_slice(block));
                xor_into(block, state);
                *state = c;
            }
            UnitCipher::Xts { data, .. } => {
                xor_into(block, state);
                data.decrypt_block(GenericArray::from_mut_slice(block));
                xor_into(block, state);
                gf_double(state);
            }
        }
    }

    /// Decrypt a CBC block given its predecessor explicitly (reverse walks).
    pub fn cbc_decrypt_with(&self, prev: &Block, block: &mut Block) {
        if let UnitCipher::Cbc { aes } = self {
            aes.decrypt_block(GenericArray::from_mut_slice(block));
            xor_into(block, prev);
        }
    }

    /// Decrypt an XTS block under an explicit tweak, leaving it unchanged.
    pub fn xts_decrypt_with(&self, tweak: &Block, block: &mut Block) {
        if let UnitCipher::Xts { data, .. } = self {
            xor_into(block, tweak);
            data.decrypt_block(GenericArray::from_mut_slice(block));
            xor_into(block, tweak);
        }
    }
}
