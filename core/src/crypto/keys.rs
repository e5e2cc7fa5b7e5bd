//! crypto/keys.rs
//! Key context: the ordered (key, IV) pairs of one file plus the cipher
//! configuration they are used with.
//!
//! Selection strategies map a data-unit index `u` over `N` pairs:
//! - `Same`: pair 0 for every unit.
//! - `Pair`: key and IV from pair `u mod N`.
//! - `MixedPair`: IV from pair `u mod N`, key from pair `(u / N) mod N`, so
//!   the IV moves every unit and the key every `N` units.
//!
//! Pair material is zeroized when the context is cleared or dropped.

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::constants::{AES_BLOCK_SIZE, IV_LEN, KEY_WRAP_OVERHEAD, MAX_KEY_LEN, MAX_KEY_PAIRS, SALT_LEN};
use crate::crypto::kdf::{self, derive_into};
use crate::crypto::keywrap;
use crate::crypto::types::{CryptoError, KeyError};
use crate::envelope::header::key_len;
use crate::envelope::{CipherKind, KeySelection};

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct KeyPair {
    key: [u8; MAX_KEY_LEN],
    iv: [u8; IV_LEN],
}

impl KeyPair {
    fn empty() -> Self {
        Self { key: [0u8; MAX_KEY_LEN], iv: [0u8; IV_LEN] }
    }
}

/// Everything a cipher operation needs to pick keys for a position.
pub struct KeyContext {
    cipher: CipherKind,
    selection: KeySelection,
    padding: bool,
    data_unit_size: u32,
    pairs: Vec<KeyPair>,
}

impl std::fmt::Debug for KeyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyContext")
            .field("cipher", &self.cipher)
            .field("selection", &self.selection)
            .field("padding", &self.padding)
            .field("data_unit_size", &self.data_unit_size)
            .field("pairs", &self.pairs.len())
            .finish()
    }
}

impl KeyContext {
    pub fn new(
        cipher: CipherKind,
        selection: KeySelection,
        padding: bool,
        data_unit_size: u32,
    ) -> Result<Self, CryptoError> {
        if cipher == CipherKind::None {
            return Err(KeyError::NoCipher.into());
        }
        if data_unit_size as usize % AES_BLOCK_SIZE != 0 || (cipher == CipherKind::Xts && data_unit_size == 0) {
            return Err(CryptoError::InvalidUnitSize { size: data_unit_size });
        }
        Ok(Self { cipher, selection, padding, data_unit_size, pairs: Vec::new() })
    }

    #[inline]
    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    #[inline]
    pub fn selection(&self) -> KeySelection {
        self.selection
    }

    #[inline]
    pub fn padding(&self) -> bool {
        self.padding
    }

    /// Bytes covered by one (key, IV) choice; 0 means the whole stream.
    #[inline]
    pub fn data_unit_size(&self) -> u32 {
        self.data_unit_size
    }

    #[inline]
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    #[inline]
    pub fn key_len(&self) -> usize {
        key_len(self.cipher)
    }

    pub fn generate_salt() -> [u8; SALT_LEN] {
        kdf::generate_salt()
    }

    fn reserve_pair(&mut self) -> Result<&mut KeyPair, KeyError> {
        if self.pairs.len() >= MAX_KEY_PAIRS {
            return Err(KeyError::TooManyPairs { requested: self.pairs.len() + 1, max: MAX_KEY_PAIRS });
        }
        self.pairs.push(KeyPair::empty());
        let last = self.pairs.len() - 1;
        Ok(&mut self.pairs[last])
    }

    /// Append one pair derived from `password` and `salt`.
    pub fn derive_key_iv(&mut self, password: &[u8], iterations: u32, salt: &[u8]) -> Result<(), KeyError> {
        let klen = self.key_len();
        let mut material = Zeroizing::new([0u8; MAX_KEY_LEN + IV_LEN]);
        derive_into(password, salt, iterations, &mut material[..klen + IV_LEN])?;
        let pair = self.reserve_pair()?;
        pair.key[..klen].copy_from_slice(&material[..klen]);
        pair.iv.copy_from_slice(&material[klen..klen + IV_LEN]);
        Ok(())
    }

    /// Append one random pair (key-wrap mode).
    pub fn generate_random_key_iv(&mut self) -> Result<(), KeyError> {
        use rand::RngCore;
        let klen = self.key_len();
        let pair = self.reserve_pair()?;
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut pair.key[..klen]);
        rng.fill_bytes(&mut pair.iv);
        Ok(())
    }

    /// Serialized size of all pairs as wrapped (key ‖ IV) records.
    fn packed_len(&self, count: usize) -> usize {
        count * (self.key_len() + IV_LEN)
    }

    /// Wrap every pair under a key derived from `password` and `salt`.
    pub fn wrap_keys(&self, password: &[u8], iterations: u32, salt: &[u8]) -> Result<Vec<u8>, KeyError> {
        if self.pairs.is_empty() {
            return Err(KeyError::NoPairs);
        }
        let klen = self.key_len();
        let mut plain = Zeroizing::new(Vec::with_capacity(self.packed_len(self.pairs.len())));
        for pair in &self.pairs {
            plain.extend_from_slice(&pair.key[..klen]);
            plain.extend_from_slice(&pair.iv);
        }
        let mut blob = vec![0u8; plain.len() + KEY_WRAP_OVERHEAD];
        keywrap::wrap(password, salt, iterations, &plain, &mut blob)?;
        Ok(blob)
    }

    /// Replace the pairs with `count` pairs recovered from `blob`.
    pub fn unwrap_keys(
        &mut self,
        blob: &[u8],
        count: usize,
        password: &[u8],
        iterations: u32,
        salt: &[u8],
    ) -> Result<(), KeyError> {
        if count == 0 {
            return Err(KeyError::NoPairs);
        }
        if count > MAX_KEY_PAIRS {
            return Err(KeyError::TooManyPairs { requested: count, max: MAX_KEY_PAIRS });
        }
        let expected = self.packed_len(count) + KEY_WRAP_OVERHEAD;
        if blob.len() != expected {
            return Err(KeyError::BadKeyMaterial { expected, actual: blob.len() });
        }
        let mut plain = Zeroizing::new(vec![0u8; self.packed_len(count)]);
        keywrap::unwrap(password, salt, iterations, blob, &mut plain)?;

        self.clear();
        let klen = self.key_len();
        for rec in plain.chunks_exact(klen + IV_LEN) {
            let pair = self.reserve_pair()?;
            pair.key[..klen].copy_from_slice(&rec[..klen]);
            pair.iv.copy_from_slice(&rec[klen..]);
        }
        Ok(())
    }

    /// Zeroize and drop all pairs.
    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    /// Data-unit index for a logical payload position.
    #[inline]
    pub fn unit_index(&self, position: u64) -> u64 {
        if self.data_unit_size == 0 {
            0
        } else {
            position / u64::from(self.data_unit_size)
        }
    }

    /// First byte of the unit containing `position`.
    #[inline]
    pub fn unit_start(&self, position: u64) -> u64 {
        if self.data_unit_size == 0 {
            0
        } else {
            position - position % u64::from(self.data_unit_size)
        }
    }

    /// (key index, IV index) for a data unit. Mixed pairs cycle through
    /// all N*N combinations, then repeat.
    pub fn select_indices(&self, unit: u64) -> Result<(usize, usize), KeyError> {
        let n = self.pairs.len() as u64;
        if n == 0 {
            return Err(KeyError::NoPairs);
        }
        let (k, i) = match self.selection {
            KeySelection::Same => (0, 0),
            KeySelection::Pair => (unit % n, unit % n),
            KeySelection::MixedPair => ((unit / n) % n, unit % n),
        };
        Ok((k as usize, i as usize))
    }

    pub(crate) fn key_at(&self, index: usize) -> &[u8] {
        &self.pairs[index].key[..self.key_len()]
    }

    pub(crate) fn iv_at(&self, index: usize) -> &[u8; IV_LEN] {
        &self.pairs[index].iv
    }

    /// Key and IV for the data unit containing `position`.
    pub fn select_key_iv(&self, position: u64) -> Result<(&[u8], &[u8; IV_LEN]), KeyError> {
        let (k, i) = self.select_indices(self.unit_index(position))?;
        Ok((self.key_at(k), self.iv_at(i)))
    }
}
