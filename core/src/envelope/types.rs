//! envelope/types.rs
//! Registries for the extensible header flag sub-fields, the detection
//! result shared by both envelope codecs, and the format error type.
//!
//! Notes:
//! - Every flag sub-field is a 4-bit slot in a 64-bit word. Values are
//!   explicit so that a reader rejects anything it does not know instead of
//!   silently misinterpreting a newer file.
//! - Bits 40..64 are reserved and must be zero.

use num_enum::TryFromPrimitive;
use thiserror::Error;

/// Result of probing the first bytes of a file for an envelope magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detect {
    No,
    Yes,
    NeedMoreBytes,
}

/// On-disk format of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeFormat {
    Unknown,
    Raw,
    Legacy,
    Extensible,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum ChecksumKind {
    None = 0,
    Crc32 = 1,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum CompressionMethod {
    None = 0,
    Deflate = 1,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum PaddingKind {
    None = 0,
    Pkcs = 1,
}

/// Block cipher modes. Both run AES-256.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive, serde::Serialize, serde::Deserialize)]
pub enum CipherKind {
    None = 0,
    /// Cipher block chaining, 32-byte key, 16-byte IV.
    Cbc = 1,
    /// Tweakable block mode, 64-byte key, 16-byte tweak.
    Xts = 2,
}

/// How key material is reconstructed from the password when opening.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive, serde::Serialize, serde::Deserialize)]
pub enum KeyMethod {
    None = 0,
    /// Each (key, IV) pair is derived from the password and its own salt.
    Pbkdf2Sha256 = 1,
    /// Random pairs wrapped by a password-derived key-encryption key.
    AesKeyWrap256 = 2,
}

/// Rule mapping a data-unit index to a (key, IV) pair.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive, serde::Serialize, serde::Deserialize)]
pub enum KeySelection {
    Same = 0,
    Pair = 1,
    MixedPair = 2,
}

bitflags::bitflags! {
    /// Single-bit presence markers inside the flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Presence: u64 {
        /// `data_checksum` in the header is meaningful.
        const DATA_CHECKSUM_IN_HEADER = 1 << 12;
        /// `data_size` in the header is meaningful.
        const DATA_SIZE_IN_HEADER = 1 << 13;
    }
}

const SHIFT_FILE_CHECKSUM: u32 = 0;
const SHIFT_DATA_CHECKSUM: u32 = 8;
const SHIFT_COMPRESSION: u32 = 16;
const SHIFT_COMPRESSION_PADDING: u32 = 20;
const SHIFT_CIPHER: u32 = 24;
const SHIFT_KEY_METHOD: u32 = 28;
const SHIFT_CIPHER_PADDING: u32 = 32;
const SHIFT_KEY_SELECTION: u32 = 36;

const SUBFIELD_MASK: u64 = 0xF;
const KNOWN_MASK: u64 = (SUBFIELD_MASK << SHIFT_FILE_CHECKSUM)
    | (SUBFIELD_MASK << SHIFT_DATA_CHECKSUM)
    | (SUBFIELD_MASK << SHIFT_COMPRESSION)
    | (SUBFIELD_MASK << SHIFT_COMPRESSION_PADDING)
    | (SUBFIELD_MASK << SHIFT_CIPHER)
    | (SUBFIELD_MASK << SHIFT_KEY_METHOD)
    | (SUBFIELD_MASK << SHIFT_CIPHER_PADDING)
    | (SUBFIELD_MASK << SHIFT_KEY_SELECTION)
    | Presence::all().bits();

/// Decoded view of the 64-bit flags word shared by header and trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XfrmFlags {
    pub file_checksum: ChecksumKind,
    pub data_checksum: ChecksumKind,
    pub presence: Presence,
    pub compression: CompressionMethod,
    pub compression_padding: PaddingKind,
    pub cipher: CipherKind,
    pub key_method: KeyMethod,
    pub cipher_padding: PaddingKind,
    pub key_selection: KeySelection,
}

fn subfield<T>(raw: u64, shift: u32, field: &'static str) -> Result<T, FormatError>
where
    T: TryFromPrimitive<Primitive = u8>,
{
    let value = ((raw >> shift) & SUBFIELD_MASK) as u8;
    T::try_from_primitive(value).map_err(|_| FormatError::UnknownValue { field, raw: value })
}

impl Default for XfrmFlags {
    fn default() -> Self {
        Self {
            file_checksum: ChecksumKind::None,
            data_checksum: ChecksumKind::None,
            presence: Presence::empty(),
            compression: CompressionMethod::None,
            compression_padding: PaddingKind::None,
            cipher: CipherKind::None,
            key_method: KeyMethod::None,
            cipher_padding: PaddingKind::None,
            key_selection: KeySelection::Same,
        }
    }
}

impl XfrmFlags {
    pub fn to_raw(&self) -> u64 {
        ((self.file_checksum as u64) << SHIFT_FILE_CHECKSUM)
            | ((self.data_checksum as u64) << SHIFT_DATA_CHECKSUM)
            | self.presence.bits()
            | ((self.compression as u64) << SHIFT_COMPRESSION)
            | ((self.compression_padding as u64) << SHIFT_COMPRESSION_PADDING)
            | ((self.cipher as u64) << SHIFT_CIPHER)
            | ((self.key_method as u64) << SHIFT_KEY_METHOD)
            | ((self.cipher_padding as u64) << SHIFT_CIPHER_PADDING)
            | ((self.key_selection as u64) << SHIFT_KEY_SELECTION)
    }

    pub fn from_raw(raw: u64) -> Result<Self, FormatError> {
        if raw & !KNOWN_MASK != 0 {
            return Err(FormatError::UnknownFlags { raw: raw & !KNOWN_MASK });
        }
        Ok(Self {
            file_checksum: subfield(raw, SHIFT_FILE_CHECKSUM, "file_checksum")?,
            data_checksum: subfield(raw, SHIFT_DATA_CHECKSUM, "data_checksum")?,
            presence: Presence::from_bits_truncate(raw),
            compression: subfield(raw, SHIFT_COMPRESSION, "compression")?,
            compression_padding: subfield(raw, SHIFT_COMPRESSION_PADDING, "compression_padding")?,
            cipher: subfield(raw, SHIFT_CIPHER, "cipher")?,
            key_method: subfield(raw, SHIFT_KEY_METHOD, "key_method")?,
            cipher_padding: subfield(raw, SHIFT_CIPHER_PADDING, "cipher_padding")?,
            key_selection: subfield(raw, SHIFT_KEY_SELECTION, "key_selection")?,
        })
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compression != CompressionMethod::None
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.cipher != CipherKind::None
    }
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad {what} magic: {found}")]
    BadMagic { what: &'static str, found: String },

    #[error("unrecognised endianness marker 0x{found:016x}")]
    BadEndianMarker { found: u64 },

    #[error("{what} truncated: need {need} bytes, have {have}")]
    Truncated { what: &'static str, need: usize, have: usize },

    #[error("no room to write {what}: need {need} bytes, have {have}")]
    NoSpace { what: &'static str, need: usize, have: usize },

    #[error("{what} {value} out of bounds (max {max})")]
    SizeOutOfBounds { what: &'static str, value: u64, max: u64 },

    #[error("{what} {value} is not a multiple of {align}")]
    Misaligned { what: &'static str, value: u64, align: u64 },

    #[error("{what} must be zero, non-zero byte at offset {offset}")]
    NonZero { what: &'static str, offset: usize },

    #[error("unknown flag bits 0x{raw:016x}")]
    UnknownFlags { raw: u64 },

    #[error("unknown {field} value {raw}")]
    UnknownValue { field: &'static str, raw: u8 },

    #[error("unknown {field} stamp {value}")]
    UnknownStamp { field: &'static str, value: u32 },

    #[error("inconsistent envelope: {0}")]
    Inconsistent(String),

    #[error("{what} checksum mismatch: expected 0x{expected:08x}, computed 0x{actual:08x}")]
    ChecksumMismatch { what: &'static str, expected: u32, actual: u32 },

    #[error("data size mismatch: declared {declared}, processed {actual}")]
    DataSizeMismatch { declared: u64, actual: u64 },

    #[error("legacy header differs from the fixed blob at offset {offset}")]
    LegacyHeaderMismatch { offset: usize },

    #[error("envelope header present but no valid trailer found")]
    MissingTrailer,

    #[error("{0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_bits_rejected() {
        let err = XfrmFlags::from_raw(1 << 50).unwrap_err();
        assert!(matches!(err, FormatError::UnknownFlags { .. }));
    }

    #[test]
    fn unknown_subfield_value_rejected() {
        let err = XfrmFlags::from_raw(7 << SHIFT_CIPHER).unwrap_err();
        assert!(matches!(err, FormatError::UnknownValue { field: "cipher", raw: 7 }));
    }
}
