//! envelope/header.rs
//! Extensible envelope header.
//!
//! Layout (offsets in bytes; integers in the writer's byte order):
//! ```text
//!   0  magic "NDBXFRM1"          8
//!   8  endianness marker         u64
//!  16  header_size               u32   fixed + octets + zero pad
//!  20  fixed_header_size         u32
//!  24  flags                     u64
//!  32  dbg_writer_version        u32
//!  36  octets_size               u32
//!  40  file_block_size           u32
//!  44  trailer_max_size          u32
//!  48  data_checksum             u32   valid with DATA_CHECKSUM_IN_HEADER
//!  52  reserved                  u32
//!  56  data_size                 u64   valid with DATA_SIZE_IN_HEADER
//!  64  compress header stamp     u32
//!  68  compress library stamp    u32
//!  72  encrypt header stamp      u32
//!  76  encrypt library stamp     u32
//!  80  kdf_iter_count            u32
//!  84  data_unit_size            u32
//!  88  key_material_size         u32
//!  92  key_material_count        u32
//!  96  key_material_position     u32   offset inside the octets
//! 100  reserved                  u32
//! 104  extra octets, then zeros up to header_size
//! ```
//!
//! Compatibility:
//! - A header written by an older writer with a smaller fixed part is
//!   zero-extended on read.
//! - A header from a newer writer with a larger fixed part is accepted only
//!   when every byte this reader does not understand is zero.

use crate::buffer::{InputCursor, OutputCursor};
use crate::constants::{
    AES_BLOCK_SIZE, CBC_KEY_LEN, ENDIAN_MARKER, HEADER_STAMP, IV_LEN, KEY_WRAP_OVERHEAD, KNOWN_HEADER_STAMPS,
    KNOWN_LIBRARY_STAMPS, LIBRARY_STAMP, MAX_FILE_BLOCK_SIZE, MAX_HEADER_OCTETS, MAX_KEY_PAIRS, SALT_LEN,
    WRITER_VERSION, XFRM_HEADER_MAGIC, XTS_KEY_LEN,
};
use crate::envelope::codec::{require_zero, Endian, FieldReader, FieldWriter};
use crate::envelope::trailer::FIXED_TRAILER_SIZE;
use crate::envelope::types::{CipherKind, Detect, FormatError, KeyMethod, PaddingKind, Presence, XfrmFlags};
use crate::utils::{fmt_bytes, round_up};

/// Size of the fixed part this implementation reads and writes.
pub const FIXED_HEADER_SIZE: usize = 104;

/// Smallest fixed part any writer may declare: magic, marker, both sizes.
const MIN_FIXED_HEADER_SIZE: usize = 24;

pub fn detect(bytes: &[u8]) -> Detect {
    let n = bytes.len().min(XFRM_HEADER_MAGIC.len());
    if bytes[..n] != XFRM_HEADER_MAGIC[..n] {
        Detect::No
    } else if n < XFRM_HEADER_MAGIC.len() {
        Detect::NeedMoreBytes
    } else {
        Detect::Yes
    }
}

/// Total header size for a given number of extra octets.
pub fn header_size_for(octets: usize, file_block_size: u32) -> usize {
    let size = round_up(FIXED_HEADER_SIZE + octets, 8);
    if file_block_size > 0 {
        round_up(size, file_block_size as usize)
    } else {
        size
    }
}

/// Largest fixed trailer plus zero pad a file with this block size can end in.
pub fn trailer_max_size_for(file_block_size: u32) -> u32 {
    let pad = (file_block_size as usize).saturating_sub(1);
    round_up(FIXED_TRAILER_SIZE + pad, 8) as u32
}

/// Key-material byte length for `count` pairs under the given method.
pub fn key_material_size_for(cipher: CipherKind, method: KeyMethod, count: usize) -> usize {
    match method {
        KeyMethod::None => 0,
        KeyMethod::Pbkdf2Sha256 => count * SALT_LEN,
        KeyMethod::AesKeyWrap256 => SALT_LEN + count * (key_len(cipher) + IV_LEN) + KEY_WRAP_OVERHEAD,
    }
}

/// Key length in bytes for a cipher, 0 for none.
pub fn key_len(cipher: CipherKind) -> usize {
    match cipher {
        CipherKind::None => 0,
        CipherKind::Cbc => CBC_KEY_LEN,
        CipherKind::Xts => XTS_KEY_LEN,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XfrmHeader {
    /// Byte order the header was (or will be) written in.
    pub order: Endian,
    pub header_size: u32,
    pub fixed_header_size: u32,
    pub flags: XfrmFlags,
    pub dbg_writer_version: u32,
    pub file_block_size: u32,
    pub trailer_max_size: u32,
    pub data_checksum: u32,
    pub data_size: u64,
    pub compress_dbg_header_stamp: u32,
    pub compress_dbg_library_stamp: u32,
    pub encrypt_dbg_header_stamp: u32,
    pub encrypt_dbg_library_stamp: u32,
    pub kdf_iter_count: u32,
    pub data_unit_size: u32,
    pub key_material_size: u32,
    pub key_material_count: u32,
    pub key_material_position: u32,
    /// Variable region: salts or a salt plus a wrapped key blob.
    pub octets: Vec<u8>,
}

impl XfrmHeader {
    /// Empty header for a new file. Sizes are fixed up by [`Self::set_octets`].
    pub fn new(order: Endian, flags: XfrmFlags, file_block_size: u32) -> Self {
        let mut h = Self {
            order,
            header_size: 0,
            fixed_header_size: FIXED_HEADER_SIZE as u32,
            flags,
            dbg_writer_version: WRITER_VERSION,
            file_block_size,
            trailer_max_size: trailer_max_size_for(file_block_size),
            data_checksum: 0,
            data_size: 0,
            compress_dbg_header_stamp: 0,
            compress_dbg_library_stamp: 0,
            encrypt_dbg_header_stamp: 0,
            encrypt_dbg_library_stamp: 0,
            kdf_iter_count: 0,
            data_unit_size: 0,
            key_material_size: 0,
            key_material_count: 0,
            key_material_position: 0,
            octets: Vec::new(),
        };
        if flags.is_compressed() {
            h.compress_dbg_header_stamp = HEADER_STAMP;
            h.compress_dbg_library_stamp = LIBRARY_STAMP;
        }
        if flags.is_encrypted() {
            h.encrypt_dbg_header_stamp = HEADER_STAMP;
            h.encrypt_dbg_library_stamp = LIBRARY_STAMP;
        }
        h.header_size = header_size_for(0, file_block_size) as u32;
        h
    }

    /// Install the extra octets and recompute the declared sizes.
    pub fn set_octets(&mut self, octets: Vec<u8>) -> Result<(), FormatError> {
        if octets.len() > MAX_HEADER_OCTETS {
            return Err(FormatError::SizeOutOfBounds {
                what: "extra octets",
                value: octets.len() as u64,
                max: MAX_HEADER_OCTETS as u64,
            });
        }
        self.header_size = header_size_for(octets.len(), self.file_block_size) as u32;
        self.octets = octets;
        Ok(())
    }

    /// Record a data size known before the first byte is written.
    pub fn declare_data_size(&mut self, size: u64) {
        self.flags.presence.insert(Presence::DATA_SIZE_IN_HEADER);
        self.data_size = size;
    }

    pub fn declared_data_size(&self) -> Option<u64> {
        self.flags.presence.contains(Presence::DATA_SIZE_IN_HEADER).then_some(self.data_size)
    }

    #[inline]
    pub fn octets_size(&self) -> usize {
        self.octets.len()
    }

    /// Bytes of the key-material region inside the octets.
    pub fn key_material(&self) -> &[u8] {
        let start = self.key_material_position as usize;
        let end = start + self.key_material_size as usize;
        self.octets.get(start..end).unwrap_or(&[])
    }

    /// Decode a header from the front of `input`, consuming `header_size`
    /// bytes on success. `input` must hold at least the declared size.
    pub fn read(input: &mut InputCursor<'_>) -> Result<Self, FormatError> {
        let buf = input.as_slice();
        if buf.len() < MIN_FIXED_HEADER_SIZE {
            return Err(FormatError::Truncated { what: "header", need: MIN_FIXED_HEADER_SIZE, have: buf.len() });
        }
        if buf[..8] != XFRM_HEADER_MAGIC {
            return Err(FormatError::BadMagic { what: "header", found: fmt_bytes(&buf[..8]) });
        }
        let order = Endian::detect(&buf[8..16])?;

        let mut r = FieldReader::new(&buf[16..24], order);
        let header_size = r.u32() as usize;
        let fixed_header_size = r.u32() as usize;
        Self::check_sizes(header_size, fixed_header_size)?;
        if header_size > buf.len() {
            return Err(FormatError::Truncated { what: "header", need: header_size, have: buf.len() });
        }

        // Zero-extend what an older writer did not know about, and insist
        // that whatever a newer writer added beyond our layout is zero.
        let mut fixed = [0u8; FIXED_HEADER_SIZE];
        let known = fixed_header_size.min(FIXED_HEADER_SIZE);
        fixed[..known].copy_from_slice(&buf[..known]);
        if fixed_header_size > FIXED_HEADER_SIZE {
            require_zero(&buf[FIXED_HEADER_SIZE..fixed_header_size], "unknown header fields", FIXED_HEADER_SIZE)?;
        }

        let mut r = FieldReader::new(&fixed, order);
        let _magic: [u8; 8] = r.bytes();
        let _marker = r.u64();
        let _header_size = r.u32();
        let _fixed_size = r.u32();
        let flags_raw = r.u64();
        let dbg_writer_version = r.u32();
        let octets_size = r.u32() as usize;
        let file_block_size = r.u32();
        let trailer_max_size = r.u32();
        let data_checksum = r.u32();
        let reserved0 = r.u32();
        let data_size = r.u64();
        let compress_dbg_header_stamp = r.u32();
        let compress_dbg_library_stamp = r.u32();
        let encrypt_dbg_header_stamp = r.u32();
        let encrypt_dbg_library_stamp = r.u32();
        let kdf_iter_count = r.u32();
        let data_unit_size = r.u32();
        let key_material_size = r.u32();
        let key_material_count = r.u32();
        let key_material_position = r.u32();
        let reserved1 = r.u32();
        debug_assert_eq!(r.position(), FIXED_HEADER_SIZE);

        if reserved0 != 0 {
            return Err(FormatError::NonZero { what: "header reserved field", offset: 52 });
        }
        if reserved1 != 0 {
            return Err(FormatError::NonZero { what: "header reserved field", offset: 100 });
        }
        let octets_end = fixed_header_size + octets_size;
        if octets_end > header_size {
            return Err(FormatError::SizeOutOfBounds {
                what: "extra octets",
                value: octets_size as u64,
                max: (header_size - fixed_header_size) as u64,
            });
        }
        require_zero(&buf[octets_end..header_size], "header padding", octets_end)?;

        let h = Self {
            order,
            header_size: header_size as u32,
            fixed_header_size: fixed_header_size as u32,
            flags: XfrmFlags::from_raw(flags_raw)?,
            dbg_writer_version,
            file_block_size,
            trailer_max_size,
            data_checksum,
            data_size,
            compress_dbg_header_stamp,
            compress_dbg_library_stamp,
            encrypt_dbg_header_stamp,
            encrypt_dbg_library_stamp,
            kdf_iter_count,
            data_unit_size,
            key_material_size,
            key_material_count,
            key_material_position,
            octets: buf[fixed_header_size..octets_end].to_vec(),
        };
        h.validate()?;
        input
            .advance(header_size)
            .map_err(|_| FormatError::Truncated { what: "header", need: header_size, have: buf.len() })?;
        Ok(h)
    }

    /// Peek at the declared total size without decoding the rest. Needs the
    /// first 24 bytes.
    pub fn peek_size(buf: &[u8]) -> Result<usize, FormatError> {
        if buf.len() < MIN_FIXED_HEADER_SIZE {
            return Err(FormatError::Truncated { what: "header", need: MIN_FIXED_HEADER_SIZE, have: buf.len() });
        }
        if buf[..8] != XFRM_HEADER_MAGIC {
            return Err(FormatError::BadMagic { what: "header", found: fmt_bytes(&buf[..8]) });
        }
        let order = Endian::detect(&buf[8..16])?;
        let mut r = FieldReader::new(&buf[16..24], order);
        let header_size = r.u32() as usize;
        let fixed_header_size = r.u32() as usize;
        Self::check_sizes(header_size, fixed_header_size)?;
        Ok(header_size)
    }

    fn check_sizes(header_size: usize, fixed_header_size: usize) -> Result<(), FormatError> {
        if header_size % 8 != 0 {
            return Err(FormatError::Misaligned { what: "header size", value: header_size as u64, align: 8 });
        }
        if fixed_header_size % 8 != 0 {
            return Err(FormatError::Misaligned {
                what: "fixed header size",
                value: fixed_header_size as u64,
                align: 8,
            });
        }
        if fixed_header_size < MIN_FIXED_HEADER_SIZE || fixed_header_size > header_size {
            return Err(FormatError::SizeOutOfBounds {
                what: "fixed header size",
                value: fixed_header_size as u64,
                max: header_size as u64,
            });
        }
        // The variable region may be rounded up to a file block, so allow
        // one extra block of zero padding beyond the octet limit.
        let max = fixed_header_size + MAX_HEADER_OCTETS + MAX_FILE_BLOCK_SIZE as usize;
        if header_size > max {
            return Err(FormatError::SizeOutOfBounds { what: "header size", value: header_size as u64, max: max as u64 });
        }
        Ok(())
    }

    /// Encode into `out`. Always writes the full fixed layout this
    /// implementation knows.
    pub fn write(&self, out: &mut OutputCursor<'_>) -> Result<usize, FormatError> {
        self.validate()?;
        let total = header_size_for(self.octets.len(), self.file_block_size);
        if total != self.header_size as usize {
            return Err(FormatError::Inconsistent(format!(
                "header_size {} does not cover {} octets",
                self.header_size,
                self.octets.len()
            )));
        }
        if out.remaining() < total {
            return Err(FormatError::NoSpace { what: "header", need: total, have: out.remaining() });
        }
        let mut fixed = [0u8; FIXED_HEADER_SIZE];
        let mut w = FieldWriter::new(&mut fixed, self.order);
        w.bytes(&XFRM_HEADER_MAGIC);
        w.u64(ENDIAN_MARKER);
        w.u32(self.header_size);
        w.u32(FIXED_HEADER_SIZE as u32);
        w.u64(self.flags.to_raw());
        w.u32(self.dbg_writer_version);
        w.u32(self.octets.len() as u32);
        w.u32(self.file_block_size);
        w.u32(self.trailer_max_size);
        w.u32(self.data_checksum);
        w.u32(0);
        w.u64(self.data_size);
        w.u32(self.compress_dbg_header_stamp);
        w.u32(self.compress_dbg_library_stamp);
        w.u32(self.encrypt_dbg_header_stamp);
        w.u32(self.encrypt_dbg_library_stamp);
        w.u32(self.kdf_iter_count);
        w.u32(self.data_unit_size);
        w.u32(self.key_material_size);
        w.u32(self.key_material_count);
        w.u32(self.key_material_position);
        w.u32(0);
        debug_assert_eq!(w.position(), FIXED_HEADER_SIZE);

        out.put(&fixed);
        out.put(&self.octets);
        let pad = total - FIXED_HEADER_SIZE - self.octets.len();
        const ZEROS: [u8; 64] = [0u8; 64];
        let mut left = pad;
        while left > 0 {
            let n = left.min(ZEROS.len());
            out.put(&ZEROS[..n]);
            left -= n;
        }
        Ok(total)
    }

    /// Cross-field consistency. Called after every decode and before every
    /// encode.
    pub fn validate(&self) -> Result<(), FormatError> {
        let f = &self.flags;
        if self.file_block_size % 8 != 0 {
            return Err(FormatError::Misaligned {
                what: "file block size",
                value: self.file_block_size as u64,
                align: 8,
            });
        }
        if self.file_block_size > MAX_FILE_BLOCK_SIZE {
            return Err(FormatError::SizeOutOfBounds {
                what: "file block size",
                value: self.file_block_size as u64,
                max: MAX_FILE_BLOCK_SIZE as u64,
            });
        }
        if (self.trailer_max_size as usize) < FIXED_TRAILER_SIZE || self.trailer_max_size % 8 != 0 {
            return Err(FormatError::Inconsistent(format!("trailer_max_size {}", self.trailer_max_size)));
        }
        if self.trailer_max_size < trailer_max_size_for(self.file_block_size) {
            return Err(FormatError::Inconsistent(format!(
                "trailer_max_size {} cannot cover a {}-byte block pad",
                self.trailer_max_size, self.file_block_size
            )));
        }

        for (field, value, known) in [
            ("compress header", self.compress_dbg_header_stamp, KNOWN_HEADER_STAMPS),
            ("compress library", self.compress_dbg_library_stamp, KNOWN_LIBRARY_STAMPS),
            ("encrypt header", self.encrypt_dbg_header_stamp, KNOWN_HEADER_STAMPS),
            ("encrypt library", self.encrypt_dbg_library_stamp, KNOWN_LIBRARY_STAMPS),
        ] {
            if !known.contains(&value) {
                return Err(FormatError::UnknownStamp { field, value });
            }
        }

        if !f.presence.contains(Presence::DATA_CHECKSUM_IN_HEADER) && self.data_checksum != 0 {
            return Err(FormatError::NonZero { what: "data checksum without presence flag", offset: 48 });
        }
        if !f.presence.contains(Presence::DATA_SIZE_IN_HEADER) && self.data_size != 0 {
            return Err(FormatError::NonZero { what: "data size without presence flag", offset: 56 });
        }

        if !f.is_compressed() && f.compression_padding != PaddingKind::None {
            return Err(FormatError::Inconsistent("compression padding without compression".into()));
        }

        if !f.is_encrypted() {
            let stray = f.key_method != KeyMethod::None
                || f.cipher_padding != PaddingKind::None
                || self.kdf_iter_count != 0
                || self.data_unit_size != 0
                || self.key_material_size != 0
                || self.key_material_count != 0;
            if stray {
                return Err(FormatError::Inconsistent("key parameters present without a cipher".into()));
            }
            return Ok(());
        }

        if f.key_method == KeyMethod::None {
            return Err(FormatError::Inconsistent("cipher without key reconstruction method".into()));
        }
        if self.kdf_iter_count == 0 {
            return Err(FormatError::Inconsistent("cipher with zero KDF iterations".into()));
        }
        if self.data_unit_size as usize % AES_BLOCK_SIZE != 0 {
            return Err(FormatError::Misaligned {
                what: "data unit size",
                value: self.data_unit_size as u64,
                align: AES_BLOCK_SIZE as u64,
            });
        }
        let count = self.key_material_count as usize;
        if count == 0 || count > MAX_KEY_PAIRS {
            return Err(FormatError::SizeOutOfBounds {
                what: "key material count",
                value: count as u64,
                max: MAX_KEY_PAIRS as u64,
            });
        }
        let expect = key_material_size_for(f.cipher, f.key_method, count);
        if self.key_material_size as usize != expect {
            return Err(FormatError::Inconsistent(format!(
                "key material size {} for {} pairs, expected {}",
                self.key_material_size, count, expect
            )));
        }
        let end = self.key_material_position as usize + self.key_material_size as usize;
        if end > self.octets.len() {
            return Err(FormatError::SizeOutOfBounds {
                what: "key material end",
                value: end as u64,
                max: self.octets.len() as u64,
            });
        }
        Ok(())
    }
}
