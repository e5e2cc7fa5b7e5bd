//! envelope/legacy.rs
//! Legacy envelope: constant 512-byte header, zlib payload, 12-byte trailer
//! padded with zeros to the next 512-byte boundary.
//!
//! Layout:
//! ```text
//! [ header 512 ][ zlib payload ][ crc32 LE | size LE u32 | "DBDN" ][ 0.. ]
//! ```
//! The trailer is located by scanning backward from end of file over the
//! zero pad. The tag's last byte is non-zero, so payload bytes that happen
//! to be zero never confuse the scan.

use crate::buffer::{InputCursor, OutputCursor, ReverseInputCursor};
use crate::constants::{LEGACY_BLOCK_SIZE, LEGACY_HEADER_SIZE, LEGACY_MAGIC, LEGACY_TRAILER_SIZE, LEGACY_TRAILER_TAG};
use crate::envelope::codec::SplitOutput;
use crate::envelope::types::{Detect, FormatError};
use crate::utils::fmt_bytes;

/// Format version byte at offset 4.
const LEGACY_VERSION: u8 = 1;

const fn build_legacy_header() -> [u8; LEGACY_HEADER_SIZE] {
    let mut h = [0u8; LEGACY_HEADER_SIZE];
    h[0] = LEGACY_MAGIC[0];
    h[1] = LEGACY_MAGIC[1];
    h[2] = LEGACY_MAGIC[2];
    h[3] = LEGACY_MAGIC[3];
    h[4] = LEGACY_VERSION;
    // 6..8 block size, little endian
    h[6] = (LEGACY_BLOCK_SIZE & 0xff) as u8;
    h[7] = (LEGACY_BLOCK_SIZE >> 8) as u8;
    h
}

/// The only header a legacy file may carry.
pub static LEGACY_HEADER: [u8; LEGACY_HEADER_SIZE] = build_legacy_header();

/// Probe for the legacy magic prefix.
pub fn detect(bytes: &[u8]) -> Detect {
    let n = bytes.len().min(LEGACY_MAGIC.len());
    if bytes[..n] != LEGACY_MAGIC[..n] {
        Detect::No
    } else if n < LEGACY_MAGIC.len() {
        Detect::NeedMoreBytes
    } else {
        Detect::Yes
    }
}

/// Consume and verify the 512-byte header. Returns the consumed size.
pub fn read_header(input: &mut InputCursor<'_>) -> Result<usize, FormatError> {
    let have = input.as_slice();
    if have.len() < LEGACY_HEADER_SIZE {
        return Err(FormatError::Truncated { what: "legacy header", need: LEGACY_HEADER_SIZE, have: have.len() });
    }
    if let Some(offset) = have[..LEGACY_HEADER_SIZE]
        .iter()
        .zip(LEGACY_HEADER.iter())
        .position(|(a, b)| a != b)
    {
        return Err(FormatError::LegacyHeaderMismatch { offset });
    }
    input
        .advance(LEGACY_HEADER_SIZE)
        .map_err(|_| FormatError::Truncated { what: "legacy header", need: LEGACY_HEADER_SIZE, have: have.len() })?;
    Ok(LEGACY_HEADER_SIZE)
}

pub fn write_header(out: &mut OutputCursor<'_>) -> Result<usize, FormatError> {
    if out.remaining() < LEGACY_HEADER_SIZE {
        return Err(FormatError::NoSpace { what: "legacy header", need: LEGACY_HEADER_SIZE, have: out.remaining() });
    }
    out.put(&LEGACY_HEADER);
    Ok(LEGACY_HEADER_SIZE)
}

/// CRC32 and size of the plaintext, as recorded at close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LegacyTrailer {
    pub data_checksum: u32,
    pub data_size: u32,
}

impl LegacyTrailer {
    /// Zero bytes needed after a trailer that starts at `trailer_offset`
    /// so the file ends on a block boundary.
    pub fn pad_for(trailer_offset: u64) -> usize {
        let end = trailer_offset + LEGACY_TRAILER_SIZE as u64;
        let block = LEGACY_BLOCK_SIZE as u64;
        ((block - end % block) % block) as usize
    }

    /// Scan backward over the zero pad and decode the trailer.
    ///
    /// On success the cursor has consumed the trailer and its pad; the
    /// consumed count is the number of bytes to hide from the payload.
    pub fn read(input: &mut ReverseInputCursor<'_>) -> Result<Self, FormatError> {
        let window = input.as_slice();
        let last = window.iter().rposition(|&b| b != 0).ok_or(FormatError::MissingTrailer)?;
        let pad = window.len() - last - 1;
        if pad >= LEGACY_BLOCK_SIZE {
            return Err(FormatError::SizeOutOfBounds {
                what: "legacy trailer pad",
                value: pad as u64,
                max: (LEGACY_BLOCK_SIZE - 1) as u64,
            });
        }
        let end = last + 1;
        if end < LEGACY_TRAILER_SIZE {
            return Err(FormatError::Truncated { what: "legacy trailer", need: LEGACY_TRAILER_SIZE, have: end });
        }
        let rec = &window[end - LEGACY_TRAILER_SIZE..end];
        if rec[8..12] != LEGACY_TRAILER_TAG {
            return Err(FormatError::BadMagic { what: "legacy trailer", found: fmt_bytes(&rec[8..12]) });
        }
        let trailer = Self {
            data_checksum: u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]),
            data_size: u32::from_le_bytes([rec[4], rec[5], rec[6], rec[7]]),
        };
        input
            .advance(pad + LEGACY_TRAILER_SIZE)
            .map_err(|_| FormatError::MissingTrailer)?;
        Ok(trailer)
    }

    /// Emit the trailer followed by its zero pad. Bytes that do not fit in
    /// `out` continue into `extra`. Returns the total number of bytes
    /// written.
    pub fn write(
        &self,
        trailer_offset: u64,
        out: &mut OutputCursor<'_>,
        extra: Option<&mut OutputCursor<'_>>,
    ) -> Result<usize, FormatError> {
        let mut rec = [0u8; LEGACY_TRAILER_SIZE];
        rec[0..4].copy_from_slice(&self.data_checksum.to_le_bytes());
        rec[4..8].copy_from_slice(&self.data_size.to_le_bytes());
        rec[8..12].copy_from_slice(&LEGACY_TRAILER_TAG);
        let pad = Self::pad_for(trailer_offset);
        let mut sink = SplitOutput::new(out, extra, LEGACY_TRAILER_SIZE + pad, "legacy trailer")?;
        sink.bytes(&rec);
        sink.zeros(pad);
        Ok(LEGACY_TRAILER_SIZE + pad)
    }

    pub fn validate(&self, bytes_seen: u64) -> Result<(), FormatError> {
        if u64::from(self.data_size) != bytes_seen {
            return Err(FormatError::DataSizeMismatch { declared: self.data_size.into(), actual: bytes_seen });
        }
        Ok(())
    }
}
