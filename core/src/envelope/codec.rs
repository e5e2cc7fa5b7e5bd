//! envelope/codec.rs
//! Byte-order-aware field readers and writers for the extensible envelope.
//!
//! Every multi-byte field of the header and trailer goes through these two
//! types, so the order a file was written in is decided once per record
//! (from the endianness marker) instead of per field.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::buffer::OutputCursor;
use crate::constants::ENDIAN_MARKER;
use crate::envelope::types::FormatError;
use crate::utils::first_non_zero;

/// Byte order of the integer fields in one envelope record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    /// Byte order of the running host.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") { Endian::Big } else { Endian::Little }
    }

    /// The opposite order, as seen by a reader on a foreign host.
    pub const fn swapped(self) -> Self {
        match self {
            Endian::Little => Endian::Big,
            Endian::Big => Endian::Little,
        }
    }

    /// Recover the writer's byte order from the 8 marker bytes.
    pub fn detect(marker: &[u8]) -> Result<Self, FormatError> {
        if marker.len() < 8 {
            return Err(FormatError::Truncated { what: "endianness marker", need: 8, have: marker.len() });
        }
        let le = LittleEndian::read_u64(marker);
        if le == ENDIAN_MARKER {
            Ok(Endian::Little)
        } else if le.swap_bytes() == ENDIAN_MARKER {
            Ok(Endian::Big)
        } else {
            Err(FormatError::BadEndianMarker { found: le })
        }
    }
}

/// Sequential field writer over a fixed output slice.
///
/// Callers size the slice up front; writing past its end is a bug in the
/// record layout, caught by the slice bounds check.
pub struct FieldWriter<'a> {
    out: &'a mut [u8],
    pos: usize,
    order: Endian,
}

impl<'a> FieldWriter<'a> {
    pub fn new(out: &'a mut [u8], order: Endian) -> Self {
        Self { out, pos: 0, order }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn u32(&mut self, v: u32) {
        let dst = &mut self.out[self.pos..self.pos + 4];
        match self.order {
            Endian::Little => LittleEndian::write_u32(dst, v),
            Endian::Big => BigEndian::write_u32(dst, v),
        }
        self.pos += 4;
    }

    pub fn u64(&mut self, v: u64) {
        let dst = &mut self.out[self.pos..self.pos + 8];
        match self.order {
            Endian::Little => LittleEndian::write_u64(dst, v),
            Endian::Big => BigEndian::write_u64(dst, v),
        }
        self.pos += 8;
    }

    pub fn bytes(&mut self, b: &[u8]) {
        self.out[self.pos..self.pos + b.len()].copy_from_slice(b);
        self.pos += b.len();
    }
}

/// Sequential field reader over a fixed input slice.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: Endian,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8], order: Endian) -> Self {
        Self { buf, pos: 0, order }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn u32(&mut self) -> u32 {
        let src = &self.buf[self.pos..self.pos + 4];
        self.pos += 4;
        match self.order {
            Endian::Little => LittleEndian::read_u32(src),
            Endian::Big => BigEndian::read_u32(src),
        }
    }

    pub fn u64(&mut self) -> u64 {
        let src = &self.buf[self.pos..self.pos + 8];
        self.pos += 8;
        match self.order {
            Endian::Little => LittleEndian::read_u64(src),
            Endian::Big => BigEndian::read_u64(src),
        }
    }

    pub fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut dst = [0u8; N];
        dst.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        dst
    }
}

/// Writes a record into an output cursor, spilling into a second cursor
/// once the first is full. Room for the whole record is checked up front.
pub(crate) struct SplitOutput<'o, 'a, 'b> {
    out: &'o mut OutputCursor<'a>,
    extra: Option<&'o mut OutputCursor<'b>>,
}

impl<'o, 'a, 'b> SplitOutput<'o, 'a, 'b> {
    pub fn new(
        out: &'o mut OutputCursor<'a>,
        extra: Option<&'o mut OutputCursor<'b>>,
        need: usize,
        what: &'static str,
    ) -> Result<Self, FormatError> {
        let have = out.remaining() + extra.as_ref().map_or(0, |e| e.remaining());
        if have < need {
            return Err(FormatError::NoSpace { what, need, have });
        }
        Ok(Self { out, extra })
    }

    pub fn bytes(&mut self, chunk: &[u8]) {
        let n = self.out.put(chunk);
        if n < chunk.len() {
            if let Some(extra) = self.extra.as_deref_mut() {
                extra.put(&chunk[n..]);
            }
        }
    }

    pub fn zeros(&mut self, mut n: usize) {
        const ZEROS: [u8; 64] = [0u8; 64];
        while n > 0 {
            let step = n.min(ZEROS.len());
            self.bytes(&ZEROS[..step]);
            n -= step;
        }
    }
}

/// Verify that `bytes` holds only zeros, reporting the first offender
/// relative to `base`.
pub(crate) fn require_zero(bytes: &[u8], what: &'static str, base: usize) -> Result<(), FormatError> {
    match first_non_zero(bytes) {
        Some(i) => Err(FormatError::NonZero { what, offset: base + i }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_detects_both_orders() {
        let mut buf = [0u8; 8];
        FieldWriter::new(&mut buf, Endian::Big).u64(ENDIAN_MARKER);
        assert_eq!(Endian::detect(&buf).unwrap(), Endian::Big);
        FieldWriter::new(&mut buf, Endian::Little).u64(ENDIAN_MARKER);
        assert_eq!(Endian::detect(&buf).unwrap(), Endian::Little);
        assert!(Endian::detect(&[0u8; 8]).is_err());
    }
}
