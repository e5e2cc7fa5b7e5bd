//! envelope/trailer.rs
//! Extensible envelope trailer.
//!
//! The trailer is read from the end of the file, so it grows toward the
//! front: new fields are prepended in later versions and the magic always
//! stays last.
//!
//! ```text
//! [ zero pad ][ unknown fields, zero ][ known fixed trailer, 48 bytes ]
//!
//!   0  flags               u64
//!   8  data_size           u64
//!  16  data_checksum       u32   CRC32 of the plaintext
//!  20  file_checksum       u32   CRC32 of the on-disk payload
//!  24  trailer_size        u32   pad + fixed part
//!  28  fixed_trailer_size  u32
//!  32  endianness marker   u64
//!  40  magic "DNMRFXBN"    8
//! ```

use crate::buffer::{OutputCursor, ReverseInputCursor};
use crate::constants::{ENDIAN_MARKER, XFRM_TRAILER_MAGIC};
use crate::envelope::codec::{require_zero, Endian, FieldReader, FieldWriter, SplitOutput};
use crate::envelope::types::{FormatError, XfrmFlags};
use crate::utils::fmt_bytes;

pub const FIXED_TRAILER_SIZE: usize = 48;

/// Smallest fixed trailer any writer may declare: both sizes, marker, magic.
const MIN_FIXED_TRAILER_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XfrmTrailer {
    pub order: Endian,
    pub flags: XfrmFlags,
    pub data_size: u64,
    pub data_checksum: u32,
    pub file_checksum: u32,
    pub trailer_size: u32,
    pub fixed_trailer_size: u32,
}

impl XfrmTrailer {
    pub fn new(order: Endian, flags: XfrmFlags) -> Self {
        Self {
            order,
            flags,
            data_size: 0,
            data_checksum: 0,
            file_checksum: 0,
            trailer_size: FIXED_TRAILER_SIZE as u32,
            fixed_trailer_size: FIXED_TRAILER_SIZE as u32,
        }
    }

    /// Zero bytes to put in front of the fixed trailer that starts at
    /// `trailer_offset` so the file ends on a `file_block_size` boundary.
    pub fn pad_for(trailer_offset: u64, file_block_size: u32) -> usize {
        if file_block_size == 0 {
            return 0;
        }
        let block = u64::from(file_block_size);
        let end = trailer_offset + FIXED_TRAILER_SIZE as u64;
        ((block - end % block) % block) as usize
    }

    /// Decode the trailer at the top of `input`, consuming `trailer_size`
    /// bytes on success.
    pub fn read(input: &mut ReverseInputCursor<'_>) -> Result<Self, FormatError> {
        let buf = input.as_slice();
        let len = buf.len();
        if len < MIN_FIXED_TRAILER_SIZE {
            return Err(FormatError::Truncated { what: "trailer", need: MIN_FIXED_TRAILER_SIZE, have: len });
        }
        if buf[len - 8..] != XFRM_TRAILER_MAGIC {
            return Err(FormatError::BadMagic { what: "trailer", found: fmt_bytes(&buf[len - 8..]) });
        }
        let order = Endian::detect(&buf[len - 16..len - 8])?;
        let mut r = FieldReader::new(&buf[len - 24..len - 16], order);
        let trailer_size = r.u32() as usize;
        let fixed_trailer_size = r.u32() as usize;

        if fixed_trailer_size % 8 != 0 {
            return Err(FormatError::Misaligned {
                what: "fixed trailer size",
                value: fixed_trailer_size as u64,
                align: 8,
            });
        }
        if fixed_trailer_size < MIN_FIXED_TRAILER_SIZE || fixed_trailer_size > trailer_size {
            return Err(FormatError::SizeOutOfBounds {
                what: "fixed trailer size",
                value: fixed_trailer_size as u64,
                max: trailer_size as u64,
            });
        }
        if trailer_size > len {
            return Err(FormatError::Truncated { what: "trailer", need: trailer_size, have: len });
        }

        let start = len - trailer_size;
        // Everything in front of the part we understand must be zero: the
        // pad, plus any fields a newer writer prepended.
        let known_start = len - fixed_trailer_size.min(FIXED_TRAILER_SIZE);
        require_zero(&buf[start..known_start], "trailer padding", 0)?;

        let mut fixed = [0u8; FIXED_TRAILER_SIZE];
        let known = len - known_start;
        fixed[FIXED_TRAILER_SIZE - known..].copy_from_slice(&buf[known_start..]);

        let mut r = FieldReader::new(&fixed, order);
        let flags_raw = r.u64();
        let data_size = r.u64();
        let data_checksum = r.u32();
        let file_checksum = r.u32();

        let t = Self {
            order,
            flags: XfrmFlags::from_raw(flags_raw)?,
            data_size,
            data_checksum,
            file_checksum,
            trailer_size: trailer_size as u32,
            fixed_trailer_size: fixed_trailer_size as u32,
        };
        input
            .advance(trailer_size)
            .map_err(|_| FormatError::Truncated { what: "trailer", need: trailer_size, have: len })?;
        Ok(t)
    }

    /// Emit pad and fixed trailer for a payload that ends at
    /// `trailer_offset`. Bytes that do not fit in `out` continue into
    /// `extra`. Updates `trailer_size` and returns it.
    pub fn write(
        &mut self,
        trailer_offset: u64,
        file_block_size: u32,
        out: &mut OutputCursor<'_>,
        extra: Option<&mut OutputCursor<'_>>,
    ) -> Result<usize, FormatError> {
        let pad = Self::pad_for(trailer_offset, file_block_size);
        self.fixed_trailer_size = FIXED_TRAILER_SIZE as u32;
        self.trailer_size = (FIXED_TRAILER_SIZE + pad) as u32;

        let mut fixed = [0u8; FIXED_TRAILER_SIZE];
        let mut w = FieldWriter::new(&mut fixed, self.order);
        w.u64(self.flags.to_raw());
        w.u64(self.data_size);
        w.u32(self.data_checksum);
        w.u32(self.file_checksum);
        w.u32(self.trailer_size);
        w.u32(self.fixed_trailer_size);
        w.u64(ENDIAN_MARKER);
        w.bytes(&XFRM_TRAILER_MAGIC);
        debug_assert_eq!(w.position(), FIXED_TRAILER_SIZE);

        let total = self.trailer_size as usize;
        let mut sink = SplitOutput::new(out, extra, total, "trailer")?;
        sink.zeros(pad);
        sink.bytes(&fixed);
        Ok(total)
    }

    /// Check the trailer against the header it closes.
    pub fn validate(&self, header_flags: &XfrmFlags, trailer_max_size: u32) -> Result<(), FormatError> {
        if self.flags.to_raw() != header_flags.to_raw() {
            return Err(FormatError::Inconsistent(format!(
                "trailer flags 0x{:016x} differ from header flags 0x{:016x}",
                self.flags.to_raw(),
                header_flags.to_raw()
            )));
        }
        if self.trailer_size > trailer_max_size {
            return Err(FormatError::SizeOutOfBounds {
                what: "trailer size",
                value: self.trailer_size.into(),
                max: trailer_max_size.into(),
            });
        }
        Ok(())
    }
}
