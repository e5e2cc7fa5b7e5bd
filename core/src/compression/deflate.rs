//! compression/deflate.rs
//! Streaming zlib stage driven through cursors.
//!
//! Design notes:
//! - Encoder and decoder are created once at bind time and reset per
//!   session, so a running session never allocates.
//! - The bound arena carries the stage's working-set reservation: a
//!   session that cannot reserve it fails at `begin_*`, not mid-stream.
//! - Optional PKCS padding extends the compressed stream to a multiple of
//!   16 bytes with 1..=16 bytes of value n, so a downstream block cipher
//!   always sees whole blocks.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::debug;

use crate::buffer::{InputCursor, OutputCursor, Progress, TransformStage};
use crate::compression::arena::{ArenaBlock, ScratchArena};
use crate::compression::types::CompressionError;
use crate::constants::{
    AES_BLOCK_SIZE, DEFAULT_DEFLATE_LEVEL, DEFLATE_DECODE_WORKSET, DEFLATE_ENCODE_WORKSET, MIN_DEFLATE_ARENA,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Encode,
    Decode,
}

/// Trailing pad bookkeeping. `len` is the pad length once known, `done`
/// the number of pad bytes emitted or verified so far.
#[derive(Debug, Default, Clone, Copy)]
struct PadState {
    len: usize,
    done: usize,
}

pub struct DeflateStage {
    enc: Compress,
    dec: Decompress,
    arena: Option<ScratchArena>,
    workset: Option<ArenaBlock>,
    mode: Mode,
    padding: bool,
    stream_end: bool,
    pad: PadState,
}

impl std::fmt::Debug for DeflateStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateStage")
            .field("mode", &self.mode)
            .field("padding", &self.padding)
            .field("stream_end", &self.stream_end)
            .field("total_in", &self.total_in())
            .field("total_out", &self.total_out())
            .finish()
    }
}

impl Default for DeflateStage {
    fn default() -> Self {
        Self::new(DEFAULT_DEFLATE_LEVEL)
    }
}

impl DeflateStage {
    pub fn new(level: u32) -> Self {
        Self {
            enc: Compress::new(Compression::new(level.min(9)), true),
            dec: Decompress::new(true),
            arena: None,
            workset: None,
            mode: Mode::Idle,
            padding: false,
            stream_end: false,
            pad: PadState::default(),
        }
    }

    /// Install the scratch budget the stage reserves its working set from.
    pub fn bind_memory(&mut self, size: usize) -> Result<(), CompressionError> {
        if self.mode != Mode::Idle {
            return Err(CompressionError::AlreadyActive);
        }
        if size < MIN_DEFLATE_ARENA {
            return Err(CompressionError::ArenaTooSmall { size, min: MIN_DEFLATE_ARENA });
        }
        self.arena = Some(ScratchArena::new(size));
        Ok(())
    }

    pub fn arena(&self) -> Option<&ScratchArena> {
        self.arena.as_ref()
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.mode != Mode::Idle
    }

    pub fn total_in(&self) -> u64 {
        match self.mode {
            Mode::Decode => self.dec.total_in(),
            _ => self.enc.total_in(),
        }
    }

    pub fn total_out(&self) -> u64 {
        match self.mode {
            Mode::Decode => self.dec.total_out(),
            _ => self.enc.total_out(),
        }
    }

    fn begin(&mut self, mode: Mode, workset: usize, padding: bool) -> Result<(), CompressionError> {
        if self.mode != Mode::Idle {
            return Err(CompressionError::AlreadyActive);
        }
        let arena = self.arena.as_mut().ok_or(CompressionError::NoArena)?;
        self.workset = Some(arena.alloc(workset, 16)?);
        match mode {
            Mode::Encode => self.enc.reset(),
            Mode::Decode => self.dec.reset(true),
            Mode::Idle => {}
        }
        self.mode = mode;
        self.padding = padding;
        self.stream_end = false;
        self.pad = PadState::default();
        debug!(?mode, padding, "deflate session started");
        Ok(())
    }

    pub fn begin_encode(&mut self, padding: bool) -> Result<(), CompressionError> {
        self.begin(Mode::Encode, DEFLATE_ENCODE_WORKSET, padding)
    }

    pub fn begin_decode(&mut self, padding: bool) -> Result<(), CompressionError> {
        self.begin(Mode::Decode, DEFLATE_DECODE_WORKSET, padding)
    }

    /// True once the zlib stream end (and any padding) has been handled.
    pub fn is_finished(&self) -> bool {
        self.stream_end && (!self.padding || self.pad.done == self.pad.len)
    }

    /// Tear down the session and give the working set back. Fails if the
    /// arena is not empty afterwards.
    pub fn end(&mut self) -> Result<(), CompressionError> {
        if self.mode == Mode::Idle {
            return Err(CompressionError::NotActive);
        }
        self.mode = Mode::Idle;
        let arena = self.arena.as_mut().ok_or(CompressionError::NoArena)?;
        if let Some(block) = self.workset.take() {
            arena.free(block)?;
        }
        if !arena.is_drained() {
            return Err(CompressionError::ArenaNotDrained { in_use: arena.in_use() });
        }
        Ok(())
    }

    pub fn step(&mut self, out: &mut OutputCursor<'_>, input: &mut InputCursor<'_>) -> Result<Progress, CompressionError> {
        match self.mode {
            Mode::Encode => self.encode_step(out, input),
            Mode::Decode => self.decode_step(out, input),
            Mode::Idle => Err(CompressionError::NotActive),
        }
    }

    fn encode_step(&mut self, out: &mut OutputCursor<'_>, input: &mut InputCursor<'_>) -> Result<Progress, CompressionError> {
        loop {
            if self.stream_end {
                return self.emit_padding(out);
            }
            if input.remaining() == 0 && !input.is_end_of_stream() {
                return Ok(Progress::NeedInput);
            }
            if out.remaining() == 0 {
                return Ok(Progress::OutputFull);
            }
            let flush = if input.is_end_of_stream() { FlushCompress::Finish } else { FlushCompress::None };
            let (in0, out0) = (self.enc.total_in(), self.enc.total_out());
            let status = self.enc.compress(input.as_slice(), out.space_mut(), flush)?;
            let consumed = (self.enc.total_in() - in0) as usize;
            let produced = (self.enc.total_out() - out0) as usize;
            input.advance(consumed)?;
            out.advance(produced)?;

            if status == Status::StreamEnd {
                self.stream_end = true;
                let rem = (self.enc.total_out() % AES_BLOCK_SIZE as u64) as usize;
                self.pad = PadState { len: if self.padding { AES_BLOCK_SIZE - rem } else { 0 }, done: 0 };
                continue;
            }
            if consumed == 0 && produced == 0 {
                if out.remaining() == 0 {
                    return Ok(Progress::OutputFull);
                }
                if input.remaining() == 0 && !input.is_end_of_stream() {
                    return Ok(Progress::NeedInput);
                }
                return Err(CompressionError::Codec("encoder made no progress".into()));
            }
        }
    }

    fn emit_padding(&mut self, out: &mut OutputCursor<'_>) -> Result<Progress, CompressionError> {
        const PAD: [u8; AES_BLOCK_SIZE] = [0u8; AES_BLOCK_SIZE];
        let left = self.pad.len - self.pad.done;
        if left > 0 {
            let value = self.pad.len as u8;
            let n = left.min(out.remaining());
            let mut chunk = PAD;
            chunk[..n].fill(value);
            out.put(&chunk[..n]);
            self.pad.done += n;
            if self.pad.done < self.pad.len {
                return Ok(Progress::OutputFull);
            }
        }
        out.mark_end_of_stream();
        Ok(Progress::Done)
    }

    fn decode_step(&mut self, out: &mut OutputCursor<'_>, input: &mut InputCursor<'_>) -> Result<Progress, CompressionError> {
        loop {
            if self.stream_end {
                return self.consume_padding(out, input);
            }
            if out.remaining() == 0 {
                return Ok(Progress::OutputFull);
            }
            // Empty input still gets a call: the decoder may hold output
            // it could not place last time.
            let (in0, out0) = (self.dec.total_in(), self.dec.total_out());
            let status = self.dec.decompress(input.as_slice(), out.space_mut(), FlushDecompress::None)?;
            let consumed = (self.dec.total_in() - in0) as usize;
            let produced = (self.dec.total_out() - out0) as usize;
            input.advance(consumed)?;
            out.advance(produced)?;

            if status == Status::StreamEnd {
                self.stream_end = true;
                continue;
            }
            if consumed == 0 && produced == 0 {
                if out.remaining() == 0 {
                    return Ok(Progress::OutputFull);
                }
                if input.remaining() == 0 {
                    if input.is_end_of_stream() {
                        return Err(CompressionError::Truncated);
                    }
                    return Ok(Progress::NeedInput);
                }
                return Err(CompressionError::Codec("decoder made no progress".into()));
            }
        }
    }

    fn consume_padding(&mut self, out: &mut OutputCursor<'_>, input: &mut InputCursor<'_>) -> Result<Progress, CompressionError> {
        if self.padding {
            let rest = input.as_slice();
            if self.pad.len == 0 {
                let Some(&first) = rest.first() else {
                    return self.wait_for_end(out, input, false);
                };
                let n = first as usize;
                let total = self.dec.total_in() as usize + n;
                if n == 0 || n > AES_BLOCK_SIZE || total % AES_BLOCK_SIZE != 0 {
                    return Err(CompressionError::BadPadding);
                }
                self.pad.len = n;
            }
            let want = self.pad.len - self.pad.done;
            let take = want.min(input.remaining());
            if input.as_slice()[..take].iter().any(|&b| b as usize != self.pad.len) {
                return Err(CompressionError::BadPadding);
            }
            input.advance(take)?;
            self.pad.done += take;
            if self.pad.done < self.pad.len {
                return self.wait_for_end(out, input, false);
            }
        }
        self.wait_for_end(out, input, true)
    }

    /// After the stream proper: any further byte is an error, and `Done`
    /// needs the input's end-of-stream flag.
    fn wait_for_end(&mut self, out: &mut OutputCursor<'_>, input: &mut InputCursor<'_>, complete: bool) -> Result<Progress, CompressionError> {
        if complete && input.remaining() > 0 {
            return Err(CompressionError::TrailingData { extra: input.remaining() });
        }
        if input.is_end_of_stream() && input.remaining() == 0 {
            if !complete {
                return Err(CompressionError::BadPadding);
            }
            out.mark_end_of_stream();
            return Ok(Progress::Done);
        }
        Ok(Progress::NeedInput)
    }
}

impl TransformStage for DeflateStage {
    type Error = CompressionError;

    fn transform(&mut self, out: &mut OutputCursor<'_>, input: &mut InputCursor<'_>) -> Result<Progress, Self::Error> {
        self.step(out, input)
    }
}
