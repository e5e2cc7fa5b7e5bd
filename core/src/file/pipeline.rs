//! file/pipeline.rs
//! Stage wiring between the caller's plaintext cursor and raw payload
//! bytes.
//!
//! ```text
//! write:    plain → [deflate] → mid → [cipher] → disk → sink
//! read:     source → disk → [cipher] → mid → [deflate] → plain
//! backward: source → disk → [reverse cipher] → plain
//! ```
//! The middle buffer exists only when both stages are active. Running
//! checksums cover the plaintext (`data`) and the on-disk payload (`file`).

use std::sync::Arc;

use crc32fast::Hasher;

use crate::buffer::{
    ContractViolation, InputCursor, OutputCursor, Passthrough, Progress, ReverseOutputCursor, StagingBuffer,
    TransformStage,
};
use crate::compression::DeflateStage;
use crate::config::XfrmConfig;
use crate::crypto::{CipherOperation, Direction, KeyContext, ReverseCipherOperation};
use crate::types::XfrmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Write,
    Read,
    Backward,
}

impl Flow {
    fn name(self) -> &'static str {
        match self {
            Flow::Write => "writing",
            Flow::Read => "reading",
            Flow::Backward => "reading backward",
        }
    }
}

/// Compact `buf` when less than one alignment unit is left to write into.
fn make_room(buf: &mut StagingBuffer) -> Result<(), ContractViolation> {
    if buf.writable_space() < buf.alignment() {
        buf.compact(buf.alignment())?;
    }
    Ok(())
}

/// Run `stage` from a caller cursor into a staging buffer.
fn produce<S>(stage: &mut S, dst: &mut StagingBuffer, input: &mut InputCursor<'_>) -> Result<Progress, XfrmError>
where
    S: TransformStage,
    XfrmError: From<S::Error>,
{
    make_room(dst)?;
    let mut out = dst.output_cursor()?;
    let progress = stage.transform(&mut out, input)?;
    let state = out.state();
    dst.commit_write(state)?;
    Ok(progress)
}

/// Run `stage` from a staging buffer into a caller cursor.
fn consume<S>(stage: &mut S, src: &mut StagingBuffer, out: &mut OutputCursor<'_>) -> Result<Progress, XfrmError>
where
    S: TransformStage,
    XfrmError: From<S::Error>,
{
    let mut input = src.input_cursor()?;
    let progress = stage.transform(out, &mut input)?;
    let state = input.state();
    src.commit_read(state)?;
    Ok(progress)
}

/// Run `stage` between two staging buffers.
fn transfer<S>(stage: &mut S, src: &mut StagingBuffer, dst: &mut StagingBuffer) -> Result<Progress, XfrmError>
where
    S: TransformStage,
    XfrmError: From<S::Error>,
{
    make_room(dst)?;
    let mut input = src.input_cursor()?;
    let mut out = dst.output_cursor()?;
    let progress = stage.transform(&mut out, &mut input)?;
    let (read, written) = (input.state(), out.state());
    src.commit_read(read)?;
    dst.commit_write(written)?;
    Ok(progress)
}

fn missing_mid() -> XfrmError {
    ContractViolation::OutOfSequence { operation: "pipeline", state: "middle buffer missing" }.into()
}

fn stalled(operation: &'static str) -> XfrmError {
    ContractViolation::OutOfSequence { operation, state: "pipeline stalled" }.into()
}

pub(crate) struct Pipeline {
    deflate: Option<DeflateStage>,
    compression_padding: bool,
    keys: Option<Arc<KeyContext>>,
    cipher: Option<CipherOperation>,
    rcipher: Option<ReverseCipherOperation>,
    disk: StagingBuffer,
    mid: Option<StagingBuffer>,
    data_crc: Hasher,
    file_crc: Hasher,
    data_bytes: u64,
    payload_bytes: u64,
    flow: Option<Flow>,
    finished: bool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("compressed", &self.deflate.is_some())
            .field("encrypted", &self.keys.is_some())
            .field("flow", &self.flow)
            .field("finished", &self.finished)
            .field("data_bytes", &self.data_bytes)
            .field("payload_bytes", &self.payload_bytes)
            .finish()
    }
}

impl Pipeline {
    pub fn new(
        cfg: &XfrmConfig,
        compressed: bool,
        compression_padding: bool,
        keys: Option<Arc<KeyContext>>,
    ) -> Result<Self, XfrmError> {
        let deflate = if compressed {
            let mut stage = DeflateStage::new(cfg.deflate_level);
            stage.bind_memory(cfg.arena_size)?;
            Some(stage)
        } else {
            None
        };
        let mid = if compressed && keys.is_some() {
            Some(StagingBuffer::new(cfg.buffer_size, cfg.buffer_alignment)?)
        } else {
            None
        };
        Ok(Self {
            deflate,
            compression_padding,
            keys,
            cipher: None,
            rcipher: None,
            disk: StagingBuffer::new(cfg.buffer_size, cfg.buffer_alignment)?,
            mid,
            data_crc: Hasher::new(),
            file_crc: Hasher::new(),
            data_bytes: 0,
            payload_bytes: 0,
            flow: None,
            finished: false,
        })
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Plaintext bytes consumed (write) or produced (read) so far.
    #[inline]
    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    /// Payload bytes handed to the sink or taken from the source so far.
    #[inline]
    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    pub fn data_checksum(&self) -> u32 {
        self.data_crc.clone().finalize()
    }

    pub fn file_checksum(&self) -> u32 {
        self.file_crc.clone().finalize()
    }

    fn reset(&mut self, flow: Flow) -> Result<(), XfrmError> {
        if let Some(active) = self.flow {
            return Err(ContractViolation::OutOfSequence { operation: "begin", state: active.name() }.into());
        }
        match flow {
            Flow::Backward => self.disk.begin_reverse(),
            _ => self.disk.begin_forward(),
        }
        if let Some(mid) = self.mid.as_mut() {
            mid.begin_forward();
        }
        self.data_crc = Hasher::new();
        self.file_crc = Hasher::new();
        self.data_bytes = 0;
        self.payload_bytes = 0;
        self.finished = false;
        Ok(())
    }

    /// Start a forward session.
    pub fn begin(&mut self, flow: Flow) -> Result<(), XfrmError> {
        let direction = match flow {
            Flow::Write => Direction::Encrypt,
            Flow::Read => Direction::Decrypt,
            Flow::Backward => return Err(ContractViolation::OutOfSequence { operation: "begin", state: "backward" }.into()),
        };
        self.reset(flow)?;
        if let Some(stage) = self.deflate.as_mut() {
            match flow {
                Flow::Write => stage.begin_encode(self.compression_padding)?,
                _ => stage.begin_decode(self.compression_padding)?,
            }
        }
        if let Some(keys) = &self.keys {
            let mut op = CipherOperation::new(Arc::clone(keys), direction);
            op.init(0, 0)?;
            self.cipher = Some(op);
        }
        self.flow = Some(flow);
        Ok(())
    }

    /// Start a backward read over `payload_len` bytes of uncompressed payload.
    pub fn begin_backward(&mut self, payload_len: u64) -> Result<(), XfrmError> {
        if self.deflate.is_some() {
            return Err(ContractViolation::OutOfSequence { operation: "move_to_end", state: "compressed" }.into());
        }
        self.reset(Flow::Backward)?;
        if let Some(keys) = &self.keys {
            let mut op = ReverseCipherOperation::new(Arc::clone(keys));
            op.init(payload_len)?;
            self.rcipher = Some(op);
        }
        self.flow = Some(Flow::Backward);
        Ok(())
    }

    fn expect(&self, flow: Flow, operation: &'static str) -> Result<(), XfrmError> {
        match self.flow {
            Some(active) if active == flow => Ok(()),
            Some(active) => Err(ContractViolation::OutOfSequence { operation, state: active.name() }.into()),
            None => Err(ContractViolation::OutOfSequence { operation, state: "idle" }.into()),
        }
    }

    /// Push plaintext through the write stages. Whole alignment blocks are
    /// handed to `sink` as they fill; everything left is flushed once the
    /// last stage reports `Done`.
    pub fn write<S>(&mut self, input: &mut InputCursor<'_>, mut sink: S) -> Result<Progress, XfrmError>
    where
        S: FnMut(&[u8]) -> Result<(), XfrmError>,
    {
        self.expect(Flow::Write, "write")?;
        if self.finished {
            if input.remaining() > 0 {
                return Err(ContractViolation::OutOfSequence { operation: "write", state: "stream finished" }.into());
            }
            return Ok(Progress::Done);
        }
        loop {
            let before = input.consumed();
            let first = match (self.deflate.as_mut(), self.cipher.as_mut()) {
                (Some(d), Some(_)) => produce(d, self.mid.as_mut().ok_or_else(missing_mid)?, input)?,
                (Some(d), None) => produce(d, &mut self.disk, input)?,
                (None, Some(c)) => produce(c, &mut self.disk, input)?,
                (None, None) => produce(&mut Passthrough, &mut self.disk, input)?,
            };
            let taken = &input.consumed_bytes()[before..];
            self.data_crc.update(taken);
            self.data_bytes += taken.len() as u64;

            let second = match (self.cipher.as_mut(), self.mid.as_mut()) {
                (Some(c), Some(mid)) => Some(transfer(c, mid, &mut self.disk)?),
                _ => None,
            };
            let last = second.unwrap_or(first);

            if last == Progress::Done {
                self.drain(true, &mut sink)?;
                self.finished = true;
                return Ok(Progress::Done);
            }
            if self.disk.writable_space() < self.disk.alignment() {
                self.drain(false, &mut sink)?;
            }
            if first == Progress::NeedInput && second.map_or(true, |p| p == Progress::NeedInput) {
                return Ok(Progress::NeedInput);
            }
        }
    }

    /// Finish a write session: end-of-stream through every stage, then
    /// flush. Safe to call after the caller already sent end-of-stream.
    pub fn finish_write<S>(&mut self, sink: S) -> Result<(), XfrmError>
    where
        S: FnMut(&[u8]) -> Result<(), XfrmError>,
    {
        let mut last = InputCursor::last(&[]);
        match self.write(&mut last, sink)? {
            Progress::Done => Ok(()),
            _ => Err(stalled("finish_write")),
        }
    }

    fn drain<S>(&mut self, all: bool, sink: &mut S) -> Result<(), XfrmError>
    where
        S: FnMut(&[u8]) -> Result<(), XfrmError>,
    {
        let align = self.disk.alignment();
        let ready = self.disk.readable_size();
        let n = if all { ready } else { ready - ready % align };
        if n > 0 {
            let mut src = self.disk.input_cursor()?;
            let bytes = &src.as_slice()[..n];
            sink(bytes)?;
            self.file_crc.update(bytes);
            self.payload_bytes += n as u64;
            src.advance(n)?;
            let state = src.state();
            self.disk.commit_read(state)?;
        }
        self.disk.compact(align)?;
        Ok(())
    }

    /// Top up the disk buffer from `source`, which fills the front of the
    /// slice it is given and reports whether the payload is exhausted.
    fn fill<S>(&mut self, source: &mut S) -> Result<usize, XfrmError>
    where
        S: FnMut(&mut [u8]) -> Result<(usize, bool), XfrmError>,
    {
        if self.disk.is_end_of_stream() {
            return Ok(0);
        }
        make_room(&mut self.disk)?;
        let mut dst = self.disk.output_cursor()?;
        let space = dst.space_mut();
        let (n, last) = source(space)?;
        if n > space.len() {
            return Err(ContractViolation::AdvanceOverrun { requested: n, remaining: space.len() }.into());
        }
        self.file_crc.update(&space[..n]);
        self.payload_bytes += n as u64;
        dst.advance(n)?;
        if last {
            dst.mark_end_of_stream();
        }
        let state = dst.state();
        self.disk.commit_write(state)?;
        Ok(n)
    }

    fn levels(&self) -> (usize, usize) {
        (self.disk.readable_size(), self.mid.as_ref().map_or(0, StagingBuffer::readable_size))
    }

    /// Pull payload from `source` through the read stages into `out`.
    /// `Done` comes on a call that produces nothing; the call delivering
    /// the last bytes reports `OutputFull`.
    pub fn read<S>(&mut self, out: &mut OutputCursor<'_>, mut source: S) -> Result<Progress, XfrmError>
    where
        S: FnMut(&mut [u8]) -> Result<(usize, bool), XfrmError>,
    {
        self.expect(Flow::Read, "read")?;
        if self.finished {
            out.mark_end_of_stream();
            return Ok(Progress::Done);
        }
        let mut idle_rounds = 0;
        loop {
            let filled = self.fill(&mut source)?;
            let levels = self.levels();
            // The last stage writes into a view of the caller's space so its
            // end-of-stream mark stays here until a call that produces nothing.
            let mut view = OutputCursor::new(out.space_mut());
            let progress = match (self.cipher.as_mut(), self.deflate.as_mut()) {
                (Some(c), Some(d)) => {
                    let mid = self.mid.as_mut().ok_or_else(missing_mid)?;
                    transfer(c, &mut self.disk, mid)?;
                    consume(d, mid, &mut view)?
                }
                (Some(c), None) => consume(c, &mut self.disk, &mut view)?,
                (None, Some(d)) => consume(d, &mut self.disk, &mut view)?,
                (None, None) => consume(&mut Passthrough, &mut self.disk, &mut view)?,
            };
            let produced = view.produced();
            self.data_crc.update(view.produced_bytes());
            self.data_bytes += produced as u64;
            out.advance(produced)?;
            let moved = filled > 0 || produced > 0 || self.levels() != levels;

            match progress {
                Progress::Done => {
                    self.finished = true;
                    if produced > 0 {
                        return Ok(Progress::OutputFull);
                    }
                    out.mark_end_of_stream();
                    return Ok(Progress::Done);
                }
                Progress::OutputFull => return Ok(Progress::OutputFull),
                Progress::NeedInput if moved => idle_rounds = 0,
                Progress::NeedInput => {
                    idle_rounds += 1;
                    if idle_rounds > 2 {
                        return Err(stalled("read"));
                    }
                }
            }
        }
    }

    /// Pull payload backward from `source` into `out`. `source` fills the
    /// tail of the slice it is given with the bytes just below those it
    /// delivered last.
    pub fn read_backward<S>(&mut self, out: &mut ReverseOutputCursor<'_>, mut source: S) -> Result<Progress, XfrmError>
    where
        S: FnMut(&mut [u8]) -> Result<(usize, bool), XfrmError>,
    {
        self.expect(Flow::Backward, "read_backward")?;
        if self.finished {
            out.mark_end_of_stream();
            return Ok(Progress::Done);
        }
        let mut idle_rounds = 0;
        loop {
            let mut filled = 0;
            if !self.disk.is_end_of_stream() {
                make_room(&mut self.disk)?;
                let mut dst = self.disk.reverse_output_cursor()?;
                let space = dst.space_mut();
                let (n, last) = source(space)?;
                if n > space.len() {
                    return Err(ContractViolation::AdvanceOverrun { requested: n, remaining: space.len() }.into());
                }
                dst.advance(n)?;
                if last {
                    dst.mark_end_of_stream();
                }
                let state = dst.state();
                self.disk.commit_write(state)?;
                self.payload_bytes += n as u64;
                filled = n;
            }

            let before = out.produced();
            let mut src = self.disk.reverse_input_cursor()?;
            let progress = match self.rcipher.as_mut() {
                Some(op) => op.transform(out, &mut src)?,
                None => src.copy_into(out),
            };
            let state = src.state();
            self.disk.commit_read(state)?;
            let produced = out.produced() - before;
            self.data_bytes += produced as u64;

            match progress {
                Progress::Done => {
                    self.finished = true;
                    return Ok(Progress::Done);
                }
                Progress::OutputFull => return Ok(Progress::OutputFull),
                Progress::NeedInput if filled > 0 || produced > 0 || state.moved > 0 => idle_rounds = 0,
                Progress::NeedInput => {
                    idle_rounds += 1;
                    if idle_rounds > 2 {
                        return Err(stalled("read_backward"));
                    }
                }
            }
        }
    }

    /// Close the stages of a finished session.
    pub fn end(&mut self) -> Result<(), XfrmError> {
        let flow = self.flow.take();
        if flow.is_none() {
            return Err(ContractViolation::OutOfSequence { operation: "end", state: "idle" }.into());
        }
        let deflate = match self.deflate.as_mut() {
            Some(stage) if stage.is_active() => stage.end().map_err(XfrmError::from),
            _ => Ok(()),
        };
        let cipher = match self.cipher.take() {
            Some(mut op) => op.end().map_err(XfrmError::from),
            None => Ok(()),
        };
        let reverse = match self.rcipher.take() {
            Some(mut op) => op.end().map_err(XfrmError::from),
            None => Ok(()),
        };
        deflate.and(cipher).and(reverse)
    }

    /// Drop in-flight state without any checks.
    pub fn abort(&mut self) {
        self.flow = None;
        if let Some(stage) = self.deflate.as_mut() {
            if stage.is_active() {
                // The arena is reset with the session; nothing to report.
                let _ = stage.end();
            }
        }
        if let Some(mut op) = self.cipher.take() {
            op.abort();
        }
        if let Some(mut op) = self.rcipher.take() {
            op.abort();
        }
    }

    pub fn keys(&self) -> Option<&Arc<KeyContext>> {
        self.keys.as_ref()
    }
}
