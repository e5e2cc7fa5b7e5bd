//! file/stream.rs
//! `std::io` adapters over non-seekable byte streams.
//!
//! - `XfrmWriter` produces a complete file into any `Write`. Payload leaves
//!   in whole staging blocks; the trailer goes out on `finish`.
//! - `XfrmReader` consumes a complete file from any `Read`. It holds back
//!   enough bytes to cover the largest trailer, parses the trailer at end
//!   of input and verifies it when the payload is exhausted.

use std::io::{self, Read, Write};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::{ContractViolation, InputCursor, OutputCursor, Progress, ReverseInputCursor};
use crate::config::{CreateOptions, XfrmConfig};
use crate::constants::{LEGACY_HEADER_SIZE, LEGACY_SCAN_WINDOW};
use crate::envelope::{
    detect_format, legacy, ChecksumKind, EnvelopeFormat, FormatError, LegacyTrailer, PaddingKind, XfrmFlags,
    XfrmHeader, XfrmTrailer,
};
use crate::file::handle::FileHandle;
use crate::file::pipeline::{Flow, Pipeline};
use crate::file::xfrm_file::{missing_trailer, reconstruct_keys, EnvelopeInfo, Expected, XfrmFile};
use crate::types::XfrmError;

const READ_CHUNK: usize = 8 * 1024;
const PROBE_SIZE: usize = 24;

fn unsupported(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, format!("sequential stream cannot {what}"))
}

struct SeqState<W> {
    inner: W,
    pos: u64,
}

/// A `FileHandle` over a plain writer. Only in-order writes are accepted.
pub struct SeqWriter<W> {
    state: Mutex<SeqState<W>>,
}

impl<W: Write + Send> SeqWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { state: Mutex::new(SeqState { inner, pos: 0 }) }
    }

    pub fn into_inner(self) -> W {
        self.state.into_inner().inner
    }
}

impl<W: Write + Send> FileHandle for SeqWriter<W> {
    fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> io::Result<usize> {
        Err(unsupported("read"))
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut st = self.state.lock();
        if offset != st.pos {
            return Err(unsupported("seek"));
        }
        st.inner.write_all(data)?;
        st.pos += data.len() as u64;
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.state.lock().pos)
    }

    fn extend(&self, new_size: u64) -> io::Result<()> {
        if new_size > self.state.lock().pos {
            return Err(unsupported("extend"));
        }
        Ok(())
    }

    fn truncate(&self, _new_size: u64) -> io::Result<()> {
        Err(unsupported("truncate"))
    }

    fn sync(&self) -> io::Result<()> {
        self.state.lock().inner.flush()
    }
}

/// Writes a transformed file into `W`.
pub struct XfrmWriter<W: Write + Send> {
    file: Option<XfrmFile<SeqWriter<W>>>,
}

impl<W: Write + Send> XfrmWriter<W> {
    pub fn new(inner: W, opts: &CreateOptions, cfg: XfrmConfig) -> Result<Self, XfrmError> {
        if opts.has_declared_size() {
            return Err(XfrmError::Config("a declared data size needs a seekable file".into()));
        }
        let file = XfrmFile::create(SeqWriter::new(inner), opts, cfg)?;
        Ok(Self { file: Some(file) })
    }

    pub fn info(&self) -> Option<&EnvelopeInfo> {
        self.file.as_ref().map(XfrmFile::envelope_info)
    }

    /// Flush the payload, write the trailer and hand back the writer.
    pub fn finish(mut self) -> Result<W, XfrmError> {
        let mut file = self
            .file
            .take()
            .ok_or(ContractViolation::OutOfSequence { operation: "finish", state: "closed" })?;
        file.close(false)?;
        Ok(file.into_inner().into_inner())
    }
}

impl<W: Write + Send> Write for XfrmWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "writer already finished"))?;
        let mut input = InputCursor::new(buf);
        file.write_forward(&mut input)?;
        Ok(input.consumed())
    }

    /// Payload leaves in whole blocks; a partial block stays staged until
    /// more data or `finish`.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: Write + Send> Drop for XfrmWriter<W> {
    fn drop(&mut self) {
        if let Some(mut file) = self.file.take() {
            warn!("transformed writer dropped before finish; output has no trailer");
            // Abort never fails once the file is open.
            let _ = file.close(true);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TrailerLayout {
    None,
    Legacy,
    Extensible { flags: XfrmFlags, max: u32, declared: Option<u64> },
}

/// Read-ahead that keeps the possible trailer out of the payload.
struct Tail<R> {
    inner: R,
    held: Vec<u8>,
    eof: bool,
    reserve: usize,
    layout: TrailerLayout,
    /// Set once end of input is seen and the trailer is cut off `held`.
    parsed: bool,
    expected: Option<Expected>,
}

impl<R: Read> Tail<R> {
    fn top_up(&mut self, want: usize) -> io::Result<()> {
        while !self.eof && self.held.len() < want {
            let old = self.held.len();
            self.held.resize(old + (want - old).max(READ_CHUNK), 0);
            match self.inner.read(&mut self.held[old..]) {
                Ok(0) => {
                    self.held.truncate(old);
                    self.eof = true;
                }
                Ok(n) => self.held.truncate(old + n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.held.truncate(old),
                Err(e) => {
                    self.held.truncate(old);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn parse_trailer(&mut self) -> Result<(), XfrmError> {
        let mut cursor = ReverseInputCursor::last(&self.held);
        let (size, expected) = match self.layout {
            TrailerLayout::None => (0, None),
            TrailerLayout::Legacy => {
                let t = LegacyTrailer::read(&mut cursor)?;
                let expected = Expected {
                    data_size: t.data_size.into(),
                    data_checksum: Some(t.data_checksum),
                    file_checksum: None,
                };
                (cursor.consumed(), Some(expected))
            }
            TrailerLayout::Extensible { flags, max, declared } => {
                let t = XfrmTrailer::read(&mut cursor).map_err(missing_trailer)?;
                t.validate(&flags, max)?;
                if let Some(declared) = declared {
                    if declared != t.data_size {
                        return Err(FormatError::DataSizeMismatch { declared, actual: t.data_size }.into());
                    }
                }
                let expected = Expected {
                    data_size: t.data_size,
                    data_checksum: (flags.data_checksum == ChecksumKind::Crc32).then_some(t.data_checksum),
                    file_checksum: (flags.file_checksum == ChecksumKind::Crc32).then_some(t.file_checksum),
                };
                (t.trailer_size as usize, Some(expected))
            }
        };
        let payload = self.held.len() - size;
        self.held.truncate(payload);
        self.expected = expected;
        self.parsed = true;
        debug!("trailer of {size} bytes parsed; {payload} payload bytes still buffered");
        Ok(())
    }

    /// Pipeline source: payload bytes into the front of `space`.
    fn fill(&mut self, space: &mut [u8]) -> Result<(usize, bool), XfrmError> {
        if !self.parsed {
            self.top_up(self.reserve + space.len())?;
            if self.eof {
                self.parse_trailer()?;
            }
        }
        let available = if self.parsed { self.held.len() } else { self.held.len() - self.reserve };
        let n = space.len().min(available);
        space[..n].copy_from_slice(&self.held[..n]);
        self.held.drain(..n);
        Ok((n, self.parsed && self.held.is_empty()))
    }
}

/// Reads the plaintext of a transformed file from `R`.
pub struct XfrmReader<R: Read> {
    tail: Tail<R>,
    info: EnvelopeInfo,
    pipeline: Pipeline,
    done: bool,
}

impl<R: Read> std::fmt::Debug for XfrmReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XfrmReader")
            .field("info", &self.info)
            .field("pipeline", &self.pipeline)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<R: Read> XfrmReader<R> {
    /// Parse the envelope at the front of `inner` and rebuild its keys.
    pub fn new(inner: R, password: Option<&[u8]>, cfg: XfrmConfig) -> Result<Self, XfrmError> {
        cfg.validate()?;
        let mut tail = Tail {
            inner,
            held: Vec::new(),
            eof: false,
            reserve: 0,
            layout: TrailerLayout::None,
            parsed: false,
            expected: None,
        };
        tail.top_up(PROBE_SIZE)?;
        let (format, _) = detect_format(&tail.held);

        let (info, keys) = match format {
            EnvelopeFormat::Legacy => {
                tail.top_up(LEGACY_HEADER_SIZE)?;
                if tail.held.len() < LEGACY_HEADER_SIZE {
                    return Err(FormatError::Truncated {
                        what: "legacy header",
                        need: LEGACY_HEADER_SIZE,
                        have: tail.held.len(),
                    }
                    .into());
                }
                legacy::read_header(&mut InputCursor::new(&tail.held))?;
                tail.held.drain(..LEGACY_HEADER_SIZE);
                tail.reserve = LEGACY_SCAN_WINDOW;
                tail.layout = TrailerLayout::Legacy;
                (EnvelopeInfo::legacy(), None)
            }
            EnvelopeFormat::Extensible => {
                let size = XfrmHeader::peek_size(&tail.held)?;
                tail.top_up(size)?;
                if tail.held.len() < size {
                    return Err(FormatError::Truncated { what: "header", need: size, have: tail.held.len() }.into());
                }
                let header = XfrmHeader::read(&mut InputCursor::new(&tail.held))?;
                tail.held.drain(..size);
                let keys = reconstruct_keys(&header, password)?;
                tail.reserve = header.trailer_max_size as usize;
                tail.layout = TrailerLayout::Extensible {
                    flags: header.flags,
                    max: header.trailer_max_size,
                    declared: header.declared_data_size(),
                };
                (EnvelopeInfo::extensible(&header), keys)
            }
            _ => (EnvelopeInfo::raw(None), None),
        };

        let flags = info.flags;
        let mut pipeline =
            Pipeline::new(&cfg, flags.is_compressed(), flags.compression_padding == PaddingKind::Pkcs, keys)?;
        pipeline.begin(Flow::Read)?;
        debug!("stream reader over {:?} envelope", info.format);
        Ok(Self { tail, info, pipeline, done: false })
    }

    pub fn info(&self) -> &EnvelopeInfo {
        &self.info
    }

    /// Plaintext bytes produced so far.
    pub fn data_bytes(&self) -> u64 {
        self.pipeline.data_bytes()
    }

    fn finish(&mut self) -> Result<(), XfrmError> {
        self.done = true;
        self.pipeline.end()?;
        if let Some(expected) = &self.tail.expected {
            expected.verify(&self.pipeline)?;
        }
        debug!("stream reader verified {} bytes", self.pipeline.data_bytes());
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.tail.inner
    }
}

impl<R: Read> Read for XfrmReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.done {
            return Ok(0);
        }
        let mut out = OutputCursor::new(buf);
        let tail = &mut self.tail;
        let progress = self.pipeline.read(&mut out, |space| tail.fill(space))?;
        let n = out.produced();
        if progress == Progress::Done {
            self.finish()?;
        }
        Ok(n)
    }
}
