//! file/xfrm_file.rs
//! A transformed file: envelope, payload stages and the raw file under
//! them.
//!
//! Lifecycle:
//! - `create` writes the header (and, for a declared size, a provisional
//!   trailer) before any payload.
//! - `open` detects the envelope, reads header and trailer, and rebuilds
//!   the keys. A password problem is reported as a near miss that still
//!   carries the envelope description. A header with no trailer behind it
//!   opens as a raw file.
//! - Streaming calls start a session lazily; a session runs in one
//!   direction until `close`.
//! - `close(false)` finishes the session and verifies (read) or records
//!   (write) sizes and checksums. `close(true)` drops everything.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::buffer::{ContractViolation, InputCursor, OutputCursor, Progress, ReverseInputCursor, ReverseOutputCursor};
use crate::config::{CreateOptions, CreatePlan, XfrmConfig};
use crate::constants::{
    AES_BLOCK_SIZE, LEGACY_BLOCK_SIZE, LEGACY_HEADER_SIZE, LEGACY_SCAN_WINDOW, LEGACY_TRAILER_SIZE, SALT_LEN,
};
use crate::crypto::{KeyContext, KeyError};
use crate::envelope::{
    detect_format, legacy, ChecksumKind, CompressionMethod, Endian, EnvelopeFormat, FormatError, KeyMethod,
    LegacyTrailer, PaddingKind, XfrmFlags, XfrmHeader, XfrmTrailer,
};
use crate::file::handle::{read_exact_at, FileHandle};
use crate::file::pipeline::{Flow, Pipeline};
use crate::types::XfrmError;
use crate::utils::round_up_u64;

/// Trailers are staged in a small stack buffer; block padding beyond it
/// spills into a heap buffer.
const TRAILER_STAGE: usize = 256;

/// Bytes probed at offset 0 to identify the envelope.
const PROBE_SIZE: usize = 24;

/// Everything the envelope says about a file, known without any key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeInfo {
    pub format: EnvelopeFormat,
    pub flags: XfrmFlags,
    pub byte_order: Option<Endian>,
    pub header_size: u64,
    pub trailer_size: u64,
    pub file_block_size: u32,
    pub data_unit_size: u32,
    pub kdf_iter_count: u32,
    pub key_material_count: u32,
    /// Plaintext size, when recorded or declared.
    pub data_size: Option<u64>,
    pub data_checksum: Option<u32>,
    pub file_checksum: Option<u32>,
}

impl EnvelopeInfo {
    pub(crate) fn raw(size: Option<u64>) -> Self {
        Self {
            format: EnvelopeFormat::Raw,
            flags: XfrmFlags::default(),
            byte_order: None,
            header_size: 0,
            trailer_size: 0,
            file_block_size: 0,
            data_unit_size: 0,
            kdf_iter_count: 0,
            key_material_count: 0,
            data_size: size,
            data_checksum: None,
            file_checksum: None,
        }
    }

    pub(crate) fn legacy() -> Self {
        Self {
            format: EnvelopeFormat::Legacy,
            flags: legacy_flags(),
            header_size: LEGACY_HEADER_SIZE as u64,
            file_block_size: LEGACY_BLOCK_SIZE as u32,
            ..Self::raw(None)
        }
    }

    pub(crate) fn extensible(header: &XfrmHeader) -> Self {
        Self {
            format: EnvelopeFormat::Extensible,
            flags: header.flags,
            byte_order: Some(header.order),
            header_size: header.header_size.into(),
            trailer_size: 0,
            file_block_size: header.file_block_size,
            data_unit_size: header.data_unit_size,
            kdf_iter_count: header.kdf_iter_count,
            key_material_count: header.key_material_count,
            data_size: header.declared_data_size(),
            data_checksum: None,
            file_checksum: None,
        }
    }
}

/// What a legacy envelope implies, expressed as extensible flags.
pub(crate) fn legacy_flags() -> XfrmFlags {
    XfrmFlags {
        data_checksum: ChecksumKind::Crc32,
        compression: CompressionMethod::Deflate,
        ..XfrmFlags::default()
    }
}

/// File is in the right format but the keys could not be rebuilt.
pub struct NearMiss<F> {
    pub info: EnvelopeInfo,
    pub reason: KeyError,
    /// The untouched handle, for a retry with another password.
    pub file: F,
}

impl<F> fmt::Debug for NearMiss<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NearMiss").field("info", &self.info).field("reason", &self.reason).finish()
    }
}

pub enum OpenOutcome<F: FileHandle> {
    Ready(XfrmFile<F>),
    NearMiss(NearMiss<F>),
}

impl<F: FileHandle> fmt::Debug for OpenOutcome<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenOutcome::Ready(file) => f.debug_tuple("Ready").field(file).finish(),
            OpenOutcome::NearMiss(miss) => f.debug_tuple("NearMiss").field(miss).finish(),
        }
    }
}

impl<F: FileHandle> OpenOutcome<F> {
    pub fn is_near_miss(&self) -> bool {
        matches!(self, OpenOutcome::NearMiss(_))
    }

    pub fn info(&self) -> &EnvelopeInfo {
        match self {
            OpenOutcome::Ready(file) => file.envelope_info(),
            OpenOutcome::NearMiss(miss) => &miss.info,
        }
    }

    /// The open file, or the near-miss reason as an error.
    pub fn into_ready(self) -> Result<XfrmFile<F>, XfrmError> {
        match self {
            OpenOutcome::Ready(file) => Ok(file),
            OpenOutcome::NearMiss(miss) => Err(miss.reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Idle,
    WritingForward,
    ReadingForward,
    ReadingBackward,
    Closed,
}

impl FileMode {
    fn name(self) -> &'static str {
        match self {
            FileMode::Idle => "idle",
            FileMode::WritingForward => "writing forward",
            FileMode::ReadingForward => "reading forward",
            FileMode::ReadingBackward => "reading backward",
            FileMode::Closed => "closed",
        }
    }
}

/// Values the trailer recorded, checked once a read session completes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Expected {
    pub data_size: u64,
    pub data_checksum: Option<u32>,
    pub file_checksum: Option<u32>,
}

impl Expected {
    /// Compare a finished read session against the recorded values.
    pub(crate) fn verify(&self, pipeline: &Pipeline) -> Result<(), XfrmError> {
        let seen = pipeline.data_bytes();
        if self.data_size != seen {
            return Err(FormatError::DataSizeMismatch { declared: self.data_size, actual: seen }.into());
        }
        if let Some(want) = self.data_checksum {
            let got = pipeline.data_checksum();
            if want != got {
                warn!("data checksum mismatch: recorded {want:08x}, computed {got:08x}");
                return Err(FormatError::ChecksumMismatch { what: "data", expected: want, actual: got }.into());
            }
        }
        if let Some(want) = self.file_checksum {
            let got = pipeline.file_checksum();
            if want != got {
                warn!("file checksum mismatch: recorded {want:08x}, computed {got:08x}");
                return Err(FormatError::ChecksumMismatch { what: "file", expected: want, actual: got }.into());
            }
        }
        Ok(())
    }
}

pub struct XfrmFile<F: FileHandle> {
    pub(super) file: F,
    pub(super) info: EnvelopeInfo,
    header: Option<XfrmHeader>,
    pub(super) pipeline: Pipeline,
    mode: FileMode,
    pub(super) writable: bool,
    poisoned: bool,
    pub(super) payload_start: u64,
    /// End of payload. For a file being written without a declared size
    /// this trails the last flushed byte.
    pub(super) payload_end: u64,
    file_pos: u64,
    expected: Option<Expected>,
}

impl<F: FileHandle> fmt::Debug for XfrmFile<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XfrmFile")
            .field("info", &self.info)
            .field("mode", &self.mode)
            .field("writable", &self.writable)
            .field("poisoned", &self.poisoned)
            .field("payload", &(self.payload_start..self.payload_end))
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

/// Rebuild the key context an extensible header describes. `Ok(None)` for
/// unencrypted files.
pub(crate) fn reconstruct_keys(
    header: &XfrmHeader,
    password: Option<&[u8]>,
) -> Result<Option<Arc<KeyContext>>, XfrmError> {
    let f = &header.flags;
    if !f.is_encrypted() {
        return Ok(None);
    }
    let password = password.ok_or(KeyError::MissingPassword)?;
    let mut ctx = KeyContext::new(f.cipher, f.key_selection, f.cipher_padding == PaddingKind::Pkcs, header.data_unit_size)?;
    let material = header.key_material();
    let count = header.key_material_count as usize;
    match f.key_method {
        KeyMethod::Pbkdf2Sha256 => {
            if material.len() != count * SALT_LEN {
                return Err(KeyError::BadKeyMaterial { expected: count * SALT_LEN, actual: material.len() }.into());
            }
            for salt in material.chunks_exact(SALT_LEN) {
                ctx.derive_key_iv(password, header.kdf_iter_count, salt)?;
            }
        }
        KeyMethod::AesKeyWrap256 => {
            if material.len() < SALT_LEN {
                return Err(KeyError::BadKeyMaterial { expected: SALT_LEN, actual: material.len() }.into());
            }
            let (salt, blob) = material.split_at(SALT_LEN);
            ctx.unwrap_keys(blob, count, password, header.kdf_iter_count, salt)?;
        }
        KeyMethod::None => return Err(KeyError::NoCipher.into()),
    }
    Ok(Some(Arc::new(ctx)))
}

/// Create fresh key material for a new file and record it in `header`.
pub(crate) fn generate_keys(
    plan: &CreatePlan,
    password: &[u8],
    header: &mut XfrmHeader,
) -> Result<Arc<KeyContext>, XfrmError> {
    let f = plan.flags;
    let mut ctx = KeyContext::new(f.cipher, f.key_selection, f.cipher_padding == PaddingKind::Pkcs, plan.data_unit_size)?;
    let iterations = plan.kdf_iter_count;
    let octets = match f.key_method {
        KeyMethod::Pbkdf2Sha256 => {
            let mut salts = Vec::with_capacity(plan.key_count * SALT_LEN);
            for _ in 0..plan.key_count {
                let salt = KeyContext::generate_salt();
                ctx.derive_key_iv(password, iterations, &salt)?;
                salts.extend_from_slice(&salt);
            }
            salts
        }
        KeyMethod::AesKeyWrap256 => {
            let salt = KeyContext::generate_salt();
            for _ in 0..plan.key_count {
                ctx.generate_random_key_iv()?;
            }
            let blob = ctx.wrap_keys(password, iterations, &salt)?;
            let mut octets = Vec::with_capacity(SALT_LEN + blob.len());
            octets.extend_from_slice(&salt);
            octets.extend_from_slice(&blob);
            octets
        }
        KeyMethod::None => return Err(KeyError::NoCipher.into()),
    };
    header.kdf_iter_count = iterations;
    header.data_unit_size = plan.data_unit_size;
    header.key_material_size = octets.len() as u32;
    header.key_material_count = plan.key_count as u32;
    header.key_material_position = 0;
    header.set_octets(octets)?;
    Ok(Arc::new(ctx))
}

/// Trailer read failures that mean "there is no trailer here".
pub(crate) fn missing_trailer(e: FormatError) -> FormatError {
    match e {
        FormatError::BadMagic { .. } | FormatError::Truncated { .. } | FormatError::BadEndianMarker { .. } => {
            FormatError::MissingTrailer
        }
        other => other,
    }
}

impl<F: FileHandle> XfrmFile<F> {
    fn assemble(
        file: F,
        cfg: &XfrmConfig,
        info: EnvelopeInfo,
        header: Option<XfrmHeader>,
        keys: Option<Arc<KeyContext>>,
        payload: Range<u64>,
        writable: bool,
    ) -> Result<Self, XfrmError> {
        let compressed = info.flags.is_compressed();
        let compression_padding = info.flags.compression_padding == PaddingKind::Pkcs;
        let pipeline = Pipeline::new(cfg, compressed, compression_padding, keys)?;
        Ok(Self {
            file,
            info,
            header,
            pipeline,
            mode: FileMode::Idle,
            writable,
            poisoned: false,
            payload_start: payload.start,
            payload_end: payload.end,
            file_pos: payload.start,
            expected: None,
        })
    }

    /// Write a new envelope into the empty `file`.
    pub fn create(file: F, opts: &CreateOptions, cfg: XfrmConfig) -> Result<Self, XfrmError> {
        cfg.validate()?;
        let plan = opts.resolve(&cfg)?;
        let existing = file.size()?;
        if existing != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("cannot create over {existing} existing bytes"),
            )
            .into());
        }

        let (info, header, keys) = match plan.format {
            EnvelopeFormat::Legacy => {
                let mut buf = [0u8; LEGACY_HEADER_SIZE];
                legacy::write_header(&mut OutputCursor::new(&mut buf))?;
                file.write_at(0, &buf)?;
                (EnvelopeInfo::legacy(), None, None)
            }
            EnvelopeFormat::Extensible => {
                let mut header = XfrmHeader::new(cfg.byte_order, plan.flags, plan.file_block_size);
                let keys = match opts.password_bytes() {
                    Some(password) if plan.flags.is_encrypted() => Some(generate_keys(&plan, password, &mut header)?),
                    _ => None,
                };
                if let Some(size) = plan.declared_data_size {
                    header.declare_data_size(size);
                }
                let mut buf = vec![0u8; header.header_size as usize];
                header.write(&mut OutputCursor::new(&mut buf))?;
                file.write_at(0, &buf)?;
                (EnvelopeInfo::extensible(&header), Some(header), keys)
            }
            _ => (EnvelopeInfo::raw(None), None, None),
        };

        let start = info.header_size;
        let end = start + plan.declared_data_size.unwrap_or(0);
        let mut xf = Self::assemble(file, &cfg, info, header, keys, start..end, true)?;

        if let Some(size) = plan.declared_data_size {
            xf.file.extend(end)?;
            let trailer_size = xf.write_trailer(end, size, 0, 0)?;
            xf.info.trailer_size = trailer_size;
            xf.file.sync()?;
        }
        info!(
            "created {:?} file: compressed={} cipher={:?} header={} declared={:?}",
            xf.info.format,
            xf.info.flags.is_compressed(),
            xf.info.flags.cipher,
            xf.info.header_size,
            plan.declared_data_size
        );
        Ok(xf)
    }

    /// Open an existing file for reading. Files without a known envelope,
    /// or with a header but no trailer, are read as raw bytes.
    pub fn open(file: F, password: Option<&[u8]>, cfg: XfrmConfig) -> Result<OpenOutcome<F>, XfrmError> {
        cfg.validate()?;
        let size = file.size()?;
        let mut probe = [0u8; PROBE_SIZE];
        let n = file.read_at(0, &mut probe)?;
        let (format, _) = detect_format(&probe[..n]);
        debug!("open: {size} bytes, detected {format:?}");
        match format {
            EnvelopeFormat::Legacy => Self::open_legacy(file, size, &cfg).map(OpenOutcome::Ready),
            EnvelopeFormat::Extensible => Self::open_extensible(file, size, password, &cfg),
            _ => Self::assemble(file, &cfg, EnvelopeInfo::raw(Some(size)), None, None, 0..size, false)
                .map(OpenOutcome::Ready),
        }
    }

    fn open_legacy(file: F, size: u64, cfg: &XfrmConfig) -> Result<Self, XfrmError> {
        let mut head = [0u8; LEGACY_HEADER_SIZE];
        if size < head.len() as u64 {
            return Err(FormatError::Truncated { what: "legacy header", need: head.len(), have: size as usize }.into());
        }
        read_exact_at(&file, 0, &mut head)?;
        legacy::read_header(&mut InputCursor::new(&head))?;

        let body = size - LEGACY_HEADER_SIZE as u64;
        let window_len = body.min(LEGACY_SCAN_WINDOW as u64) as usize;
        let mut window = vec![0u8; window_len];
        read_exact_at(&file, size - window_len as u64, &mut window)?;
        let mut tail = ReverseInputCursor::last(&window);
        // The legacy trailer has no size field to check a damaged one
        // against: anything short of a clean parse means there is none.
        let trailer = match LegacyTrailer::read(&mut tail) {
            Ok(trailer) => trailer,
            Err(e) => {
                debug!("open: legacy trailer not found ({e})");
                return Self::open_as_raw(file, size, cfg, EnvelopeFormat::Legacy);
            }
        };
        let trailer_size = tail.consumed() as u64;

        let mut info = EnvelopeInfo::legacy();
        info.trailer_size = trailer_size;
        info.data_size = Some(trailer.data_size.into());
        info.data_checksum = Some(trailer.data_checksum);
        let start = LEGACY_HEADER_SIZE as u64;
        let mut xf = Self::assemble(file, cfg, info, None, None, start..size - trailer_size, false)?;
        xf.expected = Some(Expected {
            data_size: trailer.data_size.into(),
            data_checksum: Some(trailer.data_checksum),
            file_checksum: None,
        });
        Ok(xf)
    }

    /// A header whose trailer never got written (an aborted or killed
    /// writer): the whole file is handed out as raw bytes.
    fn open_as_raw(file: F, size: u64, cfg: &XfrmConfig, found: EnvelopeFormat) -> Result<Self, XfrmError> {
        warn!("open: {found:?} header without a valid trailer; reading all {size} bytes as raw");
        Self::assemble(file, cfg, EnvelopeInfo::raw(Some(size)), None, None, 0..size, false)
    }

    fn open_extensible(
        file: F,
        size: u64,
        password: Option<&[u8]>,
        cfg: &XfrmConfig,
    ) -> Result<OpenOutcome<F>, XfrmError> {
        let mut fixed = [0u8; PROBE_SIZE];
        if size < fixed.len() as u64 {
            return Err(FormatError::Truncated { what: "header", need: fixed.len(), have: size as usize }.into());
        }
        read_exact_at(&file, 0, &mut fixed)?;
        let header_size = XfrmHeader::peek_size(&fixed)?;
        if header_size as u64 > size {
            return Err(FormatError::Truncated { what: "header", need: header_size, have: size as usize }.into());
        }
        let mut buf = vec![0u8; header_size];
        read_exact_at(&file, 0, &mut buf)?;
        let header = XfrmHeader::read(&mut InputCursor::new(&buf))?;

        let body = size - header_size as u64;
        let block = u64::from(header.file_block_size.max(8));
        let window_len = round_up_u64(header.trailer_max_size.into(), block).min(body) as usize;
        let mut window = vec![0u8; window_len];
        read_exact_at(&file, size - window_len as u64, &mut window)?;
        let trailer = match XfrmTrailer::read(&mut ReverseInputCursor::last(&window)).map_err(missing_trailer) {
            Ok(trailer) => trailer,
            Err(FormatError::MissingTrailer) => {
                return Self::open_as_raw(file, size, cfg, EnvelopeFormat::Extensible).map(OpenOutcome::Ready);
            }
            Err(e) => return Err(e.into()),
        };
        trailer.validate(&header.flags, header.trailer_max_size)?;

        let payload = header_size as u64..size - u64::from(trailer.trailer_size);
        if let Some(declared) = header.declared_data_size() {
            if declared != trailer.data_size {
                return Err(FormatError::DataSizeMismatch { declared, actual: trailer.data_size }.into());
            }
        }
        let payload_len = payload.end - payload.start;
        if header.flags.is_encrypted() && payload_len % AES_BLOCK_SIZE as u64 != 0 {
            return Err(crate::crypto::CryptoError::Unaligned { len: payload_len }.into());
        }

        let flags = header.flags;
        let expected = Expected {
            data_size: trailer.data_size,
            data_checksum: (flags.data_checksum == ChecksumKind::Crc32).then_some(trailer.data_checksum),
            file_checksum: (flags.file_checksum == ChecksumKind::Crc32).then_some(trailer.file_checksum),
        };
        let mut info = EnvelopeInfo::extensible(&header);
        info.trailer_size = trailer.trailer_size.into();
        info.data_size = Some(trailer.data_size);
        info.data_checksum = expected.data_checksum;
        info.file_checksum = expected.file_checksum;

        let keys = match reconstruct_keys(&header, password) {
            Ok(keys) => keys,
            Err(XfrmError::Key(reason @ (KeyError::MissingPassword | KeyError::UnwrapFailed))) => {
                warn!("open: keys unavailable ({reason}); returning near miss");
                return Ok(OpenOutcome::NearMiss(NearMiss { info, reason, file }));
            }
            Err(e) => return Err(e),
        };
        let mut xf = Self::assemble(file, cfg, info, Some(header), keys, payload, false)?;
        xf.expected = Some(expected);
        Ok(OpenOutcome::Ready(xf))
    }

    // ---- session plumbing ----

    fn check_live(&self, operation: &'static str) -> Result<(), XfrmError> {
        if self.poisoned {
            return Err(ContractViolation::Poisoned.into());
        }
        if self.mode == FileMode::Closed {
            return Err(ContractViolation::OutOfSequence { operation, state: "closed" }.into());
        }
        Ok(())
    }

    fn out_of_sequence(&self, operation: &'static str) -> XfrmError {
        ContractViolation::OutOfSequence { operation, state: self.mode.name() }.into()
    }

    /// Contract violations halt the file for good.
    fn guard<T>(&mut self, result: Result<T, XfrmError>) -> Result<T, XfrmError> {
        if let Err(e) = &result {
            if e.is_contract_violation() && !self.poisoned {
                warn!("halting file after contract violation: {e}");
                self.poisoned = true;
                self.pipeline.abort();
            }
        }
        result
    }

    fn begin(&mut self, flow: Flow) -> Result<(), XfrmError> {
        let r = self.pipeline.begin(flow);
        self.guard(r)?;
        self.file_pos = self.payload_start;
        self.mode = match flow {
            Flow::Write => FileMode::WritingForward,
            _ => FileMode::ReadingForward,
        };
        debug!("{} session started at {}", self.mode.name(), self.file_pos);
        Ok(())
    }

    /// Push plaintext into the file. An input cursor marked end-of-stream
    /// finishes the payload.
    pub fn write_forward(&mut self, input: &mut InputCursor<'_>) -> Result<Progress, XfrmError> {
        self.check_live("write_forward")?;
        if !self.writable {
            return Err(ContractViolation::OutOfSequence { operation: "write_forward", state: "read-only" }.into());
        }
        match self.mode {
            FileMode::Idle => self.begin(Flow::Write)?,
            FileMode::WritingForward => {}
            _ => return Err(self.out_of_sequence("write_forward")),
        }
        if let Some(declared) = self.declared_size() {
            let total = self.pipeline.data_bytes() + input.remaining() as u64;
            if total > declared {
                return Err(FormatError::DataSizeMismatch { declared, actual: total }.into());
            }
        }
        let (file, pos) = (&self.file, &mut self.file_pos);
        let r = self.pipeline.write(input, |bytes| {
            file.write_at(*pos, bytes)?;
            *pos += bytes.len() as u64;
            Ok(())
        });
        self.guard(r)
    }

    /// Pull plaintext out of the file. `Done` marks the end of data, and
    /// `out` is then marked end-of-stream.
    pub fn read_forward(&mut self, out: &mut OutputCursor<'_>) -> Result<Progress, XfrmError> {
        self.check_live("read_forward")?;
        if self.writable {
            return Err(ContractViolation::OutOfSequence { operation: "read_forward", state: "write-only" }.into());
        }
        match self.mode {
            FileMode::Idle => self.begin(Flow::Read)?,
            FileMode::ReadingForward => {}
            _ => return Err(self.out_of_sequence("read_forward")),
        }
        let (file, pos, end) = (&self.file, &mut self.file_pos, self.payload_end);
        let r = self.pipeline.read(out, |space| {
            let n = (space.len() as u64).min(end - *pos) as usize;
            read_exact_at(file, *pos, &mut space[..n])?;
            *pos += n as u64;
            Ok((n, *pos == end))
        });
        self.guard(r)
    }

    /// Position a backward read at the end of the payload. Needs an
    /// uncompressed file.
    pub fn move_to_end(&mut self) -> Result<(), XfrmError> {
        self.check_live("move_to_end")?;
        if self.writable || self.mode != FileMode::Idle {
            return Err(self.out_of_sequence("move_to_end"));
        }
        if self.info.flags.is_compressed() {
            return Err(FormatError::Unsupported("backward reads of compressed data".into()).into());
        }
        let r = self.pipeline.begin_backward(self.payload_end - self.payload_start);
        self.guard(r)?;
        self.file_pos = self.payload_end;
        self.mode = FileMode::ReadingBackward;
        debug!("backward session started at {}", self.file_pos);
        Ok(())
    }

    /// Pull plaintext from the end toward the start. Bytes land in `out`
    /// in natural order, each call's bytes preceding those of the last.
    pub fn read_backward(&mut self, out: &mut ReverseOutputCursor<'_>) -> Result<Progress, XfrmError> {
        self.check_live("read_backward")?;
        if self.mode != FileMode::ReadingBackward {
            return Err(self.out_of_sequence("read_backward"));
        }
        let (file, pos, start) = (&self.file, &mut self.file_pos, self.payload_start);
        let r = self.pipeline.read_backward(out, |space| {
            let n = (space.len() as u64).min(*pos - start) as usize;
            let len = space.len();
            read_exact_at(file, *pos - n as u64, &mut space[len - n..])?;
            *pos -= n as u64;
            Ok((n, *pos == start))
        });
        self.guard(r)
    }

    /// End the file. With `abort` nothing is verified or written; otherwise
    /// a write session is finished and its trailer written, and a read
    /// session must have reached end of data and match the trailer.
    pub fn close(&mut self, abort: bool) -> Result<(), XfrmError> {
        if self.mode == FileMode::Closed {
            return Err(self.out_of_sequence("close"));
        }
        if abort || self.poisoned {
            self.pipeline.abort();
            self.mode = FileMode::Closed;
            debug!("closed without checks (abort={abort}, poisoned={})", self.poisoned);
            return if self.poisoned && !abort { Err(ContractViolation::Poisoned.into()) } else { Ok(()) };
        }
        let r = match self.mode {
            FileMode::Idle if self.writable && self.declared_size().is_some() => {
                // Page-written file: the provisional trailer stays.
                self.file.sync().map_err(XfrmError::from)
            }
            FileMode::Idle if self.writable => self.begin(Flow::Write).and_then(|_| self.finish_write()),
            FileMode::WritingForward => self.finish_write(),
            FileMode::ReadingForward => self.finish_read(),
            FileMode::ReadingBackward => self.finish_backward(),
            _ => Ok(()),
        };
        if r.is_err() {
            self.pipeline.abort();
        }
        self.mode = FileMode::Closed;
        r
    }

    fn declared_size(&self) -> Option<u64> {
        self.header.as_ref().and_then(XfrmHeader::declared_data_size)
    }

    fn finish_write(&mut self) -> Result<(), XfrmError> {
        let (file, pos) = (&self.file, &mut self.file_pos);
        self.pipeline.finish_write(|bytes| {
            file.write_at(*pos, bytes)?;
            *pos += bytes.len() as u64;
            Ok(())
        })?;
        self.pipeline.end()?;

        let data_size = self.pipeline.data_bytes();
        let payload_end = self.file_pos;
        if let Some(declared) = self.declared_size() {
            if data_size != declared {
                return Err(FormatError::DataSizeMismatch { declared, actual: data_size }.into());
            }
        }
        let flags = self.info.flags;
        let data_checksum = match flags.data_checksum {
            ChecksumKind::Crc32 => self.pipeline.data_checksum(),
            ChecksumKind::None => 0,
        };
        let file_checksum = match flags.file_checksum {
            ChecksumKind::Crc32 => self.pipeline.file_checksum(),
            ChecksumKind::None => 0,
        };
        let trailer_size = self.write_trailer(payload_end, data_size, data_checksum, file_checksum)?;
        self.file.sync()?;

        self.payload_end = payload_end;
        self.info.trailer_size = trailer_size;
        self.info.data_size = Some(data_size);
        self.info.data_checksum = (flags.data_checksum == ChecksumKind::Crc32).then_some(data_checksum);
        self.info.file_checksum = (flags.file_checksum == ChecksumKind::Crc32).then_some(file_checksum);
        info!(
            "closed after write: {data_size} data bytes, {} payload bytes, trailer {trailer_size}",
            payload_end - self.payload_start
        );
        Ok(())
    }

    /// Write the trailer that closes a payload ending at `offset`. Returns
    /// its size; raw files have none.
    fn write_trailer(
        &self,
        offset: u64,
        data_size: u64,
        data_checksum: u32,
        file_checksum: u32,
    ) -> Result<u64, XfrmError> {
        let max = match (&self.info.format, &self.header) {
            (EnvelopeFormat::Extensible, Some(header)) => header.trailer_max_size as usize,
            (EnvelopeFormat::Legacy, _) => LEGACY_TRAILER_SIZE + LEGACY_BLOCK_SIZE,
            _ => return Ok(0),
        };
        let mut head = [0u8; TRAILER_STAGE];
        let mut spill = vec![0u8; max.saturating_sub(TRAILER_STAGE)];
        let mut out = OutputCursor::new(&mut head);
        let mut extra = OutputCursor::new(&mut spill);

        let total = match &self.header {
            Some(header) => {
                let mut trailer = XfrmTrailer::new(header.order, header.flags);
                trailer.data_size = data_size;
                trailer.data_checksum = data_checksum;
                trailer.file_checksum = file_checksum;
                trailer.write(offset, header.file_block_size, &mut out, Some(&mut extra))?
            }
            None => {
                let data_size = u32::try_from(data_size).map_err(|_| FormatError::SizeOutOfBounds {
                    what: "legacy data size",
                    value: data_size,
                    max: u32::MAX.into(),
                })?;
                LegacyTrailer { data_checksum, data_size }.write(offset, &mut out, Some(&mut extra))?
            }
        };
        let (first, second) = (out.produced(), extra.produced());
        self.file.write_at(offset, &head[..first])?;
        if second > 0 {
            self.file.write_at(offset + first as u64, &spill[..second])?;
        }
        Ok(total as u64)
    }

    fn finish_read(&mut self) -> Result<(), XfrmError> {
        let seen = self.pipeline.data_bytes();
        if !self.pipeline.is_finished() {
            let declared = self.expected.map_or(self.payload_end - self.payload_start, |e| e.data_size);
            warn!("closing a partially read file: {seen} of {declared} bytes");
            return Err(FormatError::DataSizeMismatch { declared, actual: seen }.into());
        }
        self.pipeline.end()?;
        let payload = self.payload_end - self.payload_start;
        if self.pipeline.payload_bytes() != payload {
            return Err(FormatError::Inconsistent(format!(
                "payload ended after {} of {payload} bytes",
                self.pipeline.payload_bytes()
            ))
            .into());
        }
        if let Some(expected) = &self.expected {
            expected.verify(&self.pipeline)?;
        }
        debug!("closed after read: {seen} bytes verified");
        Ok(())
    }

    fn finish_backward(&mut self) -> Result<(), XfrmError> {
        let seen = self.pipeline.data_bytes();
        let declared = self.expected.map_or(self.payload_end - self.payload_start, |e| e.data_size);
        if !self.pipeline.is_finished() || seen != declared {
            return Err(FormatError::DataSizeMismatch { declared, actual: seen }.into());
        }
        self.pipeline.end()
    }

    // ---- accessors ----

    /// Plaintext size: recorded, declared, or written so far.
    pub fn data_size(&self) -> u64 {
        self.info.data_size.unwrap_or_else(|| self.pipeline.data_bytes())
    }

    pub fn file_size(&self) -> Result<u64, XfrmError> {
        Ok(self.file.size()?)
    }

    pub fn is_compressed(&self) -> bool {
        self.info.flags.is_compressed()
    }

    pub fn is_encrypted(&self) -> bool {
        self.info.flags.is_encrypted()
    }

    /// Granularity of page access in bytes; 0 when the file can only be
    /// streamed.
    pub fn random_access_block_size(&self) -> u32 {
        if self.is_compressed() {
            0
        } else if self.is_encrypted() {
            self.info.data_unit_size
        } else {
            self.file.block_size()
        }
    }

    /// Byte range of the payload inside the underlying file.
    pub fn payload_range(&self) -> Range<u64> {
        self.payload_start..self.payload_end
    }

    pub fn envelope_info(&self) -> &EnvelopeInfo {
        &self.info
    }

    pub fn header(&self) -> Option<&XfrmHeader> {
        self.header.as_ref()
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Give back the underlying handle. Any open session is dropped.
    pub fn into_inner(mut self) -> F {
        self.pipeline.abort();
        self.file
    }
}
