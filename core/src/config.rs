//! config.rs
//! Tunables shared by every file opened through this layer, and the
//! per-file creation options.
//!
//! `XfrmConfig` is plain data (serde, JSON-loadable). `CreateOptions` is a
//! builder that is resolved against a config into a concrete plan before a
//! single byte is written.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::constants::{
    AES_BLOCK_SIZE, DEFAULT_AUTO_WRAPPED_KEYS, DEFAULT_BUFFER_ALIGNMENT, DEFAULT_BUFFER_SIZE,
    DEFAULT_DEFLATE_LEVEL, DEFAULT_FILE_BLOCK_SIZE, DEFAULT_KDF_ITER_COUNT, DEFAULT_XTS_DATA_UNIT,
    MAX_FILE_BLOCK_SIZE, MAX_HEADER_OCTETS, MAX_KEY_PAIRS, MIN_DEFLATE_ARENA,
};
use crate::crypto::KeyError;
use crate::envelope::header::key_material_size_for;
use crate::envelope::{
    ChecksumKind, CipherKind, CompressionMethod, Endian, EnvelopeFormat, KeyMethod, KeySelection, PaddingKind,
    Presence, XfrmFlags,
};
use crate::types::XfrmError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XfrmConfig {
    /// Capacity of each staging buffer.
    pub buffer_size: usize,
    /// Alignment of staging buffers and of intermediate file writes.
    pub buffer_alignment: usize,
    /// File block size recorded in new extensible envelopes.
    pub file_block_size: u32,
    pub kdf_iter_count: u32,
    /// Data unit used for XTS when the caller does not pick one.
    pub xts_data_unit_size: u32,
    pub deflate_level: u32,
    /// Scratch region bound to the compression stage.
    pub arena_size: usize,
    /// Byte order of envelopes written by this process.
    pub byte_order: Endian,
    /// Pairs generated for key-wrap files created with an automatic count.
    pub auto_key_count: u32,
}

impl Default for XfrmConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_alignment: DEFAULT_BUFFER_ALIGNMENT,
            file_block_size: DEFAULT_FILE_BLOCK_SIZE,
            kdf_iter_count: DEFAULT_KDF_ITER_COUNT,
            xts_data_unit_size: DEFAULT_XTS_DATA_UNIT,
            deflate_level: DEFAULT_DEFLATE_LEVEL,
            arena_size: MIN_DEFLATE_ARENA,
            byte_order: Endian::native(),
            auto_key_count: DEFAULT_AUTO_WRAPPED_KEYS,
        }
    }
}

impl XfrmConfig {
    pub fn from_json_str(s: &str) -> Result<Self, XfrmError> {
        let cfg: Self = serde_json::from_str(s).map_err(|e| XfrmError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json_string(&self) -> Result<String, XfrmError> {
        serde_json::to_string_pretty(self).map_err(|e| XfrmError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), XfrmError> {
        let a = self.buffer_alignment;
        if a == 0 || !a.is_power_of_two() {
            return Err(XfrmError::Config(format!("buffer alignment {a} is not a power of two")));
        }
        if self.buffer_size < 2 * a || self.buffer_size % a != 0 {
            return Err(XfrmError::Config(format!(
                "buffer size {} must be a multiple of {a} and hold at least two blocks",
                self.buffer_size
            )));
        }
        check_file_block_size(self.file_block_size)?;
        if self.kdf_iter_count == 0 {
            return Err(XfrmError::Config("KDF iteration count must be non-zero".into()));
        }
        if self.xts_data_unit_size == 0 || self.xts_data_unit_size as usize % AES_BLOCK_SIZE != 0 {
            return Err(XfrmError::Config(format!(
                "XTS data unit {} must be a non-zero multiple of {AES_BLOCK_SIZE}",
                self.xts_data_unit_size
            )));
        }
        if self.deflate_level > 9 {
            return Err(XfrmError::Config(format!("deflate level {} out of range", self.deflate_level)));
        }
        if self.arena_size < MIN_DEFLATE_ARENA {
            return Err(XfrmError::Config(format!(
                "arena size {} below the {MIN_DEFLATE_ARENA}-byte minimum",
                self.arena_size
            )));
        }
        if self.auto_key_count == 0 || self.auto_key_count as usize > MAX_KEY_PAIRS {
            return Err(XfrmError::Config(format!("auto key count {} out of range", self.auto_key_count)));
        }
        Ok(())
    }
}

fn check_file_block_size(size: u32) -> Result<(), XfrmError> {
    if size % 8 != 0 || size > MAX_FILE_BLOCK_SIZE {
        return Err(XfrmError::Config(format!(
            "file block size {size} must be a multiple of 8 and at most {MAX_FILE_BLOCK_SIZE}"
        )));
    }
    Ok(())
}

/// Number of (key, IV) pairs to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyCount {
    /// One pair for PBKDF2, the configured count for key wrap.
    #[default]
    Auto,
    Exact(u32),
}

/// Options for a new transformed file.
#[derive(Clone, Default)]
pub struct CreateOptions {
    compress: bool,
    password: Option<Zeroizing<Vec<u8>>>,
    cipher: Option<CipherKind>,
    key_count: KeyCount,
    key_selection: Option<KeySelection>,
    key_method: Option<KeyMethod>,
    data_unit_size: Option<u32>,
    file_block_size: Option<u32>,
    kdf_iter_count: Option<u32>,
    declared_data_size: Option<u64>,
    extensible: bool,
}

impl std::fmt::Debug for CreateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateOptions")
            .field("compress", &self.compress)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("cipher", &self.cipher)
            .field("key_count", &self.key_count)
            .field("key_selection", &self.key_selection)
            .field("key_method", &self.key_method)
            .field("data_unit_size", &self.data_unit_size)
            .field("file_block_size", &self.file_block_size)
            .field("declared_data_size", &self.declared_data_size)
            .field("extensible", &self.extensible)
            .finish()
    }
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compress(mut self, on: bool) -> Self {
        self.compress = on;
        self
    }

    pub fn password(mut self, password: impl AsRef<[u8]>) -> Self {
        self.password = Some(Zeroizing::new(password.as_ref().to_vec()));
        self
    }

    pub fn cipher(mut self, cipher: CipherKind) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn key_count(mut self, count: KeyCount) -> Self {
        self.key_count = count;
        self
    }

    pub fn key_selection(mut self, selection: KeySelection) -> Self {
        self.key_selection = Some(selection);
        self
    }

    pub fn key_method(mut self, method: KeyMethod) -> Self {
        self.key_method = Some(method);
        self
    }

    pub fn data_unit_size(mut self, size: u32) -> Self {
        self.data_unit_size = Some(size);
        self
    }

    pub fn file_block_size(mut self, size: u32) -> Self {
        self.file_block_size = Some(size);
        self
    }

    pub fn kdf_iter_count(mut self, iterations: u32) -> Self {
        self.kdf_iter_count = Some(iterations);
        self
    }

    /// Fix the payload size up front. The file is pre-extended and closed
    /// with a provisional trailer at create time.
    pub fn declared_data_size(mut self, size: u64) -> Self {
        self.declared_data_size = Some(size);
        self
    }

    /// Write the extensible envelope even when neither encryption nor a
    /// declared size requires it.
    pub fn extensible(mut self, on: bool) -> Self {
        self.extensible = on;
        self
    }

    pub(crate) fn has_declared_size(&self) -> bool {
        self.declared_data_size.is_some()
    }

    pub(crate) fn password_bytes(&self) -> Option<&[u8]> {
        self.password.as_ref().map(|p| p.as_slice())
    }

    /// Turn the options into concrete envelope parameters.
    pub(crate) fn resolve(&self, cfg: &XfrmConfig) -> Result<CreatePlan, XfrmError> {
        let encrypt = self.password.is_some();
        let cipher = match (encrypt, self.cipher) {
            (false, None | Some(CipherKind::None)) => CipherKind::None,
            (false, Some(_)) => return Err(KeyError::MissingPassword.into()),
            (true, None) => CipherKind::Cbc,
            (true, Some(CipherKind::None)) => {
                return Err(XfrmError::Config("password given without a cipher".into()));
            }
            (true, Some(c)) => c,
        };

        if let Some(size) = self.declared_data_size {
            if self.compress {
                return Err(XfrmError::Config("a declared data size needs uncompressed data".into()));
            }
            if encrypt && size % AES_BLOCK_SIZE as u64 != 0 {
                return Err(XfrmError::Config(format!(
                    "declared size {size} of an encrypted file must be a multiple of {AES_BLOCK_SIZE}"
                )));
            }
        }

        let format = if encrypt || self.declared_data_size.is_some() || self.extensible {
            EnvelopeFormat::Extensible
        } else if self.compress {
            EnvelopeFormat::Legacy
        } else {
            EnvelopeFormat::Raw
        };

        let file_block_size = self.file_block_size.unwrap_or(cfg.file_block_size);
        check_file_block_size(file_block_size)?;
        let kdf_iter_count = self.kdf_iter_count.unwrap_or(cfg.kdf_iter_count);

        let mut flags = XfrmFlags {
            file_checksum: ChecksumKind::Crc32,
            data_checksum: ChecksumKind::Crc32,
            ..XfrmFlags::default()
        };
        if self.compress {
            flags.compression = CompressionMethod::Deflate;
        }
        let mut key_count = 0usize;
        let mut data_unit_size = 0u32;

        if encrypt {
            if kdf_iter_count == 0 {
                return Err(KeyError::ZeroIterations.into());
            }
            let method = self.key_method.unwrap_or(KeyMethod::AesKeyWrap256);
            if method == KeyMethod::None {
                return Err(XfrmError::Config("encryption needs a key reconstruction method".into()));
            }
            flags.cipher = cipher;
            flags.key_method = method;

            // Every encrypted payload is a whole number of cipher blocks:
            // the compressor pads for XTS, the cipher pads otherwise.
            if self.declared_data_size.is_none() {
                if cipher == CipherKind::Xts && self.compress {
                    flags.compression_padding = PaddingKind::Pkcs;
                } else {
                    flags.cipher_padding = PaddingKind::Pkcs;
                }
            }

            key_count = match self.key_count {
                KeyCount::Exact(n) => n as usize,
                KeyCount::Auto if method == KeyMethod::AesKeyWrap256 => cfg.auto_key_count as usize,
                KeyCount::Auto => 1,
            };
            if key_count == 0 {
                return Err(KeyError::NoPairs.into());
            }
            let material = key_material_size_for(cipher, method, key_count);
            if key_count > MAX_KEY_PAIRS || material > MAX_HEADER_OCTETS {
                return Err(KeyError::TooManyPairs { requested: key_count, max: max_pairs(cipher, method) }.into());
            }
            flags.key_selection = self
                .key_selection
                .unwrap_or(if key_count > 1 { KeySelection::MixedPair } else { KeySelection::Same });

            data_unit_size = self.data_unit_size.unwrap_or(match cipher {
                CipherKind::Xts => cfg.xts_data_unit_size,
                _ => 0,
            });
            if data_unit_size as usize % AES_BLOCK_SIZE != 0 || (cipher == CipherKind::Xts && data_unit_size == 0) {
                return Err(XfrmError::Config(format!("invalid data unit size {data_unit_size}")));
            }
        } else if self.key_count != KeyCount::Auto || self.key_method.is_some() || self.key_selection.is_some() {
            return Err(KeyError::MissingPassword.into());
        }

        // Declared-size files are written page by page, so no running
        // checksum can describe them.
        if self.declared_data_size.is_some() {
            flags.presence.insert(Presence::DATA_SIZE_IN_HEADER);
            flags.file_checksum = ChecksumKind::None;
            flags.data_checksum = ChecksumKind::None;
        }

        Ok(CreatePlan {
            format,
            flags,
            key_count,
            data_unit_size,
            file_block_size,
            kdf_iter_count: if encrypt { kdf_iter_count } else { 0 },
            declared_data_size: self.declared_data_size,
        })
    }
}

/// Largest pair count whose key material fits the header octets.
fn max_pairs(cipher: CipherKind, method: KeyMethod) -> usize {
    (1..=MAX_KEY_PAIRS)
        .rev()
        .find(|&n| key_material_size_for(cipher, method, n) <= MAX_HEADER_OCTETS)
        .unwrap_or(0)
}

/// Concrete parameters for a new file.
#[derive(Debug, Clone)]
pub(crate) struct CreatePlan {
    pub format: EnvelopeFormat,
    pub flags: XfrmFlags,
    pub key_count: usize,
    pub data_unit_size: u32,
    pub file_block_size: u32,
    pub kdf_iter_count: u32,
    pub declared_data_size: Option<u64>,
}
