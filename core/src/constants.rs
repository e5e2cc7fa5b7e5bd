/// Legacy envelope: header magic prefix.
pub const LEGACY_MAGIC: [u8; 4] = *b"AZ31";
/// Legacy envelope: fixed header size.
pub const LEGACY_HEADER_SIZE: usize = 512;
/// Legacy envelope: tag closing the 12-byte trailer.
pub const LEGACY_TRAILER_TAG: [u8; 4] = *b"DBDN";
pub const LEGACY_TRAILER_SIZE: usize = 12;
/// Legacy files always end on this boundary.
pub const LEGACY_BLOCK_SIZE: usize = 512;
/// Bytes read from end of file when scanning for the legacy trailer.
pub const LEGACY_SCAN_WINDOW: usize = 1024;

/// Extensible envelope: header magic.
pub const XFRM_HEADER_MAGIC: [u8; 8] = *b"NDBXFRM1";
/// Extensible envelope: trailer magic (last 8 bytes of the file).
pub const XFRM_TRAILER_MAGIC: [u8; 8] = *b"DNMRFXBN";
/// Endianness marker as written by the producer in its chosen byte order.
pub const ENDIAN_MARKER: u64 = 0xFEDC_BA98_7654_3210;
/// Largest variable region (extra octets plus padding) a header may carry.
pub const MAX_HEADER_OCTETS: usize = 32_000;

/// Whitelisted debug stamps written into the header.
pub const KNOWN_HEADER_STAMPS: &[u32] = &[0, 1];
pub const KNOWN_LIBRARY_STAMPS: &[u32] = &[0, 1];
pub const HEADER_STAMP: u32 = 1;
pub const LIBRARY_STAMP: u32 = 1;
/// Writer version recorded for diagnostics only.
pub const WRITER_VERSION: u32 = 0x0001_0000;

/// Staging buffer defaults.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_BUFFER_ALIGNMENT: usize = 512;
pub const DEFAULT_FILE_BLOCK_SIZE: u32 = 512;
/// Largest file block size an envelope may declare.
pub const MAX_FILE_BLOCK_SIZE: u32 = 32 * 1024;

/// Cipher parameters.
pub const AES_BLOCK_SIZE: usize = 16;
pub const CBC_KEY_LEN: usize = 32;
pub const XTS_KEY_LEN: usize = 64;
pub const IV_LEN: usize = 16;
pub const MAX_KEY_LEN: usize = XTS_KEY_LEN;
pub const SALT_LEN: usize = 32;
pub const MAX_KEY_PAIRS: usize = 512;
pub const DEFAULT_XTS_DATA_UNIT: u32 = 512;
pub const DEFAULT_KDF_ITER_COUNT: u32 = 100_000;
pub const DEFAULT_AUTO_WRAPPED_KEYS: u32 = 32;
/// Extra bytes an AES key-wrap blob carries over its plaintext.
pub const KEY_WRAP_OVERHEAD: usize = 8;

/// Compression parameters.
pub const DEFAULT_DEFLATE_LEVEL: u32 = 6;
/// Minimum region the deflate stage accepts as working memory.
pub const MIN_DEFLATE_ARENA: usize = 275 * 1024;
pub const DEFLATE_ENCODE_WORKSET: usize = 268 * 1024;
pub const DEFLATE_DECODE_WORKSET: usize = 44 * 1024;
