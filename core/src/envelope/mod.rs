//! envelope/mod.rs
//! On-disk framing around the transformed payload.
//!
//! Two generations live side by side:
//! - `legacy`: constant header, compression only, 12-byte trailer.
//! - `header` / `trailer`: the extensible envelope carrying flags, sizes,
//!   checksums and key material, written in either byte order.

pub mod types;
pub mod codec;
pub mod legacy;
pub mod header;
pub mod trailer;

pub use types::*;
pub use codec::{Endian, FieldReader, FieldWriter};
pub use header::{XfrmHeader, FIXED_HEADER_SIZE};
pub use legacy::{LegacyTrailer, LEGACY_HEADER};
pub use trailer::{XfrmTrailer, FIXED_TRAILER_SIZE};

/// Identify the envelope at the start of a file. Legacy detection runs
/// first since its magic is a plain prefix.
pub fn detect_format(bytes: &[u8]) -> (EnvelopeFormat, Detect) {
    match legacy::detect(bytes) {
        Detect::Yes => return (EnvelopeFormat::Legacy, Detect::Yes),
        Detect::NeedMoreBytes => return (EnvelopeFormat::Unknown, Detect::NeedMoreBytes),
        Detect::No => {}
    }
    match header::detect(bytes) {
        Detect::Yes => (EnvelopeFormat::Extensible, Detect::Yes),
        Detect::NeedMoreBytes => (EnvelopeFormat::Unknown, Detect::NeedMoreBytes),
        Detect::No => (EnvelopeFormat::Raw, Detect::No),
    }
}
