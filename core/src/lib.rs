//! xfrm-core
//!
//! Transformed-file I/O: payloads compressed and/or encrypted on their way
//! to disk, framed by a legacy or an extensible envelope.
//! Pure Rust, no FFI.

#![forbid(unsafe_code)]

// Shared and top level
pub mod constants;
pub mod types;
pub mod utils;
pub mod config;

// Building blocks
pub mod buffer;
pub mod envelope;
pub mod compression;
pub mod crypto;

// Orchestration
pub mod file;

// -----------------------------------------------------------------------------
// Prelude (Rust users)
// -----------------------------------------------------------------------------
pub mod prelude {
    pub use crate::buffer::{InputCursor, OutputCursor, Progress, ReverseInputCursor, ReverseOutputCursor};
    pub use crate::config::{CreateOptions, KeyCount, XfrmConfig};
    pub use crate::envelope::{CipherKind, EnvelopeFormat, KeyMethod, KeySelection};
    pub use crate::file::{
        FileHandle, FileMode, MemoryFile, OpenOutcome, OsFile, XfrmFile, XfrmReader, XfrmWriter,
    };
    pub use crate::types::XfrmError;
}
