//! file/mod.rs
//! The file orchestrator and its I/O surfaces.
//!
//! - `handle`: positional access to the underlying file.
//! - `pipeline`: stage wiring between caller cursors and payload bytes.
//! - `xfrm_file`: create/open, streaming sessions, close and verification.
//! - `pages`: page-addressed transforms for uncompressed files.
//! - `stream`: `std::io::Read` / `Write` adapters over sequential streams.

pub mod handle;
pub(crate) mod pipeline;
pub mod xfrm_file;
pub mod pages;
pub mod stream;

pub use handle::{read_exact_at, FileHandle, MemoryFile, OsFile};
pub use stream::{SeqWriter, XfrmReader, XfrmWriter};
pub use xfrm_file::{EnvelopeInfo, FileMode, NearMiss, OpenOutcome, XfrmFile};
