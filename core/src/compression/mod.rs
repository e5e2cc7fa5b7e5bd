//! compression/mod.rs
//! Streaming DEFLATE stage over cursors, backed by a LIFO scratch arena.

pub mod types;
pub mod arena;
pub mod deflate;

pub use types::*;
pub use arena::{ArenaBlock, ScratchArena};
pub use deflate::DeflateStage;
