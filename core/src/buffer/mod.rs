//! buffer/mod.rs
//! Cursors and the staging buffer every transform stage runs against.

pub mod types;
pub mod cursor;
pub mod staging;

pub use types::*;
pub use cursor::*;
pub use staging::*;
