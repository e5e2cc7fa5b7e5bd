//! file/pages.rs
//! Page-addressed access to uncompressed files.
//!
//! Positions are payload offsets and must sit on a random-access block
//! boundary (the cipher data unit, or the file's I/O block when the
//! payload is stored in the clear). Transforms run in place in the
//! caller's buffer and never touch the streaming session.

use std::sync::Arc;

use crate::buffer::ContractViolation;
use crate::crypto::{CipherOperation, Direction};
use crate::envelope::FormatError;
use crate::file::handle::{read_exact_at, FileHandle};
use crate::file::xfrm_file::{FileMode, XfrmFile};
use crate::types::XfrmError;

impl<F: FileHandle> XfrmFile<F> {
    fn check_pages(&self, position: u64, len: usize) -> Result<(), XfrmError> {
        if self.is_poisoned() {
            return Err(ContractViolation::Poisoned.into());
        }
        if self.is_compressed() {
            return Err(FormatError::Unsupported("page access to compressed data".into()).into());
        }
        let block = u64::from(self.random_access_block_size());
        if block == 0 {
            return Err(FormatError::Unsupported("file has no random-access unit".into()).into());
        }
        if position % block != 0 {
            return Err(FormatError::Misaligned { what: "page position", value: position, align: block }.into());
        }
        if len as u64 % block != 0 {
            return Err(FormatError::Misaligned { what: "page length", value: len as u64, align: block }.into());
        }
        Ok(())
    }

    fn check_range(&self, position: u64, len: usize) -> Result<(), XfrmError> {
        let payload = self.payload_end - self.payload_start;
        let end = position + len as u64;
        if end > payload {
            return Err(FormatError::SizeOutOfBounds { what: "page range", value: end, max: payload }.into());
        }
        Ok(())
    }

    /// A standalone cipher operation over this file's keys, for callers
    /// that transform many pages with [`Self::transform_pages_with`].
    /// `None` for unencrypted files.
    pub fn page_operation(&self, direction: Direction) -> Option<CipherOperation> {
        self.pipeline.keys().map(|keys| CipherOperation::new(Arc::clone(keys), direction))
    }

    /// Encrypt whole pages at payload offset `position` in place.
    pub fn transform_pages(&self, position: u64, pages: &mut [u8]) -> Result<(), XfrmError> {
        self.check_pages(position, pages.len())?;
        if let Some(mut op) = self.page_operation(Direction::Encrypt) {
            op.process_in_place(position, pages)?;
        }
        Ok(())
    }

    /// Decrypt whole pages at payload offset `position` in place.
    pub fn untransform_pages(&self, position: u64, pages: &mut [u8]) -> Result<(), XfrmError> {
        self.check_pages(position, pages.len())?;
        if let Some(mut op) = self.page_operation(Direction::Decrypt) {
            op.process_in_place(position, pages)?;
        }
        Ok(())
    }

    /// Like [`Self::transform_pages`] / [`Self::untransform_pages`], with a
    /// caller-owned operation whose direction decides which.
    pub fn transform_pages_with(
        &self,
        op: &mut CipherOperation,
        position: u64,
        pages: &mut [u8],
    ) -> Result<(), XfrmError> {
        self.check_pages(position, pages.len())?;
        match self.pipeline.keys() {
            Some(keys) if Arc::ptr_eq(keys, op.context()) => Ok(op.process_in_place(position, pages)?),
            Some(_) => Err(FormatError::Inconsistent("cipher operation belongs to another file".into()).into()),
            None => Ok(()),
        }
    }

    /// Read and untransform whole pages of payload.
    pub fn read_pages_at(&self, position: u64, pages: &mut [u8]) -> Result<(), XfrmError> {
        self.check_pages(position, pages.len())?;
        self.check_range(position, pages.len())?;
        read_exact_at(&self.file, self.payload_start + position, pages)?;
        self.untransform_pages(position, pages)
    }

    /// Transform whole pages in place, then write them into the payload.
    /// On return `pages` holds the stored form.
    pub fn write_pages_at(&self, position: u64, pages: &mut [u8]) -> Result<(), XfrmError> {
        if !self.writable {
            return Err(ContractViolation::OutOfSequence { operation: "write_pages_at", state: "read-only" }.into());
        }
        if self.mode() != FileMode::Idle {
            return Err(ContractViolation::OutOfSequence { operation: "write_pages_at", state: "streaming" }.into());
        }
        self.check_pages(position, pages.len())?;
        self.check_range(position, pages.len())?;
        self.transform_pages(position, pages)?;
        self.file.write_at(self.payload_start + position, pages)?;
        Ok(())
    }
}
