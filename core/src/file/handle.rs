//! file/handle.rs
//! The raw file underneath a transformed file.
//!
//! The orchestrator only needs positional, blocking, whole-buffer I/O plus
//! size control. Two implementations:
//! - `OsFile`: a std `File` behind a lock, interrupted calls retried.
//! - `MemoryFile`: a shared in-memory byte vector for tests and tools.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::constants::DEFAULT_FILE_BLOCK_SIZE;

/// Positional access to one underlying file.
///
/// All methods take `&self` so page-level callers on different threads can
/// share a handle; implementations serialize internally.
pub trait FileHandle: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. A short count means end of
    /// file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data` at `offset`, growing the file if needed.
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    fn size(&self) -> io::Result<u64>;

    /// Grow to `new_size`, zero filling. Never shrinks.
    fn extend(&self, new_size: u64) -> io::Result<()>;

    fn truncate(&self, new_size: u64) -> io::Result<()>;

    fn sync(&self) -> io::Result<()>;

    /// Preferred I/O block size.
    fn block_size(&self) -> u32 {
        DEFAULT_FILE_BLOCK_SIZE
    }
}

impl<T: FileHandle + ?Sized> FileHandle for Arc<T> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, data)
    }

    fn size(&self) -> io::Result<u64> {
        (**self).size()
    }

    fn extend(&self, new_size: u64) -> io::Result<()> {
        (**self).extend(new_size)
    }

    fn truncate(&self, new_size: u64) -> io::Result<()> {
        (**self).truncate(new_size)
    }

    fn sync(&self) -> io::Result<()> {
        (**self).sync()
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }
}

/// Read exactly `buf.len()` bytes at `offset`; a short read is an error.
pub fn read_exact_at<F: FileHandle + ?Sized>(file: &F, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let n = file.read_at(offset, buf)?;
    if n != buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read at {offset}: wanted {} bytes, got {n}", buf.len()),
        ));
    }
    Ok(())
}

#[derive(Debug)]
pub struct OsFile {
    path: PathBuf,
    file: Mutex<File>,
    block_size: u32,
}

impl OsFile {
    /// Create a new file. Fails with `AlreadyExists` if the path is taken.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        Ok(Self::wrap(path, file))
    }

    /// Open an existing file for reading and writing.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::wrap(path, file))
    }

    pub fn open_read_only(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self::wrap(path, file))
    }

    fn wrap(path: &Path, file: File) -> Self {
        Self { path: path.to_path_buf(), file: Mutex::new(file), block_size: DEFAULT_FILE_BLOCK_SIZE }
    }

    /// Set the I/O block size. `size` must be a non-zero multiple of `align`.
    pub fn set_block_size_and_alignment(&mut self, size: u32, align: u32) -> io::Result<()> {
        if size == 0 || align == 0 || size % align != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block size {size} is not a multiple of alignment {align}"),
            ));
        }
        self.block_size = size;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileHandle for OsFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut done = 0;
        while done < buf.len() {
            match file.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        // write_all already retries on Interrupted.
        file.write_all(data)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn extend(&self, new_size: u64) -> io::Result<()> {
        let file = self.file.lock();
        if file.metadata()?.len() < new_size {
            file.set_len(new_size)?;
        }
        Ok(())
    }

    fn truncate(&self, new_size: u64) -> io::Result<()> {
        self.file.lock().set_len(new_size)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }
}

/// In-memory file. Clones share the same bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryFile {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemoryFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data: Arc::new(RwLock::new(data)) }
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Mutate the bytes in place, e.g. to inject corruption in tests.
    pub fn modify<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.data.write())
    }
}

impl FileHandle for MemoryFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.read();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn extend(&self, new_size: u64) -> io::Result<()> {
        let mut data = self.data.write();
        if (data.len() as u64) < new_size {
            data.resize(new_size as usize, 0);
        }
        Ok(())
    }

    fn truncate(&self, new_size: u64) -> io::Result<()> {
        self.data.write().truncate(new_size as usize);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}
