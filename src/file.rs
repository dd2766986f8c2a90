//! Raw block access to the file the cache belongs to.

use std::io;
use std::sync::{Mutex, PoisonError};

/// Byte-addressed block transfer used for chunk images and direct I/O.
pub trait FileDriver: Send + Sync {
    /// Fill `buf` from the file starting at `addr`.
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write all of `buf` to the file starting at `addr`.
    fn write_at(&self, addr: u64, buf: &[u8]) -> io::Result<()>;
}

/// A file held entirely in memory.
#[derive(Debug, Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u64 {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileDriver for MemFile {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = addr as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read of [{start}, {end}) past end of file ({})", data.len()),
            ));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, addr: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = addr as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(unix)]
impl FileDriver for std::fs::File {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(self, buf, addr)
    }

    fn write_at(&self, addr: u64, buf: &[u8]) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, buf, addr)
    }
}
