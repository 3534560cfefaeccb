//! Input byte stream abstraction.
//!
//! MPEG streams and custom files are pulled through this interface.
//! The engine drains every source once per output pass and closes it
//! immediately afterwards to bound the number of open descriptors, so
//! implementations must tolerate being reopened transparently on a
//! later pass.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::VcdResult;

/// A seekable, restartable byte stream
pub trait DataSource {
    /// Total size of the stream in bytes
    fn stat(&mut self) -> VcdResult<u64>;

    /// Position the stream at the absolute byte offset `offset`
    fn seek(&mut self, offset: u64) -> VcdResult<()>;

    /// Read up to `buf.len()` bytes at the current position. Returns
    /// the number of bytes actually read; a short count means end of
    /// stream. Callers pre-zero their buffers so a short tail read
    /// yields a zero-padded block.
    fn read(&mut self, buf: &mut [u8]) -> VcdResult<usize>;

    /// Release any resource held by the stream. Further `seek`/`read`
    /// calls must transparently reacquire it.
    fn close(&mut self);
}

/// A [`DataSource`] backed by a file on disk. The file handle is opened
/// lazily and dropped on `close`, so a disc holding many sources keeps
/// only the ones currently being drained open.
pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
    /// Seek position to restore when the file is transparently reopened
    pos: u64,
}

impl FileSource {
    /// Create a source reading from `path`. The file is not opened
    /// until the first access.
    pub fn new<P: AsRef<Path>>(path: P) -> FileSource {
        FileSource {
            path: path.as_ref().to_path_buf(),
            file: None,
            pos: 0,
        }
    }

    fn file(&mut self) -> VcdResult<&mut File> {
        if self.file.is_none() {
            let mut f = File::open(&self.path)?;

            if self.pos != 0 {
                f.seek(SeekFrom::Start(self.pos))?;
            }

            self.file = Some(f);
        }

        Ok(self.file.as_mut().unwrap())
    }
}

impl DataSource for FileSource {
    fn stat(&mut self) -> VcdResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn seek(&mut self, offset: u64) -> VcdResult<()> {
        self.pos = offset;

        if let Some(f) = self.file.as_mut() {
            f.seek(SeekFrom::Start(offset))?;
        }

        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> VcdResult<usize> {
        let f = self.file()?;

        let mut total = 0;

        while total < buf.len() {
            let n = f.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }

        self.pos += total as u64;

        Ok(total)
    }

    fn close(&mut self) {
        self.file = None;
        self.pos = 0;
    }
}

/// A [`DataSource`] over an in-memory buffer
pub struct MemSource {
    data: Vec<u8>,
    pos: usize,
}

impl MemSource {
    /// Create a source reading from `data`
    pub fn new(data: Vec<u8>) -> MemSource {
        MemSource { data, pos: 0 }
    }
}

impl DataSource for MemSource {
    fn stat(&mut self) -> VcdResult<u64> {
        Ok(self.data.len() as u64)
    }

    fn seek(&mut self, offset: u64) -> VcdResult<()> {
        self.pos = offset.min(self.data.len() as u64) as usize;

        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> VcdResult<usize> {
        let avail = self.data.len() - self.pos;
        let n = buf.len().min(avail);

        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;

        Ok(n)
    }

    fn close(&mut self) {
        self.pos = 0;
    }
}

#[cfg(test)]
mod test {
    use super::{DataSource, MemSource};

    #[test]
    fn mem_source_reads() {
        let mut src = MemSource::new((0u8..100).collect());

        assert!(src.stat().unwrap() == 100);

        let mut buf = [0u8; 10];
        src.seek(95).unwrap();

        // Short read at the tail, rest of the buffer untouched
        assert!(src.read(&mut buf).unwrap() == 5);
        assert!(buf[0] == 95);
        assert!(buf[4] == 99);
        assert!(buf[5] == 0);
    }

    #[test]
    fn mem_source_restarts() {
        let mut src = MemSource::new(vec![1, 2, 3]);

        let mut buf = [0u8; 3];
        src.read(&mut buf).unwrap();
        src.close();

        // A closed source reads from the start again
        let mut buf2 = [0u8; 1];
        assert!(src.read(&mut buf2).unwrap() == 1);
        assert!(buf2[0] == 1);
    }
}
