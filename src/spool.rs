//! Write-then-read spill store for request bodies and uploaded files.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// Seekable byte store that keeps small payloads in memory and migrates to
/// an unlinked temporary file once the spill threshold is crossed.
///
/// Writes append; call [`rewind`](Self::rewind) before handing the stream
/// to a reader.
#[derive(Debug)]
pub struct Spool {
    inner: Inner,
    threshold: usize,
    len: u64,
}

#[derive(Debug)]
enum Inner {
    Memory(Cursor<Vec<u8>>),
    File(File),
}

impl Spool {
    pub fn with_threshold(threshold: usize) -> Self {
        Self { inner: Inner::Memory(Cursor::new(Vec::new())), threshold, len: 0 }
    }

    /// Total number of bytes written.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True once the payload has migrated to a temp file.
    pub fn is_spilled(&self) -> bool {
        matches!(self.inner, Inner::File(_))
    }

    pub fn rewind(&mut self) -> io::Result<()> {
        self.seek(SeekFrom::Start(0)).map(|_| ())
    }

    fn spill(&mut self) -> io::Result<()> {
        let Inner::Memory(cursor) = &mut self.inner else {
            return Ok(());
        };

        let mut file = tempfile::tempfile()?;
        file.write_all(cursor.get_ref())?;
        self.inner = Inner::File(file);
        Ok(())
    }

    /// Reads the full contents into a string, restoring the read position.
    /// Test and small-payload convenience.
    pub fn contents(&mut self) -> io::Result<String> {
        let pos = self.seek(SeekFrom::Current(0))?;
        self.rewind()?;
        let mut out = String::new();
        Read::read_to_string(self, &mut out)?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(out)
    }
}

impl Write for Spool {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_spilled() && self.len as usize + buf.len() > self.threshold {
            self.spill()?;
        }

        let written = match &mut self.inner {
            Inner::Memory(cursor) => {
                cursor.get_mut().extend_from_slice(buf);
                buf.len()
            }
            Inner::File(file) => {
                file.seek(SeekFrom::End(0))?;
                file.write(buf)?
            }
        };

        self.len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Inner::Memory(_) => Ok(()),
            Inner::File(file) => file.flush(),
        }
    }
}

impl Read for Spool {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Memory(cursor) => cursor.read(buf),
            Inner::File(file) => file.read(buf),
        }
    }
}

impl Seek for Spool {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.inner {
            Inner::Memory(cursor) => cursor.seek(pos),
            Inner::File(file) => file.seek(pos),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_stays_in_memory() {
        let mut spool = Spool::with_threshold(16);
        spool.write_all(b"hello").unwrap();

        assert!(!spool.is_spilled());
        assert_eq!(spool.len(), 5);
        assert_eq!(spool.contents().unwrap(), "hello");
    }

    #[test]
    fn crossing_threshold_spills_to_file() {
        let mut spool = Spool::with_threshold(8);
        spool.write_all(b"0123").unwrap();
        spool.write_all(b"456789").unwrap();

        assert!(spool.is_spilled());
        assert_eq!(spool.len(), 10);
        assert_eq!(spool.contents().unwrap(), "0123456789");
    }

    #[test]
    fn seek_and_partial_reads() {
        let mut spool = Spool::with_threshold(4);
        spool.write_all(b"abcdefgh").unwrap();
        spool.seek(SeekFrom::Start(4)).unwrap();

        let mut tail = [0u8; 4];
        spool.read_exact(&mut tail).unwrap();
        assert_eq!(&tail, b"efgh");
    }
}
