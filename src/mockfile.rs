use std::io;

use crate::frame::FileLike;

/// In-memory file. Writes can be made to fail after a byte budget is spent,
/// which is how a full disk looks like to the frame writer.
pub(crate) struct MockFile {
    buf: Vec<u8>,
    cursor: usize,
    fsynced: bool,
    write_budget: Option<usize>,
}

impl MockFile {
    pub fn new() -> MockFile {
        MockFile {
            buf: Vec::new(),
            cursor: 0,
            fsynced: false,
            write_budget: None,
        }
    }

    pub fn from_bytes(buf: Vec<u8>) -> MockFile {
        MockFile {
            buf,
            ..MockFile::new()
        }
    }

    /// Every write past `num_bytes` more bytes fails with `StorageFull`.
    /// A write crossing the limit is applied partially.
    pub fn fail_after(&mut self, num_bytes: usize) {
        self.write_budget = Some(num_bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_fsynced(&self) -> bool {
        self.fsynced
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl FileLike for MockFile {
    fn fsyncdata(&mut self) -> io::Result<()> {
        self.fsynced = true;
        Ok(())
    }

    fn set_len(&mut self, num_bytes: u64) -> io::Result<()> {
        self.buf.resize(num_bytes as usize, 0u8);
        Ok(())
    }
}

impl io::Read for MockFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = self.cursor.min(self.buf.len());
        let end = (self.cursor + buf.len()).min(self.buf.len());
        let len = end - start;
        buf[..len].copy_from_slice(&self.buf[start..end]);
        self.cursor = end.max(self.cursor);
        Ok(len)
    }
}

impl io::Write for MockFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = match self.write_budget {
            Some(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "no space left on device",
                ))
            }
            Some(budget) => buf.len().min(budget),
            None => buf.len(),
        };
        if let Some(budget) = self.write_budget.as_mut() {
            *budget -= len;
        }
        if self.cursor + len > self.buf.len() {
            self.buf.resize(self.cursor + len, 0u8);
        }
        self.fsynced = false;
        self.buf[self.cursor..][..len].copy_from_slice(&buf[..len]);
        self.cursor += len;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for MockFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        match pos {
            io::SeekFrom::Start(offset) => self.cursor = offset as usize,
            io::SeekFrom::End(offset) => self.cursor = (self.buf.len() as i64 + offset) as usize,
            io::SeekFrom::Current(offset) => self.cursor = (self.cursor as i64 + offset) as usize,
        }
        Ok(self.cursor as u64)
    }
}
