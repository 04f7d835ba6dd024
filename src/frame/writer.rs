use std::io::{self, Seek, SeekFrom, Write};

use crate::frame::{FileLike, RecordHeader, BOOTSTRAP_LEN, HEADER_LEN};
use crate::time::TimeValue;
use crate::PersistAction;

/// Writes `header` then `payload` at `offset`, in a single write.
///
/// This does not touch the bootstrap field: until the caller patches it
/// with [`write_bootstrap`], the frame is invisible to readers.
pub fn write_frame<W: Write + Seek>(
    wrt: &mut W,
    offset: u64,
    header: &RecordHeader,
    payload: &[u8],
    buffer: &mut Vec<u8>,
) -> io::Result<()> {
    assert_eq!(header.size, payload.len() as u64);
    buffer.clear();
    buffer.resize(HEADER_LEN, 0u8);
    header.serialize(&mut buffer[..HEADER_LEN]);
    buffer.extend_from_slice(payload);
    wrt.seek(SeekFrom::Start(offset))?;
    wrt.write_all(buffer)?;
    Ok(())
}

/// Points the bootstrap field at the header found at `last_offset`.
pub fn write_bootstrap<W: Write + Seek>(wrt: &mut W, last_offset: u64) -> io::Result<()> {
    wrt.seek(SeekFrom::Start(0))?;
    wrt.write_all(&last_offset.to_le_bytes())?;
    Ok(())
}

/// Appends records to a single subfile.
pub struct FrameWriter<W> {
    wrt: W,
    // Offset of the last committed header, 0 if the subfile holds no record.
    last_offset: u64,
    // End of the last committed record.
    end_offset: u64,
    // When set, the frame is fsynced before the bootstrap field is patched.
    ordered_writes: bool,
    // temporary buffer, not storing anything in particular after any function returns
    buffer: Vec<u8>,
}

impl<W: FileLike> FrameWriter<W> {
    /// Initializes an empty subfile.
    pub fn create(mut wrt: W) -> io::Result<Self> {
        write_bootstrap(&mut wrt, 0)?;
        Ok(FrameWriter::resume(wrt, 0, BOOTSTRAP_LEN))
    }

    /// Continues a subfile whose chain was already validated.
    pub fn resume(wrt: W, last_offset: u64, end_offset: u64) -> Self {
        FrameWriter {
            wrt,
            last_offset,
            end_offset,
            ordered_writes: false,
            buffer: Vec::with_capacity(HEADER_LEN + 1_024),
        }
    }

    pub fn with_ordered_writes(mut self, ordered_writes: bool) -> Self {
        self.ordered_writes = ordered_writes;
        self
    }

    /// Appends a record and returns the offset of its header.
    ///
    /// The payload and header are written first and the bootstrap field is
    /// patched last: if this fails midway, the subfile still describes the
    /// state before the call.
    pub fn append(
        &mut self,
        cp_time: TimeValue,
        ap_time: TimeValue,
        payload: &[u8],
    ) -> io::Result<u64> {
        let offset = self.end_offset;
        let header = RecordHeader {
            prev_offset: self.last_offset,
            cp_time,
            ap_time,
            size: payload.len() as u64,
        };
        write_frame(&mut self.wrt, offset, &header, payload, &mut self.buffer)?;
        self.wrt.flush()?;
        if self.ordered_writes {
            self.wrt.fsyncdata()?;
        }
        write_bootstrap(&mut self.wrt, offset)?;
        self.last_offset = offset;
        self.end_offset = offset + header.frame_len();
        Ok(offset)
    }

    pub fn persist(&mut self, persist_action: PersistAction) -> io::Result<()> {
        self.wrt.flush()?;
        if persist_action.is_fsync() {
            self.wrt.fsyncdata()?;
        }
        Ok(())
    }

    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    #[cfg(test)]
    pub fn into_writer(self) -> W {
        self.wrt
    }
}
