use std::io::{self, Read, Seek, SeekFrom};

use crate::error::IntegrityError;
use crate::frame::{RecordHeader, BOOTSTRAP_LEN, HEADER_LEN};

pub fn read_bootstrap<R: Read + Seek>(reader: &mut R) -> io::Result<u64> {
    let mut bytes = [0u8; BOOTSTRAP_LEN as usize];
    reader.seek(SeekFrom::Start(0))?;
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn read_header<R: Read + Seek>(reader: &mut R, offset: u64) -> io::Result<RecordHeader> {
    let mut bytes = [0u8; HEADER_LEN];
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(&mut bytes)?;
    Ok(RecordHeader::deserialize(&bytes))
}

/// Reads the record whose header sits at `offset`. Offset 0 is the bootstrap
/// field, never a record.
pub fn read_frame<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    with_payload: bool,
) -> io::Result<(RecordHeader, Option<Vec<u8>>)> {
    if offset < BOOTSTRAP_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "offset 0 holds the bootstrap field",
        ));
    }
    let header = read_header(reader, offset)?;
    if !with_payload {
        return Ok((header, None));
    }
    let payload_start = offset + HEADER_LEN as u64;
    let stream_len = reader.seek(SeekFrom::End(0))?;
    let in_bounds = payload_start
        .checked_add(header.size)
        .map(|end| end <= stream_len)
        .unwrap_or(false);
    if !in_bounds {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record at offset {offset} runs past the end of the file"),
        ));
    }
    reader.seek(SeekFrom::Start(payload_start))?;
    let mut payload = vec![0u8; header.size as usize];
    reader.read_exact(&mut payload)?;
    Ok((header, Some(payload)))
}

/// What a successful chain validation learned about a subfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSummary {
    pub num_records: usize,
    pub first: Option<RecordHeader>,
    pub last: Option<RecordHeader>,
    /// Offset of the last record header, 0 for an empty subfile.
    pub last_offset: u64,
    /// End of the last committed record. Bytes past this point belong to an
    /// append that never got committed.
    pub committed_len: u64,
}

/// Walks the chain from the bootstrap field back to the first record.
///
/// Every record must end exactly where the next one starts, the first
/// record must sit right after the bootstrap field, and the last record
/// must fit in the file.
pub fn validate_chain<R: Read + Seek>(
    reader: &mut R,
    file_len: u64,
) -> io::Result<Result<ChainSummary, IntegrityError>> {
    if file_len < BOOTSTRAP_LEN {
        return Ok(Err(IntegrityError::new(0, "shorter than the bootstrap field")));
    }
    let last_offset = read_bootstrap(reader)?;
    if last_offset == 0 {
        return Ok(Ok(ChainSummary {
            num_records: 0,
            first: None,
            last: None,
            last_offset: 0,
            committed_len: BOOTSTRAP_LEN,
        }));
    }
    if last_offset < BOOTSTRAP_LEN || last_offset.saturating_add(HEADER_LEN as u64) > file_len {
        return Ok(Err(IntegrityError::new(
            0,
            format!("bootstrap points outside of the file ({last_offset})"),
        )));
    }
    let last = read_header(reader, last_offset)?;
    let committed_len = last_offset.saturating_add(last.frame_len());
    if committed_len > file_len {
        return Ok(Err(IntegrityError::new(
            last_offset,
            "truncated trailing frame",
        )));
    }
    let mut num_records = 1;
    let mut offset = last_offset;
    let mut header = last;
    while header.prev_offset != 0 {
        let prev_offset = header.prev_offset;
        if prev_offset < BOOTSTRAP_LEN || prev_offset >= offset {
            return Ok(Err(IntegrityError::new(
                offset,
                format!("previous offset {prev_offset} does not point backward"),
            )));
        }
        let prev = read_header(reader, prev_offset)?;
        if prev_offset.checked_add(prev.frame_len()) != Some(offset) {
            return Ok(Err(IntegrityError::new(
                prev_offset,
                format!(
                    "record of {} bytes does not end at the next header ({offset})",
                    prev.frame_len()
                ),
            )));
        }
        offset = prev_offset;
        header = prev;
        num_records += 1;
    }
    if offset != BOOTSTRAP_LEN {
        return Ok(Err(IntegrityError::new(
            offset,
            "first record does not follow the bootstrap field",
        )));
    }
    Ok(Ok(ChainSummary {
        num_records,
        first: Some(header),
        last: Some(last),
        last_offset,
        committed_len,
    }))
}

/// Iterates over the records of a subfile, newest first.
///
/// The chain is read from the bootstrap field once, at open, so a concurrent
/// append is simply not seen.
pub struct ChainWalker<R> {
    reader: R,
    file_len: u64,
    next_offset: u64,
}

impl<R: Read + Seek> ChainWalker<R> {
    pub fn open(mut reader: R) -> io::Result<Self> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        let next_offset = if file_len < BOOTSTRAP_LEN {
            0
        } else {
            read_bootstrap(&mut reader)?
        };
        Ok(ChainWalker {
            reader,
            file_len,
            next_offset,
        })
    }

    /// Returns the offset and header of the next (older) record.
    pub fn next_header(&mut self) -> io::Result<Option<(u64, RecordHeader)>> {
        let offset = self.next_offset;
        if offset == 0 {
            return Ok(None);
        }
        let header = read_header(&mut self.reader, offset)?;
        let in_bounds = offset
            .checked_add(header.frame_len())
            .map(|end| end <= self.file_len)
            .unwrap_or(false);
        if !in_bounds || header.prev_offset >= offset {
            self.next_offset = 0;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("broken record chain at offset {offset}"),
            ));
        }
        self.next_offset = header.prev_offset;
        Ok(Some((offset, header)))
    }

    pub fn read_payload(&mut self, offset: u64, header: &RecordHeader) -> io::Result<Vec<u8>> {
        let mut payload = vec![0u8; header.size as usize];
        self.reader
            .seek(SeekFrom::Start(offset + HEADER_LEN as u64))?;
        self.reader.read_exact(&mut payload)?;
        Ok(payload)
    }
}
