use crate::time::TimeValue;

/// Width of a machine word on disk.
pub const WORD_LEN: usize = 8;

/// The bootstrap field at offset 0 holds the offset of the last record header.
pub const BOOTSTRAP_LEN: u64 = WORD_LEN as u64;

pub const HEADER_LEN: usize = WORD_LEN + // prev_offset
                              8 +        // cp_time
                              8 +        // ap_time
                              WORD_LEN; // size

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Offset of the previous record header, 0 for the first record of a subfile.
    pub prev_offset: u64,
    pub cp_time: TimeValue,
    pub ap_time: TimeValue,
    /// Payload length in bytes.
    pub size: u64,
}

impl RecordHeader {
    /// Header plus payload.
    pub fn frame_len(&self) -> u64 {
        (HEADER_LEN as u64).saturating_add(self.size)
    }

    /// Serialize the header
    ///
    /// # Panics
    /// panic if `dest` isn't exactly `HEADER_LEN` bytes long
    pub fn serialize(&self, dest: &mut [u8]) {
        assert_eq!(dest.len(), HEADER_LEN);
        dest[..8].copy_from_slice(&self.prev_offset.to_le_bytes());
        dest[8..16].copy_from_slice(&self.cp_time.as_micros().to_le_bytes());
        dest[16..24].copy_from_slice(&self.ap_time.as_micros().to_le_bytes());
        dest[24..32].copy_from_slice(&self.size.to_le_bytes());
    }

    /// Deserialize a header. Any bit pattern is a syntactically valid header,
    /// consistency is checked by walking the chain.
    ///
    /// # Panics
    /// panic if `data` isn't exactly `HEADER_LEN` bytes long
    pub fn deserialize(data: &[u8]) -> RecordHeader {
        assert_eq!(data.len(), HEADER_LEN);
        let word = |start: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[start..start + 8]);
            bytes
        };
        RecordHeader {
            prev_offset: u64::from_le_bytes(word(0)),
            cp_time: TimeValue::from_micros(i64::from_le_bytes(word(8))),
            ap_time: TimeValue::from_micros(i64::from_le_bytes(word(16))),
            size: u64::from_le_bytes(word(24)),
        }
    }
}
