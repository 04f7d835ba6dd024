//! On-disk framing of the records of an append log subfile.
//!
//! ```text
//! offset 0   bootstrap: offset of the last record header
//! offset 8   header 0 | payload 0
//!            header 1 | payload 1      (header 1 prev_offset -> header 0)
//!            ...
//! ```
//!
//! The records form a backward linked list starting at the bootstrap field.

use std::fs::File;
use std::io;

mod header;
mod reader;
mod writer;

pub use self::header::{RecordHeader, BOOTSTRAP_LEN, HEADER_LEN, WORD_LEN};
pub use self::reader::{
    read_bootstrap, read_frame, read_header, validate_chain, ChainSummary, ChainWalker,
};
pub use self::writer::{write_bootstrap, write_frame, FrameWriter};

pub trait FileLike: io::Read + io::Write + io::Seek {
    fn fsyncdata(&mut self) -> io::Result<()>;
    fn set_len(&mut self, num_bytes: u64) -> io::Result<()>;
}

impl FileLike for File {
    fn fsyncdata(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn set_len(&mut self, num_bytes: u64) -> io::Result<()> {
        File::set_len(self, num_bytes)
    }
}
