mod directory;
mod subfile_name;

pub(crate) use self::directory::move_entry;
pub use self::directory::{entry_size, ScannedEntry, StreamDir};
pub use self::subfile_name::{EntryKind, NamePattern, NameStyle, SubfileName};
