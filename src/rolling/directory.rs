use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{EntryKind, NamePattern, SubfileName};
use crate::time::TimeValue;

/// The directory holding the subfiles of one log stream.
#[derive(Clone, Debug)]
pub struct StreamDir {
    dir: PathBuf,
    pattern: NamePattern,
}

#[derive(Clone, Debug)]
pub struct ScannedEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub is_dir: bool,
    pub kind: EntryKind,
}

impl StreamDir {
    pub fn new(dir: impl Into<PathBuf>, pattern: NamePattern) -> StreamDir {
        StreamDir {
            dir: dir.into(),
            pattern,
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn pattern(&self) -> &NamePattern {
        &self.pattern
    }

    pub fn ensure_exists(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Lists and classifies the entries of the directory.
    ///
    /// Entries whose name is not valid UTF-8 are reported as unknown.
    pub fn scan(&self) -> io::Result<Vec<ScannedEntry>> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let file_type = dir_entry.file_type()?;
            let os_file_name = dir_entry.file_name();
            let (file_name, kind) = match os_file_name.to_str() {
                Some(file_name) => (file_name.to_string(), self.pattern.classify(file_name)),
                None => (
                    os_file_name.to_string_lossy().into_owned(),
                    EntryKind::Unknown,
                ),
            };
            entries.push(ScannedEntry {
                path: dir_entry.path(),
                file_name,
                is_dir: file_type.is_dir(),
                kind,
            });
        }
        entries.sort_by(|left, right| left.file_name.cmp(&right.file_name));
        Ok(entries)
    }

    pub fn subfile_path(&self, name: &SubfileName) -> PathBuf {
        self.dir.join(self.pattern.filename(name))
    }

    /// First name at or after `time` that is neither `taken` nor present on disk.
    pub fn free_name(&self, time: TimeValue, taken: impl Fn(&SubfileName) -> bool) -> SubfileName {
        let mut name = self.pattern.name_for(time);
        while taken(&name) || self.subfile_path(&name).exists() {
            name = self.pattern.next_candidate(&name);
        }
        name
    }

    pub fn create_subfile(&self, name: &SubfileName) -> io::Result<File> {
        let path = self.subfile_path(name);
        debug!(file=%path.display(), "create subfile");
        OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
    }

    /// Removes a file or a whole directory tree.
    pub fn remove_entry(&self, path: &Path) -> io::Result<()> {
        let metadata = fs::symlink_metadata(path)?;
        if metadata.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }

    /// Removes an entry the engine does not want to keep, logging why.
    pub fn drop_entry(&self, path: &Path, reason: &str) {
        warn!(file=%path.display(), reason, "removing entry from log directory");
        if let Err(io_err) = self.remove_entry(path) {
            if io_err.kind() != io::ErrorKind::NotFound {
                warn!(file=%path.display(), error=%io_err, "failed to remove entry");
            }
        }
    }

    pub fn sync(&self) -> io::Result<()> {
        fsync_data_directory(&self.dir)
    }
}

/// Moves `from` to `to`, copying when they sit on different filesystems.
/// Only plain files can be copied across filesystems.
pub(crate) fn move_entry(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(io_err) if io_err.raw_os_error() == Some(libc::EXDEV) && from.is_file() => {
            debug!(from=%from.display(), to=%to.display(), "cross device move, copying");
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(io_err) => Err(io_err),
    }
}

/// Size in bytes of a file, or of everything below a directory.
pub fn entry_size(path: &Path) -> io::Result<u64> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }
    let mut total = 0u64;
    for dir_entry in fs::read_dir(path)? {
        total += entry_size(&dir_entry?.path())?;
    }
    Ok(total)
}

/// fsyncdata a directory, so that created, renamed and removed entries
/// survive a crash.
fn fsync_data_directory(path: &Path) -> io::Result<()> {
    // neither tokio nor the std comes with anything to sync a directory (see also
    // https://github.com/tokio-rs/tokio/issues/1922 ).
    use std::os::unix::ffi::OsStrExt;

    let target = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a nul byte"))?;

    // safety: target is a valid nul terminated path, and provided flags are valid for open()
    let fd = unsafe { libc::open(target.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // safety: fd is a valid file descriptor
    let res = unsafe { libc::fsync(fd) };
    let sync_result = if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    };
    // safety: fd is a valid file descriptor, closed once.
    let res = unsafe { libc::close(fd) };
    sync_result?;
    if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
