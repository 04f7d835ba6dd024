//! Log streams rotated by whole files or whole directories.
//!
//! Unlike append logs, the unit of rotation is an opaque artifact (a dump, a
//! crash bundle, a console capture). Its time is the one embedded in its
//! name, and there are no records to decode.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::Alarms;
use crate::error::IntegrityError;
use crate::frame::validate_chain;
use crate::retention::{evict_one, select_eviction_target, Quota, Span};
use crate::rolling::{entry_size, EntryKind, StreamDir, SubfileName};
use crate::time::TimeValue;
use crate::{InsertOutcome, PersistPolicy, Period};

mod directory_log;
mod file_log;
mod legacy_dir_log;

pub use self::directory_log::DirectoryLog;
pub use self::file_log::FileLog;
pub use self::legacy_dir_log::LegacyDirLog;

/// Longest legacy header line, newline included.
pub const LEGACY_HEADER_MAX_LEN: usize = 512;

/// Self-check applied to a unit before it is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderKind {
    None,
    /// The unit is an append log subfile: its record chain must be valid.
    Framed,
    /// The first line holds tab separated `key=value` fields, one of them
    /// being `size=<total length of the file>`.
    LegacyTabular,
}

#[derive(Clone, Debug)]
pub struct UnitConfig {
    pub quota: Quota,
    pub header: HeaderKind,
    pub persist_policy: PersistPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitInfo {
    pub name: SubfileName,
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl UnitInfo {
    pub fn time(&self) -> TimeValue {
        self.name.time()
    }
}

pub(crate) fn check_header(path: &Path, kind: HeaderKind) -> io::Result<Result<(), IntegrityError>> {
    match kind {
        HeaderKind::None => Ok(Ok(())),
        HeaderKind::Framed => {
            let mut file = File::open(path)?;
            let file_len = file.metadata()?.len();
            Ok(validate_chain(&mut file, file_len)?
                .map(|_| ())
                .map_err(|integrity_err| integrity_err.with_path(path)))
        }
        HeaderKind::LegacyTabular => {
            let mut file = File::open(path)?;
            let file_len = file.metadata()?.len();
            let mut head = Vec::with_capacity(LEGACY_HEADER_MAX_LEN);
            (&mut file)
                .take(LEGACY_HEADER_MAX_LEN as u64)
                .read_to_end(&mut head)?;
            Ok(check_legacy_header(&head, file_len).map_err(|integrity_err| integrity_err.with_path(path)))
        }
    }
}

fn check_legacy_header(head: &[u8], file_len: u64) -> Result<(), IntegrityError> {
    let Some(line_end) = head.iter().position(|&b| b == b'\n') else {
        return Err(IntegrityError::new(
            0,
            format!("no header line within the first {LEGACY_HEADER_MAX_LEN} bytes"),
        ));
    };
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| IntegrityError::new(0, "header line is not valid UTF-8"))?;
    let declared_size = line
        .trim_end_matches('\r')
        .split('\t')
        .filter_map(|field| field.split_once('='))
        .find(|(key, _)| key.trim() == "size")
        .map(|(_, value)| value.trim());
    let Some(declared_size) = declared_size else {
        return Err(IntegrityError::new(0, "header has no size field"));
    };
    let declared_size: u64 = declared_size
        .parse()
        .map_err(|_| IntegrityError::new(0, format!("invalid size field {declared_size:?}")))?;
    if declared_size != file_len {
        return Err(IntegrityError::new(
            0,
            format!("header declares {declared_size} bytes, file has {file_len}"),
        ));
    }
    Ok(())
}

/// Units of a stream, sorted by name, along with their total size.
#[derive(Debug, Default)]
pub(crate) struct UnitSet {
    units: Vec<UnitInfo>,
    tracked_total_size: u64,
}

impl UnitSet {
    pub fn new(mut units: Vec<UnitInfo>) -> UnitSet {
        units.sort_by_key(|unit| unit.name);
        let tracked_total_size = units.iter().map(|unit| unit.size_bytes).sum();
        UnitSet {
            units,
            tracked_total_size,
        }
    }

    pub fn units(&self) -> &[UnitInfo] {
        &self.units
    }

    pub fn tracked_total_size(&self) -> u64 {
        self.tracked_total_size
    }

    pub fn contains(&self, name: &SubfileName) -> bool {
        self.units.iter().any(|unit| unit.name == *name)
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.units.iter().any(|unit| unit.path == path)
    }

    pub fn push(&mut self, unit: UnitInfo) {
        let position = self.units.partition_point(|other| other.name <= unit.name);
        self.tracked_total_size += unit.size_bytes;
        self.units.insert(position, unit);
    }

    /// Removes units until `needed` more bytes fit the quota, or nothing can
    /// be removed anymore.
    pub fn enforce_quota(
        &mut self,
        stream: &StreamDir,
        needed: u64,
        quota: &Quota,
        now: TimeValue,
        alarms: &Alarms,
    ) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        loop {
            let total_size = self.tracked_total_size + needed;
            let spans: Vec<Span> = self.units.iter().map(|unit| Span::at(unit.time())).collect();
            let Some(target) = select_eviction_target(&spans, total_size, quota, now) else {
                if total_size > quota.max_total_size {
                    warn!(
                        dir=%stream.path().display(),
                        total_size,
                        max_total_size=quota.max_total_size,
                        "nothing left to evict, storing over quota"
                    );
                    alarms.raise();
                    outcome.over_quota = true;
                }
                return outcome;
            };
            let units = &self.units;
            let removed = evict_one(units.len(), target, |index| {
                match stream.remove_entry(&units[index].path) {
                    Err(io_err) if io_err.kind() == io::ErrorKind::NotFound => Ok(()),
                    res => res,
                }
            });
            match removed {
                Ok(index) => {
                    let unit = self.units.remove(index);
                    self.tracked_total_size -= unit.size_bytes;
                    outcome.evicted += 1;
                    info!(file=%unit.path.display(), size=unit.size_bytes, "evicted unit");
                }
                Err(exhausted) => {
                    warn!(dir=%stream.path().display(), error=%exhausted, "storing over quota");
                    alarms.raise();
                    outcome.over_quota = true;
                    return outcome;
                }
            }
        }
    }

    /// Span of the units whose time lies within `period`.
    pub fn list_range(&self, period: Period) -> Option<Period> {
        let mut times = self
            .units
            .iter()
            .map(UnitInfo::time)
            .filter(|time| period.contains(*time));
        let first = times.next()?;
        let (start, end) = times.fold((first, first), |(start, end), time| {
            (start.min(time), end.max(time))
        });
        Some(Period::new(start, end))
    }
}

/// What a directory scan found for a unit stream.
pub(crate) struct UnitScan {
    pub units: Vec<UnitInfo>,
    /// Temporary entries, in name order.
    pub pending: Vec<PathBuf>,
}

/// Classifies the entries of a unit stream.
///
/// Units failing the self-check and unknown entries are removed. Temporary
/// entries of the right type are returned as pending. With `keep_temp`, other
/// temporary entries are left alone instead of being removed.
pub(crate) fn scan_units(
    stream: &StreamDir,
    header: HeaderKind,
    units_are_dirs: bool,
    keep_temp: bool,
    alarms: &Alarms,
) -> io::Result<UnitScan> {
    let mut units = Vec::new();
    let mut pending = Vec::new();
    for entry in stream.scan()? {
        match entry.kind {
            EntryKind::Subfile(name) if entry.is_dir == units_are_dirs => {
                if !units_are_dirs {
                    if let Err(integrity_err) = check_header(&entry.path, header)? {
                        warn!(error=%integrity_err, "unit failed its self-check");
                        alarms.raise();
                        stream.drop_entry(&entry.path, "failed self-check");
                        continue;
                    }
                }
                let size_bytes = entry_size(&entry.path)?;
                units.push(UnitInfo {
                    name,
                    path: entry.path,
                    size_bytes,
                });
            }
            EntryKind::Temp if keep_temp => {}
            EntryKind::Temp if entry.is_dir == units_are_dirs => pending.push(entry.path),
            _ => stream.drop_entry(&entry.path, "unrecognized entry"),
        }
    }
    Ok(UnitScan { units, pending })
}

#[cfg(test)]
mod tests;
