use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{check_header, scan_units, UnitConfig, UnitInfo, UnitSet};
use crate::engine::Alarms;
use crate::error::{FormatError, LogError};
use crate::rolling::{EntryKind, StreamDir};
use crate::time::Clock;
use crate::{InsertOutcome, Period};

/// A stream whose producer writes its files in place, directly under their
/// final name.
///
/// Files are adopted as they are: nothing gets renamed, only the quota is
/// enforced. Temporary entries belong to the producer and are left alone.
pub struct LegacyDirLog {
    stream: StreamDir,
    config: UnitConfig,
    clock: Arc<dyn Clock>,
    alarms: Alarms,
    units: Option<UnitSet>,
}

impl LegacyDirLog {
    pub fn new(
        stream: StreamDir,
        config: UnitConfig,
        clock: Arc<dyn Clock>,
        alarms: Alarms,
    ) -> LegacyDirLog {
        LegacyDirLog {
            stream,
            config,
            clock,
            alarms,
            units: None,
        }
    }

    pub fn dir(&self) -> &Path {
        self.stream.path()
    }

    pub fn stream(&self) -> &StreamDir {
        &self.stream
    }

    pub fn is_open(&self) -> bool {
        self.units.is_some()
    }

    pub fn open(&mut self) -> Result<(), LogError> {
        self.close();
        self.stream.ensure_exists()?;
        let scan = scan_units(&self.stream, self.config.header, false, true, &self.alarms)?;
        let mut units = UnitSet::new(scan.units);
        let outcome = units.enforce_quota(
            &self.stream,
            0,
            &self.config.quota,
            self.clock.now(),
            &self.alarms,
        );
        info!(
            dir=%self.stream.path().display(),
            num_units=units.units().len(),
            tracked_total_size=units.tracked_total_size(),
            evicted=outcome.evicted,
            "legacy directory log open"
        );
        self.units = Some(units);
        Ok(())
    }

    /// Adopts a file the producer just finished writing.
    ///
    /// Files already tracked and temporary files are ignored.
    pub fn event(&mut self, path: &Path) -> Result<InsertOutcome, LogError> {
        let Some(units) = &mut self.units else {
            return Err(LogError::NotOpen);
        };
        let file_name = path.file_name().and_then(|file_name| file_name.to_str());
        let kind = match file_name {
            Some(file_name) if path.parent() == Some(self.stream.path()) => {
                self.stream.pattern().classify(file_name)
            }
            _ => EntryKind::Unknown,
        };
        let name = match kind {
            EntryKind::Subfile(name) => name,
            EntryKind::Temp => {
                debug!(file=%path.display(), "ignoring file still being written");
                return Ok(InsertOutcome::default());
            }
            EntryKind::Unknown => {
                return Err(FormatError::new(format!(
                    "{} is not a file of this stream",
                    path.display()
                ))
                .into());
            }
        };
        if units.contains_path(path) {
            return Ok(InsertOutcome::default());
        }
        if let Err(integrity_err) = check_header(path, self.config.header)? {
            warn!(error=%integrity_err, "dropping file failing its self-check");
            self.alarms.raise();
            self.stream.drop_entry(path, "failed self-check");
            return Err(integrity_err.into());
        }
        let size_bytes = fs::metadata(path)?.len();
        let outcome = units.enforce_quota(
            &self.stream,
            size_bytes,
            &self.config.quota,
            self.clock.now(),
            &self.alarms,
        );
        if outcome.evicted > 0 && self.config.persist_policy.uses_fsync() {
            self.stream.sync()?;
        }
        debug!(file=%path.display(), size=size_bytes, "adopted file");
        units.push(UnitInfo {
            name,
            path: path.to_path_buf(),
            size_bytes,
        });
        Ok(outcome)
    }

    /// Committed files present on disk that are not tracked yet.
    pub fn untracked_entries(&self) -> Result<Vec<PathBuf>, LogError> {
        let units = self.units.as_ref().ok_or(LogError::NotOpen)?;
        Ok(self
            .stream
            .scan()?
            .into_iter()
            .filter(|entry| matches!(entry.kind, EntryKind::Subfile(_)) && !entry.is_dir)
            .filter(|entry| !units.contains_path(&entry.path))
            .map(|entry| entry.path)
            .collect())
    }

    pub fn list_range(&self, period: Period) -> Result<Option<Period>, LogError> {
        let units = self.units.as_ref().ok_or(LogError::NotOpen)?;
        Ok(units.list_range(period))
    }

    pub fn read_range(&self, _period: Period) -> Result<Option<Period>, LogError> {
        Err(LogError::Unsupported {
            operation: "read_range",
            kind: "legacy directory",
        })
    }

    pub fn close(&mut self) {
        if self.units.take().is_some() {
            info!(dir=%self.stream.path().display(), "legacy directory log closed");
        }
    }

    pub fn units(&self) -> Vec<UnitInfo> {
        self.units
            .as_ref()
            .map(|units| units.units().to_vec())
            .unwrap_or_default()
    }

    pub fn tracked_total_size(&self) -> u64 {
        self.units
            .as_ref()
            .map(UnitSet::tracked_total_size)
            .unwrap_or(0)
    }
}
