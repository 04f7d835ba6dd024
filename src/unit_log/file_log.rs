use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::{check_header, scan_units, UnitConfig, UnitInfo, UnitSet};
use crate::engine::Alarms;
use crate::error::LogError;
use crate::rolling::{move_entry, StreamDir};
use crate::time::Clock;
use crate::{InsertOutcome, Period};

/// A stream of whole files, such as core dumps.
///
/// Finished files are moved into the stream under a name built from the
/// time of insertion.
pub struct FileLog {
    stream: StreamDir,
    config: UnitConfig,
    clock: Arc<dyn Clock>,
    alarms: Alarms,
    units: Option<UnitSet>,
}

impl FileLog {
    pub fn new(
        stream: StreamDir,
        config: UnitConfig,
        clock: Arc<dyn Clock>,
        alarms: Alarms,
    ) -> FileLog {
        FileLog {
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
        let scan = scan_units(&self.stream, self.config.header, false, false, &self.alarms)?;
        let units = UnitSet::new(scan.units);
        info!(
            dir=%self.stream.path().display(),
            num_units=units.units().len(),
            tracked_total_size=units.tracked_total_size(),
            "file log open"
        );
        self.units = Some(units);
        for temp_path in scan.pending {
            if let Err(err) = self.event(&temp_path) {
                warn!(file=%temp_path.display(), error=%err, "failed to ingest temporary file");
            }
        }
        Ok(())
    }

    /// Moves a finished file into the stream.
    ///
    /// A file failing the header self-check is deleted and reported as an
    /// integrity error.
    pub fn insert(&mut self, source: &Path) -> Result<InsertOutcome, LogError> {
        let Some(units) = &mut self.units else {
            return Err(LogError::NotOpen);
        };
        let metadata = fs::metadata(source)?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file").into());
        }
        if let Err(integrity_err) = check_header(source, self.config.header)? {
            warn!(error=%integrity_err, "dropping file failing its self-check");
            self.alarms.raise();
            self.stream.drop_entry(source, "failed self-check");
            return Err(integrity_err.into());
        }
        let size_bytes = metadata.len();
        let now = self.clock.now();
        let outcome =
            units.enforce_quota(&self.stream, size_bytes, &self.config.quota, now, &self.alarms);
        let name = self.stream.free_name(now, |name| units.contains(name));
        let path = self.stream.subfile_path(&name);
        move_entry(source, &path)?;
        if self.config.persist_policy.uses_fsync() {
            self.stream.sync()?;
        }
        info!(from=%source.display(), file=%path.display(), size=size_bytes, "stored file");
        units.push(UnitInfo {
            name,
            path,
            size_bytes,
        });
        Ok(outcome)
    }

    pub fn event(&mut self, path: &Path) -> Result<InsertOutcome, LogError> {
        self.insert(path)
    }

    pub fn list_range(&self, period: Period) -> Result<Option<Period>, LogError> {
        let units = self.units.as_ref().ok_or(LogError::NotOpen)?;
        Ok(units.list_range(period))
    }

    pub fn read_range(&self, _period: Period) -> Result<Option<Period>, LogError> {
        Err(LogError::Unsupported {
            operation: "read_range",
            kind: "file",
        })
    }

    pub fn close(&mut self) {
        if self.units.take().is_some() {
            info!(dir=%self.stream.path().display(), "file log closed");
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
