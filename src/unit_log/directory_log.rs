use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use super::{scan_units, UnitConfig, UnitInfo, UnitSet};
use crate::engine::Alarms;
use crate::error::LogError;
use crate::rolling::{entry_size, StreamDir};
use crate::time::Clock;
use crate::{InsertOutcome, Period};

/// A stream of whole directories, such as multi-file crash bundles.
///
/// Inserts may come from the main loop as well as from a delayed-insert
/// timer, so the unit set lives behind a mutex and every operation takes
/// `&self`. The scan, eviction and rename of an insert happen under the lock.
pub struct DirectoryLog {
    stream: StreamDir,
    config: UnitConfig,
    clock: Arc<dyn Clock>,
    alarms: Alarms,
    units: Mutex<Option<UnitSet>>,
}

impl DirectoryLog {
    pub fn new(
        stream: StreamDir,
        config: UnitConfig,
        clock: Arc<dyn Clock>,
        alarms: Alarms,
    ) -> DirectoryLog {
        DirectoryLog {
            stream,
            config,
            clock,
            alarms,
            units: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        self.stream.path()
    }

    pub fn stream(&self) -> &StreamDir {
        &self.stream
    }

    // open() rebuilds the unit set from disk, a poisoned one can be used as is.
    fn lock(&self) -> MutexGuard<'_, Option<UnitSet>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    pub fn open(&self) -> Result<(), LogError> {
        let pending = {
            let mut guard = self.lock();
            guard.take();
            self.stream.ensure_exists()?;
            let scan = scan_units(&self.stream, self.config.header, true, false, &self.alarms)?;
            let units = UnitSet::new(scan.units);
            info!(
                dir=%self.stream.path().display(),
                num_units=units.units().len(),
                tracked_total_size=units.tracked_total_size(),
                "directory log open"
            );
            *guard = Some(units);
            scan.pending
        };
        for temp_path in pending {
            if let Err(err) = self.event(&temp_path) {
                warn!(dir=%temp_path.display(), error=%err, "failed to ingest temporary directory");
            }
        }
        Ok(())
    }

    /// Moves a finished directory into the stream.
    ///
    /// The source must sit on the same filesystem as the stream.
    pub fn insert(&self, source: &Path) -> Result<InsertOutcome, LogError> {
        let mut guard = self.lock();
        let Some(units) = guard.as_mut() else {
            return Err(LogError::NotOpen);
        };
        if !fs::metadata(source)?.is_dir() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a directory").into());
        }
        let size_bytes = entry_size(source)?;
        let now = self.clock.now();
        let outcome =
            units.enforce_quota(&self.stream, size_bytes, &self.config.quota, now, &self.alarms);
        let name = self.stream.free_name(now, |name| units.contains(name));
        let path = self.stream.subfile_path(&name);
        fs::rename(source, &path)?;
        if self.config.persist_policy.uses_fsync() {
            self.stream.sync()?;
        }
        info!(from=%source.display(), dir=%path.display(), size=size_bytes, "stored directory");
        units.push(UnitInfo {
            name,
            path,
            size_bytes,
        });
        Ok(outcome)
    }

    pub fn event(&self, path: &Path) -> Result<InsertOutcome, LogError> {
        self.insert(path)
    }

    pub fn list_range(&self, period: Period) -> Result<Option<Period>, LogError> {
        let guard = self.lock();
        let units = guard.as_ref().ok_or(LogError::NotOpen)?;
        Ok(units.list_range(period))
    }

    pub fn read_range(&self, _period: Period) -> Result<Option<Period>, LogError> {
        Err(LogError::Unsupported {
            operation: "read_range",
            kind: "directory",
        })
    }

    pub fn close(&self) {
        if self.lock().take().is_some() {
            info!(dir=%self.stream.path().display(), "directory log closed");
        }
    }

    pub fn units(&self) -> Vec<UnitInfo> {
        self.lock()
            .as_ref()
            .map(|units| units.units().to_vec())
            .unwrap_or_default()
    }

    pub fn tracked_total_size(&self) -> u64 {
        self.lock()
            .as_ref()
            .map(UnitSet::tracked_total_size)
            .unwrap_or(0)
    }
}
