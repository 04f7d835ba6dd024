//! Engine dispatch and the state shared by every stream of the daemon.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info, warn};

use crate::append_log::{AppendLog, Event, EventFilter};
use crate::catalog::{CpIdentity, LogCatalog, LogType, Side};
use crate::error::{FormatError, LogError};
use crate::rolling::{EntryKind, StreamDir};
use crate::time::{Clock, SystemClock, TimeValue};
use crate::unit_log::{DirectoryLog, FileLog, LegacyDirLog};
use crate::{InsertOutcome, PersistPolicy, Period};

/// Operator visible alarm counter, shared by every engine of a daemon.
#[derive(Clone, Debug, Default)]
pub struct Alarms(Arc<AtomicU64>);

impl Alarms {
    pub fn raise(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct EngineContext {
    pub root_dir: PathBuf,
    pub catalog: LogCatalog,
    pub clock: Arc<dyn Clock>,
    pub alarms: Alarms,
    pub shutdown: Arc<AtomicBool>,
    pub persist_policy: PersistPolicy,
}

impl EngineContext {
    pub fn new(root_dir: impl Into<PathBuf>, catalog: LogCatalog) -> EngineContext {
        EngineContext {
            root_dir: root_dir.into(),
            catalog,
            clock: Arc::new(SystemClock),
            alarms: Alarms::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            persist_policy: PersistPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> EngineContext {
        self.clock = clock;
        self
    }

    pub fn with_persist_policy(mut self, persist_policy: PersistPolicy) -> EngineContext {
        self.persist_policy = persist_policy;
        self
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// One engine per stream, picked by the catalog.
pub enum LogEngine {
    Append(AppendLog),
    File(FileLog),
    Directory(DirectoryLog),
    LegacyDir(LegacyDirLog),
    /// The log type does not exist on this CP: every operation does nothing.
    Null,
}

impl LogEngine {
    pub fn kind_name(&self) -> &'static str {
        match self {
            LogEngine::Append(_) => "append",
            LogEngine::File(_) => "file",
            LogEngine::Directory(_) => "directory",
            LogEngine::LegacyDir(_) => "legacy directory",
            LogEngine::Null => "null",
        }
    }

    pub fn stream(&self) -> Option<&StreamDir> {
        match self {
            LogEngine::Append(log) => Some(log.stream()),
            LogEngine::File(log) => Some(log.stream()),
            LogEngine::Directory(log) => Some(log.stream()),
            LogEngine::LegacyDir(log) => Some(log.stream()),
            LogEngine::Null => None,
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.stream().map(StreamDir::path)
    }

    pub fn is_open(&self) -> bool {
        match self {
            LogEngine::Append(log) => log.is_open(),
            LogEngine::File(log) => log.is_open(),
            LogEngine::Directory(log) => log.is_open(),
            LogEngine::LegacyDir(log) => log.is_open(),
            LogEngine::Null => true,
        }
    }

    pub fn open(&mut self) -> Result<(), LogError> {
        match self {
            LogEngine::Append(log) => log.open(),
            LogEngine::File(log) => log.open(),
            LogEngine::Directory(log) => log.open(),
            LogEngine::LegacyDir(log) => log.open(),
            LogEngine::Null => Ok(()),
        }
    }

    pub fn close(&mut self) -> Result<(), LogError> {
        match self {
            LogEngine::Append(log) => log.close()?,
            LogEngine::File(log) => log.close(),
            LogEngine::Directory(log) => log.close(),
            LogEngine::LegacyDir(log) => log.close(),
            LogEngine::Null => {}
        }
        Ok(())
    }

    /// Appends one record. Only framed streams hold records.
    pub fn insert(
        &mut self,
        cp_time: TimeValue,
        payload: &[u8],
        is_sel_event: bool,
    ) -> Result<InsertOutcome, LogError> {
        match self {
            LogEngine::Append(log) => log.insert(cp_time, payload, is_sel_event),
            LogEngine::Null => Ok(InsertOutcome::default()),
            other => Err(LogError::Unsupported {
                operation: "insert",
                kind: other.kind_name(),
            }),
        }
    }

    /// Hands a finished artifact of this stream to its engine.
    pub fn event(&mut self, path: &Path) -> Result<InsertOutcome, LogError> {
        match self {
            LogEngine::Append(log) => log.event(path),
            LogEngine::File(log) => log.event(path),
            LogEngine::Directory(log) => log.event(path),
            LogEngine::LegacyDir(log) => log.event(path),
            LogEngine::Null => Ok(InsertOutcome::default()),
        }
    }

    pub fn read_range<F, C>(
        &self,
        period: Period,
        filter: F,
        on_event: C,
    ) -> Result<Option<Period>, LogError>
    where
        F: EventFilter,
        C: FnMut(Event<'_>),
    {
        match self {
            LogEngine::Append(log) => log.read_range(period, filter, on_event),
            LogEngine::File(log) => log.read_range(period),
            LogEngine::Directory(log) => log.read_range(period),
            LogEngine::LegacyDir(log) => log.read_range(period),
            LogEngine::Null => Ok(None),
        }
    }

    pub fn list_range(&self, period: Period) -> Result<Option<Period>, LogError> {
        match self {
            LogEngine::Append(log) => log.list_range(period),
            LogEngine::File(log) => log.list_range(period),
            LogEngine::Directory(log) => log.list_range(period),
            LogEngine::LegacyDir(log) => log.list_range(period),
            LogEngine::Null => Ok(None),
        }
    }

    /// Artifacts waiting to be handed to `event`, untouched for at least `settle`.
    pub fn pending_events(&self, settle: Duration, now: SystemTime) -> Result<Vec<PathBuf>, LogError> {
        let (stream, temp_is_dir) = match self {
            LogEngine::Append(log) => (log.stream(), false),
            LogEngine::File(log) => (log.stream(), false),
            LogEngine::Directory(log) => (log.stream(), true),
            LogEngine::LegacyDir(log) => {
                let mut untracked = log.untracked_entries()?;
                untracked.retain(|path| is_settled(path, settle, now));
                return Ok(untracked);
            }
            LogEngine::Null => return Ok(Vec::new()),
        };
        let entries = match stream.scan() {
            Ok(entries) => entries,
            Err(io_err) if io_err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(io_err) => return Err(io_err.into()),
        };
        Ok(entries
            .into_iter()
            .filter(|entry| entry.kind == EntryKind::Temp && entry.is_dir == temp_is_dir)
            .filter(|entry| is_settled(&entry.path, settle, now))
            .map(|entry| entry.path)
            .collect())
    }
}

fn is_settled(path: &Path, settle: Duration, now: SystemTime) -> bool {
    let Ok(modified) = fs::metadata(path).and_then(|metadata| metadata.modified()) else {
        return false;
    };
    match now.duration_since(modified) {
        Ok(age) => age >= settle,
        // modified in the future
        Err(_) => false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorAction {
    Continue,
    /// Close and reopen every stream.
    Restart,
    /// Restarting did not help, give up.
    Fatal,
}

/// Tells a run of unrelated failures, a systemic fault, from isolated ones.
#[derive(Debug)]
pub struct FailureSupervisor {
    max_consecutive_failures: u32,
    max_restarts: u32,
    consecutive_failures: u32,
    restarts: u32,
}

impl FailureSupervisor {
    pub fn new(max_consecutive_failures: u32, max_restarts: u32) -> FailureSupervisor {
        FailureSupervisor {
            max_consecutive_failures: max_consecutive_failures.max(1),
            max_restarts,
            consecutive_failures: 0,
            restarts: 0,
        }
    }

    pub fn record(&mut self, ok: bool) -> SupervisorAction {
        if ok {
            self.consecutive_failures = 0;
            self.restarts = 0;
            return SupervisorAction::Continue;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures < self.max_consecutive_failures {
            return SupervisorAction::Continue;
        }
        self.consecutive_failures = 0;
        if self.restarts >= self.max_restarts {
            return SupervisorAction::Fatal;
        }
        self.restarts += 1;
        SupervisorAction::Restart
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub log_type: LogType,
    pub cp: String,
    pub side: Option<Side>,
}

/// Every stream of the daemon.
pub struct StreamSet {
    streams: Vec<(StreamKey, LogEngine)>,
}

impl StreamSet {
    /// Builds one engine per log type of the catalog and CP, none of them open.
    pub fn build(ctx: &EngineContext, cps: &[CpIdentity]) -> Result<StreamSet, LogError> {
        let mut streams: Vec<(StreamKey, LogEngine)> = Vec::new();
        for cp in cps {
            for entry in ctx.catalog.entries() {
                // streams shared by both sides of a CP are keyed without a side
                let side = if entry.path_template.contains("{side}") {
                    cp.side
                } else {
                    None
                };
                let key = StreamKey {
                    log_type: entry.log_type,
                    cp: cp.name.clone(),
                    side,
                };
                if streams.iter().any(|(other, _)| *other == key) {
                    continue;
                }
                let engine = ctx.catalog.instantiate(ctx, entry.log_type, cp)?;
                if let LogEngine::Null = engine {
                    debug!(cp=%cp.name, log_type=%entry.log_type, "log type not present on this CP");
                }
                streams.push((key, engine));
            }
        }
        Ok(StreamSet { streams })
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StreamKey, &LogEngine)> + '_ {
        self.streams.iter().map(|(key, engine)| (key, engine))
    }

    pub fn get(&self, log_type: LogType, cp: &str, side: Option<Side>) -> Option<&LogEngine> {
        self.find(log_type, cp, side).map(|index| &self.streams[index].1)
    }

    pub fn get_mut(
        &mut self,
        log_type: LogType,
        cp: &str,
        side: Option<Side>,
    ) -> Option<&mut LogEngine> {
        self.find(log_type, cp, side)
            .map(move |index| &mut self.streams[index].1)
    }

    fn find(&self, log_type: LogType, cp: &str, side: Option<Side>) -> Option<usize> {
        self.streams.iter().position(|(key, _)| {
            key.log_type == log_type && key.cp == cp && (key.side == side || key.side.is_none())
        })
    }

    /// Opens every stream. A stream failing to open is logged and left closed.
    ///
    /// Returns the number of streams that failed.
    pub fn open_all(&mut self) -> usize {
        let mut failures = 0;
        for (key, engine) in &mut self.streams {
            if let Err(err) = engine.open() {
                error!(log_type=%key.log_type, cp=%key.cp, error=%err, "failed to open stream");
                failures += 1;
            }
        }
        info!(num_streams = self.streams.len(), failures, "streams open");
        failures
    }

    pub fn close_all(&mut self) {
        for (key, engine) in &mut self.streams {
            if let Err(err) = engine.close() {
                warn!(log_type=%key.log_type, cp=%key.cp, error=%err, "failed to close stream");
            }
        }
    }

    pub fn pending_events(&self, settle: Duration) -> Vec<PathBuf> {
        let now = SystemTime::now();
        let mut pending = Vec::new();
        for (key, engine) in &self.streams {
            if !engine.is_open() {
                continue;
            }
            match engine.pending_events(settle, now) {
                Ok(paths) => pending.extend(paths),
                Err(err) => {
                    warn!(log_type=%key.log_type, cp=%key.cp, error=%err, "failed to list pending events")
                }
            }
        }
        pending
    }

    /// Routes `path` to the engine owning its parent directory.
    pub fn dispatch(&mut self, path: &Path) -> Result<InsertOutcome, LogError> {
        let parent = path.parent();
        let Some((_, engine)) = self
            .streams
            .iter_mut()
            .find(|(_, engine)| engine.dir().is_some() && engine.dir() == parent)
        else {
            return Err(FormatError::new(format!("no stream owns {}", path.display())).into());
        };
        debug!(file=%path.display(), engine=engine.kind_name(), "dispatching event");
        engine.event(path)
    }
}
