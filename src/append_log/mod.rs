//! Log streams made of framed records appended to a chain of subfiles.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Buf;
use tracing::{debug, info, warn};

use crate::engine::Alarms;
use crate::error::{IntegrityError, LogError};
use crate::frame::{FrameWriter, BOOTSTRAP_LEN, HEADER_LEN};
use crate::persist_policy::PersistState;
use crate::retention::{evict_one, select_eviction_target, Quota, SelQuotaSplit, Span};
use crate::rolling::{EntryKind, StreamDir, SubfileName};
use crate::time::{Clock, TimeValue};
use crate::{PersistAction, PersistPolicy, Period};

mod reader;

pub(crate) use self::reader::{inspect_subfile, Inspection};
pub use self::reader::RangeReader;

#[derive(Clone, Debug)]
pub struct AppendLogConfig {
    /// Max bytes of records held by one subfile, bootstrap field excluded.
    pub max_subfile_size: u64,
    pub quota: Quota,
    pub sel_split: Option<SelQuotaSplit>,
    pub persist_policy: PersistPolicy,
}

/// A record as handed out by range reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event<'a> {
    pub cp_time: TimeValue,
    pub ap_time: TimeValue,
    pub payload: &'a [u8],
}

pub trait EventFilter {
    fn test(&mut self, payload: &[u8]) -> bool;
}

impl<F: FnMut(&[u8]) -> bool> EventFilter for F {
    fn test(&mut self, payload: &[u8]) -> bool {
        self(payload)
    }
}

/// Accepts every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl EventFilter for AcceptAll {
    fn test(&mut self, _payload: &[u8]) -> bool {
        true
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubfileInfo {
    pub name: SubfileName,
    pub path: PathBuf,
    pub first_time: TimeValue,
    pub last_time: TimeValue,
    pub size_bytes: u64,
    pub num_records: usize,
}

impl SubfileInfo {
    fn span(&self) -> Span {
        Span::new(self.first_time, self.last_time)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Number of subfiles removed to make room.
    pub evicted: usize,
    /// The quota could not be honored, the record was stored anyway.
    pub over_quota: bool,
}

struct Subfile {
    info: SubfileInfo,
    last_offset: u64,
}

struct ActiveWriter {
    name: SubfileName,
    frames: FrameWriter<File>,
}

struct OpenState {
    // sorted by first_time
    subfiles: Vec<Subfile>,
    tracked_total_size: u64,
    // Always appends to the last subfile.
    writer: Option<ActiveWriter>,
    persist_state: PersistState,
}

enum State {
    Closed,
    Open(OpenState),
}

pub struct AppendLog {
    stream: StreamDir,
    config: AppendLogConfig,
    clock: Arc<dyn Clock>,
    alarms: Alarms,
    state: State,
}

impl AppendLog {
    pub fn new(
        stream: StreamDir,
        config: AppendLogConfig,
        clock: Arc<dyn Clock>,
        alarms: Alarms,
    ) -> AppendLog {
        AppendLog {
            stream,
            config,
            clock,
            alarms,
            state: State::Closed,
        }
    }

    pub fn dir(&self) -> &Path {
        self.stream.path()
    }

    pub fn stream(&self) -> &StreamDir {
        &self.stream
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    /// Scans the stream directory and rebuilds the subfile list from disk.
    ///
    /// Corrupted subfiles, empty subfiles and unknown entries are removed.
    /// Subfiles whose name disagrees with the time of their first record are
    /// renamed. A pending temporary file is ingested once the scan is over.
    pub fn open(&mut self) -> Result<(), LogError> {
        self.close()?;
        self.stream.ensure_exists()?;
        let mut subfiles = Vec::new();
        let mut pending_temp_files = Vec::new();
        for entry in self.stream.scan()? {
            match entry.kind {
                EntryKind::Subfile(name) if !entry.is_dir => {
                    match inspect_subfile(name, &entry.path, true)? {
                        Inspection::Valid { info, last_offset } => {
                            subfiles.push(Subfile { info, last_offset })
                        }
                        Inspection::Empty => {
                            debug!(file=%entry.path.display(), "removing subfile without records");
                            self.stream.drop_entry(&entry.path, "no committed record");
                        }
                        Inspection::Corrupted(integrity_err) => {
                            warn!(error=%integrity_err, "corrupted subfile");
                            self.alarms.raise();
                            self.stream.drop_entry(&entry.path, "corrupted subfile");
                        }
                    }
                }
                EntryKind::Temp if !entry.is_dir => pending_temp_files.push(entry.path),
                _ => self.stream.drop_entry(&entry.path, "unrecognized entry"),
            }
        }
        self.rename_to_content(&mut subfiles)?;
        subfiles.sort_by_key(|subfile| (subfile.info.first_time, subfile.info.name));
        let tracked_total_size = subfiles.iter().map(|subfile| subfile.info.size_bytes).sum();
        if self.config.persist_policy.uses_fsync() {
            self.stream.sync()?;
        }
        info!(
            dir=%self.stream.path().display(),
            num_subfiles=subfiles.len(),
            tracked_total_size,
            "append log open"
        );
        self.state = State::Open(OpenState {
            subfiles,
            tracked_total_size,
            writer: None,
            persist_state: self.config.persist_policy.clone().into(),
        });
        if pending_temp_files.len() > 1 {
            warn!(
                count = pending_temp_files.len(),
                "more than one pending temporary file"
            );
        }
        for temp_path in pending_temp_files {
            if let Err(err) = self.event(&temp_path) {
                warn!(file=%temp_path.display(), error=%err, "failed to ingest temporary file");
            }
        }
        Ok(())
    }

    // Filenames cache the time of the first record: the content wins.
    fn rename_to_content(&self, subfiles: &mut [Subfile]) -> io::Result<()> {
        let mut taken: Vec<SubfileName> = subfiles.iter().map(|subfile| subfile.info.name).collect();
        for subfile in subfiles.iter_mut() {
            let canonical = self.stream.pattern().name_for(subfile.info.first_time);
            if canonical.time() == subfile.info.name.time() {
                continue;
            }
            let new_name = self
                .stream
                .free_name(subfile.info.first_time, |name| taken.contains(name));
            let new_path = self.stream.subfile_path(&new_name);
            info!(
                from=%subfile.info.path.display(),
                to=%new_path.display(),
                "renaming subfile to match its first record"
            );
            fs::rename(&subfile.info.path, &new_path)?;
            taken.retain(|name| *name != subfile.info.name);
            taken.push(new_name);
            subfile.info.name = new_name;
            subfile.info.path = new_path;
        }
        Ok(())
    }

    /// Appends a record, evicting old subfiles first if the quota requires it.
    pub fn insert(
        &mut self,
        cp_time: TimeValue,
        mut payload: impl Buf,
        is_sel_event: bool,
    ) -> Result<InsertOutcome, LogError> {
        let payload = payload.copy_to_bytes(payload.remaining());
        let State::Open(state) = &mut self.state else {
            return Err(LogError::NotOpen);
        };
        let frame_len = HEADER_LEN as u64 + payload.len() as u64;
        if frame_len > self.config.max_subfile_size {
            return Err(LogError::RecordTooLarge {
                frame_len,
                max_subfile_size: self.config.max_subfile_size,
            });
        }
        let quota = match &self.config.sel_split {
            Some(sel_split) => sel_split.effective_quota(&self.config.quota, is_sel_event),
            None => self.config.quota,
        };
        let now = self.clock.now();
        let fsync = self.config.persist_policy.uses_fsync();
        let outcome = state.enforce_quota(
            &self.stream,
            frame_len,
            self.config.max_subfile_size,
            &quota,
            now,
            &self.alarms,
        );
        if outcome.evicted > 0 && fsync {
            self.stream.sync()?;
        }
        if let Err(err) = state.append(&self.stream, &self.config, now, cp_time, &payload) {
            // The file still describes the state before this call, start over from there.
            state.writer = None;
            return Err(err);
        }
        Ok(outcome)
    }

    /// Ingests a finished temporary file as a single record, then removes it.
    ///
    /// On a stream sharing its quota with another node, ingested records are
    /// SEL events.
    pub fn event(&mut self, path: &Path) -> Result<InsertOutcome, LogError> {
        if !self.is_open() {
            return Err(LogError::NotOpen);
        }
        let payload = fs::read(path)?;
        let frame_len = (HEADER_LEN + payload.len()) as u64;
        if frame_len > self.config.max_subfile_size {
            self.alarms.raise();
            self.stream.drop_entry(path, "temporary file too large for a record");
            return Err(IntegrityError::new(0, format!("{} bytes cannot fit a record", payload.len()))
                .with_path(path)
                .into());
        }
        let is_sel_event = self.config.sel_split.is_some();
        let outcome = self.insert(TimeValue::EMPTY, &payload[..], is_sel_event)?;
        fs::remove_file(path)?;
        Ok(outcome)
    }

    /// A snapshot of the current subfiles for range reads.
    pub fn reader(&self) -> Result<RangeReader, LogError> {
        let State::Open(state) = &self.state else {
            return Err(LogError::NotOpen);
        };
        Ok(RangeReader::new(state.subfile_infos()))
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
        self.reader()?.read_range(period, filter, on_event)
    }

    pub fn list_range(&self, period: Period) -> Result<Option<Period>, LogError> {
        self.reader()?.list_range(period)
    }

    /// Flushes and releases the writer. Closing a closed log does nothing.
    pub fn close(&mut self) -> Result<(), LogError> {
        let State::Open(mut state) = std::mem::replace(&mut self.state, State::Closed) else {
            return Ok(());
        };
        if let Some(mut writer) = state.writer.take() {
            let action = if self.config.persist_policy.uses_fsync() {
                PersistAction::FlushAndFsync
            } else {
                PersistAction::Flush
            };
            writer.frames.persist(action)?;
        }
        info!(dir=%self.stream.path().display(), "append log closed");
        Ok(())
    }

    pub fn subfiles(&self) -> Vec<SubfileInfo> {
        match &self.state {
            State::Open(state) => state.subfile_infos(),
            State::Closed => Vec::new(),
        }
    }

    pub fn tracked_total_size(&self) -> u64 {
        match &self.state {
            State::Open(state) => state.tracked_total_size,
            State::Closed => 0,
        }
    }

    /// Alarms raised so far by every engine sharing this log's counter.
    pub fn alarm_count(&self) -> u64 {
        self.alarms.count()
    }

    /// Checks the tracked sizes against each other and against the disk.
    pub fn check_integrity(&self) -> Result<(), LogError> {
        let State::Open(state) = &self.state else {
            return Err(LogError::NotOpen);
        };
        let sum: u64 = state.subfiles.iter().map(|subfile| subfile.info.size_bytes).sum();
        if sum != state.tracked_total_size {
            return Err(IntegrityError::new(
                0,
                format!("tracked {} bytes, subfiles sum to {sum}", state.tracked_total_size),
            )
            .with_path(self.stream.path())
            .into());
        }
        for subfile in &state.subfiles {
            let len = fs::metadata(&subfile.info.path)?.len();
            if len != subfile.info.size_bytes {
                return Err(IntegrityError::new(
                    len,
                    format!("expected {} bytes", subfile.info.size_bytes),
                )
                .with_path(&subfile.info.path)
                .into());
            }
        }
        Ok(())
    }
}

impl OpenState {
    fn subfile_infos(&self) -> Vec<SubfileInfo> {
        self.subfiles.iter().map(|subfile| subfile.info.clone()).collect()
    }

    /// True if a frame of `frame_len` bytes goes to a new subfile.
    fn rolls(&self, frame_len: u64, max_subfile_size: u64) -> bool {
        match self.subfiles.last() {
            Some(last) => {
                last.info.size_bytes.saturating_sub(BOOTSTRAP_LEN) + frame_len > max_subfile_size
            }
            None => true,
        }
    }

    /// Evicts subfiles until a frame of `frame_len` bytes fits the quota.
    ///
    /// A frame starting a new subfile also needs room for its bootstrap field.
    /// Evicting the last subfile can change where the frame goes, so this is
    /// decided again after every eviction.
    fn enforce_quota(
        &mut self,
        stream: &StreamDir,
        frame_len: u64,
        max_subfile_size: u64,
        quota: &Quota,
        now: TimeValue,
        alarms: &Alarms,
    ) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        loop {
            let needed = if self.rolls(frame_len, max_subfile_size) {
                frame_len + BOOTSTRAP_LEN
            } else {
                frame_len
            };
            let total_size = self.tracked_total_size + needed;
            let spans: Vec<Span> = self.subfiles.iter().map(|subfile| subfile.info.span()).collect();
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
            let subfiles = &self.subfiles;
            let removed = evict_one(subfiles.len(), target, |index| {
                match stream.remove_entry(&subfiles[index].info.path) {
                    Err(io_err) if io_err.kind() == io::ErrorKind::NotFound => Ok(()),
                    res => res,
                }
            });
            match removed {
                Ok(index) => {
                    let subfile = self.subfiles.remove(index);
                    if self.writer.as_ref().map(|writer| writer.name) == Some(subfile.info.name) {
                        self.writer = None;
                    }
                    self.tracked_total_size -= subfile.info.size_bytes;
                    outcome.evicted += 1;
                    info!(
                        file=%subfile.info.path.display(),
                        size=subfile.info.size_bytes,
                        "evicted subfile"
                    );
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

    fn append(
        &mut self,
        stream: &StreamDir,
        config: &AppendLogConfig,
        now: TimeValue,
        cp_time: TimeValue,
        payload: &[u8],
    ) -> Result<(), LogError> {
        let frame_len = HEADER_LEN as u64 + payload.len() as u64;
        let fsync = config.persist_policy.uses_fsync();
        if self.rolls(frame_len, config.max_subfile_size) {
            if let Some(mut writer) = self.writer.take() {
                writer.frames.persist(PersistAction::Flush)?;
            }
            let name = stream.free_name(now, |name| {
                self.subfiles.iter().any(|subfile| subfile.info.name == *name)
            });
            let file = stream.create_subfile(&name)?;
            let path = stream.subfile_path(&name);
            let frames = match FrameWriter::create(file) {
                Ok(frames) => frames.with_ordered_writes(fsync),
                Err(io_err) => {
                    stream.drop_entry(&path, "failed to initialize subfile");
                    return Err(io_err.into());
                }
            };
            if fsync {
                stream.sync()?;
            }
            info!(file=%path.display(), "new subfile");
            self.subfiles.push(Subfile {
                info: SubfileInfo {
                    name,
                    path,
                    first_time: now,
                    last_time: now,
                    size_bytes: BOOTSTRAP_LEN,
                    num_records: 0,
                },
                last_offset: 0,
            });
            self.tracked_total_size += BOOTSTRAP_LEN;
            self.writer = Some(ActiveWriter { name, frames });
        }
        let Some(last) = self.subfiles.last_mut() else {
            return Err(LogError::NotOpen);
        };
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&last.info.path)?;
            let frames = FrameWriter::resume(file, last.last_offset, last.info.size_bytes)
                .with_ordered_writes(fsync);
            self.writer = Some(ActiveWriter {
                name: last.info.name,
                frames,
            });
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(LogError::NotOpen);
        };
        let offset = writer.frames.append(cp_time, now, payload)?;
        last.last_offset = offset;
        last.info.size_bytes += frame_len;
        last.info.last_time = now;
        if last.info.num_records == 0 {
            last.info.first_time = now;
        }
        last.info.num_records += 1;
        self.tracked_total_size += frame_len;
        if let Some(persist_action) = self.persist_state.should_persist() {
            writer.frames.persist(persist_action)?;
            self.persist_state.update_persisted();
        }
        debug!(file=%last.info.path.display(), offset, size=payload.len(), "appended record");
        Ok(())
    }
}
