use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use tracing::{debug, warn};

use super::{Event, EventFilter, SubfileInfo};
use crate::error::{IntegrityError, LogError};
use crate::frame::{validate_chain, ChainWalker, RecordHeader};
use crate::rolling::{EntryKind, StreamDir, SubfileName};
use crate::time::TimeValue;
use crate::Period;

pub(crate) enum Inspection {
    Valid { info: SubfileInfo, last_offset: u64 },
    /// No committed record.
    Empty,
    Corrupted(IntegrityError),
}

/// Validates a subfile and extracts its span.
///
/// With `drop_uncommitted_tail`, bytes written past the last committed record
/// are truncated away.
pub(crate) fn inspect_subfile(
    name: SubfileName,
    path: &Path,
    drop_uncommitted_tail: bool,
) -> io::Result<Inspection> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(drop_uncommitted_tail)
        .open(path)?;
    let file_len = file.metadata()?.len();
    let summary = match validate_chain(&mut file, file_len)? {
        Ok(summary) => summary,
        Err(integrity_err) => return Ok(Inspection::Corrupted(integrity_err.with_path(path))),
    };
    let (Some(first), Some(last)) = (summary.first, summary.last) else {
        return Ok(Inspection::Empty);
    };
    if summary.committed_len < file_len && drop_uncommitted_tail {
        warn!(
            file=%path.display(),
            num_bytes=file_len - summary.committed_len,
            "dropping uncommitted bytes at the end of subfile"
        );
        file.set_len(summary.committed_len)?;
    }
    Ok(Inspection::Valid {
        info: SubfileInfo {
            name,
            path: path.to_path_buf(),
            first_time: first.ap_time,
            last_time: last.ap_time,
            size_bytes: summary.committed_len,
            num_records: summary.num_records,
        },
        last_offset: summary.last_offset,
    })
}

/// A point-in-time view of the subfiles of an append log.
///
/// Readers open their own file handles and never share the writer's: a
/// `RangeReader` can be used while the log keeps receiving inserts. A subfile
/// that disappears in the meantime is skipped.
#[derive(Clone, Debug)]
pub struct RangeReader {
    // sorted by first_time
    subfiles: Vec<SubfileInfo>,
}

impl RangeReader {
    pub fn new(subfiles: Vec<SubfileInfo>) -> RangeReader {
        RangeReader { subfiles }
    }

    /// Builds a snapshot straight from disk, without modifying anything.
    ///
    /// Corrupted subfiles are skipped, not removed: that is the job of the
    /// log owning the directory.
    pub fn scan(stream: &StreamDir) -> Result<RangeReader, LogError> {
        let mut subfiles = Vec::new();
        for entry in stream.scan()? {
            let EntryKind::Subfile(name) = entry.kind else {
                continue;
            };
            if entry.is_dir {
                continue;
            }
            match inspect_subfile(name, &entry.path, false) {
                Ok(Inspection::Valid { info, .. }) => subfiles.push(info),
                Ok(Inspection::Empty) => {}
                Ok(Inspection::Corrupted(integrity_err)) => {
                    warn!(error=%integrity_err, "skipping corrupted subfile");
                }
                Err(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
                Err(io_err) => return Err(io_err.into()),
            }
        }
        subfiles.sort_by_key(|info| (info.first_time, info.name));
        Ok(RangeReader { subfiles })
    }

    pub fn subfiles(&self) -> &[SubfileInfo] {
        &self.subfiles
    }

    /// Calls `on_event` for every record within `period` accepted by `filter`,
    /// newest first, and returns the span of those records.
    pub fn read_range<F, C>(
        &self,
        period: Period,
        mut filter: F,
        mut on_event: C,
    ) -> Result<Option<Period>, LogError>
    where
        F: EventFilter,
        C: FnMut(Event<'_>),
    {
        self.walk(period, |walker, offset, header| {
            let payload = walker.read_payload(offset, header)?;
            if !filter.test(&payload) {
                return Ok(false);
            }
            on_event(Event {
                cp_time: header.cp_time,
                ap_time: header.ap_time,
                payload: &payload,
            });
            Ok(true)
        })
    }

    /// Span of the records within `period`, without reading their payloads.
    pub fn list_range(&self, period: Period) -> Result<Option<Period>, LogError> {
        self.walk(period, |_, _, _| Ok(true))
    }

    fn walk<V>(&self, period: Period, mut visit: V) -> Result<Option<Period>, LogError>
    where
        V: FnMut(&mut ChainWalker<File>, u64, &RecordHeader) -> io::Result<bool>,
    {
        let mut start = TimeValue::MAX;
        let mut stop = TimeValue::MIN;
        let mut found = false;
        for subfile in self.subfiles.iter().rev() {
            if period.start > subfile.last_time {
                // subfiles are time ordered: older ones cannot match either.
                break;
            }
            if period.end < subfile.first_time {
                continue;
            }
            let file = match File::open(&subfile.path) {
                Ok(file) => file,
                Err(io_err) if io_err.kind() == io::ErrorKind::NotFound => {
                    debug!(file=%subfile.path.display(), "subfile vanished during range read");
                    continue;
                }
                Err(io_err) => return Err(io_err.into()),
            };
            let mut walker = ChainWalker::open(file)?;
            loop {
                let (offset, header) = match walker.next_header() {
                    Ok(Some(record)) => record,
                    Ok(None) => break,
                    Err(io_err) if io_err.kind() == io::ErrorKind::InvalidData => {
                        warn!(file=%subfile.path.display(), error=%io_err, "skipping rest of subfile");
                        break;
                    }
                    Err(io_err) => return Err(io_err.into()),
                };
                let time = header.ap_time;
                if time > period.end {
                    continue;
                }
                if time < period.start {
                    break;
                }
                if visit(&mut walker, offset, &header)? {
                    found = true;
                    start = start.min(time);
                    stop = stop.max(time);
                }
            }
        }
        if !found {
            return Ok(None);
        }
        if start > stop {
            return Err(LogError::InvertedRange { start, end: stop });
        }
        Ok(Some(Period::new(start, stop)))
    }
}
