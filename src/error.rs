use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::time::TimeValue;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Format error: {0}")]
pub struct FormatError(pub String);

impl FormatError {
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        FormatError(msg.into())
    }
}

/// A subfile whose content cannot be trusted.
///
/// These are never repaired: the offending artifact gets deleted by the
/// engine that found it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Integrity error in {} at offset {offset}: {reason}", display_path(.path))]
pub struct IntegrityError {
    pub path: Option<PathBuf>,
    pub offset: u64,
    pub reason: String,
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "<stream>".to_string(),
    }
}

impl IntegrityError {
    pub fn new(offset: u64, reason: impl Into<String>) -> Self {
        IntegrityError {
            path: None,
            offset,
            reason: reason.into(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// No subfile could be removed to bring a stream back under quota.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Eviction exhausted after {attempts} attempts")]
pub struct EvictionExhausted {
    pub attempts: usize,
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("Io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error("Log is not open")]
    NotOpen,
    #[error("Record of {frame_len} bytes cannot fit a {max_subfile_size} bytes subfile")]
    RecordTooLarge {
        frame_len: u64,
        max_subfile_size: u64,
    },
    #[error("Inverted range: {start:?} > {end:?}")]
    InvertedRange { start: TimeValue, end: TimeValue },
    #[error(transparent)]
    EvictionExhausted(#[from] EvictionExhausted),
    #[error("{operation} is not supported by {kind} logs")]
    Unsupported {
        operation: &'static str,
        kind: &'static str,
    },
}

impl LogError {
    /// Corruption is recovered locally, everything else is the caller's problem.
    pub fn is_integrity(&self) -> bool {
        matches!(self, LogError::Integrity(_))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Io error: {0}")]
    Io(#[from] io::Error),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum PidLockError {
    #[error("Io error: {0}")]
    Io(#[from] io::Error),
    #[error("Already running with pid {0}")]
    AlreadyRunning(i32),
}
