pub mod append_log;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
mod persist_policy;
pub mod pidfile;
pub mod retention;
pub mod rolling;
pub mod time;
pub mod unit_log;

pub use append_log::{AcceptAll, AppendLog, AppendLogConfig, Event, EventFilter, InsertOutcome};
pub use catalog::{ApzVariant, CpIdentity, LogCatalog, LogType, Side};
pub use engine::{Alarms, EngineContext, LogEngine, StreamSet};
pub use error::LogError;
pub use persist_policy::{PersistAction, PersistPolicy};
pub use time::{Clock, ManualClock, SystemClock, TimeFormat, TimeValue};

/// A closed time interval, both ends included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Period {
    pub start: TimeValue,
    pub end: TimeValue,
}

impl Period {
    pub fn new(start: TimeValue, end: TimeValue) -> Period {
        Period { start, end }
    }

    /// Every representable instant.
    pub fn all() -> Period {
        Period::new(TimeValue::MIN, TimeValue::MAX)
    }

    pub fn contains(&self, time: TimeValue) -> bool {
        self.start <= time && time <= self.end
    }
}


#[cfg(test)]
mod mockfile;

#[cfg(test)]
mod proptests;
