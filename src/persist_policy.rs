use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PersistAction {
    /// The buffer will be flushed to the OS, but not necessarily to the disk.
    Flush,
    /// The buffer will be flushed to the OS, and the OS will be asked to flush
    /// it to the disk.
    FlushAndFsync,
}

impl PersistAction {
    pub fn is_fsync(self) -> bool {
        self == PersistAction::FlushAndFsync
    }
}

/// When the records appended to a log get pushed to the OS, and to the disk.
///
/// Subfile creation, eviction and renames are always made durable when the
/// policy asks for fsync at all. Appends follow the policy.
#[derive(Clone, Debug)]
pub enum PersistPolicy {
    /// Leave it to the OS.
    DoNothing,
    /// Persist data on the first append after `interval` elapsed.
    OnDelay {
        interval: Duration,
        action: PersistAction,
    },
    /// Persist data after each append.
    Always(PersistAction),
}

impl PersistPolicy {
    /// True if directory changes must be fsynced too.
    pub fn uses_fsync(&self) -> bool {
        match self {
            PersistPolicy::DoNothing => false,
            PersistPolicy::OnDelay { action, .. } | PersistPolicy::Always(action) => {
                action.is_fsync()
            }
        }
    }
}

impl Default for PersistPolicy {
    fn default() -> Self {
        PersistPolicy::Always(PersistAction::Flush)
    }
}

#[derive(Debug)]
pub(crate) enum PersistState {
    OnAppend(PersistAction),
    OnDelay {
        next_persist: Instant,
        interval: Duration,
        action: PersistAction,
    },
    NoOp,
}

impl PersistState {
    pub fn should_persist(&self) -> Option<PersistAction> {
        match self {
            PersistState::OnAppend(action) => Some(*action),
            PersistState::OnDelay {
                action,
                next_persist,
                ..
            } => {
                if *next_persist < Instant::now() {
                    Some(*action)
                } else {
                    None
                }
            }
            PersistState::NoOp => None,
        }
    }

    pub fn update_persisted(&mut self) {
        match self {
            PersistState::OnAppend(_) | PersistState::NoOp => (),
            PersistState::OnDelay {
                ref mut next_persist,
                interval,
                ..
            } => *next_persist = Instant::now() + *interval,
        }
    }
}

impl From<PersistPolicy> for PersistState {
    fn from(val: PersistPolicy) -> PersistState {
        match val {
            PersistPolicy::Always(action) => PersistState::OnAppend(action),
            PersistPolicy::OnDelay { interval, action } => PersistState::OnDelay {
                next_persist: Instant::now() + interval,
                interval,
                action,
            },
            PersistPolicy::DoNothing => PersistState::NoOp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_persists() {
        let state: PersistState = PersistPolicy::Always(PersistAction::Flush).into();
        assert_eq!(state.should_persist(), Some(PersistAction::Flush));
    }

    #[test]
    fn test_on_delay_waits_for_interval() {
        let mut state: PersistState = PersistPolicy::OnDelay {
            interval: Duration::from_secs(3_600),
            action: PersistAction::FlushAndFsync,
        }
        .into();
        assert_eq!(state.should_persist(), None);
        state.update_persisted();
        assert_eq!(state.should_persist(), None);
    }

    #[test]
    fn test_uses_fsync() {
        assert!(!PersistPolicy::DoNothing.uses_fsync());
        assert!(!PersistPolicy::default().uses_fsync());
        assert!(PersistPolicy::Always(PersistAction::FlushAndFsync).uses_fsync());
    }
}
