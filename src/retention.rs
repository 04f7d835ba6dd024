use std::io;

use serde::{Deserialize, Serialize};

use crate::error::EvictionExhausted;
use crate::time::TimeValue;

/// Time span covered by one subfile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub first: TimeValue,
    pub last: TimeValue,
}

impl Span {
    pub fn new(first: TimeValue, last: TimeValue) -> Span {
        Span { first, last }
    }

    pub fn at(time: TimeValue) -> Span {
        Span::new(time, time)
    }
}

/// Aggregate limits of one log stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub max_total_size: u64,
    pub max_age_secs: u64,
    pub divider_percent: u32,
}

impl Quota {
    pub fn max_age_micros(&self) -> i64 {
        i64::try_from(self.max_age_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1_000_000)
    }

    /// The same quota with `max_total_size` reduced to `percent` of itself.
    pub fn scaled(&self, percent: u32) -> Quota {
        Quota {
            max_total_size: self.max_total_size * u64::from(percent.min(100)) / 100,
            ..*self
        }
    }
}

/// Secondary-node SEL quota sharing.
///
/// SEL events written on a stream carrying this split may only use
/// `sel_percent` of the stream quota, the rest is left to the other node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelQuotaSplit {
    pub sel_percent: u32,
}

impl Default for SelQuotaSplit {
    fn default() -> Self {
        SelQuotaSplit { sel_percent: 90 }
    }
}

impl SelQuotaSplit {
    pub fn effective_quota(&self, quota: &Quota, is_sel_event: bool) -> Quota {
        if is_sel_event {
            quota.scaled(self.sel_percent)
        } else {
            *quota
        }
    }
}

/// Picks the subfile to delete next, or `None` when `total_size` fits the quota.
///
/// `spans` must be sorted by `first` ascending and `total_size` must already
/// account for the pending write.
///
/// If the oldest subfile is older than `max_age`, it goes. Otherwise the
/// subfile at `ceil(count * divider_percent / 100)` goes, which keeps the
/// oldest history around while a stream fills up quickly. The formula is
/// applied as is on short lists, where it can select the newest subfile.
pub fn select_eviction_target(
    spans: &[Span],
    total_size: u64,
    quota: &Quota,
    now: TimeValue,
) -> Option<usize> {
    if total_size <= quota.max_total_size || spans.is_empty() {
        return None;
    }
    let age = now - spans[0].last;
    if age >= quota.max_age_micros() {
        return Some(0);
    }
    let count = spans.len();
    let divider = quota.divider_percent.min(100) as usize;
    let div_index = (count * divider + 99) / 100;
    Some(div_index.min(count - 1))
}

/// Removes one subfile, starting at `target` and moving towards newer ones
/// every time `remove` fails.
///
/// Returns the index that was actually removed.
pub fn evict_one<F>(count: usize, target: usize, mut remove: F) -> Result<usize, EvictionExhausted>
where
    F: FnMut(usize) -> io::Result<()>,
{
    let mut attempts = 0;
    for index in target..count {
        attempts += 1;
        match remove(index) {
            Ok(()) => return Ok(index),
            Err(io_err) => {
                tracing::warn!(index, error=%io_err, "failed to evict subfile, trying next one");
            }
        }
    }
    Err(EvictionExhausted { attempts })
}
