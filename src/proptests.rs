use std::sync::Arc;

use proptest::prop_oneof;
use proptest::strategy::{Just, Strategy};
use tempfile::TempDir;

use crate::append_log::{AcceptAll, AppendLog, AppendLogConfig, Event, RangeReader};
use crate::engine::Alarms;
use crate::frame::{BOOTSTRAP_LEN, HEADER_LEN};
use crate::retention::{Quota, SelQuotaSplit};
use crate::rolling::{NamePattern, NameStyle, StreamDir};
use crate::time::{ManualClock, TimeFormat, TimeValue};
use crate::{Period, PersistAction, PersistPolicy};

const MAX_SUBFILE_SIZE: u64 = 256;
const MAX_TOTAL_SIZE: u64 = 1_500;

#[derive(Debug, Clone)]
enum Operation {
    Insert { payload_len: usize, is_sel: bool },
    Advance { secs: i64 },
    Reopen,
}

struct PropTestEnv {
    tempdir: TempDir,
    clock: ManualClock,
    alarms: Alarms,
    log: AppendLog,
    num_inserts: usize,
}

fn stream(tempdir: &TempDir) -> StreamDir {
    let pattern = NamePattern::new("sel", Some("log"), NameStyle::Compact).unwrap();
    StreamDir::new(tempdir.path(), pattern)
}

impl PropTestEnv {
    fn new(divider_percent: u32) -> Self {
        let tempdir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(TimeValue::from_secs(1_700_000_000));
        let alarms = Alarms::default();
        let config = AppendLogConfig {
            max_subfile_size: MAX_SUBFILE_SIZE,
            quota: Quota {
                max_total_size: MAX_TOTAL_SIZE,
                max_age_secs: 3_600,
                divider_percent,
            },
            sel_split: Some(SelQuotaSplit::default()),
            persist_policy: PersistPolicy::Always(PersistAction::Flush),
        };
        let mut log = AppendLog::new(stream(&tempdir), config, Arc::new(clock.clone()), alarms.clone());
        log.open().unwrap();
        PropTestEnv {
            tempdir,
            clock,
            alarms,
            log,
            num_inserts: 0,
        }
    }

    fn apply(&mut self, op: Operation) {
        match op {
            Operation::Insert {
                payload_len,
                is_sel,
            } => self.insert(payload_len, is_sel),
            Operation::Advance { secs } => self.clock.advance(secs * 1_000_000),
            Operation::Reopen => self.reopen(),
        }
        self.check_ordering();
    }

    fn insert(&mut self, payload_len: usize, is_sel: bool) {
        let alarms_before = self.alarms.count();
        let payload = vec![b'A'; payload_len];
        let outcome = self
            .log
            .insert(TimeValue::EMPTY, &payload[..], is_sel)
            .unwrap();
        self.num_inserts += 1;
        let quota = if is_sel {
            MAX_TOTAL_SIZE * 90 / 100
        } else {
            MAX_TOTAL_SIZE
        };
        assert!(self.log.tracked_total_size() <= quota || outcome.over_quota);
        if outcome.over_quota {
            assert!(self.alarms.count() > alarms_before);
        }
        self.clock.advance(1);
    }

    fn reopen(&mut self) {
        let before = self.log.subfiles();
        self.log.close().unwrap();
        self.log.open().unwrap();
        assert_eq!(self.log.subfiles(), before);
        self.log.check_integrity().unwrap();
    }

    fn check_ordering(&self) {
        let subfiles = self.log.subfiles();
        assert!(subfiles
            .windows(2)
            .all(|pair| pair[0].first_time <= pair[1].first_time));
    }

    fn check_records(&self) {
        self.log.check_integrity().unwrap();
        let reader = RangeReader::scan(&stream(&self.tempdir)).unwrap();
        let tracked_records: usize = self.log.subfiles().iter().map(|info| info.num_records).sum();
        let on_disk_records: usize = reader.subfiles().iter().map(|info| info.num_records).sum();
        assert_eq!(tracked_records, on_disk_records);
        assert!(tracked_records <= self.num_inserts);
        let mut num_read = 0;
        let mut last_seen = TimeValue::MAX;
        reader
            .read_range(Period::all(), AcceptAll, |event: Event<'_>| {
                assert!(event.ap_time <= last_seen);
                last_seen = event.ap_time;
                num_read += 1;
            })
            .unwrap();
        assert_eq!(num_read, tracked_records);
    }
}

fn operation_strategy() -> impl Strategy<Value = Operation> {
    let max_payload_len = MAX_SUBFILE_SIZE as usize - HEADER_LEN;
    prop_oneof![
        6 => (0..=max_payload_len, proptest::bool::weighted(0.3))
            .prop_map(|(payload_len, is_sel)| Operation::Insert { payload_len, is_sel }),
        2 => (0i64..7_200).prop_map(|secs| Operation::Advance { secs }),
        1 => Just(Operation::Reopen),
    ]
}

fn operations_strategy() -> impl Strategy<Value = Vec<Operation>> {
    proptest::collection::vec(operation_strategy(), 1..80)
}

#[test]
fn test_scenario_record_filling_a_subfile() {
    let mut env = PropTestEnv::new(30);
    let max_payload_len = MAX_SUBFILE_SIZE as usize - HEADER_LEN;
    for _ in 0..20 {
        env.apply(Operation::Insert {
            payload_len: max_payload_len,
            is_sel: false,
        });
    }
    assert!(env
        .log
        .subfiles()
        .iter()
        .all(|info| info.size_bytes == BOOTSTRAP_LEN + MAX_SUBFILE_SIZE && info.num_records == 1));
    env.check_records();
}

proptest::proptest! {
    #[test]
    fn test_proptest_append_log((ops, divider_percent) in (operations_strategy(), 0u32..=100)) {
        let mut env = PropTestEnv::new(divider_percent);
        for op in ops {
            env.apply(op);
        }
        env.check_records();
    }

    #[test]
    fn test_proptest_compact_round_trip(secs in 0i64..4_102_444_800, micros in 0i64..1_000_000) {
        let time = TimeValue::from_micros(secs * 1_000_000 + micros);
        let compact = time.format(TimeFormat::Compact);
        assert_eq!(TimeValue::parse_compact(&compact).unwrap(), time.truncate_to_secs());
        let compact_micro = time.format(TimeFormat::CompactMicro);
        assert_eq!(TimeValue::parse_compact(&compact_micro).unwrap(), time);
    }
}
