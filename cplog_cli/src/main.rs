use std::path::PathBuf;

use anyhow::Context;
use cplog::append_log::RangeReader;
use cplog::catalog::{CatalogEntry, RotationKind};
use cplog::rolling::{entry_size, EntryKind, StreamDir};
use cplog::{ApzVariant, CpIdentity, Event, LogCatalog, LogType, Period, Side, TimeFormat, TimeValue};
use regex::bytes::Regex;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
struct StreamArgs {
    #[structopt(long, default_value = "/data/cplog")]
    root: PathBuf,
    #[structopt(long)]
    cp: String,
    #[structopt(long)]
    side: Option<Side>,
}

#[derive(Debug, StructOpt)]
struct PeriodArgs {
    #[structopt(long, parse(try_from_str = TimeValue::parse_compact))]
    start: Option<TimeValue>,
    #[structopt(long, parse(try_from_str = TimeValue::parse_compact))]
    end: Option<TimeValue>,
}

impl PeriodArgs {
    fn period(&self) -> anyhow::Result<Period> {
        let period = Period::new(
            self.start.unwrap_or(TimeValue::MIN),
            self.end.unwrap_or(TimeValue::MAX),
        );
        anyhow::ensure!(period.start <= period.end, "--start is after --end");
        Ok(period)
    }
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Subfiles of one stream, or one line per stream without `--log`.
    Summary {
        #[structopt(flatten)]
        stream: StreamArgs,
        #[structopt(long)]
        log: Option<LogType>,
    },
    /// Time span of the data of one stream.
    List {
        #[structopt(flatten)]
        stream: StreamArgs,
        #[structopt(long)]
        log: LogType,
        #[structopt(flatten)]
        period: PeriodArgs,
    },
    /// Records of an append log, newest first.
    Read {
        #[structopt(flatten)]
        stream: StreamArgs,
        #[structopt(long)]
        log: LogType,
        #[structopt(flatten)]
        period: PeriodArgs,
        #[structopt(long)]
        grep: Option<Regex>,
    },
}

/// A stream as seen from the outside, without taking ownership of it.
struct StreamView<'a> {
    entry: &'a CatalogEntry,
    dir: StreamDir,
}

impl<'a> StreamView<'a> {
    fn resolve(catalog: &'a LogCatalog, args: &StreamArgs, log_type: LogType) -> anyhow::Result<Self> {
        let entry = catalog
            .entry(log_type)
            .with_context(|| format!("no catalog entry for {log_type}"))?;
        let cp = CpIdentity::new(args.cp.clone(), args.side, ApzVariant::default());
        let dir = catalog
            .resolve_dir(&args.root, log_type, &cp)
            .with_context(|| format!("no directory for {log_type}"))?;
        Ok(StreamView {
            entry,
            dir: StreamDir::new(dir, entry.name_pattern()?),
        })
    }

    fn is_framed(&self) -> bool {
        self.entry.rotation == RotationKind::Framed
    }

    fn reader(&self) -> anyhow::Result<RangeReader> {
        RangeReader::scan(&self.dir)
            .with_context(|| format!("failed to scan {}", self.dir.path().display()))
    }

    /// Committed units, read from their names only.
    fn units(&self) -> anyhow::Result<Vec<UnitEntry>> {
        let mut units = Vec::new();
        for entry in self.dir.scan()? {
            let EntryKind::Subfile(name) = entry.kind else {
                continue;
            };
            units.push(UnitEntry {
                size_bytes: entry_size(&entry.path)?,
                file_name: entry.file_name,
                time: name.time(),
            });
        }
        Ok(units)
    }

    fn span(&self, period: Period) -> anyhow::Result<Option<Period>> {
        if self.is_framed() {
            return Ok(self.reader()?.list_range(period)?);
        }
        let span = self
            .units()?
            .iter()
            .map(|unit| unit.time)
            .filter(|time| period.contains(*time))
            .fold(None, |span: Option<Period>, time| match span {
                Some(span) => Some(Period::new(span.start.min(time), span.end.max(time))),
                None => Some(Period::new(time, time)),
            });
        Ok(span)
    }
}

struct UnitEntry {
    file_name: String,
    time: TimeValue,
    size_bytes: u64,
}

fn format_span(span: Option<Period>) -> String {
    match span {
        Some(span) => format!("{} .. {}", span.start, span.end),
        None => "empty".to_string(),
    }
}

fn format_payload(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => payload.iter().map(|byte| format!("{byte:02x}")).collect(),
    }
}

fn run_summary_all(args: &StreamArgs) -> anyhow::Result<()> {
    let catalog = LogCatalog::default_table();
    for log_type in LogType::ALL {
        let view = StreamView::resolve(&catalog, args, log_type)?;
        if !view.dir.path().exists() {
            println!("{log_type:<8} absent");
            continue;
        }
        let (count, size_bytes) = if view.is_framed() {
            let reader = view.reader()?;
            let size_bytes = reader.subfiles().iter().map(|info| info.size_bytes).sum::<u64>();
            (reader.subfiles().len(), size_bytes)
        } else {
            let units = view.units()?;
            (units.len(), units.iter().map(|unit| unit.size_bytes).sum())
        };
        println!(
            "{log_type:<8} {count} subfiles\t{size_bytes} bytes\t{}",
            format_span(view.span(Period::all())?)
        );
    }
    Ok(())
}

fn run_summary(args: &StreamArgs, log_type: LogType) -> anyhow::Result<()> {
    let catalog = LogCatalog::default_table();
    let view = StreamView::resolve(&catalog, args, log_type)?;
    if view.is_framed() {
        for info in view.reader()?.subfiles() {
            println!(
                "{}\t{}\t{}\t{} bytes\t{} records",
                info.path.display(),
                info.first_time,
                info.last_time,
                info.size_bytes,
                info.num_records
            );
        }
        return Ok(());
    }
    for unit in view.units()? {
        println!(
            "{}\t{}\t{}\t{} bytes",
            unit.file_name, unit.time, unit.time, unit.size_bytes
        );
    }
    Ok(())
}

fn run_list(args: &StreamArgs, log_type: LogType, period: Period) -> anyhow::Result<()> {
    let catalog = LogCatalog::default_table();
    let view = StreamView::resolve(&catalog, args, log_type)?;
    println!("{}", format_span(view.span(period)?));
    Ok(())
}

fn run_read(
    args: &StreamArgs,
    log_type: LogType,
    period: Period,
    grep: Option<Regex>,
) -> anyhow::Result<()> {
    let catalog = LogCatalog::default_table();
    let view = StreamView::resolve(&catalog, args, log_type)?;
    anyhow::ensure!(view.is_framed(), "{log_type} logs hold no records, use list");
    let filter = |payload: &[u8]| grep.as_ref().map_or(true, |regex| regex.is_match(payload));
    let span = view.reader()?.read_range(period, filter, |event: Event<'_>| {
        println!(
            "{}\t{}\t{}",
            event.ap_time.format(TimeFormat::Pretty),
            event.cp_time.format(TimeFormat::Pretty),
            format_payload(event.payload)
        );
    })?;
    eprintln!("span: {}", format_span(span));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let command = Command::from_args();
    match command {
        Command::Summary { stream, log: None } => {
            run_summary_all(&stream)?;
        }
        Command::Summary {
            stream,
            log: Some(log),
        } => {
            run_summary(&stream, log)?;
        }
        Command::List {
            stream,
            log,
            period,
        } => {
            run_list(&stream, log, period.period()?)?;
        }
        Command::Read {
            stream,
            log,
            period,
            grep,
        } => {
            run_read(&stream, log, period.period()?, grep)?;
        }
    }
    Ok(())
}
