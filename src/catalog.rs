//! Which engine runs each log type, where it lives and how much it may keep.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::append_log::{AppendLog, AppendLogConfig};
use crate::engine::{EngineContext, LogEngine};
use crate::error::{FormatError, LogError};
use crate::retention::{Quota, SelQuotaSplit};
use crate::rolling::{NamePattern, NameStyle, StreamDir};
use crate::unit_log::{DirectoryLog, FileLog, HeaderKind, LegacyDirLog, UnitConfig};

const KIB: u64 = 1_024;
const MIB: u64 = 1_024 * KIB;
const DAY_SECS: u64 = 86_400;

/// Max record bytes in a framed subfile, bootstrap field excluded.
pub const FRAMED_MAX_SUBFILE_SIZE: u64 = MIB;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Sel,
    Event,
    Error,
    Xpu,
    Console,
    Core,
    Crash,
}

impl LogType {
    pub const ALL: [LogType; 7] = [
        LogType::Sel,
        LogType::Event,
        LogType::Error,
        LogType::Xpu,
        LogType::Console,
        LogType::Core,
        LogType::Crash,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogType::Sel => "sel",
            LogType::Event => "event",
            LogType::Error => "error",
            LogType::Xpu => "xpu",
            LogType::Console => "console",
            LogType::Core => "core",
            LogType::Crash => "crash",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for LogType {
    type Err = FormatError;

    fn from_str(text: &str) -> Result<LogType, FormatError> {
        LogType::ALL
            .into_iter()
            .find(|log_type| log_type.as_str() == text)
            .ok_or_else(|| FormatError::new(format!("unknown log type {text:?}")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationKind {
    /// Framed records appended to subfiles.
    Framed,
    /// Whole files moved into the stream.
    WholeFile,
    /// Whole directories moved into the stream.
    WholeDir,
    /// Whole files written in place by their producer.
    LegacyDir,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "a")]
    A,
    #[serde(rename = "b")]
    B,
}

impl Side {
    pub fn dir_name(self) -> &'static str {
        match self {
            Side::A => "cpa",
            Side::B => "cpb",
        }
    }
}

impl FromStr for Side {
    type Err = FormatError;

    fn from_str(text: &str) -> Result<Side, FormatError> {
        match text {
            "a" | "cpa" => Ok(Side::A),
            "b" | "cpb" => Ok(Side::B),
            _ => Err(FormatError::new(format!("unknown CP side {text:?}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApzVariant {
    #[default]
    Classic,
    Blade,
    Virtual,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CpIdentity {
    pub name: String,
    /// `None` for a CP without redundant sides.
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub apz: ApzVariant,
}

impl CpIdentity {
    pub fn new(name: impl Into<String>, side: Option<Side>, apz: ApzVariant) -> CpIdentity {
        CpIdentity {
            name: name.into(),
            side,
            apz,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CatalogEntry {
    pub log_type: LogType,
    pub rotation: RotationKind,
    /// Relative to the root directory. `{cp}` is the CP name, `{side}` its
    /// side directory, dropped for CPs without sides.
    pub path_template: &'static str,
    pub prefix: &'static str,
    pub extension: Option<&'static str>,
    pub style: NameStyle,
    pub header: HeaderKind,
    pub quota: Quota,
    pub max_subfile_size: u64,
    pub sel_split: Option<SelQuotaSplit>,
    pub apz_variants: &'static [ApzVariant],
}

const ALL_APZ: &[ApzVariant] = &[ApzVariant::Classic, ApzVariant::Blade, ApzVariant::Virtual];

impl CatalogEntry {
    pub fn name_pattern(&self) -> Result<NamePattern, FormatError> {
        NamePattern::new(self.prefix, self.extension, self.style)
    }

    pub fn applies_to(&self, apz: ApzVariant) -> bool {
        self.apz_variants.contains(&apz)
    }

    pub fn render_path(&self, cp: &CpIdentity) -> PathBuf {
        let mut path = PathBuf::new();
        for segment in self.path_template.split('/') {
            match segment {
                "{side}" => {
                    if let Some(side) = cp.side {
                        path.push(side.dir_name());
                    }
                }
                _ => path.push(segment.replace("{cp}", &cp.name)),
            }
        }
        path
    }
}

fn framed(log_type: LogType, prefix: &'static str, max_total_size: u64, max_age_days: u64) -> CatalogEntry {
    CatalogEntry {
        log_type,
        rotation: RotationKind::Framed,
        path_template: "",
        prefix,
        extension: Some("log"),
        style: NameStyle::Compact,
        header: HeaderKind::Framed,
        quota: Quota {
            max_total_size,
            max_age_secs: max_age_days * DAY_SECS,
            divider_percent: 30,
        },
        max_subfile_size: FRAMED_MAX_SUBFILE_SIZE,
        sel_split: None,
        apz_variants: ALL_APZ,
    }
}

#[derive(Clone, Debug)]
pub struct LogCatalog {
    entries: BTreeMap<LogType, CatalogEntry>,
}

impl Default for LogCatalog {
    fn default() -> Self {
        LogCatalog::default_table()
    }
}

impl LogCatalog {
    pub fn default_table() -> LogCatalog {
        let entries = vec![
            CatalogEntry {
                path_template: "{cp}/{side}/sel",
                sel_split: Some(SelQuotaSplit::default()),
                ..framed(LogType::Sel, "sel", 8 * MIB, 30)
            },
            CatalogEntry {
                path_template: "{cp}/{side}/event",
                ..framed(LogType::Event, "event", 16 * MIB, 30)
            },
            CatalogEntry {
                path_template: "{cp}/{side}/error",
                ..framed(LogType::Error, "error", 16 * MIB, 60)
            },
            CatalogEntry {
                path_template: "{cp}/{side}/xpu",
                apz_variants: &[ApzVariant::Classic],
                ..framed(LogType::Xpu, "xpu", 4 * MIB, 14)
            },
            CatalogEntry {
                log_type: LogType::Console,
                rotation: RotationKind::LegacyDir,
                path_template: "{cp}/{side}/console",
                prefix: "consol",
                extension: Some("txt"),
                style: NameStyle::CompactMicro,
                header: HeaderKind::None,
                quota: Quota {
                    max_total_size: 32 * MIB,
                    max_age_secs: 30 * DAY_SECS,
                    divider_percent: 10,
                },
                max_subfile_size: 0,
                sel_split: None,
                apz_variants: ALL_APZ,
            },
            CatalogEntry {
                log_type: LogType::Core,
                rotation: RotationKind::WholeFile,
                path_template: "{cp}/{side}/core",
                prefix: "core",
                extension: Some("dump"),
                style: NameStyle::CompactMicro,
                header: HeaderKind::LegacyTabular,
                quota: Quota {
                    max_total_size: 512 * MIB,
                    max_age_secs: 90 * DAY_SECS,
                    divider_percent: 10,
                },
                max_subfile_size: 0,
                sel_split: None,
                apz_variants: ALL_APZ,
            },
            CatalogEntry {
                log_type: LogType::Crash,
                rotation: RotationKind::WholeDir,
                path_template: "{cp}/crash",
                prefix: "crash",
                extension: None,
                style: NameStyle::Compact,
                header: HeaderKind::None,
                quota: Quota {
                    max_total_size: 256 * MIB,
                    max_age_secs: 90 * DAY_SECS,
                    divider_percent: 10,
                },
                max_subfile_size: 0,
                sel_split: None,
                apz_variants: &[ApzVariant::Blade, ApzVariant::Virtual],
            },
        ];
        LogCatalog {
            entries: entries
                .into_iter()
                .map(|entry| (entry.log_type, entry))
                .collect(),
        }
    }

    /// Replaces the quota of the given log types.
    pub fn with_overrides(mut self, quotas: &HashMap<LogType, Quota>) -> LogCatalog {
        for (log_type, quota) in quotas {
            if let Some(entry) = self.entries.get_mut(log_type) {
                entry.quota = *quota;
            }
        }
        self
    }

    pub fn entry(&self, log_type: LogType) -> Option<&CatalogEntry> {
        self.entries.get(&log_type)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> + '_ {
        self.entries.values()
    }

    /// Directory of the stream of `log_type` for `cp`.
    pub fn resolve_dir(&self, root_dir: &Path, log_type: LogType, cp: &CpIdentity) -> Option<PathBuf> {
        let entry = self.entry(log_type)?;
        Some(root_dir.join(entry.render_path(cp)))
    }

    /// Builds the engine in charge of `log_type` for `cp`, without opening it.
    ///
    /// Log types that do not exist on the CP's APZ variant get a null engine.
    pub fn instantiate(
        &self,
        ctx: &EngineContext,
        log_type: LogType,
        cp: &CpIdentity,
    ) -> Result<LogEngine, LogError> {
        let Some(entry) = self.entry(log_type) else {
            return Ok(LogEngine::Null);
        };
        if !entry.applies_to(cp.apz) {
            return Ok(LogEngine::Null);
        }
        let stream = StreamDir::new(ctx.root_dir.join(entry.render_path(cp)), entry.name_pattern()?);
        let clock = ctx.clock.clone();
        let alarms = ctx.alarms.clone();
        let unit_config = || UnitConfig {
            quota: entry.quota,
            header: entry.header,
            persist_policy: ctx.persist_policy.clone(),
        };
        let engine = match entry.rotation {
            RotationKind::Framed => {
                let config = AppendLogConfig {
                    max_subfile_size: entry.max_subfile_size,
                    quota: entry.quota,
                    sel_split: entry.sel_split,
                    persist_policy: ctx.persist_policy.clone(),
                };
                LogEngine::Append(AppendLog::new(stream, config, clock, alarms))
            }
            RotationKind::WholeFile => {
                LogEngine::File(FileLog::new(stream, unit_config(), clock, alarms))
            }
            RotationKind::WholeDir => {
                LogEngine::Directory(DirectoryLog::new(stream, unit_config(), clock, alarms))
            }
            RotationKind::LegacyDir => {
                LogEngine::LegacyDir(LegacyDirLog::new(stream, unit_config(), clock, alarms))
            }
        };
        Ok(engine)
    }
}
