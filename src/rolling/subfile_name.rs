use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FormatError;
use crate::time::{TimeFormat, TimeValue};

const TEMP_EXTENSION: &str = "tmp";

/// How the time is embedded in a subfile name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameStyle {
    /// `<prefix>_<YYYYMMDD>_<HHMMSS>[_<n>][.<ext>]`
    Compact,
    /// `<prefix>_<YYYYMMDD>_<HHMMSS>_<ffffff>[.<ext>]`
    CompactMicro,
}

/// Identity of a subfile within its stream, as parsed from its name.
///
/// `index` disambiguates compact names created within the same second and is
/// 0 when the name carries none.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubfileName {
    time: TimeValue,
    index: u32,
}

impl SubfileName {
    pub fn new(time: TimeValue, index: u32) -> Self {
        SubfileName { time, index }
    }

    pub fn time(&self) -> TimeValue {
        self.time
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Naming rules of one stream: committed subfiles and temporary entries.
#[derive(Clone, Debug)]
pub struct NamePattern {
    prefix: String,
    extension: Option<String>,
    style: NameStyle,
    main: Regex,
    temp: Regex,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Subfile(SubfileName),
    Temp,
    Unknown,
}

impl NamePattern {
    pub fn new(
        prefix: &str,
        extension: Option<&str>,
        style: NameStyle,
    ) -> Result<NamePattern, FormatError> {
        if prefix.is_empty() || prefix.contains('/') {
            return Err(FormatError::new(format!("invalid prefix {prefix:?}")));
        }
        if extension == Some(TEMP_EXTENSION) {
            return Err(FormatError::new(
                "committed subfiles cannot use the temporary extension",
            ));
        }
        let escaped_prefix = regex::escape(prefix);
        let ext_pattern = match extension {
            Some(ext) => format!(r"\.{}", regex::escape(ext)),
            None => String::new(),
        };
        let time_pattern = match style {
            NameStyle::Compact => r"(\d{8})_(\d{6})()(?:_(\d{1,5}))?",
            NameStyle::CompactMicro => r"(\d{8})_(\d{6})_(\d{6})()",
        };
        let main = Regex::new(&format!("^{escaped_prefix}_{time_pattern}{ext_pattern}$"))
            .map_err(|err| FormatError::new(err.to_string()))?;
        let temp = Regex::new(&format!(r"^{escaped_prefix}(?:_[^/]*)?\.{TEMP_EXTENSION}$"))
            .map_err(|err| FormatError::new(err.to_string()))?;
        Ok(NamePattern {
            prefix: prefix.to_string(),
            extension: extension.map(str::to_string),
            style,
            main,
            temp,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn style(&self) -> NameStyle {
        self.style
    }

    pub fn main_regex(&self) -> &Regex {
        &self.main
    }

    pub fn temp_regex(&self) -> &Regex {
        &self.temp
    }

    pub fn parse(&self, file_name: &str) -> Option<SubfileName> {
        let captures = self.main.captures(file_name)?;
        let date = captures.get(1)?.as_str();
        let time = captures.get(2)?.as_str();
        let micros = captures
            .get(3)
            .map(|m| m.as_str())
            .filter(|micros| !micros.is_empty());
        let time = TimeValue::parse(date, time, micros).ok()?;
        let index = match captures.get(4).map(|m| m.as_str()) {
            Some(index) if !index.is_empty() => index.parse::<u32>().ok()?,
            _ => 0,
        };
        let name = SubfileName { time, index };
        // `_0` or `_007` would not round trip.
        if self.filename(&name) != file_name {
            return None;
        }
        Some(name)
    }

    pub fn is_temp(&self, file_name: &str) -> bool {
        self.temp.is_match(file_name)
    }

    pub fn classify(&self, file_name: &str) -> EntryKind {
        if let Some(name) = self.parse(file_name) {
            EntryKind::Subfile(name)
        } else if self.is_temp(file_name) {
            EntryKind::Temp
        } else {
            EntryKind::Unknown
        }
    }

    /// Canonical name of a subfile starting at `time`, before any collision handling.
    pub fn name_for(&self, time: TimeValue) -> SubfileName {
        let time = match self.style {
            NameStyle::Compact => time.truncate_to_secs(),
            NameStyle::CompactMicro => time,
        };
        SubfileName { time, index: 0 }
    }

    /// Resolves a collision with `name` by moving to the next candidate.
    pub fn next_candidate(&self, name: &SubfileName) -> SubfileName {
        match self.style {
            NameStyle::Compact => SubfileName {
                time: name.time,
                index: name.index + 1,
            },
            NameStyle::CompactMicro => SubfileName {
                time: TimeValue::from_micros(name.time.as_micros() + 1),
                index: 0,
            },
        }
    }

    pub fn filename(&self, name: &SubfileName) -> String {
        let mut file_name = format!("{}_", self.prefix);
        match self.style {
            NameStyle::Compact => {
                file_name.push_str(&name.time.format(TimeFormat::Compact));
                if name.index > 0 {
                    file_name.push_str(&format!("_{}", name.index));
                }
            }
            NameStyle::CompactMicro => {
                file_name.push_str(&name.time.format(TimeFormat::CompactMicro));
            }
        }
        if let Some(ext) = &self.extension {
            file_name.push('.');
            file_name.push_str(ext);
        }
        file_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compact() -> NamePattern {
        NamePattern::new("sel", Some("log"), NameStyle::Compact).unwrap()
    }

    fn micro() -> NamePattern {
        NamePattern::new("core", Some("dump"), NameStyle::CompactMicro).unwrap()
    }

    #[test]
    fn test_compact_filename() {
        let pattern = compact();
        let time = TimeValue::parse_compact("20240131_101112").unwrap();
        let name = pattern.name_for(TimeValue::from_micros(time.as_micros() + 999));
        assert_eq!(pattern.filename(&name), "sel_20240131_101112.log");
        assert_eq!(pattern.parse("sel_20240131_101112.log"), Some(name));
    }

    #[test]
    fn test_compact_filename_with_index() {
        let pattern = compact();
        let name = pattern.parse("sel_20240131_101112_12.log").unwrap();
        assert_eq!(name.index(), 12);
        assert_eq!(pattern.filename(&name), "sel_20240131_101112_12.log");
        assert_eq!(
            pattern.next_candidate(&name),
            SubfileName::new(name.time(), 13)
        );
    }

    #[test]
    fn test_compact_rejects_non_canonical_index() {
        let pattern = compact();
        assert_eq!(pattern.parse("sel_20240131_101112_0.log"), None);
        assert_eq!(pattern.parse("sel_20240131_101112_07.log"), None);
    }

    #[test]
    fn test_micro_filename() {
        let pattern = micro();
        let name = pattern.parse("core_20240131_101112_000042.dump").unwrap();
        assert_eq!(name.time().as_micros() % 1_000_000, 42);
        assert_eq!(pattern.filename(&name), "core_20240131_101112_000042.dump");
        let next = pattern.next_candidate(&name);
        assert_eq!(pattern.filename(&next), "core_20240131_101112_000043.dump");
    }

    #[test]
    fn test_invalid_names_rejected() {
        let pattern = compact();
        assert_eq!(pattern.parse("sel_2024013_101112.log"), None);
        assert_eq!(pattern.parse("sel_20240131_101112.txt"), None);
        assert_eq!(pattern.parse("event_20240131_101112.log"), None);
        assert_eq!(pattern.parse("sel_20241331_101112.log"), None);
        assert_eq!(pattern.parse("sel_20240131_101112_123456.log"), None);
        assert_eq!(micro().parse("core_20240131_101112.dump"), None);
    }

    #[test]
    fn test_temp_never_mistaken_for_subfile() {
        let pattern = compact();
        assert_eq!(pattern.classify("sel.tmp"), EntryKind::Temp);
        assert_eq!(pattern.classify("sel_20240131_101112.tmp"), EntryKind::Temp);
        assert_eq!(pattern.classify("sel_20240131_101112.log.tmp"), EntryKind::Temp);
        assert_eq!(pattern.classify("selx.tmp"), EntryKind::Unknown);
        assert_eq!(pattern.classify("random"), EntryKind::Unknown);
        assert!(NamePattern::new("sel", Some("tmp"), NameStyle::Compact).is_err());
    }

    #[test]
    fn test_no_extension() {
        let pattern = NamePattern::new("crash", None, NameStyle::Compact).unwrap();
        let name = pattern.parse("crash_20240131_101112").unwrap();
        assert_eq!(pattern.filename(&name), "crash_20240131_101112");
        assert_eq!(pattern.classify("crash_20240131_101112.zip"), EntryKind::Unknown);
    }

    #[test]
    fn test_prefix_is_escaped() {
        let pattern = NamePattern::new("a.b", Some("log"), NameStyle::Compact).unwrap();
        assert!(pattern.parse("a.b_20240131_101112.log").is_some());
        assert!(pattern.parse("axb_20240131_101112.log").is_none());
    }
}
