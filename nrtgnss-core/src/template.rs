//! Path/filename template language used by provider descriptors.
//!
//! Templates are parsed once at catalog load so an unknown placeholder is a
//! configuration error rather than a per-task failure.
//!
//! | placeholder   | renders                                   |
//! |---------------|-------------------------------------------|
//! | `{year}`      | 4-digit year                              |
//! | `{yy}`        | 2-digit year                              |
//! | `{doy}`       | 3-digit day-of-year                       |
//! | `{hour}`      | 2-digit hour (`00` for daily keys)        |
//! | `{hour_char}` | hour code `a`–`x` (`0` for daily keys)    |
//! | `{HOUR_CHAR}` | uppercase hour code                       |
//! | `{minute}`    | `00`/`15`/`30`/`45` (`00` when absent)    |
//! | `{station}`   | lowercase station code                    |
//! | `{STATION}`   | uppercase station code                    |

use crate::timekey::TimeKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder '{{{0}}}'")]
    UnknownPlaceholder(String),

    #[error("unclosed placeholder starting at byte {0}")]
    Unclosed(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Year,
    Yy,
    Doy,
    Hour,
    HourChar,
    HourCharUpper,
    Minute,
    Station,
    StationUpper,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "year" => Field::Year,
            "yy" => Field::Yy,
            "doy" => Field::Doy,
            "hour" => Field::Hour,
            "hour_char" => Field::HourChar,
            "HOUR_CHAR" => Field::HourCharUpper,
            "minute" => Field::Minute,
            "station" => Field::Station,
            "STATION" => Field::StationUpper,
            _ => return None,
        })
    }

    fn render(self, key: &TimeKey, station: &str, out: &mut String) {
        use std::fmt::Write;
        // Writing to a String cannot fail.
        let _ = match self {
            Field::Year => write!(out, "{}", key.year()),
            Field::Yy => write!(out, "{:02}", key.yy()),
            Field::Doy => write!(out, "{:03}", key.doy()),
            Field::Hour => write!(out, "{:02}", key.hour().unwrap_or(0)),
            Field::HourChar => write!(out, "{}", key.hour_char().unwrap_or('0')),
            Field::HourCharUpper => write!(out, "{}", key.hour_char().unwrap_or('0').to_ascii_uppercase()),
            Field::Minute => write!(out, "{:02}", key.minute().unwrap_or(0)),
            Field::Station => write!(out, "{}", station.to_ascii_lowercase()),
            Field::StationUpper => write!(out, "{}", station.to_ascii_uppercase()),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// A parsed template. Keeps its source text for display and serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or(TemplateError::Unclosed(offset + open))?;
            let name = &after[..close];
            let field = Field::parse(name).ok_or_else(|| TemplateError::UnknownPlaceholder(name.to_string()))?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Field(field));
            let consumed = open + 1 + close + 1;
            offset += consumed;
            rest = &rest[consumed..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn render(&self, key: &TimeKey, station: &str) -> String {
        let mut out = String::with_capacity(self.source.len() + 8);
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(f) => f.render(key, station, &mut out),
            }
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True when the rendered text is a pattern to match against a listing.
    pub fn has_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Literal(l) if l.contains('*')))
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Template {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Template::parse(&source).map_err(serde::de::Error::custom)
    }
}

/// Match `name` against a pattern where `*` stands for any run of characters.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !name.starts_with(first) || name.len() < first.len() + last.len() {
        return false;
    }

    let mut cursor = first.len();
    let end = name.len() - last.len();
    for middle in &parts[1..parts.len() - 1] {
        match name[cursor..end].find(middle) {
            Some(pos) => cursor += pos + middle.len(),
            None => return false,
        }
    }
    name[cursor..].ends_with(last) && cursor <= end
}
