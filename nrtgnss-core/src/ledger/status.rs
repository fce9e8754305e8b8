//! Entry status and its stored text form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle of one expected unit.
///
/// `Waiting → {Downloaded → Processed, Failed, TooLate}`. `Late(n)` is a
/// reporting flavour of `Waiting` and behaves exactly like it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerStatus {
    Waiting,
    /// Waiting for `n` days past its day (1..=3).
    Late(u8),
    Downloaded,
    Processed,
    Failed,
    TooLate,
}

/// Deepest graded lateness tracked before `TooLate` takes over.
pub const MAX_GRADED_DAYS: u8 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown ledger status '{0}'")]
pub struct UnknownStatus(pub String);

impl LedgerStatus {
    pub fn as_str(&self) -> String {
        match self {
            LedgerStatus::Waiting => "Waiting".into(),
            LedgerStatus::Late(1) => "1 day late".into(),
            LedgerStatus::Late(n) => format!("{n} days late"),
            LedgerStatus::Downloaded => "Downloaded".into(),
            LedgerStatus::Processed => "Processed".into(),
            LedgerStatus::Failed => "Failed".into(),
            LedgerStatus::TooLate => "Too Late".into(),
        }
    }

    /// Still expected: plain waiting or graded lateness.
    pub fn is_waiting(&self) -> bool {
        matches!(self, LedgerStatus::Waiting | LedgerStatus::Late(_))
    }

    /// No core operation moves an entry out of these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LedgerStatus::Processed | LedgerStatus::Failed | LedgerStatus::TooLate)
    }

    /// Stored forms of every waiting flavour.
    pub fn waiting_states() -> Vec<String> {
        std::iter::once(LedgerStatus::Waiting)
            .chain((1..=MAX_GRADED_DAYS).map(LedgerStatus::Late))
            .map(|s| s.as_str())
            .collect()
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl FromStr for LedgerStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => return Ok(LedgerStatus::Waiting),
            "Downloaded" => return Ok(LedgerStatus::Downloaded),
            "Processed" => return Ok(LedgerStatus::Processed),
            "Failed" => return Ok(LedgerStatus::Failed),
            "Too Late" => return Ok(LedgerStatus::TooLate),
            _ => {}
        }
        let days = s
            .strip_suffix(" days late")
            .or_else(|| s.strip_suffix(" day late"))
            .and_then(|n| n.parse::<u8>().ok())
            .filter(|n| (1..=MAX_GRADED_DAYS).contains(n));
        days.map(LedgerStatus::Late).ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_forms_parse_back() {
        for status in [
            LedgerStatus::Waiting,
            LedgerStatus::Late(1),
            LedgerStatus::Late(2),
            LedgerStatus::Late(3),
            LedgerStatus::Downloaded,
            LedgerStatus::Processed,
            LedgerStatus::Failed,
            LedgerStatus::TooLate,
        ] {
            assert_eq!(status.as_str().parse::<LedgerStatus>(), Ok(status));
        }
    }

    #[test]
    fn graded_wording() {
        assert_eq!(LedgerStatus::Late(1).as_str(), "1 day late");
        assert_eq!(LedgerStatus::Late(3).as_str(), "3 days late");
        assert!("4 days late".parse::<LedgerStatus>().is_err());
        assert!("On Time".parse::<LedgerStatus>().is_err());
    }

    #[test]
    fn waiting_flavours() {
        assert!(LedgerStatus::Late(2).is_waiting());
        assert!(!LedgerStatus::TooLate.is_waiting());
        assert!(LedgerStatus::TooLate.is_terminal());
        assert_eq!(
            LedgerStatus::waiting_states(),
            vec!["Waiting", "1 day late", "2 days late", "3 days late"]
        );
    }
}
