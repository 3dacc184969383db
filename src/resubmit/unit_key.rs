//! Unit keys and the tokens embedded in job output file names

use chrono::NaiveDate;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::errors::{ResubmitError, Result};

/// `<prefix>_<token>.out`; the token is everything after the last underscore
static ARTIFACT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.+_([^_]+)\.out$").expect("artifact name pattern is valid"));

/// A work unit: one simulated calendar day, written as `YYYYMMDD`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey {
    key: String,
    date: NaiveDate,
}

impl UnitKey {
    pub fn parse(token: &str) -> Result<Self> {
        parse_date_token(token)
            .map(|date| Self {
                key: token.to_string(),
                date,
            })
            .ok_or_else(|| ResubmitError::InvalidUnitKey(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }
}

impl FromStr for UnitKey {
    type Err = ResubmitError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Exactly eight ASCII digits forming a real calendar date
pub fn parse_date_token(token: &str) -> Option<NaiveDate> {
    if token.len() != 8 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = token[0..4].parse().ok()?;
    let month: u32 = token[4..6].parse().ok()?;
    let day: u32 = token[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn is_valid_date_token(token: &str) -> bool {
    parse_date_token(token).is_some()
}

/// Extract the date-like token from a job output file name, e.g.
/// `bips_regional_20240102.out` -> `20240102`. The token is not validated.
pub fn artifact_token(file_name: &str) -> Option<&str> {
    ARTIFACT_NAME
        .captures(file_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// True if the file name carries a valid date token equal to `unit`
pub fn artifact_belongs_to(file_name: &str, unit: &UnitKey) -> bool {
    artifact_token(file_name)
        .and_then(|token| UnitKey::parse(token).ok())
        .is_some_and(|key| key == *unit)
}
