//! Structured model of a BIPS Slurm configuration and its per-unit rewrite.
//!
//! The configuration is a shell fragment sourced by the submission script:
//!
//! ```text
//! # regional run
//! JOB_NAME="bips-regional"
//! DATES="20240101 20240102 20240103"
//! export CLEAR_DIR=true
//! ```
//!
//! Lines are parsed into directives (`KEY=value`, optionally prefixed by `export`) and
//! opaque lines (comments, blanks, shell code), so a rewrite only touches the directives it
//! names and serializing an unmodified file reproduces it.

use log::debug;
use std::fmt;
use std::fs;
use std::path::Path;

use super::unit_key::UnitKey;
use crate::errors::{ResubmitError, Result};

pub const DATES_KEY: &str = "DATES";
pub const CLEAR_DIR_KEY: &str = "CLEAR_DIR";
pub const JOB_NAME_KEY: &str = "JOB_NAME";

/// Directives that enable scheduling features the resubmission cannot reproduce
pub const ADVANCED_FEATURE_DIRECTIVES: &[&str] =
    &["SPLIT_SUBMIT", "MODE", "MULTI_SIM", "SPLIT_COUNT"];

const DEFAULT_JOB_NAME: &str = "bips";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Directive {
    key: String,
    value: String,
    exported: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Directive(Directive),
    Other(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerConfig {
    lines: Vec<Line>,
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_line(raw: &str) -> Line {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Line::Other(raw.to_string());
    }

    let (exported, assignment) = match trimmed.strip_prefix("export ") {
        Some(rest) => (true, rest.trim_start()),
        None => (false, trimmed),
    };

    match assignment.split_once('=') {
        Some((key, value)) if is_identifier(key) => Line::Directive(Directive {
            key: key.to_string(),
            value: value.to_string(),
            exported,
        }),
        _ => Line::Other(raw.to_string()),
    }
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value)
}

impl SchedulerConfig {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(parse_line).collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| ResubmitError::io(path, e))?;
        Ok(Self::parse(&text))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string()).map_err(|e| ResubmitError::io(path, e))
    }

    fn directives(&self) -> impl Iterator<Item = &Directive> {
        self.lines.iter().filter_map(|line| match line {
            Line::Directive(d) => Some(d),
            Line::Other(_) => None,
        })
    }

    /// Unquoted value of the first occurrence of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.directives()
            .find(|d| d.key == key)
            .map(|d| unquote(&d.value))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.directives().any(|d| d.key == key)
    }

    /// Number of lines assigning `key`
    pub fn occurrences(&self, key: &str) -> usize {
        self.directives().filter(|d| d.key == key).count()
    }

    pub fn is_exported(&self, key: &str) -> bool {
        self.directives().any(|d| d.key == key && d.exported)
    }

    /// Upsert `key`. The first occurrence is rewritten in place and later duplicates are
    /// dropped; an absent key is appended. `export` is kept as it was unless `exported` is
    /// given.
    fn upsert(&mut self, key: &str, raw_value: String, exported: Option<bool>) {
        let mut seen = false;
        self.lines.retain_mut(|line| match line {
            Line::Directive(d) if d.key == key => {
                if seen {
                    return false;
                }
                seen = true;
                d.value = raw_value.clone();
                if let Some(exported) = exported {
                    d.exported = exported;
                }
                true
            }
            _ => true,
        });

        if !seen {
            self.lines.push(Line::Directive(Directive {
                key: key.to_string(),
                value: raw_value,
                exported: exported.unwrap_or(false),
            }));
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.upsert(key, quote(value), None);
    }

    /// Dates listed in the DATES directive (space or comma separated)
    pub fn dates(&self) -> Vec<String> {
        self.get(DATES_KEY)
            .map(|dates| {
                dates
                    .split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn job_name(&self) -> Option<&str> {
        self.get(JOB_NAME_KEY)
    }

    /// Advanced-feature directives present in this configuration
    pub fn advanced_features(&self) -> Vec<&'static str> {
        ADVANCED_FEATURE_DIRECTIVES
            .iter()
            .copied()
            .filter(|key| self.contains(key))
            .collect()
    }

    /// Narrow the configuration to rerun exactly `unit`:
    ///
    /// - `DATES` becomes the unit key alone
    /// - `export CLEAR_DIR=false`, so the retry keeps output already gathered for other units
    /// - `JOB_NAME` gets a `-resubmit-<unit>` suffix (or defaults to `bips-resubmit-<unit>`)
    ///
    /// Applying this twice gives the same result as applying it once.
    pub fn scope_to_unit(&mut self, unit: &UnitKey) {
        self.set(DATES_KEY, unit.as_str());
        self.upsert(CLEAR_DIR_KEY, "false".to_string(), Some(true));

        let suffix = format!("-resubmit-{}", unit);
        let job_name = match self.job_name() {
            Some(name) if name.ends_with(&suffix) => name.to_string(),
            Some(name) if !name.is_empty() => format!("{}{}", name, suffix),
            _ => format!("{}{}", DEFAULT_JOB_NAME, suffix),
        };
        self.set(JOB_NAME_KEY, &job_name);
    }
}

impl fmt::Display for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            match line {
                Line::Directive(d) if d.exported => writeln!(f, "export {}={}", d.key, d.value)?,
                Line::Directive(d) => writeln!(f, "{}={}", d.key, d.value)?,
                Line::Other(raw) => writeln!(f, "{}", raw)?,
            }
        }
        Ok(())
    }
}

/// Read `src`, scope it to `unit` and write the result to `dst`
pub fn mutate_config_file(src: &Path, dst: &Path, unit: &UnitKey) -> Result<SchedulerConfig> {
    let mut config = SchedulerConfig::load(src)?;
    config.scope_to_unit(unit);
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| ResubmitError::io(parent, e))?;
    }
    config.write(dst)?;
    debug!(
        "Scoped scheduler config unit={} src={} dst={}",
        unit,
        src.display(),
        dst.display()
    );
    Ok(config)
}
