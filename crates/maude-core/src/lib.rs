//! Core domain model for the MAUDE local mirror: table descriptors, ledger
//! records, year requests, and the shared error/warning vocabulary.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "maude-core";

/// First year any MAUDE table publishes data for.
pub const DATASET_FIRST_YEAR: i32 = 1991;

/// Identifier of an ingested table. Doubles as the SQL table name, so it is
/// restricted to `[a-z_][a-z0-9_]*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableId(String);

impl TableId {
    pub fn new(raw: impl Into<String>) -> Result<Self, EngineError> {
        let raw = raw.into();
        let mut chars = raw.chars();
        let valid_head = chars
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false);
        let valid_tail = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid_head || !valid_tail || raw.starts_with("_load") {
            return Err(EngineError::InvalidRequest(format!(
                "'{raw}' is not a valid table identifier"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TableId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TableId::new(value)
    }
}

impl From<TableId> for String {
    fn from(value: TableId) -> Self {
        value.0
    }
}

/// Prefix used by a per-year table before a schema change renamed its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyPrefix {
    /// Years strictly before this one use `prefix`.
    pub before_year: i32,
    pub prefix: String,
}

/// How the upstream publishes a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum Distribution {
    /// One `{prefix}{year}` file per calendar year.
    PerYear {
        #[serde(default)]
        legacy: Option<LegacyPrefix>,
    },
    /// One `{prefix}thru{year}` file covering every year up to a cutoff. Rows
    /// are assigned to years through `date_column`.
    Cumulative { date_column: String },
}

/// Immutable configuration for one table type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub table: TableId,
    pub prefix: String,
    pub distribution: Distribution,
    pub earliest_year: i32,
    pub current_year_alias: String,
    #[serde(default)]
    pub size_warning: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub index_columns: Vec<String>,
}

impl SourceDescriptor {
    /// File-name prefix in force for `year`, honoring the schema-era exception.
    pub fn prefix_for_year(&self, year: i32) -> &str {
        match &self.distribution {
            Distribution::PerYear {
                legacy: Some(legacy),
            } if year < legacy.before_year => &legacy.prefix,
            Distribution::PerYear { .. } | Distribution::Cumulative { .. } => &self.prefix,
        }
    }

    pub fn is_cumulative(&self) -> bool {
        matches!(self.distribution, Distribution::Cumulative { .. })
    }

    pub fn date_column(&self) -> Option<&str> {
        match &self.distribution {
            Distribution::Cumulative { date_column } => Some(date_column),
            Distribution::PerYear { .. } => None,
        }
    }
}

/// One persisted ledger row per (table, year).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRecord {
    pub table: TableId,
    pub year: i32,
    pub file_path: String,
    pub fingerprint: String,
    pub loaded_at: DateTime<Utc>,
    pub row_count: u64,
}

/// Which years an ingestion request covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YearSpec {
    Single(i32),
    List(Vec<i32>),
    Range { start: i32, end: i32 },
    AllAvailable,
    MostRecentComplete,
    Current,
}

impl YearSpec {
    /// Expand into a sorted, de-duplicated year list.
    pub fn resolve(&self, now_year: i32) -> Result<Vec<i32>, EngineError> {
        let years: BTreeSet<i32> = match self {
            YearSpec::Single(year) => BTreeSet::from([*year]),
            YearSpec::List(years) => years.iter().copied().collect(),
            YearSpec::Range { start, end } => {
                if start > end {
                    return Err(EngineError::InvalidRequest(format!(
                        "year range {start}-{end} is reversed"
                    )));
                }
                (*start..=*end).collect()
            }
            YearSpec::AllAvailable => (DATASET_FIRST_YEAR..=now_year).collect(),
            YearSpec::MostRecentComplete => BTreeSet::from([now_year - 1]),
            YearSpec::Current => BTreeSet::from([now_year]),
        };
        Ok(years.into_iter().collect())
    }
}

impl FromStr for YearSpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse_year = |raw: &str| {
            raw.trim()
                .parse::<i32>()
                .map_err(|_| EngineError::InvalidRequest(format!("'{raw}' is not a year")))
        };

        match s.to_ascii_lowercase().as_str() {
            "all" => return Ok(YearSpec::AllAvailable),
            "latest" => return Ok(YearSpec::MostRecentComplete),
            "current" => return Ok(YearSpec::Current),
            _ => {}
        }

        if s.contains(',') {
            let years = s
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(parse_year)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(YearSpec::List(years));
        }

        if let Some((start, end)) = s.split_once('-') {
            return Ok(YearSpec::Range {
                start: parse_year(start)?,
                end: parse_year(end)?,
            });
        }

        Ok(YearSpec::Single(parse_year(s)?))
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    #[error("source unavailable for {table} {year}: {reason}")]
    SourceUnavailable {
        table: String,
        year: i32,
        reason: String,
    },
    #[error("archive {} is corrupt: {reason}", path.display())]
    ArchiveCorrupt { path: PathBuf, reason: String },
    #[error("schema drift in {table}: {details}")]
    SchemaDrift { table: String, details: String },
    #[error("ledger inconsistency for {table} ({file_path}): {details}")]
    LedgerInconsistency {
        table: String,
        file_path: String,
        details: String,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    MissingFile,
    FallbackUsed,
    ArchiveCorrupt,
    UnparseableDate,
    SchemaDrift,
    MalformedLine,
    InvalidYear,
    Availability,
    SizeAdvisory,
}

/// Non-fatal outcome accumulated during ingestion and handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestWarning {
    pub kind: WarningKind,
    pub table: Option<TableId>,
    pub year: Option<i32>,
    pub message: String,
}

impl IngestWarning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            table: None,
            year: None,
            message: message.into(),
        }
    }

    pub fn for_table(mut self, table: &TableId) -> Self {
        self.table = Some(table.clone());
        self
    }

    pub fn for_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }
}

impl fmt::Display for IngestWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.table, self.year) {
            (Some(table), Some(year)) => write!(f, "[{table} {year}] {}", self.message),
            (Some(table), None) => write!(f, "[{table}] {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}
