//! Per-(table, year) load records and the skip/reload decision built on them.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maude_core::{EngineError, LoadRecord, TableId};
use sqlx::{Row, SqliteConnection};

use crate::IngestError;

#[async_trait]
pub trait LoadRecordRepository: Send {
    async fn get(&mut self, table: &TableId, year: i32) -> Result<Option<LoadRecord>, IngestError>;

    /// Insert or replace the record for (table, year).
    async fn put(&mut self, record: &LoadRecord) -> Result<(), IngestError>;

    async fn records_for_table(&mut self, table: &TableId) -> Result<Vec<LoadRecord>, IngestError>;

    async fn all_records(&mut self) -> Result<Vec<LoadRecord>, IngestError>;
}

/// Ledger rows in `_load_ledger`, read and written on the caller's connection
/// so they share its transaction.
pub struct SqlLedger<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> SqlLedger<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }
}

const SELECT_RECORD: &str =
    "SELECT table_name, year, file_path, file_fingerprint, loaded_at, row_count FROM _load_ledger";

fn decode_record(row: &sqlx::sqlite::SqliteRow) -> Result<LoadRecord, IngestError> {
    let table: String = row.try_get("table_name")?;
    let row_count: i64 = row.try_get("row_count")?;
    let loaded_at: DateTime<Utc> = row.try_get("loaded_at")?;
    Ok(LoadRecord {
        table: TableId::new(table)?,
        year: row.try_get("year")?,
        file_path: row.try_get("file_path")?,
        fingerprint: row.try_get("file_fingerprint")?,
        loaded_at,
        row_count: row_count.max(0) as u64,
    })
}

#[async_trait]
impl LoadRecordRepository for SqlLedger<'_> {
    async fn get(&mut self, table: &TableId, year: i32) -> Result<Option<LoadRecord>, IngestError> {
        let sql = format!("{SELECT_RECORD} WHERE table_name = ? AND year = ?");
        let row = sqlx::query(&sql)
            .bind(table.as_str())
            .bind(year)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(decode_record).transpose()
    }

    async fn put(&mut self, record: &LoadRecord) -> Result<(), IngestError> {
        sqlx::query(
            "INSERT OR REPLACE INTO _load_ledger \
             (table_name, year, file_path, file_fingerprint, loaded_at, row_count) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.table.as_str())
        .bind(record.year)
        .bind(&record.file_path)
        .bind(&record.fingerprint)
        .bind(record.loaded_at)
        .bind(record.row_count as i64)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    async fn records_for_table(&mut self, table: &TableId) -> Result<Vec<LoadRecord>, IngestError> {
        let sql = format!("{SELECT_RECORD} WHERE table_name = ? ORDER BY year");
        let rows = sqlx::query(&sql)
            .bind(table.as_str())
            .fetch_all(&mut *self.conn)
            .await?;
        rows.iter().map(decode_record).collect()
    }

    async fn all_records(&mut self) -> Result<Vec<LoadRecord>, IngestError> {
        let sql = format!("{SELECT_RECORD} ORDER BY table_name, year");
        let rows = sqlx::query(&sql).fetch_all(&mut *self.conn).await?;
        rows.iter().map(decode_record).collect()
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryLedger {
    records: BTreeMap<(TableId, i32), LoadRecord>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoadRecordRepository for InMemoryLedger {
    async fn get(&mut self, table: &TableId, year: i32) -> Result<Option<LoadRecord>, IngestError> {
        Ok(self.records.get(&(table.clone(), year)).cloned())
    }

    async fn put(&mut self, record: &LoadRecord) -> Result<(), IngestError> {
        self.records
            .insert((record.table.clone(), record.year), record.clone());
        Ok(())
    }

    async fn records_for_table(&mut self, table: &TableId) -> Result<Vec<LoadRecord>, IngestError> {
        Ok(self
            .records
            .values()
            .filter(|r| &r.table == table)
            .cloned()
            .collect())
    }

    async fn all_records(&mut self) -> Result<Vec<LoadRecord>, IngestError> {
        Ok(self.records.values().cloned().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDecision {
    /// Loaded from this exact content already.
    Skip,
    /// Loaded before, but the content differs or a refresh was forced.
    Reload,
    /// Never loaded.
    Fresh,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadPlan {
    /// Years whose rows must be deleted and re-derived from the file.
    pub years: Vec<i32>,
    /// Requested years that are already current.
    pub skipped: Vec<i32>,
    /// Years pulled in only because they share the file with a changed year.
    pub rederived: Vec<i32>,
}

impl LoadPlan {
    pub fn is_noop(&self) -> bool {
        self.years.is_empty()
    }
}

pub struct FingerprintLedger;

impl FingerprintLedger {
    pub async fn needs_load<R: LoadRecordRepository + ?Sized>(
        repo: &mut R,
        table: &TableId,
        year: i32,
        fingerprint: &str,
        force_refresh: bool,
    ) -> Result<LoadDecision, IngestError> {
        Ok(match repo.get(table, year).await? {
            None => LoadDecision::Fresh,
            Some(record) if record.fingerprint == fingerprint && !force_refresh => {
                LoadDecision::Skip
            }
            Some(_) => LoadDecision::Reload,
        })
    }

    /// Plan for a file that serves exactly one year. Other years recorded
    /// against the same file name (a current-year alias reused after the
    /// calendar rolls over) keep their rows; only the requested years load.
    pub async fn plan_single_year<R: LoadRecordRepository + ?Sized>(
        repo: &mut R,
        table: &TableId,
        requested_years: &BTreeSet<i32>,
        fingerprint: &str,
        force_refresh: bool,
    ) -> Result<LoadPlan, IngestError> {
        let mut plan = LoadPlan::default();
        for &year in requested_years {
            match Self::needs_load(repo, table, year, fingerprint, force_refresh).await? {
                LoadDecision::Skip => plan.skipped.push(year),
                LoadDecision::Reload | LoadDecision::Fresh => plan.years.push(year),
            }
        }
        Ok(plan)
    }

    /// Decide which years of `table` a load of the cumulative `file_path` must cover.
    ///
    /// When any requested year needs loading, every year already recorded
    /// against the same file joins the plan, since the file is re-read once
    /// and all of its years are re-derived together.
    pub async fn plan<R: LoadRecordRepository + ?Sized>(
        repo: &mut R,
        table: &TableId,
        file_path: &str,
        requested_years: &BTreeSet<i32>,
        fingerprint: &str,
        force_refresh: bool,
    ) -> Result<LoadPlan, IngestError> {
        let existing = repo.records_for_table(table).await?;
        let sharing: Vec<&LoadRecord> =
            existing.iter().filter(|r| r.file_path == file_path).collect();

        let fingerprints: BTreeSet<&str> =
            sharing.iter().map(|r| r.fingerprint.as_str()).collect();
        if fingerprints.len() > 1 {
            return Err(EngineError::LedgerInconsistency {
                table: table.to_string(),
                file_path: file_path.to_string(),
                details: format!(
                    "{} records share the file but carry {} fingerprints",
                    sharing.len(),
                    fingerprints.len()
                ),
            }
            .into());
        }

        let mut load = BTreeSet::new();
        let mut skipped = Vec::new();
        for &year in requested_years {
            match Self::needs_load(repo, table, year, fingerprint, force_refresh).await? {
                LoadDecision::Skip => skipped.push(year),
                LoadDecision::Reload | LoadDecision::Fresh => {
                    load.insert(year);
                }
            }
        }

        if load.is_empty() {
            return Ok(LoadPlan {
                years: Vec::new(),
                skipped,
                rederived: Vec::new(),
            });
        }

        let mut rederived = Vec::new();
        for record in &sharing {
            if !requested_years.contains(&record.year) {
                rederived.push(record.year);
            }
            load.insert(record.year);
        }
        let years: Vec<i32> = load.into_iter().collect();
        skipped.retain(|y| !years.contains(y));

        Ok(LoadPlan {
            years,
            skipped,
            rederived,
        })
    }
}
