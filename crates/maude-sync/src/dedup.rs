//! Joined report/device queries with event-level deduplication.
//!
//! Several reports (manufacturer, user facility, distributor) can describe
//! the same adverse event. They share an `EVENT_KEY`; one representative row
//! per key is kept, chosen by a [`CanonicalPolicy`]. Rows without a key are
//! never merged with each other.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use maude_core::{EngineError, IngestWarning, WarningKind};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, warn};

use crate::store::{find_column, is_bookkeeping_column, quote_ident, table_columns};
use crate::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Report,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    EqIgnoreCase,
    Gte,
    Lte,
    Like,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub side: Side,
    pub column: String,
    pub op: PredicateOp,
    pub value: String,
}

impl Predicate {
    pub fn new(side: Side, column: impl Into<String>, op: PredicateOp, value: impl Into<String>) -> Self {
        Self {
            side,
            column: column.into(),
            op,
            value: value.into(),
        }
    }
}

/// Inclusive range over the report's received date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

/// Which row of an event group is returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalPolicy {
    /// First row in load order.
    #[default]
    EarliestLoaded,
    LatestLoaded,
    /// Earliest received date, load order breaking ties.
    EarliestReceived,
    /// Manufacturer-submitted reports first, then earliest received. Falls
    /// back to earliest received when the source code column is absent.
    Manufacturer,
    /// The row with the most non-blank fields, load order breaking ties.
    MostComplete,
}

impl FromStr for CanonicalPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "earliest_loaded" => Ok(Self::EarliestLoaded),
            "latest_loaded" => Ok(Self::LatestLoaded),
            "earliest_received" | "first_received" => Ok(Self::EarliestReceived),
            "manufacturer" => Ok(Self::Manufacturer),
            "most_complete" => Ok(Self::MostComplete),
            other => Err(EngineError::InvalidRequest(format!(
                "unknown canonical policy '{other}'"
            ))),
        }
    }
}

impl fmt::Display for CanonicalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EarliestLoaded => "earliest_loaded",
            Self::LatestLoaded => "latest_loaded",
            Self::EarliestReceived => "earliest_received",
            Self::Manufacturer => "manufacturer",
            Self::MostComplete => "most_complete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    pub predicates: Vec<Predicate>,
    pub date_range: Option<DateRange>,
    pub deduplicate: bool,
    pub policy: CanonicalPolicy,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            predicates: Vec::new(),
            date_range: None,
            deduplicate: true,
            policy: CanonicalPolicy::default(),
        }
    }
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn brand_name(self, value: impl Into<String>) -> Self {
        self.device_match("BRAND_NAME", value)
    }

    pub fn generic_name(self, value: impl Into<String>) -> Self {
        self.device_match("GENERIC_NAME", value)
    }

    pub fn manufacturer_name(self, value: impl Into<String>) -> Self {
        self.device_match("MANUFACTURER_D_NAME", value)
    }

    pub fn product_code(self, value: impl Into<String>) -> Self {
        self.device_match("DEVICE_REPORT_PRODUCT_CODE", value)
    }

    fn device_match(self, column: &str, value: impl Into<String>) -> Self {
        self.with_predicate(Predicate::new(Side::Device, column, PredicateOp::EqIgnoreCase, value))
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn received_between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.date_range = Some(DateRange { start, end });
        self
    }

    pub fn deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    pub fn policy(mut self, policy: CanonicalPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    /// Matching joined rows before deduplication.
    pub report_count: u64,
    /// Rows returned.
    pub event_count: u64,
    pub warnings: Vec<IngestWarning>,
}

impl EventRows {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn unique_events(&self, key_column: &str) -> usize {
        match self.column_index(key_column) {
            Some(idx) => count_unique_events(self.rows.iter().map(|row| row[idx].as_deref())),
            None => self.rows.len(),
        }
    }

    /// Events reported more than once among these rows, most-reported first.
    ///
    /// Only meaningful on undeduplicated rows. Blank keys are never grouped.
    pub fn multi_report_events(
        &self,
        key_column: &str,
        report_id_column: &str,
    ) -> Result<Vec<MultiReportEvent>, EngineError> {
        let missing = |column: &str| EngineError::InvalidRequest(format!("result has no {column} column"));
        let key_idx = self.column_index(key_column).ok_or_else(|| missing(key_column))?;
        let id_idx = self
            .column_index(report_id_column)
            .ok_or_else(|| missing(report_id_column))?;

        let mut groups: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for row in &self.rows {
            let Some(key) = row[key_idx].as_deref().map(str::trim).filter(|k| !k.is_empty()) else {
                continue;
            };
            let id = row[id_idx].clone().unwrap_or_default();
            groups.entry(key).or_default().push(id);
        }

        let mut events: Vec<MultiReportEvent> = groups
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(key, report_keys)| MultiReportEvent {
                event_key: key.to_string(),
                report_count: report_keys.len(),
                report_keys,
            })
            .collect();
        events.sort_by(|a, b| b.report_count.cmp(&a.report_count).then_with(|| a.event_key.cmp(&b.event_key)));
        Ok(events)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultiReportEvent {
    pub event_key: String,
    pub report_count: usize,
    pub report_keys: Vec<String>,
}

/// Distinct non-blank keys plus one per blank key; a missing key is its own event.
pub fn count_unique_events<'a>(keys: impl IntoIterator<Item = Option<&'a str>>) -> usize {
    let mut distinct = BTreeSet::new();
    let mut unkeyed = 0;
    for key in keys {
        match key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => {
                distinct.insert(key);
            }
            None => unkeyed += 1,
        }
    }
    distinct.len() + unkeyed
}

#[derive(Debug, Clone)]
pub struct DedupQueryEngine {
    pub report_table: String,
    pub device_table: String,
    pub report_id: String,
    pub event_key: String,
    pub received_column: String,
    pub source_code_column: String,
}

impl Default for DedupQueryEngine {
    fn default() -> Self {
        Self {
            report_table: "master".into(),
            device_table: "device".into(),
            report_id: "MDR_REPORT_KEY".into(),
            event_key: "EVENT_KEY".into(),
            received_column: "DATE_RECEIVED".into(),
            source_code_column: "REPORT_SOURCE_CODE".into(),
        }
    }
}

struct Schema {
    report: Vec<String>,
    device: Vec<String>,
}

impl Schema {
    fn side(&self, side: Side) -> &[String] {
        match side {
            Side::Report => &self.report,
            Side::Device => &self.device,
        }
    }

    fn require<'a>(&'a self, side: Side, table: &str, column: &str) -> Result<&'a str, EngineError> {
        find_column(self.side(side), column).ok_or_else(|| EngineError::SchemaDrift {
            table: table.to_string(),
            details: format!("column {column} does not exist"),
        })
    }
}

impl DedupQueryEngine {
    /// Events matching `query` that were reported more than once, with the
    /// report ids behind each.
    pub async fn multi_report_events(
        &self,
        pool: &SqlitePool,
        query: &EventQuery,
    ) -> Result<Vec<MultiReportEvent>, IngestError> {
        let rows = self.query(pool, &query.clone().deduplicate(false)).await?;
        Ok(rows.multi_report_events(&self.event_key, &self.report_id)?)
    }

    pub async fn query(&self, pool: &SqlitePool, query: &EventQuery) -> Result<EventRows, IngestError> {
        if !query.predicates.iter().any(|p| !p.value.trim().is_empty()) {
            return Err(EngineError::InvalidRequest(
                "at least one search parameter is required".into(),
            )
            .into());
        }

        let schema = {
            let mut conn = pool.acquire().await?;
            Schema {
                report: table_columns(&mut conn, &self.report_table).await?,
                device: table_columns(&mut conn, &self.device_table).await?,
            }
        };
        for (table, columns) in [(&self.report_table, &schema.report), (&self.device_table, &schema.device)] {
            if columns.is_empty() {
                return Err(EngineError::InvalidRequest(format!(
                    "table {table} has not been loaded"
                ))
                .into());
            }
        }

        let mut warnings = Vec::new();
        let report_id = schema.require(Side::Report, &self.report_table, &self.report_id)?;
        let device_id = schema.require(Side::Device, &self.device_table, &self.report_id)?;
        let event_key = find_column(&schema.report, &self.event_key);
        let received = find_column(&schema.report, &self.received_column);
        let source_code = find_column(&schema.report, &self.source_code_column);
        if query.policy == CanonicalPolicy::Manufacturer && source_code.is_none() {
            debug!(column = %self.source_code_column, "source code missing, manufacturer policy uses received date");
        }
        if query.deduplicate && event_key.is_none() {
            warn!(table = %self.report_table, column = %self.event_key, "event key missing, returning rows undeduplicated");
            warnings.push(IngestWarning::new(
                WarningKind::SchemaDrift,
                format!(
                    "{} has no {} column; every report treated as its own event",
                    self.report_table, self.event_key
                ),
            ));
        }

        // Report columns first, then device columns not already present.
        let mut columns: Vec<(Side, String)> = Vec::new();
        for name in schema.report.iter().filter(|c| !is_bookkeeping_column(c)) {
            columns.push((Side::Report, name.clone()));
        }
        for name in schema.device.iter().filter(|c| !is_bookkeeping_column(c)) {
            if !columns.iter().any(|(_, existing)| existing.eq_ignore_ascii_case(name)) {
                columns.push((Side::Device, name.clone()));
            }
        }

        let alias = |side: Side| match side {
            Side::Report => "m",
            Side::Device => "d",
        };
        let select_list = columns
            .iter()
            .map(|(side, name)| format!("{}.{} AS {}", alias(*side), quote_ident(name), quote_ident(name)))
            .collect::<Vec<_>>()
            .join(", ");

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("WITH matched AS (SELECT m.rowid AS __report_rowid, d.rowid AS __device_rowid, ");
        match received {
            Some(col) => qb.push(format!("m.{} AS __received, ", quote_ident(col))),
            None => qb.push("NULL AS __received, "),
        };
        match source_code {
            Some(col) => qb.push(format!(
                "(UPPER(TRIM(m.{col})) = 'M' OR UPPER(m.{col}) LIKE '%MANUFACTURER%') AS __from_manufacturer, ",
                col = quote_ident(col)
            )),
            None => qb.push("0 AS __from_manufacturer, "),
        };
        if query.policy == CanonicalPolicy::MostComplete {
            let filled = columns
                .iter()
                .map(|(side, name)| {
                    let target = format!("{}.{}", alias(*side), quote_ident(name));
                    format!("({target} IS NOT NULL AND TRIM({target}) <> '')")
                })
                .collect::<Vec<_>>()
                .join(" + ");
            qb.push(format!("({filled}) AS __filled, "));
        }
        qb.push(select_list);
        qb.push(format!(
            " FROM {} m JOIN {} d ON m.{} = d.{} WHERE 1 = 1",
            quote_ident(&self.report_table),
            quote_ident(&self.device_table),
            quote_ident(report_id),
            quote_ident(device_id)
        ));

        for predicate in &query.predicates {
            if predicate.value.trim().is_empty() {
                continue;
            }
            let table = match predicate.side {
                Side::Report => &self.report_table,
                Side::Device => &self.device_table,
            };
            let column = schema.require(predicate.side, table, &predicate.column)?;
            let target = format!("{}.{}", alias(predicate.side), quote_ident(column));
            match predicate.op {
                PredicateOp::Eq => qb.push(format!(" AND {target} = ")),
                PredicateOp::EqIgnoreCase => qb.push(format!(" AND UPPER({target}) = UPPER(")),
                PredicateOp::Gte => qb.push(format!(" AND {target} >= ")),
                PredicateOp::Lte => qb.push(format!(" AND {target} <= ")),
                PredicateOp::Like => qb.push(format!(" AND {target} LIKE ")),
            };
            qb.push_bind(predicate.value.clone());
            if predicate.op == PredicateOp::EqIgnoreCase {
                qb.push(")");
            }
        }

        if let Some(range) = query.date_range {
            let column = received.ok_or_else(|| EngineError::SchemaDrift {
                table: self.report_table.clone(),
                details: format!("column {} does not exist", self.received_column),
            })?;
            let target = format!("m.{}", quote_ident(column));
            if let Some(start) = range.start {
                qb.push(format!(" AND {target} >= "));
                qb.push_bind(start.format("%Y-%m-%d").to_string());
            }
            if let Some(end) = range.end {
                qb.push(format!(" AND {target} <= "));
                qb.push_bind(end.format("%Y-%m-%d").to_string());
            }
        }
        qb.push(")");

        let order = match query.policy {
            CanonicalPolicy::EarliestLoaded => "__report_rowid, __device_rowid",
            CanonicalPolicy::LatestLoaded => "__report_rowid DESC, __device_rowid DESC",
            CanonicalPolicy::EarliestReceived => {
                "(__received IS NULL), __received, __report_rowid, __device_rowid"
            }
            CanonicalPolicy::Manufacturer => {
                "__from_manufacturer DESC, (__received IS NULL), __received, __report_rowid, __device_rowid"
            }
            CanonicalPolicy::MostComplete => "__filled DESC, __report_rowid, __device_rowid",
        };
        let group_key = match (query.deduplicate, event_key) {
            (true, Some(key)) => {
                let key = quote_ident(key);
                let id = quote_ident(report_id);
                format!(
                    "PARTITION BY (NULLIF(TRIM({key}), '') IS NULL), COALESCE(NULLIF(TRIM({key}), ''), {id})"
                )
            }
            _ => "PARTITION BY __report_rowid, __device_rowid".to_string(),
        };
        qb.push(format!(
            ", ranked AS (SELECT matched.*, ROW_NUMBER() OVER ({group_key} ORDER BY {order}) AS __rank, \
             COUNT(*) OVER () AS __total FROM matched) \
             SELECT * FROM ranked WHERE __rank = 1 ORDER BY __report_rowid, __device_rowid"
        ));

        let sql_rows = qb.build().fetch_all(pool).await?;
        debug!(rows = sql_rows.len(), "event query complete");

        let mut report_count = 0u64;
        let mut rows = Vec::with_capacity(sql_rows.len());
        for sql_row in &sql_rows {
            report_count = sql_row.try_get::<i64, _>("__total")?.max(0) as u64;
            let mut row = Vec::with_capacity(columns.len());
            for (_, name) in &columns {
                row.push(sql_row.try_get::<Option<String>, _>(name.as_str())?);
            }
            rows.push(row);
        }

        let event_count = rows.len() as u64;
        Ok(EventRows {
            columns: columns.into_iter().map(|(_, name)| name).collect(),
            rows,
            report_count,
            event_count,
            warnings,
        })
    }
}
