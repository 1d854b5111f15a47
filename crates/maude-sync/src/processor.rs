//! Streaming loaders for pipe-delimited MAUDE text files.
//!
//! Files are read on a blocking thread with the `csv` reader in byte mode and
//! handed to the async side in bounded chunks, so memory stays proportional
//! to the chunk size no matter how large the file is. Rows are salvaged
//! rather than rejected: short rows are padded, long rows keep their overflow
//! in the last column.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use maude_core::{EngineError, IngestWarning, TableId, WarningKind};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::store::{ensure_table, is_bookkeeping_column, quote_ident, LOAD_YEAR_COLUMN, SOURCE_FILE_COLUMN};
use crate::IngestError;

pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

/// Fields beyond this many bytes are cut at the nearest char boundary.
pub const MAX_TEXT_LENGTH: usize = 100 * 1024 * 1024;

/// Stay under SQLite's bound-parameter ceiling per INSERT.
const MAX_BIND_PARAMS: usize = 30_000;

pub type Row = Vec<Option<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YearCounts {
    pub per_year: BTreeMap<i32, u64>,
    /// Rows kept without a year because their date could not be read.
    pub ungated: u64,
    /// Rows outside the requested years, not stored.
    pub dropped: u64,
    pub warnings: Vec<IngestWarning>,
}

impl YearCounts {
    pub fn total(&self) -> u64 {
        self.per_year.values().sum::<u64>() + self.ungated
    }

    pub fn count_for(&self, year: i32) -> u64 {
        self.per_year.get(&year).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub rows: u64,
    pub salvaged: u64,
    pub unparseable_dates: u64,
    pub truncated: u64,
}

/// Normalize a MAUDE date to `YYYY-MM-DD`. Returns `None` when no supported
/// layout matches.
pub fn normalize_date(raw: &str) -> Option<String> {
    let token = raw.split_whitespace().next()?;
    let token = match token.split_once('T') {
        Some((date, _)) if date.len() >= 8 => date,
        _ => token,
    };

    let date = if token.len() == 8 && token.bytes().all(|b| b.is_ascii_digit()) {
        NaiveDate::parse_from_str(token, "%Y%m%d").ok()
    } else {
        let parts: Vec<&str> = token.split(['/', '-']).collect();
        if parts.len() != 3 {
            return None;
        }
        if parts.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit())) {
            let nums: Vec<u32> = parts.iter().filter_map(|p| p.parse().ok()).collect();
            if nums.len() != 3 {
                return None;
            }
            if parts[0].len() == 4 {
                NaiveDate::from_ymd_opt(nums[0] as i32, nums[1], nums[2])
            } else if parts[2].len() == 4 {
                NaiveDate::from_ymd_opt(nums[2] as i32, nums[0], nums[1])
            } else {
                None
            }
        } else {
            let month = month_from_abbrev(parts[1])?;
            let day: u32 = parts[0].parse().ok()?;
            let year: i32 = parts[2].parse().ok()?;
            if parts[2].len() != 4 {
                return None;
            }
            NaiveDate::from_ymd_opt(year, month, day)
        }
    }?;
    Some(date.format("%Y-%m-%d").to_string())
}

fn month_from_abbrev(raw: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ];
    let upper = raw.get(..3)?.to_ascii_uppercase();
    MONTHS.iter().position(|m| *m == upper).map(|idx| idx as u32 + 1)
}

/// Year of an already-normalized date value.
fn year_of(value: &str) -> Option<i32> {
    let bytes = value.as_bytes();
    if bytes.len() == 10 && bytes[4] == b'-' && bytes[7] == b'-' {
        value[..4].parse().ok()
    } else {
        None
    }
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn truncate_text(mut value: String, limit: usize) -> (String, bool) {
    if value.len() <= limit {
        return (value, false);
    }
    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
    (value, true)
}

/// Header names made unique (SQLite compares identifiers case-insensitively)
/// and kept clear of the bookkeeping columns.
pub fn normalize_header(raw: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    raw.iter()
        .enumerate()
        .map(|(idx, name)| {
            let base = match name.trim() {
                "" => format!("COLUMN_{}", idx + 1),
                trimmed if is_bookkeeping_column(trimmed) => format!("{trimmed}_SRC"),
                trimmed => trimmed.to_string(),
            };
            let mut candidate = base.clone();
            let mut n = 2;
            while !seen.insert(candidate.to_ascii_uppercase()) {
                candidate = format!("{base}_{n}");
                n += 1;
            }
            candidate
        })
        .collect()
}

/// Fit a raw record to `width` columns. Returns the row and whether the line
/// had to be salvaged because it carried extra delimiters.
pub fn shape_row(fields: &csv::ByteRecord, width: usize) -> (Row, bool) {
    let mut row: Row = Vec::with_capacity(width);
    let mut salvaged = false;
    for (idx, field) in fields.iter().enumerate() {
        if idx + 1 < width || width == 0 {
            row.push(Some(decode_latin1(field)));
            continue;
        }
        let rest: Vec<String> = fields.iter().skip(idx).map(decode_latin1).collect();
        salvaged = rest.len() > 1;
        row.push(Some(rest.join("|")));
        break;
    }
    row.resize(width, None);
    let row = row
        .into_iter()
        .map(|v| v.filter(|s| !s.trim().is_empty()))
        .collect();
    (row, salvaged)
}

enum Batch {
    Header(Vec<String>),
    Rows(Vec<Row>),
}

/// Read `path` on a blocking thread, sending the header first and then rows in
/// chunks of `chunk_size`. Every column whose name contains `DATE` is
/// normalized before the row leaves the thread.
fn spawn_reader(
    path: PathBuf,
    chunk_size: usize,
) -> (
    mpsc::Receiver<Batch>,
    tokio::task::JoinHandle<Result<ParseStats, EngineError>>,
) {
    let (tx, rx) = mpsc::channel(2);
    let handle = tokio::task::spawn_blocking(move || read_file(&path, chunk_size.max(1), &tx));
    (rx, handle)
}

fn read_file(
    path: &Path,
    chunk_size: usize,
    tx: &mpsc::Sender<Batch>,
) -> Result<ParseStats, EngineError> {
    let csv_err = |err: csv::Error| EngineError::Io(io::Error::other(err));
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'|')
        .quoting(false)
        .flexible(true)
        .has_headers(false)
        .from_path(path)
        .map_err(csv_err)?;

    let mut stats = ParseStats::default();
    let mut record = csv::ByteRecord::new();
    if !reader.read_byte_record(&mut record).map_err(csv_err)? {
        return Ok(stats);
    }
    let header = normalize_header(&record.iter().map(decode_latin1).collect::<Vec<_>>());
    let width = header.len();
    let date_idx: Vec<usize> = header
        .iter()
        .enumerate()
        .filter(|(_, name)| name.to_ascii_uppercase().contains("DATE"))
        .map(|(idx, _)| idx)
        .collect();
    if tx.blocking_send(Batch::Header(header)).is_err() {
        return Ok(stats);
    }

    let mut chunk = Vec::with_capacity(chunk_size.min(DEFAULT_CHUNK_SIZE));
    while reader.read_byte_record(&mut record).map_err(csv_err)? {
        let (mut row, salvaged) = shape_row(&record, width);
        if row.iter().all(Option::is_none) {
            continue;
        }
        if salvaged {
            stats.salvaged += 1;
        }
        for value in row.iter_mut() {
            if let Some(text) = value.take() {
                let (text, cut) = truncate_text(text, MAX_TEXT_LENGTH);
                if cut {
                    stats.truncated += 1;
                }
                *value = Some(text);
            }
        }
        for &idx in &date_idx {
            if let Some(raw) = row[idx].as_deref() {
                match normalize_date(raw) {
                    Some(normalized) => row[idx] = Some(normalized),
                    None => stats.unparseable_dates += 1,
                }
            }
        }
        stats.rows += 1;
        chunk.push(row);
        if chunk.len() >= chunk_size {
            let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size.min(DEFAULT_CHUNK_SIZE)));
            if tx.blocking_send(Batch::Rows(full)).is_err() {
                return Ok(stats);
            }
        }
    }
    if !chunk.is_empty() {
        let _ = tx.blocking_send(Batch::Rows(chunk));
    }
    Ok(stats)
}

struct RowWriter<'a> {
    table: &'a TableId,
    insert_prefix: String,
    rows_per_statement: usize,
    source_file: &'a str,
}

impl<'a> RowWriter<'a> {
    fn new(table: &'a TableId, header: &[String], source_file: &'a str) -> Self {
        let mut columns: Vec<String> = header.iter().map(|c| quote_ident(c)).collect();
        columns.push(quote_ident(LOAD_YEAR_COLUMN));
        columns.push(quote_ident(SOURCE_FILE_COLUMN));
        let insert_prefix = format!(
            "INSERT INTO {} ({}) ",
            quote_ident(table.as_str()),
            columns.join(", ")
        );
        Self {
            table,
            insert_prefix,
            rows_per_statement: (MAX_BIND_PARAMS / columns.len()).max(1),
            source_file,
        }
    }

    async fn write(
        &self,
        conn: &mut SqliteConnection,
        rows: &[(Row, Option<i32>)],
    ) -> Result<(), sqlx::Error> {
        for batch in rows.chunks(self.rows_per_statement) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(&self.insert_prefix);
            qb.push_values(batch, |mut b, (row, year)| {
                for value in row {
                    b.push_bind(value.clone());
                }
                b.push_bind(*year);
                b.push_bind(self.source_file.to_string());
            });
            qb.build().execute(&mut *conn).await?;
        }
        debug!(table = %self.table, rows = rows.len(), "inserted chunk");
        Ok(())
    }
}

/// Open the file, ensure the table matches its header, and hand each chunk to
/// `route`, which tags every row with a year (or drops it by returning `None`).
async fn stream_into<F>(
    conn: &mut SqliteConnection,
    path: &Path,
    table: &TableId,
    source_file: &str,
    chunk_size: usize,
    mut route: F,
) -> Result<(Vec<String>, ParseStats), IngestError>
where
    F: FnMut(&[String], Row) -> Option<(Row, Option<i32>)>,
{
    let (mut rx, handle) = spawn_reader(path.to_path_buf(), chunk_size);

    let header = match rx.recv().await {
        Some(Batch::Header(header)) => header,
        Some(Batch::Rows(_)) | None => {
            drop(rx);
            let stats = handle.await??;
            return Ok((Vec::new(), stats));
        }
    };
    ensure_table(conn, table, &header).await?;
    let writer = RowWriter::new(table, &header, source_file);

    while let Some(batch) = rx.recv().await {
        let Batch::Rows(rows) = batch else { continue };
        let routed: Vec<(Row, Option<i32>)> =
            rows.into_iter().filter_map(|row| route(header.as_slice(), row)).collect();
        writer.write(conn, &routed).await?;
    }

    let stats = handle.await??;
    Ok((header, stats))
}

fn parse_warnings(table: &TableId, path: &Path, stats: &ParseStats) -> Vec<IngestWarning> {
    let mut warnings = Vec::new();
    if stats.salvaged > 0 {
        warnings.push(
            IngestWarning::new(
                WarningKind::MalformedLine,
                format!(
                    "{} lines in {} had extra delimiters; overflow kept in the last column",
                    stats.salvaged,
                    path.display()
                ),
            )
            .for_table(table),
        );
    }
    if stats.truncated > 0 {
        warnings.push(
            IngestWarning::new(
                WarningKind::MalformedLine,
                format!("{} oversized fields truncated in {}", stats.truncated, path.display()),
            )
            .for_table(table),
        );
    }
    warnings
}

/// Load a per-year file, tagging every row with `year`.
pub async fn load_per_year(
    conn: &mut SqliteConnection,
    path: &Path,
    table: &TableId,
    year: i32,
    chunk_size: usize,
    source_file: &str,
) -> Result<YearCounts, IngestError> {
    let mut loaded = 0u64;
    let (_, stats) = stream_into(conn, path, table, source_file, chunk_size, |_, row| {
        loaded += 1;
        Some((row, Some(year)))
    })
    .await?;

    let mut counts = YearCounts::default();
    counts.per_year.insert(year, loaded);
    counts.warnings = parse_warnings(table, path, &stats);
    if stats.unparseable_dates > 0 {
        counts.warnings.push(
            IngestWarning::new(
                WarningKind::UnparseableDate,
                format!("{} date values kept as written", stats.unparseable_dates),
            )
            .for_table(table)
            .for_year(year),
        );
    }
    info!(%table, year, rows = loaded, file = %path.display(), "loaded per-year file");
    Ok(counts)
}

/// Stream a cumulative file once and keep the rows whose `date_column` falls in
/// `years`. Rows with no readable date are kept untagged.
pub async fn process_cumulative(
    conn: &mut SqliteConnection,
    path: &Path,
    table: &TableId,
    years: &BTreeSet<i32>,
    date_column: &str,
    chunk_size: usize,
    source_file: &str,
) -> Result<YearCounts, IngestError> {
    let mut counts = YearCounts::default();
    if years.is_empty() {
        return Ok(counts);
    }
    for year in years {
        counts.per_year.insert(*year, 0);
    }

    let mut date_idx: Option<Option<usize>> = None;
    let mut per_year = counts.per_year.clone();
    let mut ungated = 0u64;
    let mut dropped = 0u64;

    let (header, stats) = stream_into(conn, path, table, source_file, chunk_size, |header, row| {
        let idx = *date_idx.get_or_insert_with(|| {
            header.iter().position(|c| c.eq_ignore_ascii_case(date_column))
        });
        let Some(idx) = idx else {
            ungated += 1;
            return Some((row, None));
        };
        match row[idx].as_deref().and_then(year_of) {
            Some(year) if years.contains(&year) => {
                *per_year.entry(year).or_default() += 1;
                Some((row, Some(year)))
            }
            Some(_) => {
                dropped += 1;
                None
            }
            None => {
                ungated += 1;
                Some((row, None))
            }
        }
    })
    .await?;

    counts.per_year = per_year;
    counts.ungated = ungated;
    counts.dropped = dropped;
    counts.warnings = parse_warnings(table, path, &stats);

    let has_date_column = header.iter().any(|c| c.eq_ignore_ascii_case(date_column));
    if !header.is_empty() && !has_date_column {
        warn!(%table, date_column, file = %path.display(), "date column missing, rows loaded ungated");
        counts.warnings.push(
            IngestWarning::new(
                WarningKind::SchemaDrift,
                format!(
                    "{} has no {date_column} column; {ungated} rows loaded without a year",
                    path.display()
                ),
            )
            .for_table(table),
        );
    } else if ungated > 0 {
        counts.warnings.push(
            IngestWarning::new(
                WarningKind::UnparseableDate,
                format!("{ungated} rows have no readable {date_column}; kept without a year"),
            )
            .for_table(table),
        );
    }

    info!(
        %table,
        years = ?years,
        kept = counts.total(),
        dropped,
        file = %path.display(),
        "processed cumulative file"
    );
    Ok(counts)
}
