//! SQLite store: connection setup, ledger schema, dynamic report tables.

use std::path::Path;
use std::time::Duration;

use maude_core::{SourceDescriptor, TableId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

pub const LEDGER_TABLE: &str = "_load_ledger";
pub const LOAD_YEAR_COLUMN: &str = "_load_year";
pub const SOURCE_FILE_COLUMN: &str = "_source_file";

const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS _load_ledger (
    table_name TEXT NOT NULL,
    year INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    file_fingerprint TEXT NOT NULL,
    loaded_at TIMESTAMP NOT NULL,
    row_count INTEGER NOT NULL,
    PRIMARY KEY (table_name, year)
)
"#;

pub fn is_bookkeeping_column(name: &str) -> bool {
    name.eq_ignore_ascii_case(LOAD_YEAR_COLUMN) || name.eq_ignore_ascii_case(SOURCE_FILE_COLUMN)
}

/// Quote an identifier for SQLite. Column names come from file headers, so
/// they are never interpolated raw.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone)]
pub struct MaudeStore {
    pool: SqlitePool,
}

impl MaudeStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "opened store");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(LEDGER_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Index the descriptor's key columns plus `_load_year`, skipping any
    /// column the loaded schema does not have.
    pub async fn create_indexes(&self, descriptor: &SourceDescriptor) -> Result<usize, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let table = descriptor.table.as_str();
        let columns = table_columns(&mut conn, table).await?;
        if columns.is_empty() {
            return Ok(0);
        }

        let mut created = 0;
        let wanted = descriptor
            .index_columns
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(LOAD_YEAR_COLUMN));
        for column in wanted {
            let Some(actual) = find_column(&columns, column) else {
                debug!(table, column, "index column absent, skipping");
                continue;
            };
            let index = format!("idx_{table}_{}", actual.to_ascii_lowercase());
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&index),
                quote_ident(table),
                quote_ident(actual)
            );
            sqlx::query(&sql).execute(&mut *conn).await?;
            created += 1;
        }
        Ok(created)
    }
}

/// Case-insensitive column lookup returning the stored spelling.
pub fn find_column<'a>(columns: &'a [String], wanted: &str) -> Option<&'a str> {
    columns
        .iter()
        .find(|c| c.eq_ignore_ascii_case(wanted))
        .map(String::as_str)
}

pub async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count > 0)
}

/// Column names in declaration order; empty when the table does not exist.
pub async fn table_columns(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
        .bind(table)
        .fetch_all(&mut *conn)
        .await
}

/// Create the report table or widen it with columns introduced by a later
/// schema era. Returns the names that were added.
pub async fn ensure_table(
    conn: &mut SqliteConnection,
    table: &TableId,
    columns: &[String],
) -> Result<Vec<String>, sqlx::Error> {
    let existing = table_columns(conn, table.as_str()).await?;
    if existing.is_empty() {
        let mut defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} TEXT", quote_ident(c)))
            .collect();
        defs.push(format!("{} INTEGER", quote_ident(LOAD_YEAR_COLUMN)));
        defs.push(format!("{} TEXT", quote_ident(SOURCE_FILE_COLUMN)));
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(table.as_str()),
            defs.join(", ")
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        return Ok(Vec::new());
    }

    let mut added = Vec::new();
    for column in columns {
        if find_column(&existing, column).is_some() {
            continue;
        }
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} TEXT",
            quote_ident(table.as_str()),
            quote_ident(column)
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        added.push(column.clone());
    }
    if !added.is_empty() {
        info!(%table, columns = ?added, "added columns for new schema era");
    }
    Ok(added)
}

/// Remove every row that was loaded for one of `years`.
pub async fn delete_years(
    conn: &mut SqliteConnection,
    table: &TableId,
    years: &[i32],
) -> Result<u64, sqlx::Error> {
    if years.is_empty() || !table_exists(conn, table.as_str()).await? {
        return Ok(0);
    }
    let placeholders = vec!["?"; years.len()].join(", ");
    let sql = format!(
        "DELETE FROM {} WHERE {} IN ({placeholders})",
        quote_ident(table.as_str()),
        quote_ident(LOAD_YEAR_COLUMN)
    );
    let mut query = sqlx::query(&sql);
    for year in years {
        query = query.bind(*year);
    }
    Ok(query.execute(&mut *conn).await?.rows_affected())
}

/// Remove ungated rows (no `_load_year`) that came from `source_file`.
pub async fn delete_ungated(
    conn: &mut SqliteConnection,
    table: &TableId,
    source_file: &str,
) -> Result<u64, sqlx::Error> {
    if !table_exists(conn, table.as_str()).await? {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM {} WHERE {} IS NULL AND {} = ?",
        quote_ident(table.as_str()),
        quote_ident(LOAD_YEAR_COLUMN),
        quote_ident(SOURCE_FILE_COLUMN)
    );
    Ok(sqlx::query(&sql)
        .bind(source_file)
        .execute(&mut *conn)
        .await?
        .rows_affected())
}

/// Remove ungated rows whose source file no ledger record references anymore.
pub async fn delete_orphaned_ungated(
    conn: &mut SqliteConnection,
    table: &TableId,
) -> Result<u64, sqlx::Error> {
    if !table_exists(conn, table.as_str()).await? {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM {t} WHERE {y} IS NULL AND {f} NOT IN \
         (SELECT file_path FROM {LEDGER_TABLE} WHERE table_name = ?)",
        t = quote_ident(table.as_str()),
        y = quote_ident(LOAD_YEAR_COLUMN),
        f = quote_ident(SOURCE_FILE_COLUMN)
    );
    Ok(sqlx::query(&sql)
        .bind(table.as_str())
        .execute(&mut *conn)
        .await?
        .rows_affected())
}

pub async fn row_count(conn: &mut SqliteConnection, table: &str) -> Result<u64, sqlx::Error> {
    if !table_exists(conn, table).await? {
        return Ok(0);
    }
    let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
    Ok(count as u64)
}

/// Earliest and latest normalized date in `column`.
pub async fn date_bounds(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
) -> Result<(Option<String>, Option<String>), sqlx::Error> {
    let columns = table_columns(conn, table).await?;
    let Some(column) = find_column(&columns, column) else {
        return Ok((None, None));
    };
    let sql = format!(
        "SELECT MIN({c}), MAX({c}) FROM {t} WHERE {c} GLOB '[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]'",
        c = quote_ident(column),
        t = quote_ident(table)
    );
    sqlx::query_as(&sql).fetch_one(&mut *conn).await
}
