//! Ingestion pipeline: resolve, fetch, fingerprint, load, and query.

pub mod dedup;
pub mod ledger;
pub mod processor;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Datelike, Utc};
use maude_core::{
    Distribution, EngineError, IngestWarning, LoadRecord, SourceDescriptor, TableId, WarningKind,
    YearSpec,
};
use maude_sources::{SourceCatalog, FDA_BASE_URL};
use maude_storage::{
    fingerprint_file, ArchiveCache, BackoffPolicy, HttpClientConfig, HttpFetcher, SystemClock,
    DEFAULT_USER_AGENT,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use dedup::{
    count_unique_events, CanonicalPolicy, DateRange, DedupQueryEngine, EventQuery, EventRows,
    MultiReportEvent, Predicate, PredicateOp, Side,
};
pub use ledger::{FingerprintLedger, InMemoryLedger, LoadDecision, LoadPlan, LoadRecordRepository, SqlLedger};
pub use processor::{YearCounts, DEFAULT_CHUNK_SIZE};
pub use store::MaudeStore;

pub const CRATE_NAME: &str = "maude-sync";

/// Date column used for status bounds when a table has none of its own.
const DEFAULT_STATUS_DATE_COLUMN: &str = "DATE_RECEIVED";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        Self::Engine(EngineError::Io(err))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub data_dir: PathBuf,
    pub base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub chunk_size: usize,
    pub strict: bool,
    pub sources_file: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub update_crons: Vec<String>,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("MAUDE_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./maude.db")),
            data_dir: std::env::var("MAUDE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./maude_data")),
            base_url: std::env::var("MAUDE_BASE_URL").unwrap_or_else(|_| FDA_BASE_URL.to_string()),
            user_agent: std::env::var("MAUDE_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("MAUDE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            probe_timeout_secs: std::env::var("MAUDE_PROBE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            chunk_size: std::env::var("MAUDE_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            strict: env_flag("MAUDE_STRICT"),
            sources_file: std::env::var("MAUDE_SOURCES_FILE").ok().map(PathBuf::from),
            scheduler_enabled: env_flag("MAUDE_SCHEDULER_ENABLED"),
            update_crons: std::env::var("MAUDE_UPDATE_CRON")
                .map(|v| {
                    v.split(';')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_else(|_| vec!["0 6 * * *".to_string(), "0 18 * * *".to_string()]),
        }
    }

    /// Defaults rooted in `dir`, for tests and embedded use.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            database_path: dir.join("maude.db"),
            data_dir: dir.join("maude_data"),
            base_url: FDA_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 30,
            probe_timeout_secs: 5,
            chunk_size: DEFAULT_CHUNK_SIZE,
            strict: false,
            sources_file: None,
            scheduler_enabled: false,
            update_crons: Vec::new(),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub years: YearSpec,
    pub tables: Vec<String>,
    /// Download missing files; when false only files already on disk are used.
    pub fetch: bool,
    pub force_refetch: bool,
    pub force_refresh: bool,
    pub chunk_size: Option<usize>,
    /// Overrides `SyncConfig::strict` when set.
    pub strict: Option<bool>,
}

impl IngestRequest {
    pub fn new<S: Into<String>>(years: YearSpec, tables: impl IntoIterator<Item = S>) -> Self {
        Self {
            years,
            tables: tables.into_iter().map(Into::into).collect(),
            fetch: true,
            force_refetch: false,
            force_refresh: false,
            chunk_size: None,
            strict: None,
        }
    }

    pub fn local_only(mut self) -> Self {
        self.fetch = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedLoad {
    pub table: String,
    pub year: i32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub loaded_tables: Vec<String>,
    pub per_year_counts: BTreeMap<String, BTreeMap<i32, u64>>,
    pub skipped: Vec<SkippedLoad>,
    pub warnings: Vec<IngestWarning>,
}

impl IngestReport {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            loaded_tables: Vec::new(),
            per_year_counts: BTreeMap::new(),
            skipped: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn skip(&mut self, table: &TableId, year: i32, reason: impl Into<String>) {
        self.skipped.push(SkippedLoad {
            table: table.to_string(),
            year,
            reason: reason.into(),
        });
    }

    pub fn rows_loaded(&self) -> u64 {
        self.per_year_counts.values().flat_map(|m| m.values()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStatus {
    pub table: String,
    pub rows: u64,
    pub years: Vec<i32>,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub records: Vec<LoadRecord>,
    pub tables: Vec<TableStatus>,
}

/// Ledger records plus row counts and report-date bounds per loaded table.
pub async fn store_status(store: &MaudeStore, catalog: &SourceCatalog) -> Result<StoreStatus, IngestError> {
    let mut conn = store.pool().acquire().await?;
    let records = SqlLedger::new(&mut conn).all_records().await?;

    let mut tables = Vec::new();
    for descriptor in catalog.descriptors() {
        let name = descriptor.table.as_str();
        let years: Vec<i32> = records
            .iter()
            .filter(|r| r.table == descriptor.table)
            .map(|r| r.year)
            .collect();
        if years.is_empty() && !store::table_exists(&mut conn, name).await? {
            continue;
        }
        let rows = store::row_count(&mut conn, name).await?;
        let date_column = descriptor.date_column().unwrap_or(DEFAULT_STATUS_DATE_COLUMN);
        let (first_date, last_date) = store::date_bounds(&mut conn, name, date_column).await?;
        tables.push(TableStatus {
            table: name.to_string(),
            rows,
            years,
            first_date,
            last_date,
        });
    }
    Ok(StoreStatus { records, tables })
}

#[derive(Debug, Clone, Copy)]
struct RunOptions {
    fetch: bool,
    force_refetch: bool,
    force_refresh: bool,
    chunk_size: usize,
    strict: bool,
}

pub struct IngestPipeline {
    config: SyncConfig,
    store: MaudeStore,
    catalog: Arc<SourceCatalog>,
    cache: ArchiveCache,
    run_lock: Mutex<()>,
}

impl IngestPipeline {
    pub fn new(
        config: SyncConfig,
        store: MaudeStore,
        catalog: Arc<SourceCatalog>,
        cache: ArchiveCache,
    ) -> Self {
        Self {
            config,
            store,
            catalog,
            cache,
            run_lock: Mutex::new(()),
        }
    }

    /// Open the store and wire the HTTP fetcher, the system clock, and the
    /// configured catalog.
    pub async fn from_config(config: SyncConfig) -> anyhow::Result<Self> {
        let catalog = match &config.sources_file {
            Some(path) => SourceCatalog::from_yaml_path(path)?,
            None => SourceCatalog::builtin(),
        };
        let catalog = Arc::new(catalog);
        let store = MaudeStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening store {}", config.database_path.display()))?;
        let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let cache = ArchiveCache::new(
            config.data_dir.clone(),
            Arc::clone(&catalog),
            fetcher.clone(),
            fetcher,
            Arc::new(SystemClock),
        );
        Ok(Self::new(config, store, catalog, cache))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &MaudeStore {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<SourceCatalog> {
        &self.catalog
    }

    pub async fn ingest(&self, request: &IngestRequest) -> Result<IngestReport, IngestError> {
        let now = self.cache.clock().current_year();
        let years = request.years.resolve(now)?;
        let mut tables: Vec<&SourceDescriptor> = Vec::new();
        for name in &request.tables {
            let descriptor = self.catalog.get(name)?;
            if !tables.iter().any(|d| d.table == descriptor.table) {
                tables.push(descriptor);
            }
        }

        // "all" means all years each table actually has.
        let all_available = matches!(request.years, YearSpec::AllAvailable);
        let work = tables
            .into_iter()
            .map(|descriptor| {
                let years = years
                    .iter()
                    .copied()
                    .filter(|y| !all_available || *y >= descriptor.earliest_year)
                    .collect();
                (descriptor, years)
            })
            .collect();
        let options = RunOptions {
            fetch: request.fetch,
            force_refetch: request.force_refetch,
            force_refresh: request.force_refresh,
            chunk_size: request.chunk_size.filter(|n| *n > 0).unwrap_or(self.config.chunk_size),
            strict: request.strict.unwrap_or(self.config.strict),
        };
        self.run(work, options).await
    }

    /// Re-ingest every (table, year) in the ledger and let fingerprints decide
    /// what reloads. With `add_new_years`, years after the newest loaded one
    /// through the current year are added.
    pub async fn update(&self, add_new_years: bool, fetch: bool) -> Result<IngestReport, IngestError> {
        let records = {
            let mut conn = self.store.pool().acquire().await?;
            SqlLedger::new(&mut conn).all_records().await?
        };

        let now = self.cache.clock().current_year();
        let mut by_table: BTreeMap<TableId, BTreeSet<i32>> = BTreeMap::new();
        for record in records {
            by_table.entry(record.table).or_default().insert(record.year);
        }

        let mut work = Vec::new();
        for (table, mut years) in by_table {
            let descriptor = match self.catalog.get(table.as_str()) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    warn!(%table, error = %err, "ledger table missing from catalog, not updating");
                    continue;
                }
            };
            if add_new_years {
                if let Some(&max) = years.iter().next_back() {
                    years.extend(max + 1..=now);
                }
            }
            work.push((descriptor, years.into_iter().collect()));
        }

        let options = RunOptions {
            fetch,
            force_refetch: false,
            force_refresh: false,
            chunk_size: self.config.chunk_size,
            strict: self.config.strict,
        };
        self.run(work, options).await
    }

    async fn run(
        &self,
        work: Vec<(&SourceDescriptor, Vec<i32>)>,
        options: RunOptions,
    ) -> Result<IngestReport, IngestError> {
        let mut report = IngestReport::begin();
        if work.iter().all(|(_, years)| years.is_empty()) {
            report.finished_at = Utc::now();
            return Ok(report);
        }

        let _guard = self.run_lock.lock().await;
        let span = info_span!("ingest", run_id = %report.run_id);
        self.run_locked(work, options, &mut report).instrument(span).await?;

        for warning in &report.warnings {
            warn!(kind = ?warning.kind, "{warning}");
        }
        report.finished_at = Utc::now();
        info!(
            run_id = %report.run_id,
            tables = report.loaded_tables.len(),
            rows = report.rows_loaded(),
            skipped = report.skipped.len(),
            warnings = report.warnings.len(),
            "ingest finished"
        );
        Ok(report)
    }

    async fn run_locked(
        &self,
        work: Vec<(&SourceDescriptor, Vec<i32>)>,
        options: RunOptions,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        self.cache.clear_memo().await;
        let clock = self.cache.clock();
        let now = clock.current_year();
        let january = clock.today().month() == 1;

        let mut groups: BTreeMap<(TableId, PathBuf), BTreeSet<i32>> = BTreeMap::new();
        let mut descriptors: BTreeMap<TableId, &SourceDescriptor> = BTreeMap::new();

        for (descriptor, years) in work {
            if years.is_empty() {
                continue;
            }
            let table = &descriptor.table;
            descriptors.insert(table.clone(), descriptor);
            if let Some(advisory) = &descriptor.size_warning {
                report.warnings.push(
                    IngestWarning::new(WarningKind::SizeAdvisory, advisory.clone()).for_table(table),
                );
            }

            for year in years {
                if year < descriptor.earliest_year || year > now {
                    let message = format!(
                        "{table} has no data for {year} (available {}-{now})",
                        descriptor.earliest_year
                    );
                    if options.strict {
                        return Err(EngineError::InvalidRequest(message).into());
                    }
                    report.warnings.push(
                        IngestWarning::new(WarningKind::InvalidYear, message.clone())
                            .for_table(table)
                            .for_year(year),
                    );
                    report.skip(table, year, message);
                    continue;
                }
                if year == now && january {
                    report.warnings.push(
                        IngestWarning::new(
                            WarningKind::Availability,
                            format!("{year} data is usually not published until later in the year"),
                        )
                        .for_table(table)
                        .for_year(year),
                    );
                }

                match self.obtain(descriptor, year, options, report).await? {
                    Some(path) => {
                        groups.entry((table.clone(), path)).or_default().insert(year);
                    }
                    None => continue,
                }
            }
        }

        let mut loaded: BTreeSet<TableId> = BTreeSet::new();
        for ((table, path), years) in groups {
            let Some(descriptor) = descriptors.get(&table).copied() else {
                continue;
            };
            if self.load_group(descriptor, &path, &years, options, report).await? {
                loaded.insert(table);
            }
        }

        for table in &loaded {
            if let Some(descriptor) = descriptors.get(table) {
                let created = self.store.create_indexes(descriptor).await?;
                debug!(%table, created, "indexes ensured");
            }
            report.loaded_tables.push(table.to_string());
        }
        Ok(())
    }

    /// Local text file for (table, year), or `None` after recording why it was skipped.
    async fn obtain(
        &self,
        descriptor: &SourceDescriptor,
        year: i32,
        options: RunOptions,
        report: &mut IngestReport,
    ) -> Result<Option<PathBuf>, IngestError> {
        let table = &descriptor.table;
        let outcome = if options.fetch {
            self.cache
                .ensure(table.as_str(), year, options.force_refetch)
                .await
                .map(|ensured| {
                    report.warnings.extend(ensured.warnings);
                    Some(ensured.path)
                })
        } else {
            self.cache.locate(table.as_str(), year).await
        };

        let reason = match outcome {
            Ok(Some(path)) => return Ok(Some(path)),
            Ok(None) => format!("no local file for {table} {year}"),
            Err(err @ (EngineError::SourceUnavailable { .. } | EngineError::ArchiveCorrupt { .. })) => {
                if options.strict {
                    return Err(err.into());
                }
                err.to_string()
            }
            Err(err) => return Err(err.into()),
        };
        if options.strict {
            return Err(EngineError::SourceUnavailable {
                table: table.to_string(),
                year,
                reason,
            }
            .into());
        }
        report.warnings.push(
            IngestWarning::new(WarningKind::MissingFile, reason.clone())
                .for_table(table)
                .for_year(year),
        );
        report.skip(table, year, reason);
        Ok(None)
    }

    /// Load one file for the years it serves. Returns whether anything was written.
    async fn load_group(
        &self,
        descriptor: &SourceDescriptor,
        path: &Path,
        years: &BTreeSet<i32>,
        options: RunOptions,
        report: &mut IngestReport,
    ) -> Result<bool, IngestError> {
        let table = &descriptor.table;
        let source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let fingerprint = fingerprint_file(path).await?;

        let mut tx = self.store.pool().begin().await?;
        let plan = {
            let mut ledger = SqlLedger::new(&mut tx);
            match &descriptor.distribution {
                Distribution::Cumulative { .. } => {
                    FingerprintLedger::plan(
                        &mut ledger,
                        table,
                        &source_file,
                        years,
                        &fingerprint,
                        options.force_refresh,
                    )
                    .await?
                }
                Distribution::PerYear { .. } => {
                    FingerprintLedger::plan_single_year(
                        &mut ledger,
                        table,
                        years,
                        &fingerprint,
                        options.force_refresh,
                    )
                    .await?
                }
            }
        };
        for &year in &plan.skipped {
            report.skip(table, year, "unchanged");
        }
        if plan.is_noop() {
            debug!(%table, file = %source_file, "file unchanged, nothing to load");
            return Ok(false);
        }
        if !plan.rederived.is_empty() {
            info!(%table, file = %source_file, years = ?plan.rederived, "re-deriving years that share the file");
        }

        store::delete_years(&mut tx, table, &plan.years).await?;
        store::delete_ungated(&mut tx, table, &source_file).await?;

        let mut counts = match &descriptor.distribution {
            Distribution::Cumulative { date_column } => {
                let plan_years: BTreeSet<i32> = plan.years.iter().copied().collect();
                processor::process_cumulative(
                    &mut tx,
                    path,
                    table,
                    &plan_years,
                    date_column,
                    options.chunk_size,
                    &source_file,
                )
                .await?
            }
            Distribution::PerYear { .. } => {
                let mut merged = YearCounts::default();
                for &year in &plan.years {
                    let counts = processor::load_per_year(
                        &mut tx,
                        path,
                        table,
                        year,
                        options.chunk_size,
                        &source_file,
                    )
                    .await?;
                    merged.per_year.extend(counts.per_year);
                    merged.warnings.extend(counts.warnings);
                }
                merged
            }
        };

        {
            let mut ledger = SqlLedger::new(&mut tx);
            let loaded_at = Utc::now();
            for &year in &plan.years {
                ledger
                    .put(&LoadRecord {
                        table: table.clone(),
                        year,
                        file_path: source_file.clone(),
                        fingerprint: fingerprint.clone(),
                        loaded_at,
                        row_count: counts.count_for(year),
                    })
                    .await?;
            }
        }
        let orphaned = store::delete_orphaned_ungated(&mut tx, table).await?;
        if orphaned > 0 {
            debug!(%table, orphaned, "removed ungated rows from superseded files");
        }
        tx.commit().await?;

        let per_year = report.per_year_counts.entry(table.to_string()).or_default();
        for &year in &plan.years {
            per_year.insert(year, counts.count_for(year));
        }
        info!(
            %table,
            file = %source_file,
            years = ?plan.years,
            rows = counts.total(),
            ungated = counts.ungated,
            "loaded file"
        );
        report.warnings.append(&mut counts.warnings);
        Ok(true)
    }

    pub async fn status(&self) -> Result<StoreStatus, IngestError> {
        store_status(&self.store, &self.catalog).await
    }

    pub async fn query_events(&self, query: &EventQuery) -> Result<EventRows, IngestError> {
        DedupQueryEngine::default().query(self.store.pool(), query).await
    }

    pub async fn multi_report_events(&self, query: &EventQuery) -> Result<Vec<MultiReportEvent>, IngestError> {
        DedupQueryEngine::default()
            .multi_report_events(self.store.pool(), query)
            .await
    }

    /// Cron jobs running `update(true, true)`, when the scheduler is enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in &self.config.update_crons {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.update(true, true).await {
                        Ok(report) => info!(
                            run_id = %report.run_id,
                            rows = report.rows_loaded(),
                            "scheduled update complete"
                        ),
                        Err(err) => error!(error = %err, "scheduled update failed"),
                    }
                })
            })
            .with_context(|| format!("parsing cron expression {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_totals_rows_across_tables() {
        let mut report = IngestReport::begin();
        report
            .per_year_counts
            .insert("master".into(), BTreeMap::from([(2019, 3), (2020, 4)]));
        report
            .per_year_counts
            .insert("device".into(), BTreeMap::from([(2020, 5)]));
        assert_eq!(report.rows_loaded(), 12);
    }

    #[test]
    fn report_serializes_with_year_keys_and_warning_kinds() {
        let mut report = IngestReport::begin();
        let master = TableId::new("master").unwrap();
        report
            .per_year_counts
            .insert("master".into(), BTreeMap::from([(2020, 2)]));
        report.warnings.push(
            IngestWarning::new(WarningKind::MissingFile, "gone")
                .for_table(&master)
                .for_year(2021),
        );
        report.skip(&master, 2021, "gone");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["per_year_counts"]["master"]["2020"], 2);
        assert_eq!(json["warnings"][0]["kind"], "missing_file");
        assert_eq!(json["skipped"][0]["year"], 2021);
    }

    #[test]
    fn config_in_dir_roots_paths() {
        let config = SyncConfig::in_dir("/tmp/mirror");
        assert_eq!(config.database_path, PathBuf::from("/tmp/mirror/maude.db"));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/mirror/maude_data"));
        assert!(!config.scheduler_enabled);
        assert_eq!(config.http_client_config().timeout, Duration::from_secs(30));
    }

    #[test]
    fn requests_default_to_fetching() {
        let request = IngestRequest::new(YearSpec::Single(2020), ["master"]);
        assert!(request.fetch);
        assert!(!request.local_only().fetch);
    }
}
