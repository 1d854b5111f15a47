use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use maude_core::{EngineError, WarningKind, YearSpec};
use maude_sources::{RemoteProbe, SourceCatalog};
use maude_storage::{ArchiveCache, ArchiveSource, FetchError, FixedClock};
use maude_sync::{EventQuery, IngestError, IngestPipeline, IngestRequest, MaudeStore, SyncConfig};
use tempfile::tempdir;

const MASTER: &str = "MDR_REPORT_KEY|EVENT_KEY|DATE_RECEIVED|REPORT_SOURCE_CODE\n\
    1|E1|01/05/2019|M\n\
    2|E1|02/06/2020|U\n\
    3|E2|2020-07-01|M\n\
    4|E3|05/05/2018|M\n";

#[derive(Default)]
struct FakeUpstream {
    archives: Mutex<HashMap<String, (String, String)>>,
    downloads: Mutex<Vec<String>>,
}

impl FakeUpstream {
    fn publish(&self, archive: &str, entry: &str, body: &str) {
        self.archives
            .lock()
            .unwrap()
            .insert(archive.to_string(), (entry.to_string(), body.to_string()));
    }

    fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArchiveSource for FakeUpstream {
    async fn fetch_archive(&self, archive_name: &str, dest: &Path) -> Result<u64, FetchError> {
        self.downloads.lock().unwrap().push(archive_name.to_string());
        let entry = self.archives.lock().unwrap().get(archive_name).cloned();
        let Some((name, body)) = entry else {
            return Err(FetchError::NotFound {
                url: archive_name.to_string(),
            });
        };
        let mut zip = zip::ZipWriter::new(File::create(dest)?);
        zip.start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(body.as_bytes())?;
        zip.finish().unwrap();
        Ok(std::fs::metadata(dest)?.len())
    }
}

#[async_trait]
impl RemoteProbe for FakeUpstream {
    async fn exists(&self, archive_name: &str) -> bool {
        self.archives.lock().unwrap().contains_key(archive_name)
    }
}

struct Harness {
    pipeline: IngestPipeline,
    data_dir: PathBuf,
    upstream: Arc<FakeUpstream>,
}

impl Harness {
    async fn new(root: &Path) -> Self {
        Self::with_strict(root, false).await
    }

    async fn with_strict(root: &Path, strict: bool) -> Self {
        Self::build(root, strict, NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()).await
    }

    async fn on(root: &Path, today: NaiveDate) -> Self {
        Self::build(root, false, today).await
    }

    async fn build(root: &Path, strict: bool, today: NaiveDate) -> Self {
        let mut config = SyncConfig::in_dir(root);
        config.strict = strict;
        std::fs::create_dir_all(&config.data_dir).unwrap();

        let upstream = Arc::new(FakeUpstream::default());
        let catalog = Arc::new(SourceCatalog::builtin());
        let store = MaudeStore::open(&config.database_path).await.unwrap();
        let clock = Arc::new(FixedClock(today));
        let cache = ArchiveCache::new(
            config.data_dir.clone(),
            Arc::clone(&catalog),
            upstream.clone(),
            upstream.clone(),
            clock,
        );
        let data_dir = config.data_dir.clone();
        Self {
            pipeline: IngestPipeline::new(config, store, catalog, cache),
            data_dir,
            upstream,
        }
    }

    fn write(&self, name: &str, body: &str) {
        std::fs::write(self.data_dir.join(name), body).unwrap();
    }

    async fn local(&self, years: YearSpec, tables: &[&str]) -> Result<maude_sync::IngestReport, IngestError> {
        let request = IngestRequest::new(years, tables.iter().copied()).local_only();
        self.pipeline.ingest(&request).await
    }

    async fn keys_and_years(&self, table: &str) -> Vec<(String, Option<i64>)> {
        let sql = format!("SELECT MDR_REPORT_KEY, _load_year FROM {table} ORDER BY MDR_REPORT_KEY, _load_year");
        sqlx::query_as(&sql)
            .fetch_all(self.pipeline.store().pool())
            .await
            .unwrap()
    }
}

fn range(start: i32, end: i32) -> YearSpec {
    YearSpec::Range { start, end }
}

/// Two reports per year, 1996 through 2020, dated mid-year.
fn master_1996_to_2020() -> String {
    let mut body = String::from("MDR_REPORT_KEY|EVENT_KEY|DATE_RECEIVED\n");
    for year in 1996..=2020 {
        for n in 0..2 {
            body.push_str(&format!("{year}{n}|E{year}{n}|06/1{n}/{year}\n"));
        }
    }
    body
}

#[tokio::test]
async fn second_identical_run_skips_everything() {
    let dir = tempdir().unwrap();
    let h = Harness::new(dir.path()).await;
    h.write("mdrfoithru2025.txt", MASTER);

    let first = h.local(range(2019, 2020), &["master"]).await.unwrap();
    assert_eq!(first.loaded_tables, vec!["master"]);
    assert_eq!(first.per_year_counts["master"][&2019], 1);
    assert_eq!(first.per_year_counts["master"][&2020], 2);
    let before = h.pipeline.status().await.unwrap().records;

    let second = h.local(range(2019, 2020), &["master"]).await.unwrap();
    assert!(second.loaded_tables.is_empty());
    assert_eq!(second.skipped.len(), 2);
    assert!(second.skipped.iter().all(|s| s.reason == "unchanged"));

    let after = h.pipeline.status().await.unwrap().records;
    assert_eq!(before, after);
    assert_eq!(h.keys_and_years("master").await.len(), 3);
}

#[tokio::test]
async fn changed_file_is_reloaded_without_duplicates() {
    let dir = tempdir().unwrap();
    let h = Harness::new(dir.path()).await;
    h.write("device2020.txt", "MDR_REPORT_KEY|BRAND_NAME\n1|Acme\n2|Acme\n");

    h.local(YearSpec::Single(2020), &["device"]).await.unwrap();
    let old = h.pipeline.status().await.unwrap().records;

    h.write("device2020.txt", "MDR_REPORT_KEY|BRAND_NAME\n1|Acme\n2|Acme\n3|Other\n");
    let report = h.local(YearSpec::Single(2020), &["device"]).await.unwrap();
    assert_eq!(report.per_year_counts["device"][&2020], 3);

    let new = h.pipeline.status().await.unwrap().records;
    assert_ne!(old[0].fingerprint, new[0].fingerprint);
    assert_eq!(new[0].row_count, 3);
    assert_eq!(h.keys_and_years("device").await.len(), 3);
}

#[tokio::test]
async fn loader_warnings_reach_the_report() {
    let dir = tempdir().unwrap();
    let h = Harness::new(dir.path()).await;
    h.write("device2020.txt", "MDR_REPORT_KEY|BRAND_NAME\n1|Acme|Pump\n2|Acme\n");

    let report = h.local(YearSpec::Single(2020), &["device"]).await.unwrap();
    assert_eq!(report.per_year_counts["device"][&2020], 2);
    let malformed: Vec<_> = report
        .warnings
        .iter()
        .filter(|w| w.kind == WarningKind::MalformedLine)
        .collect();
    assert_eq!(malformed.len(), 1);
}

#[tokio::test]
async fn cumulative_file_serves_many_years_under_one_fingerprint() {
    let dir = tempdir().unwrap();
    let h = Harness::new(dir.path()).await;
    h.write("mdrfoithru2025.txt", &master_1996_to_2020());

    let report = h.local(range(1996, 2020), &["master"]).await.unwrap();
    assert_eq!(report.per_year_counts["master"].len(), 25);
    assert!(report.per_year_counts["master"].values().all(|n| *n == 2));

    let records = h.pipeline.status().await.unwrap().records;
    assert_eq!(records.len(), 25);
    assert!(records.iter().all(|r| r.file_path == "mdrfoithru2025.txt"));
    assert!(records.iter().all(|r| r.fingerprint == records[0].fingerprint));
    assert_eq!(h.keys_and_years("master").await.len(), 50);

    // A later single-year request re-derives the years sharing the file.
    let report = h.local(YearSpec::Single(2021), &["master"]).await.unwrap();
    assert_eq!(report.per_year_counts["master"].len(), 26);
    assert_eq!(report.per_year_counts["master"][&2021], 0);
    assert_eq!(h.keys_and_years("master").await.len(), 50);
}

#[tokio::test]
async fn changed_cumulative_file_rederives_sibling_years() {
    let dir = tempdir().unwrap();
    let h = Harness::new(dir.path()).await;
    h.write("mdrfoithru2025.txt", MASTER);
    h.local(YearSpec::List(vec![2018, 2019, 2020]), &["master"]).await.unwrap();
    let old = h.pipeline.status().await.unwrap().records;

    h.write(
        "mdrfoithru2025.txt",
        "MDR_REPORT_KEY|EVENT_KEY|DATE_RECEIVED|REPORT_SOURCE_CODE\n\
         1|E1|01/05/2019|M\n\
         2|E1|02/06/2020|U\n\
         4|E3|05/05/2018|M\n\
         5|E4|03/03/2018|D\n\
         6|E5|09/09/2019|M\n",
    );
    let report = h.local(YearSpec::Single(2020), &["master"]).await.unwrap();
    let years: Vec<i32> = report.per_year_counts["master"].keys().copied().collect();
    assert_eq!(years, vec![2018, 2019, 2020]);

    let records = h.pipeline.status().await.unwrap().records;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.fingerprint == records[0].fingerprint));
    assert_ne!(records[0].fingerprint, old[0].fingerprint);
    let counts: Vec<(i32, u64)> = records.iter().map(|r| (r.year, r.row_count)).collect();
    assert_eq!(counts, vec![(2018, 2), (2019, 2), (2020, 1)]);

    assert_eq!(
        h.keys_and_years("master").await,
        vec![
            ("1".to_string(), Some(2019)),
            ("2".to_string(), Some(2020)),
            ("4".to_string(), Some(2018)),
            ("5".to_string(), Some(2018)),
            ("6".to_string(), Some(2019)),
        ]
    );
}

#[tokio::test]
async fn current_year_alias_rollover_keeps_the_previous_year() {
    let dir = tempdir().unwrap();
    let june_2026 = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
    let june_2027 = NaiveDate::from_ymd_opt(2027, 6, 1).unwrap();

    {
        let h = Harness::on(dir.path(), june_2026).await;
        h.write("device.txt", "MDR_REPORT_KEY|BRAND_NAME\n1|Acme\n2|Acme\n");
        let report = h.local(YearSpec::Single(2026), &["device"]).await.unwrap();
        assert_eq!(report.per_year_counts["device"][&2026], 2);
    }

    let h = Harness::on(dir.path(), june_2027).await;
    h.write("device.txt", "MDR_REPORT_KEY|BRAND_NAME\n3|Acme\n4|Acme\n");
    let report = h.local(YearSpec::Single(2027), &["device"]).await.unwrap();
    let years: Vec<i32> = report.per_year_counts["device"].keys().copied().collect();
    assert_eq!(years, vec![2027]);

    assert_eq!(
        h.keys_and_years("device").await,
        vec![
            ("1".to_string(), Some(2026)),
            ("2".to_string(), Some(2026)),
            ("3".to_string(), Some(2027)),
            ("4".to_string(), Some(2027)),
        ]
    );
    let records = h.pipeline.status().await.unwrap().records;
    assert_eq!(records.len(), 2);
    assert_ne!(records[0].fingerprint, records[1].fingerprint);

    let again = h.local(YearSpec::Single(2027), &["device"]).await.unwrap();
    assert!(again.loaded_tables.is_empty());
    assert_eq!(h.keys_and_years("device").await.len(), 4);
}

#[tokio::test]
async fn batched_and_sequential_loads_produce_the_same_rows() {
    let batched_dir = tempdir().unwrap();
    let batched = Harness::new(batched_dir.path()).await;
    batched.write("mdrfoithru2025.txt", MASTER);
    batched
        .local(YearSpec::List(vec![2018, 2019, 2020]), &["master"])
        .await
        .unwrap();

    let sequential_dir = tempdir().unwrap();
    let sequential = Harness::new(sequential_dir.path()).await;
    sequential.write("mdrfoithru2025.txt", MASTER);
    for year in [2018, 2019, 2020] {
        sequential.local(YearSpec::Single(year), &["master"]).await.unwrap();
    }

    let expected = vec![
        ("1".to_string(), Some(2019)),
        ("2".to_string(), Some(2020)),
        ("3".to_string(), Some(2020)),
        ("4".to_string(), Some(2018)),
    ];
    assert_eq!(batched.keys_and_years("master").await, expected);
    assert_eq!(sequential.keys_and_years("master").await, expected);

    let counts = |records: Vec<maude_core::LoadRecord>| -> Vec<(i32, u64)> {
        records.iter().map(|r| (r.year, r.row_count)).collect()
    };
    assert_eq!(
        counts(batched.pipeline.status().await.unwrap().records),
        counts(sequential.pipeline.status().await.unwrap().records)
    );
}

#[tokio::test]
async fn shared_event_keys_collapse_after_ingest() {
    let dir = tempdir().unwrap();
    let h = Harness::new(dir.path()).await;
    h.write(
        "mdrfoithru2025.txt",
        "MDR_REPORT_KEY|EVENT_KEY|DATE_RECEIVED\n\
         100|E1|03/01/2020\n\
         101|E1|03/02/2020\n\
         102|E1|03/03/2020\n\
         103||03/04/2020\n",
    );
    h.write(
        "device2020.txt",
        "MDR_REPORT_KEY|BRAND_NAME|DEVICE_REPORT_PRODUCT_CODE\n\
         100|Acme Pump|FRN\n\
         101|ACME PUMP|FRN\n\
         102|acme pump|FRN\n\
         103|Acme Pump|FRN\n",
    );
    h.local(YearSpec::Single(2020), &["master", "device"]).await.unwrap();

    let rows = h
        .pipeline
        .query_events(&EventQuery::new().brand_name("Acme Pump"))
        .await
        .unwrap();
    assert_eq!(rows.report_count, 4);
    assert_eq!(rows.event_count, 2);
    assert_eq!(rows.unique_events("EVENT_KEY"), 2);
    let key = rows.column_index("MDR_REPORT_KEY").unwrap();
    assert_eq!(rows.rows[0][key].as_deref(), Some("100"));
    assert_eq!(rows.rows[1][key].as_deref(), Some("103"));
}

#[tokio::test]
async fn empty_requests_write_nothing() {
    let dir = tempdir().unwrap();
    let h = Harness::new(dir.path()).await;

    let no_years = h.local(YearSpec::List(Vec::new()), &["master"]).await.unwrap();
    let no_tables = h.local(YearSpec::Single(2020), &[]).await.unwrap();
    for report in [no_years, no_tables] {
        assert!(report.loaded_tables.is_empty());
        assert!(report.skipped.is_empty());
        assert!(report.warnings.is_empty());
    }
    assert!(h.pipeline.status().await.unwrap().records.is_empty());
}

#[tokio::test]
async fn invalid_and_missing_years_are_skipped_unless_strict() {
    let dir = tempdir().unwrap();
    let h = Harness::new(dir.path()).await;

    let report = h.local(YearSpec::List(vec![1990, 2021]), &["device"]).await.unwrap();
    let kinds: Vec<WarningKind> = report.warnings.iter().map(|w| w.kind).collect();
    assert_eq!(kinds, vec![WarningKind::InvalidYear, WarningKind::MissingFile]);
    assert_eq!(report.skipped.len(), 2);

    let strict_dir = tempdir().unwrap();
    let strict = Harness::with_strict(strict_dir.path(), true).await;
    let err = strict.local(YearSpec::Single(1990), &["device"]).await.unwrap_err();
    assert!(matches!(err, IngestError::Engine(EngineError::InvalidRequest(_))));
    let err = strict.local(YearSpec::Single(2021), &["device"]).await.unwrap_err();
    assert!(matches!(err, IngestError::Engine(EngineError::SourceUnavailable { .. })));
}

#[tokio::test]
async fn unknown_tables_are_rejected() {
    let dir = tempdir().unwrap();
    let h = Harness::new(dir.path()).await;
    let err = h.local(YearSpec::Single(2020), &["recalls"]).await.unwrap_err();
    assert!(matches!(err, IngestError::Engine(EngineError::UnknownTable(_))));
}

#[tokio::test]
async fn cumulative_archive_is_downloaded_once_per_run() {
    let dir = tempdir().unwrap();
    let h = Harness::new(dir.path()).await;
    h.upstream.publish("mdrfoithru2025.zip", "mdrfoithru2025.txt", MASTER);

    let request = IngestRequest::new(range(2019, 2020), ["master"]);
    let report = h.pipeline.ingest(&request).await.unwrap();
    assert_eq!(report.per_year_counts["master"][&2020], 2);
    assert_eq!(h.upstream.downloads(), vec!["mdrfoithru2025.zip"]);

    let again = h.pipeline.ingest(&request).await.unwrap();
    assert!(again.loaded_tables.is_empty());
    assert_eq!(h.upstream.downloads().len(), 1);
}

#[tokio::test]
async fn update_revisits_ledger_years_and_can_extend_them() {
    let dir = tempdir().unwrap();
    let h = Harness::new(dir.path()).await;
    h.write("mdrfoithru2025.txt", MASTER);
    h.local(range(2019, 2020), &["master"]).await.unwrap();

    let unchanged = h.pipeline.update(false, false).await.unwrap();
    assert!(unchanged.loaded_tables.is_empty());
    assert_eq!(unchanged.skipped.len(), 2);

    let extended = h.pipeline.update(true, false).await.unwrap();
    let years: Vec<i32> = extended.per_year_counts["master"].keys().copied().collect();
    assert_eq!(years, (2019..=2025).collect::<Vec<_>>());
    assert!(extended
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::MissingFile && w.year == Some(2026)));
    assert_eq!(h.keys_and_years("master").await.len(), 3);
}
