use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use maude_core::{EngineError, IngestWarning, TableId, WarningKind};
use maude_sources::{
    candidates, find_local, resolve_remote, Candidate, RemoteProbe, Resolution, SourceCatalog,
};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{extract_archive, ArchiveSource, FetchError};

/// Source of "today", injectable so year arithmetic is testable.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;

    fn current_year(&self) -> i32 {
        self.today().year()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct EnsuredFile {
    /// Extracted text file.
    pub path: PathBuf,
    pub archive_name: String,
    pub fell_back_from: Option<String>,
    pub warnings: Vec<IngestWarning>,
}

/// Turns (table, year) into a local text file, downloading and extracting
/// archives on demand. Archives already materialized during the lifetime of
/// the cache are remembered by name so a cumulative file is handled once.
pub struct ArchiveCache {
    data_dir: PathBuf,
    catalog: Arc<SourceCatalog>,
    source: Arc<dyn ArchiveSource>,
    probe: Arc<dyn RemoteProbe>,
    clock: Arc<dyn Clock>,
    memo: Mutex<HashMap<String, PathBuf>>,
}

impl ArchiveCache {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        catalog: Arc<SourceCatalog>,
        source: Arc<dyn ArchiveSource>,
        probe: Arc<dyn RemoteProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            catalog,
            source,
            probe,
            clock,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub async fn clear_memo(&self) {
        self.memo.lock().await.clear();
    }

    /// Materialize the text file for (table, year), fetching if needed.
    pub async fn ensure(
        &self,
        table: &str,
        year: i32,
        force_refetch: bool,
    ) -> Result<EnsuredFile, EngineError> {
        let descriptor = self.catalog.get(table)?;
        let now = self.clock.current_year();
        fs::create_dir_all(&self.data_dir).await?;

        // Another year already materialized this archive during the run.
        let all = candidates(descriptor, year, now);
        let expected = all.first().map(Candidate::archive_name);
        for candidate in &all {
            let archive_name = candidate.archive_name();
            let Some(path) = self.memo.lock().await.get(&archive_name).cloned() else {
                continue;
            };
            debug!(%table, year, archive = %archive_name, "archive already handled this run");
            let fell_back_from = expected.clone().filter(|name| name != &archive_name);
            return Ok(Self::ensured(&descriptor.table, year, path, archive_name, fell_back_from, Vec::new()));
        }

        let resolution = match resolve_remote(descriptor, year, now, self.probe.as_ref()).await {
            Ok(resolution) => resolution,
            Err(err @ EngineError::SourceUnavailable { .. }) => {
                // Offline: any archive already on disk is better than nothing.
                let ordered: Vec<Candidate> = candidates(descriptor, year, now)
                    .into_iter()
                    .filter(|c| self.data_dir.join(c.archive_name()).exists())
                    .collect();
                if ordered.is_empty() {
                    return Err(err);
                }
                debug!(%table, year, "upstream probe found nothing, using cached archive");
                Resolution {
                    ordered,
                    fell_back_from: None,
                }
            }
            Err(err) => return Err(err),
        };

        let mut warnings = Vec::new();
        let mut failures = Vec::new();
        let expected = resolution.ordered.first().map(Candidate::archive_name);

        for candidate in &resolution.ordered {
            let archive_name = candidate.archive_name();
            match self
                .materialize(candidate, force_refetch, &descriptor.table, year, &mut warnings)
                .await
            {
                Ok(path) => {
                    let fell_back_from = resolution.fell_back_from.clone().or_else(|| {
                        expected.clone().filter(|name| name != &archive_name)
                    });
                    return Ok(Self::ensured(&descriptor.table, year, path, archive_name, fell_back_from, warnings));
                }
                // Only a failed download moves on to the next candidate.
                Err(EngineError::SourceUnavailable { reason, .. }) => {
                    debug!(archive = %archive_name, %reason, "candidate unavailable");
                    failures.push(reason);
                }
                Err(err) => return Err(err),
            }
        }

        Err(EngineError::SourceUnavailable {
            table: descriptor.table.to_string(),
            year,
            reason: failures.join("; "),
        })
    }

    fn ensured(
        table: &TableId,
        year: i32,
        path: PathBuf,
        archive_name: String,
        fell_back_from: Option<String>,
        mut warnings: Vec<IngestWarning>,
    ) -> EnsuredFile {
        if let Some(from) = &fell_back_from {
            warnings.push(
                IngestWarning::new(
                    WarningKind::FallbackUsed,
                    format!("{from} unavailable, using {archive_name}"),
                )
                .for_table(table)
                .for_year(year),
            );
        }
        EnsuredFile {
            path,
            archive_name,
            fell_back_from,
            warnings,
        }
    }

    /// Local-only lookup: an extracted text file, else a cached archive.
    pub async fn locate(&self, table: &str, year: i32) -> Result<Option<PathBuf>, EngineError> {
        let descriptor = self.catalog.get(table)?;
        let now = self.clock.current_year();
        if let Some(path) = find_local(&self.data_dir, descriptor, year, now) {
            return Ok(Some(path));
        }

        for candidate in candidates(descriptor, year, now) {
            let archive = self.data_dir.join(candidate.archive_name());
            if archive.exists() {
                let path = self.extract(&archive, &candidate.stem).await?;
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    async fn materialize(
        &self,
        candidate: &Candidate,
        force_refetch: bool,
        table: &TableId,
        year: i32,
        warnings: &mut Vec<IngestWarning>,
    ) -> Result<PathBuf, EngineError> {
        let archive_name = candidate.archive_name();
        if let Some(path) = self.memo.lock().await.get(&archive_name) {
            return Ok(path.clone());
        }

        let archive = self.data_dir.join(&archive_name);
        if !force_refetch {
            if archive.exists() {
                match self.extract(&archive, &candidate.stem).await {
                    Ok(path) => return self.remember(archive_name, path).await,
                    Err(EngineError::ArchiveCorrupt { reason, .. }) => {
                        warn!(archive = %archive_name, %reason, "cached archive corrupt, re-fetching");
                        warnings.push(
                            IngestWarning::new(
                                WarningKind::ArchiveCorrupt,
                                format!("{archive_name} was corrupt ({reason}); downloaded again"),
                            )
                            .for_table(table)
                            .for_year(year),
                        );
                        fs::remove_file(&archive).await?;
                    }
                    Err(err) => return Err(err),
                }
            } else if let Some(path) = candidate
                .local_names()
                .into_iter()
                .map(|name| self.data_dir.join(name))
                .find(|path| path.exists())
            {
                return self.remember(archive_name, path).await;
            }
        }

        self.download(&archive_name, &archive, table, year).await?;
        let path = self.extract(&archive, &candidate.stem).await?;
        self.remember(archive_name, path).await
    }

    /// Upstream failures surface as `SourceUnavailable`; failures writing
    /// to the data directory stay `Io`.
    async fn download(
        &self,
        archive_name: &str,
        archive: &Path,
        table: &TableId,
        year: i32,
    ) -> Result<(), EngineError> {
        let temp = self
            .data_dir
            .join(format!(".{}.{archive_name}.tmp", Uuid::new_v4()));
        let bytes = match self.source.fetch_archive(archive_name, &temp).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = fs::remove_file(&temp).await;
                return Err(match err {
                    FetchError::Io(err) => EngineError::Io(err),
                    other => EngineError::SourceUnavailable {
                        table: table.to_string(),
                        year,
                        reason: format!("{archive_name}: {other}"),
                    },
                });
            }
        };
        if let Err(err) = fs::rename(&temp, archive).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err.into());
        }
        info!(archive = %archive_name, bytes, "archive cached");
        Ok(())
    }

    async fn extract(&self, archive: &Path, stem: &str) -> Result<PathBuf, EngineError> {
        let archive = archive.to_path_buf();
        let dest = self.data_dir.clone();
        let stem = stem.to_string();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &dest, &stem))
            .await
            .map_err(|err| EngineError::Io(std::io::Error::other(err)))?
    }

    async fn remember(&self, archive_name: String, path: PathBuf) -> Result<PathBuf, EngineError> {
        self.memo.lock().await.insert(archive_name, path.clone());
        Ok(path)
    }
}
