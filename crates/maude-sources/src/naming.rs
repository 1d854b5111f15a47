//! Maps an abstract (table, year) request onto the concrete archive and text
//! file names the upstream publishes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use maude_core::{Distribution, EngineError, SourceDescriptor};
use tracing::warn;

pub const ARCHIVE_EXT: &str = "zip";
pub const TEXT_EXT: &str = "txt";

/// Extra cumulative cutoffs tried after the expected `now - 1` file.
const CUMULATIVE_FALLBACKS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    CurrentYear,
    PerYear,
    Cumulative { through: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub stem: String,
    pub kind: CandidateKind,
}

impl Candidate {
    pub fn archive_name(&self) -> String {
        format!("{}.{ARCHIVE_EXT}", self.stem)
    }

    /// Extracted file names to look for, most likely first. Upstream casing is
    /// not stable, so upper-cased and `Thru` variants are included.
    pub fn local_names(&self) -> Vec<String> {
        let mut stems = vec![self.stem.clone(), self.stem.to_ascii_uppercase()];
        if let CandidateKind::Cumulative { through } = self.kind {
            if let Some(prefix) = self.stem.strip_suffix(&format!("thru{through}")) {
                stems.push(format!("{}thru{through}", prefix.to_ascii_uppercase()));
                stems.push(format!("{prefix}Thru{through}"));
            }
        }

        let mut seen = BTreeSet::new();
        stems
            .into_iter()
            .filter(|stem| seen.insert(stem.clone()))
            .map(|stem| format!("{stem}.{TEXT_EXT}"))
            .collect()
    }
}

/// Candidate files for `year`, ordered by likelihood.
pub fn candidates(descriptor: &SourceDescriptor, year: i32, now_year: i32) -> Vec<Candidate> {
    let mut out = Vec::new();
    if year == now_year {
        out.push(Candidate {
            stem: descriptor.current_year_alias.clone(),
            kind: CandidateKind::CurrentYear,
        });
    }

    match &descriptor.distribution {
        Distribution::PerYear { .. } => out.push(Candidate {
            stem: format!("{}{year}", descriptor.prefix_for_year(year)),
            kind: CandidateKind::PerYear,
        }),
        Distribution::Cumulative { .. } => {
            if year < now_year {
                let expected = now_year - 1;
                for through in (expected - CUMULATIVE_FALLBACKS..=expected).rev() {
                    if through < year {
                        break;
                    }
                    out.push(Candidate {
                        stem: format!("{}thru{through}", descriptor.prefix),
                        kind: CandidateKind::Cumulative { through },
                    });
                }
            }
        }
    }

    out
}

/// Existence check against the remote origin, injectable for tests.
#[async_trait]
pub trait RemoteProbe: Send + Sync {
    async fn exists(&self, archive_name: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Candidates to fetch, in order.
    pub ordered: Vec<Candidate>,
    /// Archive name that was expected when a cumulative fallback was taken.
    pub fell_back_from: Option<String>,
}

/// Resolve remote candidates for `year`. Cumulative cutoffs are probed and the
/// first one that exists upstream wins; other kinds are returned unprobed and
/// the fetch itself decides.
pub async fn resolve_remote(
    descriptor: &SourceDescriptor,
    year: i32,
    now_year: i32,
    probe: &dyn RemoteProbe,
) -> Result<Resolution, EngineError> {
    let all = candidates(descriptor, year, now_year);
    if all.is_empty() {
        return Err(EngineError::SourceUnavailable {
            table: descriptor.table.to_string(),
            year,
            reason: "no candidate file name for this year".into(),
        });
    }

    let (cumulative, direct): (Vec<_>, Vec<_>) = all
        .into_iter()
        .partition(|c| matches!(c.kind, CandidateKind::Cumulative { .. }));
    if cumulative.is_empty() {
        return Ok(Resolution {
            ordered: direct,
            fell_back_from: None,
        });
    }

    let expected = cumulative[0].archive_name();
    for (idx, candidate) in cumulative.iter().enumerate() {
        let name = candidate.archive_name();
        if probe.exists(&name).await {
            let fell_back_from = (idx > 0).then(|| expected.clone());
            if let Some(from) = &fell_back_from {
                warn!(table = %descriptor.table, year, expected = %from, using = %name,
                    "expected cumulative file not published, using latest available");
            }
            return Ok(Resolution {
                ordered: vec![candidate.clone()],
                fell_back_from,
            });
        }
    }

    Err(EngineError::SourceUnavailable {
        table: descriptor.table.to_string(),
        year,
        reason: format!(
            "none of {} exist upstream",
            cumulative
                .iter()
                .map(Candidate::archive_name)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    })
}

/// Find an already-extracted text file for (table, year) under `dir`.
pub fn find_local(
    dir: &Path,
    descriptor: &SourceDescriptor,
    year: i32,
    now_year: i32,
) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();

    for candidate in candidates(descriptor, year, now_year) {
        for local in candidate.local_names() {
            if names.iter().any(|name| name == &local) {
                return Some(dir.join(local));
            }
        }
    }

    match &descriptor.distribution {
        Distribution::Cumulative { .. } if year < now_year => {
            scan_cumulative(&names, &descriptor.prefix, year).map(|name| dir.join(name))
        }
        Distribution::Cumulative { .. } | Distribution::PerYear { .. } => None,
    }
}

/// Pick the `{prefix}...thru{YYYY}.txt` file with the newest cutoff covering `year`.
fn scan_cumulative(names: &[String], prefix: &str, year: i32) -> Option<String> {
    let prefix = prefix.to_ascii_lowercase();
    let suffix = format!(".{TEXT_EXT}");
    names
        .iter()
        .filter_map(|name| {
            let lower = name.to_ascii_lowercase();
            let body = lower.strip_prefix(&prefix)?.strip_suffix(&suffix)?;
            let (_, digits) = body.rsplit_once("thru")?;
            let through = digits.parse::<i32>().ok()?;
            (through >= year).then_some((through, name))
        })
        .max_by_key(|(through, _)| *through)
        .map(|(_, name)| name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceCatalog;
    use std::collections::HashSet;

    struct FakeProbe {
        present: HashSet<String>,
    }

    #[async_trait]
    impl RemoteProbe for FakeProbe {
        async fn exists(&self, archive_name: &str) -> bool {
            self.present.contains(archive_name)
        }
    }

    fn probe(names: &[&str]) -> FakeProbe {
        FakeProbe {
            present: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn names(list: &[Candidate]) -> Vec<String> {
        list.iter().map(Candidate::archive_name).collect()
    }

    #[test]
    fn per_year_names_follow_schema_era() {
        let catalog = SourceCatalog::builtin();
        let device = catalog.get("device").unwrap();
        assert_eq!(names(&candidates(device, 2023, 2026)), vec!["device2023.zip"]);
        assert_eq!(names(&candidates(device, 1999, 2026)), vec!["foidev1999.zip"]);

        let text = catalog.get("text").unwrap();
        assert_eq!(names(&candidates(text, 2010, 2026)), vec!["foitext2010.zip"]);
    }

    #[test]
    fn current_year_alias_is_tried_first() {
        let catalog = SourceCatalog::builtin();
        let device = catalog.get("device").unwrap();
        let list = candidates(device, 2026, 2026);
        assert_eq!(names(&list), vec!["device.zip", "device2026.zip"]);
        assert_eq!(list[0].local_names(), vec!["device.txt", "DEVICE.txt"]);

        let master = catalog.get("master").unwrap();
        assert_eq!(names(&candidates(master, 2026, 2026)), vec!["mdrfoi.zip"]);
    }

    #[test]
    fn cumulative_cutoffs_never_precede_the_year() {
        let catalog = SourceCatalog::builtin();
        let master = catalog.get("master").unwrap();
        assert_eq!(
            names(&candidates(master, 2015, 2026)),
            vec![
                "mdrfoithru2025.zip",
                "mdrfoithru2024.zip",
                "mdrfoithru2023.zip",
                "mdrfoithru2022.zip"
            ]
        );
        assert_eq!(names(&candidates(master, 2024, 2026)), vec![
            "mdrfoithru2025.zip",
            "mdrfoithru2024.zip"
        ]);
    }

    #[test]
    fn cumulative_local_names_cover_casing_drift() {
        let catalog = SourceCatalog::builtin();
        let master = catalog.get("master").unwrap();
        let first = &candidates(master, 2015, 2026)[0];
        assert_eq!(
            first.local_names(),
            vec![
                "mdrfoithru2025.txt",
                "MDRFOITHRU2025.txt",
                "MDRFOIthru2025.txt",
                "mdrfoiThru2025.txt"
            ]
        );
    }

    #[tokio::test]
    async fn remote_resolution_prefers_expected_cutoff() {
        let catalog = SourceCatalog::builtin();
        let master = catalog.get("master").unwrap();
        let resolved = resolve_remote(
            master,
            2015,
            2026,
            &probe(&["mdrfoithru2025.zip", "mdrfoithru2024.zip"]),
        )
        .await
        .unwrap();
        assert_eq!(names(&resolved.ordered), vec!["mdrfoithru2025.zip"]);
        assert_eq!(resolved.fell_back_from, None);
    }

    #[tokio::test]
    async fn remote_resolution_falls_back_when_unpublished() {
        let catalog = SourceCatalog::builtin();
        let master = catalog.get("master").unwrap();
        let resolved = resolve_remote(master, 2015, 2026, &probe(&["mdrfoithru2024.zip"]))
            .await
            .unwrap();
        assert_eq!(names(&resolved.ordered), vec!["mdrfoithru2024.zip"]);
        assert_eq!(resolved.fell_back_from.as_deref(), Some("mdrfoithru2025.zip"));

        let missing = resolve_remote(master, 2015, 2026, &probe(&[])).await;
        assert!(matches!(missing, Err(EngineError::SourceUnavailable { .. })));
    }

    #[tokio::test]
    async fn per_year_resolution_does_not_probe() {
        let catalog = SourceCatalog::builtin();
        let device = catalog.get("device").unwrap();
        let resolved = resolve_remote(device, 2026, 2026, &probe(&[])).await.unwrap();
        assert_eq!(names(&resolved.ordered), vec!["device.zip", "device2026.zip"]);
    }

    #[test]
    fn local_lookup_tolerates_casing_and_scans_cutoffs() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SourceCatalog::builtin();

        std::fs::write(dir.path().join("DEVICE2020.txt"), "x").unwrap();
        let device = catalog.get("device").unwrap();
        assert_eq!(
            find_local(dir.path(), device, 2020, 2026),
            Some(dir.path().join("DEVICE2020.txt"))
        );
        assert_eq!(find_local(dir.path(), device, 2021, 2026), None);

        std::fs::write(dir.path().join("MDRFOIThru2022.txt"), "x").unwrap();
        std::fs::write(dir.path().join("mdrfoithru2023.TXT"), "x").unwrap();
        let master = catalog.get("master").unwrap();
        assert_eq!(
            find_local(dir.path(), master, 2015, 2026),
            Some(dir.path().join("mdrfoithru2023.TXT"))
        );
        assert_eq!(find_local(dir.path(), master, 2024, 2026), None);
        assert_eq!(find_local(dir.path(), master, 2026, 2026), None);
    }
}
