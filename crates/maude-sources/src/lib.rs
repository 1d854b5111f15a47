//! Source catalog for MAUDE tables plus the file-naming resolver.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use maude_core::{Distribution, EngineError, LegacyPrefix, SourceDescriptor, TableId};
use serde::Deserialize;

pub mod naming;

pub use naming::{
    candidates, find_local, resolve_remote, Candidate, CandidateKind, RemoteProbe, Resolution,
};

pub const CRATE_NAME: &str = "maude-sources";

/// Upstream location of the MAUDE archives.
pub const FDA_BASE_URL: &str = "https://www.accessdata.fda.gov/MAUDE/ftparea";

/// Tables ingested when a caller does not name any.
pub const DEFAULT_TABLES: [&str; 4] = ["master", "device", "patient", "text"];

#[derive(Debug, Clone, Deserialize)]
struct SourceCatalogFile {
    sources: Vec<SourceDescriptor>,
}

/// Closed set of table descriptors. Every table id maps to exactly one entry.
#[derive(Debug, Clone)]
pub struct SourceCatalog {
    descriptors: BTreeMap<TableId, SourceDescriptor>,
}

impl SourceCatalog {
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = SourceDescriptor>,
    ) -> Result<Self, EngineError> {
        let mut map = BTreeMap::new();
        for descriptor in descriptors {
            let table = descriptor.table.clone();
            if map.insert(table.clone(), descriptor).is_some() {
                return Err(EngineError::InvalidRequest(format!(
                    "table '{table}' is described more than once"
                )));
            }
        }
        Ok(Self { descriptors: map })
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let file: SourceCatalogFile =
            serde_yaml::from_str(text).context("parsing source catalog yaml")?;
        Ok(Self::from_descriptors(file.sources)?)
    }

    pub fn from_yaml_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// The five tables published by the FDA.
    pub fn builtin() -> Self {
        let table = |name: &str| TableId::new(name).expect("builtin table ids are valid");
        let columns = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let descriptors = vec![
            SourceDescriptor {
                table: table("master"),
                prefix: "mdrfoi".into(),
                distribution: Distribution::Cumulative {
                    date_column: "DATE_RECEIVED".into(),
                },
                earliest_year: 1991,
                current_year_alias: "mdrfoi".into(),
                size_warning: None,
                description: "Master records (adverse event reports)".into(),
                index_columns: columns(&["MDR_REPORT_KEY", "DATE_RECEIVED", "EVENT_KEY"]),
            },
            SourceDescriptor {
                table: table("device"),
                prefix: "device".into(),
                distribution: Distribution::PerYear {
                    legacy: Some(LegacyPrefix {
                        before_year: 2000,
                        prefix: "foidev".into(),
                    }),
                },
                earliest_year: 1998,
                current_year_alias: "device".into(),
                size_warning: None,
                description: "Device information".into(),
                index_columns: columns(&["MDR_REPORT_KEY", "DEVICE_REPORT_PRODUCT_CODE"]),
            },
            SourceDescriptor {
                table: table("text"),
                prefix: "foitext".into(),
                distribution: Distribution::PerYear { legacy: None },
                earliest_year: 1996,
                current_year_alias: "foitext".into(),
                size_warning: None,
                description: "Event narrative text".into(),
                index_columns: columns(&["MDR_REPORT_KEY"]),
            },
            SourceDescriptor {
                table: table("patient"),
                prefix: "patient".into(),
                distribution: Distribution::Cumulative {
                    date_column: "DATE_RECEIVED".into(),
                },
                earliest_year: 1996,
                current_year_alias: "patient".into(),
                size_warning: Some(
                    "Patient data is distributed as a single large file (117MB compressed, \
                     841MB uncompressed). All data will be downloaded even if you only need \
                     specific years."
                        .into(),
                ),
                description: "Patient demographics".into(),
                index_columns: columns(&["MDR_REPORT_KEY"]),
            },
            SourceDescriptor {
                table: table("problems"),
                prefix: "foidevproblem".into(),
                distribution: Distribution::PerYear { legacy: None },
                earliest_year: 2019,
                current_year_alias: "foidevproblem".into(),
                size_warning: None,
                description: "Device problem codes".into(),
                index_columns: columns(&["MDR_REPORT_KEY"]),
            },
        ];

        Self::from_descriptors(descriptors).expect("builtin catalog has unique tables")
    }

    pub fn get(&self, table: &str) -> Result<&SourceDescriptor, EngineError> {
        TableId::new(table)
            .ok()
            .and_then(|id| self.descriptors.get(&id))
            .ok_or_else(|| EngineError::UnknownTable(table.to_string()))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.descriptors.values()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableId> {
        self.descriptors.keys()
    }
}

impl Default for SourceCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_resolves_every_default_table() {
        let catalog = SourceCatalog::builtin();
        for table in DEFAULT_TABLES {
            assert_eq!(catalog.get(table).unwrap().table.as_str(), table);
        }
        assert_eq!(catalog.tables().count(), 5);
    }

    #[test]
    fn unknown_table_is_an_error_not_a_guess() {
        let catalog = SourceCatalog::builtin();
        match catalog.get("devices") {
            Err(EngineError::UnknownTable(name)) => assert_eq!(name, "devices"),
            other => panic!("expected UnknownTable, got {other:?}"),
        }
        assert!(matches!(catalog.get("DEVICE"), Err(EngineError::UnknownTable(_))));
    }

    #[test]
    fn duplicate_descriptors_are_rejected() {
        let catalog = SourceCatalog::builtin();
        let master = catalog.get("master").unwrap().clone();
        assert!(SourceCatalog::from_descriptors(vec![master.clone(), master]).is_err());
    }

    #[test]
    fn yaml_catalog_round_trips_the_descriptor_shape() {
        let yaml = r#"
sources:
  - table: master
    prefix: mdrfoi
    distribution:
      pattern: cumulative
      date_column: DATE_RECEIVED
    earliest_year: 1991
    current_year_alias: mdrfoi
  - table: device
    prefix: device
    distribution:
      pattern: per_year
      legacy:
        before_year: 2000
        prefix: foidev
    earliest_year: 1998
    current_year_alias: device
    index_columns: [MDR_REPORT_KEY]
"#;
        let catalog = SourceCatalog::from_yaml_str(yaml).unwrap();
        let device = catalog.get("device").unwrap();
        assert_eq!(device.prefix_for_year(1999), "foidev");
        assert_eq!(device.index_columns, vec!["MDR_REPORT_KEY".to_string()]);
        assert!(catalog.get("patient").is_err());
    }
}
