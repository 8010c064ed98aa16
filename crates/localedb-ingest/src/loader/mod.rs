//! Domain loaders
//!
//! A loader turns the staged files of one catalog entry into warehouse rows.
//! Loaders are created per partition and see its entries in catalog order;
//! [`DomainLoader::finish`] runs once after the last entry, which is where
//! loaders that merge several entries (disease feeds) write.
//!
//! Malformed rows are skipped and counted, never fatal. A critical entry that
//! yields no rows at all is an [`IngestError::EmptyLoad`].

use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use localedb_common::types::Domain;

use crate::catalog::{CatalogEntry, PartitionKey};
use crate::error::{IngestError, Result};
use crate::geometry::GeometryIngester;
use crate::warehouse::Warehouse;

pub mod disease;
pub mod geo;
pub mod locale;
pub mod npi;
pub mod observation;
pub mod population;
pub mod vaccination;

pub use disease::{Consolidator, DiseaseLoader};
pub use geo::GeoLoader;
pub use locale::LocaleListLoader;
pub use npi::NpiLoader;
pub use observation::ObservationLoader;
pub use population::PopulationLoader;
pub use vaccination::VaccinationLoader;

/// Rows written and rows skipped by one load step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    pub rows: u64,
    pub skipped: u64,
}

impl LoadOutcome {
    pub fn new(rows: u64, skipped: u64) -> Self {
        Self { rows, skipped }
    }
}

impl std::ops::AddAssign for LoadOutcome {
    fn add_assign(&mut self, other: Self) {
        self.rows += other.rows;
        self.skipped += other.skipped;
    }
}

#[async_trait]
pub trait DomainLoader: Send {
    /// Load the staged workspace of one entry
    async fn load(&mut self, entry: &CatalogEntry, workspace: &Path) -> Result<LoadOutcome>;

    /// Write anything accumulated across entries
    async fn finish(&mut self) -> Result<LoadOutcome> {
        Ok(LoadOutcome::default())
    }

    /// Tables whose statistics are refreshed after the partition commits
    fn tables(&self) -> Vec<&'static str>;
}

/// What loaders share within an invocation
#[derive(Clone)]
pub struct LoaderContext {
    pub warehouse: Arc<dyn Warehouse>,
    pub geometry: Arc<dyn GeometryIngester>,
    pub disease_epoch: NaiveDate,
}

/// The loader for one partition of `domain`
pub fn loader_for(
    domain: Domain,
    key: &PartitionKey,
    ctx: &LoaderContext,
) -> Result<Box<dyn DomainLoader>> {
    let wh = ctx.warehouse.clone();
    let loader: Box<dyn DomainLoader> = match (domain, key) {
        (Domain::Main, _) => Box::new(LocaleListLoader::new(wh)),
        (Domain::Geo, PartitionKey::State(state)) => {
            Box::new(GeoLoader::new(wh, ctx.geometry.clone(), state.clone()))
        },
        (Domain::Pop, PartitionKey::State(state)) => {
            Box::new(PopulationLoader::new(wh, state.clone()))
        },
        (Domain::Disease, PartitionKey::Disease(id)) => {
            Box::new(DiseaseLoader::new(wh, id.clone(), ctx.disease_epoch))
        },
        (Domain::Npi, PartitionKey::Disease(id)) => Box::new(NpiLoader::new(wh, id.clone())),
        (Domain::Vaccination, PartitionKey::Disease(id)) => {
            Box::new(VaccinationLoader::new(wh, id.clone()))
        },
        (Domain::Health | Domain::Weather | Domain::Mobility, PartitionKey::State(state)) => {
            Box::new(ObservationLoader::new(wh, domain, state.clone()))
        },
        (domain, key) => {
            return Err(IngestError::invalid_partition(
                key.to_string(),
                format!("no loader for domain {}", domain),
            ))
        },
    };
    Ok(loader)
}

/// Regular files under `root`, in path order
pub fn staged_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Fail with `EmptyLoad` when a critical entry produced nothing
pub(crate) fn require_rows(entry: &CatalogEntry, rows: u64) -> Result<()> {
    if rows == 0 && entry.critical {
        return Err(IngestError::empty_load(&entry.label));
    }
    Ok(())
}

/// Trimmed cell, `None` when blank
pub(crate) fn cell(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_blank_is_none() {
        assert_eq!(cell(Some("  ")), None);
        assert_eq!(cell(Some(" x ")).as_deref(), Some("x"));
        assert_eq!(cell(None), None);
    }

    #[test]
    fn test_outcome_accumulates() {
        let mut total = LoadOutcome::new(3, 1);
        total += LoadOutcome::new(2, 0);
        assert_eq!(total, LoadOutcome::new(5, 1));
    }
}
