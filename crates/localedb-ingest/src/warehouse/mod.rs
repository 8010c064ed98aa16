//! Warehouse storage interface
//!
//! Every loader writes through [`Warehouse`]. Each `replace_*` call is one
//! transaction: the previous rows of the scope are deleted and the new rows
//! inserted, or nothing changes at all.
//!
//! Two implementations exist:
//!
//! - [`PgWarehouse`]: PostgreSQL + PostGIS through `sqlx`
//! - [`MemoryWarehouse`]: in-process, same semantics, for dry runs and tests

use async_trait::async_trait;
use std::collections::HashMap;

use localedb_common::types::{Domain, Fips};

use crate::error::Result;
use crate::models::{
    DynRow, GeoFeature, GeoLevel, LocaleRecord, NpiRecord, ObservationRow, PopEntity,
    PopulationBatch, PopulationCounts, VaxRecord,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create or migrate the schema; idempotent
    async fn ensure_schema(&self) -> Result<()>;

    // ------------------------------------------------------------------
    // Locales
    // ------------------------------------------------------------------

    /// Insert or match locales by name hierarchy; ids in input order
    async fn upsert_locales(&self, locales: &[LocaleRecord]) -> Result<Vec<i64>>;

    /// Ids of U.S. locales by FIPS code; unknown codes are absent
    async fn us_locale_ids(&self, fips: &[String]) -> Result<HashMap<String, i64>>;

    async fn count_locales(&self) -> Result<u64>;

    // ------------------------------------------------------------------
    // Geography
    // ------------------------------------------------------------------

    async fn replace_geo_features(
        &self,
        level: GeoLevel,
        scope: &Fips,
        features: &[GeoFeature],
    ) -> Result<u64>;

    /// Replace every given layer of a state and register `locales`, all in
    /// one transaction. Layers not listed keep their rows.
    async fn replace_geo_partition(
        &self,
        scope: &Fips,
        layers: &[(GeoLevel, Vec<GeoFeature>)],
        locales: &[LocaleRecord],
    ) -> Result<u64>;

    async fn delete_geo_features(&self, level: GeoLevel, scope: &Fips) -> Result<u64>;

    async fn count_geo_features(&self, level: GeoLevel, scope: Option<&Fips>) -> Result<u64>;

    // ------------------------------------------------------------------
    // Population
    // ------------------------------------------------------------------

    /// Replace a state's population; rolls back on any integrity failure
    async fn replace_population(
        &self,
        scope: &Fips,
        batch: &PopulationBatch,
    ) -> Result<PopulationCounts>;

    async fn delete_population(&self, scope: &Fips) -> Result<PopulationCounts>;

    async fn count_population(&self, entity: PopEntity, scope: Option<&Fips>) -> Result<u64>;

    /// Persons and group-quarters persons whose owner is missing
    async fn count_orphaned_persons(&self) -> Result<u64>;

    // ------------------------------------------------------------------
    // Disease dynamics
    // ------------------------------------------------------------------

    async fn replace_disease_dynamics(&self, disease: &str, rows: &[DynRow]) -> Result<u64>;

    async fn delete_disease_dynamics(&self, disease: &str) -> Result<u64>;

    /// Rows of one disease ordered by locale and day
    async fn disease_dynamics(&self, disease: &str) -> Result<Vec<DynRow>>;

    async fn count_disease_dynamics(&self, disease: &str) -> Result<u64>;

    // ------------------------------------------------------------------
    // Interventions and vaccination
    // ------------------------------------------------------------------

    async fn replace_npis(&self, disease: &str, records: &[NpiRecord]) -> Result<u64>;

    async fn delete_npis(&self, disease: &str) -> Result<u64>;

    async fn count_npis(&self, disease: &str) -> Result<u64>;

    async fn replace_vaccinations(&self, vaccine: &str, records: &[VaxRecord]) -> Result<u64>;

    async fn delete_vaccinations(&self, vaccine: &str) -> Result<u64>;

    async fn count_vaccinations(&self, vaccine: &str) -> Result<u64>;

    // ------------------------------------------------------------------
    // Locale observations (health, weather, mobility)
    // ------------------------------------------------------------------

    async fn replace_observations(
        &self,
        domain: Domain,
        scope: &Fips,
        rows: &[ObservationRow],
    ) -> Result<u64>;

    async fn delete_observations(&self, domain: Domain, scope: &Fips) -> Result<u64>;

    async fn count_observations(&self, domain: Domain, scope: Option<&Fips>) -> Result<u64>;

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Refresh planner statistics of the given tables
    async fn analyze(&self, tables: &[&'static str]) -> Result<()>;
}
