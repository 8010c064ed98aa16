//! Census geography loader
//!
//! Each entry is one TIGER layer of one state. Layers are converted as their
//! entries arrive and held until [`DomainLoader::finish`], which replaces the
//! state's rows of every converted layer in one transaction. State and county
//! features are also registered as locales so later domains can reference
//! them. A partition that fails before `finish` writes nothing.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{require_rows, DomainLoader, LoadOutcome};
use crate::catalog::{CatalogEntry, Target};
use crate::error::{IngestError, Result};
use crate::geometry::{GeometryIngester, GeometryRow};
use crate::models::{GeoFeature, GeoLevel, LocaleRecord};
use crate::resolver::StatePartition;
use crate::warehouse::Warehouse;

pub struct GeoLoader {
    warehouse: Arc<dyn Warehouse>,
    geometry: Arc<dyn GeometryIngester>,
    state: StatePartition,
    staged: Vec<(GeoLevel, Vec<GeoFeature>)>,
}

impl GeoLoader {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        geometry: Arc<dyn GeometryIngester>,
        state: StatePartition,
    ) -> Self {
        Self {
            warehouse,
            geometry,
            state,
            staged: Vec::new(),
        }
    }

    fn locale_for(&self, level: GeoLevel, feature: &GeoFeature) -> LocaleRecord {
        let county = match level {
            GeoLevel::County => feature.name.as_deref(),
            _ => None,
        };
        LocaleRecord {
            lat: feature.intptlat,
            long: feature.intptlon,
            ..LocaleRecord::us(&feature.geoid, &self.state.name, county)
        }
    }
}

/// Attribute name without its vintage suffix (`GEOID10` -> `GEOID`)
fn base_name(name: &str) -> String {
    name.trim_end_matches(|c: char| c.is_ascii_digit())
        .to_ascii_uppercase()
}

/// Build a feature from converted attributes, or the reason it is unusable
pub fn feature_from_row(row: GeometryRow) -> std::result::Result<GeoFeature, String> {
    const KNOWN: [&str; 8] = [
        "GEOID", "STATEFP", "COUNTYFP", "NAME", "ALAND", "AWATER", "INTPTLAT", "INTPTLON",
    ];

    let mut known: [Option<String>; 8] = Default::default();
    let mut attrs = Map::new();

    for (name, value) in row.attributes {
        match KNOWN.iter().position(|k| *k == base_name(&name)) {
            Some(i) if known[i].is_none() => {
                let value = value.trim();
                if !value.is_empty() {
                    known[i] = Some(value.to_string());
                }
            },
            _ => {
                attrs.insert(name, Value::String(value));
            },
        }
    }

    let [geoid, statefp, countyfp, name, aland, awater, intptlat, intptlon] = known;
    let geoid = geoid.ok_or("missing GEOID")?;
    let statefp = statefp.ok_or("missing STATEFP")?;
    if row.wkt.trim().is_empty() {
        return Err(format!("feature {} has no geometry", geoid));
    }

    Ok(GeoFeature {
        geoid,
        statefp,
        countyfp,
        name,
        aland: aland.and_then(|v| v.parse().ok()),
        awater: awater.and_then(|v| v.parse().ok()),
        intptlat: intptlat.and_then(|v| v.parse().ok()),
        intptlon: intptlon.and_then(|v| v.parse().ok()),
        attrs: Value::Object(attrs),
        wkt: row.wkt,
    })
}

#[async_trait]
impl DomainLoader for GeoLoader {
    async fn load(&mut self, entry: &CatalogEntry, workspace: &Path) -> Result<LoadOutcome> {
        let Target::Geo(level) = entry.target else {
            return Err(IngestError::Internal(format!(
                "geography loader given {}",
                entry.label
            )));
        };
        let scope = entry
            .scope
            .as_ref()
            .ok_or_else(|| IngestError::Internal(format!("{} has no scope", entry.label)))?;

        let ingested = self.geometry.ingest(workspace).await?;
        debug!(files = ingested.files, rows = ingested.rows.len(), "Geometry converted");

        let mut features = Vec::with_capacity(ingested.rows.len());
        let mut skipped = 0u64;
        for row in ingested.rows {
            match feature_from_row(row) {
                Ok(feature) if feature.statefp == scope.as_str() => features.push(feature),
                Ok(feature) => {
                    debug!(geoid = %feature.geoid, statefp = %feature.statefp, "Feature outside scope");
                    skipped += 1;
                },
                Err(reason) => {
                    debug!(reason = %reason, "Skipping feature");
                    skipped += 1;
                },
            }
        }

        require_rows(entry, features.len() as u64)?;

        let rows = features.len() as u64;
        self.staged.retain(|(l, _)| *l != level);
        self.staged.push((level, features));
        info!(level = %level, state = %self.state, rows, skipped, "Geography layer converted");
        Ok(LoadOutcome::new(rows, skipped))
    }

    async fn finish(&mut self) -> Result<LoadOutcome> {
        let scope = &self.state.fips;
        let locales: Vec<LocaleRecord> = self
            .staged
            .iter()
            .filter(|(level, _)| level.registers_locales())
            .flat_map(|(level, features)| features.iter().map(|f| self.locale_for(*level, f)))
            .collect();

        let written = self
            .warehouse
            .replace_geo_partition(scope, &self.staged, &locales)
            .await?;
        info!(state = %self.state, layers = self.staged.len(), rows = written, "Geography committed");
        Ok(LoadOutcome::default())
    }

    fn tables(&self) -> Vec<&'static str> {
        let mut tables: Vec<&'static str> = self.staged.iter().map(|(l, _)| l.table()).collect();
        if self.staged.iter().any(|(l, _)| l.registers_locales()) {
            tables.push("main.locale");
        }
        tables
    }
}
