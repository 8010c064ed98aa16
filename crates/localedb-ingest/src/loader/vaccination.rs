//! Vaccination coverage loader
//!
//! # File Format
//! The coverage export, one estimate per row:
//!
//! ```text
//! Vaccine,Geography Type,Geography,FIPS,Season/Survey Year,Month,Dimension Type,Dimension,Estimate (%),95% CI (%),Sample Size
//! Seasonal Influenza,States/Local Areas,Alaska,2,2018-19,5,Age,6 Months - 17 Years,42.1,38.0 to 46.3,1047
//! ```
//!
//! Only state rows are kept. `Age` and `Race and Ethnicity` dimensions feed
//! the age and race lookups; every other dimension is recorded as `All`.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use localedb_common::types::{Fips, LocaleLevel};

use super::{cell, require_rows, staged_files, DomainLoader, LoadOutcome};
use crate::catalog::CatalogEntry;
use crate::error::{IngestError, Result};
use crate::models::VaxRecord;
use crate::warehouse::Warehouse;

/// Geography type of state rows
pub const STATE_GEOGRAPHY: &str = "States/Local Areas";
/// Lookup value for a dimension that was not broken down
pub const ALL: &str = "All";

#[derive(Debug, Clone, PartialEq)]
pub struct VaxRow {
    pub fips: String,
    pub record: VaxRecord,
}

/// `2018-19` -> (2018, 2019); `2018` -> (2018, 2018)
pub fn parse_season(value: &str) -> Option<(i16, i16)> {
    let value = value.trim();
    match value.split_once('-') {
        Some((from, to)) => {
            let from: i16 = from.trim().parse().ok()?;
            let to = to.trim();
            let to: i16 = match to.len() {
                2 => {
                    let to = (from / 100) * 100 + to.parse::<i16>().ok()?;
                    if to < from {
                        to + 100
                    } else {
                        to
                    }
                },
                _ => to.parse().ok()?,
            };
            (to >= from).then_some((from, to))
        },
        None => value.parse().ok().map(|y| (y, y)),
    }
}

/// Parse the coverage export; non-state and malformed rows are skipped
pub fn parse_vaccinations<R: std::io::Read>(
    reader: R,
    source: &str,
) -> Result<(Vec<VaxRow>, u64)> {
    let mut csv = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = csv.headers()?.clone();
    let col = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .ok_or_else(|| IngestError::parse(source, format!("missing column {}", name)))
    };
    let (geo_type, fips, season, month) = (
        col("Geography Type")?,
        col("FIPS")?,
        col("Season/Survey Year")?,
        col("Month")?,
    );
    let (dim_type, dim, estimate, ci, sample) = (
        col("Dimension Type")?,
        col("Dimension")?,
        col("Estimate (%)")?,
        col("95% CI (%)")?,
        col("Sample Size")?,
    );

    let mut rows = Vec::new();
    let mut skipped = 0u64;

    for (i, record) in csv.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to parse line {} of {}: {}", i + 2, source, e);
                skipped += 1;
                continue;
            },
        };
        let get = |i: usize| cell(record.get(i));

        if get(geo_type).as_deref() != Some(STATE_GEOGRAPHY) {
            skipped += 1;
            continue;
        }
        let Some(code) = get(fips)
            .filter(|v| v.len() <= 2)
            .and_then(|v| Fips::from_numeric(&v, LocaleLevel::State).ok())
        else {
            skipped += 1;
            continue;
        };
        let Some((year_from, year_to)) = get(season).and_then(|v| parse_season(&v)) else {
            debug!(line = i + 2, "Unrecognized season");
            skipped += 1;
            continue;
        };

        let dimension = get(dim).unwrap_or_else(|| ALL.to_string());
        let (age, race) = match get(dim_type).as_deref() {
            Some("Age") => (dimension, ALL.to_string()),
            Some("Race and Ethnicity") => (ALL.to_string(), dimension),
            _ => (ALL.to_string(), ALL.to_string()),
        };

        rows.push(VaxRow {
            fips: code.to_string(),
            record: VaxRecord {
                locale_id: 0,
                age,
                race,
                year_from,
                year_to,
                month: get(month).and_then(|v| v.parse().ok()),
                estimate: get(estimate).and_then(|v| v.parse().ok()),
                ci: get(ci).filter(|v| !v.starts_with("NR")),
                sample_size: get(sample).and_then(|v| v.parse().ok()),
            },
        });
    }

    Ok((rows, skipped))
}

pub struct VaccinationLoader {
    warehouse: Arc<dyn Warehouse>,
    vaccine: String,
}

impl VaccinationLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, vaccine: String) -> Self {
        Self { warehouse, vaccine }
    }
}

#[async_trait]
impl DomainLoader for VaccinationLoader {
    async fn load(&mut self, entry: &CatalogEntry, workspace: &Path) -> Result<LoadOutcome> {
        let mut rows = Vec::new();
        let mut skipped = 0;
        for path in staged_files(workspace) {
            let bytes = tokio::fs::read(&path).await?;
            let (parsed, n) = parse_vaccinations(bytes.as_slice(), &path.display().to_string())?;
            rows.extend(parsed);
            skipped += n;
        }

        let codes: Vec<String> = rows
            .iter()
            .map(|r| r.fips.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let ids = self.warehouse.us_locale_ids(&codes).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match ids.get(&row.fips) {
                Some(&locale_id) => records.push(VaxRecord {
                    locale_id,
                    ..row.record
                }),
                None => skipped += 1,
            }
        }
        require_rows(entry, records.len() as u64)?;

        let written = self
            .warehouse
            .replace_vaccinations(&self.vaccine, &records)
            .await?;
        info!(vaccine = %self.vaccine, rows = written, skipped, "Vaccination coverage loaded");
        Ok(LoadOutcome::new(written, skipped))
    }

    fn tables(&self) -> Vec<&'static str> {
        vec!["vax.age", "vax.race", "vax.vax"]
    }
}
