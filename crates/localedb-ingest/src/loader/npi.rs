//! Non-pharmaceutical intervention loader
//!
//! # File Format
//! ```text
//! fips,county,state,npi,start_date,end_date,citation,note,end_note,end_citation
//! 2020,Anchorage,Alaska,shelter_in_place,2020-03-28,2020-04-24,https://...,,,
//! ```
//!
//! Rows are keyed by the 5-digit county code, or the 2-digit state code when
//! the county is empty.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use localedb_common::types::{Fips, LocaleLevel};

use super::{cell, require_rows, staged_files, DomainLoader, LoadOutcome};
use crate::catalog::CatalogEntry;
use crate::error::{IngestError, Result};
use crate::models::NpiRecord;
use crate::warehouse::Warehouse;

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

/// An intervention row before its locale is resolved
#[derive(Debug, Clone, PartialEq)]
pub struct NpiRow {
    pub fips: String,
    pub record: NpiRecord,
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(value, f).ok())
}

/// Free-text cell with the stray boolean values of the source removed
fn text(value: Option<&str>) -> Option<String> {
    cell(value).filter(|v| !matches!(v.to_lowercase().as_str(), "t" | "f" | "true" | "false"))
}

/// Parse the intervention file; rows without a start date are dropped
pub fn parse_npis<R: std::io::Read>(reader: R, source: &str) -> Result<(Vec<NpiRow>, u64)> {
    let mut csv = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = csv.headers()?.clone();
    let col = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .ok_or_else(|| IngestError::parse(source, format!("missing column {}", name)))
    };
    let (fips, county, npi, start, end) = (
        col("fips")?,
        col("county")?,
        col("npi")?,
        col("start_date")?,
        col("end_date")?,
    );
    let (citation, note, end_note, end_citation) = (
        col("citation")?,
        col("note")?,
        col("end_note")?,
        col("end_citation")?,
    );

    let mut rows = Vec::new();
    let mut skipped = 0u64;

    for (i, record) in csv.records().enumerate() {
        let line = i + 2;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to parse line {} of {}: {}", line, source, e);
                skipped += 1;
                continue;
            },
        };
        let get = |i: usize| cell(record.get(i));

        let Some(begin_date) = get(start).and_then(|v| parse_date(&v)) else {
            skipped += 1;
            continue;
        };
        let Some(npi_type) = get(npi).map(|v| v.replace('_', " ")) else {
            skipped += 1;
            continue;
        };
        let level = if get(county).is_some() {
            LocaleLevel::County
        } else {
            LocaleLevel::State
        };
        let Some(fips) = get(fips).and_then(|v| Fips::from_numeric(&v, level).ok()) else {
            debug!(line, "Intervention without a usable FIPS code");
            skipped += 1;
            continue;
        };

        rows.push(NpiRow {
            fips: fips.to_string(),
            record: NpiRecord {
                locale_id: 0,
                npi_type,
                begin_date,
                end_date: get(end).and_then(|v| parse_date(&v)),
                begin_citation: text(record.get(citation)),
                begin_note: text(record.get(note)),
                end_citation: text(record.get(end_citation)),
                end_note: text(record.get(end_note)),
            },
        });
    }

    Ok((rows, skipped))
}

pub struct NpiLoader {
    warehouse: Arc<dyn Warehouse>,
    disease: String,
}

impl NpiLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, disease: String) -> Self {
        Self { warehouse, disease }
    }
}

#[async_trait]
impl DomainLoader for NpiLoader {
    async fn load(&mut self, entry: &CatalogEntry, workspace: &Path) -> Result<LoadOutcome> {
        let mut rows = Vec::new();
        let mut skipped = 0;
        for path in staged_files(workspace) {
            let bytes = tokio::fs::read(&path).await?;
            let (parsed, n) = parse_npis(bytes.as_slice(), &path.display().to_string())?;
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
                Some(&locale_id) => records.push(NpiRecord {
                    locale_id,
                    ..row.record
                }),
                None => {
                    debug!(fips = %row.fips, "Intervention for unknown locale");
                    skipped += 1;
                },
            }
        }
        require_rows(entry, records.len() as u64)?;

        let written = self.warehouse.replace_npis(&self.disease, &records).await?;
        info!(disease = %self.disease, rows = written, skipped, "Interventions loaded");
        Ok(LoadOutcome::new(written, skipped))
    }

    fn tables(&self) -> Vec<&'static str> {
        vec!["npi.type", "npi.npi"]
    }
}
