//! Locale observations (health, weather, mobility)
//!
//! # File Format
//! ```text
//! fips,date,tmax,tmin,prcp
//! 02020,2020-03-01,-2.5,-11.0,0.3
//! ```
//!
//! Every numeric metric cell becomes one observation of the row's locale.
//! Rows outside the partition's state are skipped.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use localedb_common::types::{Domain, Fips};

use super::{cell, require_rows, staged_files, DomainLoader, LoadOutcome};
use crate::catalog::CatalogEntry;
use crate::error::{IngestError, Result};
use crate::models::ObservationRow;
use crate::resolver::StatePartition;
use crate::warehouse::Warehouse;

/// A metric value before its locale is resolved
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub fips: Fips,
    pub day: NaiveDate,
    pub metric: String,
    pub value: f64,
}

/// Parse a wide observation file, keeping rows within `scope`
pub fn parse_observations<R: std::io::Read>(
    reader: R,
    scope: &Fips,
    source: &str,
) -> Result<(Vec<RawObservation>, u64)> {
    let mut csv = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = csv.headers()?.clone();
    let find = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));
    let fips_col = find("fips").ok_or_else(|| IngestError::parse(source, "missing column fips"))?;
    let date_col = find("date").ok_or_else(|| IngestError::parse(source, "missing column date"))?;

    let metrics: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != fips_col && *i != date_col)
        .map(|(i, h)| (i, h.trim().to_string()))
        .collect();

    let mut out = Vec::new();
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

        let fips = cell(record.get(fips_col)).and_then(|v| Fips::parse(&v).ok());
        let day = cell(record.get(date_col))
            .and_then(|v| NaiveDate::parse_from_str(&v, "%Y-%m-%d").ok());
        let (Some(fips), Some(day)) = (fips, day) else {
            debug!(line, "Observation row without a usable code or date");
            skipped += 1;
            continue;
        };
        if !fips.is_within(scope) {
            skipped += 1;
            continue;
        }

        for (col, metric) in &metrics {
            if let Some(value) = cell(record.get(*col)).and_then(|v| v.parse::<f64>().ok()) {
                out.push(RawObservation {
                    fips: fips.clone(),
                    day,
                    metric: metric.clone(),
                    value,
                });
            }
        }
    }

    Ok((out, skipped))
}

pub struct ObservationLoader {
    warehouse: Arc<dyn Warehouse>,
    domain: Domain,
    state: StatePartition,
}

impl ObservationLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, domain: Domain, state: StatePartition) -> Self {
        Self {
            warehouse,
            domain,
            state,
        }
    }
}

#[async_trait]
impl DomainLoader for ObservationLoader {
    async fn load(&mut self, entry: &CatalogEntry, workspace: &Path) -> Result<LoadOutcome> {
        let scope = &self.state.fips;
        let mut raw = Vec::new();
        let mut skipped = 0;
        for path in staged_files(workspace) {
            let bytes = tokio::fs::read(&path).await?;
            let (parsed, n) =
                parse_observations(bytes.as_slice(), scope, &path.display().to_string())?;
            raw.extend(parsed);
            skipped += n;
        }

        let codes: Vec<String> = raw
            .iter()
            .map(|r| r.fips.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let ids = self.warehouse.us_locale_ids(&codes).await?;

        let mut rows = Vec::with_capacity(raw.len());
        for obs in raw {
            match ids.get(obs.fips.as_str()) {
                Some(&locale_id) => rows.push(ObservationRow {
                    locale_id,
                    day: obs.day,
                    metric: obs.metric,
                    value: obs.value,
                }),
                None => skipped += 1,
            }
        }
        require_rows(entry, rows.len() as u64)?;

        let written = self
            .warehouse
            .replace_observations(self.domain, scope, &rows)
            .await?;
        info!(domain = %self.domain, state = %self.state, rows = written, skipped, "Observations loaded");
        Ok(LoadOutcome::new(written, skipped))
    }

    fn tables(&self) -> Vec<&'static str> {
        vec!["obs.observation"]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_observations_within_scope() {
        let data = "fips,date,tmax,tmin\n\
                    02020,2020-03-01,-2.5,\n\
                    02,2020-03-01,1.0,-4.0\n\
                    15001,2020-03-01,27.0,20.0\n\
                    02090,someday,1,1\n";
        let scope = Fips::parse("02").unwrap();
        let (obs, skipped) = parse_observations(data.as_bytes(), &scope, "w.csv").unwrap();

        assert_eq!(skipped, 2);
        assert_eq!(obs.len(), 3);
        assert_eq!(obs[0].metric, "tmax");
        assert_eq!(obs[0].value, -2.5);
        assert_eq!(obs[1].fips.as_str(), "02");
    }

    #[test]
    fn test_missing_fips_column_is_parse_error() {
        let scope = Fips::parse("02").unwrap();
        let err = parse_observations("date,x\n".as_bytes(), &scope, "w.csv").unwrap_err();
        assert!(matches!(err, IngestError::Parse { .. }));
    }
}
