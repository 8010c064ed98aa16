//! Disease dynamics loader
//!
//! # File Format
//! Wide time series, one row per locale and one column per date (`1/22/20`):
//!
//! ```text
//! Province/State,Country/Region,Lat,Long,1/22/20,1/23/20,...          (global)
//! UID,iso2,iso3,code3,FIPS,Admin2,Province_State,Country_Region,
//!     Lat,Long_,Combined_Key[,Population],1/22/20,...                 (US)
//! ```
//!
//! Every feed registers its locales, then its cells are merged into one row
//! per (locale, day). The merged set replaces the disease's rows once all
//! feeds are in.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use localedb_common::types::{Fips, LocaleLevel};

use super::{cell, require_rows, staged_files, DomainLoader, LoadOutcome};
use crate::catalog::{CatalogEntry, DiseaseMetric, FeedRegion, Target};
use crate::error::{IngestError, Result};
use crate::models::{DynRow, LocaleRecord};
use crate::warehouse::Warehouse;

/// Date format of feed column headers
pub const FEED_DATE_FORMAT: &str = "%m/%d/%y";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counts {
    conf: Option<i64>,
    dead: Option<i64>,
    rec: Option<i64>,
}

/// Merges per-metric fragments into one row per (locale, day).
///
/// Feeds are merged in catalog order; a later value for a field that is
/// already set replaces it and is counted as an overwrite.
#[derive(Debug, Clone)]
pub struct Consolidator {
    epoch: NaiveDate,
    rows: BTreeMap<(i64, NaiveDate), Counts>,
    overwrites: u64,
}

impl Consolidator {
    pub fn new(epoch: NaiveDate) -> Self {
        Self {
            epoch,
            rows: BTreeMap::new(),
            overwrites: 0,
        }
    }

    pub fn merge(&mut self, locale_id: i64, day: NaiveDate, metric: DiseaseMetric, value: i64) {
        let counts = self.rows.entry((locale_id, day)).or_default();
        let slot = match metric {
            DiseaseMetric::Confirmed => &mut counts.conf,
            DiseaseMetric::Dead => &mut counts.dead,
            DiseaseMetric::Recovered => &mut counts.rec,
        };
        if slot.is_some() {
            self.overwrites += 1;
        }
        *slot = Some(value);
    }

    /// Days since the epoch; the epoch itself is day 0
    pub fn day_index(&self, day: NaiveDate) -> i32 {
        (day - self.epoch).num_days() as i32
    }

    pub fn overwrites(&self) -> u64 {
        self.overwrites
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Consolidated rows ordered by locale and day
    pub fn rows(&self) -> Vec<DynRow> {
        self.rows
            .iter()
            .map(|(&(locale_id, day), c)| DynRow {
                locale_id,
                day,
                day_i: self.day_index(day),
                n_conf: c.conf,
                n_dead: c.dead,
                n_rec: c.rec,
                n_test: None,
                n_vax: None,
            })
            .collect()
    }
}

/// One parsed feed row
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRow {
    pub locale: LocaleRecord,
    pub values: Vec<(NaiveDate, i64)>,
}

fn header_index(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
}

/// A cumulative count; some feeds write them as decimals
fn count(raw: &str) -> Option<i64> {
    raw.parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v.round() as i64))
}

fn float(value: Option<&str>) -> Option<f64> {
    cell(value).and_then(|v| v.parse().ok())
}

/// Parse a wide feed; rows without a locale name are skipped
pub fn parse_feed<R: std::io::Read>(
    reader: R,
    region: FeedRegion,
    source: &str,
) -> Result<(Vec<FeedRow>, u64)> {
    let mut csv = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = csv.headers()?.clone();

    let dates: Vec<(usize, NaiveDate)> = headers
        .iter()
        .enumerate()
        .filter_map(|(i, h)| {
            NaiveDate::parse_from_str(h.trim(), FEED_DATE_FORMAT)
                .ok()
                .map(|d| (i, d))
        })
        .collect();
    if dates.is_empty() {
        return Err(IngestError::parse(source, "no date columns"));
    }

    let col = |names: &[&str]| header_index(&headers, names);
    let (country, province, lat, long) = (
        col(&["Country/Region", "Country_Region"]),
        col(&["Province/State", "Province_State"]),
        col(&["Lat"]),
        col(&["Long", "Long_"]),
    );
    let country = country.ok_or_else(|| IngestError::parse(source, "no country column"))?;
    let (iso2, iso3, code3, fips, admin2, population) = (
        col(&["iso2"]),
        col(&["iso3"]),
        col(&["code3"]),
        col(&["FIPS"]),
        col(&["Admin2"]),
        col(&["Population"]),
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
        let get = |idx: Option<usize>| cell(idx.and_then(|i| record.get(i)));

        let Some(admin0) = get(Some(country)) else {
            skipped += 1;
            continue;
        };

        let mut locale = LocaleRecord {
            admin0: Some(admin0),
            admin1: get(province),
            lat: float(lat.and_then(|i| record.get(i))),
            long: float(long.and_then(|i| record.get(i))),
            ..Default::default()
        };

        if region == FeedRegion::Us {
            locale.admin2 = get(admin2);
            locale.iso2 = get(iso2);
            locale.iso3 = get(iso3);
            locale.iso_num = get(code3).and_then(|v| v.parse::<f64>().ok()).map(|v| v as i32);
            let level = if locale.admin2.is_some() {
                LocaleLevel::County
            } else {
                LocaleLevel::State
            };
            locale.fips = get(fips)
                .and_then(|v| Fips::from_numeric(&v, level).ok())
                .map(|f| f.to_string());
            locale.population = get(population).and_then(|v| v.parse::<f64>().ok()).map(|v| v as i64);
        }

        let mut values = Vec::with_capacity(dates.len());
        for &(idx, day) in &dates {
            let Some(raw) = cell(record.get(idx)) else {
                continue;
            };
            match count(&raw) {
                Some(n) => values.push((day, n)),
                None => {
                    debug!(source, line = i + 2, value = %raw, "Unparsable count");
                    skipped += 1;
                },
            }
        }

        rows.push(FeedRow { locale, values });
    }

    Ok((rows, skipped))
}

pub struct DiseaseLoader {
    warehouse: Arc<dyn Warehouse>,
    disease: String,
    consolidator: Consolidator,
    loaded: bool,
}

impl DiseaseLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, disease: String, epoch: NaiveDate) -> Self {
        Self {
            warehouse,
            disease,
            consolidator: Consolidator::new(epoch),
            loaded: false,
        }
    }

    pub fn consolidator(&self) -> &Consolidator {
        &self.consolidator
    }
}

#[async_trait]
impl DomainLoader for DiseaseLoader {
    async fn load(&mut self, entry: &CatalogEntry, workspace: &Path) -> Result<LoadOutcome> {
        let Target::DiseaseFeed(feed) = entry.target else {
            return Err(IngestError::Internal(format!(
                "disease loader given {}",
                entry.label
            )));
        };

        let mut rows = Vec::new();
        let mut skipped = 0;
        for path in staged_files(workspace) {
            let bytes = tokio::fs::read(&path).await?;
            let (parsed, n) =
                parse_feed(bytes.as_slice(), feed.region, &path.display().to_string())?;
            rows.extend(parsed);
            skipped += n;
        }
        require_rows(entry, rows.len() as u64)?;

        let locales: Vec<LocaleRecord> = rows.iter().map(|r| r.locale.clone()).collect();
        let ids = self.warehouse.upsert_locales(&locales).await?;

        let before = self.consolidator.overwrites();
        let mut cells = 0u64;
        for (row, locale_id) in rows.iter().zip(ids) {
            for &(day, value) in &row.values {
                self.consolidator.merge(locale_id, day, feed.metric, value);
                cells += 1;
            }
        }

        let overwrites = self.consolidator.overwrites() - before;
        if overwrites > 0 {
            warn!(feed = %entry.label, overwrites, "Feed overwrote values of earlier feeds");
        }
        debug!(feed = %entry.label, locales = rows.len(), cells, "Feed merged");
        Ok(LoadOutcome::new(cells, skipped))
    }

    async fn finish(&mut self) -> Result<LoadOutcome> {
        let rows = self.consolidator.rows();
        if rows.is_empty() {
            return Err(IngestError::empty_load(format!("{} dynamics", self.disease)));
        }

        let written = self
            .warehouse
            .replace_disease_dynamics(&self.disease, &rows)
            .await?;
        self.loaded = true;

        info!(
            disease = %self.disease,
            rows = written,
            overwrites = self.consolidator.overwrites(),
            "Disease dynamics consolidated"
        );
        Ok(LoadOutcome::new(0, 0))
    }

    fn tables(&self) -> Vec<&'static str> {
        if self.loaded {
            vec!["main.locale", "dis.dyn"]
        } else {
            vec!["main.locale"]
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_consolidator_merges_fragments() {
        let mut c = Consolidator::new(day("2020-01-22"));
        c.merge(1, day("2020-01-22"), DiseaseMetric::Confirmed, 5);
        c.merge(1, day("2020-01-22"), DiseaseMetric::Dead, 1);
        c.merge(1, day("2020-01-22"), DiseaseMetric::Recovered, 2);
        c.merge(1, day("2020-01-24"), DiseaseMetric::Confirmed, 9);

        let rows = c.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].day_i, 0);
        assert_eq!((rows[0].n_conf, rows[0].n_dead, rows[0].n_rec), (Some(5), Some(1), Some(2)));
        assert_eq!(rows[1].day_i, 2);
        assert_eq!(rows[1].n_dead, None);
        assert_eq!(c.overwrites(), 0);
    }

    #[test]
    fn test_later_feed_wins() {
        let mut c = Consolidator::new(day("2020-01-22"));
        c.merge(7, day("2020-02-01"), DiseaseMetric::Confirmed, 3);
        c.merge(7, day("2020-02-01"), DiseaseMetric::Confirmed, 4);
        assert_eq!(c.rows()[0].n_conf, Some(4));
        assert_eq!(c.overwrites(), 1);
    }

    #[test]
    fn test_unparsable_cell_is_counted() {
        let data = "Province/State,Country/Region,Lat,Long,1/22/20,1/23/20,1/24/20\n\
                    ,Italy,41.87,12.56,0,abc,3.0\n";
        let (rows, skipped) = parse_feed(data.as_bytes(), FeedRegion::Global, "g.csv").unwrap();
        assert_eq!(skipped, 1);
        assert_eq!(
            rows[0].values,
            vec![(day("2020-01-22"), 0), (day("2020-01-24"), 3)]
        );
    }

    #[test]
    fn test_parse_global_feed() {
        let data = "Province/State,Country/Region,Lat,Long,1/22/20,1/23/20\n\
                    ,Afghanistan,33.9,67.7,0,1\n\
                    Alberta,Canada,53.9,-116.6,2,\n\
                    ,,0,0,1,1\n";
        let (rows, skipped) = parse_feed(data.as_bytes(), FeedRegion::Global, "g.csv").unwrap();
        assert_eq!(skipped, 1);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].locale.admin1, None);
        assert_eq!(rows[0].values, vec![(day("2020-01-22"), 0), (day("2020-01-23"), 1)]);
        assert_eq!(rows[1].locale.admin1.as_deref(), Some("Alberta"));
        assert_eq!(rows[1].values.len(), 1);
    }

    #[test]
    fn test_parse_us_feed_pads_fips() {
        let data = "UID,iso2,iso3,code3,FIPS,Admin2,Province_State,Country_Region,Lat,Long_,Combined_Key,Population,1/22/20\n\
                    84002020,US,USA,840,2020.0,Anchorage,Alaska,US,61.1,-149.1,\"Anchorage, Alaska, US\",288000,3\n";
        let (rows, _) = parse_feed(data.as_bytes(), FeedRegion::Us, "us.csv").unwrap();
        let l = &rows[0].locale;
        assert_eq!(l.fips.as_deref(), Some("02020"));
        assert_eq!(l.admin2.as_deref(), Some("Anchorage"));
        assert_eq!(l.iso_num, Some(840));
        assert_eq!(l.population, Some(288_000));
    }

    #[test]
    fn test_feed_without_dates_is_parse_error() {
        let err = parse_feed("a,b\n1,2\n".as_bytes(), FeedRegion::Global, "x.csv").unwrap_err();
        assert!(matches!(err, IngestError::Parse { .. }));
    }
}
