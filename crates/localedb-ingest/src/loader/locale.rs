//! Canonical locale list
//!
//! # File Format
//! The UID/ISO/FIPS lookup table:
//!
//! ```text
//! UID,iso2,iso3,code3,FIPS,Admin2,Province_State,Country_Region,Lat,Long_,Combined_Key,Population
//! 4,AF,AFG,4,,,,Afghanistan,33.93911,67.709953,Afghanistan,38928341
//! 84002020,US,USA,840,2020.0,Anchorage,Alaska,US,61.15,-149.1,"Anchorage, Alaska, US",288000
//! ```

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use localedb_common::types::{Fips, LocaleLevel};

use super::{cell, require_rows, staged_files, DomainLoader, LoadOutcome};
use crate::catalog::CatalogEntry;
use crate::error::{IngestError, Result};
use crate::models::LocaleRecord;
use crate::warehouse::Warehouse;

const COLUMNS: [&str; 10] = [
    "iso2",
    "iso3",
    "code3",
    "FIPS",
    "Admin2",
    "Province_State",
    "Country_Region",
    "Lat",
    "Long_",
    "Population",
];

/// Parse the lookup table; rows without a country are skipped
pub fn parse_locale_list<R: std::io::Read>(
    reader: R,
    source: &str,
) -> Result<(Vec<LocaleRecord>, u64)> {
    let mut csv = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = csv.headers()?.clone();

    let mut idx = [0usize; 10];
    for (slot, name) in idx.iter_mut().zip(COLUMNS) {
        *slot = headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| IngestError::parse(source, format!("missing column {}", name)))?;
    }
    let [iso2, iso3, code3, fips, admin2, province, country, lat, long, population] = idx;

    let mut locales = Vec::new();
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
        let number = |i: usize| get(i).and_then(|v| v.parse::<f64>().ok());

        let Some(admin0) = get(country) else {
            skipped += 1;
            continue;
        };
        let admin2 = get(admin2);
        let level = if admin2.is_some() {
            LocaleLevel::County
        } else {
            LocaleLevel::State
        };

        locales.push(LocaleRecord {
            iso2: get(iso2),
            iso3: get(iso3),
            iso_num: number(code3).map(|v| v as i32),
            fips: get(fips)
                .and_then(|v| Fips::from_numeric(&v, level).ok())
                .map(|f| f.to_string()),
            admin0: Some(admin0),
            admin1: get(province),
            admin2,
            lat: number(lat),
            long: number(long),
            population: number(population).map(|v| v as i64),
        });
    }

    Ok((locales, skipped))
}

pub struct LocaleListLoader {
    warehouse: Arc<dyn Warehouse>,
}

impl LocaleListLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }
}

#[async_trait]
impl DomainLoader for LocaleListLoader {
    async fn load(&mut self, entry: &CatalogEntry, workspace: &Path) -> Result<LoadOutcome> {
        let mut locales = Vec::new();
        let mut skipped = 0;
        for path in staged_files(workspace) {
            let bytes = tokio::fs::read(&path).await?;
            let (parsed, n) = parse_locale_list(bytes.as_slice(), &path.display().to_string())?;
            locales.extend(parsed);
            skipped += n;
        }
        require_rows(entry, locales.len() as u64)?;

        let ids = self.warehouse.upsert_locales(&locales).await?;
        info!(locales = ids.len(), skipped, "Locale list loaded");
        Ok(LoadOutcome::new(ids.len() as u64, skipped))
    }

    fn tables(&self) -> Vec<&'static str> {
        vec!["main.locale"]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::warehouse::MemoryWarehouse;

    const LOOKUP: &str = "UID,iso2,iso3,code3,FIPS,Admin2,Province_State,Country_Region,Lat,Long_,Combined_Key,Population\n\
        4,AF,AFG,4,,,,Afghanistan,33.93911,67.709953,Afghanistan,38928341\n\
        84000002,US,USA,840,2.0,,Alaska,US,61.37,-152.40,\"Alaska, US\",731545\n\
        84002020,US,USA,840,2020.0,Anchorage,Alaska,US,61.15,-149.1,\"Anchorage, Alaska, US\",288000\n\
        0,,,,,,,,,,,\n";

    #[test]
    fn test_parse_locale_list() {
        let (locales, skipped) = parse_locale_list(LOOKUP.as_bytes(), "lookup.csv").unwrap();
        assert_eq!(skipped, 1);
        assert_eq!(locales.len(), 3);
        assert_eq!(locales[0].fips, None);
        assert_eq!(locales[1].fips.as_deref(), Some("02"));
        assert_eq!(locales[2].fips.as_deref(), Some("02020"));
        assert_eq!(locales[2].population, Some(288_000));
    }

    #[tokio::test]
    async fn test_list_fills_geography_locales() {
        let wh = Arc::new(MemoryWarehouse::new());
        let ids = wh
            .upsert_locales(&[LocaleRecord::us("02020", "Alaska", Some("Anchorage"))])
            .await
            .unwrap();

        let (locales, _) = parse_locale_list(LOOKUP.as_bytes(), "lookup.csv").unwrap();
        let again = wh.upsert_locales(&locales).await.unwrap();

        assert_eq!(again[2], ids[0]);
        assert_eq!(wh.count_locales().await.unwrap(), 3);
        assert_eq!(wh.locale(ids[0]).await.unwrap().population, Some(288_000));
    }
}
