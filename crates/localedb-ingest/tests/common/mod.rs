//! Shared fixtures for the ingestion integration tests
//!
//! A [`Mirror`] is a temporary directory laid out like the upstream servers
//! (TIGER layers, population archives, disease feeds) and addressed through
//! `file://` locators, so whole partitions load without network access.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{Mirror, Harness};
//!
//! #[tokio::test]
//! async fn test_load() -> anyhow::Result<()> {
//!     let mirror = Mirror::new()?;
//!     mirror.write_geo("02", &common::alaska_geo())?;
//!     let harness = Harness::new(&mirror)?;
//!     let reports = harness.manager.load(Domain::Geo, Some("AK"), false).await?;
//!     Ok(())
//! }
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use url::Url;
use zip::write::SimpleFileOptions;

use localedb_ingest::config::{FetchConfig, SourcesConfig};
use localedb_ingest::geometry::WktCsvIngester;
use localedb_ingest::models::GeoLevel;
use localedb_ingest::{
    Catalog, Fetcher, LifecycleManager, LoaderContext, MemoryWarehouse, PartitionTable, Resolver,
    Stager,
};

pub const TIGER_VINTAGE: &str = "2010";
pub const EPOCH: &str = "2020-01-22";

/// Zip archive holding `files` (path, content)
pub fn zip_bytes(files: &[(&str, String)]) -> Result<Vec<u8>> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in files {
        zip.start_file(*name, SimpleFileOptions::default())?;
        zip.write_all(content.as_bytes())?;
    }
    Ok(zip.finish()?.into_inner())
}

/// A square polygon around (`x`, `y`)
pub fn square(x: f64, y: f64) -> String {
    format!(
        "MULTIPOLYGON ((({x0} {y0},{x1} {y0},{x1} {y1},{x0} {y1},{x0} {y0})))",
        x0 = x,
        y0 = y,
        x1 = x + 0.5,
        y1 = y + 0.5
    )
}

/// One geography feature of a fixture layer
#[derive(Debug, Clone)]
pub struct Feature {
    pub geoid: String,
    pub name: String,
    pub lat: f64,
    pub long: f64,
}

impl Feature {
    pub fn new(geoid: &str, name: &str, lat: f64, long: f64) -> Self {
        Self {
            geoid: geoid.to_string(),
            name: name.to_string(),
            lat,
            long,
        }
    }
}

/// Layers of one state, parent levels first; absent layers are not mirrored
#[derive(Debug, Clone, Default)]
pub struct StateGeo {
    pub layers: Vec<(GeoLevel, Vec<Feature>)>,
}

/// WKT CSV of one layer, with the vintage-suffixed TIGER attribute names
pub fn layer_csv(statefp: &str, features: &[Feature]) -> String {
    let mut out = String::from("WKT,GEOID10,STATEFP10,COUNTYFP10,NAME10,INTPTLAT10,INTPTLON10\n");
    for f in features {
        let countyfp = if f.geoid.len() >= 5 { &f.geoid[2..5] } else { "" };
        out.push_str(&format!(
            "\"{}\",{},{},{},{},{},{}\n",
            square(f.long, f.lat),
            f.geoid,
            statefp,
            countyfp,
            f.name,
            f.lat,
            f.long
        ));
    }
    out
}

/// Alaska with two boroughs and three tracts
pub fn alaska_geo() -> StateGeo {
    StateGeo {
        layers: vec![
            (GeoLevel::State, vec![Feature::new("02", "Alaska", 63.3, -152.2)]),
            (
                GeoLevel::County,
                vec![
                    Feature::new("02020", "Anchorage", 61.17, -149.28),
                    Feature::new("02090", "Fairbanks North Star", 64.69, -146.6),
                ],
            ),
            (
                GeoLevel::Tract,
                vec![
                    Feature::new("02020000100", "1", 61.21, -149.73),
                    Feature::new("02020000200", "2", 61.19, -149.81),
                    Feature::new("02090000100", "1", 64.84, -147.72),
                ],
            ),
        ],
    }
}

/// Hawaii with one county and one tract
pub fn hawaii_geo() -> StateGeo {
    StateGeo {
        layers: vec![
            (GeoLevel::State, vec![Feature::new("15", "Hawaii", 19.8, -155.5)]),
            (GeoLevel::County, vec![Feature::new("15001", "Hawaii", 19.6, -155.5)]),
            (GeoLevel::Tract, vec![Feature::new("15001020100", "201", 20.2, -155.8)]),
        ],
    }
}

/// Household ids and sizes of a fixture population, per county
#[derive(Debug, Clone)]
pub struct Population {
    pub counties: Vec<(String, Vec<usize>)>,
}

impl Population {
    pub fn households(&self) -> usize {
        self.counties.iter().map(|(_, sizes)| sizes.len()).sum()
    }

    pub fn persons(&self) -> usize {
        self.counties.iter().flat_map(|(_, sizes)| sizes.iter()).sum()
    }

    /// Archive entries, one directory per county
    pub fn files(&self, abbr: &str) -> Vec<(String, String)> {
        let mut files = Vec::new();
        let mut hh_id = 0;
        let mut person_id = 0;
        for (county, sizes) in &self.counties {
            let mut households = String::from("sp_id\tstcotrbg\trace\tincome\tlat\tlong\n");
            let mut people = String::from(
                "sp_id\tsp_hh_id\tage\tsex\trace\trelate\tschool_id\twork_id\n",
            );
            for size in sizes {
                hh_id += 1;
                households.push_str(&format!(
                    "{}\t{}0001001\t1\t{}\t61.2{}\t-149.9\n",
                    hh_id,
                    county,
                    40_000 + hh_id * 1000,
                    hh_id
                ));
                for member in 0..*size {
                    person_id += 1;
                    let sex = if member % 2 == 0 { "F" } else { "M" };
                    people.push_str(&format!(
                        "{}\t{}\t{}\t{}\t1\t{}\tX\tX\n",
                        person_id,
                        hh_id,
                        20 + member,
                        sex,
                        member
                    ));
                }
            }
            let dir = format!("{}/{}", abbr, county);
            files.push((format!("{}/households.txt", dir), households));
            files.push((format!("{}/people.txt", dir), people));
            files.push((
                format!("{}/workplaces.txt", dir),
                "sp_id\tlat\tlong\n".to_string(),
            ));
        }
        files
    }
}

/// Ten households across Alaska's two fixture boroughs
pub fn alaska_population() -> Population {
    Population {
        counties: vec![
            ("02020".to_string(), vec![1, 2, 3, 4, 2, 1]),
            ("02090".to_string(), vec![3, 1, 2, 5]),
        ],
    }
}

/// Upstream servers mirrored on disk
pub struct Mirror {
    root: TempDir,
}

impl Mirror {
    pub fn new() -> Result<Self> {
        Ok(Self {
            root: TempDir::new()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    fn url(&self, sub: &str) -> Result<String> {
        let dir = self.root.path().join(sub);
        std::fs::create_dir_all(&dir)?;
        let url = Url::from_directory_path(&dir)
            .map_err(|_| anyhow::anyhow!("not an absolute path: {}", dir.display()))?;
        Ok(url.to_string().trim_end_matches('/').to_string())
    }

    /// Source locations pointing into the mirror
    pub fn sources(&self) -> Result<SourcesConfig> {
        Ok(SourcesConfig {
            tiger_base_url: self.url("tiger")?,
            tiger_vintage: TIGER_VINTAGE.to_string(),
            population_base_url: self.url("pop")?,
            locale_list_url: format!("{}/lookup.csv", self.url("main")?),
            c19_base_url: self.url("c19")?,
            npi_url: format!("{}/npis.csv", self.url("npi")?),
            vax_url: format!("{}/coverage.csv", self.url("vax")?),
            health_url: None,
            weather_url: Some(format!("{}/{{abbr}}.csv", self.url("weather")?)),
            mobility_url: None,
        })
    }

    fn write(&self, relative: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.root.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Mirror every layer of `geo` as TIGER zip archives of `statefp`
    pub fn write_geo(&self, statefp: &str, geo: &StateGeo) -> Result<()> {
        for (level, features) in &geo.layers {
            let name = format!(
                "tl_{v}_{st}_{token}10",
                v = TIGER_VINTAGE,
                st = statefp,
                token = level.tiger_token()
            );
            let archive = zip_bytes(&[(
                format!("{}.csv", name).as_str(),
                layer_csv(statefp, features),
            )])?;
            self.write(
                &format!("tiger/{}/{}/{}.zip", level.tiger_dir(), TIGER_VINTAGE, name),
                &archive,
            )?;
        }
        Ok(())
    }

    pub fn write_population(&self, abbr: &str, population: &Population) -> Result<()> {
        let files = population.files(&abbr.to_lowercase());
        let entries: Vec<(&str, String)> = files
            .iter()
            .map(|(name, content)| (name.as_str(), content.clone()))
            .collect();
        self.write(&format!("pop/{}.zip", abbr.to_lowercase()), &zip_bytes(&entries)?)?;
        Ok(())
    }

    /// One disease feed, e.g. `("confirmed", "global")`
    pub fn write_feed(&self, metric: &str, region: &str, csv: &str) -> Result<()> {
        self.write(
            &format!("c19/time_series_covid19_{}_{}.csv", metric, region),
            csv.as_bytes(),
        )?;
        Ok(())
    }

    pub fn write_file(&self, relative: &str, content: &str) -> Result<PathBuf> {
        self.write(relative, content.as_bytes())
    }
}

/// A manager over a fresh in-memory warehouse
pub struct Harness {
    pub warehouse: Arc<MemoryWarehouse>,
    pub manager: LifecycleManager,
    pub cache: TempDir,
    scratch: TempDir,
}

impl Harness {
    pub fn new(mirror: &Mirror) -> Result<Self> {
        Self::with_warehouse(mirror, Arc::new(MemoryWarehouse::new()))
    }

    pub fn with_warehouse(mirror: &Mirror, warehouse: Arc<MemoryWarehouse>) -> Result<Self> {
        let cache = TempDir::new()?;
        let scratch = TempDir::new()?;
        let fetch = FetchConfig {
            max_attempts: 2,
            retry_delay_ms: 1,
            ..FetchConfig::default()
        };

        let manager = LifecycleManager::new(
            Resolver::new(PartitionTable::us_states()?),
            Catalog::new(mirror.sources()?),
            Fetcher::new(cache.path(), &fetch)?.with_progress(false),
            Stager::new(scratch.path().join("ws")),
            LoaderContext {
                warehouse: warehouse.clone(),
                geometry: Arc::new(WktCsvIngester),
                disease_epoch: chrono::NaiveDate::parse_from_str(EPOCH, "%Y-%m-%d")?,
            },
        );

        Ok(Self {
            warehouse,
            manager,
            cache,
            scratch,
        })
    }
}
