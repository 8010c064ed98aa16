//! Ingestion configuration
//!
//! Loaded from `.env` and the process environment, falling back to the
//! defaults below.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{IngestError, Result};

// ============================================================================
// Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://postgres:sa@localhost:5433/localedb";
/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_CACHE_DIR: &str = "./data/cache";
pub const DEFAULT_SCRATCH_DIR: &str = "./data/scratch";

/// Default number of download attempts per resource.
pub const DEFAULT_FETCH_MAX_ATTEMPTS: u32 = 3;
/// Default base retry delay; attempt `n` waits `n` times this.
pub const DEFAULT_FETCH_RETRY_DELAY_MS: u64 = 5_000;
/// Default per-request timeout (30 minutes; block archives are large).
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 1_800;
pub const DEFAULT_USER_AGENT: &str = "LocaleDB-Ingester/0.1";

pub const DEFAULT_TIGER_URL: &str = "https://www2.census.gov/geo/tiger/TIGER2010";
pub const DEFAULT_TIGER_VINTAGE: &str = "2010";
pub const DEFAULT_POPULATION_URL: &str =
    "https://gitlab.com/momacs/dataset-pop-us-2010-midas/-/raw/master/zip";
pub const DEFAULT_LOCALE_LIST_URL: &str = "https://raw.githubusercontent.com/CSSEGISandData/COVID-19/master/csse_covid_19_data/UID_ISO_FIPS_LookUp_Table.csv";
pub const DEFAULT_C19_URL: &str = "https://raw.githubusercontent.com/CSSEGISandData/COVID-19/master/csse_covid_19_data/csse_covid_19_time_series";
pub const DEFAULT_NPI_URL: &str = "https://raw.githubusercontent.com/Keystone-Strategy/covid19-intervention-data/master/complete_npis_inherited_policies.csv";
pub const DEFAULT_VAX_URL: &str =
    "https://data.cdc.gov/api/views/vh55-3he6/rows.csv?accessType=DOWNLOAD";

/// First date of the JHU CSSE time series.
pub const DEFAULT_DISEASE_EPOCH: &str = "2020-01-22";
pub const DEFAULT_OGR2OGR: &str = "ogr2ogr";

/// Complete ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub paths: PathsConfig,
    pub fetch: FetchConfig,
    pub sources: SourcesConfig,
    /// Day with `day_i = 0` in disease dynamics
    pub disease_epoch: NaiveDate,
    /// Program used to convert shapefiles
    pub ogr2ogr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Durable download cache, `{cache_dir}/{domain}/{filename}`
    pub cache_dir: PathBuf,
    /// Single scratch workspace reused by every entity
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
}

/// Upstream locations of every domain's resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub tiger_base_url: String,
    pub tiger_vintage: String,
    pub population_base_url: String,
    pub locale_list_url: String,
    pub c19_base_url: String,
    pub npi_url: String,
    pub vax_url: String,
    /// URL templates with `{fips}` and/or `{abbr}` placeholders
    pub health_url: Option<String>,
    pub weather_url: Option<String>,
    pub mobility_url: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            paths: PathsConfig {
                cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
                scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            },
            fetch: FetchConfig::default(),
            sources: SourcesConfig::default(),
            disease_epoch: default_epoch(),
            ogr2ogr: DEFAULT_OGR2OGR.to_string(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_FETCH_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_FETCH_RETRY_DELAY_MS,
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            tiger_base_url: DEFAULT_TIGER_URL.to_string(),
            tiger_vintage: DEFAULT_TIGER_VINTAGE.to_string(),
            population_base_url: DEFAULT_POPULATION_URL.to_string(),
            locale_list_url: DEFAULT_LOCALE_LIST_URL.to_string(),
            c19_base_url: DEFAULT_C19_URL.to_string(),
            npi_url: DEFAULT_NPI_URL.to_string(),
            vax_url: DEFAULT_VAX_URL.to_string(),
            health_url: None,
            weather_url: None,
            mobility_url: None,
        }
    }
}

fn default_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 22).unwrap_or_default()
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let disease_epoch = match std::env::var("LOCALEDB_DISEASE_EPOCH") {
            Ok(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| {
                IngestError::config(format!("LOCALEDB_DISEASE_EPOCH '{}': {}", raw, e))
            })?,
            Err(_) => default_epoch(),
        };

        let config = IngestConfig {
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", DEFAULT_DATABASE_URL),
                connect_timeout_secs: env_parse(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            paths: PathsConfig {
                cache_dir: PathBuf::from(env_or("LOCALEDB_CACHE_DIR", DEFAULT_CACHE_DIR)),
                scratch_dir: PathBuf::from(env_or("LOCALEDB_SCRATCH_DIR", DEFAULT_SCRATCH_DIR)),
            },
            fetch: FetchConfig {
                max_attempts: env_parse("LOCALEDB_FETCH_MAX_ATTEMPTS", DEFAULT_FETCH_MAX_ATTEMPTS),
                retry_delay_ms: env_parse(
                    "LOCALEDB_FETCH_RETRY_DELAY_MS",
                    DEFAULT_FETCH_RETRY_DELAY_MS,
                ),
                timeout_secs: env_parse("LOCALEDB_FETCH_TIMEOUT", DEFAULT_FETCH_TIMEOUT_SECS),
                user_agent: DEFAULT_USER_AGENT.to_string(),
            },
            sources: SourcesConfig {
                tiger_base_url: env_or("LOCALEDB_TIGER_URL", DEFAULT_TIGER_URL),
                tiger_vintage: env_or("LOCALEDB_TIGER_VINTAGE", DEFAULT_TIGER_VINTAGE),
                population_base_url: env_or("LOCALEDB_POP_URL", DEFAULT_POPULATION_URL),
                locale_list_url: env_or("LOCALEDB_LOCALE_LIST_URL", DEFAULT_LOCALE_LIST_URL),
                c19_base_url: env_or("LOCALEDB_C19_URL", DEFAULT_C19_URL),
                npi_url: env_or("LOCALEDB_NPI_URL", DEFAULT_NPI_URL),
                vax_url: env_or("LOCALEDB_VAX_URL", DEFAULT_VAX_URL),
                health_url: std::env::var("LOCALEDB_HEALTH_URL").ok(),
                weather_url: std::env::var("LOCALEDB_WEATHER_URL").ok(),
                mobility_url: std::env::var("LOCALEDB_MOBILITY_URL").ok(),
            },
            disease_epoch,
            ogr2ogr: env_or("LOCALEDB_OGR2OGR", DEFAULT_OGR2OGR),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(IngestError::config("Database URL cannot be empty"));
        }

        if self.fetch.max_attempts == 0 {
            return Err(IngestError::config("Fetch max_attempts must be at least 1"));
        }

        if self.fetch.timeout_secs == 0 {
            return Err(IngestError::config("Fetch timeout must be greater than 0"));
        }

        if self.paths.cache_dir == self.paths.scratch_dir {
            return Err(IngestError::config(format!(
                "Cache and scratch directories must differ (both are {})",
                self.paths.cache_dir.display()
            )));
        }

        let vintage = &self.sources.tiger_vintage;
        if vintage.len() != 4 || !vintage.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IngestError::config(format!(
                "LOCALEDB_TIGER_VINTAGE must be a four-digit year: {:?}",
                vintage
            )));
        }

        for (name, template) in [
            ("LOCALEDB_HEALTH_URL", &self.sources.health_url),
            ("LOCALEDB_WEATHER_URL", &self.sources.weather_url),
            ("LOCALEDB_MOBILITY_URL", &self.sources.mobility_url),
        ] {
            if let Some(template) = template {
                if !template.contains("{fips}") && !template.contains("{abbr}") {
                    return Err(IngestError::config(format!(
                        "{} must contain {{fips}} or {{abbr}}: {}",
                        name, template
                    )));
                }
            }
        }

        Ok(())
    }
}
