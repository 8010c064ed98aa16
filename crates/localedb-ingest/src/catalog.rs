//! Resource catalog
//!
//! Declarative mapping from (domain, partition key) to the ordered list of
//! remote resources that populate it.

use localedb_common::types::{Domain, Fips};

use crate::config::SourcesConfig;
use crate::error::{IngestError, Result};
use crate::models::GeoLevel;
use crate::resolver::{Resolver, StatePartition};

/// Disease identifiers with a known set of feeds
pub const KNOWN_DISEASES: [&str; 1] = ["c19"];
/// Vaccines with a known coverage export
pub const KNOWN_VACCINES: [&str; 1] = ["flu"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiseaseMetric {
    Confirmed,
    Dead,
    Recovered,
}

impl DiseaseMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            DiseaseMetric::Confirmed => "confirmed",
            DiseaseMetric::Dead => "deaths",
            DiseaseMetric::Recovered => "recovered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedRegion {
    /// Country/province rows
    Global,
    /// U.S. county rows
    Us,
}

impl FeedRegion {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedRegion::Global => "global",
            FeedRegion::Us => "US",
        }
    }
}

/// One wide time-series feed of a disease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedSpec {
    pub metric: DiseaseMetric,
    pub region: FeedRegion,
}

/// What a catalog entry populates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Locale,
    Geo(GeoLevel),
    Population,
    DiseaseFeed(FeedSpec),
    Npi,
    Vaccination,
    Observation(Domain),
}

impl Target {
    /// Primary table the target writes
    pub fn table(&self) -> &'static str {
        match self {
            Target::Locale => "main.locale",
            Target::Geo(level) => level.table(),
            Target::Population => "pop.household",
            Target::DiseaseFeed(_) => "dis.dyn",
            Target::Npi => "npi.npi",
            Target::Vaccination => "vax.vax",
            Target::Observation(_) => "obs.observation",
        }
    }
}

/// The unit a load or removal operates on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionKey {
    State(StatePartition),
    /// Disease or vaccine identifier
    Disease(String),
    Global,
}

impl PartitionKey {
    pub fn state(&self) -> Option<&StatePartition> {
        match self {
            PartitionKey::State(state) => Some(state),
            _ => None,
        }
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionKey::State(state) => write!(f, "{}", state.abbr),
            PartitionKey::Disease(id) => f.write_str(id),
            PartitionKey::Global => f.write_str("global"),
        }
    }
}

/// One remote resource and where it goes
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub label: String,
    pub domain: Domain,
    pub locator: String,
    pub target: Target,
    /// State the entry's rows are scoped to
    pub scope: Option<Fips>,
    /// A failure aborts the remaining entries of the partition
    pub critical: bool,
}

/// Builds catalog entries from configured source locations
#[derive(Debug, Clone)]
pub struct Catalog {
    sources: SourcesConfig,
}

impl Catalog {
    pub fn new(sources: SourcesConfig) -> Self {
        Self { sources }
    }

    /// Partition keys named by `token` for `domain`.
    ///
    /// State-scoped domains resolve the token (wildcard included) through the
    /// resolver; disease-like domains take an identifier, defaulting to the
    /// only one they know.
    pub fn partitions(
        &self,
        domain: Domain,
        token: Option<&str>,
        resolver: &Resolver,
    ) -> Result<Vec<PartitionKey>> {
        match domain {
            Domain::Main => Ok(vec![PartitionKey::Global]),
            Domain::Disease | Domain::Npi => {
                let id = token.unwrap_or(KNOWN_DISEASES[0]).trim().to_lowercase();
                if !KNOWN_DISEASES.contains(&id.as_str()) {
                    return Err(IngestError::invalid_partition(id, "unknown disease"));
                }
                Ok(vec![PartitionKey::Disease(id)])
            },
            Domain::Vaccination => {
                let id = token.unwrap_or(KNOWN_VACCINES[0]).trim().to_lowercase();
                if !KNOWN_VACCINES.contains(&id.as_str()) {
                    return Err(IngestError::invalid_partition(id, "unknown vaccine"));
                }
                Ok(vec![PartitionKey::Disease(id)])
            },
            _ => {
                let token = token.ok_or_else(|| {
                    IngestError::invalid_partition("", format!("{} requires a state", domain))
                })?;
                Ok(resolver
                    .resolve(token)?
                    .into_iter()
                    .map(PartitionKey::State)
                    .collect())
            },
        }
    }

    /// Ordered entries for one partition of `domain`
    pub fn entries(&self, domain: Domain, key: &PartitionKey) -> Result<Vec<CatalogEntry>> {
        match (domain, key) {
            (Domain::Main, PartitionKey::Global) => Ok(vec![CatalogEntry {
                label: "locale list".to_string(),
                domain,
                locator: self.sources.locale_list_url.clone(),
                target: Target::Locale,
                scope: None,
                critical: true,
            }]),
            (Domain::Geo, PartitionKey::State(state)) => Ok(self.geo_entries(state)),
            (Domain::Pop, PartitionKey::State(state)) => Ok(vec![CatalogEntry {
                label: format!("population {}", state.abbr),
                domain,
                locator: format!(
                    "{}/{}.zip",
                    self.sources.population_base_url.trim_end_matches('/'),
                    state.abbr.to_lowercase()
                ),
                target: Target::Population,
                scope: Some(state.fips.clone()),
                critical: true,
            }]),
            (Domain::Disease, PartitionKey::Disease(id)) => self.disease_entries(id),
            (Domain::Npi, PartitionKey::Disease(id)) if id == "c19" => Ok(vec![CatalogEntry {
                label: "npi c19".to_string(),
                domain,
                locator: self.sources.npi_url.clone(),
                target: Target::Npi,
                scope: None,
                critical: true,
            }]),
            (Domain::Vaccination, PartitionKey::Disease(id)) if id == "flu" => {
                Ok(vec![CatalogEntry {
                    label: "vaccination flu".to_string(),
                    domain,
                    locator: self.sources.vax_url.clone(),
                    target: Target::Vaccination,
                    scope: None,
                    critical: true,
                }])
            },
            (Domain::Health | Domain::Weather | Domain::Mobility, PartitionKey::State(state)) => {
                self.observation_entries(domain, state)
            },
            (domain, key) => Err(IngestError::invalid_partition(
                key.to_string(),
                format!("not a partition of domain {}", domain),
            )),
        }
    }

    fn geo_entries(&self, state: &StatePartition) -> Vec<CatalogEntry> {
        let base = self.sources.tiger_base_url.trim_end_matches('/');
        let vintage = &self.sources.tiger_vintage;
        // TIGER file names carry the two-digit vintage suffix (tract10)
        let yy = vintage.get(vintage.len().saturating_sub(2)..).unwrap_or(vintage);

        GeoLevel::ALL
            .iter()
            .map(|&level| CatalogEntry {
                label: format!("geo {} {}", level, state.abbr),
                domain: Domain::Geo,
                locator: format!(
                    "{}/{}/{}/tl_{}_{}_{}{}.zip",
                    base,
                    level.tiger_dir(),
                    vintage,
                    vintage,
                    state.fips,
                    level.tiger_token(),
                    yy
                ),
                target: Target::Geo(level),
                scope: Some(state.fips.clone()),
                critical: level.registers_locales(),
            })
            .collect()
    }

    fn disease_entries(&self, id: &str) -> Result<Vec<CatalogEntry>> {
        if id != "c19" {
            return Err(IngestError::invalid_partition(id, "unknown disease"));
        }
        let base = self.sources.c19_base_url.trim_end_matches('/');

        let feeds = [
            (DiseaseMetric::Confirmed, FeedRegion::Global),
            (DiseaseMetric::Dead, FeedRegion::Global),
            (DiseaseMetric::Recovered, FeedRegion::Global),
            (DiseaseMetric::Confirmed, FeedRegion::Us),
            (DiseaseMetric::Dead, FeedRegion::Us),
        ];

        Ok(feeds
            .iter()
            .map(|&(metric, region)| CatalogEntry {
                label: format!("{} {} {}", id, metric.as_str(), region.as_str()),
                domain: Domain::Disease,
                locator: format!(
                    "{}/time_series_covid19_{}_{}.csv",
                    base,
                    metric.as_str(),
                    region.as_str()
                ),
                target: Target::DiseaseFeed(FeedSpec { metric, region }),
                scope: None,
                critical: metric == DiseaseMetric::Confirmed,
            })
            .collect())
    }

    fn observation_entries(
        &self,
        domain: Domain,
        state: &StatePartition,
    ) -> Result<Vec<CatalogEntry>> {
        let template = match domain {
            Domain::Health => self.sources.health_url.as_ref(),
            Domain::Weather => self.sources.weather_url.as_ref(),
            _ => self.sources.mobility_url.as_ref(),
        }
        .ok_or_else(|| {
            IngestError::config(format!(
                "no source configured for {} (set LOCALEDB_{}_URL)",
                domain,
                domain.as_str().to_uppercase()
            ))
        })?;

        let locator = template
            .replace("{fips}", state.fips.as_str())
            .replace("{abbr}", &state.abbr.to_lowercase());

        Ok(vec![CatalogEntry {
            label: format!("{} {}", domain, state.abbr),
            domain,
            locator,
            target: Target::Observation(domain),
            scope: Some(state.fips.clone()),
            critical: true,
        }])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::resolver::PartitionTable;

    fn fixtures() -> (Catalog, Resolver) {
        (
            Catalog::new(SourcesConfig::default()),
            Resolver::new(PartitionTable::us_states().unwrap()),
        )
    }

    #[test]
    fn test_geo_entries_parent_levels_first() {
        let (catalog, resolver) = fixtures();
        let ak = resolver.resolve_one("AK").unwrap();
        let entries = catalog.entries(Domain::Geo, &PartitionKey::State(ak)).unwrap();

        let levels: Vec<_> = entries
            .iter()
            .map(|e| match e.target {
                Target::Geo(level) => level,
                _ => panic!("unexpected target"),
            })
            .collect();
        assert_eq!(levels, GeoLevel::ALL.to_vec());
        assert_eq!(
            entries[2].locator,
            "https://www2.census.gov/geo/tiger/TIGER2010/TRACT/2010/tl_2010_02_tract10.zip"
        );
        assert!(entries[0].critical && entries[1].critical);
        assert!(!entries[2].critical);
        assert!(entries.iter().all(|e| e.scope.as_ref().unwrap().as_str() == "02"));
    }

    #[test]
    fn test_non_ascii_vintage_does_not_panic() {
        let sources = SourcesConfig {
            tiger_vintage: "20\u{ff11}0".to_string(),
            ..SourcesConfig::default()
        };
        let resolver = Resolver::new(PartitionTable::us_states().unwrap());
        let ak = resolver.resolve_one("AK").unwrap();
        let entries = Catalog::new(sources)
            .entries(Domain::Geo, &PartitionKey::State(ak))
            .unwrap();
        assert_eq!(entries.len(), GeoLevel::ALL.len());
    }

    #[test]
    fn test_population_entry() {
        let (catalog, resolver) = fixtures();
        let pa = resolver.resolve_one("pa").unwrap();
        let entries = catalog.entries(Domain::Pop, &PartitionKey::State(pa)).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].locator.ends_with("/pa.zip"));
        assert_eq!(entries[0].target.table(), "pop.household");
    }

    #[test]
    fn test_disease_feeds_in_consolidation_order() {
        let (catalog, _) = fixtures();
        let entries = catalog
            .entries(Domain::Disease, &PartitionKey::Disease("c19".into()))
            .unwrap();
        let labels: Vec<_> = entries.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(
            labels,
            [
                "c19 confirmed global",
                "c19 deaths global",
                "c19 recovered global",
                "c19 confirmed US",
                "c19 deaths US"
            ]
        );
        assert!(entries[4].locator.ends_with("time_series_covid19_deaths_US.csv"));
        assert_eq!(entries.iter().filter(|e| e.critical).count(), 2);
    }

    #[test]
    fn test_unknown_disease_is_invalid_partition() {
        let (catalog, resolver) = fixtures();
        assert!(matches!(
            catalog.partitions(Domain::Disease, Some("h1n1"), &resolver),
            Err(IngestError::InvalidPartition { .. })
        ));
    }

    #[test]
    fn test_state_domains_resolve_wildcard() {
        let (catalog, resolver) = fixtures();
        let keys = catalog.partitions(Domain::Geo, Some("_all"), &resolver).unwrap();
        assert_eq!(keys.len(), 52);
        assert!(catalog.partitions(Domain::Pop, None, &resolver).is_err());
    }

    #[test]
    fn test_observation_template() {
        let mut sources = SourcesConfig::default();
        sources.weather_url = Some("file:///mirror/weather/{abbr}_{fips}.csv".into());
        let catalog = Catalog::new(sources);
        let resolver = Resolver::new(PartitionTable::us_states().unwrap());
        let ak = PartitionKey::State(resolver.resolve_one("AK").unwrap());

        let entries = catalog.entries(Domain::Weather, &ak).unwrap();
        assert_eq!(entries[0].locator, "file:///mirror/weather/ak_02.csv");
        assert!(matches!(
            catalog.entries(Domain::Health, &ak),
            Err(IngestError::Config(_))
        ));
    }
}
