//! Row types written to and read from the warehouse

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use localedb_common::types::LocaleLevel;

// ============================================================================
// Locales
// ============================================================================

/// A locale as submitted by a loader.
///
/// Matched against existing locales by `(admin0, admin1, admin2)`; any code,
/// coordinate or population the stored row lacks is filled from here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocaleRecord {
    pub iso2: Option<String>,
    pub iso3: Option<String>,
    pub iso_num: Option<i32>,
    pub fips: Option<String>,
    pub admin0: Option<String>,
    pub admin1: Option<String>,
    pub admin2: Option<String>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
    pub population: Option<i64>,
}

impl LocaleRecord {
    /// A U.S. locale at state or county level
    pub fn us(fips: &str, state: &str, county: Option<&str>) -> Self {
        Self {
            iso2: Some("US".to_string()),
            iso3: Some("USA".to_string()),
            iso_num: Some(840),
            fips: Some(fips.to_string()),
            admin0: Some("US".to_string()),
            admin1: Some(state.to_string()),
            admin2: county.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn name_key(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        (
            self.admin0.as_deref(),
            self.admin1.as_deref(),
            self.admin2.as_deref(),
        )
    }

    /// Fill the fields `self` lacks from `other`
    pub fn fill_from(&mut self, other: &LocaleRecord) {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(value);
            }
        }
        fill(&mut self.iso2, &other.iso2);
        fill(&mut self.iso3, &other.iso3);
        fill(&mut self.iso_num, &other.iso_num);
        fill(&mut self.fips, &other.fips);
        fill(&mut self.lat, &other.lat);
        fill(&mut self.long, &other.long);
        fill(&mut self.population, &other.population);
    }
}

// ============================================================================
// Geography
// ============================================================================

/// Census geography layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GeoLevel {
    State,
    County,
    Tract,
    BlockGroup,
    Block,
}

impl GeoLevel {
    /// Parent levels first
    pub const ALL: [GeoLevel; 5] = [
        GeoLevel::State,
        GeoLevel::County,
        GeoLevel::Tract,
        GeoLevel::BlockGroup,
        GeoLevel::Block,
    ];

    /// Levels whose presence marks a state as loaded and which removal deletes
    pub const SUB_STATE: [GeoLevel; 3] = [GeoLevel::Tract, GeoLevel::BlockGroup, GeoLevel::Block];

    pub fn table(self) -> &'static str {
        match self {
            GeoLevel::State => "geo.st",
            GeoLevel::County => "geo.co",
            GeoLevel::Tract => "geo.tract",
            GeoLevel::BlockGroup => "geo.bg",
            GeoLevel::Block => "geo.block",
        }
    }

    /// Directory of the layer on the TIGER server
    pub fn tiger_dir(self) -> &'static str {
        match self {
            GeoLevel::State => "STATE",
            GeoLevel::County => "COUNTY",
            GeoLevel::Tract => "TRACT",
            GeoLevel::BlockGroup => "BG",
            GeoLevel::Block => "TABBLOCK",
        }
    }

    /// Layer token in TIGER file names
    pub fn tiger_token(self) -> &'static str {
        match self {
            GeoLevel::State => "state",
            GeoLevel::County => "county",
            GeoLevel::Tract => "tract",
            GeoLevel::BlockGroup => "bg",
            GeoLevel::Block => "tabblock",
        }
    }

    pub fn locale_level(self) -> LocaleLevel {
        match self {
            GeoLevel::State => LocaleLevel::State,
            GeoLevel::County => LocaleLevel::County,
            GeoLevel::Tract => LocaleLevel::Tract,
            GeoLevel::BlockGroup => LocaleLevel::BlockGroup,
            GeoLevel::Block => LocaleLevel::Block,
        }
    }

    pub fn registers_locales(self) -> bool {
        matches!(self, GeoLevel::State | GeoLevel::County)
    }
}

impl std::fmt::Display for GeoLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tiger_token())
    }
}

/// One census geography unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoFeature {
    pub geoid: String,
    pub statefp: String,
    pub countyfp: Option<String>,
    pub name: Option<String>,
    pub aland: Option<i64>,
    pub awater: Option<i64>,
    pub intptlat: Option<f64>,
    pub intptlon: Option<f64>,
    /// Remaining shapefile attributes
    pub attrs: serde_json::Value,
    /// Geometry as WKT in NAD83
    pub wkt: String,
}

// ============================================================================
// Population
// ============================================================================

/// Synthetic population entity, in insertion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PopEntity {
    School,
    Hospital,
    Household,
    GroupQuarters,
    Workplace,
    Person,
    GroupQuartersPerson,
}

impl PopEntity {
    pub const ALL: [PopEntity; 7] = [
        PopEntity::School,
        PopEntity::Hospital,
        PopEntity::Household,
        PopEntity::GroupQuarters,
        PopEntity::Workplace,
        PopEntity::Person,
        PopEntity::GroupQuartersPerson,
    ];

    pub fn table(self) -> &'static str {
        match self {
            PopEntity::School => "pop.school",
            PopEntity::Hospital => "pop.hospital",
            PopEntity::Household => "pop.household",
            PopEntity::GroupQuarters => "pop.gq",
            PopEntity::Workplace => "pop.workplace",
            PopEntity::Person => "pop.person",
            PopEntity::GroupQuartersPerson => "pop.gq_person",
        }
    }

    /// Source file inside the population archive
    pub fn file_name(self) -> &'static str {
        match self {
            PopEntity::School => "schools.txt",
            PopEntity::Hospital => "hospitals.txt",
            PopEntity::Household => "households.txt",
            PopEntity::GroupQuarters => "gq.txt",
            PopEntity::Workplace => "workplaces.txt",
            PopEntity::Person => "people.txt",
            PopEntity::GroupQuartersPerson => "gq_people.txt",
        }
    }
}

impl std::fmt::Display for PopEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table().trim_start_matches("pop."))
    }
}

/// Point location and owning locales shared by located entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub st_id: i64,
    pub co_id: Option<i64>,
    /// WGS 84; `None` when the source coordinate is missing or zero
    pub lat: Option<f64>,
    pub long: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct School {
    pub id: i64,
    pub stco: String,
    pub place: Placement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hospital {
    pub id: i64,
    pub workers: i32,
    pub physicians: i32,
    pub beds: i32,
    pub place: Placement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Household {
    pub id: i64,
    pub stcotrbg: String,
    pub race: i32,
    pub income: i64,
    pub place: Placement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupQuarters {
    pub id: i64,
    pub gq_type: String,
    pub stcotrbg: String,
    pub persons: i32,
    pub place: Placement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workplace {
    pub id: i64,
    pub place: Placement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub household_id: i64,
    pub age: i32,
    pub sex: String,
    pub race: i32,
    pub relate: i32,
    pub school_id: Option<i64>,
    pub workplace_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupQuartersPerson {
    pub id: i64,
    pub gq_id: i64,
    pub age: i32,
    pub sex: String,
}

/// Everything one state's population archive contains
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationBatch {
    pub schools: Vec<School>,
    pub hospitals: Vec<Hospital>,
    pub households: Vec<Household>,
    pub group_quarters: Vec<GroupQuarters>,
    pub workplaces: Vec<Workplace>,
    pub persons: Vec<Person>,
    pub gq_persons: Vec<GroupQuartersPerson>,
}

impl PopulationBatch {
    pub fn counts(&self) -> PopulationCounts {
        PopulationCounts {
            schools: self.schools.len() as u64,
            hospitals: self.hospitals.len() as u64,
            households: self.households.len() as u64,
            group_quarters: self.group_quarters.len() as u64,
            workplaces: self.workplaces.len() as u64,
            persons: self.persons.len() as u64,
            gq_persons: self.gq_persons.len() as u64,
        }
    }
}

/// Row counts per population entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationCounts {
    pub schools: u64,
    pub hospitals: u64,
    pub households: u64,
    pub group_quarters: u64,
    pub workplaces: u64,
    pub persons: u64,
    pub gq_persons: u64,
}

impl PopulationCounts {
    pub fn get(&self, entity: PopEntity) -> u64 {
        match entity {
            PopEntity::School => self.schools,
            PopEntity::Hospital => self.hospitals,
            PopEntity::Household => self.households,
            PopEntity::GroupQuarters => self.group_quarters,
            PopEntity::Workplace => self.workplaces,
            PopEntity::Person => self.persons,
            PopEntity::GroupQuartersPerson => self.gq_persons,
        }
    }

    pub fn total(&self) -> u64 {
        PopEntity::ALL.iter().map(|e| self.get(*e)).sum()
    }
}

// ============================================================================
// Disease dynamics
// ============================================================================

/// One consolidated observation for (disease, locale, day)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynRow {
    pub locale_id: i64,
    pub day: NaiveDate,
    /// Days since the disease epoch
    pub day_i: i32,
    pub n_conf: Option<i64>,
    pub n_dead: Option<i64>,
    pub n_rec: Option<i64>,
    pub n_test: Option<i64>,
    pub n_vax: Option<i64>,
}

// ============================================================================
// Interventions, vaccination, observations
// ============================================================================

/// A non-pharmaceutical intervention episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpiRecord {
    pub locale_id: i64,
    pub npi_type: String,
    pub begin_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub begin_citation: Option<String>,
    pub begin_note: Option<String>,
    pub end_citation: Option<String>,
    pub end_note: Option<String>,
}

/// A vaccination coverage estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaxRecord {
    pub locale_id: i64,
    pub age: String,
    pub race: String,
    pub year_from: i16,
    pub year_to: i16,
    pub month: Option<i16>,
    pub estimate: Option<f64>,
    pub ci: Option<String>,
    pub sample_size: Option<i64>,
}

/// A single metric value for a locale and day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRow {
    pub locale_id: i64,
    pub day: NaiveDate,
    pub metric: String,
    pub value: f64,
}
