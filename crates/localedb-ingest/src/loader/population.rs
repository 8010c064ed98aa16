//! Synthetic population loader
//!
//! # File Format
//! The state archive holds one directory per county, each with the same set
//! of tab-delimited files (`households.txt`, `people.txt`, ...). Every file
//! starts with a header line. The value `X` marks a missing reference.
//!
//! Lines that do not match a file's pattern, or hold a number out of range,
//! are skipped and counted, as are repeated ids. The state and county locales
//! must already exist (geography loads first); the whole state is then
//! replaced in one transaction.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{require_rows, DomainLoader, LoadOutcome};
use crate::catalog::CatalogEntry;
use crate::error::{IngestError, Result};
use crate::models::{
    GroupQuarters, GroupQuartersPerson, Hospital, Household, Person, Placement, PopEntity,
    PopulationBatch, School, Workplace,
};
use crate::resolver::StatePartition;
use crate::warehouse::Warehouse;

/// Missing-value marker
pub const NA: &str = "X";

const COORDS: &str = r"-?[0-9]+\.[0-9]+\t-?[0-9]+\.[0-9]+";

/// Line pattern of each population file
fn line_pattern(entity: PopEntity) -> String {
    match entity {
        PopEntity::School => format!(r"^\d+\t\d+\t{}$", COORDS),
        PopEntity::Hospital => format!(r"^\d+\t\d+\t\d+\t\d+\t{}$", COORDS),
        PopEntity::Household => format!(r"^\d+\t\d+\t\d+\t\d+\t{}$", COORDS),
        PopEntity::GroupQuarters => format!(r"^\d+\t\w+\t\d+\t\d+\t{}$", COORDS),
        PopEntity::Workplace => format!(r"^\d+\t{}$", COORDS),
        PopEntity::Person => r"^\d+\t\d+\t\d+\t[FM]\t\d+\t\d+\t(?:\d+|X)\t(?:\d+|X)$".to_string(),
        PopEntity::GroupQuartersPerson => r"^\d+\t\d+\t\d+\t[FM]$".to_string(),
    }
}

/// Every file named `name` under `root`, in path order
fn find_named(root: &Path, name: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == name)
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Matching lines of every `entity` file, header excluded
fn read_lines(root: &Path, entity: PopEntity) -> Result<(Vec<(PathBuf, String)>, u64)> {
    let pattern = Regex::new(&line_pattern(entity))
        .map_err(|e| IngestError::Internal(format!("bad pattern for {}: {}", entity, e)))?;

    let mut lines = Vec::new();
    let mut skipped = 0u64;

    for path in find_named(root, entity.file_name()) {
        let content = std::fs::read_to_string(&path)?;
        for (line_num, line) in content.lines().enumerate().skip(1) {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if pattern.is_match(line) {
                lines.push((path.clone(), line.to_string()));
            } else {
                debug!(file = %path.display(), line = line_num + 1, "Malformed population line");
                skipped += 1;
            }
        }
    }
    Ok((lines, skipped))
}

fn int<T: std::str::FromStr>(field: &str, path: &Path) -> Result<T> {
    field
        .parse()
        .map_err(|_| IngestError::parse(path.display().to_string(), format!("bad number {:?}", field)))
}

fn optional_ref(field: &str, path: &Path) -> Result<Option<i64>> {
    if field == NA {
        Ok(None)
    } else {
        int(field, path).map(Some)
    }
}

/// Coordinates in WGS 84; a zero in either one means unknown
fn coords(lat: &str, long: &str) -> (Option<f64>, Option<f64>) {
    match (lat.parse::<f64>(), long.parse::<f64>()) {
        (Ok(lat), Ok(long)) if lat != 0.0 && long != 0.0 => (Some(lat), Some(long)),
        _ => (None, None),
    }
}

/// County code of a record: from its census code, or the county directory
fn county_code(code: Option<&str>, path: &Path) -> Option<String> {
    if let Some(code) = code.filter(|c| c.len() >= 5) {
        return Some(code[..5].to_string());
    }
    path.parent()
        .and_then(|dir| dir.file_name())
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| name.len() == 5 && name.chars().all(|c| c.is_ascii_digit()))
}

/// Drop repeated ids, keeping the first occurrence
fn dedup<T>(rows: &mut Vec<T>, id: impl Fn(&T) -> i64) -> u64 {
    let before = rows.len();
    let mut seen = HashSet::new();
    rows.retain(|r| seen.insert(id(r)));
    (before - rows.len()) as u64
}

/// A parsed line before county ids are resolved
struct Pending<T> {
    county: Option<String>,
    lat: Option<f64>,
    long: Option<f64>,
    build: Box<dyn FnOnce(Placement) -> T + Send>,
}

pub struct PopulationLoader {
    warehouse: Arc<dyn Warehouse>,
    state: StatePartition,
}

impl PopulationLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, state: StatePartition) -> Self {
        Self { warehouse, state }
    }

    /// Parse every population file of the workspace.
    ///
    /// Returns the rows still waiting for locale ids, plus the persons and
    /// skip count.
    fn parse(&self, root: &Path) -> Result<(ParsedPopulation, u64)> {
        let mut parsed = ParsedPopulation::default();
        let mut skipped = 0u64;

        parsed.schools = parse_rows(root, PopEntity::School, &mut skipped, |path, f| {
            let id = int(f[0], path)?;
            let stco = f[1].to_string();
            let (lat, long) = coords(f[2], f[3]);
            Ok(Pending {
                county: county_code(Some(stco.as_str()), path),
                lat,
                long,
                build: Box::new(move |place| School { id, stco, place }),
            })
        })?;

        parsed.hospitals = parse_rows(root, PopEntity::Hospital, &mut skipped, |path, f| {
            let (id, workers, physicians, beds) =
                (int(f[0], path)?, int(f[1], path)?, int(f[2], path)?, int(f[3], path)?);
            let (lat, long) = coords(f[4], f[5]);
            Ok(Pending {
                county: county_code(None, path),
                lat,
                long,
                build: Box::new(move |place| Hospital {
                    id,
                    workers,
                    physicians,
                    beds,
                    place,
                }),
            })
        })?;

        parsed.households = parse_rows(root, PopEntity::Household, &mut skipped, |path, f| {
            let (id, race, income) = (int(f[0], path)?, int(f[2], path)?, int(f[3], path)?);
            let stcotrbg = f[1].to_string();
            let (lat, long) = coords(f[4], f[5]);
            Ok(Pending {
                county: county_code(Some(stcotrbg.as_str()), path),
                lat,
                long,
                build: Box::new(move |place| Household {
                    id,
                    stcotrbg,
                    race,
                    income,
                    place,
                }),
            })
        })?;

        parsed.group_quarters =
            parse_rows(root, PopEntity::GroupQuarters, &mut skipped, |path, f| {
                let (id, persons) = (int(f[0], path)?, int(f[3], path)?);
                let (gq_type, stcotrbg) = (f[1].to_string(), f[2].to_string());
                let (lat, long) = coords(f[4], f[5]);
                Ok(Pending {
                    county: county_code(Some(stcotrbg.as_str()), path),
                    lat,
                    long,
                    build: Box::new(move |place| GroupQuarters {
                        id,
                        gq_type,
                        stcotrbg,
                        persons,
                        place,
                    }),
                })
            })?;

        parsed.workplaces = parse_rows(root, PopEntity::Workplace, &mut skipped, |path, f| {
            let id = int(f[0], path)?;
            let (lat, long) = coords(f[1], f[2]);
            Ok(Pending {
                county: county_code(None, path),
                lat,
                long,
                build: Box::new(move |place| Workplace { id, place }),
            })
        })?;

        parsed.persons = parse_rows(root, PopEntity::Person, &mut skipped, |path, f| {
            Ok(Person {
                id: int(f[0], path)?,
                household_id: int(f[1], path)?,
                age: int(f[2], path)?,
                sex: f[3].to_string(),
                race: int(f[4], path)?,
                relate: int(f[5], path)?,
                school_id: optional_ref(f[6], path)?,
                workplace_id: optional_ref(f[7], path)?,
            })
        })?;

        parsed.gq_persons =
            parse_rows(root, PopEntity::GroupQuartersPerson, &mut skipped, |path, f| {
                Ok(GroupQuartersPerson {
                    id: int(f[0], path)?,
                    gq_id: int(f[1], path)?,
                    age: int(f[2], path)?,
                    sex: f[3].to_string(),
                })
            })?;

        Ok((parsed, skipped))
    }
}

/// Build one row per matching line of every `entity` file.
///
/// Lines failing the pattern or `row` (a number out of range) are skipped
/// and added to `skipped`.
fn parse_rows<T>(
    root: &Path,
    entity: PopEntity,
    skipped: &mut u64,
    row: impl Fn(&Path, &[&str]) -> Result<T>,
) -> Result<Vec<T>> {
    let (lines, malformed) = read_lines(root, entity)?;
    *skipped += malformed;

    let mut rows = Vec::with_capacity(lines.len());
    for (path, line) in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        match row(&path, &fields) {
            Ok(r) => rows.push(r),
            Err(e) => {
                debug!(error = %e, "Skipping population line");
                *skipped += 1;
            },
        }
    }
    Ok(rows)
}

#[derive(Default)]
struct ParsedPopulation {
    schools: Vec<Pending<School>>,
    hospitals: Vec<Pending<Hospital>>,
    households: Vec<Pending<Household>>,
    group_quarters: Vec<Pending<GroupQuarters>>,
    workplaces: Vec<Pending<Workplace>>,
    persons: Vec<Person>,
    gq_persons: Vec<GroupQuartersPerson>,
}

impl ParsedPopulation {
    fn counties(&self) -> BTreeSet<String> {
        let located = self
            .schools
            .iter()
            .map(|p| &p.county)
            .chain(self.hospitals.iter().map(|p| &p.county))
            .chain(self.households.iter().map(|p| &p.county))
            .chain(self.group_quarters.iter().map(|p| &p.county))
            .chain(self.workplaces.iter().map(|p| &p.county));
        located.flatten().cloned().collect()
    }

    fn place<T>(pending: Vec<Pending<T>>, st_id: i64, counties: &HashMap<String, i64>) -> Vec<T> {
        pending
            .into_iter()
            .map(|p| {
                let co_id = p.county.as_ref().and_then(|c| counties.get(c).copied());
                (p.build)(Placement {
                    st_id,
                    co_id,
                    lat: p.lat,
                    long: p.long,
                })
            })
            .collect()
    }

    fn into_batch(self, st_id: i64, counties: &HashMap<String, i64>) -> PopulationBatch {
        PopulationBatch {
            schools: Self::place(self.schools, st_id, counties),
            hospitals: Self::place(self.hospitals, st_id, counties),
            households: Self::place(self.households, st_id, counties),
            group_quarters: Self::place(self.group_quarters, st_id, counties),
            workplaces: Self::place(self.workplaces, st_id, counties),
            persons: self.persons,
            gq_persons: self.gq_persons,
        }
    }
}

#[async_trait]
impl DomainLoader for PopulationLoader {
    async fn load(&mut self, entry: &CatalogEntry, workspace: &Path) -> Result<LoadOutcome> {
        let scope = &self.state.fips;
        let (parsed, mut skipped) = self.parse(workspace)?;

        let st_id = self
            .warehouse
            .us_locale_ids(&[scope.to_string()])
            .await?
            .get(scope.as_str())
            .copied()
            .ok_or_else(|| {
                IngestError::ReferentialIntegrity(format!(
                    "state locale {} does not exist; load its geography first",
                    self.state
                ))
            })?;

        let wanted: Vec<String> = parsed.counties().into_iter().collect();
        let counties = self.warehouse.us_locale_ids(&wanted).await?;
        if counties.len() < wanted.len() {
            warn!(
                state = %self.state,
                missing = wanted.len() - counties.len(),
                "Population references counties without a locale"
            );
        }

        let mut batch = parsed.into_batch(st_id, &counties);
        skipped += dedup(&mut batch.schools, |r| r.id);
        skipped += dedup(&mut batch.hospitals, |r| r.id);
        skipped += dedup(&mut batch.households, |r| r.id);
        skipped += dedup(&mut batch.group_quarters, |r| r.id);
        skipped += dedup(&mut batch.workplaces, |r| r.id);
        skipped += dedup(&mut batch.persons, |r| r.id);
        skipped += dedup(&mut batch.gq_persons, |r| r.id);

        require_rows(entry, batch.households.len() as u64)?;

        let counts = self.warehouse.replace_population(scope, &batch).await?;
        info!(
            state = %self.state,
            households = counts.households,
            persons = counts.persons,
            skipped,
            "Population loaded"
        );
        Ok(LoadOutcome::new(counts.total(), skipped))
    }

    fn tables(&self) -> Vec<&'static str> {
        PopEntity::ALL.iter().map(|e| e.table()).collect()
    }
}
