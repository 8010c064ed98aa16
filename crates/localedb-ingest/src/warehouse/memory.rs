//! In-process warehouse
//!
//! Mirrors the constraints of the PostgreSQL schema (foreign keys, unique
//! keys, cascades) and applies every `replace_*` atomically: all checks run
//! before any state changes.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;

use localedb_common::types::{Domain, Fips};

use super::Warehouse;
use crate::error::{IngestError, Result};
use crate::models::{
    DynRow, GeoFeature, GeoLevel, LocaleRecord, NpiRecord, ObservationRow, PopEntity,
    PopulationBatch, PopulationCounts, VaxRecord,
};

#[derive(Debug, Default)]
struct State {
    /// Locale with id `i + 1` at index `i`
    locales: Vec<LocaleRecord>,
    geo: HashMap<GeoLevel, BTreeMap<String, GeoFeature>>,
    /// Keyed by state FIPS
    pop: BTreeMap<String, PopulationBatch>,
    dyn_rows: BTreeMap<String, BTreeMap<(i64, NaiveDate), DynRow>>,
    npis: BTreeMap<String, Vec<NpiRecord>>,
    vax: BTreeMap<String, Vec<VaxRecord>>,
    obs: HashMap<Domain, Vec<ObservationRow>>,
    analyzed: Vec<&'static str>,
}

impl State {
    fn locale_exists(&self, id: i64) -> bool {
        id >= 1 && (id as usize) <= self.locales.len()
    }

    fn locale_fips(&self, id: i64) -> Option<&str> {
        if !self.locale_exists(id) {
            return None;
        }
        self.locales[(id - 1) as usize].fips.as_deref()
    }

    fn locale_within(&self, id: i64, scope: &Fips) -> bool {
        self.locale_fips(id)
            .map(|f| f.starts_with(scope.as_str()))
            .unwrap_or(false)
    }

    fn require_locales(&self, ids: impl IntoIterator<Item = i64>, table: &str) -> Result<()> {
        for id in ids {
            if !self.locale_exists(id) {
                return Err(IngestError::ReferentialIntegrity(format!(
                    "{} references missing locale {}",
                    table, id
                )));
            }
        }
        Ok(())
    }
}

/// Warehouse held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables passed to [`Warehouse::analyze`], in call order
    pub async fn analyzed_tables(&self) -> Vec<&'static str> {
        self.state.lock().await.analyzed.clone()
    }

    /// Stored copy of a locale
    pub async fn locale(&self, id: i64) -> Option<LocaleRecord> {
        let state = self.state.lock().await;
        if state.locale_exists(id) {
            Some(state.locales[(id - 1) as usize].clone())
        } else {
            None
        }
    }

    pub async fn geo_feature(&self, level: GeoLevel, geoid: &str) -> Option<GeoFeature> {
        let state = self.state.lock().await;
        state.geo.get(&level).and_then(|m| m.get(geoid)).cloned()
    }

    pub async fn observations(&self, domain: Domain) -> Vec<ObservationRow> {
        let state = self.state.lock().await;
        state.obs.get(&domain).cloned().unwrap_or_default()
    }

    pub async fn npis(&self, disease: &str) -> Vec<NpiRecord> {
        let state = self.state.lock().await;
        state.npis.get(disease).cloned().unwrap_or_default()
    }

    pub async fn vaccinations(&self, vaccine: &str) -> Vec<VaxRecord> {
        let state = self.state.lock().await;
        state.vax.get(vaccine).cloned().unwrap_or_default()
    }
}

fn check_population(state: &State, batch: &PopulationBatch) -> Result<()> {
    let places = batch
        .schools
        .iter()
        .map(|r| &r.place)
        .chain(batch.hospitals.iter().map(|r| &r.place))
        .chain(batch.households.iter().map(|r| &r.place))
        .chain(batch.group_quarters.iter().map(|r| &r.place))
        .chain(batch.workplaces.iter().map(|r| &r.place));
    for place in places {
        state.require_locales(std::iter::once(place.st_id).chain(place.co_id), "pop")?;
    }

    fn unique(ids: impl Iterator<Item = i64>, table: &str) -> Result<HashSet<i64>> {
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id) {
                return Err(IngestError::Internal(format!(
                    "duplicate key {} in {}",
                    id, table
                )));
            }
        }
        Ok(seen)
    }

    unique(batch.schools.iter().map(|r| r.id), "pop.school")?;
    unique(batch.hospitals.iter().map(|r| r.id), "pop.hospital")?;
    unique(batch.workplaces.iter().map(|r| r.id), "pop.workplace")?;
    unique(batch.persons.iter().map(|r| r.id), "pop.person")?;
    unique(batch.gq_persons.iter().map(|r| r.id), "pop.gq_person")?;
    let households = unique(batch.households.iter().map(|r| r.id), "pop.household")?;
    let gqs = unique(batch.group_quarters.iter().map(|r| r.id), "pop.gq")?;

    if let Some(p) = batch.persons.iter().find(|p| !households.contains(&p.household_id)) {
        return Err(IngestError::ReferentialIntegrity(format!(
            "person {} references missing household {}",
            p.id, p.household_id
        )));
    }
    if let Some(p) = batch.gq_persons.iter().find(|p| !gqs.contains(&p.gq_id)) {
        return Err(IngestError::ReferentialIntegrity(format!(
            "group quarters person {} references missing group quarters {}",
            p.id, p.gq_id
        )));
    }
    Ok(())
}

fn upsert_into(state: &mut State, locales: &[LocaleRecord]) -> Vec<i64> {
    let mut ids = Vec::with_capacity(locales.len());
    for record in locales {
        let existing = state
            .locales
            .iter()
            .position(|l| l.name_key() == record.name_key());
        let id = match existing {
            Some(i) => {
                state.locales[i].fill_from(record);
                i as i64 + 1
            },
            None => {
                state.locales.push(record.clone());
                state.locales.len() as i64
            },
        };
        ids.push(id);
    }
    ids
}

/// New rows of a layer keyed by geoid; geoids are unique across states
fn check_layer(
    state: &State,
    level: GeoLevel,
    scope: &Fips,
    features: &[GeoFeature],
) -> Result<BTreeMap<String, GeoFeature>> {
    let table = state.geo.get(&level);
    let mut incoming = BTreeMap::new();
    for feature in features {
        let clash = table
            .and_then(|t| t.get(&feature.geoid))
            .map(|f| f.statefp != scope.as_str())
            .unwrap_or(false);
        if clash || incoming.insert(feature.geoid.clone(), feature.clone()).is_some() {
            return Err(IngestError::Internal(format!(
                "duplicate geoid {} in {}",
                feature.geoid,
                level.table()
            )));
        }
    }
    Ok(incoming)
}

fn apply_layer(
    state: &mut State,
    level: GeoLevel,
    scope: &Fips,
    incoming: BTreeMap<String, GeoFeature>,
) -> u64 {
    let table = state.geo.entry(level).or_default();
    table.retain(|_, f| f.statefp != scope.as_str());
    let inserted = incoming.len() as u64;
    table.extend(incoming);
    debug!(table = level.table(), scope = %scope, inserted, "Replaced features");
    inserted
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert_locales(&self, locales: &[LocaleRecord]) -> Result<Vec<i64>> {
        let mut state = self.state.lock().await;
        Ok(upsert_into(&mut state, locales))
    }

    async fn us_locale_ids(&self, fips: &[String]) -> Result<HashMap<String, i64>> {
        let state = self.state.lock().await;
        let wanted: HashSet<&str> = fips.iter().map(String::as_str).collect();
        let mut found = HashMap::new();
        for (i, locale) in state.locales.iter().enumerate() {
            if locale.admin0.as_deref() != Some("US") {
                continue;
            }
            if let Some(code) = locale.fips.as_deref() {
                if wanted.contains(code) {
                    found.entry(code.to_string()).or_insert(i as i64 + 1);
                }
            }
        }
        Ok(found)
    }

    async fn count_locales(&self) -> Result<u64> {
        Ok(self.state.lock().await.locales.len() as u64)
    }

    async fn replace_geo_features(
        &self,
        level: GeoLevel,
        scope: &Fips,
        features: &[GeoFeature],
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let incoming = check_layer(&state, level, scope, features)?;
        Ok(apply_layer(&mut state, level, scope, incoming))
    }

    async fn replace_geo_partition(
        &self,
        scope: &Fips,
        layers: &[(GeoLevel, Vec<GeoFeature>)],
        locales: &[LocaleRecord],
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let checked = layers
            .iter()
            .map(|(level, features)| Ok((*level, check_layer(&state, *level, scope, features)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut inserted = 0;
        for (level, incoming) in checked {
            inserted += apply_layer(&mut state, level, scope, incoming);
        }
        upsert_into(&mut state, locales);
        Ok(inserted)
    }

    async fn delete_geo_features(&self, level: GeoLevel, scope: &Fips) -> Result<u64> {
        let mut state = self.state.lock().await;
        let Some(table) = state.geo.get_mut(&level) else {
            return Ok(0);
        };
        let before = table.len();
        table.retain(|_, f| f.statefp != scope.as_str());
        Ok((before - table.len()) as u64)
    }

    async fn count_geo_features(&self, level: GeoLevel, scope: Option<&Fips>) -> Result<u64> {
        let state = self.state.lock().await;
        let Some(table) = state.geo.get(&level) else {
            return Ok(0);
        };
        Ok(table
            .values()
            .filter(|f| scope.map(|s| f.statefp == s.as_str()).unwrap_or(true))
            .count() as u64)
    }

    async fn replace_population(
        &self,
        scope: &Fips,
        batch: &PopulationBatch,
    ) -> Result<PopulationCounts> {
        let mut state = self.state.lock().await;
        check_population(&state, batch)?;
        state.pop.insert(scope.to_string(), batch.clone());
        Ok(batch.counts())
    }

    async fn delete_population(&self, scope: &Fips) -> Result<PopulationCounts> {
        let mut state = self.state.lock().await;
        Ok(state
            .pop
            .remove(scope.as_str())
            .map(|b| b.counts())
            .unwrap_or_default())
    }

    async fn count_population(&self, entity: PopEntity, scope: Option<&Fips>) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .pop
            .iter()
            .filter(|(fips, _)| scope.map(|s| s.as_str() == fips.as_str()).unwrap_or(true))
            .map(|(_, batch)| batch.counts().get(entity))
            .sum())
    }

    async fn count_orphaned_persons(&self) -> Result<u64> {
        let state = self.state.lock().await;
        let mut orphans = 0;
        for batch in state.pop.values() {
            let households: HashSet<i64> = batch.households.iter().map(|h| h.id).collect();
            let gqs: HashSet<i64> = batch.group_quarters.iter().map(|g| g.id).collect();
            orphans += batch
                .persons
                .iter()
                .filter(|p| !households.contains(&p.household_id))
                .count() as u64;
            orphans += batch
                .gq_persons
                .iter()
                .filter(|p| !gqs.contains(&p.gq_id))
                .count() as u64;
        }
        Ok(orphans)
    }

    async fn replace_disease_dynamics(&self, disease: &str, rows: &[DynRow]) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.require_locales(rows.iter().map(|r| r.locale_id), "dis.dyn")?;

        let mut table = BTreeMap::new();
        for row in rows {
            if table.insert((row.locale_id, row.day), row.clone()).is_some() {
                return Err(IngestError::Internal(format!(
                    "duplicate observation for locale {} on {}",
                    row.locale_id, row.day
                )));
            }
        }
        let inserted = table.len() as u64;
        state.dyn_rows.insert(disease.to_string(), table);
        Ok(inserted)
    }

    async fn delete_disease_dynamics(&self, disease: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        Ok(state
            .dyn_rows
            .remove(disease)
            .map(|t| t.len() as u64)
            .unwrap_or(0))
    }

    async fn disease_dynamics(&self, disease: &str) -> Result<Vec<DynRow>> {
        let state = self.state.lock().await;
        Ok(state
            .dyn_rows
            .get(disease)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn count_disease_dynamics(&self, disease: &str) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.dyn_rows.get(disease).map(|t| t.len() as u64).unwrap_or(0))
    }

    async fn replace_npis(&self, disease: &str, records: &[NpiRecord]) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.require_locales(records.iter().map(|r| r.locale_id), "npi.npi")?;
        let mut keys = HashSet::new();
        for r in records {
            if !keys.insert((r.locale_id, r.npi_type.as_str(), r.begin_date)) {
                return Err(IngestError::Internal(format!(
                    "duplicate intervention {} for locale {} on {}",
                    r.npi_type, r.locale_id, r.begin_date
                )));
            }
        }
        state.npis.insert(disease.to_string(), records.to_vec());
        Ok(records.len() as u64)
    }

    async fn delete_npis(&self, disease: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        Ok(state.npis.remove(disease).map(|v| v.len() as u64).unwrap_or(0))
    }

    async fn count_npis(&self, disease: &str) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.npis.get(disease).map(|v| v.len() as u64).unwrap_or(0))
    }

    async fn replace_vaccinations(&self, vaccine: &str, records: &[VaxRecord]) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.require_locales(records.iter().map(|r| r.locale_id), "vax.vax")?;
        state.vax.insert(vaccine.to_string(), records.to_vec());
        Ok(records.len() as u64)
    }

    async fn delete_vaccinations(&self, vaccine: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        Ok(state.vax.remove(vaccine).map(|v| v.len() as u64).unwrap_or(0))
    }

    async fn count_vaccinations(&self, vaccine: &str) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.vax.get(vaccine).map(|v| v.len() as u64).unwrap_or(0))
    }

    async fn replace_observations(
        &self,
        domain: Domain,
        scope: &Fips,
        rows: &[ObservationRow],
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.require_locales(rows.iter().map(|r| r.locale_id), "obs.observation")?;

        let State { locales, obs, .. } = &mut *state;
        let within = |id: i64| {
            id >= 1
                && locales
                    .get((id - 1) as usize)
                    .and_then(|l| l.fips.as_deref())
                    .map(|f| f.starts_with(scope.as_str()))
                    .unwrap_or(false)
        };
        let table = obs.entry(domain).or_default();
        table.retain(|r| !within(r.locale_id));
        table.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn delete_observations(&self, domain: Domain, scope: &Fips) -> Result<u64> {
        let mut state = self.state.lock().await;
        let Some(table) = state.obs.remove(&domain) else {
            return Ok(0);
        };
        let (removed, kept): (Vec<_>, Vec<_>) = table
            .into_iter()
            .partition(|r| state.locale_within(r.locale_id, scope));
        state.obs.insert(domain, kept);
        Ok(removed.len() as u64)
    }

    async fn count_observations(&self, domain: Domain, scope: Option<&Fips>) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .obs
            .get(&domain)
            .map(|rows| {
                rows.iter()
                    .filter(|r| scope.map(|s| state.locale_within(r.locale_id, s)).unwrap_or(true))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn analyze(&self, tables: &[&'static str]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.analyzed.extend_from_slice(tables);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{Household, Person, Placement};

    #[tokio::test]
    async fn test_upsert_locales_matches_name_hierarchy() {
        let wh = MemoryWarehouse::new();
        let first = wh
            .upsert_locales(&[LocaleRecord {
                admin0: Some("US".into()),
                admin1: Some("Alaska".into()),
                ..Default::default()
            }])
            .await
            .unwrap();
        let second = wh
            .upsert_locales(&[LocaleRecord::us("02", "Alaska", None)])
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(wh.count_locales().await.unwrap(), 1);
        assert_eq!(wh.locale(first[0]).await.unwrap().fips.as_deref(), Some("02"));

        let ids = wh.us_locale_ids(&["02".into(), "04".into()]).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids["02"], first[0]);
    }

    #[tokio::test]
    async fn test_population_rejects_orphans_atomically() {
        let wh = MemoryWarehouse::new();
        let st = wh
            .upsert_locales(&[LocaleRecord::us("02", "Alaska", None)])
            .await
            .unwrap()[0];
        let scope = Fips::parse("02").unwrap();
        let place = Placement {
            st_id: st,
            co_id: None,
            lat: None,
            long: None,
        };
        let household = Household {
            id: 1,
            stcotrbg: "020200001001".into(),
            race: 1,
            income: 50_000,
            place,
        };
        let person = |id, household_id| Person {
            id,
            household_id,
            age: 30,
            sex: "F".into(),
            race: 1,
            relate: 0,
            school_id: None,
            workplace_id: None,
        };

        let good = PopulationBatch {
            households: vec![household.clone()],
            persons: vec![person(1, 1)],
            ..Default::default()
        };
        wh.replace_population(&scope, &good).await.unwrap();

        let bad = PopulationBatch {
            households: vec![household],
            persons: vec![person(1, 1), person(2, 99)],
            ..Default::default()
        };
        let err = wh.replace_population(&scope, &bad).await.unwrap_err();
        assert!(matches!(err, IngestError::ReferentialIntegrity(_)));
        assert_eq!(wh.count_population(PopEntity::Person, Some(&scope)).await.unwrap(), 1);
        assert_eq!(wh.count_orphaned_persons().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dynamics_require_locales() {
        let wh = MemoryWarehouse::new();
        let row = DynRow {
            locale_id: 7,
            day: NaiveDate::from_ymd_opt(2020, 1, 22).unwrap(),
            day_i: 0,
            n_conf: Some(1),
            n_dead: None,
            n_rec: None,
            n_test: None,
            n_vax: None,
        };
        let err = wh.replace_disease_dynamics("c19", &[row]).await.unwrap_err();
        assert!(matches!(err, IngestError::ReferentialIntegrity(_)));
    }
}
