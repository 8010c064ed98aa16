//! PostgreSQL + PostGIS warehouse
//!
//! One pooled connection per invocation. Identifiers interpolated into SQL
//! come only from closed enums (`GeoLevel`, `PopEntity`, `Domain`); every
//! value is a bound parameter.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info};

use localedb_common::types::{Domain, Fips};

use super::Warehouse;
use crate::config::DatabaseConfig;
use crate::error::{IngestError, Result};
use crate::models::{
    DynRow, GeoFeature, GeoLevel, LocaleRecord, NpiRecord, ObservationRow, PopEntity,
    PopulationBatch, PopulationCounts, VaxRecord,
};

/// Rows per multi-row INSERT (stays well under the bind-parameter limit)
pub const INSERT_CHUNK_SIZE: usize = 1000;

/// Tables carrying a point location derived from lat/long
const LOCATED: [PopEntity; 5] = [
    PopEntity::School,
    PopEntity::Hospital,
    PopEntity::Household,
    PopEntity::GroupQuarters,
    PopEntity::Workplace,
];

type Tx<'c> = Transaction<'c, Postgres>;

pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    /// Connect with a single-connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| IngestError::StoreUnavailable(e.to_string()))?;

        info!("Warehouse connection established");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn count(&self, sql: &str, scope: Option<&str>) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(sql).bind(scope).fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }
}

/// Multi-row INSERT of `rows` in chunks
async fn insert_chunks<T, F>(tx: &mut Tx<'_>, head: &str, rows: &[T], push: F) -> Result<u64>
where
    F: Fn(Separated<'_, '_, Postgres, &'static str>, &T),
{
    let mut inserted = 0;
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(head);
        qb.push_values(chunk, |b, row| push(b, row));
        inserted += qb.build().execute(&mut **tx).await?.rows_affected();
    }
    Ok(inserted)
}

async fn lookup_id(tx: &mut Tx<'_>, table: &'static str, name: &str) -> Result<i32> {
    let sql = format!(
        "INSERT INTO {} (name) VALUES ($1) \
         ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING id",
        table
    );
    let id: i32 = sqlx::query_scalar(&sql).bind(name).fetch_one(&mut **tx).await?;
    Ok(id)
}

async fn lookup_ids(
    tx: &mut Tx<'_>,
    table: &'static str,
    names: impl IntoIterator<Item = &str>,
) -> Result<HashMap<String, i32>> {
    let mut ids = HashMap::new();
    for name in names.into_iter().collect::<BTreeSet<_>>() {
        ids.insert(name.to_string(), lookup_id(tx, table, name).await?);
    }
    Ok(ids)
}

/// Match locales by name hierarchy, filling blanks, or insert them
async fn upsert_locales_tx(tx: &mut Tx<'_>, locales: &[LocaleRecord]) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(locales.len());

    for l in locales {
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM main.locale \
             WHERE admin0 IS NOT DISTINCT FROM $1 \
               AND admin1 IS NOT DISTINCT FROM $2 \
               AND admin2 IS NOT DISTINCT FROM $3",
        )
        .bind(&l.admin0)
        .bind(&l.admin1)
        .bind(&l.admin2)
        .fetch_optional(&mut **tx)
        .await?;

        let id = match existing {
            Some(id) => {
                sqlx::query(
                    "UPDATE main.locale SET \
                        iso2 = COALESCE(iso2, $2), iso3 = COALESCE(iso3, $3), \
                        iso_num = COALESCE(iso_num, $4), fips = COALESCE(fips, $5), \
                        lat = COALESCE(lat, $6), long = COALESCE(long, $7), \
                        pop = COALESCE(pop, $8) \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(&l.iso2)
                .bind(&l.iso3)
                .bind(l.iso_num)
                .bind(&l.fips)
                .bind(l.lat)
                .bind(l.long)
                .bind(l.population)
                .execute(&mut **tx)
                .await?;
                id
            },
            None => {
                sqlx::query_scalar(
                    "INSERT INTO main.locale \
                        (iso2, iso3, iso_num, fips, admin0, admin1, admin2, lat, long, pop) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
                )
                .bind(&l.iso2)
                .bind(&l.iso3)
                .bind(l.iso_num)
                .bind(&l.fips)
                .bind(&l.admin0)
                .bind(&l.admin1)
                .bind(&l.admin2)
                .bind(l.lat)
                .bind(l.long)
                .bind(l.population)
                .fetch_one(&mut **tx)
                .await?
            },
        };
        ids.push(id);
    }

    Ok(ids)
}

/// Replace the rows of one layer for a state
async fn replace_layer_tx(
    tx: &mut Tx<'_>,
    level: GeoLevel,
    scope: &Fips,
    features: &[GeoFeature],
) -> Result<u64> {
    let deleted = sqlx::query(&format!("DELETE FROM {} WHERE statefp = $1", level.table()))
        .bind(scope.as_str())
        .execute(&mut **tx)
        .await?
        .rows_affected();

    let head = format!(
        "INSERT INTO {} (geoid, statefp, countyfp, name, aland, awater, intptlat, intptlon, attrs, geom) ",
        level.table()
    );
    let inserted = insert_chunks(tx, &head, features, |mut b, f| {
        b.push_bind(f.geoid.clone())
            .push_bind(f.statefp.clone())
            .push_bind(f.countyfp.clone())
            .push_bind(f.name.clone())
            .push_bind(f.aland)
            .push_bind(f.awater)
            .push_bind(f.intptlat)
            .push_bind(f.intptlon)
            .push_bind(f.attrs.clone())
            .push("ST_Multi(ST_GeomFromText(")
            .push_bind_unseparated(f.wkt.clone())
            .push_unseparated(", 4269))");
    })
    .await?;

    debug!(table = level.table(), scope = %scope, deleted, inserted, "Replaced features");
    Ok(inserted)
}

async fn count_population_tx(tx: &mut Tx<'_>, scope: &Fips) -> Result<PopulationCounts> {
    let mut n = [0u64; 7];
    for (slot, entity) in n.iter_mut().zip(PopEntity::ALL) {
        let sql = format!(
            "SELECT COUNT(*) FROM {} t JOIN main.locale l ON l.id = t.st_id WHERE l.fips = $1",
            entity.table()
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(scope.as_str())
            .fetch_one(&mut **tx)
            .await?;
        *slot = count.max(0) as u64;
    }
    Ok(PopulationCounts {
        schools: n[0],
        hospitals: n[1],
        households: n[2],
        group_quarters: n[3],
        workplaces: n[4],
        persons: n[5],
        gq_persons: n[6],
    })
}

/// Delete a state's population; members go with their households
async fn delete_population_tx(tx: &mut Tx<'_>, scope: &Fips) -> Result<PopulationCounts> {
    let counts = count_population_tx(tx, scope).await?;
    for entity in LOCATED {
        let sql = format!(
            "DELETE FROM {} t USING main.locale l WHERE t.st_id = l.id AND l.fips = $1",
            entity.table()
        );
        sqlx::query(&sql)
            .bind(scope.as_str())
            .execute(&mut **tx)
            .await?;
    }
    Ok(counts)
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| IngestError::from(sqlx::Error::Migrate(Box::new(e))))?;
        debug!("Schema migrations applied");
        Ok(())
    }

    async fn upsert_locales(&self, locales: &[LocaleRecord]) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let ids = upsert_locales_tx(&mut tx, locales).await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn us_locale_ids(&self, fips: &[String]) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT fips, MIN(id) FROM main.locale \
             WHERE admin0 = 'US' AND fips = ANY($1) GROUP BY fips",
        )
        .bind(fips)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn count_locales(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM main.locale WHERE $1::text IS NULL", None)
            .await
    }

    async fn replace_geo_features(
        &self,
        level: GeoLevel,
        scope: &Fips,
        features: &[GeoFeature],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let inserted = replace_layer_tx(&mut tx, level, scope, features).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn replace_geo_partition(
        &self,
        scope: &Fips,
        layers: &[(GeoLevel, Vec<GeoFeature>)],
        locales: &[LocaleRecord],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for (level, features) in layers {
            inserted += replace_layer_tx(&mut tx, *level, scope, features).await?;
        }
        upsert_locales_tx(&mut tx, locales).await?;
        tx.commit().await?;
        info!(scope = %scope, layers = layers.len(), inserted, "Geography partition committed");
        Ok(inserted)
    }

    async fn delete_geo_features(&self, level: GeoLevel, scope: &Fips) -> Result<u64> {
        let deleted = sqlx::query(&format!("DELETE FROM {} WHERE statefp = $1", level.table()))
            .bind(scope.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    async fn count_geo_features(&self, level: GeoLevel, scope: Option<&Fips>) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE $1::text IS NULL OR statefp = $1",
            level.table()
        );
        self.count(&sql, scope.map(Fips::as_str)).await
    }

    async fn replace_population(
        &self,
        scope: &Fips,
        batch: &PopulationBatch,
    ) -> Result<PopulationCounts> {
        let mut tx = self.pool.begin().await?;
        let previous = delete_population_tx(&mut tx, scope).await?;

        let counts = PopulationCounts {
            schools: insert_chunks(
                &mut tx,
                "INSERT INTO pop.school (st_id, id, co_id, stco, lat, long) ",
                &batch.schools,
                |mut b, r| {
                    b.push_bind(r.place.st_id)
                        .push_bind(r.id)
                        .push_bind(r.place.co_id)
                        .push_bind(r.stco.clone())
                        .push_bind(r.place.lat)
                        .push_bind(r.place.long);
                },
            )
            .await?,
            hospitals: insert_chunks(
                &mut tx,
                "INSERT INTO pop.hospital (st_id, id, co_id, workers, physicians, beds, lat, long) ",
                &batch.hospitals,
                |mut b, r| {
                    b.push_bind(r.place.st_id)
                        .push_bind(r.id)
                        .push_bind(r.place.co_id)
                        .push_bind(r.workers)
                        .push_bind(r.physicians)
                        .push_bind(r.beds)
                        .push_bind(r.place.lat)
                        .push_bind(r.place.long);
                },
            )
            .await?,
            households: insert_chunks(
                &mut tx,
                "INSERT INTO pop.household (st_id, id, co_id, stcotrbg, race, income, lat, long) ",
                &batch.households,
                |mut b, r| {
                    b.push_bind(r.place.st_id)
                        .push_bind(r.id)
                        .push_bind(r.place.co_id)
                        .push_bind(r.stcotrbg.clone())
                        .push_bind(r.race)
                        .push_bind(r.income)
                        .push_bind(r.place.lat)
                        .push_bind(r.place.long);
                },
            )
            .await?,
            group_quarters: insert_chunks(
                &mut tx,
                "INSERT INTO pop.gq (st_id, id, co_id, type, stcotrbg, persons, lat, long) ",
                &batch.group_quarters,
                |mut b, r| {
                    b.push_bind(r.place.st_id)
                        .push_bind(r.id)
                        .push_bind(r.place.co_id)
                        .push_bind(r.gq_type.clone())
                        .push_bind(r.stcotrbg.clone())
                        .push_bind(r.persons)
                        .push_bind(r.place.lat)
                        .push_bind(r.place.long);
                },
            )
            .await?,
            workplaces: insert_chunks(
                &mut tx,
                "INSERT INTO pop.workplace (st_id, id, co_id, lat, long) ",
                &batch.workplaces,
                |mut b, r| {
                    b.push_bind(r.place.st_id)
                        .push_bind(r.id)
                        .push_bind(r.place.co_id)
                        .push_bind(r.place.lat)
                        .push_bind(r.place.long);
                },
            )
            .await?,
            persons: 0,
            gq_persons: 0,
        };

        // Members reference their owner within the same state
        let st_id = batch
            .households
            .first()
            .map(|h| h.place.st_id)
            .or_else(|| batch.group_quarters.first().map(|g| g.place.st_id));

        let persons = match st_id {
            Some(st_id) => {
                insert_chunks(
                    &mut tx,
                    "INSERT INTO pop.person (st_id, id, household_id, age, sex, race, relate, school_id, workplace_id) ",
                    &batch.persons,
                    |mut b, r| {
                        b.push_bind(st_id)
                            .push_bind(r.id)
                            .push_bind(r.household_id)
                            .push_bind(r.age)
                            .push_bind(r.sex.clone())
                            .push_bind(r.race)
                            .push_bind(r.relate)
                            .push_bind(r.school_id)
                            .push_bind(r.workplace_id);
                    },
                )
                .await?
            },
            None if batch.persons.is_empty() && batch.gq_persons.is_empty() => 0,
            None => {
                return Err(IngestError::ReferentialIntegrity(format!(
                    "population of {} has members but no households or group quarters",
                    scope
                )))
            },
        };

        let gq_persons = match st_id {
            Some(st_id) => {
                insert_chunks(
                    &mut tx,
                    "INSERT INTO pop.gq_person (st_id, id, gq_id, age, sex) ",
                    &batch.gq_persons,
                    |mut b, r| {
                        b.push_bind(st_id)
                            .push_bind(r.id)
                            .push_bind(r.gq_id)
                            .push_bind(r.age)
                            .push_bind(r.sex.clone());
                    },
                )
                .await?
            },
            None => 0,
        };

        for entity in LOCATED {
            let sql = format!(
                "UPDATE {} t SET coords = ST_Transform(ST_SetSRID(ST_MakePoint(t.long, t.lat), 4326), 4269) \
                 FROM main.locale l \
                 WHERE t.st_id = l.id AND l.fips = $1 AND t.lat IS NOT NULL AND t.long IS NOT NULL",
                entity.table()
            );
            sqlx::query(&sql)
                .bind(scope.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let counts = PopulationCounts {
            persons,
            gq_persons,
            ..counts
        };
        info!(
            scope = %scope,
            previous = previous.total(),
            households = counts.households,
            persons = counts.persons,
            "Population replaced"
        );
        Ok(counts)
    }

    async fn delete_population(&self, scope: &Fips) -> Result<PopulationCounts> {
        let mut tx = self.pool.begin().await?;
        let counts = delete_population_tx(&mut tx, scope).await?;
        tx.commit().await?;
        Ok(counts)
    }

    async fn count_population(&self, entity: PopEntity, scope: Option<&Fips>) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} t JOIN main.locale l ON l.id = t.st_id \
             WHERE $1::text IS NULL OR l.fips = $1",
            entity.table()
        );
        self.count(&sql, scope.map(Fips::as_str)).await
    }

    async fn count_orphaned_persons(&self) -> Result<u64> {
        self.count(
            "SELECT \
               (SELECT COUNT(*) FROM pop.person p WHERE NOT EXISTS \
                  (SELECT 1 FROM pop.household h WHERE h.st_id = p.st_id AND h.id = p.household_id)) + \
               (SELECT COUNT(*) FROM pop.gq_person p WHERE NOT EXISTS \
                  (SELECT 1 FROM pop.gq g WHERE g.st_id = p.st_id AND g.id = p.gq_id)) \
             WHERE $1::text IS NULL",
            None,
        )
        .await
    }

    async fn replace_disease_dynamics(&self, disease: &str, rows: &[DynRow]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let disease_id = lookup_id(&mut tx, "dis.disease", disease).await?;

        sqlx::query("DELETE FROM dis.dyn WHERE disease_id = $1")
            .bind(disease_id)
            .execute(&mut *tx)
            .await?;

        let inserted = insert_chunks(
            &mut tx,
            "INSERT INTO dis.dyn (disease_id, locale_id, day, day_i, n_conf, n_dead, n_rec, n_test, n_vax) ",
            rows,
            |mut b, r| {
                b.push_bind(disease_id)
                    .push_bind(r.locale_id)
                    .push_bind(r.day)
                    .push_bind(r.day_i)
                    .push_bind(r.n_conf)
                    .push_bind(r.n_dead)
                    .push_bind(r.n_rec)
                    .push_bind(r.n_test)
                    .push_bind(r.n_vax);
            },
        )
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn delete_disease_dynamics(&self, disease: &str) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM dis.dyn d USING dis.disease s WHERE d.disease_id = s.id AND s.name = $1",
        )
        .bind(disease)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }

    async fn disease_dynamics(&self, disease: &str) -> Result<Vec<DynRow>> {
        type Raw = (
            i64,
            NaiveDate,
            i32,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
        );
        let rows: Vec<Raw> = sqlx::query_as(
            "SELECT d.locale_id, d.day, d.day_i, d.n_conf, d.n_dead, d.n_rec, d.n_test, d.n_vax \
             FROM dis.dyn d JOIN dis.disease s ON s.id = d.disease_id \
             WHERE s.name = $1 ORDER BY d.locale_id, d.day",
        )
        .bind(disease)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(locale_id, day, day_i, n_conf, n_dead, n_rec, n_test, n_vax)| DynRow {
                    locale_id,
                    day,
                    day_i,
                    n_conf,
                    n_dead,
                    n_rec,
                    n_test,
                    n_vax,
                },
            )
            .collect())
    }

    async fn count_disease_dynamics(&self, disease: &str) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM dis.dyn d JOIN dis.disease s ON s.id = d.disease_id \
             WHERE s.name = $1",
            Some(disease),
        )
        .await
    }

    async fn replace_npis(&self, disease: &str, records: &[NpiRecord]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let disease_id = lookup_id(&mut tx, "dis.disease", disease).await?;
        let types = lookup_ids(&mut tx, "npi.type", records.iter().map(|r| r.npi_type.as_str()))
            .await?;

        sqlx::query("DELETE FROM npi.npi WHERE disease_id = $1")
            .bind(disease_id)
            .execute(&mut *tx)
            .await?;

        let inserted = insert_chunks(
            &mut tx,
            "INSERT INTO npi.npi (disease_id, locale_id, type_id, begin_date, end_date, \
             begin_citation, begin_note, end_citation, end_note) ",
            records,
            |mut b, r| {
                b.push_bind(disease_id)
                    .push_bind(r.locale_id)
                    .push_bind(types.get(&r.npi_type).copied())
                    .push_bind(r.begin_date)
                    .push_bind(r.end_date)
                    .push_bind(r.begin_citation.clone())
                    .push_bind(r.begin_note.clone())
                    .push_bind(r.end_citation.clone())
                    .push_bind(r.end_note.clone());
            },
        )
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn delete_npis(&self, disease: &str) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM npi.npi n USING dis.disease s WHERE n.disease_id = s.id AND s.name = $1",
        )
        .bind(disease)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }

    async fn count_npis(&self, disease: &str) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM npi.npi n JOIN dis.disease s ON s.id = n.disease_id \
             WHERE s.name = $1",
            Some(disease),
        )
        .await
    }

    async fn replace_vaccinations(&self, vaccine: &str, records: &[VaxRecord]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let ages = lookup_ids(&mut tx, "vax.age", records.iter().map(|r| r.age.as_str())).await?;
        let races = lookup_ids(&mut tx, "vax.race", records.iter().map(|r| r.race.as_str())).await?;

        sqlx::query("DELETE FROM vax.vax WHERE vaccine = $1")
            .bind(vaccine)
            .execute(&mut *tx)
            .await?;

        let inserted = insert_chunks(
            &mut tx,
            "INSERT INTO vax.vax (vaccine, locale_id, age_id, race_id, year_from, year_to, \
             month, estimate, ci, sample_size) ",
            records,
            |mut b, r| {
                b.push_bind(vaccine.to_string())
                    .push_bind(r.locale_id)
                    .push_bind(ages.get(&r.age).copied())
                    .push_bind(races.get(&r.race).copied())
                    .push_bind(r.year_from)
                    .push_bind(r.year_to)
                    .push_bind(r.month)
                    .push_bind(r.estimate)
                    .push_bind(r.ci.clone())
                    .push_bind(r.sample_size);
            },
        )
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn delete_vaccinations(&self, vaccine: &str) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM vax.vax WHERE vaccine = $1")
            .bind(vaccine)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    async fn count_vaccinations(&self, vaccine: &str) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM vax.vax WHERE vaccine = $1", Some(vaccine))
            .await
    }

    async fn replace_observations(
        &self,
        domain: Domain,
        scope: &Fips,
        rows: &[ObservationRow],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM obs.observation o USING main.locale l \
             WHERE o.locale_id = l.id AND o.domain = $1 AND l.fips LIKE $2",
        )
        .bind(domain.as_str())
        .bind(format!("{}%", scope))
        .execute(&mut *tx)
        .await?;

        let inserted = insert_chunks(
            &mut tx,
            "INSERT INTO obs.observation (domain, locale_id, day, metric, value) ",
            rows,
            |mut b, r| {
                b.push_bind(domain.as_str())
                    .push_bind(r.locale_id)
                    .push_bind(r.day)
                    .push_bind(r.metric.clone())
                    .push_bind(r.value);
            },
        )
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn delete_observations(&self, domain: Domain, scope: &Fips) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM obs.observation o USING main.locale l \
             WHERE o.locale_id = l.id AND o.domain = $1 AND l.fips LIKE $2",
        )
        .bind(domain.as_str())
        .bind(format!("{}%", scope))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }

    async fn count_observations(&self, domain: Domain, scope: Option<&Fips>) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM obs.observation o JOIN main.locale l ON l.id = o.locale_id \
             WHERE o.domain = $1 AND ($2::text IS NULL OR l.fips LIKE $2 || '%')",
        )
        .bind(domain.as_str())
        .bind(scope.map(Fips::as_str))
        .fetch_one(&self.pool)
        .await?;
        Ok(n.max(0) as u64)
    }

    async fn analyze(&self, tables: &[&'static str]) -> Result<()> {
        for table in tables {
            sqlx::query(&format!("ANALYZE {}", table))
                .execute(&self.pool)
                .await?;
        }
        debug!(tables = ?tables, "Statistics refreshed");
        Ok(())
    }
}
