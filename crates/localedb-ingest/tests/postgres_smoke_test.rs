//! PostgreSQL/PostGIS warehouse smoke test
//!
//! Needs a PostGIS database that may be wiped:
//!
//! ```bash
//! DATABASE_URL=postgresql://postgres:sa@localhost:5433/localedb_test \
//!     cargo test -p localedb-ingest --test postgres_smoke_test -- --ignored
//! ```

mod common;

use anyhow::Result;
use localedb_common::types::{Domain, Fips};
use localedb_ingest::config::DatabaseConfig;
use localedb_ingest::models::{GeoLevel, LocaleRecord, PopEntity};
use localedb_ingest::{IngestError, PgWarehouse, Warehouse};

async fn warehouse() -> Result<PgWarehouse> {
    let url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://postgres:sa@localhost:5433/localedb_test".to_string());
    let wh = PgWarehouse::connect(&DatabaseConfig {
        url,
        connect_timeout_secs: 5,
    })
    .await?;
    wh.ensure_schema().await?;
    // twice: migrations are idempotent
    wh.ensure_schema().await?;
    Ok(wh)
}

#[tokio::test]
#[ignore = "requires PostgreSQL with PostGIS (DATABASE_URL)"]
async fn test_locale_upsert_and_geo_replace() -> Result<()> {
    let wh = warehouse().await?;
    let ak = Fips::parse("02")?;
    wh.delete_geo_features(GeoLevel::State, &ak).await?;

    let ids = wh
        .upsert_locales(&[LocaleRecord::us("02", "Alaska", None)])
        .await?;
    let again = wh
        .upsert_locales(&[LocaleRecord::us("02", "Alaska", None)])
        .await?;
    assert_eq!(ids, again);

    let row = common::layer_csv("02", &[common::Feature::new("02", "Alaska", 63.3, -152.2)]);
    let rows = localedb_ingest::geometry::parse_wkt_csv(row.as_bytes(), "st.csv")?;
    let features: Vec<_> = rows
        .into_iter()
        .map(localedb_ingest::loader::geo::feature_from_row)
        .collect::<std::result::Result<_, _>>()
        .map_err(anyhow::Error::msg)?;

    for _ in 0..2 {
        wh.replace_geo_features(GeoLevel::State, &ak, &features).await?;
    }
    assert_eq!(wh.count_geo_features(GeoLevel::State, Some(&ak)).await?, 1);

    wh.analyze(&[GeoLevel::State.table(), "main.locale"]).await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL with PostGIS (DATABASE_URL)"]
async fn test_population_without_locales_rolls_back() -> Result<()> {
    let wh = warehouse().await?;
    let wy = Fips::parse("56")?;
    wh.delete_population(&wy).await?;

    let batch = localedb_ingest::models::PopulationBatch {
        persons: vec![localedb_ingest::models::Person {
            id: 1,
            household_id: 404,
            age: 30,
            sex: "F".into(),
            race: 1,
            relate: 0,
            school_id: None,
            workplace_id: None,
        }],
        ..Default::default()
    };

    let err = wh.replace_population(&wy, &batch).await.unwrap_err();
    assert!(matches!(err, IngestError::ReferentialIntegrity(_)));
    assert_eq!(wh.count_population(PopEntity::Person, Some(&wy)).await?, 0);
    assert_eq!(wh.count_observations(Domain::Weather, Some(&wy)).await?, 0);
    Ok(())
}
