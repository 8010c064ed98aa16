//! LocaleDB Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Locale-partitioned ingestion of geography, synthetic population and
//! epidemiological data into a PostgreSQL/PostGIS warehouse.
//!
//! # Pipeline
//!
//! For every partition (one U.S. state, or one disease/vaccine identifier):
//!
//! 1. [`resolver`] turns a user token into partitions
//! 2. [`catalog`] lists the remote resources of the partition, in order
//! 3. [`fetcher`] makes each resource available in the local cache
//! 4. [`stager`] unpacks it into the shared scratch workspace
//! 5. [`loader`] parses the workspace and writes through [`warehouse`]
//!
//! [`lifecycle::LifecycleManager`] drives the steps and produces one
//! [`report::PartitionReport`] per partition.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use localedb_common::types::Domain;
//! use localedb_ingest::{
//!     geometry::AutoIngester, Catalog, Fetcher, IngestConfig, LifecycleManager,
//!     LoaderContext, PartitionTable, PgWarehouse, Resolver, Stager, Warehouse,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let warehouse = Arc::new(PgWarehouse::connect(&config.database).await?);
//!     warehouse.ensure_schema().await?;
//!
//!     let manager = LifecycleManager::new(
//!         Resolver::new(PartitionTable::us_states()?),
//!         Catalog::new(config.sources.clone()),
//!         Fetcher::new(&config.paths.cache_dir, &config.fetch)?,
//!         Stager::new(&config.paths.scratch_dir),
//!         LoaderContext {
//!             warehouse,
//!             geometry: Arc::new(AutoIngester::new(config.ogr2ogr.clone())),
//!             disease_epoch: config.disease_epoch,
//!         },
//!     );
//!     let reports = manager.load(Domain::Geo, Some("AK"), false).await?;
//!     println!("{}", localedb_ingest::report::render_summary(&reports));
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod geometry;
pub mod lifecycle;
pub mod loader;
pub mod models;
pub mod report;
pub mod resolver;
pub mod stager;
pub mod warehouse;

pub use catalog::{Catalog, CatalogEntry, PartitionKey};
pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use fetcher::Fetcher;
pub use lifecycle::{AssumeYes, Confirmer, LifecycleManager, RemovalScope};
pub use loader::LoaderContext;
pub use resolver::{PartitionTable, Resolver, StatePartition};
pub use stager::Stager;
pub use warehouse::{MemoryWarehouse, PgWarehouse, Warehouse};
