//! Partition lifecycle
//!
//! [`LifecycleManager`] drives loads and removals one partition at a time.
//!
//! Load:
//! ```text
//! Idle -> Resolving -> Fetching -> Staging -> Loading -> Committing -> Done
//!             |           ^   |        |         |            |
//!             |           +---+--------+---------+            |
//!             +-> Done (already loaded)           Failed <----+
//! ```
//!
//! Entities run strictly in catalog order through the shared scratch
//! workspace. A non-critical entity failure is recorded and the next entity
//! is fetched; a critical failure, or any partition-fatal error, fails the
//! partition. Store outages end the invocation.
//!
//! Removal:
//! ```text
//! Idle -> Confirming -> Deleting -> Analyzing -> Done
//!              |            |           |
//!              +-> Cancelled +-> Failed <+
//! ```

use std::str::FromStr;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use localedb_common::types::Domain;

use crate::catalog::{Catalog, CatalogEntry, PartitionKey};
use crate::error::{IngestError, Result};
use crate::fetcher::Fetcher;
use crate::loader::{loader_for, DomainLoader, LoadOutcome, LoaderContext};
use crate::models::{GeoLevel, PopEntity};
use crate::report::{EntityFailure, PartitionReport, PartitionStatus};
use crate::resolver::Resolver;
use crate::stager::Stager;

/// States of a partition load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Resolving,
    Fetching,
    Staging,
    Loading,
    Committing,
    Done,
    Failed,
}

/// States of a partition removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalState {
    Idle,
    Confirming,
    Deleting,
    Analyzing,
    Done,
    Cancelled,
    Failed,
}

/// A state with a closed set of legal successors
pub trait Transition: Copy + std::fmt::Debug + PartialEq {
    fn allows(self, next: Self) -> bool;
}

impl Transition for LoadState {
    fn allows(self, next: Self) -> bool {
        use LoadState::*;
        matches!(
            (self, next),
            (Idle, Resolving)
                | (Resolving, Fetching | Committing | Done | Failed)
                | (Fetching, Staging | Fetching | Committing | Failed)
                | (Staging, Loading | Fetching | Committing | Failed)
                | (Loading, Fetching | Committing | Failed)
                | (Committing, Done | Failed)
        )
    }
}

impl Transition for RemovalState {
    fn allows(self, next: Self) -> bool {
        use RemovalState::*;
        matches!(
            (self, next),
            (Idle, Confirming)
                | (Confirming, Deleting | Cancelled)
                | (Deleting, Analyzing | Failed)
                | (Analyzing, Done | Failed)
        )
    }
}

/// Current state of one partition; rejects illegal transitions
#[derive(Debug)]
pub struct Tracker<S> {
    state: S,
    partition: String,
}

impl<S: Transition> Tracker<S> {
    pub fn new(initial: S, partition: impl Into<String>) -> Self {
        Self {
            state: initial,
            partition: partition.into(),
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn advance(&mut self, next: S) -> Result<()> {
        if !self.state.allows(next) {
            return Err(IngestError::Internal(format!(
                "illegal transition {:?} -> {:?} for partition {}",
                self.state, next, self.partition
            )));
        }
        debug!(partition = %self.partition, from = ?self.state, to = ?next, "Transition");
        self.state = next;
        Ok(())
    }
}

/// What `db rm` removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalScope {
    /// Tract, block-group and block rows of a state
    StateGeo,
    /// The synthetic population of a state
    StatePop,
    Disease,
    Npi,
    Vaccination,
    Observation(Domain),
}

impl RemovalScope {
    pub fn domain(self) -> Domain {
        match self {
            RemovalScope::StateGeo => Domain::Geo,
            RemovalScope::StatePop => Domain::Pop,
            RemovalScope::Disease => Domain::Disease,
            RemovalScope::Npi => Domain::Npi,
            RemovalScope::Vaccination => Domain::Vaccination,
            RemovalScope::Observation(domain) => domain,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RemovalScope::StateGeo => "state-geo",
            RemovalScope::StatePop => "state-pop",
            RemovalScope::Disease => "dis",
            RemovalScope::Npi => "npi",
            RemovalScope::Vaccination => "vax",
            RemovalScope::Observation(domain) => domain.as_str(),
        }
    }

    fn tables(self) -> Vec<&'static str> {
        match self {
            RemovalScope::StateGeo => GeoLevel::SUB_STATE.iter().map(|l| l.table()).collect(),
            RemovalScope::StatePop => PopEntity::ALL.iter().map(|e| e.table()).collect(),
            RemovalScope::Disease => vec!["dis.dyn"],
            RemovalScope::Npi => vec!["npi.npi"],
            RemovalScope::Vaccination => vec!["vax.vax"],
            RemovalScope::Observation(_) => vec!["obs.observation"],
        }
    }
}

impl FromStr for RemovalScope {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "state-geo" => Ok(RemovalScope::StateGeo),
            "state-pop" => Ok(RemovalScope::StatePop),
            "dis" | "disease" => Ok(RemovalScope::Disease),
            "npi" => Ok(RemovalScope::Npi),
            "vax" | "vaccination" => Ok(RemovalScope::Vaccination),
            "health" => Ok(RemovalScope::Observation(Domain::Health)),
            "weather" => Ok(RemovalScope::Observation(Domain::Weather)),
            "mobility" => Ok(RemovalScope::Observation(Domain::Mobility)),
            other => Err(IngestError::invalid_partition(
                other,
                "unknown removal scope (state-geo, state-pop, dis, npi, vax, health, weather, mobility)",
            )),
        }
    }
}

impl std::fmt::Display for RemovalScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guard in front of destructive operations
pub trait Confirmer {
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Confirms everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirmer for AssumeYes {
    fn confirm(&self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// How an entity failure affects the rest of the partition
enum Verdict {
    Continue,
    FailPartition,
}

/// Runs partition loads and removals sequentially
pub struct LifecycleManager {
    resolver: Resolver,
    catalog: Catalog,
    fetcher: Fetcher,
    stager: Stager,
    ctx: LoaderContext,
    run_id: Uuid,
}

impl LifecycleManager {
    pub fn new(
        resolver: Resolver,
        catalog: Catalog,
        fetcher: Fetcher,
        stager: Stager,
        ctx: LoaderContext,
    ) -> Self {
        Self {
            resolver,
            catalog,
            fetcher,
            stager,
            ctx,
            run_id: Uuid::new_v4(),
        }
    }

    /// Invocation id carried by every span of this manager
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Load every partition `token` names for `domain`.
    ///
    /// Returns one report per partition. Only invocation-fatal errors (and an
    /// unresolvable token) are returned as `Err`.
    pub async fn load(
        &self,
        domain: Domain,
        token: Option<&str>,
        force: bool,
    ) -> Result<Vec<PartitionReport>> {
        let keys = self.catalog.partitions(domain, token, &self.resolver)?;
        info!(domain = %domain, partitions = keys.len(), force, "Starting load");

        let mut reports = Vec::with_capacity(keys.len());
        for key in keys {
            let span = info_span!(
                "load",
                run = %self.run_id,
                domain = %domain,
                partition = %key
            );
            let report = self.load_partition(domain, &key, force).instrument(span).await?;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Load one partition
    pub async fn load_partition(
        &self,
        domain: Domain,
        key: &PartitionKey,
        force: bool,
    ) -> Result<PartitionReport> {
        let mut tracker = Tracker::new(LoadState::Idle, key.to_string());
        let mut report = PartitionReport::new(domain, key.to_string(), PartitionStatus::Failed);
        tracker.advance(LoadState::Resolving)?;

        if !force && self.already_loaded(domain, key).await? {
            tracker.advance(LoadState::Done)?;
            info!("Partition already loaded, skipping (use --force to reload)");
            report.status = PartitionStatus::AlreadyLoaded;
            return Ok(report);
        }

        let prepared = self
            .catalog
            .entries(domain, key)
            .and_then(|entries| Ok((entries, loader_for(domain, key, &self.ctx)?)));
        let (entries, mut loader) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracker.advance(LoadState::Failed)?;
                error!(error = %e, "Partition could not be prepared");
                report.failures.push(EntityFailure {
                    label: key.to_string(),
                    critical: true,
                    error: e.to_string(),
                });
                return Ok(report);
            },
        };

        let mut totals = LoadOutcome::default();
        for entry in &entries {
            match self.load_entity(&mut tracker, loader.as_mut(), entry).await {
                Ok(outcome) => totals += outcome,
                Err(e) => {
                    if e.is_invocation_fatal() {
                        return Err(e);
                    }
                    let verdict = classify(&e, entry);
                    report.failures.push(EntityFailure {
                        label: entry.label.clone(),
                        critical: entry.critical,
                        error: e.to_string(),
                    });
                    if let Verdict::FailPartition = verdict {
                        tracker.advance(LoadState::Failed)?;
                        error!(entity = %entry.label, error = %e, "Partition failed");
                        self.clear_workspace().await;
                        report.rows = totals.rows;
                        report.skipped = totals.skipped;
                        return Ok(report);
                    }
                    warn!(entity = %entry.label, error = %e, "Entity failed, continuing");
                },
            }
            self.clear_workspace().await;
        }

        tracker.advance(LoadState::Committing)?;
        match loader.finish().await {
            Ok(outcome) => totals += outcome,
            Err(e) => {
                if e.is_invocation_fatal() {
                    return Err(e);
                }
                tracker.advance(LoadState::Failed)?;
                error!(error = %e, "Partition failed while committing");
                report.failures.push(EntityFailure {
                    label: format!("commit {}", key),
                    critical: true,
                    error: e.to_string(),
                });
                report.rows = totals.rows;
                report.skipped = totals.skipped;
                return Ok(report);
            },
        }

        let tables = loader.tables();
        if let Err(e) = self.ctx.warehouse.analyze(&tables).await {
            if e.is_invocation_fatal() {
                return Err(e);
            }
            warn!(error = %e, "Statistics refresh failed");
            report.failures.push(EntityFailure {
                label: "analyze".to_string(),
                critical: false,
                error: e.to_string(),
            });
        }
        tracker.advance(LoadState::Done)?;

        report.rows = totals.rows;
        report.skipped = totals.skipped;
        report.status = if totals.skipped > 0 || !report.failures.is_empty() {
            PartitionStatus::CompletedWithSkips
        } else {
            PartitionStatus::Completed
        };
        info!(rows = totals.rows, skipped = totals.skipped, status = %report.status, "Partition done");
        Ok(report)
    }

    async fn load_entity(
        &self,
        tracker: &mut Tracker<LoadState>,
        loader: &mut dyn DomainLoader,
        entry: &CatalogEntry,
    ) -> Result<LoadOutcome> {
        tracker.advance(LoadState::Fetching)?;
        info!(entity = %entry.label, locator = %entry.locator, "Downloading");
        let fetched = self.fetcher.fetch(entry.domain, &entry.locator).await?;

        tracker.advance(LoadState::Staging)?;
        let workspace = self.stager.stage(&fetched.path).await?;

        tracker.advance(LoadState::Loading)?;
        info!(entity = %entry.label, "Loading");
        let outcome = loader.load(entry, &workspace).await?;
        info!(entity = %entry.label, rows = outcome.rows, skipped = outcome.skipped, "Done");
        Ok(outcome)
    }

    async fn clear_workspace(&self) {
        if let Err(e) = self.stager.clear().await {
            warn!(error = %e, "Failed to clear scratch workspace");
        }
    }

    /// Whether the partition's rows are present.
    ///
    /// Only geography (sub-state layers) and population are gated; other
    /// domains are always replaced.
    pub async fn already_loaded(&self, domain: Domain, key: &PartitionKey) -> Result<bool> {
        let Some(state) = key.state() else {
            return Ok(false);
        };
        let warehouse = &self.ctx.warehouse;
        match domain {
            Domain::Geo => {
                for level in GeoLevel::SUB_STATE {
                    if warehouse.count_geo_features(level, Some(&state.fips)).await? > 0 {
                        return Ok(true);
                    }
                }
                Ok(false)
            },
            Domain::Pop => Ok(warehouse
                .count_population(PopEntity::Household, Some(&state.fips))
                .await?
                > 0),
            _ => Ok(false),
        }
    }

    /// Remove every partition `token` names within `scope`.
    ///
    /// One confirmation covers the whole invocation; `force` skips it.
    pub async fn remove(
        &self,
        scope: RemovalScope,
        token: &str,
        force: bool,
        confirmer: &dyn Confirmer,
    ) -> Result<Vec<PartitionReport>> {
        let domain = scope.domain();
        let keys = self.catalog.partitions(domain, Some(token), &self.resolver)?;

        let confirmed = force || {
            let names = keys.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", ");
            confirmer.confirm(&format!("Remove {} data of: {}?", scope, names))?
        };

        let mut reports = Vec::with_capacity(keys.len());
        for key in keys {
            let span = info_span!(
                "remove",
                run = %self.run_id,
                scope = %scope,
                partition = %key
            );
            let report = self
                .remove_partition(scope, &key, confirmed)
                .instrument(span)
                .await?;
            reports.push(report);
        }
        Ok(reports)
    }

    async fn remove_partition(
        &self,
        scope: RemovalScope,
        key: &PartitionKey,
        confirmed: bool,
    ) -> Result<PartitionReport> {
        let mut tracker = Tracker::new(RemovalState::Idle, key.to_string());
        let mut report =
            PartitionReport::new(scope.domain(), key.to_string(), PartitionStatus::Failed);

        tracker.advance(RemovalState::Confirming)?;
        if !confirmed {
            tracker.advance(RemovalState::Cancelled)?;
            info!("Removal cancelled");
            report.status = PartitionStatus::Cancelled;
            return Ok(report);
        }

        tracker.advance(RemovalState::Deleting)?;
        let deleted = match self.delete(scope, key).await {
            Ok(deleted) => deleted,
            Err(e) => return fail_removal(&mut tracker, report, e),
        };
        info!(rows = deleted, "Deleted");

        tracker.advance(RemovalState::Analyzing)?;
        if let Err(e) = self.ctx.warehouse.analyze(&scope.tables()).await {
            report.rows = deleted;
            return fail_removal(&mut tracker, report, e);
        }

        tracker.advance(RemovalState::Done)?;
        report.rows = deleted;
        report.status = PartitionStatus::Removed;
        Ok(report)
    }

    /// Delete the rows of one partition, scoped by national code or identifier
    async fn delete(&self, scope: RemovalScope, key: &PartitionKey) -> Result<u64> {
        let warehouse = &self.ctx.warehouse;
        match (scope, key) {
            (RemovalScope::StateGeo, PartitionKey::State(state)) => {
                let mut deleted = 0;
                // children first
                for level in GeoLevel::SUB_STATE.iter().rev() {
                    deleted += warehouse.delete_geo_features(*level, &state.fips).await?;
                }
                Ok(deleted)
            },
            (RemovalScope::StatePop, PartitionKey::State(state)) => {
                Ok(warehouse.delete_population(&state.fips).await?.total())
            },
            (RemovalScope::Disease, PartitionKey::Disease(id)) => {
                warehouse.delete_disease_dynamics(id).await
            },
            (RemovalScope::Npi, PartitionKey::Disease(id)) => warehouse.delete_npis(id).await,
            (RemovalScope::Vaccination, PartitionKey::Disease(id)) => {
                warehouse.delete_vaccinations(id).await
            },
            (RemovalScope::Observation(domain), PartitionKey::State(state)) => {
                warehouse.delete_observations(domain, &state.fips).await
            },
            (scope, key) => Err(IngestError::invalid_partition(
                key.to_string(),
                format!("not a partition of removal scope {}", scope),
            )),
        }
    }
}

/// Decide what an entity error means for its partition
fn classify(err: &IngestError, entry: &CatalogEntry) -> Verdict {
    if err.is_partition_fatal() || entry.critical {
        Verdict::FailPartition
    } else {
        Verdict::Continue
    }
}

fn fail_removal(
    tracker: &mut Tracker<RemovalState>,
    mut report: PartitionReport,
    err: IngestError,
) -> Result<PartitionReport> {
    if err.is_invocation_fatal() {
        return Err(err);
    }
    tracker.advance(RemovalState::Failed)?;
    error!(error = %err, "Removal failed");
    report.failures.push(EntityFailure {
        label: report.partition.clone(),
        critical: true,
        error: err.to_string(),
    });
    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::Target;
    use crate::resolver::PartitionTable;

    fn entry(critical: bool) -> CatalogEntry {
        CatalogEntry {
            label: "geo tract AK".into(),
            domain: Domain::Geo,
            locator: "file:///tmp/x.zip".into(),
            target: Target::Geo(GeoLevel::Tract),
            scope: None,
            critical,
        }
    }

    #[test]
    fn test_load_transitions() {
        let mut t = Tracker::new(LoadState::Idle, "AK");
        for next in [
            LoadState::Resolving,
            LoadState::Fetching,
            LoadState::Staging,
            LoadState::Loading,
            LoadState::Fetching,
            LoadState::Committing,
            LoadState::Done,
        ] {
            t.advance(next).unwrap();
        }
        assert_eq!(t.state(), LoadState::Done);
        assert!(matches!(t.advance(LoadState::Loading), Err(IngestError::Internal(_))));
    }

    #[test]
    fn test_failed_only_from_active_states() {
        assert!(!LoadState::Idle.allows(LoadState::Failed));
        assert!(LoadState::Staging.allows(LoadState::Failed));
        assert!(!LoadState::Done.allows(LoadState::Failed));
        assert!(!LoadState::Idle.allows(LoadState::Fetching));
    }

    #[test]
    fn test_removal_transitions() {
        let mut t = Tracker::new(RemovalState::Idle, "AK");
        t.advance(RemovalState::Confirming).unwrap();
        t.advance(RemovalState::Cancelled).unwrap();
        assert!(t.advance(RemovalState::Deleting).is_err());

        assert!(!RemovalState::Idle.allows(RemovalState::Deleting));
        assert!(RemovalState::Analyzing.allows(RemovalState::Done));
    }

    #[test]
    fn test_removal_scope_from_str() {
        assert_eq!("state-geo".parse::<RemovalScope>().unwrap(), RemovalScope::StateGeo);
        assert_eq!("STATE-POP".parse::<RemovalScope>().unwrap(), RemovalScope::StatePop);
        assert_eq!(
            "weather".parse::<RemovalScope>().unwrap(),
            RemovalScope::Observation(Domain::Weather)
        );
        assert_eq!(RemovalScope::Vaccination.domain(), Domain::Vaccination);
        assert!("county".parse::<RemovalScope>().is_err());
    }

    #[test]
    fn test_classify() {
        let parse = IngestError::parse("a.csv", "bad");
        assert!(matches!(classify(&parse, &entry(false)), Verdict::Continue));
        assert!(matches!(classify(&parse, &entry(true)), Verdict::FailPartition));

        let empty = IngestError::empty_load("geo tract AK");
        assert!(matches!(classify(&empty, &entry(false)), Verdict::FailPartition));
    }

    #[test]
    fn test_removal_scope_keys_resolve_like_loads() {
        let resolver = Resolver::new(PartitionTable::us_states().unwrap());
        let catalog = Catalog::new(Default::default());
        let keys = catalog
            .partitions(RemovalScope::StateGeo.domain(), Some("ak"), &resolver)
            .unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].to_string(), "AK");
    }
}
