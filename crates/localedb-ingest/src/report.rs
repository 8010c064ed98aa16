//! Partition outcomes and warehouse inventory
//!
//! A [`PartitionReport`] is produced for every partition a load or removal
//! touches. The CLI renders them as the final summary table.

use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use serde::Serialize;

use localedb_common::types::Domain;

use crate::catalog::KNOWN_DISEASES;
use crate::error::Result;
use crate::models::{GeoLevel, PopEntity};
use crate::resolver::StatePartition;
use crate::warehouse::Warehouse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    Completed,
    /// Completed, but rows were skipped or non-critical entities failed
    CompletedWithSkips,
    Failed,
    /// Left untouched because its rows already exist
    AlreadyLoaded,
    Removed,
    /// Removal declined at the confirmation prompt
    Cancelled,
}

impl PartitionStatus {
    pub fn is_failure(self) -> bool {
        self == PartitionStatus::Failed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PartitionStatus::Completed => "completed",
            PartitionStatus::CompletedWithSkips => "completed with skipped rows",
            PartitionStatus::Failed => "failed",
            PartitionStatus::AlreadyLoaded => "already loaded",
            PartitionStatus::Removed => "removed",
            PartitionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entity that failed without failing its partition, or the one that did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityFailure {
    pub label: String,
    pub critical: bool,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionReport {
    pub domain: Domain,
    pub partition: String,
    pub status: PartitionStatus,
    /// Rows written (loads) or deleted (removals)
    pub rows: u64,
    pub skipped: u64,
    pub failures: Vec<EntityFailure>,
}

impl PartitionReport {
    pub fn new(domain: Domain, partition: impl Into<String>, status: PartitionStatus) -> Self {
        Self {
            domain,
            partition: partition.into(),
            status,
            rows: 0,
            skipped: 0,
            failures: Vec::new(),
        }
    }
}

/// Whether any partition failed
pub fn any_failed(reports: &[PartitionReport]) -> bool {
    reports.iter().any(|r| r.status.is_failure())
}

/// Summary table of a run
pub fn render_summary(reports: &[PartitionReport]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Domain", "Partition", "Status", "Rows", "Skipped", "Failures"]);

    for report in reports {
        let status = match report.status {
            PartitionStatus::Completed | PartitionStatus::Removed => {
                report.status.as_str().green().to_string()
            },
            PartitionStatus::CompletedWithSkips => report.status.as_str().yellow().to_string(),
            PartitionStatus::Failed => report.status.as_str().red().to_string(),
            _ => report.status.as_str().dimmed().to_string(),
        };
        let failures = report
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.label, f.error))
            .collect::<Vec<_>>()
            .join("\n");

        table.add_row(vec![
            report.domain.to_string(),
            report.partition.clone(),
            status,
            report.rows.to_string(),
            report.skipped.to_string(),
            if failures.is_empty() { "-".to_string() } else { failures },
        ]);
    }

    table.to_string()
}

/// Row counts of one state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateInventory {
    pub state: String,
    pub geo: Vec<(GeoLevel, u64)>,
    pub households: u64,
    pub persons: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inventory {
    pub locales: u64,
    pub states: Vec<StateInventory>,
    pub diseases: Vec<(String, u64)>,
}

/// Count what the warehouse holds; read-only
pub async fn collect_inventory(
    warehouse: &dyn Warehouse,
    states: &[StatePartition],
) -> Result<Inventory> {
    let mut inventory = Inventory {
        locales: warehouse.count_locales().await?,
        states: Vec::with_capacity(states.len()),
        diseases: Vec::new(),
    };

    for state in states {
        let mut geo = Vec::with_capacity(GeoLevel::ALL.len());
        for level in GeoLevel::ALL {
            geo.push((level, warehouse.count_geo_features(level, Some(&state.fips)).await?));
        }
        inventory.states.push(StateInventory {
            state: state.to_string(),
            geo,
            households: warehouse
                .count_population(PopEntity::Household, Some(&state.fips))
                .await?,
            persons: warehouse
                .count_population(PopEntity::Person, Some(&state.fips))
                .await?,
        });
    }

    for disease in KNOWN_DISEASES {
        inventory
            .diseases
            .push((disease.to_string(), warehouse.count_disease_dynamics(disease).await?));
    }

    Ok(inventory)
}

/// Inventory table; states without any rows are left out
pub fn render_inventory(inventory: &Inventory) -> String {
    let mut header = vec!["State".to_string()];
    header.extend(GeoLevel::ALL.iter().map(|l| l.table().to_string()));
    header.push("pop.household".to_string());
    header.push("pop.person".to_string());

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);

    for state in &inventory.states {
        let empty = state.geo.iter().all(|(_, n)| *n == 0) && state.households == 0;
        if empty {
            continue;
        }
        let mut row = vec![state.state.clone()];
        row.extend(state.geo.iter().map(|(_, n)| n.to_string()));
        row.push(state.households.to_string());
        row.push(state.persons.to_string());
        table.add_row(row);
    }

    let diseases = inventory
        .diseases
        .iter()
        .map(|(d, n)| format!("{} ({} rows)", d, n))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Locales: {}\n{}\nDisease dynamics: {}",
        inventory.locales, table, diseases
    )
}
