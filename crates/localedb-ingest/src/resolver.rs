//! Locale resolver
//!
//! Maps partition tokens (state abbreviations or two-digit FIPS codes) to
//! state partitions through a fixed, versioned table.

use std::collections::HashMap;
use std::sync::Arc;

use localedb_common::types::Fips;

use crate::error::{IngestError, Result};

/// Tokens that select every partition
pub const WILDCARDS: [&str; 2] = ["_all", "*"];

pub const PARTITION_TABLE_VERSION: &str = "us-states-2010";

/// (abbreviation, FIPS, name)
const US_STATES: [(&str, &str, &str); 52] = [
    ("AL", "01", "Alabama"),
    ("AK", "02", "Alaska"),
    ("AZ", "04", "Arizona"),
    ("AR", "05", "Arkansas"),
    ("CA", "06", "California"),
    ("CO", "08", "Colorado"),
    ("CT", "09", "Connecticut"),
    ("DE", "10", "Delaware"),
    ("DC", "11", "District of Columbia"),
    ("FL", "12", "Florida"),
    ("GA", "13", "Georgia"),
    ("HI", "15", "Hawaii"),
    ("ID", "16", "Idaho"),
    ("IL", "17", "Illinois"),
    ("IN", "18", "Indiana"),
    ("IA", "19", "Iowa"),
    ("KS", "20", "Kansas"),
    ("KY", "21", "Kentucky"),
    ("LA", "22", "Louisiana"),
    ("ME", "23", "Maine"),
    ("MD", "24", "Maryland"),
    ("MA", "25", "Massachusetts"),
    ("MI", "26", "Michigan"),
    ("MN", "27", "Minnesota"),
    ("MS", "28", "Mississippi"),
    ("MO", "29", "Missouri"),
    ("MT", "30", "Montana"),
    ("NE", "31", "Nebraska"),
    ("NV", "32", "Nevada"),
    ("NH", "33", "New Hampshire"),
    ("NJ", "34", "New Jersey"),
    ("NM", "35", "New Mexico"),
    ("NY", "36", "New York"),
    ("NC", "37", "North Carolina"),
    ("ND", "38", "North Dakota"),
    ("OH", "39", "Ohio"),
    ("OK", "40", "Oklahoma"),
    ("OR", "41", "Oregon"),
    ("PA", "42", "Pennsylvania"),
    ("RI", "44", "Rhode Island"),
    ("SC", "45", "South Carolina"),
    ("SD", "46", "South Dakota"),
    ("TN", "47", "Tennessee"),
    ("TX", "48", "Texas"),
    ("UT", "49", "Utah"),
    ("VT", "50", "Vermont"),
    ("VA", "51", "Virginia"),
    ("WA", "53", "Washington"),
    ("WV", "54", "West Virginia"),
    ("WI", "55", "Wisconsin"),
    ("WY", "56", "Wyoming"),
    ("PR", "72", "Puerto Rico"),
];

/// One U.S. state partition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatePartition {
    pub abbr: String,
    pub fips: Fips,
    pub name: String,
}

impl std::fmt::Display for StatePartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.abbr, self.fips)
    }
}

/// Immutable table of recognized partitions with O(1) lookup in both
/// directions. Built once at startup and shared through `Arc`.
#[derive(Debug)]
pub struct PartitionTable {
    version: &'static str,
    partitions: Vec<StatePartition>,
    by_abbr: HashMap<String, usize>,
    by_fips: HashMap<String, usize>,
}

impl PartitionTable {
    /// The built-in U.S. state table
    pub fn us_states() -> Result<Arc<Self>> {
        Self::build(PARTITION_TABLE_VERSION, &US_STATES).map(Arc::new)
    }

    /// Build and validate a table from `(abbr, fips, name)` rows
    pub fn build(version: &'static str, rows: &[(&str, &str, &str)]) -> Result<Self> {
        let mut partitions = Vec::with_capacity(rows.len());
        let mut by_abbr = HashMap::with_capacity(rows.len());
        let mut by_fips = HashMap::with_capacity(rows.len());

        for (i, (abbr, fips, name)) in rows.iter().enumerate() {
            if abbr.len() != 2 || !abbr.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(IngestError::Internal(format!(
                    "partition table {}: bad abbreviation '{}'",
                    version, abbr
                )));
            }
            if fips.len() != 2 {
                return Err(IngestError::Internal(format!(
                    "partition table {}: bad state code '{}'",
                    version, fips
                )));
            }
            if name.trim().is_empty() {
                return Err(IngestError::Internal(format!(
                    "partition table {}: empty name for {}",
                    version, abbr
                )));
            }
            let code = Fips::parse(fips)?;

            if by_abbr.insert(abbr.to_string(), i).is_some()
                || by_fips.insert(fips.to_string(), i).is_some()
            {
                return Err(IngestError::Internal(format!(
                    "partition table {}: duplicate entry {}/{}",
                    version, abbr, fips
                )));
            }

            partitions.push(StatePartition {
                abbr: abbr.to_string(),
                fips: code,
                name: name.to_string(),
            });
        }

        Ok(Self {
            version,
            partitions,
            by_abbr,
            by_fips,
        })
    }

    pub fn version(&self) -> &str {
        self.version
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn by_abbr(&self, abbr: &str) -> Option<&StatePartition> {
        self.by_abbr.get(abbr).map(|&i| &self.partitions[i])
    }

    pub fn by_fips(&self, fips: &str) -> Option<&StatePartition> {
        self.by_fips.get(fips).map(|&i| &self.partitions[i])
    }

    /// All partitions ordered by national code
    pub fn all(&self) -> Vec<StatePartition> {
        let mut all = self.partitions.clone();
        all.sort_by(|a, b| a.fips.cmp(&b.fips));
        all
    }
}

/// Resolves partition tokens against a shared [`PartitionTable`]
#[derive(Debug, Clone)]
pub struct Resolver {
    table: Arc<PartitionTable>,
}

impl Resolver {
    pub fn new(table: Arc<PartitionTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    /// Resolve a token to the ordered list of partitions it names.
    ///
    /// Accepts a state abbreviation (any case), a two-digit FIPS code or a
    /// wildcard.
    pub fn resolve(&self, token: &str) -> Result<Vec<StatePartition>> {
        let token = token.trim();
        if WILDCARDS.contains(&token.to_lowercase().as_str()) {
            return Ok(self.table.all());
        }
        self.resolve_one(token).map(|p| vec![p])
    }

    /// Resolve a token naming exactly one partition
    pub fn resolve_one(&self, token: &str) -> Result<StatePartition> {
        let token = token.trim();
        let found = if token.len() == 2 && token.chars().all(|c| c.is_ascii_digit()) {
            self.table.by_fips(token)
        } else {
            self.table.by_abbr(&token.to_uppercase())
        };

        found.cloned().ok_or_else(|| {
            IngestError::invalid_partition(
                token,
                format!("not a recognized state in table {}", self.table.version()),
            )
        })
    }

    /// State partition owning a FIPS code of any level
    pub fn state_of(&self, fips: &Fips) -> Option<&StatePartition> {
        self.table.by_fips(fips.state().as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn resolver() -> Resolver {
        Resolver::new(PartitionTable::us_states().unwrap())
    }

    #[test]
    fn test_table_covers_states_dc_and_pr() {
        let table = PartitionTable::us_states().unwrap();
        assert_eq!(table.len(), 52);
        assert_eq!(table.version(), "us-states-2010");
        assert_eq!(table.by_fips("11").unwrap().abbr, "DC");
        assert_eq!(table.by_abbr("PR").unwrap().fips.as_str(), "72");
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let r = resolver();
        let ak = r.resolve(" ak ").unwrap();
        assert_eq!(ak.len(), 1);
        assert_eq!(ak[0].fips.as_str(), "02");
        assert_eq!(ak[0].name, "Alaska");
    }

    #[test]
    fn test_resolve_accepts_fips() {
        assert_eq!(resolver().resolve_one("42").unwrap().abbr, "PA");
    }

    #[test]
    fn test_wildcard_is_ordered_by_fips() {
        let all = resolver().resolve("_all").unwrap();
        assert_eq!(all.len(), 52);
        assert_eq!(all.first().unwrap().abbr, "AL");
        assert_eq!(all.last().unwrap().abbr, "PR");
        assert!(all.windows(2).all(|w| w[0].fips < w[1].fips));
        assert_eq!(resolver().resolve("*").unwrap().len(), 52);
    }

    #[test]
    fn test_unknown_token_is_invalid_partition() {
        for token in ["XX", "03", "", "Alaska"] {
            assert!(matches!(
                resolver().resolve(token),
                Err(IngestError::InvalidPartition { .. })
            ));
        }
    }

    #[test]
    fn test_table_validation() {
        assert!(PartitionTable::build("t", &[("ak", "02", "Alaska")]).is_err());
        assert!(PartitionTable::build("t", &[("AK", "2", "Alaska")]).is_err());
        assert!(PartitionTable::build("t", &[("AK", "02", "Alaska"), ("AL", "02", "Alabama")])
            .is_err());
        assert!(PartitionTable::build("t", &[("AK", "02", " ")]).is_err());
    }

    #[test]
    fn test_state_of_county() {
        let r = resolver();
        let county = Fips::parse("02020").unwrap();
        assert_eq!(r.state_of(&county).unwrap().abbr, "AK");
    }
}
