//! Common types used across LocaleDB

use serde::{Deserialize, Serialize};

use crate::error::{CommonError, Result};

/// Data domain of the warehouse.
///
/// Every domain owns one database schema and one cache subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Canonical locale list (countries, states, counties)
    Main,
    /// Census geography (state, county, tract, block group, block)
    Geo,
    /// Synthetic population
    Pop,
    /// Disease dynamics time series
    Disease,
    /// Non-pharmaceutical interventions
    Npi,
    /// Vaccination coverage
    Vaccination,
    Health,
    Weather,
    Mobility,
}

impl Domain {
    pub const ALL: [Domain; 9] = [
        Domain::Main,
        Domain::Geo,
        Domain::Pop,
        Domain::Disease,
        Domain::Npi,
        Domain::Vaccination,
        Domain::Health,
        Domain::Weather,
        Domain::Mobility,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Main => "main",
            Domain::Geo => "geo",
            Domain::Pop => "pop",
            Domain::Disease => "dis",
            Domain::Npi => "npi",
            Domain::Vaccination => "vax",
            Domain::Health => "health",
            Domain::Weather => "weather",
            Domain::Mobility => "mobility",
        }
    }

    /// Whether partitions of this domain are U.S. states
    pub fn is_state_scoped(self) -> bool {
        matches!(
            self,
            Domain::Geo | Domain::Pop | Domain::Health | Domain::Weather | Domain::Mobility
        )
    }
}

impl std::str::FromStr for Domain {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "main" | "locale" => Ok(Domain::Main),
            "geo" | "state-geo" => Ok(Domain::Geo),
            "pop" | "population" => Ok(Domain::Pop),
            "dis" | "disease" => Ok(Domain::Disease),
            "npi" => Ok(Domain::Npi),
            "vax" | "vaccination" => Ok(Domain::Vaccination),
            "health" => Ok(Domain::Health),
            "weather" => Ok(Domain::Weather),
            "mobility" => Ok(Domain::Mobility),
            other => Err(CommonError::UnknownDomain(other.to_string())),
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Locale hierarchy
// ============================================================================

/// Administrative aggregation level of a locale
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocaleLevel {
    Country,
    State,
    County,
    Tract,
    BlockGroup,
    Block,
}

impl LocaleLevel {
    /// Length of the FIPS-style code at this level (country has none)
    pub fn code_len(self) -> Option<usize> {
        match self {
            LocaleLevel::Country => None,
            LocaleLevel::State => Some(2),
            LocaleLevel::County => Some(5),
            LocaleLevel::Tract => Some(11),
            LocaleLevel::BlockGroup => Some(12),
            LocaleLevel::Block => Some(15),
        }
    }

    /// Level implied by a code of the given length
    pub fn from_code_len(len: usize) -> Option<Self> {
        match len {
            2 => Some(LocaleLevel::State),
            5 => Some(LocaleLevel::County),
            11 => Some(LocaleLevel::Tract),
            12 => Some(LocaleLevel::BlockGroup),
            15 => Some(LocaleLevel::Block),
            _ => None,
        }
    }

    pub fn parent(self) -> Option<Self> {
        match self {
            LocaleLevel::Country => None,
            LocaleLevel::State => Some(LocaleLevel::Country),
            LocaleLevel::County => Some(LocaleLevel::State),
            LocaleLevel::Tract => Some(LocaleLevel::County),
            LocaleLevel::BlockGroup => Some(LocaleLevel::Tract),
            LocaleLevel::Block => Some(LocaleLevel::BlockGroup),
        }
    }
}

/// A FIPS-style national code.
///
/// Child codes embed their parents as prefixes: a tract code starts with its
/// county code, which starts with its state code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fips(String);

impl Fips {
    pub fn parse(code: &str) -> Result<Self> {
        let code = code.trim();
        if !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(CommonError::invalid_fips(code, "must contain digits only"));
        }
        if LocaleLevel::from_code_len(code.len()).is_none() {
            return Err(CommonError::invalid_fips(
                code,
                format!("unsupported length {}", code.len()),
            ));
        }
        Ok(Self(code.to_string()))
    }

    /// Parse a numeric code that may have lost its leading zeros
    /// (e.g. `2020` or `2020.0` for county `02020`).
    pub fn from_numeric(raw: &str, level: LocaleLevel) -> Result<Self> {
        let width = level
            .code_len()
            .ok_or_else(|| CommonError::invalid_fips(raw, "country has no code"))?;
        let trimmed = raw.trim();
        let digits = trimmed.strip_suffix(".0").unwrap_or(trimmed);
        let value: u64 = digits
            .parse()
            .map_err(|_| CommonError::invalid_fips(raw, "not a number"))?;
        let code = format!("{:0width$}", value, width = width);
        if code.len() != width {
            return Err(CommonError::invalid_fips(raw, "too many digits"));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn level(&self) -> LocaleLevel {
        // Length is validated on construction
        LocaleLevel::from_code_len(self.0.len()).unwrap_or(LocaleLevel::State)
    }

    /// Code of the ancestor at `level`, if `level` is above this code's level
    pub fn ancestor(&self, level: LocaleLevel) -> Option<Fips> {
        let len = level.code_len()?;
        if len >= self.0.len() {
            return None;
        }
        Some(Fips(self.0[..len].to_string()))
    }

    pub fn state(&self) -> Fips {
        Fips(self.0[..2].to_string())
    }

    /// Whether this code lies within (or equals) `scope`
    pub fn is_within(&self, scope: &Fips) -> bool {
        self.0.starts_with(&scope.0)
    }
}

impl std::fmt::Display for Fips {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fips {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self> {
        Fips::parse(&value)
    }
}

impl From<Fips> for String {
    fn from(value: Fips) -> Self {
        value.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_from_str() {
        assert_eq!("geo".parse::<Domain>().unwrap(), Domain::Geo);
        assert_eq!("State-Geo".parse::<Domain>().unwrap(), Domain::Geo);
        assert_eq!("dis".parse::<Domain>().unwrap(), Domain::Disease);
        assert_eq!("vax".parse::<Domain>().unwrap(), Domain::Vaccination);
        assert!(matches!(
            "crops".parse::<Domain>(),
            Err(CommonError::UnknownDomain(_))
        ));
    }

    #[test]
    fn test_domain_round_trips_through_as_str() {
        for domain in Domain::ALL {
            assert_eq!(domain.as_str().parse::<Domain>().unwrap(), domain);
        }
    }

    #[test]
    fn test_fips_levels_and_ancestors() {
        let block = Fips::parse("020200001001000").unwrap();
        assert_eq!(block.level(), LocaleLevel::Block);
        assert_eq!(block.ancestor(LocaleLevel::County).unwrap().as_str(), "02020");
        assert_eq!(block.ancestor(LocaleLevel::Tract).unwrap().as_str(), "02020000100");
        assert_eq!(block.state().as_str(), "02");
        assert!(block.ancestor(LocaleLevel::Block).is_none());
    }

    #[test]
    fn test_fips_scope_uses_prefix() {
        let ak = Fips::parse("02").unwrap();
        let anchorage = Fips::parse("02020").unwrap();
        let allegheny = Fips::parse("42003").unwrap();
        assert!(anchorage.is_within(&ak));
        assert!(!allegheny.is_within(&ak));
    }

    #[test]
    fn test_fips_rejects_malformed_codes() {
        assert!(Fips::parse("0202").is_err());
        assert!(Fips::parse("AK").is_err());
        assert!(Fips::parse("").is_err());
    }

    #[test]
    fn test_fips_from_numeric_restores_leading_zeros() {
        assert_eq!(Fips::from_numeric("2020.0", LocaleLevel::County).unwrap().as_str(), "02020");
        assert_eq!(Fips::from_numeric("6", LocaleLevel::State).unwrap().as_str(), "06");
        assert!(Fips::from_numeric("123456", LocaleLevel::County).is_err());
        assert!(Fips::from_numeric("", LocaleLevel::County).is_err());
    }

    #[test]
    fn test_fips_serde() {
        let fips: Fips = serde_json::from_str("\"42003\"").unwrap();
        assert_eq!(fips.level(), LocaleLevel::County);
        assert!(serde_json::from_str::<Fips>("\"4200\"").is_err());
    }
}
