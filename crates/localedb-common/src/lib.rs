//! LocaleDB Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared vocabulary, utilities, and error handling for the LocaleDB workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Types**: data domains and FIPS-style locale codes
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use localedb_common::types::{Domain, Fips, LocaleLevel};
//!
//! fn main() -> localedb_common::Result<()> {
//!     let domain: Domain = "geo".parse()?;
//!     let tract = Fips::parse("02020000100")?;
//!     assert_eq!(tract.level(), LocaleLevel::Tract);
//!     assert_eq!(tract.state().as_str(), "02");
//!     println!("{domain}: {tract}");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
