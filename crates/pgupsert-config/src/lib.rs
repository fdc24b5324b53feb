//! Configuration schema for pgupsert.
//!
//! Read from `.config/pgupsert.styx`:
//!
//! ```styx
//! column_policy all-columns
//! savepoint api_mutation
//! alias_prefix __written
//! ```

use facet::Facet;

/// Default savepoint name.
pub const DEFAULT_SAVEPOINT: &str = "pgupsert_mutation";

/// Default prefix for the per-request result alias.
pub const DEFAULT_ALIAS_PREFIX: &str = "__upserted";

/// Engine configuration. Every field is optional.
#[derive(Debug, Clone, Default, Facet)]
pub struct Config {
    /// Which columns a batch writes.
    #[facet(default)]
    pub column_policy: Option<ColumnPolicy>,

    /// Name of the savepoint each upsert runs under.
    #[facet(default)]
    pub savepoint: Option<String>,

    /// Prefix of the alias the inserted rows are exposed under while projecting.
    #[facet(default)]
    pub alias_prefix: Option<String>,
}

impl Config {
    pub fn column_policy(&self) -> ColumnPolicy {
        self.column_policy.unwrap_or_default()
    }

    pub fn savepoint(&self) -> &str {
        self.savepoint.as_deref().unwrap_or(DEFAULT_SAVEPOINT)
    }

    pub fn alias_prefix(&self) -> &str {
        self.alias_prefix.as_deref().unwrap_or(DEFAULT_ALIAS_PREFIX)
    }
}

/// How the column set of a batch is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Facet)]
#[repr(u8)]
pub enum ColumnPolicy {
    /// The fields of the first row, which every other row must repeat exactly.
    #[default]
    #[facet(rename = "first-row")]
    FirstRow,
    /// Every insertable column of the table; fields a row omits take DEFAULT.
    #[facet(rename = "all-columns")]
    AllColumns,
}
