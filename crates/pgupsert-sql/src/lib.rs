//! SQL AST and rendering.
//!
//! Build SQL as a typed AST, then render to a string with automatic
//! parameter numbering. Identifiers are always quoted, so names coming from
//! table metadata can never be interpolated raw.

use std::fmt;

use strid::braid;

mod expr;
pub use expr::*;

mod render;
pub use render::*;

mod stmt;
pub use stmt::*;

/// Result of rendering SQL.
#[derive(Debug, Clone)]
pub struct RenderedSql {
    /// The SQL string with $1, $2, etc. placeholders.
    pub sql: String,

    /// Parameter names in order (maps to $1, $2, etc.).
    pub params: Vec<ParamName>,
}

/// The name of a table alias or CTE.
#[braid]
pub struct TableName;

/// The name of a column (or column alias).
#[braid]
pub struct ColumnName;

/// The name of a query parameter.
#[braid]
pub struct ParamName;

/// A possibly schema-qualified relation or function name.
///
/// Display writes each part quoted, joined by a dot.
///
/// # Example
/// ```
/// use pgupsert_sql::QualifiedName;
/// assert_eq!(QualifiedName::new("app", "item").to_string(), "\"app\".\"item\"");
/// assert_eq!(QualifiedName::bare("item").to_string(), "\"item\"");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }
}

impl From<&str> for QualifiedName {
    fn from(name: &str) -> Self {
        Self::bare(name)
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(schema) = &self.schema {
            write!(f, "{}.", Ident(schema))?;
        }
        write!(f, "{}", Ident(&self.name))
    }
}

/// A PostgreSQL string literal wrapper.
///
/// Display writes the value escaped and quoted with single quotes.
///
/// # Example
/// ```
/// use pgupsert_sql::Lit;
/// assert_eq!(format!("{}", Lit("foo")), "'foo'");
/// assert_eq!(format!("{}", Lit("it's")), "'it''s'");
/// ```
pub struct Lit<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> fmt::Display for Lit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'")?;
        for c in self.0.as_ref().chars() {
            if c == '\'' {
                write!(f, "''")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "'")
    }
}

/// A PostgreSQL identifier wrapper.
///
/// Display writes the value escaped and quoted with double quotes.
///
/// # Example
/// ```
/// use pgupsert_sql::Ident;
/// assert_eq!(format!("{}", Ident("user")), "\"user\"");
/// assert_eq!(format!("{}", Ident("bla\"h")), "\"bla\"\"h\"");
/// ```
pub struct Ident<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> fmt::Display for Ident<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"")?;
        for c in self.0.as_ref().chars() {
            if c == '"' {
                write!(f, "\"\"")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "\"")
    }
}

/// Escape a string literal for SQL.
pub fn escape_string(s: &str) -> String {
    format!("{}", Lit(s))
}

/// Quote a PostgreSQL identifier.
///
/// Always quotes identifiers to avoid issues with reserved keywords like
/// `user`, `order`, `table`, `group`, etc. Doubles any embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("{}", Ident(name))
}

/// Longest identifier Postgres keeps; longer names are silently truncated.
pub const PG_IDENT_MAX: usize = 63;

/// Whether `name` is a plain identifier: `[A-Za-z_][A-Za-z0-9_]*`, at most 63 bytes.
///
/// Used for names we emit in statements that cannot take bind parameters,
/// such as `SAVEPOINT`.
///
/// # Examples
///
/// ```
/// assert!(pgupsert_sql::is_plain_ident("graphql_mutation"));
/// assert!(!pgupsert_sql::is_plain_ident("1abc"));
/// assert!(!pgupsert_sql::is_plain_ident("a; DROP TABLE x"));
/// ```
pub fn is_plain_ident(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= PG_IDENT_MAX
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
