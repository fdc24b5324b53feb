use pgupsert_schema::QualifiedName;
use thiserror::Error;

use crate::config::ConfigError;
use crate::session::StoreError;

/// Everything that can go wrong during an upsert.
#[derive(Debug, Error)]
pub enum Error {
    #[error("table {0} not found")]
    NotFound(QualifiedName),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Execution(ExecutionError::Store(e))
    }
}

/// The table metadata or engine settings cannot support an upsert.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("table {table} has no primary key")]
    NoPrimaryKey { table: QualifiedName },

    #[error("primary key column {column:?} of {table} is not an insertable column")]
    UnknownPrimaryKeyColumn {
        table: QualifiedName,
        column: String,
    },

    #[error("table {table} does not accept inserts")]
    NotUpsertable { table: QualifiedName },

    #[error("{0:?} is not a valid savepoint name")]
    InvalidSavepoint(String),

    #[error("{0:?} is not a valid alias prefix")]
    InvalidAliasPrefix(String),
}

/// The request does not fit the table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("row {row}: {table} has no column {field:?}")]
    UnknownColumn {
        table: QualifiedName,
        row: usize,
        field: String,
    },

    #[error("row {row}: column {column:?} of {table} does not accept input")]
    NotInsertable {
        table: QualifiedName,
        row: usize,
        column: String,
    },

    #[error("row {row} sets {found:?} but the first row sets {expected:?}")]
    RowShapeMismatch {
        row: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("{count} rows set no fields; only a single row may use default values")]
    MultipleDefaultRows { count: usize },

    #[error("{table} has no field {field:?}")]
    UnknownField { table: QualifiedName, field: String },

    #[error("relation {field:?} of {table} needs a selection")]
    MissingSelection { table: QualifiedName, field: String },

    #[error("field {field:?} of {table} is not a relation and takes no selection")]
    UnexpectedSelection { table: QualifiedName, field: String },

    #[error("field {key:?} is selected twice on {table}")]
    DuplicateField { table: QualifiedName, key: String },

    #[error("empty selection on {table}")]
    EmptyProjection { table: QualifiedName },
}

/// A failure while running the statements. The savepoint has been rolled back.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("row {row}, column {column:?}: cannot use value as {expected}: {message}")]
    Coercion {
        row: usize,
        column: String,
        expected: String,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExecutionError {
    /// SQLSTATE reported by the store, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            ExecutionError::Store(e) => e.sqlstate(),
            ExecutionError::Coercion { .. } => None,
        }
    }

    /// Whether the batch carried the same primary key twice
    /// (`ON CONFLICT DO UPDATE command cannot affect row a second time`).
    pub fn is_duplicate_conflict_key(&self) -> bool {
        self.sqlstate() == Some(CARDINALITY_VIOLATION)
    }
}

/// SQLSTATE `21000`.
pub(crate) const CARDINALITY_VIOLATION: &str = "21000";

pub type Result<T, E = Error> = std::result::Result<T, E>;
