//! Table metadata types for pgupsert.
//!
//! Descriptors are supplied by whatever introspects the database; the engine
//! only ever reads them through [`MetadataProvider`].

use indexmap::IndexMap;
use std::fmt;

pub use pgupsert_sql::QualifiedName;

/// Postgres column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PgType {
    /// SMALLINT (2 bytes)
    SmallInt,
    /// INTEGER (4 bytes)
    Integer,
    /// BIGINT (8 bytes)
    BigInt,
    /// REAL (4 bytes floating point)
    Real,
    /// DOUBLE PRECISION (8 bytes floating point)
    DoublePrecision,
    /// NUMERIC (arbitrary precision)
    Numeric,
    /// BOOLEAN
    Boolean,
    /// TEXT
    Text,
    /// VARCHAR(n)
    Varchar,
    /// BYTEA (binary)
    Bytea,
    /// TIMESTAMPTZ
    Timestamptz,
    /// DATE
    Date,
    /// TIME
    Time,
    /// UUID
    Uuid,
    /// JSONB
    Jsonb,
    /// TEXT[] (array of text)
    TextArray,
    /// BIGINT[] (array of bigint)
    BigIntArray,
    /// INTEGER[] (array of integer)
    IntegerArray,
}

impl fmt::Display for PgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgType::SmallInt => write!(f, "SMALLINT"),
            PgType::Integer => write!(f, "INTEGER"),
            PgType::BigInt => write!(f, "BIGINT"),
            PgType::Real => write!(f, "REAL"),
            PgType::DoublePrecision => write!(f, "DOUBLE PRECISION"),
            PgType::Numeric => write!(f, "NUMERIC"),
            PgType::Boolean => write!(f, "BOOLEAN"),
            PgType::Text => write!(f, "TEXT"),
            PgType::Varchar => write!(f, "VARCHAR"),
            PgType::Bytea => write!(f, "BYTEA"),
            PgType::Timestamptz => write!(f, "TIMESTAMPTZ"),
            PgType::Date => write!(f, "DATE"),
            PgType::Time => write!(f, "TIME"),
            PgType::Uuid => write!(f, "UUID"),
            PgType::Jsonb => write!(f, "JSONB"),
            PgType::TextArray => write!(f, "TEXT[]"),
            PgType::BigIntArray => write!(f, "BIGINT[]"),
            PgType::IntegerArray => write!(f, "INTEGER[]"),
        }
    }
}

/// The `typmod` part of a column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeModifier {
    #[default]
    None,
    /// Maximum length in characters, for VARCHAR(n).
    Length(u32),
    /// NUMERIC(precision, scale)
    Numeric { precision: u32, scale: u32 },
}

/// A database column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Postgres type
    pub pg_type: PgType,
    /// Length / precision modifier
    pub modifier: TypeModifier,
    /// Whether this column is part of the primary key
    pub primary_key: bool,
    /// Whether the column accepts input on insert (false for generated columns)
    pub insertable: bool,
}

impl ColumnDescriptor {
    /// An insertable column outside the primary key.
    pub fn new(name: impl Into<String>, pg_type: PgType) -> Self {
        Self {
            name: name.into(),
            pg_type,
            modifier: TypeModifier::None,
            primary_key: false,
            insertable: true,
        }
    }

    /// Mark as primary key column.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn modifier(mut self, modifier: TypeModifier) -> Self {
        self.modifier = modifier;
        self
    }

    /// Mark as generated: filled by the database, never accepted as input.
    pub fn generated(mut self) -> Self {
        self.insertable = false;
        self
    }
}

/// Cardinality of a relation, seen from the row that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Forward foreign key: this row references at most one target row.
    ToOne,
    /// Backward foreign key: many target rows reference this row.
    ToMany,
}

/// A related entity reachable from a row of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    /// Field name under which the relation is exposed
    pub name: String,
    pub kind: RelationKind,
    /// Related table
    pub target: QualifiedName,
    /// `(local column, target column)` pairs joined with equality
    pub column_pairs: Vec<(String, String)>,
}

/// A computed field: an SQL function taking the table's row type.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedField {
    pub name: String,
    pub function: QualifiedName,
    /// Return type of the function
    pub pg_type: PgType,
}

/// A table and everything the engine needs to write and project it.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub name: QualifiedName,
    /// Columns in declaration order
    pub columns: Vec<ColumnDescriptor>,
    /// Primary key columns in declaration order
    pub primary_key: Vec<String>,
    pub relations: Vec<Relation>,
    pub computed: Vec<ComputedField>,
    /// Whether inserts through the API are allowed for this table
    pub upsertable: bool,
}

impl TableDescriptor {
    pub fn new(name: QualifiedName) -> Self {
        Self {
            name,
            columns: Vec::new(),
            primary_key: Vec::new(),
            relations: Vec::new(),
            computed: Vec::new(),
            upsertable: true,
        }
    }

    /// Append a column. Primary key columns are added to the key in the order
    /// they are declared.
    pub fn column(mut self, column: ColumnDescriptor) -> Self {
        if column.primary_key {
            self.primary_key.push(column.name.clone());
        }
        self.columns.push(column);
        self
    }

    /// Override the primary key column list (e.g. for a composite key whose
    /// order differs from column order).
    pub fn primary_key(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        for column in &mut self.columns {
            column.primary_key = self.primary_key.contains(&column.name);
        }
        self
    }

    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn computed(mut self, field: ComputedField) -> Self {
        self.computed.push(field);
        self
    }

    /// Mark the table as not accepting inserts.
    pub fn read_only(mut self) -> Self {
        self.upsertable = false;
        self
    }

    pub fn column_named(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn relation_named(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn computed_named(&self, name: &str) -> Option<&ComputedField> {
        self.computed.iter().find(|c| c.name == name)
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|pk| pk == column)
    }

    /// Columns that are not part of the primary key, in declaration order.
    pub fn non_key_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| !self.is_primary_key(&c.name))
    }
}

/// Source of table descriptors.
pub trait MetadataProvider {
    /// Look up a table by its qualified name.
    fn table(&self, id: &QualifiedName) -> Option<&TableDescriptor>;
}

/// In-memory collection of table descriptors.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub tables: IndexMap<QualifiedName, TableDescriptor>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a table.
    pub fn add_table(&mut self, table: TableDescriptor) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn with_table(mut self, table: TableDescriptor) -> Self {
        self.add_table(table);
        self
    }
}

impl MetadataProvider for Schema {
    fn table(&self, id: &QualifiedName) -> Option<&TableDescriptor> {
        self.tables.get(id)
    }
}

impl<P: MetadataProvider + ?Sized> MetadataProvider for &P {
    fn table(&self, id: &QualifiedName) -> Option<&TableDescriptor> {
        (**self).table(id)
    }
}
