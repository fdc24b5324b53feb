//! Validation of a request against table metadata, and compilation of the
//! rows into one `INSERT ... ON CONFLICT` statement.

use indexmap::IndexMap;
use pgupsert_config::ColumnPolicy;
use pgupsert_schema::{ColumnDescriptor, MetadataProvider, TableDescriptor};
use pgupsert_sql::{
    ColumnName, ConflictAction, Expr, InsertStmt, OnConflict, ParamName, RenderedSql,
    UpdateAssignment, render,
};

use crate::coerce::coerce;
use crate::error::{ConfigurationError, Error, ExecutionError, ValidationError};
use crate::projection::{Projection, ResolvedProjection};
use crate::query::Value;

/// One input row: field name to raw value.
pub type InputRow = IndexMap<String, Value>;

/// A request that passed every metadata and shape check.
///
/// Building a plan never touches the store. Compiling it coerces the values,
/// which is the first step that can fail with an [`ExecutionError`].
#[derive(Debug)]
pub struct UpsertPlan<'t> {
    table: &'t TableDescriptor,
    columns: Vec<&'t ColumnDescriptor>,
    rows: Vec<InputRow>,
    pub(crate) projection: ResolvedProjection<'t>,
}

impl<'t> UpsertPlan<'t> {
    pub fn new<P: MetadataProvider + ?Sized>(
        provider: &'t P,
        table: &'t TableDescriptor,
        rows: Vec<InputRow>,
        projection: &Projection,
        policy: ColumnPolicy,
    ) -> Result<Self, Error> {
        check_table(table)?;
        check_fields(table, &rows)?;
        let columns = column_set(table, &rows, policy)?;

        if columns.is_empty() && rows.len() > 1 {
            return Err(ValidationError::MultipleDefaultRows { count: rows.len() }.into());
        }

        let projection = ResolvedProjection::resolve(provider, table, projection)?;

        Ok(Self {
            table,
            columns,
            rows,
            projection,
        })
    }

    pub fn table(&self) -> &'t TableDescriptor {
        self.table
    }

    /// Names of the columns every VALUES tuple covers, in table order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Coerce every value and build the statement.
    pub fn compile(&self) -> Result<CompiledUpsert, ExecutionError> {
        let mut stmt = InsertStmt::new(self.table.name.clone());
        let mut bindings = IndexMap::new();

        // No fields at all: the single row takes every default. There is no
        // conflict target to report, so this form skips ON CONFLICT.
        if self.columns.is_empty() {
            return Ok(CompiledUpsert {
                statement: stmt.returning_all(),
                bindings,
            });
        }

        stmt = stmt.columns(
            self.columns
                .iter()
                .map(|c| ColumnName::from(c.name.as_str())),
        );

        for (i, row) in self.rows.iter().enumerate() {
            let mut values = Vec::with_capacity(self.columns.len());
            for column in &self.columns {
                match row.get(&column.name) {
                    Some(value) => {
                        let param = ParamName::from(format!("r{i}_{}", column.name));
                        bindings.insert(param.clone(), coerce(value.clone(), column, i)?);
                        values.push(Expr::param(param));
                    }
                    None => values.push(Expr::Default),
                }
            }
            stmt = stmt.row(values);
        }

        let stmt = stmt
            .on_conflict(OnConflict {
                columns: self
                    .table
                    .primary_key
                    .iter()
                    .map(|pk| ColumnName::from(pk.as_str()))
                    .collect(),
                action: self.conflict_action(),
            })
            .returning_all();

        Ok(CompiledUpsert {
            statement: stmt,
            bindings,
        })
    }

    /// `DO UPDATE SET col = EXCLUDED.col` for every non-key column in the
    /// column set. Primary key columns never appear here.
    fn conflict_action(&self) -> ConflictAction {
        let assignments: Vec<UpdateAssignment> = self
            .columns
            .iter()
            .filter(|c| !self.table.is_primary_key(&c.name))
            .map(|c| {
                let name = ColumnName::from(c.name.as_str());
                UpdateAssignment::new(name.clone(), Expr::excluded(name))
            })
            .collect();
        if !assignments.is_empty() {
            return ConflictAction::DoUpdate(assignments);
        }

        // Only key columns were given. Assigning a column to itself leaves the
        // row unchanged but still makes RETURNING report it.
        match self.table.non_key_columns().find(|c| c.insertable) {
            Some(column) => {
                let name = ColumnName::from(column.name.as_str());
                ConflictAction::DoUpdate(vec![UpdateAssignment::new(
                    name.clone(),
                    Expr::column(name),
                )])
            }
            // Every column is a key column. Nothing to update; the projector
            // reads rows that already existed back from the table.
            None => ConflictAction::DoNothing,
        }
    }
}

fn check_table(table: &TableDescriptor) -> Result<(), ConfigurationError> {
    if !table.upsertable {
        return Err(ConfigurationError::NotUpsertable {
            table: table.name.clone(),
        });
    }
    if table.primary_key.is_empty() {
        return Err(ConfigurationError::NoPrimaryKey {
            table: table.name.clone(),
        });
    }
    for pk in &table.primary_key {
        if !table.column_named(pk).is_some_and(|c| c.insertable) {
            return Err(ConfigurationError::UnknownPrimaryKeyColumn {
                table: table.name.clone(),
                column: pk.clone(),
            });
        }
    }
    Ok(())
}

fn check_fields(table: &TableDescriptor, rows: &[InputRow]) -> Result<(), ValidationError> {
    for (i, row) in rows.iter().enumerate() {
        for field in row.keys() {
            match table.column_named(field) {
                None => {
                    return Err(ValidationError::UnknownColumn {
                        table: table.name.clone(),
                        row: i,
                        field: field.clone(),
                    });
                }
                Some(column) if !column.insertable => {
                    return Err(ValidationError::NotInsertable {
                        table: table.name.clone(),
                        row: i,
                        column: field.clone(),
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

fn column_set<'t>(
    table: &'t TableDescriptor,
    rows: &[InputRow],
    policy: ColumnPolicy,
) -> Result<Vec<&'t ColumnDescriptor>, ValidationError> {
    match policy {
        ColumnPolicy::AllColumns => Ok(table.columns.iter().filter(|c| c.insertable).collect()),
        ColumnPolicy::FirstRow => {
            let Some(first) = rows.first() else {
                return Ok(Vec::new());
            };
            let columns: Vec<&ColumnDescriptor> = table
                .columns
                .iter()
                .filter(|c| first.contains_key(&c.name))
                .collect();

            for (i, row) in rows.iter().enumerate().skip(1) {
                let same_shape =
                    row.len() == first.len() && row.keys().all(|k| first.contains_key(k));
                if !same_shape {
                    return Err(ValidationError::RowShapeMismatch {
                        row: i,
                        expected: columns.iter().map(|c| c.name.clone()).collect(),
                        found: fields_in_table_order(table, row),
                    });
                }
            }
            Ok(columns)
        }
    }
}

fn fields_in_table_order(table: &TableDescriptor, row: &InputRow) -> Vec<String> {
    table
        .columns
        .iter()
        .filter(|c| row.contains_key(&c.name))
        .map(|c| c.name.clone())
        .collect()
}

/// The mutation statement with its coerced parameter values.
#[derive(Debug, Clone)]
pub struct CompiledUpsert {
    pub statement: InsertStmt,
    pub bindings: IndexMap<ParamName, Value>,
}

impl CompiledUpsert {
    /// Render the statement on its own.
    pub fn render(&self) -> RenderedSql {
        render(&self.statement)
    }

    /// Values for `params`, in order.
    pub fn values_for(&self, params: &[ParamName]) -> Vec<Value> {
        params
            .iter()
            .map(|p| self.bindings.get(p).cloned().unwrap_or(Value::Null))
            .collect()
    }
}
