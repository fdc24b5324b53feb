//! SQL statements.

use crate::expr::Expr;
use crate::{ColumnName, QualifiedName, TableName};

/// A SQL statement.
#[derive(Debug, Clone)]
pub enum Stmt {
    Select(SelectStmt),
    Insert(InsertStmt),
    With(WithStmt),
}

/// A SELECT statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectStmt {
    pub columns: Vec<SelectColumn>,
    pub from: Option<FromClause>,
    pub where_: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<Expr>,
    /// SELECTs appended with UNION ALL
    pub union_all: Vec<SelectStmt>,
}

/// A column in a SELECT clause.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectColumn {
    /// An expression with an optional alias
    Expr {
        expr: Expr,
        alias: Option<ColumnName>,
    },

    /// All columns from a table: table.*
    AllFrom(TableName),
}

impl SelectColumn {
    pub fn expr(expr: Expr) -> Self {
        SelectColumn::Expr { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: ColumnName) -> Self {
        SelectColumn::Expr {
            expr,
            alias: Some(alias),
        }
    }

    pub fn all_from(table: TableName) -> Self {
        SelectColumn::AllFrom(table)
    }
}

/// A FROM clause.
#[derive(Debug, Clone, PartialEq)]
pub struct FromClause {
    pub source: FromSource,
    pub alias: Option<TableName>,
}

/// What a FROM clause reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum FromSource {
    /// A base table or CTE
    Table(QualifiedName),
    /// A derived table: (SELECT ...)
    Subquery(Box<SelectStmt>),
    /// unnest(array) [WITH ORDINALITY], with column aliases
    Unnest {
        array: Expr,
        with_ordinality: bool,
        columns: Vec<ColumnName>,
    },
}

impl FromClause {
    pub fn table(name: QualifiedName) -> Self {
        Self {
            source: FromSource::Table(name),
            alias: None,
        }
    }

    pub fn aliased(name: QualifiedName, alias: TableName) -> Self {
        Self {
            source: FromSource::Table(name),
            alias: Some(alias),
        }
    }

    pub fn subquery(stmt: SelectStmt, alias: TableName) -> Self {
        Self {
            source: FromSource::Subquery(Box::new(stmt)),
            alias: Some(alias),
        }
    }

    /// `unnest(array) WITH ORDINALITY AS alias(columns...)`
    pub fn unnest_with_ordinality(
        array: Expr,
        alias: TableName,
        columns: impl IntoIterator<Item = ColumnName>,
    ) -> Self {
        Self {
            source: FromSource::Unnest {
                array,
                with_ordinality: true,
                columns: columns.into_iter().collect(),
            },
            alias: Some(alias),
        }
    }
}

/// ORDER BY clause.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub desc: bool,
}

impl OrderBy {
    pub fn asc(expr: Expr) -> Self {
        Self { expr, desc: false }
    }

    pub fn desc(expr: Expr) -> Self {
        Self { expr, desc: true }
    }
}

// ============================================================================
// INSERT statement
// ============================================================================

/// An INSERT statement.
///
/// With no columns it renders as `INSERT INTO t DEFAULT VALUES`; otherwise
/// each entry of `rows` becomes one parenthesized VALUES tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStmt {
    pub table: QualifiedName,
    pub columns: Vec<ColumnName>,
    pub rows: Vec<Vec<Expr>>,
    pub on_conflict: Option<OnConflict>,
    pub returning: Returning,
}

/// ON CONFLICT clause for upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct OnConflict {
    /// Conflict target columns
    pub columns: Vec<ColumnName>,
    /// What to do on conflict
    pub action: ConflictAction,
}

/// What to do on conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictAction {
    /// DO NOTHING
    DoNothing,
    /// DO UPDATE SET ...
    DoUpdate(Vec<UpdateAssignment>),
}

/// An assignment in ON CONFLICT DO UPDATE SET.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateAssignment {
    pub column: ColumnName,
    pub value: Expr,
}

impl UpdateAssignment {
    pub fn new(column: ColumnName, value: Expr) -> Self {
        Self { column, value }
    }
}

/// RETURNING clause.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Returning {
    #[default]
    Nothing,
    /// RETURNING *
    All,
    Columns(Vec<ColumnName>),
}

// ============================================================================
// WITH statement
// ============================================================================

/// A SELECT preceded by one or more common table expressions.
///
/// The CTE bodies may be data-modifying (`INSERT ... RETURNING`).
#[derive(Debug, Clone)]
pub struct WithStmt {
    pub ctes: Vec<(TableName, Stmt)>,
    pub body: SelectStmt,
}

// ============================================================================
// Builder-style constructors
// ============================================================================

impl SelectStmt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, col: SelectColumn) -> Self {
        self.columns.push(col);
        self
    }

    pub fn columns(mut self, cols: impl IntoIterator<Item = SelectColumn>) -> Self {
        self.columns.extend(cols);
        self
    }

    pub fn from(mut self, from: FromClause) -> Self {
        self.from = Some(from);
        self
    }

    pub fn where_(mut self, expr: Expr) -> Self {
        self.where_ = Some(expr);
        self
    }

    pub fn and_where(mut self, expr: Expr) -> Self {
        self.where_ = Some(match self.where_ {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, expr: Expr) -> Self {
        self.limit = Some(expr);
        self
    }

    pub fn union_all(mut self, stmt: SelectStmt) -> Self {
        self.union_all.push(stmt);
        self
    }
}

impl InsertStmt {
    pub fn new(table: QualifiedName) -> Self {
        Self {
            table,
            columns: Vec::new(),
            rows: Vec::new(),
            on_conflict: None,
            returning: Returning::Nothing,
        }
    }

    pub fn columns(mut self, cols: impl IntoIterator<Item = ColumnName>) -> Self {
        self.columns.extend(cols);
        self
    }

    pub fn row(mut self, values: Vec<Expr>) -> Self {
        self.rows.push(values);
        self
    }

    pub fn on_conflict(mut self, conflict: OnConflict) -> Self {
        self.on_conflict = Some(conflict);
        self
    }

    pub fn returning_all(mut self) -> Self {
        self.returning = Returning::All;
        self
    }

    pub fn returning(mut self, cols: impl IntoIterator<Item = ColumnName>) -> Self {
        match &mut self.returning {
            Returning::Columns(existing) => existing.extend(cols),
            other => *other = Returning::Columns(cols.into_iter().collect()),
        }
        self
    }
}

impl WithStmt {
    pub fn new(body: SelectStmt) -> Self {
        Self {
            ctes: Vec::new(),
            body,
        }
    }

    pub fn cte(mut self, name: TableName, stmt: impl Into<Stmt>) -> Self {
        self.ctes.push((name, stmt.into()));
        self
    }
}

impl From<SelectStmt> for Stmt {
    fn from(stmt: SelectStmt) -> Self {
        Stmt::Select(stmt)
    }
}

impl From<InsertStmt> for Stmt {
    fn from(stmt: InsertStmt) -> Self {
        Stmt::Insert(stmt)
    }
}

impl From<WithStmt> for Stmt {
    fn from(stmt: WithStmt) -> Self {
        Stmt::With(stmt)
    }
}
