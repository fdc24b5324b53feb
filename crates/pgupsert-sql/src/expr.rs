//! SQL expressions.

use crate::stmt::{OrderBy, SelectStmt};
use crate::{ColumnName, ParamName, QualifiedName, TableName};

/// A SQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A parameter placeholder (e.g., $handle -> $1)
    Param(ParamName),
    /// A column reference
    Column(ColumnRef),
    /// The proposed value of a column in ON CONFLICT DO UPDATE: EXCLUDED."col"
    Excluded(ColumnName),
    /// Field access on a composite value: (record)."field"
    Field {
        record: Box<Expr>,
        field: ColumnName,
    },
    /// A string literal
    String(String),
    /// An integer literal
    Int(i64),
    /// A boolean literal
    Bool(bool),
    /// NULL
    Null,
    /// DEFAULT keyword
    Default,
    /// Binary operation (e.g., a = b, a AND b)
    BinOp {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    /// IS NULL / IS NOT NULL
    IsNull { expr: Box<Expr>, negated: bool },
    /// Type cast: (expr)::type
    Cast { expr: Box<Expr>, ty: CastType },
    /// Built-in function call, name rendered verbatim (e.g. COALESCE)
    FnCall { name: String, args: Vec<Expr> },
    /// Call of a user-defined function, name quoted
    Call {
        function: QualifiedName,
        args: Vec<Expr>,
    },
    /// jsonb_build_object('key', value, ...)
    JsonbObject(Vec<(String, Expr)>),
    /// jsonb_agg(expr ORDER BY ...)
    JsonbAgg {
        expr: Box<Expr>,
        order_by: Vec<OrderBy>,
    },
    /// Scalar subquery
    Subquery(Box<SelectStmt>),
    /// Raw SQL (escape hatch)
    Raw(String),
}

/// Target type of a cast.
#[derive(Debug, Clone, PartialEq)]
pub enum CastType {
    /// A built-in type name, rendered verbatim (e.g. `text[]`).
    Builtin(String),
    /// A table's row type, rendered quoted.
    Row(QualifiedName),
}

/// A column reference, optionally qualified with a table alias.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub table: Option<TableName>,
    pub column: ColumnName,
}

impl ColumnRef {
    pub fn new(column: ColumnName) -> Self {
        Self {
            table: None,
            column,
        }
    }

    pub fn qualified(table: TableName, column: ColumnName) -> Self {
        Self {
            table: Some(table),
            column,
        }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Eq => "=",
            BinOp::Ne => "<>",
            BinOp::And => "AND",
            BinOp::Or => "OR",
        }
    }
}

// Convenience constructors
impl Expr {
    pub fn param(name: ParamName) -> Self {
        Expr::Param(name)
    }

    pub fn column(name: ColumnName) -> Self {
        Expr::Column(ColumnRef::new(name))
    }

    pub fn qualified_column(table: TableName, column: ColumnName) -> Self {
        Expr::Column(ColumnRef::qualified(table, column))
    }

    pub fn excluded(column: ColumnName) -> Self {
        Expr::Excluded(column)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Expr::String(s.into())
    }

    pub fn int(n: i64) -> Self {
        Expr::Int(n)
    }

    pub fn bool(b: bool) -> Self {
        Expr::Bool(b)
    }

    /// Access a field of this composite value: (self)."field"
    pub fn field(self, field: ColumnName) -> Self {
        Expr::Field {
            record: Box::new(self),
            field,
        }
    }

    /// Cast to a built-in type: (self)::ty
    pub fn cast(self, ty: impl Into<String>) -> Self {
        Expr::Cast {
            expr: Box::new(self),
            ty: CastType::Builtin(ty.into()),
        }
    }

    /// Cast to a table's row type: (self)::"schema"."table"
    pub fn cast_row(self, table: QualifiedName) -> Self {
        Expr::Cast {
            expr: Box::new(self),
            ty: CastType::Row(table),
        }
    }

    /// Create an equality expression: self = other
    pub fn eq(self, other: Expr) -> Self {
        Expr::BinOp {
            left: Box::new(self),
            op: BinOp::Eq,
            right: Box::new(other),
        }
    }

    /// Create an AND expression: self AND other
    pub fn and(self, other: Expr) -> Self {
        Expr::BinOp {
            left: Box::new(self),
            op: BinOp::And,
            right: Box::new(other),
        }
    }

    /// Create an OR expression: self OR other
    pub fn or(self, other: Expr) -> Self {
        Expr::BinOp {
            left: Box::new(self),
            op: BinOp::Or,
            right: Box::new(other),
        }
    }

    /// Create IS NULL expression
    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    /// Create IS NOT NULL expression
    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    /// Wrap a SELECT as a scalar subquery.
    pub fn subquery(stmt: SelectStmt) -> Self {
        Expr::Subquery(Box::new(stmt))
    }
}
