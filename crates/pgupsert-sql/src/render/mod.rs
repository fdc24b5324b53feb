//! Render SQL AST to string.

use std::cell::RefCell;
use std::fmt;

use indexmap::IndexMap;

use crate::expr::{CastType, ColumnRef, Expr};
use crate::stmt::*;
use crate::{Ident, ParamName, RenderedSql, escape_string};

/// `jsonb_build_object` accepts at most 100 arguments.
const JSONB_BUILD_OBJECT_MAX_PAIRS: usize = 50;

/// Mutable parameter tracking state.
struct ParamState {
    /// Named parameters mapped to their assigned positional index.
    params: IndexMap<ParamName, usize>,
    /// Next parameter index to assign (starts at 1 for `$1`).
    next_param_idx: usize,
}

impl ParamState {
    fn new() -> Self {
        Self {
            params: IndexMap::new(),
            next_param_idx: 1,
        }
    }

    /// Get or create a parameter index.
    fn get_or_insert(&mut self, name: &ParamName) -> usize {
        *self.params.entry(name.clone()).or_insert_with(|| {
            let idx = self.next_param_idx;
            self.next_param_idx += 1;
            idx
        })
    }
}

/// Rendering context that tracks parameter assignment.
///
/// Uses interior mutability (`RefCell`) so that `Render::render` can take `&self`,
/// enabling the `Fmt` wrapper to implement `Display`.
pub struct RenderContext {
    params: RefCell<ParamState>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self {
            params: RefCell::new(ParamState::new()),
        }
    }

    /// Get or create a parameter placeholder index.
    fn param_idx(&self, name: &ParamName) -> usize {
        self.params.borrow_mut().get_or_insert(name)
    }

    /// Finish rendering and return the collected params.
    fn into_params(self) -> Vec<ParamName> {
        self.params.into_inner().params.into_keys().collect()
    }
}

impl Default for RenderContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrapper for rendering a `Render` type via `Display`.
///
/// Allows using `write!(f, "{}", Fmt(ctx, &expr))` in format strings.
pub struct Fmt<'a, T: Render>(&'a RenderContext, &'a T);

impl<T: Render> fmt::Display for Fmt<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.1.render(self.0, f)
    }
}

/// Write `items` separated by `sep`.
fn write_list<T: Render>(
    ctx: &RenderContext,
    f: &mut fmt::Formatter<'_>,
    items: &[T],
    sep: &str,
) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{}", Fmt(ctx, item))?;
    }
    Ok(())
}

/// Write quoted column names separated by `, `.
fn write_idents(f: &mut fmt::Formatter<'_>, names: &[crate::ColumnName]) -> fmt::Result {
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", Ident(name.as_str()))?;
    }
    Ok(())
}

// ============================================================================
// Render implementations
// ============================================================================

/// Trait for types that can be rendered to SQL.
pub trait Render {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl Render for Expr {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Param(name) => {
                let idx = ctx.param_idx(name);
                write!(f, "${idx}")
            }
            Expr::Column(col) => col.render(ctx, f),
            Expr::Excluded(col) => {
                let col = Ident(col.as_str());
                write!(f, "EXCLUDED.{col}")
            }
            Expr::Field { record, field } => {
                let record = Fmt(ctx, record.as_ref());
                let field = Ident(field.as_str());
                write!(f, "({record}).{field}")
            }
            Expr::String(s) => {
                let escaped = escape_string(s);
                write!(f, "{escaped}")
            }
            Expr::Int(n) => write!(f, "{n}"),
            Expr::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Expr::Null => write!(f, "NULL"),
            Expr::Default => write!(f, "DEFAULT"),
            Expr::BinOp { left, op, right } => {
                let left = Fmt(ctx, left.as_ref());
                let right = Fmt(ctx, right.as_ref());
                let op = op.as_str();
                write!(f, "{left} {op} {right}")
            }
            Expr::IsNull { expr, negated } => {
                let expr = Fmt(ctx, expr.as_ref());
                let suffix = if *negated { " IS NOT NULL" } else { " IS NULL" };
                write!(f, "{expr}{suffix}")
            }
            Expr::Cast { expr, ty } => {
                let expr = Fmt(ctx, expr.as_ref());
                match ty {
                    CastType::Builtin(name) => write!(f, "({expr})::{name}"),
                    CastType::Row(table) => write!(f, "({expr})::{table}"),
                }
            }
            Expr::FnCall { name, args } => {
                write!(f, "{name}(")?;
                write_list(ctx, f, args, ", ")?;
                write!(f, ")")
            }
            Expr::Call { function, args } => {
                write!(f, "{function}(")?;
                write_list(ctx, f, args, ", ")?;
                write!(f, ")")
            }
            Expr::JsonbObject(pairs) => {
                if pairs.is_empty() {
                    return write!(f, "jsonb_build_object()");
                }
                for (i, chunk) in pairs.chunks(JSONB_BUILD_OBJECT_MAX_PAIRS).enumerate() {
                    if i > 0 {
                        write!(f, " || ")?;
                    }
                    write!(f, "jsonb_build_object(")?;
                    for (j, (key, value)) in chunk.iter().enumerate() {
                        if j > 0 {
                            write!(f, ", ")?;
                        }
                        let key = escape_string(key);
                        let value = Fmt(ctx, value);
                        write!(f, "{key}, {value}")?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
            Expr::JsonbAgg { expr, order_by } => {
                let expr = Fmt(ctx, expr.as_ref());
                write!(f, "jsonb_agg({expr}")?;
                if !order_by.is_empty() {
                    write!(f, " ORDER BY ")?;
                    write_list(ctx, f, order_by, ", ")?;
                }
                write!(f, ")")
            }
            Expr::Subquery(stmt) => {
                let stmt = Fmt(ctx, stmt.as_ref());
                write!(f, "({stmt})")
            }
            Expr::Raw(s) => write!(f, "{s}"),
        }
    }
}

impl Render for ColumnRef {
    fn render(&self, _ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(table) = &self.table {
            let table = Ident(table.as_str());
            write!(f, "{table}.")?;
        }
        let column = Ident(self.column.as_str());
        write!(f, "{column}")
    }
}

impl Render for OrderBy {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expr = Fmt(ctx, &self.expr);
        let dir = if self.desc { "DESC" } else { "ASC" };
        write!(f, "{expr} {dir}")
    }
}

impl Render for SelectStmt {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT")?;

        // Columns
        if self.columns.is_empty() {
            write!(f, " *")?;
        } else {
            for (i, col) in self.columns.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, " {}", Fmt(ctx, col))?;
            }
        }

        // FROM
        if let Some(from) = &self.from {
            write!(f, "\nFROM {}", Fmt(ctx, from))?;
        }

        // WHERE
        if let Some(where_) = &self.where_ {
            let where_ = Fmt(ctx, where_);
            write!(f, "\nWHERE {where_}")?;
        }

        // ORDER BY
        if !self.order_by.is_empty() {
            write!(f, "\nORDER BY ")?;
            write_list(ctx, f, &self.order_by, ", ")?;
        }

        // LIMIT
        if let Some(limit) = &self.limit {
            let limit = Fmt(ctx, limit);
            write!(f, "\nLIMIT {limit}")?;
        }

        for stmt in &self.union_all {
            let stmt = Fmt(ctx, stmt);
            write!(f, "\nUNION ALL\n{stmt}")?;
        }

        Ok(())
    }
}

impl Render for SelectColumn {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectColumn::Expr { expr, alias } => {
                let expr = Fmt(ctx, expr);
                write!(f, "{expr}")?;
                if let Some(alias) = alias {
                    let alias = Ident(alias.as_str());
                    write!(f, " AS {alias}")?;
                }
                Ok(())
            }
            SelectColumn::AllFrom(table) => {
                let table = Ident(table.as_str());
                write!(f, "{table}.*")
            }
        }
    }
}

impl Render for FromClause {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            FromSource::Table(table) => {
                write!(f, "{table}")?;
                if let Some(alias) = &self.alias {
                    let alias = Ident(alias.as_str());
                    write!(f, " {alias}")?;
                }
                Ok(())
            }
            FromSource::Subquery(stmt) => {
                let stmt = Fmt(ctx, stmt.as_ref());
                write!(f, "({stmt})")?;
                if let Some(alias) = &self.alias {
                    let alias = Ident(alias.as_str());
                    write!(f, " AS {alias}")?;
                }
                Ok(())
            }
            FromSource::Unnest {
                array,
                with_ordinality,
                columns,
            } => {
                let array = Fmt(ctx, array);
                write!(f, "unnest({array})")?;
                if *with_ordinality {
                    write!(f, " WITH ORDINALITY")?;
                }
                if let Some(alias) = &self.alias {
                    let alias = Ident(alias.as_str());
                    write!(f, " AS {alias}")?;
                    if !columns.is_empty() {
                        write!(f, "(")?;
                        write_idents(f, columns)?;
                        write!(f, ")")?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl Render for InsertStmt {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "INSERT INTO {}", self.table)?;

        if self.columns.is_empty() {
            write!(f, " DEFAULT VALUES")?;
        } else {
            write!(f, " (")?;
            write_idents(f, &self.columns)?;
            write!(f, ")")?;

            // VALUES
            write!(f, "\nVALUES ")?;
            for (i, row) in self.rows.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "(")?;
                write_list(ctx, f, row, ", ")?;
                write!(f, ")")?;
            }
        }

        // ON CONFLICT
        if let Some(conflict) = &self.on_conflict {
            write!(f, "\nON CONFLICT (")?;
            write_idents(f, &conflict.columns)?;
            write!(f, ")")?;

            match &conflict.action {
                ConflictAction::DoNothing => {
                    write!(f, " DO NOTHING")?;
                }
                ConflictAction::DoUpdate(assignments) => {
                    write!(f, " DO UPDATE SET ")?;
                    for (i, assign) in assignments.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        let col = Ident(assign.column.as_str());
                        let val = Fmt(ctx, &assign.value);
                        write!(f, "{col} = {val}")?;
                    }
                }
            }
        }

        // RETURNING
        match &self.returning {
            Returning::Nothing => {}
            Returning::All => write!(f, "\nRETURNING *")?,
            Returning::Columns(cols) => {
                write!(f, "\nRETURNING ")?;
                write_idents(f, cols)?;
            }
        }

        Ok(())
    }
}

impl Render for WithStmt {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.ctes.is_empty() {
            write!(f, "WITH ")?;
            for (i, (name, stmt)) in self.ctes.iter().enumerate() {
                if i > 0 {
                    writeln!(f, ",")?;
                }
                let name = Ident(name.as_str());
                let stmt = Fmt(ctx, stmt);
                write!(f, "{name} AS (\n{stmt}\n)")?;
            }
            writeln!(f)?;
        }
        self.body.render(ctx, f)
    }
}

impl Render for Stmt {
    fn render(&self, ctx: &RenderContext, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Select(s) => s.render(ctx, f),
            Stmt::Insert(s) => s.render(ctx, f),
            Stmt::With(s) => s.render(ctx, f),
        }
    }
}

// ============================================================================
// Convenience methods
// ============================================================================

/// Render a statement to SQL.
pub fn render(stmt: &impl Render) -> RenderedSql {
    let ctx = RenderContext::new();
    let sql = format!("{}", Fmt(&ctx, stmt));
    RenderedSql {
        sql,
        params: ctx.into_params(),
    }
}
