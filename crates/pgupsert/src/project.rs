//! Re-reading the mutated rows through the requested projection.
//!
//! The mutation runs as a data-modifying CTE whose `RETURNING *` rows are
//! serialized to their row type's text form. The second query casts that text
//! back to the row type and evaluates the projection over it, one output row
//! per mutated row, in mutation order. Two queries cover any projection depth.
//!
//! When the table has only key columns the insert uses `DO NOTHING`, which
//! returns no row for a key that already exists. Those rows are read back from
//! the table in the same statement, after the inserted ones.

use pgupsert_schema::{PgType, Relation, RelationKind, TableDescriptor};
use pgupsert_sql::{
    ColumnName, ConflictAction, Expr, FromClause, OrderBy, PG_IDENT_MAX, QualifiedName,
    SelectColumn, SelectStmt, TableName, WithStmt, is_plain_ident, render,
};
use tracing::debug;

use crate::compile::{CompiledUpsert, UpsertPlan};
use crate::error::Error;
use crate::payload::ProjectedRow;
use crate::projection::{FieldKind, ResolvedProjection};
use crate::query::Value;
use crate::session::Session;

const RECORD: &str = "__record";
const TEXT: &str = "__text";
const ORDINALITY: &str = "__ordinality";
const INPUT: &str = "__input";
const RECORDS_PARAM: &str = "records";
const EXISTING: &str = "__existing";

/// `_` followed by the decimal digits of a `u64`.
const ALIAS_SUFFIX_MAX: usize = 1 + 20;

/// Whether `prefix` names a valid CTE alias for every sequence number.
pub(crate) fn is_valid_alias_prefix(prefix: &str) -> bool {
    is_plain_ident(prefix) && prefix.len() + ALIAS_SUFFIX_MAX <= PG_IDENT_MAX
}

/// Hands out `t0`, `t1`, ... for relation subqueries.
struct AliasGen {
    next: usize,
}

impl AliasGen {
    fn new() -> Self {
        Self { next: 0 }
    }

    fn next_alias(&mut self) -> TableName {
        let alias = format!("t{}", self.next);
        self.next += 1;
        TableName::from(alias)
    }
}

/// The row a projection is evaluated against.
enum Source<'a> {
    /// A mutated row, as `"<alias>"."__record"`.
    Record(&'a TableName),
    /// A row of a relation subquery.
    Alias(&'a TableName),
}

impl Source<'_> {
    fn column(&self, name: &str) -> Expr {
        match self {
            Source::Record(alias) => {
                Expr::qualified_column((*alias).clone(), ColumnName::from(RECORD))
                    .field(ColumnName::from(name))
            }
            Source::Alias(alias) => {
                Expr::qualified_column((*alias).clone(), ColumnName::from(name))
            }
        }
    }

    fn row(&self) -> Expr {
        match self {
            Source::Record(alias) => {
                Expr::qualified_column((*alias).clone(), ColumnName::from(RECORD))
            }
            Source::Alias(alias) => Expr::column(ColumnName::from(alias.as_str())),
        }
    }
}

/// Runs a compiled upsert and projects its rows.
pub struct Projector<'p, 't> {
    alias: TableName,
    plan: &'p UpsertPlan<'t>,
}

impl<'p, 't> Projector<'p, 't> {
    /// The CTE and the derived table are named `<prefix>_<sequence>`. The
    /// caller hands out a fresh `sequence` for each upsert on a session.
    pub fn new(plan: &'p UpsertPlan<'t>, prefix: &str, sequence: u64) -> Self {
        Self {
            alias: TableName::from(format!("{prefix}_{sequence}")),
            plan,
        }
    }

    fn table(&self) -> &'t TableDescriptor {
        self.plan.table()
    }

    /// `WITH "<alias>" AS (<insert>) SELECT (("<alias>")::<table>)::text FROM "<alias>"`
    pub fn mutation_statement(&self, compiled: &CompiledUpsert) -> WithStmt {
        let mut body = SelectStmt::new()
            .column(SelectColumn::expr(self.row_text(&self.alias)))
            .from(FromClause::table(QualifiedName::bare(self.alias.as_str())));
        if let Some(existing) = self.existing_rows(compiled) {
            body = body.union_all(existing);
        }
        WithStmt::new(body).cte(self.alias.clone(), compiled.statement.clone())
    }

    fn row_text(&self, alias: &TableName) -> Expr {
        Expr::column(ColumnName::from(alias.as_str()))
            .cast_row(self.table().name.clone())
            .cast("text")
    }

    /// Under `DO NOTHING`, the batch's rows that were already in the table.
    ///
    /// The statement snapshot does not see rows the CTE inserts, so this never
    /// repeats a row the insert returned. Rows whose key is `DEFAULT` cannot
    /// match an existing row and are left out.
    fn existing_rows(&self, compiled: &CompiledUpsert) -> Option<SelectStmt> {
        let insert = &compiled.statement;
        let conflict = insert.on_conflict.as_ref()?;
        if conflict.action != ConflictAction::DoNothing {
            return None;
        }

        let alias = TableName::from(EXISTING);
        let positions = conflict
            .columns
            .iter()
            .map(|key| insert.columns.iter().position(|c| c == key))
            .collect::<Option<Vec<_>>>()?;

        let filter = insert
            .rows
            .iter()
            .filter_map(|row| {
                positions
                    .iter()
                    .zip(&conflict.columns)
                    .map(|(&i, key)| match row.get(i)? {
                        Expr::Default => None,
                        value => Some(
                            Expr::qualified_column(alias.clone(), key.clone()).eq(value.clone()),
                        ),
                    })
                    .collect::<Option<Vec<_>>>()?
                    .into_iter()
                    .reduce(Expr::and)
            })
            .reduce(Expr::or)?;

        Some(
            SelectStmt::new()
                .column(SelectColumn::expr(self.row_text(&alias)))
                .from(FromClause::aliased(self.table().name.clone(), alias))
                .where_(filter),
        )
    }

    /// The read-only projection over `$1`, the text form of the mutated rows.
    pub fn projection_statement(&self) -> SelectStmt {
        let table = self.table();
        let records = SelectStmt::new()
            .columns([
                SelectColumn::aliased(
                    Expr::column(ColumnName::from(TEXT)).cast_row(table.name.clone()),
                    ColumnName::from(RECORD),
                ),
                SelectColumn::expr(Expr::column(ColumnName::from(ORDINALITY))),
            ])
            .from(FromClause::unnest_with_ordinality(
                Expr::param(RECORDS_PARAM.into()).cast("text[]"),
                TableName::from(INPUT),
                [ColumnName::from(TEXT), ColumnName::from(ORDINALITY)],
            ));

        let mut aliases = AliasGen::new();
        let source = Source::Record(&self.alias);
        let columns = self
            .plan
            .projection
            .fields
            .iter()
            .map(|field| {
                let expr = field_expr(&field.kind, &source, &mut aliases);
                SelectColumn::aliased(expr, ColumnName::from(field.key.as_str()))
            })
            .collect::<Vec<_>>();

        SelectStmt::new()
            .columns(columns)
            .from(FromClause::subquery(records, self.alias.clone()))
            .order_by(OrderBy::asc(Expr::qualified_column(
                self.alias.clone(),
                ColumnName::from(ORDINALITY),
            )))
    }

    /// Decode type of each projected column. Relations come back as JSONB.
    pub fn output_types(&self) -> Vec<PgType> {
        self.plan
            .projection
            .fields
            .iter()
            .map(|field| match &field.kind {
                FieldKind::Column(column) => column.pg_type,
                FieldKind::Computed(computed) => computed.pg_type,
                FieldKind::Relation { .. } => PgType::Jsonb,
            })
            .collect()
    }

    /// Run the mutation, then the projection. Two round trips, or one when
    /// the projection selects nothing.
    pub async fn run<S: Session + ?Sized>(
        &self,
        session: &S,
        compiled: &CompiledUpsert,
    ) -> Result<Vec<ProjectedRow>, Error> {
        let mutation = render(&self.mutation_statement(compiled));
        let params = compiled.values_for(&mutation.params);
        debug!(alias = %self.alias, sql = %mutation.sql, "running mutation");
        let mutated = session
            .query(&mutation.sql, &params, &[PgType::Text])
            .await?;

        if self.plan.projection.is_empty() {
            debug!(rows = mutated.len(), "nothing selected, skipping projection");
            return Ok(vec![ProjectedRow::new(); mutated.len()]);
        }

        let records = Value::Array(
            mutated
                .into_iter()
                .map(|row| row.into_iter().next().unwrap_or(Value::Null))
                .collect(),
        );

        let projection = render(&self.projection_statement());
        debug!(alias = %self.alias, sql = %projection.sql, "running projection");
        let types = self.output_types();
        let rows = session
            .query(&projection.sql, &[records], &types)
            .await?;

        let keys: Vec<&str> = self
            .plan
            .projection
            .fields
            .iter()
            .map(|f| f.key.as_str())
            .collect();
        Ok(rows
            .into_iter()
            .map(|values| {
                keys.iter()
                    .map(|k| k.to_string())
                    .zip(values)
                    .collect::<ProjectedRow>()
            })
            .collect())
    }
}

fn field_expr(kind: &FieldKind<'_>, source: &Source<'_>, aliases: &mut AliasGen) -> Expr {
    match kind {
        FieldKind::Column(column) => source.column(&column.name),
        FieldKind::Computed(computed) => Expr::Call {
            function: computed.function.clone(),
            args: vec![source.row()],
        },
        FieldKind::Relation {
            relation,
            target,
            projection,
        } => relation_expr(relation, target, projection, source, aliases),
    }
}

/// A scalar subquery producing the related row(s) as JSONB.
fn relation_expr(
    relation: &Relation,
    target: &TableDescriptor,
    projection: &ResolvedProjection<'_>,
    source: &Source<'_>,
    aliases: &mut AliasGen,
) -> Expr {
    let alias = aliases.next_alias();
    let inner = Source::Alias(&alias);

    let object = Expr::JsonbObject(
        projection
            .fields
            .iter()
            .map(|field| (field.key.clone(), field_expr(&field.kind, &inner, aliases)))
            .collect(),
    );

    let mut select = SelectStmt::new().from(FromClause::aliased(target.name.clone(), alias.clone()));
    for (local, remote) in &relation.column_pairs {
        select = select.and_where(
            Expr::qualified_column(alias.clone(), ColumnName::from(remote.as_str()))
                .eq(source.column(local)),
        );
    }

    match relation.kind {
        RelationKind::ToOne => Expr::subquery(
            select
                .column(SelectColumn::expr(object))
                .limit(Expr::int(1)),
        ),
        RelationKind::ToMany => {
            let order_by = target
                .primary_key
                .iter()
                .map(|pk| {
                    OrderBy::asc(Expr::qualified_column(
                        alias.clone(),
                        ColumnName::from(pk.as_str()),
                    ))
                })
                .collect();
            let aggregate = select.column(SelectColumn::expr(Expr::JsonbAgg {
                expr: Box::new(object),
                order_by,
            }));
            Expr::FnCall {
                name: "COALESCE".into(),
                args: vec![
                    Expr::subquery(aggregate),
                    Expr::Raw("'[]'::jsonb".into()),
                ],
            }
        }
    }
}
