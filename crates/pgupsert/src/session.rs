//! The connection an upsert runs on.
//!
//! Every store call is wrapped in a `tracing::debug_span!` carrying the SQL,
//! the parameter count and the number of rows returned or affected.

use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;

use pgupsert_schema::PgType;
use thiserror::Error;
use tokio_postgres::GenericClient;
use tokio_postgres::types::ToSql;
use tracing::Instrument;

use crate::query::{SqlParam, Value, pg_row_to_values, sql_params};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A database session that an upsert can run on.
///
/// Implemented for `tokio_postgres::Client`, `tokio_postgres::Transaction` and
/// `deadpool_postgres::Object`. The session is expected to be inside a
/// transaction already: upserts open savepoints, which Postgres only allows in
/// a transaction block.
pub trait Session: Send + Sync {
    /// Execute a query and decode each column with the given type.
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [Value],
        types: &'a [PgType],
    ) -> BoxFuture<'a, Result<Vec<Vec<Value>>, StoreError>>;

    /// Execute one or more parameterless statements in a single round trip.
    ///
    /// The statement must be sent by the first poll of the returned future,
    /// as tokio-postgres does: a dropped upsert queues its savepoint rollback
    /// by polling this once.
    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// A failure reported by (or while talking to) the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("postgres error: {}", pg_message(.0))]
    Postgres(#[from] tokio_postgres::Error),

    #[error("column {column:?} has type {actual}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },

    #[error("failed to read column {column:?} as {expected}: {message}")]
    ColumnRead {
        column: String,
        expected: String,
        message: String,
    },

    /// An error reported by a session that is not a tokio-postgres connection.
    #[error("{message} (SQLSTATE {code})")]
    Reported { code: String, message: String },
}

impl StoreError {
    /// The SQLSTATE code, when the store reported one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            StoreError::Postgres(e) => e.code().map(|c| c.code()),
            StoreError::Reported { code, .. } => Some(code),
            StoreError::TypeMismatch { .. } | StoreError::ColumnRead { .. } => None,
        }
    }
}

fn pg_message(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => match db.detail() {
            Some(detail) => format!("{}: {}", db.message(), detail),
            None => db.message().to_string(),
        },
        None => e.to_string(),
    }
}

fn param_refs<'a>(params: &'a [SqlParam<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

async fn traced_query<C: GenericClient + Sync>(
    client: &C,
    sql: &str,
    params: &[Value],
    types: &[PgType],
) -> Result<Vec<Vec<Value>>, StoreError> {
    let span = tracing::debug_span!(
        "db.query",
        sql = %sql,
        params = params.len(),
        rows = tracing::field::Empty,
    );
    let bound = sql_params(params);
    let refs = param_refs(&bound);
    let rows = client.query(sql, &refs).instrument(span.clone()).await?;
    span.record("rows", rows.len());
    rows.iter().map(|row| pg_row_to_values(row, types)).collect()
}

async fn traced_batch_execute<C: GenericClient + Sync>(
    client: &C,
    sql: &str,
) -> Result<(), StoreError> {
    let span = tracing::debug_span!("db.batch_execute", sql = %sql);
    client.batch_execute(sql).instrument(span).await?;
    Ok(())
}

impl Session for tokio_postgres::Client {
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [Value],
        types: &'a [PgType],
    ) -> BoxFuture<'a, Result<Vec<Vec<Value>>, StoreError>> {
        Box::pin(traced_query(self, sql, params, types))
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(traced_batch_execute(self, sql))
    }
}

impl Session for tokio_postgres::Transaction<'_> {
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [Value],
        types: &'a [PgType],
    ) -> BoxFuture<'a, Result<Vec<Vec<Value>>, StoreError>> {
        Box::pin(traced_query(self, sql, params, types))
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(traced_batch_execute(self, sql))
    }
}

impl Session for deadpool_postgres::Object {
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [Value],
        types: &'a [PgType],
    ) -> BoxFuture<'a, Result<Vec<Vec<Value>>, StoreError>> {
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(traced_query(client, sql, params, types))
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(traced_batch_execute(client, sql))
    }
}

impl<S: Session + ?Sized> Session for &S {
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [Value],
        types: &'a [PgType],
    ) -> BoxFuture<'a, Result<Vec<Vec<Value>>, StoreError>> {
        (**self).query(sql, params, types)
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).batch_execute(sql)
    }
}
