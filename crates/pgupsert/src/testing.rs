//! In-memory session that records statements instead of running them.

use std::collections::VecDeque;
use std::sync::Mutex;

use pgupsert_schema::PgType;

use crate::query::Value;
use crate::session::{BoxFuture, Session, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CallKind {
    Query,
    Batch,
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub kind: CallKind,
    pub sql: String,
    pub params: Vec<Value>,
}

type QueryResult = Result<Vec<Vec<Value>>, (String, String)>;

#[derive(Default)]
pub(crate) struct FakeSession {
    calls: Mutex<Vec<Call>>,
    query_results: Mutex<VecDeque<QueryResult>>,
    batch_failures: Vec<(String, String, String)>,
    hang_queries: bool,
}

impl FakeSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every batch statement starting with `prefix`.
    pub fn fail_batch(mut self, prefix: &str, code: &str, message: &str) -> Self {
        self.batch_failures
            .push((prefix.to_string(), code.to_string(), message.to_string()));
        self
    }

    /// Queue the rows returned by the next query.
    pub fn respond(self, rows: Vec<Vec<Value>>) -> Self {
        self.query_results.lock().unwrap().push_back(Ok(rows));
        self
    }

    /// Queue a failure for the next query.
    pub fn respond_error(self, code: &str, message: &str) -> Self {
        self.query_results
            .lock()
            .unwrap()
            .push_back(Err((code.to_string(), message.to_string())));
        self
    }

    /// Queries never complete.
    pub fn hang_on_query(mut self) -> Self {
        self.hang_queries = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// SQL of every call, in order. Each entry is one round trip.
    pub fn statements(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.sql).collect()
    }

    fn record(&self, kind: CallKind, sql: &str, params: &[Value]) {
        self.calls.lock().unwrap().push(Call {
            kind,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
    }
}

impl Session for FakeSession {
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [Value],
        _types: &'a [PgType],
    ) -> BoxFuture<'a, Result<Vec<Vec<Value>>, StoreError>> {
        self.record(CallKind::Query, sql, params);
        if self.hang_queries {
            return Box::pin(std::future::pending());
        }
        let next = self.query_results.lock().unwrap().pop_front();
        Box::pin(async move {
            match next {
                Some(Ok(rows)) => Ok(rows),
                Some(Err((code, message))) => Err(StoreError::Reported { code, message }),
                None => Ok(Vec::new()),
            }
        })
    }

    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        self.record(CallKind::Batch, sql, &[]);
        let failure = self
            .batch_failures
            .iter()
            .find(|(prefix, _, _)| sql.starts_with(prefix.as_str()))
            .map(|(_, code, message)| StoreError::Reported {
                code: code.clone(),
                message: message.clone(),
            });
        Box::pin(async move {
            match failure {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }
}
