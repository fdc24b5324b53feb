//! The upsert pipeline: plan, savepoint, mutation, projection, payload.

use std::sync::atomic::AtomicBool;

use pgupsert_config::{ColumnPolicy, Config, DEFAULT_ALIAS_PREFIX, DEFAULT_SAVEPOINT};
use pgupsert_schema::{MetadataProvider, QualifiedName};
use pgupsert_sql::is_plain_ident;
use tracing::{Instrument, debug};

use crate::compile::{InputRow, UpsertPlan};
use crate::error::{ConfigurationError, Error};
use crate::execute::Executor;
use crate::payload::{ProjectedRow, UpsertPayload};
use crate::project::{Projector, is_valid_alias_prefix};
use crate::projection::Projection;
use crate::session::Session;

/// A batch of rows to write into one table.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRequest {
    pub table: QualifiedName,
    pub rows: Vec<InputRow>,
    pub projection: Projection,
    /// Opaque token echoed back in the payload.
    pub client_mutation_id: Option<String>,
}

impl UpsertRequest {
    pub fn new(table: impl Into<QualifiedName>) -> Self {
        Self {
            table: table.into(),
            rows: Vec::new(),
            projection: Projection::new(),
            client_mutation_id: None,
        }
    }

    pub fn row(mut self, row: InputRow) -> Self {
        self.rows.push(row);
        self
    }

    pub fn rows(mut self, rows: impl IntoIterator<Item = InputRow>) -> Self {
        self.rows.extend(rows);
        self
    }

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn client_mutation_id(mut self, id: impl Into<String>) -> Self {
        self.client_mutation_id = Some(id.into());
        self
    }
}

/// Runs upserts on one session.
///
/// Upserts on the same `Upserter` are serialized by `&mut self`. The session
/// must already be inside a transaction.
///
/// If an upsert future is dropped before it finishes, the rollback of its
/// savepoint is queued on the session as it is dropped. Should that fail, the
/// rollback is retried at the start of the next upsert, by
/// [`Upserter::recover`], or by [`Upserter::into_inner`].
pub struct Upserter<S> {
    session: S,
    policy: ColumnPolicy,
    savepoint: String,
    alias_prefix: String,
    alias_counter: u64,
    pending_rollback: AtomicBool,
}

impl<S: Session> Upserter<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            policy: ColumnPolicy::default(),
            savepoint: DEFAULT_SAVEPOINT.to_string(),
            alias_prefix: DEFAULT_ALIAS_PREFIX.to_string(),
            alias_counter: 0,
            pending_rollback: AtomicBool::new(false),
        }
    }

    /// Use the settings from `config`. The savepoint name and alias prefix
    /// end up in statement text and must be plain identifiers. The prefix
    /// also leaves room for the `_<n>` suffix within Postgres' identifier
    /// length.
    pub fn with_config(session: S, config: &Config) -> Result<Self, Error> {
        let savepoint = config.savepoint();
        if !is_plain_ident(savepoint) {
            return Err(ConfigurationError::InvalidSavepoint(savepoint.to_string()).into());
        }
        let alias_prefix = config.alias_prefix();
        if !is_valid_alias_prefix(alias_prefix) {
            return Err(ConfigurationError::InvalidAliasPrefix(alias_prefix.to_string()).into());
        }

        Ok(Self {
            session,
            policy: config.column_policy(),
            savepoint: savepoint.to_string(),
            alias_prefix: alias_prefix.to_string(),
            alias_counter: 0,
            pending_rollback: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Insert or update every row of `request`, then return them shaped by
    /// its projection.
    ///
    /// Metadata and shape errors are returned before anything is sent. An
    /// empty batch sends nothing. Otherwise the rows are written under a
    /// savepoint that is released on success and rolled back on failure, in
    /// four round trips when everything succeeds.
    pub async fn upsert<P: MetadataProvider + ?Sized>(
        &mut self,
        provider: &P,
        request: UpsertRequest,
    ) -> Result<UpsertPayload, Error> {
        let span = tracing::info_span!(
            "upsert",
            table = %request.table,
            rows = request.rows.len(),
        );
        self.upsert_inner(provider, request).instrument(span).await
    }

    /// Upsert a single row. [`UpsertPayload::row`] is the projected row.
    pub async fn upsert_one<P: MetadataProvider + ?Sized>(
        &mut self,
        provider: &P,
        table: impl Into<QualifiedName>,
        row: InputRow,
        projection: Projection,
        client_mutation_id: Option<String>,
    ) -> Result<UpsertPayload, Error> {
        let request = UpsertRequest {
            table: table.into(),
            rows: vec![row],
            projection,
            client_mutation_id,
        };
        self.upsert(provider, request).await
    }

    /// Roll back a savepoint left open by a dropped upsert, if any.
    pub async fn recover(&mut self) -> Result<(), Error> {
        self.executor().recover().await?;
        Ok(())
    }

    /// Hand the session back, after rolling back anything a dropped upsert
    /// left open.
    pub async fn into_inner(mut self) -> Result<S, Error> {
        self.recover().await?;
        Ok(self.session)
    }

    async fn upsert_inner<P: MetadataProvider + ?Sized>(
        &mut self,
        provider: &P,
        request: UpsertRequest,
    ) -> Result<UpsertPayload, Error> {
        let UpsertRequest {
            table,
            rows,
            projection,
            client_mutation_id,
        } = request;

        let table = provider.table(&table).ok_or(Error::NotFound(table))?;
        let plan = UpsertPlan::new(provider, table, rows, &projection, self.policy)?;

        if plan.is_empty() {
            debug!("no rows to write");
            return Ok(UpsertPayload::assemble(client_mutation_id, Vec::new()));
        }

        let sequence = self.next_sequence();
        let projector = Projector::new(&plan, &self.alias_prefix, sequence);
        let rows = self
            .executor()
            .run(write(&self.session, &plan, &projector))
            .await?;

        debug!(rows = rows.len(), "upsert complete");
        Ok(UpsertPayload::assemble(client_mutation_id, rows))
    }

    fn executor(&self) -> Executor<'_, S> {
        Executor::new(&self.session, &self.savepoint, &self.pending_rollback)
    }

    fn next_sequence(&mut self) -> u64 {
        self.alias_counter += 1;
        self.alias_counter
    }
}

async fn write<S: Session + ?Sized>(
    session: &S,
    plan: &UpsertPlan<'_>,
    projector: &Projector<'_, '_>,
) -> Result<Vec<ProjectedRow>, Error> {
    let compiled = plan.compile()?;
    projector.run(session, &compiled).await
}
