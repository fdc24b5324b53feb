//! Batch upserts for Postgres.
//!
//! An upsert writes a batch of rows into one table with a single
//! `INSERT ... ON CONFLICT (<primary key>) DO UPDATE` statement and returns
//! the written rows shaped by a caller-supplied [`Projection`], which may
//! reach into related tables and computed fields.
//!
//! Each upsert runs under a savepoint inside the caller's transaction: on
//! failure only the upsert's own effects are undone and the transaction stays
//! usable.
//!
//! ```ignore
//! let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
//! tokio::spawn(connection);
//! let tx = client.transaction().await?;
//!
//! let mut upserter = Upserter::new(&tx);
//! let payload = upserter
//!     .upsert(
//!         &schema,
//!         UpsertRequest::new(QualifiedName::new("app", "items"))
//!             .row(row)
//!             .projection(Projection::new().field("id").field("name"))
//!             .client_mutation_id("m-1"),
//!     )
//!     .await?;
//! tx.commit().await?;
//! ```
//!
//! # Pipeline
//!
//! 1. [`UpsertPlan::new`] checks the request against table metadata.
//!    Nothing is sent if it fails, or if the batch is empty.
//! 2. [`Executor`] opens a savepoint.
//! 3. [`UpsertPlan::compile`] coerces the values and builds the statement.
//! 4. [`Projector`] runs the statement, then projects the written rows.
//! 5. The savepoint is released, or rolled back on any failure.
//! 6. [`UpsertPayload::assemble`] pairs the rows with the correlation token.

mod coerce;
mod compile;
pub mod config;
mod error;
mod execute;
mod payload;
mod project;
mod projection;
pub mod query;
pub mod session;
mod upsert;

#[cfg(test)]
mod testing;

pub use coerce::coerce;
pub use compile::{CompiledUpsert, InputRow, UpsertPlan};
pub use config::{ColumnPolicy, Config, ConfigError};
pub use error::{ConfigurationError, Error, ExecutionError, Result, ValidationError};
pub use execute::Executor;
pub use payload::{ProjectedRow, UpsertPayload};
pub use project::Projector;
pub use projection::{Projection, ProjectionField};
pub use query::Value;
pub use session::{Session, StoreError};
pub use upsert::{UpsertRequest, Upserter};

pub use pgupsert_schema::{
    ColumnDescriptor, ComputedField, MetadataProvider, PgType, QualifiedName, Relation,
    RelationKind, Schema, TableDescriptor, TypeModifier,
};
