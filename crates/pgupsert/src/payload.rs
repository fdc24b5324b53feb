//! The response envelope.

use indexmap::IndexMap;

use crate::query::Value;

/// One output row, keyed by the projection's output keys in selection order.
pub type ProjectedRow = IndexMap<String, Value>;

/// Projected rows plus the caller's correlation token, echoed unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertPayload {
    pub client_mutation_id: Option<String>,
    pub rows: Vec<ProjectedRow>,
}

impl UpsertPayload {
    pub fn assemble(client_mutation_id: Option<String>, rows: Vec<ProjectedRow>) -> Self {
        Self {
            client_mutation_id,
            rows,
        }
    }

    /// The row of a single-row upsert. `None` only for an empty batch.
    pub fn row(&self) -> Option<&ProjectedRow> {
        self.rows.first()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
