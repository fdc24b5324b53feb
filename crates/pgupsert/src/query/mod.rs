//! Runtime values and their Postgres mapping.

mod row;
mod value;

pub use row::{SqlParam, pg_row_to_values, pg_value_to_value};
pub(crate) use row::sql_params;
pub use value::Value;
