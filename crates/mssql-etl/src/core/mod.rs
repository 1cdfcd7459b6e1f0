//! Core value and identifier types shared by every component.
//!
//! - [`value`]: owned SQL values and fetched row sets
//! - [`identifier`]: T-SQL identifier parsing and quoting

pub mod identifier;
pub mod value;

pub use identifier::{quote_ident, TableName};
pub use value::{quote_literal, RowSet, SqlValue};
