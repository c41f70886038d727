//! Tabular input schema
//!
//! Every CSV table the pipeline consumes or produces during preparation has a
//! typed row struct with an explicit column contract. Tables are validated
//! against their contract before any row is deserialized, so a missing column
//! fails fast with the table and column name.

mod reader;
mod tables;

pub use reader::*;
pub use tables::*;

/// Version of the input table contract
pub const SCHEMA_VERSION: &str = "cohort.tables.v1";
