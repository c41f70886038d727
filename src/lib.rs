//! cashflow-cohorts - Batch compute engine for cash-advance cohort metrics
//!
//! Cohorts transforms cleaned cash request and fee tables into cohort
//! matrices and summaries through a deterministic pipeline: ledger → cohort
//! assignment → usage matrix → retention / incident / revenue → ARPU and CLV
//! → CSV encoding.
//!
//! ## Modules
//!
//! - **Preparation**: Clean raw exports into the pipeline's input tables
//! - **Pipeline**: Compute every matrix and summary and commit them as one output set

pub mod cohort;
pub mod config;
pub mod encoder;
pub mod error;
pub mod incident;
pub mod ledger;
pub mod matrix;
pub mod monetization;
pub mod overview;
pub mod pipeline;
pub mod prepare;
pub mod retention;
pub mod revenue;
pub mod schema;
pub mod types;

pub use config::PipelineConfig;
pub use error::{MetricsError, MetricsResult};
pub use pipeline::{run_pipeline, validate_inputs, CohortProcessor, PipelineOutputs};
pub use prepare::Preparer;

// Schema exports
pub use schema::{InputTables, TableReader, SCHEMA_VERSION};

/// Crate version recorded in every run manifest
pub const COHORTS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name recorded in every run manifest
pub const PRODUCER_NAME: &str = "cashflow-cohorts";
