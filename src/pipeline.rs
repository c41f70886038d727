//! Pipeline orchestration
//!
//! This module provides the public API for computing cohort metrics.
//! It composes the stages from typed input tables to encoded output files.

use crate::cohort::{CohortAssigner, CohortAssignment};
use crate::config::PipelineConfig;
use crate::encoder::{commit_files, EncodedFile, RunManifest, TableEncoder};
use crate::error::{MetricsError, MetricsResult};
use crate::incident::{IncidentRateCalculator, IncidentRates};
use crate::ledger::Ledger;
use crate::matrix::MatrixBuilder;
use crate::monetization::{Monetization, MonetizationEstimator};
use crate::overview::monthly_overview;
use crate::retention::{FilteredRetention, RetentionCalculator};
use crate::revenue::{RevenueAggregator, RevenueMatrices};
use crate::schema::InputTables;
use crate::types::{CalendarMatrix, MonthlyOverview, OffsetMatrix, Timeline};
use std::path::Path;

/// Everything a pipeline run computes, before encoding
#[derive(Debug, Clone)]
pub struct PipelineOutputs {
    pub timeline: Timeline,
    pub transaction_count: usize,
    pub fee_count: usize,
    pub assignment: CohortAssignment,
    pub usage: CalendarMatrix<u64>,
    pub retention: OffsetMatrix<f64>,
    pub filtered_retention: FilteredRetention,
    pub incidents: IncidentRates,
    pub revenue: RevenueMatrices,
    pub monetization: Monetization,
    pub overview: Vec<MonthlyOverview>,
}

/// Result of checking input tables without computing metrics
#[derive(Debug, Clone, PartialEq)]
pub struct InputSummary {
    pub timeline: Timeline,
    pub transactions: usize,
    pub fees: usize,
    pub users: usize,
    pub cohorts: usize,
}

/// Validated ledger, cohort assignment and timeline shared by every stage
struct Prepared {
    ledger: Ledger,
    assignment: CohortAssignment,
    timeline: Timeline,
}

fn prepare_inputs(tables: &InputTables) -> MetricsResult<Prepared> {
    let ledger = Ledger::from_merged(&tables.merged_cash_fee)?;
    let timeline = ledger.timeline().ok_or_else(|| {
        MetricsError::EmptyInput("merged_cash_fee contains no cash requests".to_string())
    })?;

    let assignment = CohortAssigner::assign(&ledger);
    assignment.reconcile(&tables.user_first_request)?;

    Ok(Prepared {
        ledger,
        assignment,
        timeline,
    })
}

/// Run schema and referential checks only.
///
/// Succeeds when the tables would be accepted by [`run_pipeline`] under
/// the same configuration.
pub fn validate_inputs(tables: &InputTables, config: &PipelineConfig) -> MetricsResult<InputSummary> {
    let config = normalized(config)?;
    let prepared = prepare_inputs(tables)?;
    CohortAssigner::augment(&prepared.ledger, &prepared.assignment)?;
    // fee charge months are only checked while aggregating
    RevenueAggregator::aggregate(
        &prepared.ledger,
        &prepared.assignment,
        prepared.timeline,
        &config.revenue,
    )?;

    Ok(InputSummary {
        timeline: prepared.timeline,
        transactions: prepared.ledger.transaction_count(),
        fees: prepared.ledger.fee_count(),
        users: prepared.assignment.user_count(),
        cohorts: prepared.assignment.sizes().len(),
    })
}

/// Normalized, validated copy of a configuration
fn normalized(config: &PipelineConfig) -> MetricsResult<PipelineConfig> {
    let mut config = config.clone();
    config.normalize();
    config.validate()?;
    Ok(config)
}

/// Compute every cohort metric from loaded input tables.
///
/// Pipeline stages:
/// 1. Ledger - fold merged rows into transactions and fees
/// 2. CohortAssigner - assign users, reconcile, tag transactions
/// 3. MatrixBuilder - usage counts per cohort and month
/// 4. RetentionCalculator - full and filtered retention
/// 5. IncidentRateCalculator - incident share per cohort and offset
/// 6. RevenueAggregator - monthly and cumulative revenue
/// 7. MonetizationEstimator - ARPU and CLV
pub fn run_pipeline(tables: &InputTables, config: &PipelineConfig) -> MetricsResult<PipelineOutputs> {
    let config = normalized(config)?;
    let config = &config;

    // Stage 1-2: Ledger and cohorts
    let Prepared {
        ledger,
        assignment,
        timeline,
    } = prepare_inputs(tables)?;
    let events = CohortAssigner::augment(&ledger, &assignment)?;

    // Stage 3: Usage
    let usage = MatrixBuilder::usage(&events, timeline, config.usage_measure);

    // Stage 4: Retention
    let retention = RetentionCalculator::full(&usage, timeline)?;
    let filtered_retention =
        RetentionCalculator::filtered(&retention, &assignment, timeline, &config.retention);

    // Stage 5: Incidents
    let incidents = IncidentRateCalculator::compute(&events, timeline);

    // Stage 6: Revenue
    let revenue = RevenueAggregator::aggregate(&ledger, &assignment, timeline, &config.revenue)?;

    // Stage 7: ARPU and CLV
    let monetization = MonetizationEstimator::estimate(
        &assignment,
        &revenue,
        &retention,
        &filtered_retention.partial_months,
    )?;

    let overview = monthly_overview(
        &ledger,
        &tables.monthly_active_users,
        &tables.transfer_type_share,
    );

    log::info!(
        "Pipeline complete: {} cohorts over {}..{}",
        assignment.sizes().len(),
        timeline.first,
        timeline.last
    );

    Ok(PipelineOutputs {
        timeline,
        transaction_count: ledger.transaction_count(),
        fee_count: ledger.fee_count(),
        assignment,
        usage,
        retention,
        filtered_retention,
        incidents,
        revenue,
        monetization,
        overview,
    })
}

/// Processor that owns a configuration and an encoder for one run id.
pub struct CohortProcessor {
    config: PipelineConfig,
    encoder: TableEncoder,
}

impl Default for CohortProcessor {
    fn default() -> Self {
        Self {
            config: PipelineConfig::default(),
            encoder: TableEncoder::default(),
        }
    }
}

impl CohortProcessor {
    /// Create a processor, rejecting an invalid configuration
    pub fn new(config: PipelineConfig) -> MetricsResult<Self> {
        let config = normalized(&config)?;
        let encoder = TableEncoder::new(config.undefined_cell.clone());
        Ok(Self { config, encoder })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Compute outputs for in-memory tables
    pub fn process(&self, tables: &InputTables) -> MetricsResult<PipelineOutputs> {
        run_pipeline(tables, &self.config)
    }

    /// Encode outputs into files, manifest last
    pub fn encode(&self, outputs: &PipelineOutputs) -> MetricsResult<(Vec<EncodedFile>, RunManifest)> {
        let mut files = self.encoder.encode_outputs(outputs)?;
        let manifest = self.encoder.manifest(outputs, &self.config, &files);
        files.push(TableEncoder::encode_manifest(&manifest)?);
        Ok((files, manifest))
    }

    /// Load tables from `input_dir`, compute, and commit every output to `output_dir`
    pub fn process_dir(&self, input_dir: &Path, output_dir: &Path) -> MetricsResult<RunManifest> {
        log::info!("Run {}: reading {}", self.encoder.run_id(), input_dir.display());
        let tables = InputTables::load_dir(input_dir)?;
        let outputs = self.process(&tables)?;
        let (files, manifest) = self.encode(&outputs)?;
        commit_files(output_dir, &files)?;
        Ok(manifest)
    }
}
