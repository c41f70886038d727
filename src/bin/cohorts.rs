//! Cohorts CLI - Command-line interface for cashflow-cohorts
//!
//! Commands:
//! - run: Compute every cohort metric from an input directory
//! - prepare: Clean raw exports into the pipeline's input tables
//! - validate: Check input tables without computing metrics
//! - schema: Print the input table contracts

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use cashflow_cohorts::config::{PipelineConfig, UsageMeasure};
use cashflow_cohorts::encoder::RunManifest;
use cashflow_cohorts::pipeline::{validate_inputs, CohortProcessor};
use cashflow_cohorts::prepare::Preparer;
use cashflow_cohorts::schema::{
    InputTables, MergedCashFeeRow, MonthlyActiveUsersRow, RawCashRequestRow, RawFeeRow,
    TableReader, TableSchema, TransferTypeShareRow, UserFirstRequestRow, SCHEMA_VERSION,
};
use cashflow_cohorts::types::YearMonth;
use cashflow_cohorts::{MetricsError, COHORTS_VERSION, PRODUCER_NAME};

/// Cohorts - cohort retention, incident and revenue metrics for cash-advance data
#[derive(Parser)]
#[command(name = "cohorts")]
#[command(version = COHORTS_VERSION)]
#[command(about = "Compute cohort metrics from cash request and fee tables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute all cohort metrics and write them to an output directory
    Run {
        /// Directory holding the four input tables
        #[arg(short, long)]
        input_dir: PathBuf,

        /// Directory receiving the output tables
        #[arg(short, long)]
        output_dir: PathBuf,

        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Minimum cohort size in the filtered retention view
        #[arg(long)]
        min_cohort_size: Option<u64>,

        /// Additional partial month to exclude (YYYY-MM, repeatable)
        #[arg(long = "exclude-month")]
        exclude_months: Vec<String>,

        /// Keep the first and last dataset months in the filtered view
        #[arg(long)]
        keep_edge_months: bool,

        /// What a usage cell counts
        #[arg(long, value_enum)]
        measure: Option<MeasureArg>,

        /// Print the run manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Clean raw cash request and fee exports into input tables
    Prepare {
        /// Raw cash requests CSV
        #[arg(long)]
        cash: PathBuf,

        /// Raw fees CSV
        #[arg(long)]
        fees: PathBuf,

        /// Directory receiving the prepared tables
        #[arg(short, long)]
        output_dir: PathBuf,
    },

    /// Check input tables for schema and referential errors
    Validate {
        /// Directory holding the four input tables
        #[arg(short, long)]
        input_dir: PathBuf,

        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the input table contracts
    Schema {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MeasureArg {
    /// Distinct cash requests per cell
    Requests,
    /// Distinct active users per cell
    ActiveUsers,
}

impl From<MeasureArg> for UsageMeasure {
    fn from(arg: MeasureArg) -> Self {
        match arg {
            MeasureArg::Requests => UsageMeasure::Requests,
            MeasureArg::ActiveUsers => UsageMeasure::ActiveUsers,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CohortsCliError> {
    match cli.command {
        Commands::Run {
            input_dir,
            output_dir,
            config,
            min_cohort_size,
            exclude_months,
            keep_edge_months,
            measure,
            json,
        } => {
            let overrides = RunOverrides {
                min_cohort_size,
                exclude_months,
                keep_edge_months,
                measure,
            };
            cmd_run(&input_dir, &output_dir, config.as_deref(), overrides, json)
        }

        Commands::Prepare {
            cash,
            fees,
            output_dir,
        } => cmd_prepare(&cash, &fees, &output_dir),

        Commands::Validate {
            input_dir,
            config,
            json,
        } => cmd_validate(&input_dir, config.as_deref(), json),

        Commands::Schema { json } => cmd_schema(json),
    }
}

struct RunOverrides {
    min_cohort_size: Option<u64>,
    exclude_months: Vec<String>,
    keep_edge_months: bool,
    measure: Option<MeasureArg>,
}

fn load_config(path: Option<&Path>, overrides: RunOverrides) -> Result<PipelineConfig, CohortsCliError> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };

    if let Some(size) = overrides.min_cohort_size {
        config.retention.min_cohort_size = size;
    }
    for month in &overrides.exclude_months {
        config.retention.exclude_months.push(month.parse::<YearMonth>()?);
    }
    if overrides.keep_edge_months {
        config.retention.exclude_dataset_edges = false;
    }
    if let Some(measure) = overrides.measure {
        config.usage_measure = measure.into();
    }

    config.normalize();
    config.validate()?;
    Ok(config)
}

fn cmd_run(
    input_dir: &Path,
    output_dir: &Path,
    config_path: Option<&Path>,
    overrides: RunOverrides,
    json: bool,
) -> Result<(), CohortsCliError> {
    let config = load_config(config_path, overrides)?;
    let processor = CohortProcessor::new(config)?;
    let manifest = processor.process_dir(input_dir, output_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
    } else {
        print_summary(&manifest, output_dir);
    }
    Ok(())
}

fn print_summary(manifest: &RunManifest, output_dir: &Path) {
    println!("Cohort Metrics");
    println!("==============");
    println!("Run id:        {}", manifest.producer.run_id);
    println!(
        "Window:        {} .. {}",
        manifest.window.first_month, manifest.window.last_month
    );
    println!("Transactions:  {}", manifest.totals.transactions);
    println!("Fees:          {}", manifest.totals.fees);
    println!("Users:         {}", manifest.totals.users);
    println!("Cohorts:       {}", manifest.totals.cohorts);
    println!("Revenue:       {:.2}", manifest.totals.total_revenue);

    if !manifest.exclusions.is_empty() {
        println!("\nExcluded from filtered retention:");
        for exclusion in &manifest.exclusions {
            println!("  - {} ({:?})", exclusion.cohort, exclusion.reason);
        }
    }

    println!("\nWrote {} files to {}", manifest.files.len(), output_dir.display());
}

fn cmd_prepare(cash: &Path, fees: &Path, output_dir: &Path) -> Result<(), CohortsCliError> {
    let (tables, report) = Preparer::prepare_files(cash, fees)?;
    let written = Preparer::write_tables(&tables, output_dir)?;

    println!("Prepared {} cash requests", report.cash_requests);
    println!(
        "Fees: {} kept, {} without cash request, {} orphaned",
        report.fees_kept, report.fees_without_link, report.orphan_fees
    );
    println!("Deleted-account ids used: {}", report.deleted_account_ids_used);
    for path in written {
        println!("  {}", path.display());
    }
    Ok(())
}

fn table_check<T, F>(dir: &Path, load: F) -> (ValidationCheck, Option<Vec<T>>)
where
    T: TableSchema,
    F: FnOnce(&Path) -> Result<Vec<T>, MetricsError>,
{
    match load(&dir.join(T::FILE_NAME)) {
        Ok(rows) => (
            ValidationCheck {
                name: T::TABLE.to_string(),
                status: CheckStatus::Ok,
                message: format!("{} rows", rows.len()),
            },
            Some(rows),
        ),
        Err(e) => (
            ValidationCheck {
                name: T::TABLE.to_string(),
                status: CheckStatus::Error,
                message: e.to_string(),
            },
            None,
        ),
    }
}

fn cmd_validate(input_dir: &Path, config_path: Option<&Path>, json: bool) -> Result<(), CohortsCliError> {
    let config = match config_path {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    let (users_check, users) =
        table_check::<UserFirstRequestRow, _>(input_dir, |p| TableReader::read_file(p));
    let (active_check, active) =
        table_check::<MonthlyActiveUsersRow, _>(input_dir, |p| TableReader::read_file(p));
    let (shares_check, shares) =
        table_check::<TransferTypeShareRow, _>(input_dir, |p| TableReader::read_file(p));
    let (merged_check, merged) =
        table_check::<MergedCashFeeRow, _>(input_dir, |p| TableReader::read_file(p));

    let mut checks = vec![users_check, active_check, shares_check, merged_check];

    match (users, active, shares, merged) {
        (Some(user_first_request), Some(monthly_active_users), Some(transfer_type_share), Some(merged_cash_fee)) => {
            let tables = InputTables {
                user_first_request,
                monthly_active_users,
                transfer_type_share,
                merged_cash_fee,
            };
            checks.push(match validate_inputs(&tables, &config) {
                Ok(summary) => ValidationCheck {
                    name: "referential".to_string(),
                    status: CheckStatus::Ok,
                    message: format!(
                        "{} transactions, {} fees, {} users in {} cohorts ({} .. {})",
                        summary.transactions,
                        summary.fees,
                        summary.users,
                        summary.cohorts,
                        summary.timeline.first,
                        summary.timeline.last
                    ),
                },
                Err(e) => ValidationCheck {
                    name: "referential".to_string(),
                    status: CheckStatus::Error,
                    message: e.to_string(),
                },
            });
        }
        _ => checks.push(ValidationCheck {
            name: "referential".to_string(),
            status: CheckStatus::Warning,
            message: "skipped: not every table loaded".to_string(),
        }),
    }

    let report = ValidationReport {
        producer: PRODUCER_NAME.to_string(),
        version: COHORTS_VERSION.to_string(),
        schema_version: SCHEMA_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        for check in &report.checks {
            let status = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("{} {}: {}", status, check.name, check.message);
        }
    }

    let failed = report
        .checks
        .iter()
        .filter(|c| !matches!(c.status, CheckStatus::Ok))
        .count();
    if failed > 0 {
        Err(CohortsCliError::ValidationFailed(failed))
    } else {
        Ok(())
    }
}

fn contract<T: TableSchema>() -> TableContract {
    TableContract {
        table: T::TABLE,
        file_name: T::FILE_NAME,
        required_columns: T::REQUIRED_COLUMNS,
    }
}

fn cmd_schema(json: bool) -> Result<(), CohortsCliError> {
    let inputs = vec![
        contract::<UserFirstRequestRow>(),
        contract::<MonthlyActiveUsersRow>(),
        contract::<TransferTypeShareRow>(),
        contract::<MergedCashFeeRow>(),
    ];
    let raw = vec![contract::<RawCashRequestRow>(), contract::<RawFeeRow>()];

    if json {
        let doc = serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "inputs": inputs,
            "raw_exports": raw,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Input Schema: {}", SCHEMA_VERSION);
    println!();
    println!("Pipeline inputs (cohorts run / validate):");
    for c in &inputs {
        println!("  {} ({})", c.file_name, c.table);
        println!("    {}", c.required_columns.join(", "));
    }
    println!();
    println!("Raw exports (cohorts prepare):");
    for c in &raw {
        println!("  {} ({})", c.file_name, c.table);
        println!("    {}", c.required_columns.join(", "));
    }
    println!();
    println!("Months are written as YYYY-MM; undefined matrix cells use the configured placeholder.");
    Ok(())
}

// Error types

#[derive(Debug)]
enum CohortsCliError {
    Metrics(MetricsError),
    Json(serde_json::Error),
    ValidationFailed(usize),
}

impl From<MetricsError> for CohortsCliError {
    fn from(e: MetricsError) -> Self {
        CohortsCliError::Metrics(e)
    }
}

impl From<serde_json::Error> for CohortsCliError {
    fn from(e: serde_json::Error) -> Self {
        CohortsCliError::Json(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<CohortsCliError> for CliError {
    fn from(e: CohortsCliError) -> Self {
        match e {
            CohortsCliError::Metrics(e) => {
                let (code, hint) = match &e {
                    e if e.is_schema_error() => ("SCHEMA_ERROR", "Run 'cohorts schema' for the expected columns"),
                    MetricsError::Referential(_) => ("REFERENTIAL_ERROR", "Run 'cohorts validate' for details"),
                    MetricsError::DegenerateCohort { .. } => ("DEGENERATE_COHORT", "Check the cohort's first-month activity and size"),
                    MetricsError::EmptyInput(_) => ("EMPTY_INPUT", "Ensure merged_cash_fee.csv has rows"),
                    MetricsError::Config(_) => ("CONFIG_ERROR", "Check the configuration file and flags"),
                    MetricsError::MalformedMatrix(_) => ("MATRIX_ERROR", "Check the matrix file layout"),
                    MetricsError::Io(_) => ("IO_ERROR", "Check file paths and permissions"),
                    _ => ("PARSE_ERROR", "Check input format"),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            CohortsCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            CohortsCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} checks did not pass", count),
                hint: Some("Review the validation report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(Serialize)]
struct ValidationReport {
    producer: String,
    version: String,
    schema_version: String,
    checks: Vec<ValidationCheck>,
}

#[derive(Serialize)]
struct ValidationCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Serialize)]
struct TableContract {
    table: &'static str,
    file_name: &'static str,
    required_columns: &'static [&'static str],
}
