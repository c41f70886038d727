//! Output encoding
//!
//! This module serializes pipeline outputs into CSV tables and the JSON run
//! manifest, reads matrices back, and commits a complete output set to disk.
//! Nothing is written until every file has been encoded in memory.

use crate::config::PipelineConfig;
use crate::error::{MetricsError, MetricsResult};
use crate::pipeline::PipelineOutputs;
use crate::schema::SCHEMA_VERSION;
use crate::types::{CohortMatrix, Exclusion, YearMonth};
use crate::{COHORTS_VERSION, PRODUCER_NAME};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Header of the cohort column in every matrix table
pub const COHORT_COLUMN: &str = "cohort_year_month";

pub const USAGE_MATRIX_FILE: &str = "cohort_usage_matrix.csv";
pub const RETENTION_MATRIX_FILE: &str = "cohort_retention_matrix.csv";
pub const FILTERED_RETENTION_MATRIX_FILE: &str = "cohort_retention_matrix_filtered.csv";
pub const INCIDENT_MATRIX_FILE: &str = "cohort_incident_rate_matrix.csv";
pub const INCIDENT_SUMMARY_FILE: &str = "cohort_incident_summary.csv";
pub const REVENUE_MATRIX_FILE: &str = "cohort_revenue_matrix.csv";
pub const CUMULATIVE_REVENUE_MATRIX_FILE: &str = "cohort_cumulative_revenue_matrix.csv";
pub const COHORT_REVENUE_FILE: &str = "cohort_revenue.csv";
pub const ARPU_FILE: &str = "cohort_arpu.csv";
pub const CLV_FILE: &str = "cohort_clv.csv";
pub const USER_COHORTS_FILE: &str = "user_cohorts.csv";
pub const MONTHLY_OVERVIEW_FILE: &str = "monthly_overview.csv";
pub const MANIFEST_FILE: &str = "run_manifest.json";

/// A fully encoded output file, not yet written
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFile {
    pub name: String,
    pub contents: String,
}

impl EncodedFile {
    fn new(name: &str, contents: String) -> Self {
        Self {
            name: name.to_string(),
            contents,
        }
    }
}

/// Producer metadata recorded in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestProducer {
    pub name: String,
    pub version: String,
    pub run_id: String,
}

/// Calendar window covered by a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ManifestWindow {
    pub first_month: YearMonth,
    pub last_month: YearMonth,
}

/// Row and cohort counts of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    pub transactions: usize,
    pub fees: usize,
    pub users: usize,
    pub cohorts: usize,
    pub total_revenue: f64,
}

/// Description of one committed output set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: String,
    pub producer: ManifestProducer,
    pub computed_at_utc: String,
    pub config: PipelineConfig,
    pub window: ManifestWindow,
    pub totals: RunTotals,
    pub partial_months: Vec<YearMonth>,
    pub exclusions: Vec<Exclusion>,
    pub files: Vec<String>,
}

/// Encoder for matrix and row tables
pub struct TableEncoder {
    run_id: String,
    undefined_cell: String,
}

impl Default for TableEncoder {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl TableEncoder {
    /// Create an encoder with a fresh run id
    pub fn new(undefined_cell: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            undefined_cell: undefined_cell.into(),
        }
    }

    /// Create an encoder with a specific run id
    pub fn with_run_id(run_id: String, undefined_cell: impl Into<String>) -> Self {
        Self {
            run_id,
            undefined_cell: undefined_cell.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Encode a matrix as CSV: cohort column first, one row per cohort
    pub fn encode_matrix<K, V>(&self, matrix: &CohortMatrix<K, V>) -> MetricsResult<String>
    where
        K: Copy + Ord + Display,
        V: Copy + Display,
    {
        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = vec![COHORT_COLUMN.to_string()];
        header.extend(matrix.columns().iter().map(|c| c.to_string()));
        writer.write_record(&header)?;

        for (cohort, row) in matrix.rows() {
            let mut record = Vec::with_capacity(row.len() + 1);
            record.push(cohort.to_string());
            record.extend(row.iter().map(|cell| match cell {
                Some(v) => v.to_string(),
                None => self.undefined_cell.clone(),
            }));
            writer.write_record(&record)?;
        }

        into_string(writer)
    }

    /// Parse a matrix written by [`TableEncoder::encode_matrix`]
    pub fn decode_matrix<K, V>(&self, data: &str) -> MetricsResult<CohortMatrix<K, V>>
    where
        K: Copy + Ord + FromStr,
        K::Err: Display,
        V: Copy + FromStr,
        V::Err: Display,
    {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(data.as_bytes());

        let headers = reader.headers()?.clone();
        match headers.get(0) {
            Some(first) if first.trim() == COHORT_COLUMN => {}
            other => {
                return Err(MetricsError::MalformedMatrix(format!(
                    "first column must be '{}', found {:?}",
                    COHORT_COLUMN, other
                )))
            }
        }

        let columns = headers
            .iter()
            .skip(1)
            .map(|h| {
                h.trim().parse::<K>().map_err(|e| {
                    MetricsError::MalformedMatrix(format!("bad column header '{}': {}", h, e))
                })
            })
            .collect::<MetricsResult<Vec<K>>>()?;

        let mut cohorts = Vec::new();
        let mut cells = Vec::new();
        for record in reader.records() {
            let record = record?;
            let mut fields = record.iter();
            let cohort: YearMonth = fields
                .next()
                .ok_or_else(|| MetricsError::MalformedMatrix("empty row".to_string()))?
                .parse::<YearMonth>()
                .map_err(|e| MetricsError::MalformedMatrix(e.to_string()))?;

            let row = fields
                .map(|field| self.decode_cell::<V>(field))
                .collect::<MetricsResult<Vec<Option<V>>>>()?;

            cohorts.push(cohort);
            cells.push(row);
        }

        CohortMatrix::from_parts(cohorts, columns, cells)
    }

    fn decode_cell<V>(&self, field: &str) -> MetricsResult<Option<V>>
    where
        V: FromStr,
        V::Err: Display,
    {
        let trimmed = field.trim();
        if trimmed.is_empty() || trimmed == self.undefined_cell.trim() {
            return Ok(None);
        }
        trimmed
            .parse::<V>()
            .map(Some)
            .map_err(|e| MetricsError::MalformedMatrix(format!("bad cell '{}': {}", field, e)))
    }

    /// Read a matrix table from disk
    pub fn read_matrix<K, V>(&self, path: &Path) -> MetricsResult<CohortMatrix<K, V>>
    where
        K: Copy + Ord + FromStr,
        K::Err: Display,
        V: Copy + FromStr,
        V::Err: Display,
    {
        let data = fs::read_to_string(path)?;
        self.decode_matrix(&data)
    }

    /// Encode serializable rows as CSV with a header row
    pub fn encode_rows<T: Serialize>(rows: &[T]) -> MetricsResult<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows {
            writer.serialize(row)?;
        }
        into_string(writer)
    }

    /// Encode every output table of a run
    pub fn encode_outputs(&self, outputs: &PipelineOutputs) -> MetricsResult<Vec<EncodedFile>> {
        let files = vec![
            EncodedFile::new(USAGE_MATRIX_FILE, self.encode_matrix(&outputs.usage)?),
            EncodedFile::new(RETENTION_MATRIX_FILE, self.encode_matrix(&outputs.retention)?),
            EncodedFile::new(
                FILTERED_RETENTION_MATRIX_FILE,
                self.encode_matrix(&outputs.filtered_retention.matrix)?,
            ),
            EncodedFile::new(
                INCIDENT_MATRIX_FILE,
                self.encode_matrix(&outputs.incidents.matrix)?,
            ),
            EncodedFile::new(
                INCIDENT_SUMMARY_FILE,
                Self::encode_rows(&outputs.incidents.summary)?,
            ),
            EncodedFile::new(
                REVENUE_MATRIX_FILE,
                self.encode_matrix(&outputs.revenue.monthly)?,
            ),
            EncodedFile::new(
                CUMULATIVE_REVENUE_MATRIX_FILE,
                self.encode_matrix(&outputs.revenue.cumulative)?,
            ),
            EncodedFile::new(COHORT_REVENUE_FILE, Self::encode_rows(&outputs.revenue.totals)?),
            EncodedFile::new(ARPU_FILE, Self::encode_rows(&outputs.monetization.arpu)?),
            EncodedFile::new(CLV_FILE, Self::encode_rows(&outputs.monetization.clv)?),
            EncodedFile::new(
                USER_COHORTS_FILE,
                Self::encode_rows(&outputs.assignment.lookup_table())?,
            ),
            EncodedFile::new(MONTHLY_OVERVIEW_FILE, Self::encode_rows(&outputs.overview)?),
        ];
        Ok(files)
    }

    /// Build the manifest describing `files`
    pub fn manifest(
        &self,
        outputs: &PipelineOutputs,
        config: &PipelineConfig,
        files: &[EncodedFile],
    ) -> RunManifest {
        let mut names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
        names.push(MANIFEST_FILE.to_string());

        RunManifest {
            schema_version: SCHEMA_VERSION.to_string(),
            producer: ManifestProducer {
                name: PRODUCER_NAME.to_string(),
                version: COHORTS_VERSION.to_string(),
                run_id: self.run_id.clone(),
            },
            computed_at_utc: Utc::now().to_rfc3339(),
            config: config.clone(),
            window: ManifestWindow {
                first_month: outputs.timeline.first,
                last_month: outputs.timeline.last,
            },
            totals: RunTotals {
                transactions: outputs.transaction_count,
                fees: outputs.fee_count,
                users: outputs.assignment.user_count(),
                cohorts: outputs.assignment.sizes().len(),
                total_revenue: outputs.revenue.totals.iter().map(|r| r.cohort_revenue).sum(),
            },
            partial_months: outputs.filtered_retention.partial_months.clone(),
            exclusions: outputs.filtered_retention.exclusions.clone(),
            files: names,
        }
    }

    /// Encode the manifest to pretty JSON
    pub fn encode_manifest(manifest: &RunManifest) -> MetricsResult<EncodedFile> {
        let json = serde_json::to_string_pretty(manifest).map_err(MetricsError::JsonError)?;
        Ok(EncodedFile::new(MANIFEST_FILE, json))
    }
}

fn into_string(writer: csv::Writer<Vec<u8>>) -> MetricsResult<String> {
    let bytes = writer
        .into_inner()
        .map_err(|e| MetricsError::Io(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| MetricsError::MalformedMatrix(e.to_string()))
}

/// Write `files` into `dir` as one unit.
///
/// Files are first written to a staging directory inside `dir` and renamed
/// into place only after all writes succeed. Existing targets are moved aside
/// first; if any rename fails, the placed files are removed and the previous
/// versions restored. The staging directory is removed in every case.
pub fn commit_files(dir: &Path, files: &[EncodedFile]) -> MetricsResult<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let staging = dir.join(format!(".staging-{}", Uuid::new_v4()));
    fs::create_dir(&staging)?;

    let result = stage_and_move(&staging, dir, files);
    if let Err(e) = fs::remove_dir_all(&staging) {
        log::warn!("Could not remove staging directory {}: {}", staging.display(), e);
    }

    let written = result?;
    log::info!("Committed {} files to {}", written.len(), dir.display());
    Ok(written)
}

/// A file renamed into place, with the version it replaced
struct PlacedFile {
    target: PathBuf,
    previous: Option<PathBuf>,
}

fn stage_and_move(staging: &Path, dir: &Path, files: &[EncodedFile]) -> MetricsResult<Vec<PathBuf>> {
    let fresh = staging.join("new");
    let aside = staging.join("previous");
    fs::create_dir(&fresh)?;
    fs::create_dir(&aside)?;

    for file in files {
        fs::write(fresh.join(&file.name), &file.contents)?;
    }

    let mut placed = Vec::with_capacity(files.len());
    for file in files {
        match place_file(&fresh, &aside, dir, &file.name) {
            Ok(p) => placed.push(p),
            Err(e) => {
                roll_back(&placed);
                return Err(e);
            }
        }
    }
    Ok(placed.into_iter().map(|p| p.target).collect())
}

fn place_file(fresh: &Path, aside: &Path, dir: &Path, name: &str) -> MetricsResult<PlacedFile> {
    let target = dir.join(name);
    let previous = match fs::symlink_metadata(&target) {
        Ok(meta) if meta.is_dir() => {
            return Err(MetricsError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is a directory", target.display()),
            )))
        }
        Ok(_) => {
            let previous = aside.join(name);
            fs::rename(&target, &previous)?;
            Some(previous)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let placed = PlacedFile { target, previous };
    if let Err(e) = fs::rename(fresh.join(name), &placed.target) {
        roll_back(std::slice::from_ref(&placed));
        return Err(e.into());
    }
    Ok(placed)
}

/// Undo placed files in reverse order
fn roll_back(placed: &[PlacedFile]) {
    for file in placed.iter().rev() {
        let restored = match &file.previous {
            Some(previous) => fs::rename(previous, &file.target),
            None => match fs::remove_file(&file.target) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = restored {
            log::warn!("Could not roll back {}: {}", file.target.display(), e);
        }
    }
}
