//! Core types for the cohort metrics pipeline
//!
//! This module defines the data structures that flow between the pipeline
//! stages: calendar months, ledger entries, the cohort event table, the
//! cohort matrices and the per-cohort summary rows written as output tables.

use crate::error::{MetricsError, MetricsResult};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Calendar month key, rendered as `YYYY-MM`
///
/// Ordering is chronological, so a sorted collection of months is a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    /// Create a month key, returning `None` when `month` is outside 1..=12
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    /// Truncate a timestamp to its calendar month
    pub fn from_datetime(timestamp: &NaiveDateTime) -> Self {
        Self {
            year: timestamp.year(),
            month: timestamp.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    fn index(&self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month) - 1
    }

    fn from_index(index: i64) -> Self {
        Self {
            year: index.div_euclid(12) as i32,
            month: index.rem_euclid(12) as u32 + 1,
        }
    }

    /// Number of calendar months between `origin` and `self` (negative if earlier)
    pub fn offset_from(&self, origin: YearMonth) -> i64 {
        self.index() - origin.index()
    }

    /// Month `n` months after this one
    pub fn plus_months(&self, n: i64) -> Self {
        Self::from_index(self.index() + n)
    }

    /// All months from `start` to `end`, both inclusive
    pub fn range_inclusive(start: YearMonth, end: YearMonth) -> Vec<YearMonth> {
        (start.index()..=end.index()).map(Self::from_index).collect()
    }

    /// Human label such as `Jan 2020`
    pub fn label(&self) -> String {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .map(|d| d.format("%b %Y").to_string())
            .unwrap_or_else(|| self.to_string())
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || MetricsError::DateParseError(format!("Invalid year-month '{}'", s));

        let (year, month) = trimmed.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;

        YearMonth::new(year, month).ok_or_else(invalid)
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a timestamp as written by common CSV exporters.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.ffffff][+HH[:MM]]`, the same with a
/// `T` separator, and bare dates. Offsets are dropped and the wall-clock time
/// is kept.
pub fn parse_timestamp(raw: &str) -> MetricsResult<NaiveDateTime> {
    let s = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_local());
    }

    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Ok(dt.naive_local());
        }
    }

    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt);
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| MetricsError::DateParseError(format!("Unrecognized timestamp '{}'", raw)))
}

/// Normalize an identifier column value.
///
/// Float-rendered integers (`"804.0"`) are reduced to their integer form so
/// that ids written by different exporters compare equal. Empty and `nan`
/// values yield `None`.
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return None;
    }

    match trimmed.strip_suffix(".0") {
        Some(int_part) if !int_part.is_empty() && int_part.chars().all(|c| c.is_ascii_digit()) => {
            Some(int_part.to_string())
        }
        _ => Some(trimmed.to_string()),
    }
}

/// Lower-case and trim a categorical value; empty and `nan` become `None`
pub fn normalize_category(raw: &str) -> Option<String> {
    let cleaned = raw.trim().to_lowercase();
    if cleaned.is_empty() || cleaned == "nan" {
        None
    } else {
        Some(cleaned)
    }
}

/// Cash request lifecycle status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CashStatus {
    Pending,
    MoneyBack,
    Rejected,
    Canceled,
    /// Any status outside the known set, kept verbatim (lower-cased)
    Other(String),
}

impl CashStatus {
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "pending" => CashStatus::Pending,
            "money_back" | "money-back" => CashStatus::MoneyBack,
            "rejected" => CashStatus::Rejected,
            "canceled" | "cancelled" => CashStatus::Canceled,
            other => CashStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CashStatus::Pending => "pending",
            CashStatus::MoneyBack => "money_back",
            CashStatus::Rejected => "rejected",
            CashStatus::Canceled => "canceled",
            CashStatus::Other(raw) => raw.as_str(),
        }
    }
}

impl Serialize for CashStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CashStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(CashStatus::from_raw(&raw))
    }
}

/// How the cash was sent to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Instant,
    Regular,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Instant => "instant",
            TransferType::Regular => "regular",
        }
    }
}

impl FromStr for TransferType {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "instant" => Ok(TransferType::Instant),
            "regular" => Ok(TransferType::Regular),
            other => Err(MetricsError::InvalidValue {
                table: "transfer_type",
                line: 0,
                message: format!("unknown transfer type '{}'", other),
            }),
        }
    }
}

/// Fee category charged against a cash request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeType {
    #[serde(alias = "instant")]
    InstantPayment,
    Postpone,
    Incident,
}

impl FeeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeType::InstantPayment => "instant_payment",
            FeeType::Postpone => "postpone",
            FeeType::Incident => "incident",
        }
    }
}

impl FromStr for FeeType {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "instant_payment" | "instant" => Ok(FeeType::InstantPayment),
            "postpone" => Ok(FeeType::Postpone),
            "incident" => Ok(FeeType::Incident),
            other => Err(MetricsError::InvalidValue {
                table: "fee_type",
                line: 0,
                message: format!("unknown fee type '{}'", other),
            }),
        }
    }
}

/// A distinct cash request
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: String,
    /// Coalesced active or deleted-account user id
    pub user_id: String,
    pub created_at: NaiveDateTime,
    pub status: CashStatus,
    pub transfer_type: TransferType,
    /// True when the request carries a recovery status
    pub incident: bool,
    pub amount: f64,
}

impl Transaction {
    pub fn month(&self) -> YearMonth {
        YearMonth::from_datetime(&self.created_at)
    }
}

/// A fee charged against exactly one transaction
#[derive(Debug, Clone, PartialEq)]
pub struct FeeCharge {
    pub id: String,
    pub transaction_id: String,
    pub fee_type: FeeType,
    pub status: Option<String>,
    pub amount: f64,
    pub charged_at: Option<NaiveDateTime>,
}

/// One row of the long event table: a transaction tagged with its cohort
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohortEvent {
    pub transaction_id: String,
    pub user_id: String,
    pub cohort: YearMonth,
    pub event_month: YearMonth,
    pub incident: bool,
}

impl CohortEvent {
    /// Elapsed months since the cohort month (0 = the cohort's own month)
    pub fn offset(&self) -> i64 {
        self.event_month.offset_from(self.cohort)
    }
}

/// Observed calendar window of the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeline {
    pub first: YearMonth,
    pub last: YearMonth,
}

impl Timeline {
    /// Smallest window covering all given months, `None` if there are none
    pub fn covering<I: IntoIterator<Item = YearMonth>>(months: I) -> Option<Self> {
        let mut iter = months.into_iter();
        let first = iter.next()?;
        let (lo, hi) = iter.fold((first, first), |(lo, hi), m| (lo.min(m), hi.max(m)));
        Some(Self { first: lo, last: hi })
    }

    /// Contiguous months of the window
    pub fn months(&self) -> Vec<YearMonth> {
        YearMonth::range_inclusive(self.first, self.last)
    }

    pub fn contains(&self, month: YearMonth) -> bool {
        self.first <= month && month <= self.last
    }

    /// Largest possible elapsed-month offset inside the window
    pub fn max_offset(&self) -> u32 {
        self.last.offset_from(self.first) as u32
    }
}

/// Cohort-indexed matrix of optional cells.
///
/// Rows are cohorts in chronological order and columns are sorted keys
/// (`YearMonth` for calendar matrices, `u32` offsets for aligned ones).
/// A `None` cell is undefined: the column lies before the cohort existed or
/// past the observed window. It is never the same thing as zero.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortMatrix<K, V> {
    cohorts: Vec<YearMonth>,
    columns: Vec<K>,
    cells: Vec<Vec<Option<V>>>,
}

/// Cohorts × calendar months
pub type CalendarMatrix<V> = CohortMatrix<YearMonth, V>;

/// Cohorts × elapsed-month offsets
pub type OffsetMatrix<V> = CohortMatrix<u32, V>;

impl<K: Copy + Ord, V: Copy> CohortMatrix<K, V> {
    /// Build a matrix by evaluating `cell` for every (cohort, column) pair.
    ///
    /// Cohorts and columns are sorted and de-duplicated first.
    pub fn from_fn<C, F>(cohorts: C, columns: Vec<K>, mut cell: F) -> Self
    where
        C: IntoIterator<Item = YearMonth>,
        F: FnMut(YearMonth, K) -> Option<V>,
    {
        let cohorts: Vec<YearMonth> = cohorts.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let mut columns = columns;
        columns.sort();
        columns.dedup();

        let cells = cohorts
            .iter()
            .map(|&cohort| columns.iter().map(|&col| cell(cohort, col)).collect())
            .collect();

        Self {
            cohorts,
            columns,
            cells,
        }
    }

    /// Assemble a matrix from explicit parts, checking ordering and shape
    pub fn from_parts(
        cohorts: Vec<YearMonth>,
        columns: Vec<K>,
        cells: Vec<Vec<Option<V>>>,
    ) -> MetricsResult<Self> {
        if cohorts.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MetricsError::MalformedMatrix(
                "cohorts are not in strictly chronological order".to_string(),
            ));
        }
        if columns.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MetricsError::MalformedMatrix(
                "columns are not strictly ascending".to_string(),
            ));
        }
        if cells.len() != cohorts.len() || cells.iter().any(|row| row.len() != columns.len()) {
            return Err(MetricsError::MalformedMatrix(format!(
                "expected {} rows of {} cells",
                cohorts.len(),
                columns.len()
            )));
        }

        Ok(Self {
            cohorts,
            columns,
            cells,
        })
    }

    pub fn cohorts(&self) -> &[YearMonth] {
        &self.cohorts
    }

    pub fn columns(&self) -> &[K] {
        &self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.cohorts.is_empty()
    }

    pub fn contains_cohort(&self, cohort: YearMonth) -> bool {
        self.cohorts.binary_search(&cohort).is_ok()
    }

    /// Cells of one cohort row, in column order
    pub fn row(&self, cohort: YearMonth) -> Option<&[Option<V>]> {
        let idx = self.cohorts.binary_search(&cohort).ok()?;
        Some(&self.cells[idx])
    }

    /// Raw cell: outer `None` if the row or column is absent, inner `None` if undefined
    pub fn cell(&self, cohort: YearMonth, column: K) -> Option<Option<V>> {
        let col = self.columns.binary_search(&column).ok()?;
        self.row(cohort).map(|row| row[col])
    }

    /// Defined value of a cell, if any
    pub fn get(&self, cohort: YearMonth, column: K) -> Option<V> {
        self.cell(cohort, column).flatten()
    }

    /// Iterate rows as `(cohort, cells)`
    pub fn rows(&self) -> impl Iterator<Item = (YearMonth, &[Option<V>])> {
        self.cohorts
            .iter()
            .copied()
            .zip(self.cells.iter().map(|row| row.as_slice()))
    }

    /// Transform defined cells; undefined cells stay undefined
    pub fn map<W, F>(&self, mut f: F) -> CohortMatrix<K, W>
    where
        W: Copy,
        F: FnMut(YearMonth, K, V) -> Option<W>,
    {
        let cells = self
            .rows()
            .map(|(cohort, row)| {
                row.iter()
                    .zip(self.columns.iter())
                    .map(|(value, &col)| value.and_then(|v| f(cohort, col, v)))
                    .collect()
            })
            .collect();

        CohortMatrix {
            cohorts: self.cohorts.clone(),
            columns: self.columns.clone(),
            cells,
        }
    }

    /// Copy of the matrix keeping only cohorts for which `keep` is true
    pub fn retain_cohorts<F: Fn(YearMonth) -> bool>(&self, keep: F) -> Self {
        let (cohorts, cells): (Vec<_>, Vec<_>) = self
            .cohorts
            .iter()
            .zip(self.cells.iter())
            .filter(|(cohort, _)| keep(**cohort))
            .map(|(cohort, row)| (*cohort, row.clone()))
            .unzip();

        Self {
            cohorts,
            columns: self.columns.clone(),
            cells,
        }
    }
}

/// Why a cohort was left out of the filtered retention view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    BelowMinimumSize { size: u64, minimum: u64 },
    PartialMonth,
}

/// A cohort dropped from the filtered retention view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub cohort: YearMonth,
    #[serde(flatten)]
    pub reason: ExclusionReason,
}

/// User → cohort lookup row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCohort {
    pub final_user_id: String,
    pub first_request_date: NaiveDateTime,
    pub cohort_year_month: YearMonth,
}

/// Per-cohort incident totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentSummary {
    pub cohort_year_month: YearMonth,
    pub total_requests: u64,
    pub incident_requests: u64,
    pub incident_rate: f64,
}

/// Per-cohort revenue total
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortRevenue {
    pub cohort_year_month: YearMonth,
    pub cohort_revenue: f64,
}

/// Average revenue per user for one cohort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArpuRow {
    pub cohort_year_month: YearMonth,
    pub cohort_revenue: f64,
    pub user_count: u64,
    pub arpu: f64,
}

/// Customer lifetime value estimate for one cohort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClvRow {
    pub cohort_year_month: YearMonth,
    pub arpu: f64,
    pub avg_retention_months: u32,
    pub clv: f64,
    /// Cohort month is a partial (edge or excluded) month of the dataset
    pub partial_window: bool,
}

/// One calendar month of dataset-level activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyOverview {
    pub year_month: YearMonth,
    pub requests: u64,
    pub active_users: u64,
    pub reported_active_users: Option<u64>,
    pub instant_share: Option<f64>,
    pub regular_share: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ym(s: &str) -> YearMonth {
        s.parse().unwrap()
    }

    #[test]
    fn test_year_month_parse_and_display() {
        let month = ym("2020-02");
        assert_eq!(month.year(), 2020);
        assert_eq!(month.month(), 2);
        assert_eq!(month.to_string(), "2020-02");
        assert_eq!(month.label(), "Feb 2020");

        assert!("2020-13".parse::<YearMonth>().is_err());
        assert!("2020-1".parse::<YearMonth>().is_err());
        assert!("Jan 2020".parse::<YearMonth>().is_err());
    }

    #[test]
    fn test_year_month_arithmetic() {
        let nov = ym("2019-11");
        assert_eq!(nov.plus_months(2), ym("2020-01"));
        assert_eq!(ym("2020-01").offset_from(nov), 2);
        assert_eq!(nov.offset_from(ym("2020-01")), -2);
        assert_eq!(
            YearMonth::range_inclusive(nov, ym("2020-02")),
            vec![nov, ym("2019-12"), ym("2020-01"), ym("2020-02")]
        );
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = NaiveDate::from_ymd_opt(2020, 5, 23)
            .unwrap()
            .and_hms_micro_opt(20, 58, 6, 215086)
            .unwrap();

        assert_eq!(parse_timestamp("2020-05-23 20:58:06.215086+00").unwrap(), expected);
        assert_eq!(parse_timestamp("2020-05-23 20:58:06.215086").unwrap(), expected);
        assert_eq!(parse_timestamp("2020-05-23T20:58:06.215086Z").unwrap(), expected);
        assert_eq!(
            parse_timestamp("2020-05-23").unwrap(),
            NaiveDate::from_ymd_opt(2020, 5, 23).unwrap().and_hms_opt(0, 0, 0).unwrap()
        );
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier("804.0"), Some("804".to_string()));
        assert_eq!(normalize_identifier(" 804 "), Some("804".to_string()));
        assert_eq!(normalize_identifier("abc.0"), Some("abc.0".to_string()));
        assert_eq!(normalize_identifier("nan"), None);
        assert_eq!(normalize_identifier(""), None);
    }

    #[test]
    fn test_cash_status_from_raw() {
        assert_eq!(CashStatus::from_raw("Money_Back"), CashStatus::MoneyBack);
        assert_eq!(CashStatus::from_raw("cancelled"), CashStatus::Canceled);
        assert_eq!(
            CashStatus::from_raw("direct_debit_sent"),
            CashStatus::Other("direct_debit_sent".to_string())
        );
    }

    #[test]
    fn test_matrix_lookup_and_retain() {
        let cohorts = vec![ym("2020-01"), ym("2019-12")];
        let matrix: OffsetMatrix<u64> = CohortMatrix::from_fn(cohorts, vec![1, 0], |c, k| {
            if c == ym("2020-01") && k == 1 {
                None
            } else {
                Some(u64::from(k) + 10)
            }
        });

        assert_eq!(matrix.cohorts(), &[ym("2019-12"), ym("2020-01")]);
        assert_eq!(matrix.columns(), &[0, 1]);
        assert_eq!(matrix.get(ym("2019-12"), 1), Some(11));
        assert_eq!(matrix.cell(ym("2020-01"), 1), Some(None));
        assert_eq!(matrix.cell(ym("2021-01"), 1), None);

        let kept = matrix.retain_cohorts(|c| c != ym("2019-12"));
        assert_eq!(kept.cohorts(), &[ym("2020-01")]);
    }

    #[test]
    fn test_matrix_from_parts_rejects_unsorted() {
        let result: MetricsResult<OffsetMatrix<u64>> = CohortMatrix::from_parts(
            vec![ym("2020-02"), ym("2020-01")],
            vec![0],
            vec![vec![Some(1)], vec![Some(1)]],
        );
        assert!(matches!(result, Err(MetricsError::MalformedMatrix(_))));
    }
}
