//! Row types and column contracts for the pipeline's CSV tables

use crate::types::{
    normalize_category, normalize_identifier, parse_timestamp, CashStatus, FeeType, TransferType,
    YearMonth,
};
use chrono::NaiveDateTime;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Timestamp layout used when writing tables
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Column contract of a CSV table
pub trait TableSchema {
    /// Logical table name used in error messages
    const TABLE: &'static str;
    /// Conventional file name inside a table directory
    const FILE_NAME: &'static str;
    /// Columns that must be present in the header
    const REQUIRED_COLUMNS: &'static [&'static str];
}

/// One user with the timestamp and month of their first cash request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFirstRequestRow {
    #[serde(deserialize_with = "de_identifier")]
    pub final_user_id: String,
    #[serde(deserialize_with = "de_timestamp", serialize_with = "ser_timestamp")]
    pub first_request_date: NaiveDateTime,
    /// Display label such as `Jan 2020`
    #[serde(default)]
    pub cohort_month: Option<String>,
    pub cohort_year_month: YearMonth,
}

impl TableSchema for UserFirstRequestRow {
    const TABLE: &'static str = "user_first_request";
    const FILE_NAME: &'static str = "user_first_request.csv";
    const REQUIRED_COLUMNS: &'static [&'static str] =
        &["final_user_id", "first_request_date", "cohort_year_month"];
}

/// Distinct active users per calendar month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyActiveUsersRow {
    pub activity_month: YearMonth,
    pub active_users: u64,
}

impl TableSchema for MonthlyActiveUsersRow {
    const TABLE: &'static str = "monthly_active_users";
    const FILE_NAME: &'static str = "monthly_active_users.csv";
    const REQUIRED_COLUMNS: &'static [&'static str] = &["activity_month", "active_users"];
}

/// Share of instant and regular transfers per calendar month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTypeShareRow {
    pub year_month: YearMonth,
    #[serde(default)]
    pub instant: Option<u64>,
    #[serde(default)]
    pub regular: Option<u64>,
    pub instant_share: f64,
    pub regular_share: f64,
}

impl TableSchema for TransferTypeShareRow {
    const TABLE: &'static str = "transfer_type_share";
    const FILE_NAME: &'static str = "transfer_type_share.csv";
    const REQUIRED_COLUMNS: &'static [&'static str] =
        &["year_month", "instant_share", "regular_share"];
}

/// Cash request left-joined with its fees; one row per (request, fee) pair,
/// or one row with empty fee columns for requests without fees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedCashFeeRow {
    #[serde(deserialize_with = "de_identifier")]
    pub cash_request_id: String,
    #[serde(deserialize_with = "de_identifier")]
    pub final_user_id: String,
    pub amount: f64,
    pub cash_status: CashStatus,
    #[serde(deserialize_with = "de_transfer_type")]
    pub transfer_type: TransferType,
    #[serde(deserialize_with = "de_timestamp", serialize_with = "ser_timestamp")]
    pub cash_created_at: NaiveDateTime,
    #[serde(deserialize_with = "de_opt_category")]
    pub recovery_status: Option<String>,
    #[serde(deserialize_with = "de_opt_identifier")]
    pub fee_id: Option<String>,
    pub total_amount: Option<f64>,
    #[serde(rename = "type", deserialize_with = "de_opt_fee_type")]
    pub fee_type: Option<FeeType>,
    #[serde(deserialize_with = "de_opt_category")]
    pub fee_status: Option<String>,
    #[serde(
        deserialize_with = "de_opt_timestamp",
        serialize_with = "ser_opt_timestamp"
    )]
    pub fee_created_at: Option<NaiveDateTime>,
}

impl TableSchema for MergedCashFeeRow {
    const TABLE: &'static str = "merged_cash_fee";
    const FILE_NAME: &'static str = "merged_cash_fee.csv";
    const REQUIRED_COLUMNS: &'static [&'static str] = &[
        "cash_request_id",
        "final_user_id",
        "amount",
        "cash_status",
        "transfer_type",
        "cash_created_at",
        "recovery_status",
        "fee_id",
        "total_amount",
        "type",
        "fee_status",
        "fee_created_at",
    ];
}

/// Raw cash request export, before cleaning
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawCashRequestRow {
    #[serde(deserialize_with = "de_identifier")]
    pub id: String,
    pub amount: f64,
    #[serde(deserialize_with = "de_opt_category")]
    pub status: Option<String>,
    #[serde(deserialize_with = "de_timestamp")]
    pub created_at: NaiveDateTime,
    #[serde(deserialize_with = "de_opt_identifier")]
    pub user_id: Option<String>,
    #[serde(deserialize_with = "de_opt_identifier")]
    pub deleted_account_id: Option<String>,
    #[serde(deserialize_with = "de_opt_category")]
    pub transfer_type: Option<String>,
    #[serde(deserialize_with = "de_opt_category")]
    pub recovery_status: Option<String>,
}

impl TableSchema for RawCashRequestRow {
    const TABLE: &'static str = "cash_requests";
    const FILE_NAME: &'static str = "cash_requests.csv";
    const REQUIRED_COLUMNS: &'static [&'static str] = &[
        "id",
        "amount",
        "status",
        "created_at",
        "user_id",
        "deleted_account_id",
        "transfer_type",
        "recovery_status",
    ];
}

/// Raw fee export, before cleaning
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawFeeRow {
    #[serde(deserialize_with = "de_identifier")]
    pub id: String,
    #[serde(deserialize_with = "de_opt_identifier")]
    pub cash_request_id: Option<String>,
    #[serde(rename = "type", deserialize_with = "de_opt_category")]
    pub fee_type: Option<String>,
    #[serde(deserialize_with = "de_opt_category")]
    pub status: Option<String>,
    pub total_amount: f64,
    #[serde(deserialize_with = "de_opt_timestamp")]
    pub created_at: Option<NaiveDateTime>,
}

impl TableSchema for RawFeeRow {
    const TABLE: &'static str = "fees";
    const FILE_NAME: &'static str = "fees.csv";
    const REQUIRED_COLUMNS: &'static [&'static str] =
        &["id", "cash_request_id", "type", "status", "total_amount", "created_at"];
}

fn de_identifier<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = String::deserialize(deserializer)?;
    normalize_identifier(&raw).ok_or_else(|| D::Error::custom("empty identifier"))
}

fn de_opt_identifier<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(normalize_identifier))
}

fn de_opt_category<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(normalize_category))
}

fn de_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(D::Error::custom)
}

fn de_opt_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<NaiveDateTime>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_timestamp(s).map(Some).map_err(D::Error::custom),
    }
}

fn de_transfer_type<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TransferType, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(D::Error::custom)
}

fn de_opt_fee_type<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<FeeType>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.as_deref()
        .and_then(normalize_category)
        .map(|s| s.parse::<FeeType>().map_err(D::Error::custom))
        .transpose()
}

fn ser_timestamp<S: Serializer>(timestamp: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&timestamp.format(TIMESTAMP_FORMAT))
}

fn ser_opt_timestamp<S: Serializer>(
    timestamp: &Option<NaiveDateTime>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match timestamp {
        Some(ts) => serializer.collect_str(&ts.format(TIMESTAMP_FORMAT)),
        None => serializer.serialize_none(),
    }
}
