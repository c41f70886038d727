//! Raw export preparation
//!
//! Cleans the raw `cash_requests` and `fees` exports and derives the four
//! input tables the metrics pipeline reads: the merged cash/fee table, each
//! user's first request, monthly active users and the transfer-type share.

use crate::cohort::CohortAssigner;
use crate::encoder::{commit_files, EncodedFile, TableEncoder};
use crate::error::{MetricsError, MetricsResult};
use crate::ledger::Ledger;
use crate::schema::{
    InputTables, MergedCashFeeRow, MonthlyActiveUsersRow, RawCashRequestRow, RawFeeRow,
    TableReader, TableSchema, TransferTypeShareRow, UserFirstRequestRow,
};
use crate::types::{CashStatus, FeeCharge, FeeType, Transaction, TransferType, YearMonth};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Counts of what cleaning kept and dropped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareReport {
    pub cash_requests: usize,
    pub fees_kept: usize,
    pub fees_without_link: usize,
    pub orphan_fees: usize,
    pub deleted_account_ids_used: usize,
}

/// Cleaning and derivation of pipeline input tables
pub struct Preparer;

impl Preparer {
    /// Read both raw exports from disk and prepare them
    pub fn prepare_files(cash: &Path, fees: &Path) -> MetricsResult<(InputTables, PrepareReport)> {
        let cash_rows: Vec<RawCashRequestRow> = TableReader::read_file(cash)?;
        let fee_rows: Vec<RawFeeRow> = TableReader::read_file(fees)?;
        Self::prepare(&cash_rows, &fee_rows)
    }

    /// Clean raw rows and derive all four input tables
    pub fn prepare(
        cash: &[RawCashRequestRow],
        fees: &[RawFeeRow],
    ) -> MetricsResult<(InputTables, PrepareReport)> {
        let mut report = PrepareReport::default();

        let transactions = cash
            .iter()
            .enumerate()
            .map(|(idx, row)| clean_cash_request(row, idx as u64 + 2, &mut report))
            .collect::<MetricsResult<Vec<_>>>()?;
        report.cash_requests = transactions.len();

        let known: BTreeSet<&str> = transactions.iter().map(|tx| tx.id.as_str()).collect();
        let mut charges = Vec::new();
        for (idx, row) in fees.iter().enumerate() {
            let Some(transaction_id) = row.cash_request_id.clone() else {
                report.fees_without_link += 1;
                continue;
            };
            if !known.contains(transaction_id.as_str()) {
                log::warn!(
                    "Dropping fee {}: cash request {} not found",
                    row.id,
                    transaction_id
                );
                report.orphan_fees += 1;
                continue;
            }
            charges.push(clean_fee(row, transaction_id, idx as u64 + 2)?);
        }
        report.fees_kept = charges.len();

        let recovery: BTreeMap<&str, &str> = cash
            .iter()
            .filter_map(|row| Some((row.id.as_str(), row.recovery_status.as_deref()?)))
            .collect();

        let ledger = Ledger::new(transactions, charges)?;
        let tables = derive_tables(&ledger, &recovery);

        log::info!(
            "Prepared {} cash requests and {} fees ({} unlinked, {} orphaned)",
            report.cash_requests,
            report.fees_kept,
            report.fees_without_link,
            report.orphan_fees
        );
        Ok((tables, report))
    }

    /// Write prepared tables under their conventional names, all or nothing
    pub fn write_tables(tables: &InputTables, dir: &Path) -> MetricsResult<Vec<PathBuf>> {
        let files = vec![
            EncodedFile {
                name: UserFirstRequestRow::FILE_NAME.to_string(),
                contents: TableEncoder::encode_rows(&tables.user_first_request)?,
            },
            EncodedFile {
                name: MonthlyActiveUsersRow::FILE_NAME.to_string(),
                contents: TableEncoder::encode_rows(&tables.monthly_active_users)?,
            },
            EncodedFile {
                name: TransferTypeShareRow::FILE_NAME.to_string(),
                contents: TableEncoder::encode_rows(&tables.transfer_type_share)?,
            },
            EncodedFile {
                name: MergedCashFeeRow::FILE_NAME.to_string(),
                contents: TableEncoder::encode_rows(&tables.merged_cash_fee)?,
            },
        ];
        commit_files(dir, &files)
    }
}

fn clean_cash_request(
    row: &RawCashRequestRow,
    line: u64,
    report: &mut PrepareReport,
) -> MetricsResult<Transaction> {
    let invalid = |message: String| MetricsError::InvalidValue {
        table: RawCashRequestRow::TABLE,
        line,
        message,
    };

    // an active user id wins over a deleted-account id
    let user_id = match (&row.user_id, &row.deleted_account_id) {
        (Some(user), _) => user.clone(),
        (None, Some(deleted)) => {
            report.deleted_account_ids_used += 1;
            deleted.clone()
        }
        (None, None) => return Err(MetricsError::MissingUserId(row.id.clone())),
    };

    let status = row
        .status
        .as_deref()
        .map(CashStatus::from_raw)
        .ok_or_else(|| invalid(format!("cash request {} has no status", row.id)))?;

    let transfer_type: TransferType = row
        .transfer_type
        .as_deref()
        .ok_or_else(|| invalid(format!("cash request {} has no transfer_type", row.id)))?
        .parse::<TransferType>()
        .map_err(|e| invalid(e.to_string()))?;

    Ok(Transaction {
        id: row.id.clone(),
        user_id,
        created_at: row.created_at,
        status,
        transfer_type,
        incident: row.recovery_status.is_some(),
        amount: row.amount,
    })
}

fn clean_fee(row: &RawFeeRow, transaction_id: String, line: u64) -> MetricsResult<FeeCharge> {
    let fee_type: FeeType = row
        .fee_type
        .as_deref()
        .ok_or_else(|| MetricsError::InvalidValue {
            table: RawFeeRow::TABLE,
            line,
            message: format!("fee {} has no type", row.id),
        })?
        .parse::<FeeType>()
        .map_err(|e| MetricsError::InvalidValue {
            table: RawFeeRow::TABLE,
            line,
            message: e.to_string(),
        })?;

    Ok(FeeCharge {
        id: row.id.clone(),
        transaction_id,
        fee_type,
        status: row.status.clone(),
        amount: row.total_amount,
        charged_at: row.created_at,
    })
}

fn derive_tables(ledger: &Ledger, recovery: &BTreeMap<&str, &str>) -> InputTables {
    let mut fees_by_tx: BTreeMap<&str, Vec<&FeeCharge>> = BTreeMap::new();
    for fee in ledger.fees() {
        fees_by_tx.entry(fee.transaction_id.as_str()).or_default().push(fee);
    }

    let mut merged_cash_fee = Vec::new();
    let mut users_by_month: BTreeMap<YearMonth, BTreeSet<&str>> = BTreeMap::new();
    let mut transfers_by_month: BTreeMap<YearMonth, (u64, u64)> = BTreeMap::new();

    for tx in ledger.transactions() {
        users_by_month.entry(tx.month()).or_default().insert(tx.user_id.as_str());
        let counts = transfers_by_month.entry(tx.month()).or_default();
        match tx.transfer_type {
            TransferType::Instant => counts.0 += 1,
            TransferType::Regular => counts.1 += 1,
        }

        let recovery_status = recovery.get(tx.id.as_str()).copied();
        match fees_by_tx.get(tx.id.as_str()) {
            Some(fees) => merged_cash_fee.extend(
                fees.iter()
                    .map(|&fee| merged_row(tx, recovery_status, Some(fee))),
            ),
            None => merged_cash_fee.push(merged_row(tx, recovery_status, None)),
        }
    }

    let user_first_request = CohortAssigner::assign(ledger)
        .lookup_table()
        .into_iter()
        .map(|u| UserFirstRequestRow {
            cohort_month: Some(u.cohort_year_month.label()),
            final_user_id: u.final_user_id,
            first_request_date: u.first_request_date,
            cohort_year_month: u.cohort_year_month,
        })
        .collect();

    let monthly_active_users = users_by_month
        .iter()
        .map(|(&month, users)| MonthlyActiveUsersRow {
            activity_month: month,
            active_users: users.len() as u64,
        })
        .collect();

    let transfer_type_share = transfers_by_month
        .iter()
        .map(|(&month, &(instant, regular))| {
            let total = (instant + regular) as f64;
            TransferTypeShareRow {
                year_month: month,
                instant: Some(instant),
                regular: Some(regular),
                instant_share: instant as f64 / total,
                regular_share: regular as f64 / total,
            }
        })
        .collect();

    InputTables {
        user_first_request,
        monthly_active_users,
        transfer_type_share,
        merged_cash_fee,
    }
}

fn merged_row(
    tx: &Transaction,
    recovery_status: Option<&str>,
    fee: Option<&FeeCharge>,
) -> MergedCashFeeRow {
    MergedCashFeeRow {
        cash_request_id: tx.id.clone(),
        final_user_id: tx.user_id.clone(),
        amount: tx.amount,
        cash_status: tx.status.clone(),
        transfer_type: tx.transfer_type,
        cash_created_at: tx.created_at,
        recovery_status: recovery_status.map(str::to_string),
        fee_id: fee.map(|f| f.id.clone()),
        total_amount: fee.map(|f| f.amount),
        fee_type: fee.map(|f| f.fee_type),
        fee_status: fee.and_then(|f| f.status.clone()),
        fee_created_at: fee.and_then(|f| f.charged_at),
    }
}
