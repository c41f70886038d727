//! Transaction ledger
//!
//! The merged cash/fee table repeats a cash request once per fee. This module
//! folds those rows back into distinct transactions and fee charges and
//! enforces that every fee links to exactly one existing transaction.

use crate::error::{MetricsError, MetricsResult};
use crate::schema::{MergedCashFeeRow, TableSchema};
use crate::types::{FeeCharge, Timeline, Transaction};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Distinct transactions and their fee charges, keyed by id
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    transactions: BTreeMap<String, Transaction>,
    fees: BTreeMap<String, FeeCharge>,
}

impl Ledger {
    /// Build a ledger from separate transaction and fee lists.
    ///
    /// Fails if a transaction id repeats or a fee points at a transaction that
    /// does not exist.
    pub fn new(transactions: Vec<Transaction>, fees: Vec<FeeCharge>) -> MetricsResult<Self> {
        let mut ledger = Self::default();

        for tx in transactions {
            if ledger.transactions.contains_key(&tx.id) {
                return Err(MetricsError::Referential(format!(
                    "duplicate cash request id {}",
                    tx.id
                )));
            }
            ledger.transactions.insert(tx.id.clone(), tx);
        }

        for fee in fees {
            ledger.insert_fee(fee)?;
        }

        Ok(ledger)
    }

    /// Fold merged cash/fee rows into a ledger
    pub fn from_merged(rows: &[MergedCashFeeRow]) -> MetricsResult<Self> {
        let mut ledger = Self::default();

        for (idx, row) in rows.iter().enumerate() {
            // header is line 1
            let line = idx as u64 + 2;
            let tx = Transaction {
                id: row.cash_request_id.clone(),
                user_id: row.final_user_id.clone(),
                created_at: row.cash_created_at,
                status: row.cash_status.clone(),
                transfer_type: row.transfer_type,
                incident: row.recovery_status.is_some(),
                amount: row.amount,
            };

            match ledger.transactions.entry(tx.id.clone()) {
                Entry::Occupied(existing) => {
                    let existing = existing.get();
                    if existing.user_id != tx.user_id || existing.created_at != tx.created_at {
                        return Err(MetricsError::Referential(format!(
                            "cash request {} appears with conflicting user or timestamp (line {})",
                            tx.id, line
                        )));
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(tx);
                }
            }

            if let Some(fee) = fee_from_row(row, line)? {
                ledger.insert_fee(fee)?;
            }
        }

        log::info!(
            "Ledger built: {} transactions, {} fees from {} merged rows",
            ledger.transactions.len(),
            ledger.fees.len(),
            rows.len()
        );
        Ok(ledger)
    }

    fn insert_fee(&mut self, fee: FeeCharge) -> MetricsResult<()> {
        if !self.transactions.contains_key(&fee.transaction_id) {
            return Err(MetricsError::Referential(format!(
                "fee {} references unknown cash request {}",
                fee.id, fee.transaction_id
            )));
        }

        match self.fees.entry(fee.id.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().transaction_id != fee.transaction_id {
                    return Err(MetricsError::Referential(format!(
                        "fee {} is linked to both cash request {} and {}",
                        fee.id,
                        existing.get().transaction_id,
                        fee.transaction_id
                    )));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fee);
            }
        }
        Ok(())
    }

    /// Transactions ordered by id
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    /// Fee charges ordered by id
    pub fn fees(&self) -> impl Iterator<Item = &FeeCharge> {
        self.fees.values()
    }

    pub fn transaction(&self, id: &str) -> Option<&Transaction> {
        self.transactions.get(id)
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn fee_count(&self) -> usize {
        self.fees.len()
    }

    /// Calendar window spanned by transaction creation months
    pub fn timeline(&self) -> Option<Timeline> {
        Timeline::covering(self.transactions.values().map(Transaction::month))
    }
}

fn fee_from_row(row: &MergedCashFeeRow, line: u64) -> MetricsResult<Option<FeeCharge>> {
    let invalid = |message: String| MetricsError::InvalidValue {
        table: MergedCashFeeRow::TABLE,
        line,
        message,
    };

    let Some(fee_id) = row.fee_id.clone() else {
        if row.total_amount.is_some() || row.fee_type.is_some() {
            return Err(invalid("fee columns present without a fee_id".to_string()));
        }
        return Ok(None);
    };

    let amount = row
        .total_amount
        .ok_or_else(|| invalid(format!("fee {} has no total_amount", fee_id)))?;
    let fee_type = row
        .fee_type
        .ok_or_else(|| invalid(format!("fee {} has no type", fee_id)))?;

    Ok(Some(FeeCharge {
        id: fee_id,
        transaction_id: row.cash_request_id.clone(),
        fee_type,
        status: row.fee_status.clone(),
        amount,
        charged_at: row.fee_created_at,
    }))
}
