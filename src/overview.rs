//! Monthly activity overview
//!
//! Joins the reported monthly tables with request and user counts recomputed
//! from the ledger, so the two sources can be compared side by side.

use crate::ledger::Ledger;
use crate::schema::{MonthlyActiveUsersRow, TransferTypeShareRow};
use crate::types::{MonthlyOverview, Timeline, YearMonth};
use std::collections::{BTreeMap, BTreeSet};

/// Tolerance when checking that transfer shares sum to one
const SHARE_TOLERANCE: f64 = 1e-6;

/// One row per month of the ledger timeline, in chronological order.
///
/// Months with no requests still appear with zero counts. Reported values are
/// `None` when the reported tables have no row for that month.
pub fn monthly_overview(
    ledger: &Ledger,
    active_users: &[MonthlyActiveUsersRow],
    transfer_shares: &[TransferTypeShareRow],
) -> Vec<MonthlyOverview> {
    let Some(timeline) = ledger.timeline() else {
        return Vec::new();
    };

    let mut requests: BTreeMap<YearMonth, u64> = BTreeMap::new();
    let mut users: BTreeMap<YearMonth, BTreeSet<&str>> = BTreeMap::new();
    for tx in ledger.transactions() {
        *requests.entry(tx.month()).or_default() += 1;
        users.entry(tx.month()).or_default().insert(tx.user_id.as_str());
    }

    let reported: BTreeMap<YearMonth, u64> = active_users
        .iter()
        .map(|r| (r.activity_month, r.active_users))
        .collect();
    let shares: BTreeMap<YearMonth, &TransferTypeShareRow> =
        transfer_shares.iter().map(|r| (r.year_month, r)).collect();

    warn_outside_window(timeline, reported.keys().chain(shares.keys()).copied());

    timeline
        .months()
        .into_iter()
        .map(|month| {
            let active = users.get(&month).map_or(0, |s| s.len() as u64);
            let reported_active = reported.get(&month).copied();
            if let Some(r) = reported_active.filter(|&r| r != active) {
                log::warn!(
                    "Active users for {} reported as {} but ledger has {}",
                    month,
                    r,
                    active
                );
            }

            let share = shares.get(&month);
            if let Some(s) = share {
                let sum = s.instant_share + s.regular_share;
                if (sum - 1.0).abs() > SHARE_TOLERANCE {
                    log::warn!("Transfer shares for {} sum to {:.6}", month, sum);
                }
            }

            MonthlyOverview {
                year_month: month,
                requests: requests.get(&month).copied().unwrap_or(0),
                active_users: active,
                reported_active_users: reported_active,
                instant_share: share.map(|s| s.instant_share),
                regular_share: share.map(|s| s.regular_share),
            }
        })
        .collect()
}

fn warn_outside_window<I: Iterator<Item = YearMonth>>(timeline: Timeline, months: I) {
    let outside: BTreeSet<YearMonth> = months.filter(|m| !timeline.contains(*m)).collect();
    if !outside.is_empty() {
        log::warn!(
            "{} reported month(s) fall outside the ledger window {}..{}",
            outside.len(),
            timeline.first,
            timeline.last
        );
    }
}
