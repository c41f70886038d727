//! Revenue aggregation per cohort
//!
//! Fee amounts are summed per (cohort, charge month). The cumulative matrix
//! runs left to right within each cohort row and never crosses cohorts.

use crate::cohort::CohortAssignment;
use crate::config::RevenueConfig;
use crate::error::{MetricsError, MetricsResult};
use crate::ledger::Ledger;
use crate::matrix::MatrixBuilder;
use crate::types::{CalendarMatrix, CohortMatrix, CohortRevenue, Timeline, YearMonth};
use std::collections::BTreeMap;

/// Monthly and cumulative revenue matrices plus per-cohort totals
#[derive(Debug, Clone, PartialEq)]
pub struct RevenueMatrices {
    pub monthly: CalendarMatrix<f64>,
    pub cumulative: CalendarMatrix<f64>,
    pub totals: Vec<CohortRevenue>,
}

impl RevenueMatrices {
    pub fn total_for(&self, cohort: YearMonth) -> f64 {
        self.totals
            .iter()
            .find(|t| t.cohort_year_month == cohort)
            .map(|t| t.cohort_revenue)
            .unwrap_or(0.0)
    }
}

/// Aggregator for fee revenue
pub struct RevenueAggregator;

impl RevenueAggregator {
    /// Sum counted fees per (cohort, month).
    ///
    /// A fee's month is its charge month, or its transaction's month when the
    /// charge timestamp is missing. The calendar axis extends past `timeline`
    /// if fees were charged after the last transaction month.
    pub fn aggregate(
        ledger: &Ledger,
        assignment: &CohortAssignment,
        timeline: Timeline,
        config: &RevenueConfig,
    ) -> MetricsResult<RevenueMatrices> {
        let mut sums: BTreeMap<(YearMonth, YearMonth), f64> = BTreeMap::new();
        let mut counted = 0usize;

        for fee in ledger.fees() {
            if !config.counts_status(fee.status.as_deref()) {
                continue;
            }

            let tx = ledger.transaction(&fee.transaction_id).ok_or_else(|| {
                MetricsError::Referential(format!(
                    "fee {} references unknown cash request {}",
                    fee.id, fee.transaction_id
                ))
            })?;
            let cohort = assignment.cohort_of(&tx.user_id).ok_or_else(|| {
                MetricsError::Referential(format!("user {} has no cohort", tx.user_id))
            })?;
            let month = fee
                .charged_at
                .as_ref()
                .map(YearMonth::from_datetime)
                .unwrap_or_else(|| tx.month());

            if month < cohort {
                return Err(MetricsError::Referential(format!(
                    "fee {} charged in {} before cohort {} of user {}",
                    fee.id, month, cohort, tx.user_id
                )));
            }

            *sums.entry((cohort, month)).or_insert(0.0) += fee.amount;
            counted += 1;
        }

        let window = Timeline::covering(
            [timeline.first, timeline.last]
                .into_iter()
                .chain(sums.keys().map(|&(_, month)| month)),
        )
        .unwrap_or(timeline);

        let monthly = MatrixBuilder::calendar(assignment.cohorts(), window, &sums, 0.0);
        let cumulative = Self::cumulative(&monthly)?;

        let totals = monthly
            .rows()
            .map(|(cohort, row)| CohortRevenue {
                cohort_year_month: cohort,
                cohort_revenue: row.iter().flatten().sum(),
            })
            .collect();

        log::info!(
            "Revenue aggregated from {} of {} fees (statuses: {:?})",
            counted,
            ledger.fee_count(),
            config.fee_statuses
        );

        Ok(RevenueMatrices {
            monthly,
            cumulative,
            totals,
        })
    }

    /// Running sum along each cohort row
    pub fn cumulative(monthly: &CalendarMatrix<f64>) -> MetricsResult<CalendarMatrix<f64>> {
        let cells: Vec<Vec<Option<f64>>> = monthly
            .rows()
            .map(|(_, row)| {
                let mut running = 0.0;
                row.iter()
                    .map(|cell| {
                        cell.map(|amount| {
                            running += amount;
                            running
                        })
                    })
                    .collect()
            })
            .collect();

        CohortMatrix::from_parts(monthly.cohorts().to_vec(), monthly.columns().to_vec(), cells)
    }
}
