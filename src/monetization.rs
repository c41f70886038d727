//! ARPU and lifetime value estimation
//!
//! ARPU divides a cohort's total revenue by the number of users assigned to
//! it. CLV multiplies ARPU by the number of months the cohort showed any
//! activity at all, read off the unfiltered retention matrix.

use crate::cohort::CohortAssignment;
use crate::error::{MetricsError, MetricsResult};
use crate::revenue::RevenueMatrices;
use crate::types::{ArpuRow, ClvRow, OffsetMatrix, YearMonth};

/// ARPU and CLV tables, one row per cohort in chronological order
#[derive(Debug, Clone, PartialEq)]
pub struct Monetization {
    pub arpu: Vec<ArpuRow>,
    pub clv: Vec<ClvRow>,
}

/// Estimator for per-cohort monetization metrics
pub struct MonetizationEstimator;

impl MonetizationEstimator {
    /// Compute ARPU and CLV for every assigned cohort.
    ///
    /// `partial_months` only sets the `partial_window` flag on CLV rows; those
    /// cohorts are still reported.
    pub fn estimate(
        assignment: &CohortAssignment,
        revenue: &RevenueMatrices,
        retention: &OffsetMatrix<f64>,
        partial_months: &[YearMonth],
    ) -> MetricsResult<Monetization> {
        let mut arpu_rows = Vec::new();
        let mut clv_rows = Vec::new();

        for cohort in assignment.cohorts() {
            let size = assignment.size(cohort);
            if size == 0 {
                return Err(MetricsError::DegenerateCohort {
                    cohort,
                    reason: "cohort has no users".to_string(),
                });
            }

            let cohort_revenue = revenue.total_for(cohort);
            let arpu = cohort_revenue / size as f64;
            let months = Self::retention_months(retention, cohort)?;

            arpu_rows.push(ArpuRow {
                cohort_year_month: cohort,
                cohort_revenue,
                user_count: size,
                arpu,
            });
            clv_rows.push(ClvRow {
                cohort_year_month: cohort,
                arpu,
                avg_retention_months: months,
                clv: arpu * f64::from(months),
                partial_window: partial_months.contains(&cohort),
            });
        }

        log::info!("ARPU and CLV estimated for {} cohorts", clv_rows.len());
        Ok(Monetization {
            arpu: arpu_rows,
            clv: clv_rows,
        })
    }

    /// Offsets with retention above zero; the cohort's own month always counts
    pub fn retention_months(retention: &OffsetMatrix<f64>, cohort: YearMonth) -> MetricsResult<u32> {
        let row = retention.row(cohort).ok_or_else(|| MetricsError::DegenerateCohort {
            cohort,
            reason: "cohort missing from the retention matrix".to_string(),
        })?;

        let months = row
            .iter()
            .zip(retention.columns())
            .filter(|&(ratio, &offset)| offset == 0 || matches!(ratio, Some(r) if *r > 0.0))
            .count();

        Ok(months as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::CohortAssigner;
    use crate::ledger::Ledger;
    use crate::types::{
        parse_timestamp, CalendarMatrix, CashStatus, CohortMatrix, CohortRevenue, Transaction,
        TransferType,
    };
    use pretty_assertions::assert_eq;

    fn ym(s: &str) -> YearMonth {
        s.parse().unwrap()
    }

    fn tx(id: &str, user: &str, created: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            user_id: user.to_string(),
            created_at: parse_timestamp(created).unwrap(),
            status: CashStatus::MoneyBack,
            transfer_type: TransferType::Instant,
            incident: false,
            amount: 100.0,
        }
    }

    fn assignment() -> CohortAssignment {
        let ledger = Ledger::new(
            vec![
                tx("1", "a", "2020-01-10"),
                tx("2", "b", "2020-01-11"),
                tx("3", "c", "2020-01-12"),
                tx("4", "d", "2020-01-13"),
                tx("5", "e", "2020-03-01"),
            ],
            vec![],
        )
        .unwrap();
        CohortAssigner::assign(&ledger)
    }

    fn revenue(totals: &[(&str, f64)]) -> RevenueMatrices {
        let empty: CalendarMatrix<f64> =
            CohortMatrix::from_fn(Vec::<YearMonth>::new(), Vec::new(), |_, _| None);
        RevenueMatrices {
            monthly: empty.clone(),
            cumulative: empty,
            totals: totals
                .iter()
                .map(|(c, r)| CohortRevenue {
                    cohort_year_month: ym(c),
                    cohort_revenue: *r,
                })
                .collect(),
        }
    }

    fn retention() -> OffsetMatrix<f64> {
        CohortMatrix::from_parts(
            vec![ym("2020-01"), ym("2020-03")],
            vec![0, 1, 2],
            vec![
                vec![Some(1.0), Some(0.0), Some(0.74)],
                vec![Some(1.0), None, None],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_arpu_and_clv() {
        let result = MonetizationEstimator::estimate(
            &assignment(),
            &revenue(&[("2020-01", 50.0), ("2020-03", 7.0)]),
            &retention(),
            &[ym("2020-03")],
        )
        .unwrap();

        assert_eq!(
            result.arpu[0],
            ArpuRow {
                cohort_year_month: ym("2020-01"),
                cohort_revenue: 50.0,
                user_count: 4,
                arpu: 12.5,
            }
        );
        assert_eq!(
            result.clv[0],
            ClvRow {
                cohort_year_month: ym("2020-01"),
                arpu: 12.5,
                avg_retention_months: 2,
                clv: 25.0,
                partial_window: false,
            }
        );
    }

    #[test]
    fn test_single_observation_cohort_clv_equals_arpu() {
        let result = MonetizationEstimator::estimate(
            &assignment(),
            &revenue(&[("2020-01", 50.0), ("2020-03", 7.0)]),
            &retention(),
            &[ym("2020-03")],
        )
        .unwrap();

        let last = &result.clv[1];
        assert_eq!(last.avg_retention_months, 1);
        assert_eq!(last.clv, last.arpu);
        assert!(last.partial_window);
    }

    #[test]
    fn test_clv_identity_holds_for_every_cohort() {
        let result =
            MonetizationEstimator::estimate(&assignment(), &revenue(&[]), &retention(), &[]).unwrap();

        for row in &result.clv {
            assert!(row.avg_retention_months >= 1);
            assert_eq!(row.clv, row.arpu * f64::from(row.avg_retention_months));
        }
        assert!(result.arpu.iter().all(|r| r.arpu == 0.0));
    }

    #[test]
    fn test_missing_retention_row_is_degenerate() {
        let retention: OffsetMatrix<f64> =
            CohortMatrix::from_parts(vec![ym("2020-01")], vec![0], vec![vec![Some(1.0)]]).unwrap();
        let result =
            MonetizationEstimator::estimate(&assignment(), &revenue(&[]), &retention, &[]);
        assert!(matches!(result, Err(MetricsError::DegenerateCohort { .. })));
    }
}
