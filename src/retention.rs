//! Retention computation
//!
//! Retention at offset `k` is the cohort's usage `k` months after its first
//! month divided by its usage in that first month. The filtered view drops
//! cohorts too small or too partial to compare.

use crate::cohort::CohortAssignment;
use crate::config::RetentionFilter;
use crate::error::{MetricsError, MetricsResult};
use crate::matrix::MatrixBuilder;
use crate::types::{CalendarMatrix, Exclusion, ExclusionReason, OffsetMatrix, Timeline, YearMonth};
use std::collections::BTreeMap;

/// Filtered retention matrix together with what was left out and why
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredRetention {
    pub matrix: OffsetMatrix<f64>,
    pub exclusions: Vec<Exclusion>,
    /// Calendar months treated as partial; cells falling in them are masked
    pub partial_months: Vec<YearMonth>,
}

/// Calculator for full and filtered retention matrices
pub struct RetentionCalculator;

impl RetentionCalculator {
    /// Full retention matrix indexed by elapsed-month offset.
    ///
    /// Fails with [`MetricsError::DegenerateCohort`] if a cohort has no usage
    /// in its own first month, which contradicts how cohorts are defined.
    pub fn full(usage: &CalendarMatrix<u64>, timeline: Timeline) -> MetricsResult<OffsetMatrix<f64>> {
        let aligned = MatrixBuilder::align_to_offsets(usage, timeline);

        let mut base: BTreeMap<YearMonth, u64> = BTreeMap::new();
        for &cohort in aligned.cohorts() {
            match aligned.get(cohort, 0) {
                Some(count) if count > 0 => {
                    base.insert(cohort, count);
                }
                _ => {
                    return Err(MetricsError::DegenerateCohort {
                        cohort,
                        reason: "no activity in the cohort's first month".to_string(),
                    });
                }
            }
        }

        Ok(aligned.map(|cohort, _, count| {
            base.get(&cohort)
                .map(|&first| count as f64 / first as f64)
        }))
    }

    /// Calendar months treated as partial under `filter`
    pub fn partial_months(timeline: Timeline, filter: &RetentionFilter) -> Vec<YearMonth> {
        let mut months = filter.exclude_months.clone();
        if filter.exclude_dataset_edges {
            months.push(timeline.first);
            months.push(timeline.last);
        }
        months.sort();
        months.dedup();
        months
    }

    /// Filtered retention view.
    ///
    /// Cohorts whose own month is partial, or with fewer users than
    /// `filter.min_cohort_size`, are dropped and reported. Remaining cells that
    /// fall in a partial calendar month are masked.
    pub fn filtered(
        full: &OffsetMatrix<f64>,
        assignment: &CohortAssignment,
        timeline: Timeline,
        filter: &RetentionFilter,
    ) -> FilteredRetention {
        let partial_months = Self::partial_months(timeline, filter);
        let mut exclusions = Vec::new();

        for &cohort in full.cohorts() {
            let size = assignment.size(cohort);
            let reason = if partial_months.binary_search(&cohort).is_ok() {
                Some(ExclusionReason::PartialMonth)
            } else if size < filter.min_cohort_size {
                Some(ExclusionReason::BelowMinimumSize {
                    size,
                    minimum: filter.min_cohort_size,
                })
            } else {
                None
            };

            if let Some(reason) = reason {
                log::warn!(
                    "Cohort {} excluded from filtered retention: {:?}",
                    cohort,
                    reason
                );
                exclusions.push(Exclusion { cohort, reason });
            }
        }

        let matrix = full
            .retain_cohorts(|cohort| !exclusions.iter().any(|e| e.cohort == cohort))
            .map(|cohort, offset, ratio| {
                let month = cohort.plus_months(i64::from(offset));
                if partial_months.binary_search(&month).is_ok() {
                    None
                } else {
                    Some(ratio)
                }
            });

        log::info!(
            "Filtered retention: {} of {} cohorts kept",
            matrix.cohorts().len(),
            full.cohorts().len()
        );

        FilteredRetention {
            matrix,
            exclusions,
            partial_months,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cohort::CohortAssigner;
    use crate::config::UsageMeasure;
    use crate::ledger::Ledger;
    use crate::types::{parse_timestamp, CashStatus, CohortMatrix, Transaction, TransferType};
    use pretty_assertions::assert_eq;

    fn ym(s: &str) -> YearMonth {
        s.parse().unwrap()
    }

    fn tx(id: usize, user: &str, created: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            user_id: user.to_string(),
            created_at: parse_timestamp(created).unwrap(),
            status: CashStatus::MoneyBack,
            transfer_type: TransferType::Instant,
            incident: false,
            amount: 50.0,
        }
    }

    /// Nov 2019: one user. Dec 2019: users d1..d4, two come back in Jan and
    /// one in Feb. Jan 2020: users j1, j2, one returns in Feb.
    fn sample_ledger() -> Ledger {
        let mut txs = vec![tx(1, "n1", "2019-11-25")];
        for (i, user) in ["d1", "d2", "d3", "d4"].iter().enumerate() {
            txs.push(tx(10 + i, user, "2019-12-05"));
        }
        txs.push(tx(20, "d1", "2020-01-10"));
        txs.push(tx(21, "d2", "2020-01-11"));
        txs.push(tx(22, "d1", "2020-02-01"));
        txs.push(tx(30, "j1", "2020-01-03"));
        txs.push(tx(31, "j2", "2020-01-04"));
        txs.push(tx(32, "j1", "2020-02-20"));
        Ledger::new(txs, vec![]).unwrap()
    }

    fn build() -> (OffsetMatrix<f64>, CohortAssignment, Timeline) {
        let ledger = sample_ledger();
        let timeline = ledger.timeline().unwrap();
        let assignment = CohortAssigner::assign(&ledger);
        let events = CohortAssigner::augment(&ledger, &assignment).unwrap();
        let usage = MatrixBuilder::usage(&events, timeline, UsageMeasure::Requests);
        let full = RetentionCalculator::full(&usage, timeline).unwrap();
        (full, assignment, timeline)
    }

    #[test]
    fn test_offset_zero_is_one_for_every_cohort() {
        let (full, _, _) = build();
        for &cohort in full.cohorts() {
            assert_eq!(full.get(cohort, 0), Some(1.0));
        }
    }

    #[test]
    fn test_full_retention_values() {
        let (full, _, _) = build();

        assert_eq!(
            full.row(ym("2019-12")).unwrap(),
            &[Some(1.0), Some(0.5), Some(0.25), None]
        );
        assert_eq!(
            full.row(ym("2020-01")).unwrap(),
            &[Some(1.0), Some(0.5), None, None]
        );
        assert_eq!(
            full.row(ym("2019-11")).unwrap(),
            &[Some(1.0), Some(0.0), Some(0.0), Some(0.0)]
        );
    }

    #[test]
    fn test_filtered_drops_partial_and_tiny_cohorts() {
        let (full, assignment, timeline) = build();
        let filtered =
            RetentionCalculator::filtered(&full, &assignment, timeline, &RetentionFilter::default());

        // single-user cohort stays in the full view only
        assert!(full.contains_cohort(ym("2019-11")));
        assert!(!filtered.matrix.contains_cohort(ym("2019-11")));
        assert_eq!(filtered.partial_months, vec![ym("2019-11"), ym("2020-02")]);
        assert_eq!(filtered.matrix.cohorts(), &[ym("2019-12"), ym("2020-01")]);

        // cells landing in the final partial month are masked
        assert_eq!(
            filtered.matrix.row(ym("2019-12")).unwrap(),
            &[Some(1.0), Some(0.5), None, None]
        );
        assert_eq!(
            filtered.matrix.row(ym("2020-01")).unwrap(),
            &[Some(1.0), None, None, None]
        );
        assert_eq!(filtered.exclusions.len(), 1);
        assert_eq!(filtered.exclusions[0].reason, ExclusionReason::PartialMonth);
    }

    #[test]
    fn test_filtered_minimum_size() {
        let (full, assignment, timeline) = build();
        let filter = RetentionFilter {
            min_cohort_size: 3,
            exclude_dataset_edges: false,
            exclude_months: vec![],
        };
        let filtered = RetentionCalculator::filtered(&full, &assignment, timeline, &filter);

        assert_eq!(filtered.matrix.cohorts(), &[ym("2019-12")]);
        assert_eq!(
            filtered.exclusions[0],
            Exclusion {
                cohort: ym("2019-11"),
                reason: ExclusionReason::BelowMinimumSize { size: 1, minimum: 3 },
            }
        );
        assert_eq!(filtered.matrix.get(ym("2019-12"), 2), Some(0.25));
    }

    #[test]
    fn test_zero_first_month_is_degenerate() {
        let usage: CalendarMatrix<u64> = CohortMatrix::from_parts(
            vec![ym("2020-01")],
            vec![ym("2020-01"), ym("2020-02")],
            vec![vec![Some(0), Some(3)]],
        )
        .unwrap();
        let timeline = Timeline {
            first: ym("2020-01"),
            last: ym("2020-02"),
        };

        let result = RetentionCalculator::full(&usage, timeline);
        assert!(matches!(result, Err(MetricsError::DegenerateCohort { .. })));
    }
}
