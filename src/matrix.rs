//! Cohort matrix construction
//!
//! Pivots the long event table into a cohorts × calendar-months usage matrix
//! and re-indexes calendar matrices by elapsed-month offset so that every
//! cohort lines up on offset 0.

use crate::config::UsageMeasure;
use crate::types::{CalendarMatrix, CohortEvent, CohortMatrix, OffsetMatrix, Timeline, YearMonth};
use std::collections::{BTreeMap, BTreeSet};

/// Builder for cohort matrices
pub struct MatrixBuilder;

impl MatrixBuilder {
    /// Count events per (cohort, calendar month).
    ///
    /// Months before a cohort's own month are undefined; observed months
    /// without activity are zero.
    pub fn usage(events: &[CohortEvent], timeline: Timeline, measure: UsageMeasure) -> CalendarMatrix<u64> {
        let mut buckets: BTreeMap<(YearMonth, YearMonth), BTreeSet<&str>> = BTreeMap::new();

        for event in events {
            let key = match measure {
                UsageMeasure::Requests => event.transaction_id.as_str(),
                UsageMeasure::ActiveUsers => event.user_id.as_str(),
            };
            buckets
                .entry((event.cohort, event.event_month))
                .or_default()
                .insert(key);
        }

        let counts: BTreeMap<(YearMonth, YearMonth), u64> = buckets
            .into_iter()
            .map(|(k, ids)| (k, ids.len() as u64))
            .collect();

        let cohorts = events.iter().map(|e| e.cohort);
        let matrix = Self::calendar(cohorts, timeline, &counts, 0);

        log::info!(
            "Usage matrix built ({:?}): {} cohorts x {} months",
            measure,
            matrix.cohorts().len(),
            matrix.columns().len()
        );
        matrix
    }

    /// Lay out per-(cohort, month) values on the contiguous calendar axis.
    ///
    /// Missing pairs on or after the cohort month take `zero`.
    pub fn calendar<C, V>(
        cohorts: C,
        timeline: Timeline,
        values: &BTreeMap<(YearMonth, YearMonth), V>,
        zero: V,
    ) -> CalendarMatrix<V>
    where
        C: IntoIterator<Item = YearMonth>,
        V: Copy,
    {
        CohortMatrix::from_fn(cohorts, timeline.months(), |cohort, month| {
            if month < cohort {
                None
            } else {
                Some(values.get(&(cohort, month)).copied().unwrap_or(zero))
            }
        })
    }

    /// Re-index a calendar matrix by elapsed months since each cohort.
    ///
    /// Offsets whose calendar month lies past the end of `timeline` are
    /// undefined: the cohort has not been observed that long.
    pub fn align_to_offsets<V: Copy>(matrix: &CalendarMatrix<V>, timeline: Timeline) -> OffsetMatrix<V> {
        let offsets: Vec<u32> = (0..=timeline.max_offset()).collect();

        CohortMatrix::from_fn(matrix.cohorts().to_vec(), offsets, |cohort, offset| {
            let month = cohort.plus_months(i64::from(offset));
            if month > timeline.last {
                None
            } else {
                matrix.get(cohort, month)
            }
        })
    }
}
