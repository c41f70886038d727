//! Incident rates per cohort
//!
//! An incident is a cash request that carries a recovery status. Rates are
//! aligned on elapsed-month offset like retention.

use crate::types::{CohortEvent, CohortMatrix, IncidentSummary, OffsetMatrix, Timeline, YearMonth};
use std::collections::BTreeMap;

/// Incident-rate matrix and per-cohort totals
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentRates {
    pub matrix: OffsetMatrix<f64>,
    pub summary: Vec<IncidentSummary>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    total: u64,
    incidents: u64,
}

impl Tally {
    fn add(&mut self, incident: bool) {
        self.total += 1;
        if incident {
            self.incidents += 1;
        }
    }

    /// `None` when nothing was observed: no data is not the same as no incidents
    fn rate(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.incidents as f64 / self.total as f64)
        }
    }
}

/// Calculator for cohort incident rates
pub struct IncidentRateCalculator;

impl IncidentRateCalculator {
    pub fn compute(events: &[CohortEvent], timeline: Timeline) -> IncidentRates {
        let mut cells: BTreeMap<(YearMonth, u32), Tally> = BTreeMap::new();
        let mut per_cohort: BTreeMap<YearMonth, Tally> = BTreeMap::new();

        for event in events {
            // offsets are non-negative once events come from the cohort assigner
            let Ok(offset) = u32::try_from(event.offset()) else {
                continue;
            };
            cells.entry((event.cohort, offset)).or_default().add(event.incident);
            per_cohort.entry(event.cohort).or_default().add(event.incident);
        }

        let offsets: Vec<u32> = (0..=timeline.max_offset()).collect();
        let matrix = CohortMatrix::from_fn(per_cohort.keys().copied(), offsets, |cohort, offset| {
            cells.get(&(cohort, offset)).and_then(Tally::rate)
        });

        let summary = per_cohort
            .iter()
            .map(|(&cohort, tally)| IncidentSummary {
                cohort_year_month: cohort,
                total_requests: tally.total,
                incident_requests: tally.incidents,
                incident_rate: tally.rate().unwrap_or(0.0),
            })
            .collect();

        log::info!("Incident rates computed for {} cohorts", per_cohort.len());
        IncidentRates { matrix, summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ym(s: &str) -> YearMonth {
        s.parse().unwrap()
    }

    fn event(id: &str, cohort: &str, month: &str, incident: bool) -> CohortEvent {
        CohortEvent {
            transaction_id: id.to_string(),
            user_id: format!("u{}", id),
            cohort: ym(cohort),
            event_month: ym(month),
            incident,
        }
    }

    fn timeline() -> Timeline {
        Timeline {
            first: ym("2020-01"),
            last: ym("2020-03"),
        }
    }

    #[test]
    fn test_rates_by_offset() {
        let events = vec![
            event("1", "2020-01", "2020-01", true),
            event("2", "2020-01", "2020-01", false),
            event("3", "2020-01", "2020-01", false),
            event("4", "2020-01", "2020-01", false),
            event("5", "2020-01", "2020-03", true),
            event("6", "2020-02", "2020-02", false),
        ];
        let rates = IncidentRateCalculator::compute(&events, timeline());

        assert_eq!(
            rates.matrix.row(ym("2020-01")).unwrap(),
            &[Some(0.25), None, Some(1.0)]
        );
        assert_eq!(rates.matrix.row(ym("2020-02")).unwrap(), &[Some(0.0), None, None]);
    }

    #[test]
    fn test_empty_offset_is_undefined_not_zero() {
        let events = vec![event("1", "2020-01", "2020-01", false)];
        let rates = IncidentRateCalculator::compute(&events, timeline());

        assert_eq!(rates.matrix.cell(ym("2020-01"), 1), Some(None));
        assert_eq!(rates.matrix.cell(ym("2020-01"), 0), Some(Some(0.0)));
    }

    #[test]
    fn test_summary_totals() {
        let events = vec![
            event("1", "2020-01", "2020-01", true),
            event("2", "2020-01", "2020-02", false),
            event("3", "2020-02", "2020-02", true),
        ];
        let rates = IncidentRateCalculator::compute(&events, timeline());

        assert_eq!(
            rates.summary,
            vec![
                IncidentSummary {
                    cohort_year_month: ym("2020-01"),
                    total_requests: 2,
                    incident_requests: 1,
                    incident_rate: 0.5,
                },
                IncidentSummary {
                    cohort_year_month: ym("2020-02"),
                    total_requests: 1,
                    incident_requests: 1,
                    incident_rate: 1.0,
                },
            ]
        );
        assert!(rates
            .matrix
            .rows()
            .flat_map(|(_, row)| row.iter().flatten())
            .all(|r| (0.0..=1.0).contains(r)));
    }
}
