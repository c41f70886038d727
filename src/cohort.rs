//! Cohort assignment
//!
//! Each user belongs to the cohort of the calendar month of their earliest
//! cash request. The assignment is computed once and every transaction is
//! tagged with it to form the long event table the matrices are built from.

use crate::error::{MetricsError, MetricsResult};
use crate::ledger::Ledger;
use crate::schema::UserFirstRequestRow;
use crate::types::{CohortEvent, UserCohort, YearMonth};
use std::collections::{BTreeMap, BTreeSet};

/// Immutable user → cohort mapping with cached cohort sizes
#[derive(Debug, Clone, Default)]
pub struct CohortAssignment {
    users: BTreeMap<String, UserCohort>,
    sizes: BTreeMap<YearMonth, u64>,
}

impl CohortAssignment {
    fn from_users(users: BTreeMap<String, UserCohort>) -> Self {
        let mut sizes: BTreeMap<YearMonth, u64> = BTreeMap::new();
        for user in users.values() {
            *sizes.entry(user.cohort_year_month).or_insert(0) += 1;
        }
        Self { users, sizes }
    }

    pub fn cohort_of(&self, user_id: &str) -> Option<YearMonth> {
        self.users.get(user_id).map(|u| u.cohort_year_month)
    }

    /// Distinct users in a cohort (0 if the cohort does not exist)
    pub fn size(&self, cohort: YearMonth) -> u64 {
        self.sizes.get(&cohort).copied().unwrap_or(0)
    }

    pub fn sizes(&self) -> &BTreeMap<YearMonth, u64> {
        &self.sizes
    }

    /// Cohorts in chronological order
    pub fn cohorts(&self) -> impl Iterator<Item = YearMonth> + '_ {
        self.sizes.keys().copied()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Standalone lookup table, ordered by cohort then user id
    pub fn lookup_table(&self) -> Vec<UserCohort> {
        let mut rows: Vec<UserCohort> = self.users.values().cloned().collect();
        rows.sort_by(|a, b| {
            a.cohort_year_month
                .cmp(&b.cohort_year_month)
                .then_with(|| a.final_user_id.cmp(&b.final_user_id))
        });
        rows
    }

    /// Check the computed assignment against a precomputed first-request table.
    ///
    /// Both sides must cover exactly the same users with the same cohort keys.
    pub fn reconcile(&self, reported: &[UserFirstRequestRow]) -> MetricsResult<()> {
        let mut seen = BTreeSet::new();

        for row in reported {
            if !seen.insert(row.final_user_id.as_str()) {
                return Err(MetricsError::Referential(format!(
                    "user {} listed twice in user_first_request",
                    row.final_user_id
                )));
            }

            match self.cohort_of(&row.final_user_id) {
                None => {
                    return Err(MetricsError::Referential(format!(
                        "user {} in user_first_request has no cash requests",
                        row.final_user_id
                    )));
                }
                Some(computed) if computed != row.cohort_year_month => {
                    return Err(MetricsError::Referential(format!(
                        "user {} assigned to cohort {} but user_first_request reports {}",
                        row.final_user_id, computed, row.cohort_year_month
                    )));
                }
                Some(_) => {}
            }
        }

        if let Some(missing) = self.users.keys().find(|id| !seen.contains(id.as_str())) {
            return Err(MetricsError::Referential(format!(
                "user {} has cash requests but no user_first_request row",
                missing
            )));
        }

        log::debug!("Cohort assignment reconciled for {} users", seen.len());
        Ok(())
    }
}

/// Assigns users to cohorts and broadcasts the cohort onto transactions
pub struct CohortAssigner;

impl CohortAssigner {
    /// Compute each user's cohort from their earliest transaction
    pub fn assign(ledger: &Ledger) -> CohortAssignment {
        let mut users: BTreeMap<String, UserCohort> = BTreeMap::new();

        for tx in ledger.transactions() {
            users
                .entry(tx.user_id.clone())
                .and_modify(|u| {
                    if tx.created_at < u.first_request_date {
                        u.first_request_date = tx.created_at;
                        u.cohort_year_month = tx.month();
                    }
                })
                .or_insert_with(|| UserCohort {
                    final_user_id: tx.user_id.clone(),
                    first_request_date: tx.created_at,
                    cohort_year_month: tx.month(),
                });
        }

        let assignment = CohortAssignment::from_users(users);
        log::info!(
            "Assigned {} users to {} cohorts",
            assignment.user_count(),
            assignment.sizes.len()
        );
        assignment
    }

    /// Tag every transaction with its user's cohort and its own event month
    pub fn augment(ledger: &Ledger, assignment: &CohortAssignment) -> MetricsResult<Vec<CohortEvent>> {
        ledger
            .transactions()
            .map(|tx| {
                let cohort = assignment.cohort_of(&tx.user_id).ok_or_else(|| {
                    MetricsError::Referential(format!("user {} has no cohort", tx.user_id))
                })?;
                let event_month = tx.month();
                if event_month < cohort {
                    return Err(MetricsError::Referential(format!(
                        "cash request {} in {} predates cohort {} of user {}",
                        tx.id, event_month, cohort, tx.user_id
                    )));
                }

                Ok(CohortEvent {
                    transaction_id: tx.id.clone(),
                    user_id: tx.user_id.clone(),
                    cohort,
                    event_month,
                    incident: tx.incident,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{parse_timestamp, CashStatus, Transaction, TransferType};

    fn tx(id: &str, user: &str, created: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            user_id: user.to_string(),
            created_at: parse_timestamp(created).unwrap(),
            status: CashStatus::MoneyBack,
            transfer_type: TransferType::Regular,
            incident: false,
            amount: 100.0,
        }
    }

    fn ym(s: &str) -> YearMonth {
        s.parse().unwrap()
    }

    fn sample_ledger() -> Ledger {
        Ledger::new(
            vec![
                tx("1", "a", "2020-02-10 10:00:00"),
                tx("2", "a", "2020-01-31 23:59:59"),
                tx("3", "b", "2020-02-01 00:00:00"),
                tx("4", "c", "2019-11-20 12:00:00"),
                tx("5", "b", "2020-04-15 08:00:00"),
            ],
            vec![],
        )
        .unwrap()
    }

    fn first_request(user: &str, date: &str, cohort: &str) -> UserFirstRequestRow {
        UserFirstRequestRow {
            final_user_id: user.to_string(),
            first_request_date: parse_timestamp(date).unwrap(),
            cohort_month: None,
            cohort_year_month: ym(cohort),
        }
    }

    #[test]
    fn test_assign_uses_earliest_request() {
        let assignment = CohortAssigner::assign(&sample_ledger());

        assert_eq!(assignment.cohort_of("a"), Some(ym("2020-01")));
        assert_eq!(assignment.cohort_of("b"), Some(ym("2020-02")));
        assert_eq!(assignment.cohort_of("c"), Some(ym("2019-11")));
        assert_eq!(assignment.size(ym("2019-11")), 1);
        assert_eq!(assignment.size(ym("2020-03")), 0);

        let cohorts: Vec<YearMonth> = assignment.cohorts().collect();
        assert_eq!(cohorts, vec![ym("2019-11"), ym("2020-01"), ym("2020-02")]);
    }

    #[test]
    fn test_cohort_sizes_sum_to_distinct_users() {
        let assignment = CohortAssigner::assign(&sample_ledger());
        let total: u64 = assignment.sizes().values().sum();
        assert_eq!(total, 3);
        assert_eq!(total as usize, assignment.user_count());
    }

    #[test]
    fn test_augment_broadcasts_cohort() {
        let ledger = sample_ledger();
        let assignment = CohortAssigner::assign(&ledger);
        let events = CohortAssigner::augment(&ledger, &assignment).unwrap();

        assert_eq!(events.len(), 5);
        let late = events.iter().find(|e| e.transaction_id == "5").unwrap();
        assert_eq!(late.cohort, ym("2020-02"));
        assert_eq!(late.event_month, ym("2020-04"));
        assert_eq!(late.offset(), 2);
        assert!(events.iter().all(|e| e.offset() >= 0));
    }

    #[test]
    fn test_lookup_table_ordering() {
        let table = CohortAssigner::assign(&sample_ledger()).lookup_table();
        let users: Vec<&str> = table.iter().map(|u| u.final_user_id.as_str()).collect();
        assert_eq!(users, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_reconcile() {
        let assignment = CohortAssigner::assign(&sample_ledger());

        let consistent = vec![
            first_request("a", "2020-01-31 23:59:59", "2020-01"),
            first_request("b", "2020-02-01", "2020-02"),
            first_request("c", "2019-11-20", "2019-11"),
        ];
        assert!(assignment.reconcile(&consistent).is_ok());

        let mut wrong_cohort = consistent.clone();
        wrong_cohort[0].cohort_year_month = ym("2020-02");
        assert!(matches!(
            assignment.reconcile(&wrong_cohort),
            Err(MetricsError::Referential(_))
        ));

        let missing_user = consistent[..2].to_vec();
        assert!(matches!(
            assignment.reconcile(&missing_user),
            Err(MetricsError::Referential(_))
        ));

        let mut unknown_user = consistent.clone();
        unknown_user.push(first_request("z", "2020-03-01", "2020-03"));
        assert!(matches!(
            assignment.reconcile(&unknown_user),
            Err(MetricsError::Referential(_))
        ));
    }
}
