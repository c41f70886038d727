//! Pipeline configuration
//!
//! All knobs have documented defaults matching the reference analysis, so an
//! empty JSON object (or no config file at all) reproduces it.

use crate::error::{MetricsError, MetricsResult};
use crate::types::YearMonth;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default minimum number of users a cohort needs to appear in the filtered retention view
pub const DEFAULT_MIN_COHORT_SIZE: u64 = 2;

/// Default fee status counted as revenue
pub const DEFAULT_REVENUE_FEE_STATUS: &str = "accepted";

/// What a usage matrix cell counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMeasure {
    /// Distinct cash requests
    #[default]
    Requests,
    /// Distinct users with at least one request
    ActiveUsers,
}

/// Filtered retention view settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionFilter {
    /// Cohorts with fewer users are excluded
    pub min_cohort_size: u64,
    /// Exclude the first and last calendar month present in the data
    pub exclude_dataset_edges: bool,
    /// Additional months known to be partial
    pub exclude_months: Vec<YearMonth>,
}

impl Default for RetentionFilter {
    fn default() -> Self {
        Self {
            min_cohort_size: DEFAULT_MIN_COHORT_SIZE,
            exclude_dataset_edges: true,
            exclude_months: Vec::new(),
        }
    }
}

/// Revenue aggregation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevenueConfig {
    /// Fee statuses (lower-case) whose amounts count as revenue
    pub fee_statuses: Vec<String>,
}

impl Default for RevenueConfig {
    fn default() -> Self {
        Self {
            fee_statuses: vec![DEFAULT_REVENUE_FEE_STATUS.to_string()],
        }
    }
}

impl RevenueConfig {
    pub fn counts_status(&self, status: Option<&str>) -> bool {
        status.is_some_and(|s| self.fee_statuses.iter().any(|allowed| allowed == s))
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub usage_measure: UsageMeasure,
    pub retention: RetentionFilter,
    pub revenue: RevenueConfig,
    /// Text written for undefined matrix cells
    pub undefined_cell: String,
}

impl PipelineConfig {
    /// Load configuration from JSON
    pub fn from_json(json: &str) -> MetricsResult<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> MetricsResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serialize configuration to pretty JSON
    pub fn to_json(&self) -> MetricsResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject settings that would make the run meaningless
    pub fn validate(&self) -> MetricsResult<()> {
        if self.retention.min_cohort_size == 0 {
            return Err(MetricsError::Config(
                "retention.min_cohort_size must be at least 1".to_string(),
            ));
        }
        if self.revenue.fee_statuses.is_empty() {
            return Err(MetricsError::Config(
                "revenue.fee_statuses must list at least one status".to_string(),
            ));
        }
        if self
            .undefined_cell
            .trim()
            .parse::<f64>()
            .is_ok_and(|v| v.is_finite())
        {
            return Err(MetricsError::Config(format!(
                "undefined_cell '{}' must not be numeric",
                self.undefined_cell
            )));
        }
        Ok(())
    }

    /// Lower-case fee statuses and sort excluded months
    pub fn normalize(&mut self) {
        for status in &mut self.revenue.fee_statuses {
            *status = status.trim().to_lowercase();
        }
        self.retention.exclude_months.sort();
        self.retention.exclude_months.dedup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_json_yields_defaults() {
        let config = PipelineConfig::from_json("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.retention.min_cohort_size, 2);
        assert!(config.retention.exclude_dataset_edges);
        assert_eq!(config.revenue.fee_statuses, vec!["accepted".to_string()]);
        assert_eq!(config.usage_measure, UsageMeasure::Requests);
        assert_eq!(config.undefined_cell, "");
    }

    #[test]
    fn test_partial_json_overrides() {
        let config = PipelineConfig::from_json(
            r#"{
                "usage_measure": "active_users",
                "retention": { "min_cohort_size": 10, "exclude_months": ["2020-11", "2019-11"] },
                "revenue": { "fee_statuses": [" Accepted ", "confirmed"] }
            }"#,
        )
        .unwrap();

        assert_eq!(config.usage_measure, UsageMeasure::ActiveUsers);
        assert_eq!(config.retention.min_cohort_size, 10);
        assert!(config.retention.exclude_dataset_edges);
        assert_eq!(
            config.retention.exclude_months,
            vec!["2019-11".parse().unwrap(), "2020-11".parse().unwrap()]
        );
        assert!(config.revenue.counts_status(Some("accepted")));
        assert!(config.revenue.counts_status(Some("confirmed")));
        assert!(!config.revenue.counts_status(Some("rejected")));
        assert!(!config.revenue.counts_status(None));
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(PipelineConfig::from_json(r#"{"retention": {"min_cohort_size": 0}}"#).is_err());
        assert!(PipelineConfig::from_json(r#"{"revenue": {"fee_statuses": []}}"#).is_err());
        assert!(PipelineConfig::from_json(r#"{"undefined_cell": "0"}"#).is_err());
        assert!(PipelineConfig::from_json(r#"{"retention": {"exclude_months": ["Nov"]}}"#).is_err());
    }

    #[test]
    fn test_config_round_trip() {
        let mut config = PipelineConfig::default();
        config.undefined_cell = "NA".to_string();
        let json = config.to_json().unwrap();
        assert_eq!(PipelineConfig::from_json(&json).unwrap(), config);
    }
}
