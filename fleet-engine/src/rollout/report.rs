use crate::pipeline::HostOutcome;
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-batch tally printed while a rollout runs.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    /// 1-based.
    pub index: usize,
    pub hosts: Vec<String>,
    pub fixed: usize,
    pub already_correct: usize,
    pub errors: usize,
    pub failed: Vec<String>,
}

impl BatchSummary {
    pub fn from_outcomes(index: usize, outcomes: &[HostOutcome]) -> Self {
        let mut hosts: Vec<String> = outcomes.iter().map(|o| o.host_id.clone()).collect();
        hosts.sort();
        let mut failed: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.host_id.clone())
            .collect();
        failed.sort();
        Self {
            index,
            hosts,
            fixed: outcomes.iter().map(|o| o.result.fixed.len()).sum(),
            already_correct: outcomes.iter().map(|o| o.result.already_correct.len()).sum(),
            errors: outcomes.iter().map(|o| o.result.errors.len()).sum(),
            failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    pub target_version: i64,
    pub batches: Vec<BatchSummary>,
    /// Keyed by host id; batch members finish in any order.
    pub outcomes: BTreeMap<String, HostOutcome>,
    /// Stopped at a batch boundary before every host was reached.
    pub halted: bool,
}

impl RolloutReport {
    pub fn new(target_version: i64) -> Self {
        Self {
            target_version,
            batches: Vec::new(),
            outcomes: BTreeMap::new(),
            halted: false,
        }
    }

    pub fn record(&mut self, summary: BatchSummary, outcomes: Vec<HostOutcome>) {
        self.batches.push(summary);
        for outcome in outcomes {
            self.outcomes.insert(outcome.host_id.clone(), outcome);
        }
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.select(HostOutcome::succeeded)
    }

    /// Hosts that need manual follow-up, with the reason.
    pub fn failed(&self) -> BTreeMap<&str, &str> {
        self.outcomes
            .values()
            .filter_map(|o| o.fatal.as_deref().map(|reason| (o.host_id.as_str(), reason)))
            .collect()
    }

    /// Advanced, but with soft or unrepairable errors.
    pub fn needs_attention(&self) -> Vec<&str> {
        self.select(|o| o.succeeded() && !o.result.errors.is_empty())
    }

    pub fn degraded(&self) -> Vec<&str> {
        self.select(HostOutcome::degraded)
    }

    fn select(&self, keep: impl Fn(&HostOutcome) -> bool) -> Vec<&str> {
        self.outcomes
            .values()
            .filter(|o| keep(o))
            .map(|o| o.host_id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpotCheck {
    pub path: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanaryReport {
    pub host_id: String,
    pub target_version: i64,
    pub outcome: HostOutcome,
    pub spot_checks: Vec<SpotCheck>,
    pub healthy: bool,
    pub version_advanced: bool,
    /// The manifest may go fleet-wide.
    pub safe: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewReport {
    pub host_id: String,
    pub current_version: i64,
    pub target_version: i64,
    pub outcome: HostOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ServiceState;
    use crate::pipeline::ReconcileResult;

    fn outcome(id: &str, fixed: usize, errors: usize) -> HostOutcome {
        HostOutcome {
            host_id: id.to_string(),
            result: ReconcileResult {
                fixed: vec!["setting:x".to_string(); fixed],
                errors: vec!["package:y: still missing after install".to_string(); errors],
                ..Default::default()
            },
            service: ServiceState::Idle,
            fatal: None,
        }
    }

    #[test]
    fn test_aggregates_by_host_identity() {
        let outcomes = vec![
            outcome("web-3", 2, 0),
            HostOutcome::fatal("web-1", "connection refused".to_string()),
            outcome("web-2", 1, 1),
        ];
        let summary = BatchSummary::from_outcomes(1, &outcomes);
        assert_eq!(summary.hosts, ["web-1", "web-2", "web-3"]);
        assert_eq!(summary.fixed, 3);
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.failed, ["web-1"]);

        let mut report = RolloutReport::new(7);
        report.record(summary, outcomes);
        assert_eq!(report.succeeded(), ["web-2", "web-3"]);
        assert_eq!(report.needs_attention(), ["web-2"]);
        assert_eq!(report.failed().get("web-1"), Some(&"connection refused"));
    }
}
