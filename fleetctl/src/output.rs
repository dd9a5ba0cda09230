//! Human-readable report rendering. `--json` bypasses all of this.

use fleet_engine::models::HostRecord;
use fleet_engine::pipeline::ReconcileResult;
use fleet_engine::rollout::{CanaryReport, PreviewReport, RolloutReport};
use serde::Serialize;

/// Print `value` as JSON or through `render`.
pub fn emit<T: Serialize + ?Sized>(json: bool, value: &T, render: impl Fn(&T) -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{}", render(value));
    }
    Ok(())
}

fn result_lines(result: &ReconcileResult, lines: &mut Vec<String>) {
    lines.push(format!("  fixed ({}):", result.fixed.len()));
    lines.extend(result.fixed.iter().map(|f| format!("    {f}")));
    lines.push(format!("  already correct: {}", result.already_correct.len()));
    if !result.errors.is_empty() {
        lines.push(format!("  errors ({}):", result.errors.len()));
        lines.extend(result.errors.iter().map(|e| format!("    {e}")));
    }
    if let Some(backup) = &result.backup {
        lines.push(format!("  backup: {backup}"));
    }
}

fn finish(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

pub fn preview(report: &PreviewReport) -> String {
    let mut lines = vec![format!(
        "Preview of manifest v{} on {} (currently v{})",
        report.target_version, report.host_id, report.current_version
    )];
    if let Some(reason) = &report.outcome.fatal {
        lines.push(format!("  unreachable: {reason}"));
        return finish(lines);
    }
    result_lines(&report.outcome.result, &mut lines);
    if report.outcome.result.restart_needed {
        lines.push("  service restart would be requested".to_string());
    }
    finish(lines)
}

pub fn canary(report: &CanaryReport) -> String {
    let mut lines = vec![format!("Canary {} for manifest v{}", report.host_id, report.target_version)];
    if let Some(reason) = &report.outcome.fatal {
        lines.push(format!("  unreachable: {reason}"));
    } else {
        result_lines(&report.outcome.result, &mut lines);
        lines.push("  spot checks:".to_string());
        for check in &report.spot_checks {
            let mark = if check.passed { "ok" } else { "FAIL" };
            lines.push(format!("    [{mark}] {} ({})", check.path, check.detail));
        }
        lines.push(format!("  healthy: {}", if report.healthy { "yes" } else { "no" }));
    }
    lines.push(if report.safe {
        "Canary passed: manifest is safe to roll out".to_string()
    } else {
        "Canary FAILED: do not roll out".to_string()
    });
    finish(lines)
}

pub fn rollout(report: &RolloutReport) -> String {
    let mut lines = Vec::new();
    for batch in &report.batches {
        lines.push(format!(
            "Batch {} [{}]: fixed {}, already correct {}, errors {}, failed {}",
            batch.index,
            batch.hosts.join(", "),
            batch.fixed,
            batch.already_correct,
            batch.errors,
            batch.failed.len()
        ));
    }

    let failed = report.failed();
    lines.push(format!(
        "Rollout to manifest v{}: {} succeeded, {} failed",
        report.target_version,
        report.succeeded().len(),
        failed.len()
    ));
    if !failed.is_empty() {
        lines.push("Failed hosts:".to_string());
        lines.extend(failed.iter().map(|(host, reason)| format!("  {host}: {reason}")));
    }

    let attention = report.needs_attention();
    if !attention.is_empty() {
        lines.push("Needs attention:".to_string());
        for host in attention {
            if let Some(outcome) = report.outcomes.get(host) {
                lines.extend(outcome.result.errors.iter().map(|e| format!("  {host}: {e}")));
            }
        }
    }

    let degraded = report.degraded();
    if !degraded.is_empty() {
        lines.push(format!("Degraded after restart: {}", degraded.join(", ")));
    }
    if report.halted {
        lines.push("Halted at a batch boundary; rerun to continue".to_string());
    }
    finish(lines)
}

pub fn hosts(hosts: &[HostRecord]) -> String {
    if hosts.is_empty() {
        return "No hosts registered\n".to_string();
    }
    let lines = hosts
        .iter()
        .map(|h| {
            format!(
                "{:<20} {:<24} v{:<5} {}",
                h.id,
                format!("{}@{}:{}", h.ssh_user, h.address, h.port),
                h.manifest_version,
                h.api_mode
            )
        })
        .collect();
    finish(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_engine::lifecycle::ServiceState;
    use fleet_engine::pipeline::HostOutcome;
    use fleet_engine::rollout::BatchSummary;

    #[test]
    fn test_rollout_lists_failed_hosts() {
        let ok = HostOutcome {
            host_id: "web-1".to_string(),
            result: ReconcileResult { fixed: vec!["setting:a".to_string()], ..Default::default() },
            service: ServiceState::Idle,
            fatal: None,
        };
        let down = HostOutcome::fatal("web-2", "connection refused".to_string());
        let outcomes = vec![ok, down];

        let mut report = RolloutReport::new(4);
        report.record(BatchSummary::from_outcomes(1, &outcomes), outcomes);
        report.halted = true;

        let text = rollout(&report);
        assert!(text.contains("Batch 1 [web-1, web-2]: fixed 1, already correct 0, errors 1, failed 1"));
        assert!(text.contains("Rollout to manifest v4: 1 succeeded, 1 failed"));
        assert!(text.contains("  web-2: connection refused"));
        assert!(text.ends_with("Halted at a batch boundary; rerun to continue\n"));
    }
}
