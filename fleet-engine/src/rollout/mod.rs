//! Fleet rollout orchestrator: preview, canary and staged batches.
//!
//! Hosts within a batch run as independent tasks; one host's failure never
//! reaches its siblings. Batches run one after another with a fixed pause,
//! and each host's version is persisted as soon as its own pass completes.

pub mod report;

pub use report::{BatchSummary, CanaryReport, PreviewReport, RolloutReport, SpotCheck};

use crate::appliers;
use crate::config::RolloutConfig;
use crate::db::store::HostStore;
use crate::lifecycle::wait_healthy;
use crate::manifest::{ManifestRegistry, WriteMode};
use crate::models::HostRecord;
use crate::pipeline::{HostOutcome, Pipeline, RunMode};
use crate::session::command::digest;
use crate::session::{Probe, ProbeValue, RemotePath, Session};
use futures_util::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Persisted flag limiting the degraded-service alert to once per host per day.
pub const DEGRADED_FLAG: &str = "degraded_after_restart";

pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    store: HostStore,
    config: RolloutConfig,
    cancel: CancellationToken,
}

/// What a spot check expects to find at one path.
enum Expect {
    Digest(String),
    Contains(String),
    Exists,
}

fn expectation(registry: &ManifestRegistry, path: &str) -> Expect {
    let Some(entry) = registry.manifest().files.find(path) else {
        return Expect::Exists;
    };
    let Ok(content) = registry.content_for(entry) else {
        return Expect::Exists;
    };
    match entry.mode {
        WriteMode::Overwrite => Expect::Digest(digest(content)),
        // content owned by the host after creation
        WriteMode::CreateIfMissing => Expect::Exists,
        WriteMode::AppendIfMarkerAbsent => match &entry.marker {
            Some(marker) => Expect::Contains(marker.clone()),
            None => Expect::Exists,
        },
        WriteMode::InsertBeforeMarker => match entry.insert_guard(content) {
            Some(guard) => Expect::Contains(guard),
            None => Expect::Exists,
        },
    }
}

impl Orchestrator {
    pub fn new(pipeline: Arc<Pipeline>, store: HostStore, config: RolloutConfig, cancel: CancellationToken) -> Self {
        Self { pipeline, store, config, cancel }
    }

    /// Dry-run the named host, or a representative one: the first host still
    /// below the target version, else the first host.
    pub async fn preview(&self, host_id: Option<&str>) -> anyhow::Result<PreviewReport> {
        let target = self.pipeline.target_version();
        let host = match host_id {
            Some(id) => self.host(id).await?,
            None => {
                let pending = self.store.below_version(target).await?;
                match pending.into_iter().next() {
                    Some(host) => host,
                    None => self
                        .store
                        .list()
                        .await?
                        .into_iter()
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("No hosts registered"))?,
                }
            }
        };

        tracing::info!(host = %host.id, target, "previewing manifest");
        let outcome = self.pipeline.reconcile(&host, RunMode::Preview).await;
        Ok(PreviewReport {
            host_id: host.id,
            current_version: host.manifest_version,
            target_version: target,
            outcome,
        })
    }

    /// Live pass on one host, then spot checks and a health check on the same
    /// session. The manifest is safe only if all three hold.
    pub async fn canary(&self, host_id: &str) -> anyhow::Result<CanaryReport> {
        let target = self.pipeline.target_version();
        let host = self.host(host_id).await?;
        tracing::info!(host = %host.id, target, "starting canary");

        let session = match self.pipeline.connector().open(&host).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(host = %host.id, "canary unreachable: {}", e);
                return Ok(CanaryReport {
                    host_id: host.id.clone(),
                    target_version: target,
                    outcome: HostOutcome::fatal(&host.id, e.to_string()),
                    spot_checks: Vec::new(),
                    healthy: false,
                    version_advanced: false,
                    safe: false,
                });
            }
        };

        let outcome = self.pipeline.reconcile_session(session.as_ref(), &host, RunMode::Live).await;
        let spot_checks = self.spot_check(session.as_ref()).await;
        let healthy = wait_healthy(self.pipeline.probe(), &host, session.as_ref(), self.pipeline.health()).await;
        if let Err(e) = session.close().await {
            tracing::debug!(host = %host.id, "session close failed: {}", e);
        }

        let version_advanced = self.store.advance_version(&host.id, target).await?;
        let safe = healthy && spot_checks.iter().all(|c| c.passed);
        if safe {
            tracing::info!(host = %host.id, target, "canary passed");
        } else {
            tracing::warn!(host = %host.id, healthy, "canary failed verification");
        }

        Ok(CanaryReport {
            host_id: host.id,
            target_version: target,
            outcome,
            spot_checks,
            healthy,
            version_advanced,
            safe,
        })
    }

    async fn spot_check(&self, session: &dyn Session) -> Vec<SpotCheck> {
        let registry = self.pipeline.registry();
        let manifest = registry.manifest();
        let paths: Vec<String> = if manifest.canary.spot_check.is_empty() {
            manifest
                .files
                .iter()
                .filter(|e| e.mode == WriteMode::Overwrite)
                .map(|e| e.remote_path.clone())
                .collect()
        } else {
            manifest.canary.spot_check.clone()
        };

        let expects: Vec<Expect> = paths.iter().map(|p| expectation(registry, p)).collect();
        let probes: Vec<Probe> = paths
            .iter()
            .zip(&expects)
            .map(|(path, expect)| {
                let path = RemotePath::new(path.as_str());
                match expect {
                    Expect::Digest(_) => Probe::Digest(path),
                    Expect::Contains(needle) => Probe::Contains { path, needle: needle.clone() },
                    Expect::Exists => Probe::Exists(path),
                }
            })
            .collect();

        let current = match appliers::query(session, &probes).await {
            Ok(current) => current,
            Err(e) => {
                return paths
                    .into_iter()
                    .map(|path| SpotCheck { path, passed: false, detail: e.to_string() })
                    .collect()
            }
        };

        paths
            .into_iter()
            .zip(expects)
            .enumerate()
            .map(|(i, (path, expect))| {
                let value = current.get(i);
                let (passed, detail) = match expect {
                    Expect::Digest(want) => match value.digest() {
                        Some(got) if got == want => (true, "content matches".to_string()),
                        Some(_) => (false, "content differs".to_string()),
                        None => (false, "file missing".to_string()),
                    },
                    Expect::Contains(needle) => match value {
                        ProbeValue::Yes => (true, format!("contains {needle:?}")),
                        ProbeValue::Absent => (false, "file missing".to_string()),
                        _ => (false, format!("{needle:?} not found")),
                    },
                    Expect::Exists => (value.is_yes(), if value.is_yes() { "present" } else { "missing" }.to_string()),
                };
                SpotCheck { path, passed, detail }
            })
            .collect()
    }

    /// Every host below the target version, in batches.
    pub async fn rollout(&self) -> anyhow::Result<RolloutReport> {
        let target = self.pipeline.target_version();
        let hosts = self.store.below_version(target).await?;
        let mut report = RolloutReport::new(target);
        if hosts.is_empty() {
            tracing::info!(target, "every host already at target version");
            return Ok(report);
        }

        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<Vec<HostRecord>> = hosts.chunks(batch_size).map(<[HostRecord]>::to_vec).collect();
        let total = batches.len();
        tracing::info!(target, hosts = hosts.len(), batches = total, "starting rollout");

        for (i, batch) in batches.into_iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.batch_delay()) => {}
                }
            }
            if self.cancel.is_cancelled() {
                tracing::warn!(completed = i, remaining = total - i, "rollout halted at batch boundary");
                report.halted = true;
                break;
            }

            let outcomes = self.run_batch(batch).await;
            let summary = BatchSummary::from_outcomes(i + 1, &outcomes);
            tracing::info!(
                batch = i + 1,
                of = total,
                fixed = summary.fixed,
                already_correct = summary.already_correct,
                errors = summary.errors,
                failed = summary.failed.len(),
                "batch complete"
            );
            report.record(summary, outcomes);
        }
        Ok(report)
    }

    async fn run_batch(&self, hosts: Vec<HostRecord>) -> Vec<HostOutcome> {
        let ids: Vec<String> = hosts.iter().map(|h| h.id.clone()).collect();
        let handles: Vec<_> = hosts
            .into_iter()
            .map(|host| {
                let pipeline = self.pipeline.clone();
                let store = self.store.clone();
                tokio::spawn(async move { run_host(&pipeline, &store, host).await })
            })
            .collect();

        ids.into_iter()
            .zip(join_all(handles).await)
            .map(|(id, joined)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(host = %id, "host worker panicked: {}", e);
                    HostOutcome::fatal(&id, format!("worker failed: {e}"))
                }
            })
            .collect()
    }

    async fn host(&self, id: &str) -> anyhow::Result<HostRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Unknown host: {}", id))
    }
}

/// One host's live pass plus its bookkeeping.
async fn run_host(pipeline: &Pipeline, store: &HostStore, host: HostRecord) -> HostOutcome {
    let mut outcome = pipeline.reconcile(&host, RunMode::Live).await;
    if !outcome.succeeded() {
        return outcome;
    }

    if let Err(e) = store.advance_version(&host.id, pipeline.target_version()).await {
        tracing::error!(host = %host.id, "failed to record manifest version: {}", e);
        outcome.fatal = Some(format!("version not recorded: {e}"));
        return outcome;
    }

    if outcome.degraded() {
        match store.mark_once_per_day(&host.id, DEGRADED_FLAG).await {
            Ok(true) => tracing::warn!(
                host = %host.id,
                alert = DEGRADED_FLAG,
                "service unhealthy after restart; configuration kept, left to external monitoring"
            ),
            Ok(false) => tracing::debug!(host = %host.id, "degraded alert already raised today"),
            Err(e) => tracing::warn!(host = %host.id, "failed to record alert flag: {}", e),
        }
    } else if outcome.result.healthy_after_restart {
        if let Err(e) = store.clear_flag(&host.id, DEGRADED_FLAG).await {
            tracing::debug!(host = %host.id, "failed to clear alert flag: {}", e);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApiMode, NewHost};
    use crate::pipeline::tests::{demo_registry, fresh_host, pipeline};
    use crate::session::fake::FakeConnector;
    use std::time::Duration;

    fn new_host(id: &str) -> NewHost {
        NewHost {
            id: id.to_string(),
            name: format!("{id}.fleet"),
            address: "10.0.0.9".to_string(),
            port: 22,
            ssh_user: "agent".to_string(),
            credential_ref: format!("{id}-key"),
            api_mode: ApiMode::Managed,
            last_known_token: Some("tok-123".to_string()),
            environment: [("AGENT_GATEWAY_TOKEN".to_string(), "tok-123".to_string())]
                .into_iter()
                .collect(),
        }
    }

    struct Fleet {
        _dir: tempfile::TempDir,
        store: HostStore,
        connector: Arc<FakeConnector>,
    }

    async fn fleet(ids: &[&str]) -> Fleet {
        let dir = tempfile::tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("fleet.db")).unwrap();
        let connector = Arc::new(FakeConnector::new());
        for id in ids {
            store.create(new_host(id)).await.unwrap();
            connector.add(id, fresh_host());
        }
        Fleet { _dir: dir, store, connector }
    }

    fn orchestrator(fleet: &Fleet, batch_size: usize, cancel: CancellationToken) -> Orchestrator {
        let pipeline = Arc::new(pipeline(demo_registry(), fleet.connector.clone()));
        let config = RolloutConfig { batch_size, batch_delay_secs: 0 };
        Orchestrator::new(pipeline, fleet.store.clone(), config, cancel)
    }

    async fn version(store: &HostStore, id: &str) -> i64 {
        store.get(id).await.unwrap().unwrap().manifest_version
    }

    #[tokio::test]
    async fn test_failed_connection_isolated_within_batch() {
        let fleet = fleet(&["h1", "h2", "h3", "h4"]).await;
        fleet.connector.set_unreachable("h2");
        let orchestrator = orchestrator(&fleet, 3, CancellationToken::new());

        let report = orchestrator.rollout().await.unwrap();

        assert_eq!(report.batches.len(), 2);
        assert_eq!(report.batches[0].failed, ["h2"]);
        assert_eq!(report.succeeded(), ["h1", "h3", "h4"]);
        assert_eq!(report.failed().keys().copied().collect::<Vec<_>>(), ["h2"]);
        assert!(!report.halted);
        for id in ["h1", "h3", "h4"] {
            assert_eq!(version(&fleet.store, id).await, 7);
        }
        assert_eq!(version(&fleet.store, "h2").await, 0);

        // the next rollout resumes with exactly the host left behind
        let pending: Vec<_> = fleet.store.below_version(7).await.unwrap().into_iter().map(|h| h.id).collect();
        assert_eq!(pending, ["h2"]);
    }

    #[tokio::test]
    async fn test_hosts_at_target_are_skipped() {
        let fleet = fleet(&["h1", "h2"]).await;
        fleet.store.advance_version("h1", 7).await.unwrap();
        let orchestrator = orchestrator(&fleet, 5, CancellationToken::new());

        let report = orchestrator.rollout().await.unwrap();
        assert_eq!(report.outcomes.keys().collect::<Vec<_>>(), ["h2"]);
    }

    #[tokio::test]
    async fn test_cancel_halts_before_next_batch() {
        let fleet = fleet(&["h1", "h2", "h3"]).await;
        let cancel = CancellationToken::new();
        let mut orchestrator = orchestrator(&fleet, 1, cancel.clone());
        orchestrator.config.batch_delay_secs = 30;

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let report = orchestrator.rollout().await.unwrap();
        canceller.await.unwrap();

        assert!(report.halted);
        assert_eq!(report.batches.len(), 1);
        assert_eq!(version(&fleet.store, "h1").await, 7);
        assert_eq!(version(&fleet.store, "h3").await, 0);
    }

    #[tokio::test]
    async fn test_degraded_host_advanced_and_alerted_once() {
        let fleet = fleet(&["h1"]).await;
        let unhealthy = fresh_host();
        unhealthy.set_healthy(false);
        fleet.connector.add("h1", unhealthy);
        let orchestrator = orchestrator(&fleet, 5, CancellationToken::new());

        let report = orchestrator.rollout().await.unwrap();
        assert_eq!(report.degraded(), ["h1"]);
        assert_eq!(version(&fleet.store, "h1").await, 7);
        // already raised today
        assert!(!fleet.store.mark_once_per_day("h1", DEGRADED_FLAG).await.unwrap());
    }

    #[tokio::test]
    async fn test_canary_safe_on_healthy_host() {
        let fleet = fleet(&["h1", "h2"]).await;
        let orchestrator = orchestrator(&fleet, 5, CancellationToken::new());

        let report = orchestrator.canary("h1").await.unwrap();
        assert!(report.safe, "{:?}", report.spot_checks);
        assert!(report.healthy);
        assert!(report.version_advanced);
        assert_eq!(report.spot_checks.len(), 2);
        assert_eq!(version(&fleet.store, "h1").await, 7);
        assert_eq!(version(&fleet.store, "h2").await, 0);
    }

    #[tokio::test]
    async fn test_canary_unsafe_when_service_unhealthy() {
        let fleet = fleet(&["h1"]).await;
        let unhealthy = fresh_host();
        unhealthy.set_healthy(false);
        fleet.connector.add("h1", unhealthy);
        let orchestrator = orchestrator(&fleet, 5, CancellationToken::new());

        let report = orchestrator.canary("h1").await.unwrap();
        assert!(!report.safe);
        assert!(!report.healthy);
        assert!(report.spot_checks.iter().all(|c| c.passed));
    }

    #[tokio::test]
    async fn test_preview_picks_pending_host_and_mutates_nothing() {
        let fleet = fleet(&["h1", "h2"]).await;
        fleet.store.advance_version("h1", 7).await.unwrap();
        let orchestrator = orchestrator(&fleet, 5, CancellationToken::new());

        let report = orchestrator.preview(None).await.unwrap();
        assert_eq!(report.host_id, "h2");
        assert_eq!(report.current_version, 0);
        assert!(!report.outcome.result.fixed.is_empty());
        assert_eq!(version(&fleet.store, "h2").await, 0);

        assert!(orchestrator.preview(Some("nope")).await.is_err());
    }
}
