//! Per-host reconciliation pass.
//!
//! One session per host, every applier in fixed order on that session, then
//! the conditional restart. Nothing in here returns an error past the host
//! boundary: failures end up in the [`ReconcileResult`] or, when the session
//! could not be opened at all, in [`HostOutcome::fatal`].

use crate::appliers::{self, Applier, ApplyContext};
use crate::config::TransferConfig;
use crate::lifecycle::{HealthPolicy, HealthProbe, ServiceController, ServiceState};
use crate::manifest::ManifestRegistry;
use crate::models::HostRecord;
use crate::session::{Connector, Session};
use crate::utils::errors::ConfigError;
use serde::Serialize;
use std::sync::Arc;
use tracing::Instrument;

/// Outcome of one pass on one host. Never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileResult {
    pub fixed: Vec<String>,
    pub already_correct: Vec<String>,
    pub errors: Vec<String>,
    pub restart_needed: bool,
    pub restarted: bool,
    pub healthy_after_restart: bool,
    /// Archive taken before the pass mutated anything.
    pub backup: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Live,
    /// Every mutation is replaced by a `[dry-run]` record.
    Preview,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostOutcome {
    pub host_id: String,
    pub result: ReconcileResult,
    pub service: ServiceState,
    /// Set when the pass could not run at all.
    pub fatal: Option<String>,
}

impl HostOutcome {
    pub fn fatal(host_id: &str, reason: String) -> Self {
        Self {
            host_id: host_id.to_string(),
            result: ReconcileResult {
                errors: vec![format!("session: {reason}")],
                ..Default::default()
            },
            service: ServiceState::Idle,
            fatal: Some(reason),
        }
    }

    /// The pipeline ran to completion. Soft errors do not count against it.
    pub fn succeeded(&self) -> bool {
        self.fatal.is_none()
    }

    pub fn degraded(&self) -> bool {
        self.service == ServiceState::Degraded
    }
}

pub struct Pipeline {
    registry: Arc<ManifestRegistry>,
    connector: Arc<dyn Connector>,
    probe: Arc<dyn HealthProbe>,
    transfer: TransferConfig,
    health: HealthPolicy,
    appliers: Vec<Box<dyn Applier>>,
}

impl Pipeline {
    /// Fails on manifest mistakes before any host is touched.
    pub fn new(
        registry: Arc<ManifestRegistry>,
        connector: Arc<dyn Connector>,
        probe: Arc<dyn HealthProbe>,
        transfer: TransferConfig,
        health: HealthPolicy,
    ) -> Result<Self, ConfigError> {
        registry.validate()?;
        Ok(Self {
            registry,
            connector,
            probe,
            transfer,
            health,
            appliers: appliers::standard(),
        })
    }

    pub fn registry(&self) -> &ManifestRegistry {
        &self.registry
    }

    pub fn target_version(&self) -> i64 {
        self.registry.version()
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn probe(&self) -> &dyn HealthProbe {
        self.probe.as_ref()
    }

    pub fn health(&self) -> HealthPolicy {
        self.health
    }

    /// Open a session, run the pass, close the session.
    pub async fn reconcile(&self, host: &HostRecord, mode: RunMode) -> HostOutcome {
        let session = match self.connector.open(host).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(host = %host.id, "cannot open session: {}", e);
                return HostOutcome::fatal(&host.id, e.to_string());
            }
        };
        let outcome = self.reconcile_session(session.as_ref(), host, mode).await;
        if let Err(e) = session.close().await {
            tracing::debug!(host = %host.id, "session close failed: {}", e);
        }
        outcome
    }

    /// Run the pass on an already open session.
    pub async fn reconcile_session(&self, session: &dyn Session, host: &HostRecord, mode: RunMode) -> HostOutcome {
        let span = tracing::info_span!("reconcile", host = %host.id, mode = ?mode);
        async move {
            let dry_run = mode == RunMode::Preview;
            let mut ctx = ApplyContext::new(session, &self.registry, host, &self.transfer, dry_run);
            for applier in &self.appliers {
                tracing::debug!(applier = applier.kind(), "running applier");
                if let Err(e) = applier.apply(&mut ctx).await {
                    ctx.error(applier.kind(), e);
                }
            }
            let mut result = ctx.into_result();

            let service = if !result.restart_needed {
                ServiceState::Idle
            } else if dry_run {
                ServiceState::RestartRequested
            } else {
                let mut controller = ServiceController::new(session, host, self.probe.as_ref(), self.health);
                controller.request_restart();
                match controller.restart(&self.registry.manifest().service).await {
                    Ok(state) => {
                        result.restarted = true;
                        result.healthy_after_restart = state == ServiceState::Healthy;
                    }
                    Err(e) => {
                        tracing::warn!("service restart failed: {}", e);
                        result.errors.push(format!("service-restart: {e}"));
                    }
                }
                controller.state()
            };

            tracing::info!(
                fixed = result.fixed.len(),
                already_correct = result.already_correct.len(),
                errors = result.errors.len(),
                restarted = result.restarted,
                "pass complete"
            );
            HostOutcome {
                host_id: host.id.clone(),
                result,
                service,
                fatal: None,
            }
        }
        .instrument(span)
        .await
    }
}
