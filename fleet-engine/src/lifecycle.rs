//! Service lifecycle controller.
//!
//! `Idle -> RestartRequested -> Restarting -> {Healthy, Degraded}`. A
//! degraded service is reported, never rolled back: the configuration that
//! was just applied stays in place and recovery is left to the external
//! monitoring loop.

use crate::appliers::unit::systemd_scope;
use crate::config::{HealthConfig, ProbeTransport};
use crate::manifest::ServiceSpec;
use crate::models::HostRecord;
use crate::session::{Action, Probe, QueryOutput, RemoteCommand, Session};
use crate::utils::errors::ApplyError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Idle,
    RestartRequested,
    Restarting,
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl From<&HealthConfig> for HealthPolicy {
    fn from(config: &HealthConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            interval: config.interval(),
        }
    }
}

/// One unauthenticated readiness check against the managed service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, host: &HostRecord, session: &dyn Session) -> bool;
}

/// Curls the service's local health URL through the host's own session.
pub struct RemoteHealthProbe {
    url: String,
}

impl RemoteHealthProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl HealthProbe for RemoteHealthProbe {
    async fn check(&self, host: &HostRecord, session: &dyn Session) -> bool {
        let probes = [Probe::HttpOk { url: self.url.clone() }];
        match session.run(&RemoteCommand::Query(probes.to_vec())).await {
            Ok(output) if output.success() => QueryOutput::parse(&probes, &output.stdout)
                .map(|v| v.get(0).is_yes())
                .unwrap_or(false),
            Ok(output) => {
                tracing::debug!(host = %host.id, exit_code = output.exit_code, "health probe command failed");
                false
            }
            Err(e) => {
                tracing::debug!(host = %host.id, "health probe error: {}", e);
                false
            }
        }
    }
}

/// GETs `http://<address>:<port><path>` from the orchestrator.
pub struct DirectHealthProbe {
    client: reqwest::Client,
    port: u16,
    path: String,
}

impl DirectHealthProbe {
    pub fn new(config: &HealthConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            port: config.direct_port,
            path: config.direct_path.clone(),
        })
    }

    fn url(&self, host: &HostRecord) -> String {
        format!("http://{}:{}{}", host.address, self.port, self.path)
    }
}

#[async_trait]
impl HealthProbe for DirectHealthProbe {
    async fn check(&self, host: &HostRecord, _session: &dyn Session) -> bool {
        match self.client.get(self.url(host)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(host = %host.id, "health request failed: {}", e);
                false
            }
        }
    }
}

/// The probe the configuration asks for.
pub fn probe_for(config: &HealthConfig, service: &ServiceSpec) -> anyhow::Result<Arc<dyn HealthProbe>> {
    Ok(match config.transport {
        ProbeTransport::Remote => Arc::new(RemoteHealthProbe::new(service.health_url.clone())),
        ProbeTransport::Direct => Arc::new(DirectHealthProbe::new(config)?),
    })
}

/// Poll until the probe passes or the attempts run out.
pub async fn wait_healthy(
    probe: &dyn HealthProbe,
    host: &HostRecord,
    session: &dyn Session,
    policy: HealthPolicy,
) -> bool {
    for attempt in 1..=policy.attempts {
        if probe.check(host, session).await {
            tracing::debug!(host = %host.id, attempt, "service healthy");
            return true;
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    false
}

/// Drives one host's service through a restart.
pub struct ServiceController<'a> {
    session: &'a dyn Session,
    host: &'a HostRecord,
    probe: &'a dyn HealthProbe,
    policy: HealthPolicy,
    state: ServiceState,
}

impl<'a> ServiceController<'a> {
    pub fn new(
        session: &'a dyn Session,
        host: &'a HostRecord,
        probe: &'a dyn HealthProbe,
        policy: HealthPolicy,
    ) -> Self {
        Self { session, host, probe, policy, state: ServiceState::Idle }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn request_restart(&mut self) {
        if self.state == ServiceState::Idle {
            self.state = ServiceState::RestartRequested;
        }
    }

    /// Stop-then-start (hard kill fallback), then wait for health. A restart
    /// command that fails leaves the service `Degraded`.
    pub async fn restart(&mut self, service: &ServiceSpec) -> Result<ServiceState, ApplyError> {
        if self.state != ServiceState::RestartRequested {
            return Ok(self.state);
        }
        self.state = ServiceState::Restarting;
        tracing::info!(host = %self.host.id, unit = %service.unit_name(), "restarting service");

        let command = RemoteCommand::Apply(vec![Action::RestartService {
            unit: service.unit_name(),
            scope: systemd_scope(service.scope),
        }]);
        let output = match self.session.run(&command).await {
            Ok(output) => output,
            Err(e) => {
                self.state = ServiceState::Degraded;
                return Err(e.into());
            }
        };
        if !output.success() {
            self.state = ServiceState::Degraded;
            return Err(ApplyError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        self.state = if wait_healthy(self.probe, self.host, self.session, self.policy).await {
            ServiceState::Healthy
        } else {
            tracing::warn!(
                host = %self.host.id,
                attempts = self.policy.attempts,
                "service not healthy after restart"
            );
            ServiceState::Degraded
        };
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliers::testing::host_record;
    use crate::session::fake::{FakeHost, FakeSession};

    fn fast(attempts: u32) -> HealthPolicy {
        HealthPolicy { attempts, interval: Duration::from_millis(1) }
    }

    #[tokio::test]
    async fn test_healthy_on_third_attempt() {
        let fake = FakeHost::new();
        fake.script_health([false, false, true]);
        let session = FakeSession::new(fake.clone());
        let host = host_record("h1");
        let probe = RemoteHealthProbe::new("http://127.0.0.1:18789/health");

        let mut controller = ServiceController::new(&session, &host, &probe, fast(6));
        assert_eq!(controller.restart(&ServiceSpec::default()).await.unwrap(), ServiceState::Idle);

        controller.request_restart();
        assert_eq!(controller.state(), ServiceState::RestartRequested);
        let state = controller.restart(&ServiceSpec::default()).await.unwrap();

        assert_eq!(state, ServiceState::Healthy);
        assert_eq!(fake.counters().restarts, 1);
        assert_eq!(fake.counters().queries, 3);
    }

    #[tokio::test]
    async fn test_degraded_after_ceiling() {
        let fake = FakeHost::new();
        fake.set_healthy(false);
        let session = FakeSession::new(fake.clone());
        let host = host_record("h1");
        let probe = RemoteHealthProbe::new("http://127.0.0.1:18789/health");

        let mut controller = ServiceController::new(&session, &host, &probe, fast(6));
        controller.request_restart();
        let state = controller.restart(&ServiceSpec::default()).await.unwrap();

        assert_eq!(state, ServiceState::Degraded);
        assert_eq!(fake.counters().queries, 6);
    }

    #[tokio::test]
    async fn test_direct_probe_against_http_endpoint() {
        use axum::{http::StatusCode, routing::get, Router};

        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/starting", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut host = host_record("h1");
        host.address = "127.0.0.1".to_string();
        let session = FakeSession::new(FakeHost::new());

        let mut config = HealthConfig { direct_port: port, ..HealthConfig::default() };
        let healthy = DirectHealthProbe::new(&config).unwrap();
        assert!(healthy.check(&host, &session).await);

        config.direct_path = "/starting".to_string();
        let starting = DirectHealthProbe::new(&config).unwrap();
        assert!(!wait_healthy(&starting, &host, &session, fast(2)).await);
    }
}
