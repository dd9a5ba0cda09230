//! Resource appliers. Each one reads the current state of one resource kind,
//! compares it with the manifest and fixes only what drifted.
//!
//! Appliers share the host's session through an [`ApplyContext`], which also
//! carries the result being built and the in-pass record of files this pass
//! has already written. In preview mode the context swallows every mutation
//! and records it as a simulated fix instead.

pub mod auth;
pub mod backup;
pub mod bootstrap;
pub mod bundles;
pub mod cron;
pub mod env;
pub mod files;
pub mod packages;
pub mod settings;
pub mod unit;

use crate::config::TransferConfig;
use crate::manifest::ManifestRegistry;
use crate::models::HostRecord;
use crate::pipeline::ReconcileResult;
use crate::session::{Action, Payload, Probe, QueryOutput, RemoteCommand, RemotePath, Session};
use crate::utils::errors::ApplyError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

/// Prefix for fixes recorded by a preview pass.
pub const DRY_RUN_PREFIX: &str = "[dry-run] ";

#[async_trait]
pub trait Applier: Send + Sync {
    /// Label prefix for this applier's entries, e.g. `setting`.
    fn kind(&self) -> &'static str;

    /// Reconcile one resource kind. Per-item failures go into the result;
    /// an `Err` means the applier could not run at all.
    async fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError>;
}

/// Every applier, in the order a pass runs them.
pub fn standard() -> Vec<Box<dyn Applier>> {
    vec![
        Box::new(backup::BackupApplier),
        Box::new(settings::SettingsApplier),
        Box::new(files::FilesApplier),
        Box::new(bootstrap::BootstrapApplier),
        Box::new(bundles::BundlesApplier),
        Box::new(cron::CronApplier),
        Box::new(packages::PackagesApplier::system()),
        Box::new(packages::PackagesApplier::interpreter()),
        Box::new(env::EnvApplier),
        Box::new(auth::AuthApplier),
        Box::new(unit::UnitApplier),
    ]
}

/// What this pass knows about a file it has written.
#[derive(Debug, Clone, Default)]
pub struct KnownFile {
    /// Whole content, when the pass wrote the whole file.
    pub content: Option<Vec<u8>>,
    /// Blocks appended or inserted by this pass.
    pub blocks: Vec<Vec<u8>>,
    pub executable: bool,
}

impl KnownFile {
    fn whole(content: Vec<u8>, executable: bool) -> Self {
        Self { content: Some(content), blocks: Vec::new(), executable }
    }

    /// `Some` when the answer follows from what this pass wrote; `None`
    /// when only the host can tell.
    pub fn contains(&self, needle: &str) -> Option<bool> {
        let needle = needle.as_bytes();
        if let Some(content) = &self.content {
            return Some(contains(content, needle));
        }
        self.blocks.iter().any(|b| contains(b, needle)).then_some(true)
    }
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Run every probe in one round trip.
pub async fn query(session: &dyn Session, probes: &[Probe]) -> Result<QueryOutput, ApplyError> {
    if probes.is_empty() {
        return Ok(QueryOutput::from_values(Vec::new()));
    }
    let output = session.run(&RemoteCommand::Query(probes.to_vec())).await?;
    if !output.success() {
        return Err(ApplyError::CommandFailed {
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    QueryOutput::parse(probes, &output.stdout).map_err(ApplyError::Parse)
}

pub struct ApplyContext<'a> {
    pub session: &'a dyn Session,
    pub registry: &'a ManifestRegistry,
    pub host: &'a HostRecord,
    pub transfer: &'a TransferConfig,
    pub dry_run: bool,
    pub result: ReconcileResult,
    known: HashMap<String, KnownFile>,
}

impl<'a> ApplyContext<'a> {
    pub fn new(
        session: &'a dyn Session,
        registry: &'a ManifestRegistry,
        host: &'a HostRecord,
        transfer: &'a TransferConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            session,
            registry,
            host,
            transfer,
            dry_run,
            result: ReconcileResult::default(),
            known: HashMap::new(),
        }
    }

    pub fn into_result(self) -> ReconcileResult {
        self.result
    }

    pub fn fixed(&mut self, label: impl Into<String>) {
        let label = label.into();
        if self.dry_run {
            tracing::info!(host = %self.host.id, "would fix {}", label);
            self.result.fixed.push(format!("{DRY_RUN_PREFIX}{label}"));
        } else {
            tracing::info!(host = %self.host.id, "fixed {}", label);
            self.result.fixed.push(label);
        }
    }

    pub fn correct(&mut self, label: impl Into<String>) {
        self.result.already_correct.push(label.into());
    }

    pub fn error(&mut self, label: impl fmt::Display, err: impl fmt::Display) {
        tracing::warn!(host = %self.host.id, "{}: {}", label, err);
        self.result.errors.push(format!("{label}: {err}"));
    }

    pub fn request_restart(&mut self, reason: &str) {
        tracing::info!(host = %self.host.id, reason, "service restart requested");
        self.result.restart_needed = true;
    }

    pub async fn query(&self, probes: &[Probe]) -> Result<QueryOutput, ApplyError> {
        query(self.session, probes).await
    }

    /// Send `actions` as one command. A preview pass sends nothing.
    pub async fn commit(&self, actions: Vec<Action>) -> Result<(), ApplyError> {
        if self.dry_run || actions.is_empty() {
            return Ok(());
        }
        let output = self.session.run(&RemoteCommand::Apply(actions)).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ApplyError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Payload for `content`: inline below `limit`, otherwise uploaded to a
    /// temporary path with the bulk primitive first.
    pub async fn payload(&self, content: &[u8], limit: usize, force_bulk: bool) -> Result<Payload, ApplyError> {
        if !force_bulk && content.len() <= limit {
            return Ok(Payload::Inline(content.to_vec()));
        }
        let staged = RemotePath::new(format!("/tmp/fleet-stage-{}", uuid::Uuid::new_v4()));
        if !self.dry_run {
            tracing::debug!(host = %self.host.id, bytes = content.len(), "staging payload via bulk transfer");
            self.session.transfer_file(content, &staged).await?;
        }
        Ok(Payload::Staged(staged))
    }

    /// Like [`payload`](Self::payload), for a command that carries several
    /// payloads: inline bytes are drawn from `budget`, and once it runs out
    /// the rest go through the bulk primitive.
    pub async fn payload_within(&self, content: &[u8], budget: &mut usize) -> Result<Payload, ApplyError> {
        let payload = self.payload(content, *budget, false).await?;
        if let Payload::Inline(bytes) = &payload {
            *budget -= bytes.len();
        }
        Ok(payload)
    }

    pub fn known(&self, path: &str) -> Option<&KnownFile> {
        self.known.get(path)
    }

    /// Record that this pass wrote the whole of `path`.
    pub fn record_write(&mut self, path: &str, content: Vec<u8>, executable: bool) {
        self.known.insert(path.to_string(), KnownFile::whole(content, executable));
    }

    /// Record that this pass added `block` to `path`.
    pub fn record_block(&mut self, path: &str, block: &[u8]) {
        let known = self.known.entry(path.to_string()).or_default();
        match &mut known.content {
            Some(content) => content.extend_from_slice(block),
            None => known.blocks.push(block.to_vec()),
        }
    }

    pub fn forget(&mut self, path: &str) {
        self.known.remove(path);
    }

    /// Current content of a whole file: from this pass if it wrote it,
    /// otherwise read from the host (`None` when absent).
    pub async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, ApplyError> {
        if let Some(content) = self.known(path).and_then(|k| k.content.clone()) {
            return Ok(Some(content));
        }
        let mut output = self.query(&[Probe::Read(RemotePath::new(path))]).await?;
        Ok(output.take(0).into_content())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::ApiMode;
    use crate::session::fake::{FakeHost, FakeSession};

    pub fn host_record(id: &str) -> HostRecord {
        HostRecord {
            id: id.to_string(),
            name: id.to_string(),
            address: "10.0.0.1".to_string(),
            port: 22,
            ssh_user: "agent".to_string(),
            credential_ref: format!("{id}-key"),
            manifest_version: 0,
            api_mode: ApiMode::Managed,
            last_known_token: Some("tok-123".to_string()),
            environment: [("AGENT_TOKEN".to_string(), "tok-123".to_string())].into_iter().collect(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    pub fn registry(text: &str) -> ManifestRegistry {
        ManifestRegistry::from_toml_str(text, std::path::Path::new(".")).unwrap()
    }

    /// Run a single applier against a fake host.
    pub async fn run(
        applier: &dyn Applier,
        registry: &ManifestRegistry,
        host: &HostRecord,
        fake: &FakeHost,
        dry_run: bool,
    ) -> ReconcileResult {
        let session = FakeSession::new(fake.clone());
        let transfer = TransferConfig::default();
        let mut ctx = ApplyContext::new(&session, registry, host, &transfer, dry_run);
        if let Err(e) = applier.apply(&mut ctx).await {
            ctx.error(applier.kind(), e);
        }
        ctx.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::{FakeHost, FakeSession};

    #[test]
    fn test_known_file_contains() {
        let whole = KnownFile::whole(b"a\n## END\n".to_vec(), false);
        assert_eq!(whole.contains("## END"), Some(true));
        assert_eq!(whole.contains("## START"), Some(false));

        let partial = KnownFile { blocks: vec![b"## fleet block".to_vec()], ..Default::default() };
        assert_eq!(partial.contains("fleet block"), Some(true));
        assert_eq!(partial.contains("other"), None);
    }

    #[test]
    fn test_standard_order() {
        let kinds: Vec<_> = standard().iter().map(|a| a.kind()).collect();
        assert_eq!(
            kinds,
            [
                "backup",
                "setting",
                "file",
                "bootstrap",
                "bundle",
                "cron",
                "package",
                "interpreter-package",
                "env",
                "auth-profile",
                "service-unit"
            ]
        );
    }

    #[tokio::test]
    async fn test_inline_budget_spills_to_bulk() {
        let fake = FakeHost::new();
        let session = FakeSession::new(fake.clone());
        let registry = testing::registry("version = 1\n");
        let host = testing::host_record("h1");
        let transfer = TransferConfig::default();
        let ctx = ApplyContext::new(&session, &registry, &host, &transfer, false);

        let mut budget = 100;
        let first = ctx.payload_within(&[b'a'; 60], &mut budget).await.unwrap();
        let second = ctx.payload_within(&[b'b'; 60], &mut budget).await.unwrap();
        let third = ctx.payload_within(&[b'c'; 40], &mut budget).await.unwrap();

        assert!(matches!(first, Payload::Inline(_)));
        assert!(matches!(second, Payload::Staged(_)));
        assert!(matches!(third, Payload::Inline(_)));
        assert_eq!(budget, 0);
        assert_eq!(fake.counters().transfers, 1);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_staged_payload() {
        let fake = FakeHost::new();
        let session = FakeSession::new(fake.clone());
        let registry = testing::registry("version = 1\n");
        let host = testing::host_record("h1");
        let transfer = TransferConfig::default();
        let ctx = ApplyContext::new(&session, &registry, &host, &transfer, false);

        let payload = ctx.payload(b"AGENT_TOKEN=secret\n", transfer.inline_write_limit, true).await.unwrap();
        assert!(matches!(payload, Payload::Staged(_)));
        assert!(fake.paths().iter().any(|p| p.starts_with("/tmp/fleet-stage-")));

        let result = ctx
            .commit(vec![
                Action::Move { from: "~/missing".into(), to: "~/missing.disabled".into() },
                Action::Write { path: "~/.agent/.env".into(), payload, executable: false, private: true },
            ])
            .await;

        assert!(result.is_err());
        assert!(!fake.exists("~/.agent/.env"));
        assert!(!fake.paths().iter().any(|p| p.starts_with("/tmp/fleet-stage-")));
    }
}
