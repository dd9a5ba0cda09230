use super::{Applier, ApplyContext};
use crate::session::{Action, RemotePath};
use crate::utils::errors::ApplyError;
use async_trait::async_trait;

/// Archives the manifest's backup paths before anything else runs.
/// Recorded in `ReconcileResult::backup`, never as a fix.
pub struct BackupApplier;

#[async_trait]
impl Applier for BackupApplier {
    fn kind(&self) -> &'static str {
        "backup"
    }

    async fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let Some(spec) = ctx.registry.manifest().backup.clone() else {
            return Ok(());
        };
        if ctx.dry_run {
            tracing::debug!(host = %ctx.host.id, "preview skips backup");
            return Ok(());
        }

        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let archive = format!("{}/fleet-backup-{stamp}.tar.gz", spec.dest_dir.trim_end_matches('/'));
        let action = Action::Archive {
            sources: spec.paths.iter().map(|p| RemotePath::new(p.as_str())).collect(),
            dest: RemotePath::new(spec.dest_dir.trim_end_matches('/')),
            stamp,
            keep: spec.keep,
        };

        match ctx.commit(vec![action]).await {
            Ok(()) => {
                tracing::info!(host = %ctx.host.id, archive = %archive, "pre-reconcile backup taken");
                ctx.result.backup = Some(archive);
            }
            Err(e) => ctx.error("backup", e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliers::testing::{host_record, registry, run};
    use crate::session::fake::FakeHost;

    const MANIFEST: &str = r#"
version = 3

[backup]
paths = ["~/.agent/workspace"]
dest_dir = "~/.fleet-backups"
keep = 2
"#;

    #[tokio::test]
    async fn test_backup_recorded_outside_fixed() {
        let fake = FakeHost::new();
        let result = run(&BackupApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;

        assert!(result.fixed.is_empty());
        let archive = result.backup.unwrap();
        assert!(archive.starts_with("~/.fleet-backups/fleet-backup-"));
        assert!(fake.exists(&archive));
        assert_eq!(fake.counters().archives, 1);
    }

    #[tokio::test]
    async fn test_preview_takes_no_backup() {
        let fake = FakeHost::new();
        let result = run(&BackupApplier, &registry(MANIFEST), &host_record("h1"), &fake, true).await;

        assert!(result.backup.is_none());
        assert_eq!(fake.counters().applies, 0);
    }
}
