use super::{Applier, ApplyContext};
use crate::session::command::digest;
use crate::session::{Action, Probe, RemotePath};
use crate::utils::errors::{ApplyError, ConfigError};
use async_trait::async_trait;

/// Extra reference files colocated with installed bundles. A bundle that is
/// not installed on the host is a soft error; nothing is created for it.
pub struct BundlesApplier;

#[async_trait]
impl Applier for BundlesApplier {
    fn kind(&self) -> &'static str {
        "bundle"
    }

    async fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let registry = ctx.registry;
        let manifest = registry.manifest();
        if manifest.extra_reference_files.is_empty() {
            return Ok(());
        }
        let root = manifest
            .bundle_root
            .as_deref()
            .ok_or_else(|| ConfigError::InvalidManifest("extra_reference_files require bundle_root".into()))?;

        let mut probes = Vec::new();
        for file in &manifest.extra_reference_files {
            probes.push(Probe::Exists(RemotePath::new(file.bundle_dir(root))));
            probes.push(Probe::Digest(RemotePath::new(file.target(root))));
        }
        let current = ctx.query(&probes).await?;

        // all writes share one command, so they share one inline allowance
        let mut inline_budget = ctx.transfer.inline_write_limit;
        let mut writes = Vec::new();
        let mut labels = Vec::new();
        for (i, file) in manifest.extra_reference_files.iter().enumerate() {
            let label = format!("bundle:{}/{}", file.bundle, file.remote_path);
            let target = file.target(root);
            let content = registry.reference_content(file)?;

            if !current.get(2 * i).is_yes() {
                ctx.error(label, format!("bundle {} is not installed", file.bundle));
                continue;
            }
            let up_to_date = match ctx.known(&target) {
                Some(known) => known.content.as_deref() == Some(content),
                None => current.get(2 * i + 1).digest() == Some(digest(content).as_str()),
            };
            if up_to_date {
                ctx.correct(label);
                continue;
            }

            let payload = match ctx.payload_within(content, &mut inline_budget).await {
                Ok(payload) => payload,
                Err(e) => {
                    ctx.error(label, e);
                    continue;
                }
            };
            writes.push(Action::Write { path: RemotePath::new(target.as_str()), payload, executable: false, private: false });
            labels.push((label, target, content));
        }
        if writes.is_empty() {
            return Ok(());
        }

        match ctx.commit(writes).await {
            Ok(()) => {
                for (label, target, content) in labels {
                    ctx.record_write(&target, content.to_vec(), false);
                    ctx.fixed(label);
                }
            }
            Err(e) => {
                for (label, _, _) in labels {
                    ctx.error(label, &e);
                }
            }
        }
        Ok(())
    }
}
