use super::{Applier, ApplyContext};
use crate::session::{Action, Probe, RemotePath};
use crate::utils::errors::ApplyError;
use async_trait::async_trait;

/// Suffix given to bootstrap files moved out of the way.
pub const DISABLED_SUFFIX: &str = ".disabled";

/// First-run bootstrap files must not survive on a provisioned host: the
/// service would re-run onboarding on its next start. Present ones are
/// moved aside, never deleted.
pub struct BootstrapApplier;

#[async_trait]
impl Applier for BootstrapApplier {
    fn kind(&self) -> &'static str {
        "bootstrap"
    }

    async fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let guards = &ctx.registry.manifest().bootstrap_guards;
        if guards.is_empty() {
            return Ok(());
        }

        let probes: Vec<Probe> = guards.iter().map(|p| Probe::Exists(RemotePath::new(p.as_str()))).collect();
        let current = ctx.query(&probes).await?;

        let mut present = Vec::new();
        for (i, path) in guards.iter().enumerate() {
            let written = ctx.known(path).is_some();
            if written || current.get(i).is_yes() {
                present.push(path.clone());
            } else {
                ctx.correct(format!("bootstrap:{path}"));
            }
        }
        if present.is_empty() {
            return Ok(());
        }

        let actions = present
            .iter()
            .map(|p| {
                let from = RemotePath::new(p.as_str());
                Action::Move { to: from.with_suffix(DISABLED_SUFFIX), from }
            })
            .collect();
        match ctx.commit(actions).await {
            Ok(()) => {
                for path in present {
                    ctx.forget(&path);
                    ctx.fixed(format!("bootstrap:{path}"));
                }
            }
            Err(e) => {
                for path in present {
                    ctx.error(format!("bootstrap:{path}"), &e);
                }
            }
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
version = 2
bootstrap_guards = ["~/.agent/workspace/BOOTSTRAP.md", "~/.agent/workspace/ONBOARD.md"]
"#;

    #[tokio::test]
    async fn test_present_guard_moved_aside() {
        let fake = FakeHost::new().with_file("~/.agent/workspace/BOOTSTRAP.md", "run onboarding");
        let result = run(&BootstrapApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;

        assert_eq!(result.fixed, vec!["bootstrap:~/.agent/workspace/BOOTSTRAP.md"]);
        assert_eq!(result.already_correct, vec!["bootstrap:~/.agent/workspace/ONBOARD.md"]);
        assert!(!fake.exists("~/.agent/workspace/BOOTSTRAP.md"));
        assert_eq!(
            fake.file_string("~/.agent/workspace/BOOTSTRAP.md.disabled").as_deref(),
            Some("run onboarding")
        );
    }

    #[tokio::test]
    async fn test_clean_host_is_untouched() {
        let fake = FakeHost::new();
        let result = run(&BootstrapApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;

        assert!(result.fixed.is_empty());
        assert_eq!(fake.counters().applies, 0);
    }
}
