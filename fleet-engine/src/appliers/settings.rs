use super::{Applier, ApplyContext};
use crate::session::{Action, Probe};
use crate::utils::errors::ApplyError;
use async_trait::async_trait;

/// Flat key/value settings, read and written through the service's config CLI.
pub struct SettingsApplier;

#[async_trait]
impl Applier for SettingsApplier {
    fn kind(&self) -> &'static str {
        "setting"
    }

    async fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let manifest = ctx.registry.manifest();
        if manifest.settings.is_empty() {
            return Ok(());
        }
        let cli = manifest.service.config_cli.clone();

        let probes: Vec<Probe> = manifest
            .settings
            .keys()
            .map(|key| Probe::Setting { cli: cli.clone(), key: key.clone() })
            .collect();
        let mut current = ctx.query(&probes).await?;

        let mut drifted = Vec::new();
        for (i, (key, desired)) in manifest.settings.iter().enumerate() {
            let actual = current.take(i).into_content();
            if actual.as_deref() == Some(desired.as_bytes()) {
                ctx.correct(format!("setting:{key}"));
            } else {
                tracing::debug!(host = %ctx.host.id, key = %key, "setting drifted");
                drifted.push((key.clone(), desired.clone()));
            }
        }
        if drifted.is_empty() {
            return Ok(());
        }

        let actions = drifted
            .iter()
            .map(|(key, value)| Action::SetSetting { cli: cli.clone(), key: key.clone(), value: value.clone() })
            .collect();
        match ctx.commit(actions).await {
            Ok(()) => {
                for (key, _) in drifted {
                    ctx.fixed(format!("setting:{key}"));
                }
            }
            Err(e) => {
                for (key, _) in drifted {
                    ctx.error(format!("setting:{key}"), &e);
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
version = 1

[settings]
"gateway.mode" = "local"
"agents.defaults.model" = "provider/model-large"
"#;

    #[tokio::test]
    async fn test_only_drifted_keys_are_set() {
        let fake = FakeHost::new();
        fake.set_setting("gateway.mode", "local");
        fake.set_setting("agents.defaults.model", "provider/model-small");

        let result = run(&SettingsApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;

        assert_eq!(result.fixed, vec!["setting:agents.defaults.model"]);
        assert_eq!(result.already_correct, vec!["setting:gateway.mode"]);
        assert_eq!(fake.settings()["agents.defaults.model"], "provider/model-large");
        // one query, one apply
        assert_eq!(fake.counters().queries, 1);
        assert_eq!(fake.counters().applies, 1);
    }

    #[tokio::test]
    async fn test_in_sync_sends_no_apply() {
        let fake = FakeHost::new();
        fake.set_setting("gateway.mode", "local");
        fake.set_setting("agents.defaults.model", "provider/model-large");

        let result = run(&SettingsApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;

        assert!(result.fixed.is_empty());
        assert_eq!(result.already_correct.len(), 2);
        assert_eq!(fake.counters().applies, 0);
    }

    #[tokio::test]
    async fn test_preview_marks_simulated() {
        let fake = FakeHost::new();
        let result = run(&SettingsApplier, &registry(MANIFEST), &host_record("h1"), &fake, true).await;

        assert_eq!(result.fixed.len(), 2);
        assert!(result.fixed.iter().all(|f| f.starts_with("[dry-run] setting:")));
        assert!(fake.settings().is_empty());
    }
}
