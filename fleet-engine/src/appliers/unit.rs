use super::{Applier, ApplyContext};
use crate::manifest::{ServiceSpec, UnitScope};
use crate::session::{Action, Payload, RemotePath, SystemdScope};
use crate::utils::errors::ApplyError;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// `[Service]` directives patched into the managed unit through a drop-in
/// file. A changed drop-in is reloaded and requests a restart.
pub struct UnitApplier;

pub fn systemd_scope(scope: UnitScope) -> SystemdScope {
    match scope {
        UnitScope::System => SystemdScope::System,
        UnitScope::User => SystemdScope::User,
    }
}

fn render(overrides: &BTreeMap<String, String>) -> String {
    let mut out = String::from("# Managed by fleet reconciliation; local edits are overwritten.\n[Service]\n");
    for (directive, value) in overrides {
        out.push_str(&format!("{directive}={value}\n"));
    }
    out
}

#[async_trait]
impl Applier for UnitApplier {
    fn kind(&self) -> &'static str {
        "service-unit"
    }

    async fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let manifest = ctx.registry.manifest();
        if manifest.service_unit_overrides.is_empty() {
            return Ok(());
        }
        let service: &ServiceSpec = &manifest.service;
        let label = format!("service-unit:{}", service.unit_name());
        let path = service.override_path();
        let desired = render(&manifest.service_unit_overrides).into_bytes();

        if ctx.read_file(&path).await?.as_deref() == Some(desired.as_slice()) {
            ctx.correct(label);
            return Ok(());
        }

        let actions = vec![
            Action::Write {
                path: RemotePath::new(path.as_str()),
                payload: Payload::Inline(desired.clone()),
                executable: false,
                private: false,
            },
            Action::ReloadUnits(systemd_scope(service.scope)),
        ];
        match ctx.commit(actions).await {
            Ok(()) => {
                ctx.record_write(&path, desired, false);
                ctx.fixed(label);
                ctx.request_restart("unit overrides changed");
            }
            Err(e) => ctx.error(label, e),
        }
        Ok(())
    }
}
