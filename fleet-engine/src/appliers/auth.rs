//! Authentication profile for the managed service.
//!
//! The credential file is JSON: `{"profiles": {"<name>": {"<endpoint_field>":
//! ..., "<key_field>": ...}}}`. Managed hosts route through the platform
//! proxy with the token on record and are repaired when they drift.
//! Self-supplied hosts must route directly to their provider; their key was
//! never seen by the platform, so drift there is reported and the file is
//! left alone.

use super::{Applier, ApplyContext};
use crate::manifest::AuthSpec;
use crate::models::{ApiMode, HostRecord};
use crate::session::{Action, Payload, RemotePath};
use crate::utils::errors::ApplyError;
use async_trait::async_trait;
use serde_json::{Map, Value};

pub struct AuthApplier;

/// First broken invariant, if any.
fn check(spec: &AuthSpec, host: &HostRecord, doc: Option<&Value>) -> Option<String> {
    let Some(profile) = doc.and_then(|d| d.get("profiles")).and_then(|p| p.get(&spec.profile)) else {
        return Some(format!("profile {} missing", spec.profile));
    };
    let endpoint = profile.get(&spec.endpoint_field).and_then(Value::as_str);
    match host.api_mode {
        ApiMode::Managed => {
            if endpoint != Some(spec.proxy_endpoint.as_str()) {
                return Some("profile does not route through the platform proxy".into());
            }
            let key = profile.get(&spec.key_field).and_then(Value::as_str);
            if key != host.last_known_token.as_deref() {
                return Some("profile key differs from the token on record".into());
            }
        }
        ApiMode::SelfSupplied => {
            if endpoint.map_or(true, |e| e == spec.proxy_endpoint) {
                return Some("profile routes through the platform proxy".into());
            }
        }
    }
    None
}

/// `doc` with the managed profile rewritten; other profiles and unrelated
/// fields survive.
fn repaired(spec: &AuthSpec, token: &str, doc: Option<Value>) -> Value {
    let mut root = match doc {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let mut profiles = match root.remove("profiles") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let mut fields = match profiles.remove(&spec.profile) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    fields.insert(spec.endpoint_field.clone(), Value::String(spec.proxy_endpoint.clone()));
    fields.insert(spec.key_field.clone(), Value::String(token.to_string()));
    profiles.insert(spec.profile.clone(), Value::Object(fields));
    root.insert("profiles".to_string(), Value::Object(profiles));
    Value::Object(root)
}

#[async_trait]
impl Applier for AuthApplier {
    fn kind(&self) -> &'static str {
        "auth-profile"
    }

    async fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let Some(spec) = ctx.registry.manifest().auth.as_ref() else {
            return Ok(());
        };
        let label = format!("auth-profile:{}", spec.profile);
        let host = ctx.host;

        let raw = ctx.read_file(&spec.path).await?;
        let doc = raw.as_deref().and_then(|b| serde_json::from_slice::<Value>(b).ok());

        let Some(problem) = check(spec, host, doc.as_ref()) else {
            ctx.correct(label);
            return Ok(());
        };

        match host.api_mode {
            ApiMode::SelfSupplied => {
                ctx.error(label, format!("needs manual intervention: {problem}"));
            }
            ApiMode::Managed => {
                let Some(token) = host.last_known_token.as_deref() else {
                    ctx.error(label, format!("{problem}; no token on record to repair with"));
                    return Ok(());
                };
                tracing::debug!(host = %host.id, problem = %problem, "repairing auth profile");

                let mut content = serde_json::to_vec_pretty(&repaired(spec, token, doc))
                    .map_err(|e| ApplyError::Parse(e.to_string()))?;
                content.push(b'\n');
                let action = Action::Write {
                    path: RemotePath::new(spec.path.as_str()),
                    payload: Payload::Inline(content.clone()),
                    executable: false,
                    private: true,
                };
                match ctx.commit(vec![action]).await {
                    Ok(()) => {
                        ctx.record_write(&spec.path, content, false);
                        ctx.fixed(label);
                        ctx.request_restart("auth profile rewritten");
                    }
                    Err(e) => ctx.error(label, e),
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
    use serde_json::json;

    const MANIFEST: &str = r#"
version = 1

[auth]
path = "~/.agent/auth-profiles.json"
proxy_endpoint = "https://proxy.fleet.internal/v1"
"#;

    const PATH: &str = "~/.agent/auth-profiles.json";

    #[tokio::test]
    async fn test_managed_drift_repaired_and_restart_requested() {
        let fake = FakeHost::new().with_file(
            PATH,
            r#"{"profiles": {"default": {"base_url": "https://api.provider.example", "api_key": "stale"}, "other": {"x": 1}}}"#,
        );
        let result = run(&AuthApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;

        assert_eq!(result.fixed, vec!["auth-profile:default"]);
        assert!(result.restart_needed);

        let doc: Value = serde_json::from_slice(&fake.file(PATH).unwrap()).unwrap();
        assert_eq!(doc["profiles"]["default"]["base_url"], "https://proxy.fleet.internal/v1");
        assert_eq!(doc["profiles"]["default"]["api_key"], "tok-123");
        assert_eq!(doc["profiles"]["other"]["x"], 1);

        let again = run(&AuthApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;
        assert_eq!(again.already_correct, vec!["auth-profile:default"]);
        assert!(!again.restart_needed);
    }

    #[tokio::test]
    async fn test_missing_file_created_for_managed_host() {
        let fake = FakeHost::new();
        let result = run(&AuthApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;

        assert!(result.restart_needed);
        assert!(fake.file_meta(PATH).unwrap().private);
    }

    #[tokio::test]
    async fn test_self_supplied_drift_left_untouched() {
        let original = r#"{"profiles": {"default": {"base_url": "https://proxy.fleet.internal/v1", "api_key": "sk-owner"}}}"#;
        let fake = FakeHost::new().with_file(PATH, original);
        let mut host = host_record("h1");
        host.api_mode = ApiMode::SelfSupplied;

        let result = run(&AuthApplier, &registry(MANIFEST), &host, &fake, false).await;

        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("auth-profile:default: needs manual intervention"));
        assert!(result.fixed.is_empty());
        assert!(!result.restart_needed);
        assert_eq!(fake.file(PATH).unwrap(), original.as_bytes());
        assert_eq!(fake.counters().applies, 0);
    }

    #[test]
    fn test_self_supplied_direct_route_is_correct() {
        let spec: AuthSpec = toml::from_str(
            r#"
path = "p"
proxy_endpoint = "https://proxy.fleet.internal/v1"
"#,
        )
        .unwrap();
        let mut host = host_record("h1");
        host.api_mode = ApiMode::SelfSupplied;
        host.last_known_token = None;

        let doc = json!({"profiles": {"default": {"base_url": "https://api.provider.example", "api_key": "sk"}}});
        assert_eq!(check(&spec, &host, Some(&doc)), None);
        assert!(check(&spec, &host, None).is_some());
    }
}
