use super::{Applier, ApplyContext};
use crate::session::{Action, Payload, RemotePath};
use crate::utils::errors::ApplyError;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Required environment variables in the service's `EnvironmentFile`.
/// Values come from the host record; the manifest only names them. Lines
/// the engine does not manage are kept as they are.
pub struct EnvApplier;

/// `NAME=value`, `NAME="value"` and `export NAME=...` lines.
pub fn parse_env(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (name, value) = line.split_once('=')?;
            Some((name.trim().to_string(), unquote(value.trim())))
        })
        .collect()
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
            .unwrap_or(value)
            .to_string(),
    }
}

fn env_line(name: &str, value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("{name}=\"{escaped}\"")
}

fn line_name(line: &str) -> Option<&str> {
    let line = line.trim();
    let line = line.strip_prefix("export ").unwrap_or(line);
    line.split_once('=').map(|(name, _)| name.trim())
}

/// Rewrite `text` so every name in `values` carries its value, replacing
/// existing lines in place and appending new ones.
fn render(text: &str, values: &BTreeMap<&str, &str>) -> String {
    let mut seen = Vec::new();
    let mut out = String::new();
    for line in text.lines() {
        match line_name(line).and_then(|n| values.get_key_value(n)) {
            Some((name, value)) if !seen.contains(name) => {
                seen.push(*name);
                out.push_str(&env_line(name, value));
            }
            // duplicate definition of a managed name
            Some(_) => continue,
            None => out.push_str(line),
        }
        out.push('\n');
    }
    for (name, value) in values {
        if !seen.contains(name) {
            out.push_str(&env_line(name, value));
            out.push('\n');
        }
    }
    out
}

#[async_trait]
impl Applier for EnvApplier {
    fn kind(&self) -> &'static str {
        "env"
    }

    async fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let manifest = ctx.registry.manifest();
        if manifest.required_environment_vars.is_empty() {
            return Ok(());
        }
        let path = manifest.service.env_file.clone();

        let current = ctx.read_file(&path).await?.unwrap_or_default();
        let text = String::from_utf8_lossy(&current).into_owned();
        let existing = parse_env(&text);

        let host = ctx.host;
        let mut desired = BTreeMap::new();
        let mut drifted = Vec::new();
        for name in &manifest.required_environment_vars {
            let label = format!("env:{name}");
            let Some(value) = host.environment.get(name) else {
                ctx.error(label, "no value in host record");
                continue;
            };
            desired.insert(name.as_str(), value.as_str());
            if existing.get(name) == Some(value) {
                ctx.correct(label);
            } else {
                drifted.push(label);
            }
        }
        if drifted.is_empty() {
            return Ok(());
        }

        let rendered = render(&text, &desired).into_bytes();
        let action = Action::Write {
            path: RemotePath::new(path.as_str()),
            payload: Payload::Inline(rendered.clone()),
            executable: false,
            private: true,
        };
        match ctx.commit(vec![action]).await {
            Ok(()) => {
                ctx.record_write(&path, rendered, false);
                for label in drifted {
                    ctx.fixed(label);
                }
            }
            Err(e) => {
                for label in drifted {
                    ctx.error(label, &e);
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
required_environment_vars = ["AGENT_TOKEN", "AGENT_REGION"]

[service]
env_file = "~/.config/agent/env"
"#;

    #[test]
    fn test_parse_env_forms() {
        let parsed = parse_env("# comment\nA=1\nexport B=\"two words\"\nC='x'\nD=\"say \\\"hi\\\"\"\n");
        assert_eq!(parsed["A"], "1");
        assert_eq!(parsed["B"], "two words");
        assert_eq!(parsed["C"], "x");
        assert_eq!(parsed["D"], "say \"hi\"");
    }

    #[test]
    fn test_render_keeps_unmanaged_lines() {
        let values = [("AGENT_TOKEN", "new")].into_iter().collect();
        let out = render("PATH_EXTRA=/opt/bin\nAGENT_TOKEN=old\nAGENT_TOKEN=older\n", &values);
        assert_eq!(out, "PATH_EXTRA=/opt/bin\nAGENT_TOKEN=\"new\"\n");
    }

    #[tokio::test]
    async fn test_missing_value_reported_and_token_written() {
        let fake = FakeHost::new().with_file("~/.config/agent/env", "LOG_FORMAT=json\n");
        let result = run(&EnvApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;

        assert_eq!(result.fixed, vec!["env:AGENT_TOKEN"]);
        assert_eq!(result.errors, vec!["env:AGENT_REGION: no value in host record"]);
        let meta = fake.file_meta("~/.config/agent/env").unwrap();
        assert_eq!(String::from_utf8(meta.content).unwrap(), "LOG_FORMAT=json\nAGENT_TOKEN=\"tok-123\"\n");
        assert!(meta.private);
        assert!(!result.restart_needed);

        let again = run(&EnvApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;
        assert!(again.fixed.is_empty());
        assert_eq!(again.already_correct, vec!["env:AGENT_TOKEN"]);
    }
}
