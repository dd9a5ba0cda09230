//! File deployment: one state machine per entry over the four write modes.
//!
//! Every entry is probed in one round trip up front. Entries are then
//! handled in declaration order; an entry whose path an earlier entry
//! already touched is judged against what that entry wrote, not against the
//! stale probe, which keeps preview and live passes in lockstep.

use super::{Applier, ApplyContext};
use crate::manifest::{FileEntry, WriteMode};
use crate::session::command::digest;
use crate::session::{Action, Probe, ProbeValue, QueryOutput, RemotePath};
use crate::utils::errors::{ApplyError, ConfigError};
use async_trait::async_trait;

pub struct FilesApplier;

/// Probe indices for one entry.
enum Checks {
    Overwrite { digest: usize, executable: Option<usize> },
    Create { exists: usize },
    Append { marker: usize },
    Insert { guard: usize, anchor: usize },
}

enum Verdict {
    Correct,
    /// Nothing to do for a reason worth a log line.
    Skip(&'static str),
    Write,
    Append,
    Insert { anchor: String },
    Error(String),
}

fn marker(entry: &FileEntry) -> Result<&str, ConfigError> {
    entry.marker.as_deref().ok_or_else(|| ConfigError::MissingMarker {
        path: entry.remote_path.clone(),
        mode: entry.mode.to_string(),
    })
}

fn plan(entry: &FileEntry, content: &[u8], probes: &mut Vec<Probe>) -> Result<Checks, ConfigError> {
    let path = RemotePath::new(entry.remote_path.as_str());
    let mut push = |probe: Probe| {
        probes.push(probe);
        probes.len() - 1
    };
    Ok(match entry.mode {
        WriteMode::Overwrite => Checks::Overwrite {
            digest: push(Probe::Digest(path.clone())),
            executable: entry.executable.then(|| push(Probe::Executable(path))),
        },
        WriteMode::CreateIfMissing => Checks::Create { exists: push(Probe::Exists(path)) },
        WriteMode::AppendIfMarkerAbsent => Checks::Append {
            marker: push(Probe::Contains { path, needle: marker(entry)?.to_string() }),
        },
        WriteMode::InsertBeforeMarker => {
            let guard = entry.insert_guard(content).ok_or_else(|| {
                ConfigError::InvalidManifest(format!("insert for {} has no guard", entry.remote_path))
            })?;
            Checks::Insert {
                guard: push(Probe::Contains { path: path.clone(), needle: guard }),
                anchor: push(Probe::Contains { path, needle: marker(entry)?.to_string() }),
            }
        }
    })
}

impl FilesApplier {
    fn judge(
        ctx: &ApplyContext<'_>,
        entry: &FileEntry,
        content: &[u8],
        checks: &Checks,
        current: &QueryOutput,
    ) -> Result<Verdict, ConfigError> {
        let known = ctx.known(&entry.remote_path);
        // text searches: what this pass wrote decides, else the host's answer
        let search = |needle: &str, index: usize| -> ProbeValue {
            match known.and_then(|k| k.contains(needle)) {
                Some(true) => ProbeValue::Yes,
                Some(false) => ProbeValue::No,
                None if known.is_some() && current.get(index) == &ProbeValue::Absent => ProbeValue::No,
                None => current.get(index).clone(),
            }
        };

        Ok(match checks {
            Checks::Overwrite { digest: d, executable } => {
                let same_bytes = match known {
                    Some(k) => k.content.as_deref() == Some(content),
                    None => current.get(*d).digest() == Some(digest(content).as_str()),
                };
                let exec_ok = match (known, executable) {
                    (_, None) => true,
                    (Some(k), Some(_)) => k.executable,
                    (None, Some(i)) => current.get(*i).is_yes(),
                };
                if same_bytes && exec_ok {
                    Verdict::Correct
                } else {
                    Verdict::Write
                }
            }
            Checks::Create { exists } => {
                if known.is_some() || current.get(*exists).is_yes() {
                    Verdict::Correct
                } else {
                    Verdict::Write
                }
            }
            Checks::Append { marker: m } => match search(marker(entry)?, *m) {
                ProbeValue::Yes => Verdict::Correct,
                // legacy file some hosts never had
                ProbeValue::Absent => Verdict::Skip("file absent"),
                _ => Verdict::Append,
            },
            Checks::Insert { guard, anchor } => {
                let guard_text = entry.insert_guard(content).unwrap_or_default();
                let anchor_text = marker(entry)?;
                if search(&guard_text, *guard).is_yes() {
                    Verdict::Correct
                } else if search(anchor_text, *anchor).is_yes() {
                    Verdict::Insert { anchor: anchor_text.to_string() }
                } else {
                    Verdict::Error(format!("anchor line {anchor_text:?} not found"))
                }
            }
        })
    }

    async fn fix(ctx: &mut ApplyContext<'_>, entry: &FileEntry, content: &[u8], verdict: Verdict) -> Result<(), ApplyError> {
        let path = RemotePath::new(entry.remote_path.as_str());
        let limits = ctx.transfer;
        match verdict {
            Verdict::Write => {
                let payload = ctx.payload(content, limits.inline_write_limit, entry.bulk_transfer).await?;
                ctx.commit(vec![Action::Write { path, payload, executable: entry.executable, private: false }])
                    .await?;
                ctx.record_write(&entry.remote_path, content.to_vec(), entry.executable);
            }
            Verdict::Append => {
                let payload = ctx.payload(content, limits.inline_append_limit, entry.bulk_transfer).await?;
                ctx.commit(vec![Action::Append { path, payload }]).await?;
                ctx.record_block(&entry.remote_path, content);
            }
            Verdict::Insert { anchor } => {
                let payload = ctx.payload(content, limits.inline_append_limit, entry.bulk_transfer).await?;
                ctx.commit(vec![Action::InsertBefore { path, anchor, payload }]).await?;
                ctx.record_block(&entry.remote_path, content);
            }
            Verdict::Correct | Verdict::Skip(_) | Verdict::Error(_) => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Applier for FilesApplier {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let registry = ctx.registry;
        let files = &registry.manifest().files;
        if files.is_empty() {
            return Ok(());
        }

        let mut probes = Vec::new();
        let mut planned = Vec::with_capacity(files.len());
        for entry in files {
            let content = registry.content_for(entry)?;
            let checks = plan(entry, content, &mut probes)?;
            planned.push((entry, content, checks));
        }
        let current = ctx.query(&probes).await?;

        for (entry, content, checks) in planned {
            let label = format!("file:{}", entry.remote_path);
            let verdict = Self::judge(ctx, entry, content, &checks, &current)?;
            match verdict {
                Verdict::Correct => ctx.correct(label),
                Verdict::Skip(reason) => {
                    tracing::debug!(host = %ctx.host.id, path = %entry.remote_path, reason, "nothing to do");
                    ctx.correct(label);
                }
                Verdict::Error(reason) => ctx.error(label, reason),
                verdict => match Self::fix(ctx, entry, content, verdict).await {
                    Ok(()) => ctx.fixed(label),
                    Err(e) => ctx.error(label, e),
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliers::testing::{host_record, registry, run};
    use crate::manifest::ManifestRegistry;
    use crate::session::fake::FakeHost;

    const MANIFEST: &str = r###"
version = 4

[[files]]
remote_path = "~/.agent/TOOLS.md"
mode = "overwrite"
content = "# Tools\n"

[[files]]
remote_path = "~/.agent/USER.md"
mode = "create_if_missing"
content = "# User\n"

[[files]]
remote_path = "~/.agent/bin/check.sh"
mode = "overwrite"
content = "#!/bin/sh\nexit 0\n"
executable = true

[[files]]
remote_path = "~/.agent/AGENTS.md"
mode = "append_if_marker_absent"
marker = "## Fleet conventions"
content = "\n## Fleet conventions\nUse the proxy.\n"

[[files]]
remote_path = "~/.agent/SOUL.md"
mode = "insert_before_marker"
marker = "## Boundaries"
content = "## Platform limits\nNo root.\n"
"###;

    fn drifted_host() -> FakeHost {
        FakeHost::new()
            .with_file("~/.agent/AGENTS.md", "# Agents\n")
            .with_file("~/.agent/SOUL.md", "# Soul\n## Boundaries\nbe kind\n")
    }

    #[tokio::test]
    async fn test_fresh_pass_then_idempotent() {
        let reg = registry(MANIFEST);
        let host = host_record("h1");
        let fake = drifted_host();

        let first = run(&FilesApplier, &reg, &host, &fake, false).await;
        assert!(first.errors.is_empty(), "{:?}", first.errors);
        assert_eq!(first.fixed.len(), 5);

        assert_eq!(fake.file_string("~/.agent/TOOLS.md").unwrap(), "# Tools\n");
        assert!(fake.file_meta("~/.agent/bin/check.sh").unwrap().executable);
        assert_eq!(
            fake.file_string("~/.agent/SOUL.md").unwrap(),
            "# Soul\n## Platform limits\nNo root.\n## Boundaries\nbe kind\n"
        );

        let second = run(&FilesApplier, &reg, &host, &fake, false).await;
        assert!(second.fixed.is_empty(), "{:?}", second.fixed);
        assert_eq!(second.already_correct.len(), 5);
    }

    #[tokio::test]
    async fn test_create_if_missing_never_touches_existing() {
        let fake = drifted_host().with_file("~/.agent/USER.md", "custom notes\n");
        let result = run(&FilesApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;

        assert!(result.already_correct.contains(&"file:~/.agent/USER.md".to_string()));
        assert_eq!(fake.file_string("~/.agent/USER.md").unwrap(), "custom notes\n");
    }

    #[tokio::test]
    async fn test_append_block_present_exactly_once() {
        let reg = registry(MANIFEST);
        let host = host_record("h1");
        let fake = drifted_host();

        for _ in 0..3 {
            run(&FilesApplier, &reg, &host, &fake, false).await;
        }
        let agents = fake.file_string("~/.agent/AGENTS.md").unwrap();
        assert_eq!(agents.matches("## Fleet conventions").count(), 1);
    }

    #[tokio::test]
    async fn test_append_target_absent_is_not_an_error() {
        let fake = FakeHost::new().with_file("~/.agent/SOUL.md", "## Boundaries\n");
        let result = run(&FilesApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;

        assert!(result.errors.is_empty());
        assert!(result.already_correct.contains(&"file:~/.agent/AGENTS.md".to_string()));
        assert!(!fake.exists("~/.agent/AGENTS.md"));
    }

    #[tokio::test]
    async fn test_missing_anchor_is_reported() {
        let fake = drifted_host().with_file("~/.agent/SOUL.md", "# Soul\nno sections\n");
        let result = run(&FilesApplier, &registry(MANIFEST), &host_record("h1"), &fake, false).await;

        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("file:~/.agent/SOUL.md"));
        assert_eq!(fake.file_string("~/.agent/SOUL.md").unwrap(), "# Soul\nno sections\n");
    }

    #[tokio::test]
    async fn test_executable_bit_drift_rewrites() {
        let reg = registry(MANIFEST);
        let fake = drifted_host();
        run(&FilesApplier, &reg, &host_record("h1"), &fake, false).await;

        fake.set_executable("~/.agent/bin/check.sh", false);
        let result = run(&FilesApplier, &reg, &host_record("h1"), &fake, false).await;
        assert_eq!(result.fixed, vec!["file:~/.agent/bin/check.sh"]);
    }

    #[tokio::test]
    async fn test_later_entry_sees_earlier_write() {
        let text = r###"
version = 1

[[files]]
remote_path = "~/notes.md"
mode = "create_if_missing"
content = "# Notes\n## END\n"

[[files]]
remote_path = "~/notes.md"
mode = "insert_before_marker"
marker = "## END"
content = "## Fleet\n"
"###;
        let reg = registry(text);
        let host = host_record("h1");

        let preview = run(&FilesApplier, &reg, &host, &FakeHost::new(), true).await;
        let fake = FakeHost::new();
        let live = run(&FilesApplier, &reg, &host, &fake, false).await;

        let simulated: Vec<_> = preview.fixed.iter().map(|f| f.trim_start_matches("[dry-run] ")).collect();
        assert_eq!(simulated, live.fixed);
        assert_eq!(live.fixed.len(), 2);
        assert_eq!(fake.file_string("~/notes.md").unwrap(), "# Notes\n## Fleet\n## END\n");
    }

    #[tokio::test]
    async fn test_large_content_uses_bulk_transfer() {
        let big = "x".repeat(50 * 1024);
        let manifest = crate::manifest::Manifest::from_toml_str(
            r#"
version = 1

[[files]]
remote_path = "/opt/agent/big.txt"
mode = "overwrite"
template = "big"
"#,
        )
        .unwrap();
        let mut reg = ManifestRegistry::new(manifest);
        reg.register("big", big.clone());
        reg.validate().unwrap();

        let fake = FakeHost::new();
        let result = run(&FilesApplier, &reg, &host_record("h1"), &fake, false).await;

        assert_eq!(result.fixed, vec!["file:/opt/agent/big.txt"]);
        assert_eq!(fake.counters().transfers, 1);
        assert_eq!(fake.file("/opt/agent/big.txt").unwrap(), big.as_bytes());
        // staged copy consumed
        assert!(!fake.paths().iter().any(|p| p.starts_with("/tmp/fleet-stage-")));
    }
}
