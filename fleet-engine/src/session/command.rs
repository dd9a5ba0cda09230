//! Typed remote commands.
//!
//! Appliers never concatenate shell text. They describe read-only
//! [`Probe`]s and mutating [`Action`]s; a [`RemoteCommand`] batches any
//! number of either into a single `sh -c` invocation, so each resource kind
//! costs one round trip to query and one to apply. Every interpolated value
//! goes through [`quote`] or [`RemotePath::render`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use shell_escape::unix::escape;
use std::borrow::Cow;
use std::fmt;

/// Quote a value as a single shell word.
pub fn quote(value: &str) -> String {
    escape(Cow::Borrowed(value)).into_owned()
}

fn quote_argv(argv: &[String]) -> String {
    argv.iter().map(|a| quote(a)).collect::<Vec<_>>().join(" ")
}

/// A path on the remote host. `~/`-relative paths are resolved against the
/// session user's `$HOME` at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sibling path with `suffix` appended to the file name.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self(format!("{}{}", self.0, suffix))
    }

    /// Path relative to the login directory, as SFTP expects for `~/` paths.
    pub fn sftp_path(&self) -> &str {
        if self.0 == "~" {
            "."
        } else {
            self.0.strip_prefix("~/").unwrap_or(&self.0)
        }
    }

    /// Shell word for this path.
    pub fn render(&self) -> String {
        if self.0 == "~" {
            "\"$HOME\"".to_string()
        } else if let Some(rest) = self.0.strip_prefix("~/") {
            format!("\"$HOME\"/{}", quote(rest))
        } else {
            quote(&self.0)
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemotePath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RemotePath {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A read-only check. Each probe prints exactly one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// `yes` / `no`
    Exists(RemotePath),
    /// sha256 hex of a regular file, or `absent`
    Digest(RemotePath),
    /// `yes` / `no`
    Executable(RemotePath),
    /// Fixed-string search: `yes` / `no` / `absent`
    Contains { path: RemotePath, needle: String },
    /// `present <base64>` / `absent`
    Read(RemotePath),
    /// Program on `PATH`: `yes` / `no`
    Which(String),
    /// `yes` / `no`
    Importable { interpreter: String, module: String },
    /// `present <base64>` / `absent`
    Setting { cli: Vec<String>, key: String },
    /// `present <base64>` (empty when no crontab is installed)
    Crontab,
    /// `yes` / `no`
    HttpOk { url: String },
}

impl Probe {
    fn render(&self) -> String {
        match self {
            Probe::Exists(p) => {
                format!("if [ -e {p} ]; then echo yes; else echo no; fi", p = p.render())
            }
            Probe::Digest(p) => format!(
                "if [ -f {p} ]; then sha256sum < {p} | cut -d' ' -f1; else echo absent; fi",
                p = p.render()
            ),
            Probe::Executable(p) => {
                format!("if [ -x {p} ]; then echo yes; else echo no; fi", p = p.render())
            }
            Probe::Contains { path, needle } => format!(
                "if [ ! -f {p} ]; then echo absent; elif grep -qF -e {n} {p}; then echo yes; else echo no; fi",
                p = path.render(),
                n = quote(needle)
            ),
            Probe::Read(p) => format!(
                "if [ -f {p} ]; then printf 'present '; base64 -w0 < {p}; echo; else echo absent; fi",
                p = p.render()
            ),
            Probe::Which(program) => format!(
                "if command -v {} >/dev/null 2>&1; then echo yes; else echo no; fi",
                quote(program)
            ),
            Probe::Importable { interpreter, module } => format!(
                "if {} -c {} >/dev/null 2>&1; then echo yes; else echo no; fi",
                quote(interpreter),
                quote(&format!("import {module}"))
            ),
            Probe::Setting { cli, key } => format!(
                "if v=$({} get {} 2>/dev/null); then printf 'present '; printf '%s' \"$v\" | base64 -w0; echo; else echo absent; fi",
                quote_argv(cli),
                quote(key)
            ),
            Probe::Crontab => "printf 'present '; crontab -l 2>/dev/null | base64 -w0; echo".to_string(),
            Probe::HttpOk { url } => format!(
                "if curl -fsS -o /dev/null --max-time 5 {}; then echo yes; else echo no; fi",
                quote(url)
            ),
        }
    }
}

/// Bytes to place on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Base64-encoded into the command itself.
    Inline(Vec<u8>),
    /// Already uploaded to this temporary path by the bulk primitive; the
    /// action consumes (removes) it.
    Staged(RemotePath),
}

impl Payload {
    /// Shell pipeline stage that writes the payload bytes to stdout.
    fn source(&self) -> String {
        match self {
            Payload::Inline(bytes) => format!("printf '%s' {} | base64 -d", quote(&BASE64.encode(bytes))),
            Payload::Staged(path) => format!("cat {}", path.render()),
        }
    }

    fn cleanup(&self) -> Option<String> {
        match self {
            Payload::Inline(_) => None,
            Payload::Staged(path) => Some(format!("rm -f {}", path.render())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemdScope {
    System,
    User,
}

impl SystemdScope {
    fn systemctl(&self) -> &'static str {
        match self {
            SystemdScope::System => "systemctl",
            SystemdScope::User => "systemctl --user",
        }
    }
}

/// A mutation. Actions in one command run in order and stop at the first
/// failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    MakeDir(RemotePath),
    /// Replace the whole file (parent directories are created).
    Write {
        path: RemotePath,
        payload: Payload,
        executable: bool,
        /// Owner-only permissions.
        private: bool,
    },
    Append { path: RemotePath, payload: Payload },
    /// Insert the payload before the first line containing `anchor`. Fails
    /// if no line does.
    InsertBefore { path: RemotePath, anchor: String, payload: Payload },
    Move { from: RemotePath, to: RemotePath },
    SetSetting { cli: Vec<String>, key: String, value: String },
    /// Replace the user's crontab.
    InstallCrontab(Vec<u8>),
    /// Install each package separately; a failed package never stops the
    /// others or the script.
    Install { installer: Vec<String>, packages: Vec<String> },
    /// Tarball of `sources` into `dest`, keeping the newest `keep` archives.
    Archive {
        sources: Vec<RemotePath>,
        dest: RemotePath,
        stamp: String,
        keep: usize,
    },
    ReloadUnits(SystemdScope),
    /// Stop then start, falling back to a hard kill.
    RestartService { unit: String, scope: SystemdScope },
}

impl Action {
    pub fn is_install(&self) -> bool {
        matches!(self, Action::Install { .. })
    }

    /// Temporary upload this action consumes, if any.
    pub fn staged_payload(&self) -> Option<&RemotePath> {
        match self {
            Action::Write { payload: Payload::Staged(p), .. }
            | Action::Append { payload: Payload::Staged(p), .. }
            | Action::InsertBefore { payload: Payload::Staged(p), .. } => Some(p),
            _ => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Action::MakeDir(p) => format!("mkdir -p {}", p.render()),
            Action::Write { path, payload, executable, private } => {
                let p = path.render();
                let tmp = path.with_suffix(".fleet-tmp").render();
                let mut lines = vec![
                    format!("mkdir -p \"$(dirname {p})\""),
                    format!("{} > {tmp}", payload.source()),
                ];
                if *private {
                    lines.push(format!("chmod 600 {tmp}"));
                }
                if *executable {
                    lines.push(format!("chmod +x {tmp}"));
                }
                lines.push(format!("mv -f {tmp} {p}"));
                lines.extend(payload.cleanup());
                lines.join("\n")
            }
            Action::Append { path, payload } => {
                let p = path.render();
                let mut lines = vec![
                    format!("mkdir -p \"$(dirname {p})\""),
                    format!("{} >> {p}", payload.source()),
                ];
                lines.extend(payload.cleanup());
                lines.join("\n")
            }
            Action::InsertBefore { path, anchor, payload } => {
                let p = path.render();
                let tmp = path.with_suffix(".fleet-tmp").render();
                let a = quote(anchor);
                let mut lines = vec![
                    format!("grep -qF -e {a} {p} || {{ echo 'anchor not found' >&2; exit 3; }}"),
                    "fleet_ins=$(mktemp)".to_string(),
                    format!("{} > \"$fleet_ins\"", payload.source()),
                    // awk expands escapes in -v assignments; ENVIRON values stay literal
                    format!(
                        "fleet_anchor={a} fleet_ins=\"$fleet_ins\" awk 'BEGIN {{ anchor = ENVIRON[\"fleet_anchor\"]; ins = ENVIRON[\"fleet_ins\"] }} !done && index($0, anchor) {{ while ((getline l < ins) > 0) print l; close(ins); done = 1 }} {{ print }}' {p} > {tmp}"
                    ),
                    // cat keeps the original file's mode and owner
                    format!("cat {tmp} > {p}"),
                    format!("rm -f {tmp} \"$fleet_ins\""),
                ];
                lines.extend(payload.cleanup());
                lines.join("\n")
            }
            Action::Move { from, to } => format!("mv -f {} {}", from.render(), to.render()),
            Action::SetSetting { cli, key, value } => {
                format!("{} set {} {}", quote_argv(cli), quote(key), quote(value))
            }
            Action::InstallCrontab(content) => format!(
                "printf '%s' {} | base64 -d | crontab -",
                quote(&BASE64.encode(content))
            ),
            Action::Install { installer, packages } => format!(
                "for fleet_pkg in {}; do {} \"$fleet_pkg\" >/dev/null 2>&1 || echo \"install failed: $fleet_pkg\" >&2; done",
                quote_argv(packages),
                quote_argv(installer)
            ),
            Action::Archive { sources, dest, stamp, keep } => {
                let d = dest.render();
                let archive = RemotePath::new(format!("{}/fleet-backup-{stamp}.tar.gz", dest.as_str())).render();
                let srcs = sources.iter().map(RemotePath::render).collect::<Vec<_>>().join(" ");
                [
                    format!("mkdir -p {d}"),
                    format!("tar -czf {archive} --ignore-failed-read {srcs} 2>/dev/null || [ -s {archive} ]"),
                    format!(
                        "ls -1t {d}/fleet-backup-*.tar.gz 2>/dev/null | tail -n +{} | while read -r f; do rm -f \"$f\"; done",
                        keep + 1
                    ),
                ]
                .join("\n")
            }
            Action::ReloadUnits(scope) => format!("{} daemon-reload", scope.systemctl()),
            Action::RestartService { unit, scope } => {
                let ctl = scope.systemctl();
                let u = quote(unit);
                format!(
                    "{{ {ctl} stop {u} && {ctl} start {u}; }} || {{ {ctl} kill -s KILL {u} || true; {ctl} start {u}; }}"
                )
            }
        }
    }
}

/// One remote invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    Query(Vec<Probe>),
    Apply(Vec<Action>),
}

impl RemoteCommand {
    pub fn is_mutating(&self) -> bool {
        matches!(self, RemoteCommand::Apply(_))
    }

    /// The script body, before wrapping in `sh -c`.
    pub fn script(&self) -> String {
        match self {
            RemoteCommand::Query(probes) => probes
                .iter()
                .enumerate()
                .map(|(i, p)| format!("printf 'p{i} '; {}", p.render()))
                .collect::<Vec<_>>()
                .join("\n"),
            RemoteCommand::Apply(actions) => {
                let mut lines = vec!["set -e".to_string()];
                let staged: Vec<String> =
                    actions.iter().filter_map(Action::staged_payload).map(RemotePath::render).collect();
                let inserts = actions.iter().any(|a| matches!(a, Action::InsertBefore { .. }));
                if !staged.is_empty() || inserts {
                    // uploads and scratch files go away even when an earlier step fails
                    let mut targets = staged;
                    targets.push("${fleet_ins:+\"$fleet_ins\"}".to_string());
                    lines.push(format!("fleet_cleanup() {{ rm -f {}; }}", targets.join(" ")));
                    lines.push("trap fleet_cleanup EXIT".to_string());
                }
                lines.extend(actions.iter().map(Action::render));
                lines.join("\n")
            }
        }
    }

    /// Full command line as sent over the channel.
    pub fn render(&self) -> String {
        format!("sh -c {}", quote(&self.script()))
    }
}

/// Result of running one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Answer to a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeValue {
    Yes,
    No,
    Absent,
    Content(Vec<u8>),
    Digest(String),
}

impl ProbeValue {
    pub fn is_yes(&self) -> bool {
        matches!(self, ProbeValue::Yes)
    }

    /// Content for `Read`/`Setting`/`Crontab` probes; `None` when absent.
    pub fn into_content(self) -> Option<Vec<u8>> {
        match self {
            ProbeValue::Content(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Digest for `Digest` probes; `None` when absent.
    pub fn digest(&self) -> Option<&str> {
        match self {
            ProbeValue::Digest(d) => Some(d),
            _ => None,
        }
    }

    /// The single line a real host prints for this value.
    pub fn to_line(&self) -> String {
        match self {
            ProbeValue::Yes => "yes".to_string(),
            ProbeValue::No => "no".to_string(),
            ProbeValue::Absent => "absent".to_string(),
            ProbeValue::Content(bytes) => format!("present {}", BASE64.encode(bytes)),
            ProbeValue::Digest(d) => d.clone(),
        }
    }
}

/// Parsed output of a [`RemoteCommand::Query`].
#[derive(Debug, Clone)]
pub struct QueryOutput {
    values: Vec<ProbeValue>,
}

impl QueryOutput {
    /// Parse `p<index> <value>` lines back into one value per probe. Lines
    /// without a probe prefix (stray output from profile scripts) are ignored.
    pub fn parse(probes: &[Probe], stdout: &str) -> Result<Self, String> {
        let mut values: Vec<Option<ProbeValue>> = vec![None; probes.len()];

        for line in stdout.lines() {
            let Some(rest) = line.strip_prefix('p') else { continue };
            let Some((index, raw)) = rest.split_once(' ') else { continue };
            let Ok(index) = index.parse::<usize>() else { continue };
            let Some(probe) = probes.get(index) else { continue };
            values[index] = Some(parse_value(probe, raw.trim_end())?);
        }

        let values = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.ok_or_else(|| format!("no answer for probe {i} ({:?})", probes[i])))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { values })
    }

    pub fn from_values(values: Vec<ProbeValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> &ProbeValue {
        &self.values[index]
    }

    pub fn take(&mut self, index: usize) -> ProbeValue {
        std::mem::replace(&mut self.values[index], ProbeValue::Absent)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn parse_value(probe: &Probe, raw: &str) -> Result<ProbeValue, String> {
    match probe {
        Probe::Read(_) | Probe::Setting { .. } | Probe::Crontab => {
            if raw == "absent" {
                return Ok(ProbeValue::Absent);
            }
            let encoded = raw
                .strip_prefix("present")
                .ok_or_else(|| format!("expected present/absent, got {raw:?}"))?
                .trim();
            BASE64
                .decode(encoded)
                .map(ProbeValue::Content)
                .map_err(|e| format!("bad base64 in probe output: {e}"))
        }
        Probe::Digest(_) => match raw {
            "absent" => Ok(ProbeValue::Absent),
            d if d.len() == 64 && d.chars().all(|c| c.is_ascii_hexdigit()) => {
                Ok(ProbeValue::Digest(d.to_ascii_lowercase()))
            }
            other => Err(format!("expected sha256 digest, got {other:?}")),
        },
        Probe::Contains { .. } => match raw {
            "yes" => Ok(ProbeValue::Yes),
            "no" => Ok(ProbeValue::No),
            "absent" => Ok(ProbeValue::Absent),
            other => Err(format!("expected yes/no/absent, got {other:?}")),
        },
        _ => match raw {
            "yes" => Ok(ProbeValue::Yes),
            "no" => Ok(ProbeValue::No),
            other => Err(format!("expected yes/no, got {other:?}")),
        },
    }
}

/// sha256 hex digest, matching `sha256sum` output.
pub fn digest(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}
