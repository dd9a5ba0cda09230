//! Declarative desired state for every host in the fleet.
//!
//! A manifest is authored once per release and never mutated in place: any
//! change is a new `version`. Hosts record the last version successfully
//! applied to them.

pub mod registry;
pub mod template;

pub use registry::ManifestRegistry;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Increases on every change.
    pub version: i64,

    #[serde(default)]
    pub service: ServiceSpec,

    /// Archive taken before the first mutation of a pass.
    #[serde(default)]
    pub backup: Option<BackupSpec>,

    /// Flat key/value pairs applied through the service's config CLI.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,

    #[serde(default)]
    pub files: FileSequence,

    /// First-run bootstrap files that must not survive on a provisioned host.
    #[serde(default)]
    pub bootstrap_guards: Vec<String>,

    /// Directory holding one sub-directory per installed bundle.
    #[serde(default)]
    pub bundle_root: Option<String>,

    #[serde(default)]
    pub extra_reference_files: Vec<ReferenceFile>,

    #[serde(default)]
    pub scheduled_jobs: Vec<ScheduledJob>,

    #[serde(default)]
    pub system_packages: Vec<PackageSpec>,

    #[serde(default)]
    pub interpreter_packages: Vec<PackageSpec>,

    /// Names only; values come from each host record.
    #[serde(default)]
    pub required_environment_vars: Vec<String>,

    #[serde(default)]
    pub auth: Option<AuthSpec>,

    /// `[Service]` directives patched into the managed unit.
    #[serde(default)]
    pub service_unit_overrides: BTreeMap<String, String>,

    #[serde(default)]
    pub templates: Vec<TemplateSource>,

    /// Every file below this directory is registered as a template keyed by
    /// its relative path.
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,

    #[serde(default)]
    pub canary: CanarySpec,
}

impl Manifest {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitScope {
    System,
    User,
}

/// The host-managed service the manifest configures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default = "default_unit")]
    pub unit: String,

    #[serde(default = "default_scope")]
    pub scope: UnitScope,

    /// Health endpoint as seen from the host itself.
    #[serde(default = "default_health_url")]
    pub health_url: String,

    /// Program plus leading arguments; `get <key>` / `set <key> <value>` are appended.
    #[serde(default = "default_config_cli")]
    pub config_cli: Vec<String>,

    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Package name is appended.
    #[serde(default = "default_system_installer")]
    pub system_installer: Vec<String>,

    #[serde(default = "default_interpreter_installer")]
    pub interpreter_installer: Vec<String>,

    /// `NAME=value` file read by the unit's `EnvironmentFile=`.
    #[serde(default = "default_env_file")]
    pub env_file: String,
}

fn default_unit() -> String {
    "agent".to_string()
}

fn default_scope() -> UnitScope {
    UnitScope::System
}

fn default_health_url() -> String {
    "http://127.0.0.1:8080/health".to_string()
}

fn default_config_cli() -> Vec<String> {
    vec!["agent-cli".to_string(), "config".to_string()]
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_system_installer() -> Vec<String> {
    ["apt-get", "install", "-y", "-q"].iter().map(|s| s.to_string()).collect()
}

fn default_interpreter_installer() -> Vec<String> {
    ["python3", "-m", "pip", "install", "--quiet"].iter().map(|s| s.to_string()).collect()
}

fn default_env_file() -> String {
    "~/.config/fleet/env".to_string()
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            unit: default_unit(),
            scope: default_scope(),
            health_url: default_health_url(),
            config_cli: default_config_cli(),
            interpreter: default_interpreter(),
            system_installer: default_system_installer(),
            interpreter_installer: default_interpreter_installer(),
            env_file: default_env_file(),
        }
    }
}

impl ServiceSpec {
    /// Unit name with the `.service` suffix.
    pub fn unit_name(&self) -> String {
        if self.unit.ends_with(".service") {
            self.unit.clone()
        } else {
            format!("{}.service", self.unit)
        }
    }

    pub fn override_path(&self) -> String {
        let dir = match self.scope {
            UnitScope::System => "/etc/systemd/system",
            UnitScope::User => "~/.config/systemd/user",
        };
        format!("{dir}/{}.d/fleet-overrides.conf", self.unit_name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSpec {
    pub paths: Vec<String>,
    #[serde(default = "default_backup_dir")]
    pub dest_dir: String,
    #[serde(default = "default_backup_keep")]
    pub keep: usize,
}

fn default_backup_dir() -> String {
    "~/.fleet-backups".to_string()
}

fn default_backup_keep() -> usize {
    5
}

/// Write semantics for one deployed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Overwrite,
    CreateIfMissing,
    AppendIfMarkerAbsent,
    InsertBeforeMarker,
}

impl WriteMode {
    pub fn requires_marker(&self) -> bool {
        matches!(self, WriteMode::AppendIfMarkerAbsent | WriteMode::InsertBeforeMarker)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Overwrite => "overwrite",
            WriteMode::CreateIfMissing => "create_if_missing",
            WriteMode::AppendIfMarkerAbsent => "append_if_marker_absent",
            WriteMode::InsertBeforeMarker => "insert_before_marker",
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub remote_path: String,
    pub mode: WriteMode,

    /// Exactly one of `content`, `template` or `source` supplies the bytes.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    /// Local file, relative to the manifest directory.
    #[serde(default)]
    pub source: Option<PathBuf>,

    /// Presence marker for `append_if_marker_absent`; anchor line for
    /// `insert_before_marker`.
    #[serde(default)]
    pub marker: Option<String>,

    /// Marker carried by the inserted content itself
    /// (`insert_before_marker` only). Defaults to its first non-empty line.
    #[serde(default)]
    pub guard: Option<String>,

    #[serde(default)]
    pub executable: bool,

    /// Always use the bulk transfer primitive, whatever the size.
    #[serde(default)]
    pub bulk_transfer: bool,
}

/// Where a file entry's bytes come from.
#[derive(Debug, Clone, Copy)]
pub enum ContentRef<'a> {
    Inline(&'a str),
    Template(&'a str),
    Local(&'a std::path::Path),
}

impl FileEntry {
    pub fn content_ref(&self) -> Option<ContentRef<'_>> {
        match (&self.content, &self.template, &self.source) {
            (Some(c), None, None) => Some(ContentRef::Inline(c)),
            (None, Some(t), None) => Some(ContentRef::Template(t)),
            (None, None, Some(p)) => Some(ContentRef::Local(p)),
            _ => None,
        }
    }

    /// Marker proving an insertion already happened.
    pub fn insert_guard(&self, content: &[u8]) -> Option<String> {
        if let Some(guard) = &self.guard {
            return Some(guard.clone());
        }
        String::from_utf8_lossy(content)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }
}

/// File entries in declaration order.
///
/// Entries are applied in this order, and an entry may assume directories
/// and files created by earlier entries exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileSequence(Vec<FileEntry>);

impl FileSequence {
    pub fn new(entries: Vec<FileEntry>) -> Self {
        Self(entries)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn find(&self, remote_path: &str) -> Option<&FileEntry> {
        self.0.iter().find(|e| e.remote_path == remote_path)
    }
}

impl<'a> IntoIterator for &'a FileSequence {
    type Item = &'a FileEntry;
    type IntoIter = std::slice::Iter<'a, FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Auxiliary file colocated with a named bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceFile {
    pub bundle: String,
    pub local_path: PathBuf,
    /// Relative to the bundle directory.
    pub remote_path: String,
}

impl ReferenceFile {
    pub fn bundle_dir(&self, root: &str) -> String {
        format!("{}/{}", root.trim_end_matches('/'), self.bundle)
    }

    pub fn target(&self, root: &str) -> String {
        format!("{}/{}", self.bundle_dir(root), self.remote_path.trim_start_matches('/'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub schedule: String,
    pub command: String,
    /// Unique substring identifying this job's crontab line.
    pub marker: String,
}

impl ScheduledJob {
    pub fn crontab_line(&self) -> String {
        if self.command.contains(&self.marker) {
            format!("{} {}", self.schedule, self.command)
        } else {
            format!("{} {} # {}", self.schedule, self.command, self.marker)
        }
    }
}

/// A package name, optionally with the binary or module it provides when
/// that differs from the package name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PackageSpec {
    Name(String),
    Detailed { name: String, provides: String },
}

impl PackageSpec {
    pub fn name(&self) -> &str {
        match self {
            PackageSpec::Name(n) => n,
            PackageSpec::Detailed { name, .. } => name,
        }
    }

    pub fn provides(&self) -> &str {
        match self {
            PackageSpec::Name(n) => n,
            PackageSpec::Detailed { provides, .. } => provides,
        }
    }
}

/// Credential file layout and the platform's routing expectations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSpec {
    pub path: String,
    #[serde(default = "default_profile")]
    pub profile: String,
    pub proxy_endpoint: String,
    #[serde(default = "default_endpoint_field")]
    pub endpoint_field: String,
    #[serde(default = "default_key_field")]
    pub key_field: String,
}

fn default_profile() -> String {
    "default".to_string()
}

fn default_endpoint_field() -> String {
    "base_url".to_string()
}

fn default_key_field() -> String {
    "api_key".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSource {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub content: Option<String>,
    /// Substituted for `{{ key }}` placeholders at registration time.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanarySpec {
    /// Remote paths whose content is re-read after the canary pass. Empty
    /// means every `overwrite` entry.
    #[serde(default)]
    pub spot_check: Vec<String>,
}
