//! Holds the manifest together with the content its entries refer to.
//!
//! Everything is loaded and validated before the first host is touched; a
//! registry that passed [`ManifestRegistry::validate`] never fails a lookup
//! during a pass. It is read-only afterwards and shared across workers.

use super::template;
use super::{ContentRef, FileEntry, Manifest, ReferenceFile, WriteMode};
use crate::utils::errors::ConfigError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug)]
pub struct ManifestRegistry {
    manifest: Manifest,
    base_dir: PathBuf,
    templates: HashMap<String, Vec<u8>>,
    local_files: HashMap<PathBuf, Vec<u8>>,
}

impl ManifestRegistry {
    /// Registry with no templates registered yet. Relative local paths
    /// resolve against the working directory.
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            base_dir: PathBuf::from("."),
            templates: HashMap::new(),
            local_files: HashMap::new(),
        }
    }

    /// Parse, load every referenced template and local file, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = read_to_string(path)?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        Self::from_toml_str(&text, &base_dir)
    }

    pub fn from_toml_str(text: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let manifest = Manifest::from_toml_str(text).map_err(|source| ConfigError::Toml {
            path: base_dir.join("manifest").display().to_string(),
            source,
        })?;
        let mut registry = Self::new(manifest);
        registry.base_dir = base_dir.to_path_buf();
        registry.load_sources()?;
        registry.validate()?;
        Ok(registry)
    }

    fn load_sources(&mut self) -> Result<(), ConfigError> {
        if let Some(dir) = self.manifest.templates_dir.clone() {
            let dir = self.base_dir.join(dir);
            for entry in WalkDir::new(&dir).follow_links(true) {
                let entry = entry.map_err(|e| ConfigError::Io {
                    path: dir.display().to_string(),
                    source: e.into(),
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let key = entry
                    .path()
                    .strip_prefix(&dir)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                let bytes = read(entry.path())?;
                self.register(key, bytes);
            }
        }

        for source in self.manifest.templates.clone() {
            let text = match (&source.content, &source.path) {
                (Some(content), None) => content.clone(),
                (None, Some(path)) => read_to_string(&self.base_dir.join(path))?,
                _ => {
                    return Err(ConfigError::InvalidManifest(format!(
                        "template {} needs exactly one of content or path",
                        source.name
                    )))
                }
            };
            self.register_with_params(&source.name, &text, &source.params)?;
        }

        let mut locals: Vec<PathBuf> = self
            .manifest
            .files
            .iter()
            .filter_map(|e| e.source.clone())
            .collect();
        locals.extend(self.manifest.extra_reference_files.iter().map(|r| r.local_path.clone()));
        for path in locals {
            if !self.local_files.contains_key(&path) {
                let bytes = read(&self.base_dir.join(&path))?;
                self.local_files.insert(path, bytes);
            }
        }

        Ok(())
    }

    /// Register (or replace) a template.
    pub fn register(&mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.templates.insert(name.into(), content.into());
    }

    /// Register a template after substituting `{{ key }}` placeholders.
    pub fn register_with_params(
        &mut self,
        name: &str,
        text: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        let rendered = template::render(name, text, params)?;
        self.register(name, rendered.into_bytes());
        Ok(())
    }

    pub fn template(&self, name: &str) -> Result<&[u8], ConfigError> {
        self.templates
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| ConfigError::UnknownTemplate(name.to_string()))
    }

    /// Desired bytes for a file entry.
    pub fn content_for<'a>(&'a self, entry: &'a FileEntry) -> Result<&'a [u8], ConfigError> {
        match entry.content_ref() {
            Some(ContentRef::Inline(text)) => Ok(text.as_bytes()),
            Some(ContentRef::Template(name)) => self.template(name),
            Some(ContentRef::Local(path)) => self.local(path),
            None => Err(ConfigError::InvalidManifest(format!(
                "file {} needs exactly one of content, template or source",
                entry.remote_path
            ))),
        }
    }

    pub fn reference_content(&self, file: &ReferenceFile) -> Result<&[u8], ConfigError> {
        self.local(&file.local_path)
    }

    fn local(&self, path: &Path) -> Result<&[u8], ConfigError> {
        self.local_files.get(path).map(Vec::as_slice).ok_or_else(|| {
            ConfigError::InvalidManifest(format!("local file {} was not loaded", path.display()))
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn version(&self) -> i64 {
        self.manifest.version
    }

    /// Check every structural invariant the appliers rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.manifest;
        let invalid = |msg: String| Err(ConfigError::InvalidManifest(msg));

        if m.version < 0 {
            return invalid(format!("version must not be negative (got {})", m.version));
        }
        if m.service.config_cli.is_empty()
            || m.service.system_installer.is_empty()
            || m.service.interpreter_installer.is_empty()
        {
            return invalid("service commands must not be empty".into());
        }

        for entry in &m.files {
            if entry.remote_path.trim().is_empty() {
                return invalid("file entry with empty remote_path".into());
            }
            let content = self.content_for(entry)?;

            if entry.mode.requires_marker() {
                let marker = entry.marker.as_deref().filter(|m| !m.is_empty()).ok_or_else(|| {
                    ConfigError::MissingMarker {
                        path: entry.remote_path.clone(),
                        mode: entry.mode.to_string(),
                    }
                })?;
                if marker.contains('\n') {
                    return invalid(format!("marker for {} spans lines", entry.remote_path));
                }
            }
            if entry.mode == WriteMode::InsertBeforeMarker {
                match entry.insert_guard(content) {
                    Some(guard) if !guard.contains('\n') => {}
                    _ => {
                        return invalid(format!(
                            "insert for {} has no single-line guard",
                            entry.remote_path
                        ))
                    }
                }
            }
        }

        if !m.extra_reference_files.is_empty() && m.bundle_root.is_none() {
            return invalid("extra_reference_files require bundle_root".into());
        }
        for file in &m.extra_reference_files {
            self.reference_content(file)?;
        }

        let mut markers = HashSet::new();
        for job in &m.scheduled_jobs {
            if job.marker.trim().is_empty() || job.marker.contains('\n') {
                return invalid(format!("scheduled job '{}' has an invalid marker", job.command));
            }
            if !markers.insert(job.marker.as_str()) {
                return invalid(format!("duplicate scheduled job marker {}", job.marker));
            }
        }

        for name in &m.required_environment_vars {
            if !is_env_name(name) {
                return invalid(format!("invalid environment variable name {name}"));
            }
        }

        for (directive, value) in &m.service_unit_overrides {
            if directive.is_empty() || directive.contains(['=', '\n']) || value.contains('\n') {
                return invalid(format!("invalid unit override {directive}"));
            }
        }

        if let Some(backup) = &m.backup {
            if backup.keep == 0 || backup.paths.is_empty() {
                return invalid("backup needs at least one path and keep >= 1".into());
            }
        }

        if let Some(auth) = &m.auth {
            if auth.path.is_empty() || auth.proxy_endpoint.is_empty() {
                return invalid("auth needs path and proxy_endpoint".into());
            }
        }

        Ok(())
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn read(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn read_to_string(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demos_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../demos")
    }

    #[test]
    fn test_load_demo_manifest() {
        let registry = ManifestRegistry::load(&demos_dir().join("manifest.toml")).unwrap();
        assert_eq!(registry.version(), 7);

        let tools = registry.manifest().files.find("~/.agent/workspace/TOOLS.md").unwrap();
        assert!(registry.content_for(tools).unwrap().starts_with(b"# Tools"));

        // Parameterized template rendered at registration time
        let user = registry.template("user.md").unwrap();
        assert!(String::from_utf8_lossy(user).contains("Preferred name: (not set)"));

        let reference = &registry.manifest().extra_reference_files[0];
        assert!(registry.reference_content(reference).unwrap().starts_with(b"# Selector"));
    }

    #[test]
    fn test_marker_mode_without_marker_fails_fast() {
        let text = r#"
version = 1

[[files]]
remote_path = "~/notes.md"
mode = "append_if_marker_absent"
content = "extra"
"#;
        let err = ManifestRegistry::from_toml_str(text, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingMarker { ref path, .. } if path == "~/notes.md"));
    }

    #[test]
    fn test_unknown_template_fails_validation() {
        let text = r#"
version = 1

[[files]]
remote_path = "~/a.md"
mode = "overwrite"
template = "missing.md"
"#;
        let err = ManifestRegistry::from_toml_str(text, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTemplate(ref n) if n == "missing.md"));
    }

    #[test]
    fn test_register_before_validate() {
        let manifest = Manifest::from_toml_str(
            r#"
version = 2

[[files]]
remote_path = "~/gateway.json"
mode = "overwrite"
template = "gateway.json"
"#,
        )
        .unwrap();
        let mut registry = ManifestRegistry::new(manifest);
        assert!(registry.validate().is_err());

        let params = [("port".to_string(), "18789".to_string())].into_iter().collect();
        registry
            .register_with_params("gateway.json", r#"{"port": {{ port }}}"#, &params)
            .unwrap();
        registry.validate().unwrap();
        assert_eq!(registry.template("gateway.json").unwrap(), br#"{"port": 18789}"#);
    }

    #[test]
    fn test_placeholder_without_params_fails_fast() {
        let text = r#"
version = 1

[[templates]]
name = "motd"
content = "Welcome to {{ hostname }}"
"#;
        let err = ManifestRegistry::from_toml_str(text, Path::new(".")).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnresolvedPlaceholder { ref template, ref placeholder }
                if template == "motd" && placeholder == "hostname"
        ));
    }

    #[test]
    fn test_duplicate_cron_markers_rejected() {
        let text = r#"
version = 1

[[scheduled_jobs]]
schedule = "@daily"
command = "a"
marker = "m"

[[scheduled_jobs]]
schedule = "@hourly"
command = "b"
marker = "m"
"#;
        let err = ManifestRegistry::from_toml_str(text, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_env_names() {
        assert!(is_env_name("AGENT_TOKEN"));
        assert!(is_env_name("_X1"));
        assert!(!is_env_name("1X"));
        assert!(!is_env_name("A-B"));
        assert!(!is_env_name(""));
    }
}
