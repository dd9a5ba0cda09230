//! Error types for the reconciliation engine.

use thiserror::Error;

/// Deployment mistakes: a bad manifest, a missing template, an unreadable
/// config file. Always raised before any host is touched.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Template {template} references unresolved placeholder {{{{ {placeholder} }}}}")]
    UnresolvedPlaceholder { template: String, placeholder: String },

    #[error("File entry {path} uses mode {mode} but has no marker")]
    MissingMarker { path: String, mode: String },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
}

/// Failures of the remote command channel.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication to {host} failed: {reason}")]
    Authentication { host: String, reason: String },

    #[error("Credential {0} could not be resolved")]
    Credential(String),

    #[error("Remote command failed to run: {0}")]
    Command(String),

    #[error("Transfer to {path} failed: {reason}")]
    Transfer { path: String, reason: String },

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures scoped to a single applier.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("command exited with status {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("unexpected remote output: {0}")]
    Parse(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
