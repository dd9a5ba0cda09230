//! Remote command execution against one host.
//!
//! A pass opens exactly one [`Session`] per host and every applier reuses
//! it; the pipeline closes it when the pass ends.

pub mod command;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod ssh;

pub use command::{
    Action, CommandOutput, Payload, Probe, ProbeValue, QueryOutput, RemoteCommand, RemotePath,
    SystemdScope,
};
pub use ssh::{KeyDirResolver, SshConnector};

use crate::models::HostRecord;
use crate::utils::errors::SessionError;
use async_trait::async_trait;
use std::path::PathBuf;

/// An open, authenticated channel to one host.
#[async_trait]
pub trait Session: Send + Sync {
    /// Run one command. A non-zero exit is reported in the output, not as
    /// an error; errors mean the command could not be run at all.
    async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, SessionError>;

    /// Upload `content` to `remote_path` through the bulk primitive.
    async fn transfer_file(&self, content: &[u8], remote_path: &RemotePath) -> Result<(), SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// Opens sessions. A failure here is fatal for that host's whole pass.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, host: &HostRecord) -> Result<Box<dyn Session>, SessionError>;
}

/// Maps a host's opaque credential reference to transport credentials.
pub trait CredentialResolver: Send + Sync {
    fn private_key(&self, credential_ref: &str) -> Result<PathBuf, SessionError>;
}
