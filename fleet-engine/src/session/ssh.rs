use super::command::{CommandOutput, RemoteCommand, RemotePath};
use super::{Connector, CredentialResolver, Session};
use crate::config::SshConfig;
use crate::models::HostRecord;
use crate::utils::errors::SessionError;
use async_trait::async_trait;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Resolves a credential reference to `<keys_dir>/<credential_ref>`.
pub struct KeyDirResolver {
    keys_dir: PathBuf,
}

impl KeyDirResolver {
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self { keys_dir: keys_dir.into() }
    }
}

impl CredentialResolver for KeyDirResolver {
    fn private_key(&self, credential_ref: &str) -> Result<PathBuf, SessionError> {
        if credential_ref.is_empty()
            || credential_ref.contains('/')
            || credential_ref.contains('\\')
            || credential_ref.starts_with('.')
        {
            return Err(SessionError::Credential(credential_ref.to_string()));
        }
        let path = self.keys_dir.join(credential_ref);
        if !path.is_file() {
            return Err(SessionError::Credential(credential_ref.to_string()));
        }
        Ok(path)
    }
}

pub struct SshConnector {
    resolver: Arc<dyn CredentialResolver>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshConnector {
    pub fn new(resolver: Arc<dyn CredentialResolver>, config: &SshConfig) -> Self {
        Self {
            resolver,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(&self, host: &HostRecord) -> Result<Box<dyn Session>, SessionError> {
        let key = self.resolver.private_key(&host.credential_ref)?;
        let target = host.clone();
        let (connect_timeout, command_timeout) = (self.connect_timeout, self.command_timeout);

        // ssh2 is blocking; keep it off the runtime threads
        let session = tokio::task::spawn_blocking(move || {
            connect(&target, &key, connect_timeout, command_timeout)
        })
        .await
        .map_err(|e| SessionError::Connect {
            host: host.id.clone(),
            reason: e.to_string(),
        })??;

        tracing::debug!(host = %host.id, address = %host.address, "SSH session opened");
        Ok(Box::new(SshSession {
            host_id: host.id.clone(),
            inner: Arc::new(session),
        }))
    }
}

fn timeout_ms(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

fn connect(
    host: &HostRecord,
    key: &Path,
    connect_timeout: Duration,
    command_timeout: Duration,
) -> Result<ssh2::Session, SessionError> {
    let connect_err = |reason: String| SessionError::Connect {
        host: host.id.clone(),
        reason,
    };

    let port = u16::try_from(host.port).map_err(|_| connect_err(format!("invalid port {}", host.port)))?;
    let addr = (host.address.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| connect_err(e.to_string()))?
        .next()
        .ok_or_else(|| connect_err(format!("{} did not resolve", host.address)))?;

    let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| connect_err(e.to_string()))?;

    let mut sess = ssh2::Session::new().map_err(|e| connect_err(e.to_string()))?;
    sess.set_tcp_stream(tcp);
    sess.set_timeout(timeout_ms(connect_timeout));
    sess.handshake().map_err(|e| connect_err(e.to_string()))?;

    sess.userauth_pubkey_file(&host.ssh_user, None, key, None)
        .map_err(|e| SessionError::Authentication {
            host: host.id.clone(),
            reason: e.to_string(),
        })?;
    if !sess.authenticated() {
        return Err(SessionError::Authentication {
            host: host.id.clone(),
            reason: "server rejected key".into(),
        });
    }

    sess.set_timeout(timeout_ms(command_timeout));
    Ok(sess)
}

pub struct SshSession {
    host_id: String,
    inner: Arc<ssh2::Session>,
}

fn exec(sess: &ssh2::Session, cmd: &str) -> Result<CommandOutput, SessionError> {
    let mut channel = sess.channel_session()?;
    channel.exec(cmd)?;

    // Both streams share the channel window; reading them in turn keeps a
    // chatty stderr from stalling stdout.
    sess.set_blocking(false);
    let drained = drain(sess, &mut channel);
    sess.set_blocking(true);
    let (stdout, stderr) = drained?;

    channel.wait_close()?;
    let exit_code = channel.exit_status()?;
    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Read one chunk into `out`. Returns whether any bytes arrived.
fn read_some(stream: &mut impl Read, buf: &mut [u8], out: &mut Vec<u8>) -> Result<bool, SessionError> {
    match stream.read(buf) {
        Ok(n) => {
            out.extend_from_slice(&buf[..n]);
            Ok(n > 0)
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn drain(sess: &ssh2::Session, channel: &mut ssh2::Channel) -> Result<(Vec<u8>, Vec<u8>), SessionError> {
    let deadline = match sess.timeout() {
        0 => None,
        ms => Some(Instant::now() + Duration::from_millis(u64::from(ms))),
    };
    let mut buf = [0u8; 16 * 1024];
    let (mut stdout, mut stderr) = (Vec::new(), Vec::new());

    loop {
        let got_out = read_some(channel, &mut buf, &mut stdout)?;
        let got_err = read_some(&mut channel.stderr(), &mut buf, &mut stderr)?;
        if got_out || got_err {
            continue;
        }
        if channel.eof() {
            return Ok((stdout, stderr));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(SessionError::Command("timed out waiting for remote output".into()));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[async_trait]
impl Session for SshSession {
    async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, SessionError> {
        let sess = self.inner.clone();
        let cmd = command.render();
        let output = tokio::task::spawn_blocking(move || exec(&sess, &cmd))
            .await
            .map_err(|e| SessionError::Command(e.to_string()))??;

        if !output.success() {
            tracing::debug!(
                host = %self.host_id,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "Remote command exited non-zero"
            );
        }
        Ok(output)
    }

    async fn transfer_file(&self, content: &[u8], remote_path: &RemotePath) -> Result<(), SessionError> {
        let sess = self.inner.clone();
        let bytes = content.len();
        let content = content.to_vec();
        let path = remote_path.clone();
        let transfer_err = |reason: String| SessionError::Transfer {
            path: remote_path.to_string(),
            reason,
        };

        tokio::task::spawn_blocking(move || -> Result<(), SessionError> {
            let sftp = sess.sftp()?;
            let mut file = sftp.create(Path::new(path.sftp_path()))?;
            file.write_all(&content)?;
            Ok(())
        })
        .await
        .map_err(|e| transfer_err(e.to_string()))?
        .map_err(|e| transfer_err(e.to_string()))?;

        tracing::debug!(host = %self.host_id, path = %remote_path, bytes, "Bulk transfer complete");
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        let sess = self.inner.clone();
        tokio::task::spawn_blocking(move || sess.disconnect(None, "reconcile pass complete", None))
            .await
            .map_err(|e| SessionError::Command(e.to_string()))??;
        Ok(())
    }
}
