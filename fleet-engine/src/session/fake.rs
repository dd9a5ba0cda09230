//! In-memory host that interprets [`Probe`]s and [`Action`]s directly.
//!
//! Query output goes through the same `p<i> <value>` lines a real host
//! prints, so appliers exercise the real parser against it.

use super::command::{digest, Action, CommandOutput, Payload, Probe, ProbeValue, RemoteCommand, RemotePath};
use super::{Connector, Session};
use crate::models::HostRecord;
use crate::utils::errors::SessionError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeFile {
    pub content: Vec<u8>,
    pub executable: bool,
    pub private: bool,
}

/// How often each kind of remote operation reached the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub queries: usize,
    pub applies: usize,
    pub transfers: usize,
    pub archives: usize,
    pub reloads: usize,
    pub restarts: usize,
}

#[derive(Debug)]
struct HostState {
    files: BTreeMap<String, FakeFile>,
    dirs: BTreeSet<String>,
    settings: BTreeMap<String, String>,
    crontab: Vec<u8>,
    binaries: BTreeSet<String>,
    modules: BTreeSet<String>,
    /// package name -> binary/module it provides once installed
    installable: BTreeMap<String, String>,
    health: VecDeque<bool>,
    healthy: bool,
    counters: Counters,
    log: Vec<RemoteCommand>,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            settings: BTreeMap::new(),
            crontab: Vec::new(),
            binaries: BTreeSet::new(),
            modules: BTreeSet::new(),
            installable: BTreeMap::new(),
            health: VecDeque::new(),
            healthy: true,
            counters: Counters::default(),
            log: Vec::new(),
        }
    }
}

fn parent(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(dir, _)| dir).filter(|d| !d.is_empty())
}

impl HostState {
    fn exists(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.files.contains_key(path)
            || self.dirs.contains(path)
            || self.files.keys().any(|f| f.starts_with(&prefix))
    }

    fn make_parents(&mut self, path: &str) {
        let mut current = parent(path);
        while let Some(dir) = current {
            self.dirs.insert(dir.to_string());
            current = parent(dir);
        }
    }

    fn probe(&mut self, probe: &Probe) -> ProbeValue {
        let yes_no = |b: bool| if b { ProbeValue::Yes } else { ProbeValue::No };
        match probe {
            Probe::Exists(p) => yes_no(self.exists(p.as_str())),
            Probe::Digest(p) => match self.files.get(p.as_str()) {
                Some(f) => ProbeValue::Digest(digest(&f.content)),
                None => ProbeValue::Absent,
            },
            Probe::Executable(p) => yes_no(self.files.get(p.as_str()).is_some_and(|f| f.executable)),
            Probe::Contains { path, needle } => match self.files.get(path.as_str()) {
                Some(f) => yes_no(contains(&f.content, needle.as_bytes())),
                None => ProbeValue::Absent,
            },
            Probe::Read(p) => match self.files.get(p.as_str()) {
                Some(f) => ProbeValue::Content(f.content.clone()),
                None => ProbeValue::Absent,
            },
            Probe::Which(program) => yes_no(self.binaries.contains(program)),
            Probe::Importable { module, .. } => yes_no(self.modules.contains(module)),
            Probe::Setting { key, .. } => match self.settings.get(key) {
                Some(v) => ProbeValue::Content(v.clone().into_bytes()),
                None => ProbeValue::Absent,
            },
            Probe::Crontab => ProbeValue::Content(self.crontab.clone()),
            Probe::HttpOk { .. } => yes_no(self.health.pop_front().unwrap_or(self.healthy)),
        }
    }

    fn payload(&mut self, payload: &Payload) -> Result<Vec<u8>, String> {
        match payload {
            Payload::Inline(bytes) => Ok(bytes.clone()),
            Payload::Staged(path) => self
                .files
                .remove(path.as_str())
                .map(|f| f.content)
                .ok_or_else(|| format!("cat: {path}: No such file or directory")),
        }
    }

    /// Returns the exit code and stderr of the failing action.
    fn act(&mut self, action: &Action) -> Result<(), (i32, String)> {
        let fail = |msg: String| (1, msg);
        match action {
            Action::MakeDir(p) => {
                self.make_parents(p.as_str());
                self.dirs.insert(p.as_str().to_string());
            }
            Action::Write { path, payload, executable, private } => {
                let content = self.payload(payload).map_err(fail)?;
                self.make_parents(path.as_str());
                self.files.insert(
                    path.as_str().to_string(),
                    FakeFile { content, executable: *executable, private: *private },
                );
            }
            Action::Append { path, payload } => {
                let extra = self.payload(payload).map_err(fail)?;
                self.make_parents(path.as_str());
                self.files
                    .entry(path.as_str().to_string())
                    .or_default()
                    .content
                    .extend_from_slice(&extra);
            }
            Action::InsertBefore { path, anchor, payload } => {
                let Some(file) = self.files.get(path.as_str()) else {
                    return Err((3, "anchor not found".into()));
                };
                let Some(at) = line_start_containing(&file.content, anchor.as_bytes()) else {
                    return Err((3, "anchor not found".into()));
                };
                let mut insert = self.payload(payload).map_err(fail)?;
                if !insert.ends_with(b"\n") {
                    insert.push(b'\n');
                }
                if let Some(file) = self.files.get_mut(path.as_str()) {
                    let tail = file.content.split_off(at);
                    file.content.extend(insert);
                    file.content.extend(tail);
                }
            }
            Action::Move { from, to } => {
                let file = self
                    .files
                    .remove(from.as_str())
                    .ok_or_else(|| fail(format!("mv: cannot stat {from}")))?;
                self.files.insert(to.as_str().to_string(), file);
            }
            Action::SetSetting { key, value, .. } => {
                self.settings.insert(key.clone(), value.clone());
            }
            Action::InstallCrontab(content) => self.crontab = content.clone(),
            Action::Install { packages, .. } => {
                for package in packages {
                    if let Some(provides) = self.installable.get(package).cloned() {
                        self.binaries.insert(provides.clone());
                        self.modules.insert(provides);
                    }
                }
            }
            Action::Archive { dest, stamp, .. } => {
                self.counters.archives += 1;
                let archive = format!("{}/fleet-backup-{stamp}.tar.gz", dest.as_str());
                self.make_parents(&archive);
                self.files.insert(archive, FakeFile::default());
            }
            Action::ReloadUnits(_) => self.counters.reloads += 1,
            Action::RestartService { .. } => self.counters.restarts += 1,
        }
        Ok(())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

fn line_start_containing(content: &[u8], needle: &[u8]) -> Option<usize> {
    let mut start = 0;
    for line in content.split_inclusive(|b| *b == b'\n') {
        if contains(line, needle) {
            return Some(start);
        }
        start += line.len();
    }
    None
}

/// A scripted host. Clones share state, so a test can keep a handle while
/// the connector hands another to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_file(self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.put_file(path, content);
        self
    }

    pub fn put_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        state.make_parents(path);
        state.files.insert(path.to_string(), FakeFile { content: content.into(), ..Default::default() });
    }

    pub fn set_executable(&self, path: &str, executable: bool) {
        if let Some(file) = self.lock().files.get_mut(path) {
            file.executable = executable;
        }
    }

    pub fn remove_file(&self, path: &str) {
        self.lock().files.remove(path);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).map(|f| f.content.clone())
    }

    /// Every file path currently on the host.
    pub fn paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn file_meta(&self, path: &str) -> Option<FakeFile> {
        self.lock().files.get(path).cloned()
    }

    pub fn file_string(&self, path: &str) -> Option<String> {
        self.file(path).map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    pub fn make_dir(&self, path: &str) {
        let mut state = self.lock();
        state.make_parents(path);
        state.dirs.insert(path.to_string());
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().exists(path)
    }

    pub fn set_setting(&self, key: &str, value: &str) {
        self.lock().settings.insert(key.to_string(), value.to_string());
    }

    pub fn settings(&self) -> BTreeMap<String, String> {
        self.lock().settings.clone()
    }

    pub fn set_crontab(&self, content: &str) {
        self.lock().crontab = content.as_bytes().to_vec();
    }

    pub fn crontab(&self) -> String {
        String::from_utf8_lossy(&self.lock().crontab).into_owned()
    }

    pub fn add_binary(&self, name: &str) {
        self.lock().binaries.insert(name.to_string());
    }

    pub fn add_module(&self, name: &str) {
        self.lock().modules.insert(name.to_string());
    }

    /// Make `package` installable; installing it provides `provides`.
    pub fn allow_install(&self, package: &str, provides: &str) {
        self.lock().installable.insert(package.to_string(), provides.to_string());
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.lock().healthy = healthy;
    }

    /// Answers for the next health probes; afterwards the steady state applies.
    pub fn script_health(&self, answers: impl IntoIterator<Item = bool>) {
        self.lock().health.extend(answers);
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    pub fn commands(&self) -> Vec<RemoteCommand> {
        self.lock().log.clone()
    }

    fn execute(&self, command: &RemoteCommand) -> CommandOutput {
        let mut state = self.lock();
        state.log.push(command.clone());
        match command {
            RemoteCommand::Query(probes) => {
                state.counters.queries += 1;
                let stdout: String = probes
                    .iter()
                    .enumerate()
                    .map(|(i, p)| format!("p{i} {}\n", state.probe(p).to_line()))
                    .collect();
                CommandOutput { exit_code: 0, stdout, stderr: String::new() }
            }
            RemoteCommand::Apply(actions) => {
                state.counters.applies += 1;
                let failed = actions.iter().find_map(|action| state.act(action).err());
                // the script's exit trap removes staged uploads either way
                for staged in actions.iter().filter_map(Action::staged_payload) {
                    state.files.remove(staged.as_str());
                }
                match failed {
                    Some((exit_code, stderr)) => CommandOutput { exit_code, stdout: String::new(), stderr },
                    None => CommandOutput::default(),
                }
            }
        }
    }
}

pub struct FakeSession {
    host: FakeHost,
}

impl FakeSession {
    pub fn new(host: FakeHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, SessionError> {
        Ok(self.host.execute(command))
    }

    async fn transfer_file(&self, content: &[u8], remote_path: &RemotePath) -> Result<(), SessionError> {
        self.host.lock().counters.transfers += 1;
        self.host.put_file(remote_path.as_str(), content.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Hands out sessions to registered fake hosts by host id.
#[derive(Default)]
pub struct FakeConnector {
    hosts: Mutex<HashMap<String, FakeHost>>,
    unreachable: Mutex<HashSet<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, host_id: &str, host: FakeHost) {
        self.hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host_id.to_string(), host);
    }

    pub fn set_unreachable(&self, host_id: &str) {
        self.unreachable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host_id.to_string());
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, host: &HostRecord) -> Result<Box<dyn Session>, SessionError> {
        let unreachable = self
            .unreachable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&host.id);
        if unreachable {
            return Err(SessionError::Connect {
                host: host.id.clone(),
                reason: "connection refused".into(),
            });
        }
        let fake = self.hosts.lock().unwrap_or_else(|e| e.into_inner()).get(&host.id).cloned();
        match fake {
            Some(fake) => Ok(Box::new(FakeSession::new(fake))),
            None => Err(SessionError::Connect {
                host: host.id.clone(),
                reason: "no route to host".into(),
            }),
        }
    }
}
