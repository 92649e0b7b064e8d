//! Test doubles shared by the unit tests of several modules.

use crate::archive::{ArchiveCodec, ArchiveError};
use crate::backup::Clock;
use crate::installation::ServerInstallation;
use crate::process::{CommandOutput, CommandRunner};
use crate::session::{SessionError, SessionHost};
use crate::status::{StatusError, StatusProbe};
use crate::update::{DistributionLink, DistributionSource, UpdateError, DEFAULT_PLATFORM_TAG};
use chrono::{Duration, NaiveDateTime};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Writes a minimal complete installation.
pub fn populate(installation: &ServerInstallation) {
    let server_dir = installation.server_dir();
    fs::create_dir_all(&server_dir).unwrap();
    fs::write(installation.executable_path(), b"\x7fELF").unwrap();
    fs::write(installation.starter_path(), installation.starter_script()).unwrap();
    fs::write(installation.properties_path(), "server-port=19132\n").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

enum Scripted {
    Output(CommandOutput),
    SpawnError(io::ErrorKind),
}

/// Records every invocation and replays queued outputs; an empty queue
/// answers with a successful, silent run.
#[derive(Default)]
pub struct MockRunner {
    calls: RefCell<Vec<RecordedCall>>,
    outputs: RefCell<VecDeque<Scripted>>,
}

impl MockRunner {
    pub fn push_status(&self, status_code: i32, stdout: &str, stderr: &str) {
        self.outputs
            .borrow_mut()
            .push_back(Scripted::Output(CommandOutput {
                status_code,
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
            }));
    }

    pub fn push_stdout(&self, stdout: &str) {
        self.push_status(0, stdout, "");
    }

    pub fn fail_spawn_with(&self, kind: io::ErrorKind) {
        self.outputs
            .borrow_mut()
            .push_back(Scripted::SpawnError(kind));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }
}

impl CommandRunner for MockRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, io::Error> {
        self.calls.borrow_mut().push(RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: cwd.map(Path::to_path_buf),
        });
        match self.outputs.borrow_mut().pop_front() {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::SpawnError(kind)) => Err(io::Error::new(kind, "scripted spawn failure")),
            None => Ok(CommandOutput {
                status_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            }),
        }
    }
}

/// In-memory session table. With `exit_on_stop` a session disappears as
/// soon as it receives a `stop` line, like a server shutting down.
#[derive(Default)]
pub struct FakeHost {
    sessions: RefCell<BTreeSet<String>>,
    commands: RefCell<BTreeMap<String, Vec<String>>>,
    sent: RefCell<BTreeMap<String, Vec<String>>>,
    exit_on_stop: Cell<bool>,
}

impl FakeHost {
    pub fn exiting_on_stop() -> Self {
        let host = Self::default();
        host.exit_on_stop.set(true);
        host
    }

    pub fn spawn(&self, name: &str) {
        self.sessions.borrow_mut().insert(name.to_string());
    }

    pub fn sent(&self, name: &str) -> Vec<String> {
        self.sent.borrow().get(name).cloned().unwrap_or_default()
    }

    pub fn command(&self, name: &str) -> Option<Vec<String>> {
        self.commands.borrow().get(name).cloned()
    }
}

impl SessionHost for FakeHost {
    fn has_session(&self, name: &str) -> Result<bool, SessionError> {
        Ok(self.sessions.borrow().contains(name))
    }

    fn create(&self, name: &str, command: &[String]) -> Result<(), SessionError> {
        if !self.sessions.borrow_mut().insert(name.to_string()) {
            return Err(SessionError::SessionAlreadyExists {
                session: name.to_string(),
            });
        }
        self.commands
            .borrow_mut()
            .insert(name.to_string(), command.to_vec());
        Ok(())
    }

    fn send_input(&self, name: &str, line: &str) -> Result<(), SessionError> {
        if !self.sessions.borrow().contains(name) {
            return Err(SessionError::SessionNotFound {
                session: name.to_string(),
            });
        }
        self.sent
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .push(line.to_string());
        if self.exit_on_stop.get() && line == "stop\n" {
            self.sessions.borrow_mut().remove(name);
        }
        Ok(())
    }

    fn kill(&self, name: &str) -> Result<(), SessionError> {
        if !self.sessions.borrow_mut().remove(name) {
            return Err(SessionError::SessionNotFound {
                session: name.to_string(),
            });
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.sessions.borrow().iter().cloned().collect())
    }

    fn attach_command(&self, name: &str) -> Vec<String> {
        vec!["fake-attach".to_string(), name.to_string()]
    }
}

pub struct FakeSource {
    links: RefCell<Vec<DistributionLink>>,
    links_timeout: Cell<bool>,
    download_failure: Cell<bool>,
    link_requests: Cell<usize>,
    downloads: RefCell<Vec<String>>,
}

impl FakeSource {
    pub fn serving(url: &str) -> Self {
        let source = Self {
            links: RefCell::new(Vec::new()),
            links_timeout: Cell::new(false),
            download_failure: Cell::new(false),
            link_requests: Cell::new(0),
            downloads: RefCell::new(Vec::new()),
        };
        source.set_url(url);
        source
    }

    pub fn set_url(&self, url: &str) {
        self.set_links(vec![
            DistributionLink {
                download_type: "serverBedrockWindows".to_string(),
                download_url: "https://example.test/windows.zip".to_string(),
            },
            DistributionLink {
                download_type: DEFAULT_PLATFORM_TAG.to_string(),
                download_url: url.to_string(),
            },
        ]);
    }

    pub fn set_links(&self, links: Vec<DistributionLink>) {
        *self.links.borrow_mut() = links;
    }

    pub fn time_out_links(&self) {
        self.links_timeout.set(true);
    }

    pub fn fail_downloads(&self) {
        self.download_failure.set(true);
    }

    pub fn link_requests(&self) -> usize {
        self.link_requests.get()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.borrow().clone()
    }
}

impl DistributionSource for FakeSource {
    fn fetch_links(&self) -> Result<Vec<DistributionLink>, UpdateError> {
        self.link_requests.set(self.link_requests.get() + 1);
        if self.links_timeout.get() {
            return Err(UpdateError::LinksTimeout {
                url: "https://example.test/links".to_string(),
            });
        }
        Ok(self.links.borrow().clone())
    }

    fn fetch_archive(&self, url: &str, destination: &Path) -> Result<(), UpdateError> {
        if self.download_failure.get() {
            return Err(UpdateError::DownloadFailed {
                url: url.to_string(),
                message: "HTTP 503 Service Unavailable".to_string(),
            });
        }
        self.downloads.borrow_mut().push(url.to_string());
        fs::write(destination, url.as_bytes())?;
        Ok(())
    }
}

/// Pretends to be a Bedrock server archive. Extraction writes the
/// configured entries (minus exclusions); packing writes a placeholder
/// archive file.
pub struct FakeCodec {
    entries: RefCell<Vec<(String, String)>>,
    extractions: RefCell<Vec<Vec<String>>>,
    packs: RefCell<Vec<(PathBuf, PathBuf)>>,
}

impl FakeCodec {
    pub fn bedrock() -> Self {
        let entries = [
            ("bedrock_server", "\x7fELF"),
            ("server.properties", "server-port=19132\nserver-port-v6=19133\n"),
            ("permissions.json", "[]"),
            ("allowlist.json", "[]"),
            ("config/", ""),
            ("config/default/permissions.json", "{}"),
            ("behavior_packs/vanilla/manifest.json", "{}"),
        ];
        Self {
            entries: RefCell::new(
                entries
                    .iter()
                    .map(|(name, body)| (name.to_string(), body.to_string()))
                    .collect(),
            ),
            extractions: RefCell::new(Vec::new()),
            packs: RefCell::new(Vec::new()),
        }
    }

    pub fn remove_entry(&self, name: &str) {
        self.entries.borrow_mut().retain(|(entry, _)| entry != name);
    }

    pub fn extractions(&self) -> Vec<Vec<String>> {
        self.extractions.borrow().clone()
    }

    pub fn packs(&self) -> Vec<(PathBuf, PathBuf)> {
        self.packs.borrow().clone()
    }
}

impl ArchiveCodec for FakeCodec {
    fn entries(&self, _archive: &Path) -> Result<Vec<String>, ArchiveError> {
        Ok(self
            .entries
            .borrow()
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn extract(
        &self,
        _archive: &Path,
        destination: &Path,
        exclude: &[String],
    ) -> Result<(), ArchiveError> {
        self.extractions.borrow_mut().push(exclude.to_vec());
        for (name, body) in self.entries.borrow().iter() {
            if exclude.contains(name) {
                continue;
            }
            let target = destination.join(name);
            if name.ends_with('/') {
                fs::create_dir_all(&target)?;
                continue;
            }
            crate::fsutil::ensure_parent(&target)?;
            fs::write(&target, body)?;
        }
        Ok(())
    }

    fn pack(&self, source_dir: &Path, archive: &Path) -> Result<(), ArchiveError> {
        self.packs
            .borrow_mut()
            .push((source_dir.to_path_buf(), archive.to_path_buf()));
        crate::fsutil::ensure_parent(archive)?;
        fs::write(archive, b"PK\x05\x06")?;
        Ok(())
    }
}

/// Reports a fixed player count and records which ports were queried.
#[derive(Default)]
pub struct FakeProbe {
    players: Cell<u32>,
    unreachable: Cell<bool>,
    queried: RefCell<Vec<u16>>,
}

impl FakeProbe {
    pub fn set_players(&self, players: u32) {
        self.players.set(players);
    }

    pub fn make_unreachable(&self) {
        self.unreachable.set(true);
    }

    pub fn queried(&self) -> Vec<u16> {
        self.queried.borrow().clone()
    }
}

impl StatusProbe for FakeProbe {
    fn players_online(&self, port: u16) -> Result<u32, StatusError> {
        self.queried.borrow_mut().push(port);
        if self.unreachable.get() {
            return Err(StatusError::Timeout {
                port,
                timeout_ms: 10,
            });
        }
        Ok(self.players.get())
    }
}

pub struct FixedClock {
    now: Cell<NaiveDateTime>,
}

impl FixedClock {
    /// `at` uses `%Y-%m-%d %H:%M:%S`.
    pub fn at(at: &str) -> Self {
        let now = NaiveDateTime::parse_from_str(at, "%Y-%m-%d %H:%M:%S").unwrap();
        Self {
            now: Cell::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.now.get()
    }
}
