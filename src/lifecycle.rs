//! State machine over one server identity.
//!
//! State is never stored: it is derived on every call from the registry
//! (installed or not) and the session host (running or not). Every guard
//! runs before the first mutation, so a refused operation leaves the
//! installation untouched.

use crate::archive::ArchiveCodec;
use crate::backup::{BackupError, BackupManager, Clock};
use crate::fsutil::remove_tree;
use crate::identity::ServerIdentity;
use crate::properties::{
    PortFamily, PropertyError, PropertyStore, ServerProperties, LAN_VISIBILITY,
};
use crate::registry::ServerRegistry;
use crate::session::{SessionError, SessionGateway, SessionHost};
use crate::status::{StatusError, StatusProbe};
use crate::update::{
    DistributionSource, UpdateCheck, UpdateCoordinator, UpdateError, UpdateOutcome,
    DEFAULT_PLATFORM_TAG,
};
use serde::Serialize;
use std::fmt;
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const STOP_COMMAND: &str = "stop";
pub const SAY_COMMAND: &str = "say";
const STYLE_MARKER: char = '&';
const STYLE_ESCAPE: char = '\u{a7}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerState {
    Uninstalled,
    #[serde(rename = "Installed-Stopped")]
    InstalledStopped,
    Running,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Uninstalled => "Uninstalled",
            Self::InstalledStopped => "Installed-Stopped",
            Self::Running => "Running",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("server {server} does not exist")]
    NotFound { server: String },
    #[error("server {server} already exists")]
    AlreadyExists { server: String },
    #[error("server {server} is already running")]
    AlreadyRunning { server: String },
    #[error("server {server} is not running")]
    NotRunning { server: String },
    #[error("cannot start {server}: {reason}")]
    PortConflict { server: String, reason: String },
    #[error("{players} player(s) online on {server}; use --force to stop anyway")]
    PlayersOnline { server: String, players: u32 },
    #[error("last backup of {server} is {age_min} minute(s) old; cooldown is {cooldown_min} minute(s)")]
    TooRecent {
        server: String,
        age_min: i64,
        cooldown_min: u64,
    },
    #[error("cannot back up running server {server}: {players} player(s) online")]
    BackupBlockedByPlayers { server: String, players: u32 },
    #[error("server {server} is running; stop it before purging")]
    RunningCannotPurge { server: String },
    #[error("server {server} did not exit within {waited_sec} s after stop")]
    StopTimedOut { server: String, waited_sec: u64 },
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Tunables the coordinator takes from the tool configuration.
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    pub platform_tag: String,
    pub backup_cooldown_min: Option<u64>,
    pub backup_retention: Option<usize>,
    pub wait_for_exit: bool,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            platform_tag: DEFAULT_PLATFORM_TAG.to_string(),
            backup_cooldown_min: None,
            backup_retention: None,
            wait_for_exit: false,
            wait_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub server: ServerIdentity,
    pub session: String,
    pub update: Option<UpdateOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// No session existed; nothing was sent.
    NotRunning,
    /// `stop` was sent; the session is expected to end on its own.
    StopRequested,
    /// `stop` was sent and the session was observed to end.
    Stopped,
    /// The session was terminated without a clean shutdown.
    Killed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupReport {
    pub server: ServerIdentity,
    pub archive: String,
    pub restarted: bool,
    pub pruned: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupListing {
    pub server: ServerIdentity,
    pub archives: Vec<String>,
    pub minutes_since_last: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub server: ServerIdentity,
    pub state: ServerState,
    pub port_v4: Option<u16>,
    pub port_v6: Option<u16>,
    pub lan_visibility: bool,
    pub distribution: String,
    pub backups: usize,
    pub minutes_since_last_backup: Option<i64>,
    pub players_online: Option<u32>,
}

/// Replaces every `&` not immediately followed by whitespace with the
/// in-game styling escape `§`. Control characters become spaces; escape
/// sequences a session host would expand are neutralized by the host.
pub fn transform_message(text: &str) -> String {
    let cleaned: Vec<char> = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let mut out = String::with_capacity(text.len());
    for (index, &c) in cleaned.iter().enumerate() {
        let followed_by_space = cleaned
            .get(index + 1)
            .map(|next| next.is_whitespace())
            .unwrap_or(false);
        if c == STYLE_MARKER && !followed_by_space {
            out.push(STYLE_ESCAPE);
        } else {
            out.push(c);
        }
    }
    out
}

fn optional_port(
    props: &ServerProperties,
    family: PortFamily,
) -> Result<Option<u16>, PropertyError> {
    match props.port(family) {
        Ok(port) => Ok(Some(port)),
        Err(PropertyError::ConfigKeyMissing { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

fn configured_ports(props: &ServerProperties) -> Result<Vec<u16>, PropertyError> {
    let mut ports = vec![props.port(PortFamily::V4)?];
    if let Some(v6) = optional_port(props, PortFamily::V6)? {
        ports.push(v6);
    }
    Ok(ports)
}

pub struct Coordinator<H, S, C, P, K> {
    registry: ServerRegistry,
    properties: PropertyStore,
    sessions: SessionGateway<H>,
    source: S,
    codec: C,
    probe: P,
    clock: K,
    policy: LifecyclePolicy,
}

impl<H, S, C, P, K> Coordinator<H, S, C, P, K>
where
    H: SessionHost,
    S: DistributionSource,
    C: ArchiveCodec,
    P: StatusProbe,
    K: Clock,
{
    pub fn new(
        registry: ServerRegistry,
        sessions: SessionGateway<H>,
        source: S,
        codec: C,
        probe: P,
        clock: K,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            properties: PropertyStore::new(registry.clone()),
            registry,
            sessions,
            source,
            codec,
            probe,
            clock,
            policy,
        }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    pub fn sessions(&self) -> &SessionGateway<H> {
        &self.sessions
    }

    fn updater(&self) -> UpdateCoordinator<'_, S, C, H> {
        UpdateCoordinator::new(
            &self.registry,
            &self.sessions,
            &self.source,
            &self.codec,
            &self.policy.platform_tag,
        )
    }

    fn backups(&self) -> BackupManager<'_, C, K> {
        BackupManager::new(&self.registry, &self.codec, &self.clock)
    }

    fn require_installed(&self, identity: &ServerIdentity) -> Result<(), LifecycleError> {
        if !self.registry.exists(identity)? {
            return Err(LifecycleError::NotFound {
                server: identity.to_string(),
            });
        }
        Ok(())
    }

    /// Maps the updater's running guard onto the lifecycle outcome.
    fn running_guard(identity: &ServerIdentity, err: UpdateError) -> LifecycleError {
        match err {
            UpdateError::ServerRunning { .. } => LifecycleError::AlreadyRunning {
                server: identity.to_string(),
            },
            other => LifecycleError::Update(other),
        }
    }

    pub fn state(&self, identity: &ServerIdentity) -> Result<ServerState, LifecycleError> {
        if self.sessions.has_session(identity)? {
            return Ok(ServerState::Running);
        }
        if self.registry.exists(identity)? {
            Ok(ServerState::InstalledStopped)
        } else {
            Ok(ServerState::Uninstalled)
        }
    }

    /// Every installed identity with its derived state.
    pub fn list(&self) -> Result<Vec<(ServerIdentity, ServerState)>, LifecycleError> {
        let known = self.registry.list()?;
        let active = self.sessions.list_active(&known)?;
        Ok(known
            .into_iter()
            .map(|identity| {
                let state = if active.contains(&identity) {
                    ServerState::Running
                } else {
                    ServerState::InstalledStopped
                };
                (identity, state)
            })
            .collect())
    }

    /// Installs a new server: `Uninstalled -> Installed-Stopped`.
    pub fn create(&self, identity: &ServerIdentity) -> Result<UpdateOutcome, LifecycleError> {
        if self.registry.exists(identity)? {
            return Err(LifecycleError::AlreadyExists {
                server: identity.to_string(),
            });
        }
        let outcome = self
            .updater()
            .update(identity, false)
            .map_err(|err| Self::running_guard(identity, err))?;
        info!(server = %identity, "server created");
        Ok(outcome)
    }

    pub fn start(
        &self,
        identity: &ServerIdentity,
        skip_update: bool,
    ) -> Result<StartReport, LifecycleError> {
        self.require_installed(identity)?;
        if self.sessions.has_session(identity)? {
            return Err(LifecycleError::AlreadyRunning {
                server: identity.to_string(),
            });
        }
        let update = if skip_update {
            debug!(server = %identity, "skipping update check");
            None
        } else {
            Some(
                self.updater()
                    .update(identity, false)
                    .map_err(|err| Self::running_guard(identity, err))?,
            )
        };
        self.check_ports(identity)?;

        let starter = self.registry.installation(identity).starter_path();
        self.sessions
            .create(identity, &[starter.to_string_lossy().to_string()])?;
        info!(server = %identity, "server started");
        Ok(StartReport {
            server: identity.clone(),
            session: self.sessions.session_name(identity),
            update,
        })
    }

    fn check_ports(&self, identity: &ServerIdentity) -> Result<(), LifecycleError> {
        let props = self.properties.read(identity)?;
        let own = configured_ports(&props)?;
        for other in self.registry.list()? {
            if &other == identity {
                continue;
            }
            let theirs = match self
                .properties
                .read(&other)
                .and_then(|p| configured_ports(&p))
            {
                Ok(ports) => ports,
                Err(err) => {
                    warn!(server = %other, error = %err, "skipping port check against unreadable configuration");
                    continue;
                }
            };
            if let Some(port) = own.iter().find(|port| theirs.contains(port)) {
                return Err(LifecycleError::PortConflict {
                    server: identity.to_string(),
                    reason: format!("port {port} is also configured for {other}"),
                });
            }
        }
        if props.flag(LAN_VISIBILITY) {
            return Err(LifecycleError::PortConflict {
                server: identity.to_string(),
                reason: format!("{LAN_VISIBILITY} must be false for managed servers"),
            });
        }
        Ok(())
    }

    fn players_online(&self, identity: &ServerIdentity) -> Result<u32, LifecycleError> {
        let port = self.properties.get_port(identity, PortFamily::V4)?;
        Ok(self.probe.players_online(port)?)
    }

    pub fn stop(
        &self,
        identity: &ServerIdentity,
        force: bool,
    ) -> Result<StopOutcome, LifecycleError> {
        if !self.sessions.has_session(identity)? {
            debug!(server = %identity, "stop requested for server without session");
            return Ok(StopOutcome::NotRunning);
        }
        if !force {
            let players = self.players_online(identity)?;
            if players > 0 {
                return Err(LifecycleError::PlayersOnline {
                    server: identity.to_string(),
                    players,
                });
            }
        }
        self.sessions.send_line(identity, STOP_COMMAND)?;
        info!(server = %identity, "stop command sent");
        if self.policy.wait_for_exit {
            self.wait_for_exit(identity)?;
            return Ok(StopOutcome::Stopped);
        }
        Ok(StopOutcome::StopRequested)
    }

    /// Terminates the session outright, for a server that no longer
    /// answers `stop`. Unsaved world changes are lost.
    pub fn kill(&self, identity: &ServerIdentity) -> Result<StopOutcome, LifecycleError> {
        if !self.sessions.has_session(identity)? {
            debug!(server = %identity, "kill requested for server without session");
            return Ok(StopOutcome::NotRunning);
        }
        warn!(server = %identity, "killing server session");
        self.sessions.kill(identity)?;
        Ok(StopOutcome::Killed)
    }

    /// Polls until the session is gone. The session is left alone on
    /// timeout.
    fn wait_for_exit(&self, identity: &ServerIdentity) -> Result<(), LifecycleError> {
        let started = Instant::now();
        loop {
            if !self.sessions.has_session(identity)? {
                debug!(server = %identity, elapsed_ms = started.elapsed().as_millis() as u64, "session ended");
                return Ok(());
            }
            if started.elapsed() >= self.policy.wait_timeout {
                return Err(LifecycleError::StopTimedOut {
                    server: identity.to_string(),
                    waited_sec: self.policy.wait_timeout.as_secs(),
                });
            }
            thread::sleep(self.policy.poll_interval);
        }
    }

    /// Stops a running server if needed, archives it, restarts it and only
    /// then prunes old archives.
    pub fn backup(
        &self,
        identity: &ServerIdentity,
        force: bool,
    ) -> Result<BackupReport, LifecycleError> {
        self.require_installed(identity)?;
        let backups = self.backups();
        match self.policy.backup_cooldown_min {
            Some(cooldown_min) if !force => {
                if let Some(age) = backups.newest_age(identity)? {
                    if age < chrono::Duration::minutes(cooldown_min as i64) {
                        return Err(LifecycleError::TooRecent {
                            server: identity.to_string(),
                            age_min: age.num_minutes().max(0),
                            cooldown_min,
                        });
                    }
                }
            }
            _ => {}
        }

        let was_running = self.sessions.has_session(identity)?;
        if was_running {
            if !force {
                let players = self.players_online(identity)?;
                if players > 0 {
                    return Err(LifecycleError::BackupBlockedByPlayers {
                        server: identity.to_string(),
                        players,
                    });
                }
            }
            self.sessions.send_line(identity, STOP_COMMAND)?;
            info!(server = %identity, "stopping server for backup");
            self.wait_for_exit(identity)?;
        }

        let created = backups.create(identity);
        let restarted = if was_running {
            self.start(identity, true)?;
            true
        } else {
            false
        };
        let archive = created?;

        let pruned = match self.policy.backup_retention {
            Some(cap) => backups.limit(identity, cap)?,
            None => Vec::new(),
        };
        Ok(BackupReport {
            server: identity.clone(),
            archive,
            restarted,
            pruned,
        })
    }

    pub fn backup_listing(&self, identity: &ServerIdentity) -> Result<BackupListing, LifecycleError> {
        self.require_installed(identity)?;
        let backups = self.backups();
        Ok(BackupListing {
            server: identity.clone(),
            archives: backups.list(identity)?,
            minutes_since_last: backups.age_of_most_recent_minutes(identity)?,
        })
    }

    /// Broadcasts `text` as in-game chat; returns the line sent.
    pub fn message(&self, identity: &ServerIdentity, text: &str) -> Result<String, LifecycleError> {
        if !self.sessions.has_session(identity)? {
            return Err(LifecycleError::NotRunning {
                server: identity.to_string(),
            });
        }
        let line = format!("{SAY_COMMAND} {}", transform_message(text));
        self.sessions.send_line(identity, &line)?;
        Ok(line)
    }

    /// Deletes the identity's whole directory tree. Returns whether anything
    /// was removed.
    pub fn purge(&self, identity: &ServerIdentity) -> Result<bool, LifecycleError> {
        if self.sessions.has_session(identity)? {
            return Err(LifecycleError::RunningCannotPurge {
                server: identity.to_string(),
            });
        }
        let folder = self.registry.installation(identity).folder().to_path_buf();
        let removed = remove_tree(&folder)?;
        info!(server = %identity, removed, "server purged");
        Ok(removed)
    }

    pub fn check_update(&self, identity: &ServerIdentity) -> Result<UpdateCheck, LifecycleError> {
        self.require_installed(identity)?;
        Ok(self.updater().check(identity)?)
    }

    pub fn update(
        &self,
        identity: &ServerIdentity,
        force: bool,
    ) -> Result<UpdateOutcome, LifecycleError> {
        self.require_installed(identity)?;
        Ok(self.updater().update(identity, force)?)
    }

    pub fn status(&self, identity: &ServerIdentity) -> Result<ServerStatus, LifecycleError> {
        self.require_installed(identity)?;
        let state = self.state(identity)?;
        let props = self.properties.read(identity)?;
        let port_v4 = optional_port(&props, PortFamily::V4)?;
        let players_online = match (state, port_v4) {
            (ServerState::Running, Some(port)) => match self.probe.players_online(port) {
                Ok(players) => Some(players),
                Err(err) => {
                    warn!(server = %identity, error = %err, "status query failed");
                    None
                }
            },
            _ => None,
        };
        let backups = self.backups();
        Ok(ServerStatus {
            server: identity.clone(),
            state,
            port_v4,
            port_v6: optional_port(&props, PortFamily::V6)?,
            lan_visibility: props.flag(LAN_VISIBILITY),
            distribution: self.registry.installation(identity).read_reference()?,
            backups: backups.list(identity)?.len(),
            minutes_since_last_backup: backups.age_of_most_recent_minutes(identity)?,
            players_online,
        })
    }

    /// Command that attaches the operator's terminal to a running server.
    pub fn attach_command(&self, identity: &ServerIdentity) -> Result<Vec<String>, LifecycleError> {
        if !self.sessions.has_session(identity)? {
            return Err(LifecycleError::NotRunning {
                server: identity.to_string(),
            });
        }
        Ok(self.sessions.attach_command(identity))
    }
}
