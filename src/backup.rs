use crate::archive::{ArchiveCodec, ArchiveError};
use crate::identity::ServerIdentity;
use crate::registry::ServerRegistry;
use chrono::{Duration, Local, NaiveDateTime};
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Archive names are `<timestamp>.zip`; lexicographic order of this format
/// is chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
pub const ARCHIVE_EXTENSION: &str = ".zip";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup {name} already exists")]
    AlreadyExists { name: String },
    #[error("nothing to back up: {} does not exist", path.display())]
    MissingInstall { path: PathBuf },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> NaiveDateTime {
        (**self).now()
    }
}

/// Local wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

pub fn archive_name(at: NaiveDateTime) -> String {
    format!("{}{}", at.format(TIMESTAMP_FORMAT), ARCHIVE_EXTENSION)
}

pub fn parse_archive_name(name: &str) -> Option<NaiveDateTime> {
    let stem = name.strip_suffix(ARCHIVE_EXTENSION)?;
    NaiveDateTime::parse_from_str(stem, TIMESTAMP_FORMAT).ok()
}

fn whole_minutes(age: Duration) -> i64 {
    age.num_minutes().max(1)
}

pub struct BackupManager<'a, C, K> {
    registry: &'a ServerRegistry,
    codec: &'a C,
    clock: &'a K,
}

impl<'a, C: ArchiveCodec, K: Clock> BackupManager<'a, C, K> {
    pub fn new(registry: &'a ServerRegistry, codec: &'a C, clock: &'a K) -> Self {
        Self {
            registry,
            codec,
            clock,
        }
    }

    /// Timestamp-named archives, oldest first. Other files in the backups
    /// directory are never counted or pruned.
    pub fn list(&self, identity: &ServerIdentity) -> io::Result<Vec<String>> {
        let dir = self.registry.installation(identity).backups_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if parse_archive_name(&name).is_some() {
                names.push(name);
            } else {
                debug!(archive = %name, "ignoring file without a backup timestamp name");
            }
        }
        names.sort();
        Ok(names)
    }

    fn newest_timestamp(names: &[String]) -> Option<NaiveDateTime> {
        names.last().and_then(|name| parse_archive_name(name))
    }

    /// Minutes since the newest backup, at least 1. `None` while fewer than
    /// two archives exist.
    pub fn age_of_most_recent_minutes(
        &self,
        identity: &ServerIdentity,
    ) -> io::Result<Option<i64>> {
        let names = self.list(identity)?;
        if names.len() <= 1 {
            return Ok(None);
        }
        Ok(Self::newest_timestamp(&names).map(|at| whole_minutes(self.clock.now() - at)))
    }

    /// Exact age of the newest archive, whatever the archive count.
    pub fn newest_age(&self, identity: &ServerIdentity) -> io::Result<Option<Duration>> {
        let names = self.list(identity)?;
        Ok(Self::newest_timestamp(&names).map(|at| self.clock.now() - at))
    }

    /// Packs the installed server directory into a new timestamp-named
    /// archive and returns its file name.
    pub fn create(&self, identity: &ServerIdentity) -> Result<String, BackupError> {
        let installation = self.registry.installation(identity);
        let source = installation.server_dir();
        if !source.is_dir() {
            return Err(BackupError::MissingInstall { path: source });
        }
        let name = archive_name(self.clock.now());
        let target = installation.backups_dir().join(&name);
        if target.exists() {
            return Err(BackupError::AlreadyExists { name });
        }
        fs::create_dir_all(installation.backups_dir())?;
        self.codec.pack(&source, &target)?;
        info!(server = %identity, archive = %name, "backup created");
        Ok(name)
    }

    /// Deletes the oldest archives until at most `cap` remain. Returns the
    /// removed names.
    pub fn limit(&self, identity: &ServerIdentity, cap: usize) -> io::Result<Vec<String>> {
        let names = self.list(identity)?;
        if names.len() <= cap {
            return Ok(Vec::new());
        }
        let dir = self.registry.installation(identity).backups_dir();
        let excess = names.len() - cap;
        let mut removed = Vec::with_capacity(excess);
        for name in names.into_iter().take(excess) {
            match fs::remove_file(dir.join(&name)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            info!(server = %identity, archive = %name, "pruned backup");
            removed.push(name);
        }
        Ok(removed)
    }
}
