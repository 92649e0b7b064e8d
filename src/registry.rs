use crate::identity::ServerIdentity;
use crate::installation::ServerInstallation;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::debug;

/// Enumerates server identities under the servers root.
#[derive(Debug, Clone)]
pub struct ServerRegistry {
    root: PathBuf,
}

impl ServerRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn installation(&self, identity: &ServerIdentity) -> ServerInstallation {
        ServerInstallation::new(&self.root, identity)
    }

    /// Identities with a complete installation, sorted. Entries whose name
    /// is not a canonical identity or whose installation is incomplete are
    /// left out rather than reported.
    pub fn list(&self) -> io::Result<Vec<ServerIdentity>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut servers = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(identity) = ServerIdentity::from_canonical(&name) else {
                debug!(entry = %name, "skipping directory with non-identity name");
                continue;
            };
            if self.installation(&identity).is_complete() {
                servers.push(identity);
            } else {
                debug!(server = %identity, "skipping incomplete installation");
            }
        }
        servers.sort();
        Ok(servers)
    }

    pub fn exists(&self, identity: &ServerIdentity) -> io::Result<bool> {
        Ok(self.list()?.contains(identity))
    }
}
