use crate::fsutil::write_atomic_text_file;
use crate::identity::ServerIdentity;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const EXECUTABLE_NAME: &str = "bedrock_server";
pub const STARTER_NAME: &str = "starter.sh";
pub const PROPERTIES_NAME: &str = "server.properties";
const SERVER_DIR_NAME: &str = "server";
const BACKUPS_DIR_NAME: &str = "backups";
const REFERENCE_FILE_NAME: &str = "last_update_url.txt";

/// On-disk artifacts of one server identity.
///
/// ```text
/// <root>/<identity>/
///     server/               bedrock_server, starter.sh, server.properties, ...
///     backups/              YYYY-MM-DD_HH-MM-SS.zip
///     last_update_url.txt
/// ```
#[derive(Debug, Clone)]
pub struct ServerInstallation {
    folder: PathBuf,
}

impl ServerInstallation {
    pub fn new(servers_root: &Path, identity: &ServerIdentity) -> Self {
        Self {
            folder: servers_root.join(identity.as_str()),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn server_dir(&self) -> PathBuf {
        self.folder.join(SERVER_DIR_NAME)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.folder.join(BACKUPS_DIR_NAME)
    }

    pub fn executable_path(&self) -> PathBuf {
        self.server_dir().join(EXECUTABLE_NAME)
    }

    pub fn starter_path(&self) -> PathBuf {
        self.server_dir().join(STARTER_NAME)
    }

    pub fn properties_path(&self) -> PathBuf {
        self.server_dir().join(PROPERTIES_NAME)
    }

    pub fn reference_path(&self) -> PathBuf {
        self.folder.join(REFERENCE_FILE_NAME)
    }

    /// Complete iff executable, launch script and configuration file all
    /// exist as regular files.
    pub fn is_complete(&self) -> bool {
        self.executable_path().is_file()
            && self.starter_path().is_file()
            && self.properties_path().is_file()
    }

    /// Last-applied distribution URL; empty when never recorded.
    pub fn read_reference(&self) -> io::Result<String> {
        match fs::read_to_string(self.reference_path()) {
            Ok(text) => Ok(text.trim().to_string()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err),
        }
    }

    pub fn write_reference(&self, url: &str) -> io::Result<()> {
        write_atomic_text_file(&self.reference_path(), url, None)
    }

    /// Fixed three-line launch script. No trailing newline after the last
    /// line; the managed server tooling expects this exact content.
    pub fn starter_script(&self) -> String {
        format!(
            "#!/usr/bin/env bash\ncd \"{}\"\nLD_LIBRARY_PATH=. ./{}",
            self.server_dir().display(),
            EXECUTABLE_NAME
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::populate;
    use tempfile::tempdir;

    #[test]
    fn layout_follows_identity() {
        let root = Path::new("/srv/bedrock");
        let id = ServerIdentity::parse("MyWorld").unwrap();
        let install = ServerInstallation::new(root, &id);
        assert_eq!(install.folder(), Path::new("/srv/bedrock/myworld"));
        assert_eq!(
            install.executable_path(),
            PathBuf::from("/srv/bedrock/myworld/server/bedrock_server")
        );
        assert_eq!(
            install.reference_path(),
            PathBuf::from("/srv/bedrock/myworld/last_update_url.txt")
        );
        assert_eq!(install.backups_dir(), PathBuf::from("/srv/bedrock/myworld/backups"));
    }

    #[test]
    fn completeness_requires_all_three_artifacts() {
        let dir = tempdir().unwrap();
        let id = ServerIdentity::parse("alpha1").unwrap();
        let install = ServerInstallation::new(dir.path(), &id);
        assert!(!install.is_complete());
        populate(&install);
        assert!(install.is_complete());
        fs::remove_file(install.starter_path()).unwrap();
        assert!(!install.is_complete());
    }

    #[test]
    fn reference_defaults_to_empty_and_round_trips() {
        let dir = tempdir().unwrap();
        let id = ServerIdentity::parse("alpha1").unwrap();
        let install = ServerInstallation::new(dir.path(), &id);
        assert_eq!(install.read_reference().unwrap(), "");
        install
            .write_reference("https://example.invalid/bedrock-server-1.21.zip")
            .unwrap();
        assert_eq!(
            install.read_reference().unwrap(),
            "https://example.invalid/bedrock-server-1.21.zip"
        );
    }

    #[test]
    fn starter_script_is_three_lines_without_trailing_newline() {
        let id = ServerIdentity::parse("alpha1").unwrap();
        let install = ServerInstallation::new(Path::new("/srv/b"), &id);
        assert_eq!(
            install.starter_script(),
            "#!/usr/bin/env bash\ncd \"/srv/b/alpha1/server\"\nLD_LIBRARY_PATH=. ./bedrock_server"
        );
    }
}
