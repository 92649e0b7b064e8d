//! Keeps an installation in step with the published server distribution.
//!
//! The distribution reference stored next to the installation is only
//! written after extraction and launch-script generation succeed, so an
//! interrupted update is retried in full on the next attempt.

use crate::archive::{ArchiveCodec, ArchiveError};
use crate::fsutil::{make_executable, scratch_dir, write_atomic_text_file};
use crate::identity::ServerIdentity;
use crate::registry::ServerRegistry;
use crate::session::{SessionError, SessionGateway, SessionHost};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_LINKS_URL: &str =
    "https://net-secondary.web.minecraft-services.net/api/v1.0/download/links";
pub const DEFAULT_PLATFORM_TAG: &str = "serverBedrockLinux";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Operator-owned files at the archive root that a selective update keeps.
pub const PRESERVED_FILES: [&str; 5] = [
    "allowlist.json",
    "packetlimitconfig.json",
    "permissions.json",
    "profanity_filter.wlist",
    "server.properties",
];
pub const PRESERVED_DIR: &str = "config";

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("distribution links request timed out: {url}")]
    LinksTimeout { url: String },
    #[error("distribution links unavailable from {url}: {message}")]
    LinksUnavailable { url: String, message: String },
    #[error("no distribution tagged {tag} in the published links")]
    NoMatchingDistribution { tag: String },
    #[error("download timed out: {url}")]
    DownloadTimeout { url: String },
    #[error("download failed: {url}: {message}")]
    DownloadFailed { url: String, message: String },
    #[error("server {server} is running; stop it before updating")]
    ServerRunning { server: String },
    #[error("distribution did not contain the server executable: {}", path.display())]
    MissingExecutable { path: PathBuf },
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionLink {
    pub download_type: String,
    pub download_url: String,
}

#[derive(Debug, Deserialize)]
struct LinksPayload {
    result: LinksResult,
}

#[derive(Debug, Deserialize)]
struct LinksResult {
    #[serde(default)]
    links: Vec<DistributionLink>,
}

/// Remote side of an update: the published link list and the archive bytes.
pub trait DistributionSource {
    fn fetch_links(&self) -> Result<Vec<DistributionLink>, UpdateError>;
    fn fetch_archive(&self, url: &str, destination: &Path) -> Result<(), UpdateError>;
}

impl<T: DistributionSource + ?Sized> DistributionSource for &T {
    fn fetch_links(&self) -> Result<Vec<DistributionLink>, UpdateError> {
        (**self).fetch_links()
    }

    fn fetch_archive(&self, url: &str, destination: &Path) -> Result<(), UpdateError> {
        (**self).fetch_archive(url, destination)
    }
}

#[derive(Debug, Clone)]
pub struct HttpDistribution {
    links_url: String,
    user_agent: String,
    links_timeout: Duration,
    download_timeout: Duration,
}

impl HttpDistribution {
    pub fn new(
        links_url: impl Into<String>,
        user_agent: impl Into<String>,
        links_timeout: Duration,
        download_timeout: Duration,
    ) -> Self {
        Self {
            links_url: links_url.into(),
            user_agent: user_agent.into(),
            links_timeout,
            download_timeout,
        }
    }

    fn client(&self, timeout: Duration) -> Result<reqwest::blocking::Client, UpdateError> {
        Ok(reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(self.user_agent.clone())
            .build()?)
    }
}

impl DistributionSource for HttpDistribution {
    fn fetch_links(&self) -> Result<Vec<DistributionLink>, UpdateError> {
        let url = self.links_url.clone();
        let unavailable = |message: String| UpdateError::LinksUnavailable {
            url: url.clone(),
            message,
        };
        let classify = |err: reqwest::Error| {
            if err.is_timeout() {
                UpdateError::LinksTimeout { url: url.clone() }
            } else {
                unavailable(err.to_string())
            }
        };
        debug!(url = %url, "requesting distribution links");
        let response = self
            .client(self.links_timeout)?
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(unavailable(format!("HTTP {} {}", status, body.trim())));
        }
        let payload: LinksPayload = response.json().map_err(classify)?;
        Ok(payload.result.links)
    }

    fn fetch_archive(&self, url: &str, destination: &Path) -> Result<(), UpdateError> {
        let classify = |err: reqwest::Error| {
            if err.is_timeout() {
                UpdateError::DownloadTimeout {
                    url: url.to_string(),
                }
            } else {
                UpdateError::DownloadFailed {
                    url: url.to_string(),
                    message: err.to_string(),
                }
            }
        };
        debug!(url, "downloading distribution archive");
        let response = self
            .client(self.download_timeout)?
            .get(url)
            .send()
            .map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::DownloadFailed {
                url: url.to_string(),
                message: format!("HTTP {status}"),
            });
        }
        let bytes = response.bytes().map_err(classify)?;
        crate::fsutil::ensure_parent(destination)?;
        fs::write(destination, &bytes)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwriteMode {
    /// Every archive entry is extracted.
    Full,
    /// Operator-owned files and the `config/` tree are left untouched.
    Selective,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateCheck {
    pub url: String,
    pub current: String,
    pub complete: bool,
    pub needs_update: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    AlreadyCurrent { url: String },
    Applied { url: String, mode: OverwriteMode },
}

/// `true` for entries a selective update must not extract.
pub fn is_preserved(entry: &str) -> bool {
    let name = entry.strip_prefix("./").unwrap_or(entry);
    if PRESERVED_FILES.contains(&name) {
        return true;
    }
    match name.strip_prefix(PRESERVED_DIR) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

pub struct UpdateCoordinator<'a, S, C, H> {
    registry: &'a ServerRegistry,
    sessions: &'a SessionGateway<H>,
    source: &'a S,
    codec: &'a C,
    platform_tag: &'a str,
}

impl<'a, S, C, H> UpdateCoordinator<'a, S, C, H>
where
    S: DistributionSource,
    C: ArchiveCodec,
    H: SessionHost,
{
    pub fn new(
        registry: &'a ServerRegistry,
        sessions: &'a SessionGateway<H>,
        source: &'a S,
        codec: &'a C,
        platform_tag: &'a str,
    ) -> Self {
        Self {
            registry,
            sessions,
            source,
            codec,
            platform_tag,
        }
    }

    pub fn resolve_download_url(&self) -> Result<String, UpdateError> {
        let links = self.source.fetch_links()?;
        links
            .into_iter()
            .find(|link| link.download_type == self.platform_tag)
            .map(|link| link.download_url)
            .ok_or_else(|| UpdateError::NoMatchingDistribution {
                tag: self.platform_tag.to_string(),
            })
    }

    pub fn check(&self, identity: &ServerIdentity) -> Result<UpdateCheck, UpdateError> {
        let installation = self.registry.installation(identity);
        let url = self.resolve_download_url()?;
        let current = installation.read_reference()?;
        let complete = installation.is_complete();
        Ok(UpdateCheck {
            needs_update: !complete || url != current,
            url,
            current,
            complete,
        })
    }

    /// Installs only when [`check`](Self::check) reports `needs_update`, or
    /// always with `force`.
    pub fn update(
        &self,
        identity: &ServerIdentity,
        force: bool,
    ) -> Result<UpdateOutcome, UpdateError> {
        self.ensure_stopped(identity)?;
        let check = self.check(identity)?;
        if !force && !check.needs_update {
            debug!(server = %identity, url = %check.url, "installation already current");
            return Ok(UpdateOutcome::AlreadyCurrent { url: check.url });
        }
        self.install(identity, &check.url)
    }

    fn ensure_stopped(&self, identity: &ServerIdentity) -> Result<(), UpdateError> {
        if self.sessions.has_session(identity)? {
            return Err(UpdateError::ServerRunning {
                server: identity.to_string(),
            });
        }
        Ok(())
    }

    fn install(&self, identity: &ServerIdentity, url: &str) -> Result<UpdateOutcome, UpdateError> {
        let installation = self.registry.installation(identity);
        let mode = if installation.is_complete() {
            OverwriteMode::Selective
        } else {
            OverwriteMode::Full
        };
        info!(server = %identity, url, ?mode, "installing server distribution");

        let download_dir = scratch_dir("download");
        fs::create_dir_all(&download_dir)?;
        let archive_path = download_dir.join("bedrock-server.zip");

        let install_result = (|| -> Result<(), UpdateError> {
            self.source.fetch_archive(url, &archive_path)?;
            let exclude: Vec<String> = match mode {
                OverwriteMode::Full => Vec::new(),
                OverwriteMode::Selective => self
                    .codec
                    .entries(&archive_path)?
                    .into_iter()
                    .filter(|entry| is_preserved(entry))
                    .collect(),
            };
            let server_dir = installation.server_dir();
            self.codec.extract(&archive_path, &server_dir, &exclude)?;

            let executable = installation.executable_path();
            if !executable.is_file() {
                return Err(UpdateError::MissingExecutable { path: executable });
            }
            write_atomic_text_file(
                &installation.starter_path(),
                &installation.starter_script(),
                Some(0o755),
            )?;
            make_executable(&executable)?;
            make_executable(&installation.starter_path())?;
            Ok(())
        })();
        let _ = fs::remove_dir_all(&download_dir);
        install_result?;

        installation.write_reference(url)?;
        info!(server = %identity, url, "distribution installed");
        Ok(UpdateOutcome::Applied {
            url: url.to_string(),
            mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::args;
    use crate::testing::{populate, FakeCodec, FakeHost, FakeSource};
    use tempfile::tempdir;

    const URL_A: &str = "https://example.test/bedrock-server-1.21.20.zip";
    const URL_B: &str = "https://example.test/bedrock-server-1.21.30.zip";

    fn id(name: &str) -> ServerIdentity {
        ServerIdentity::parse(name).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: ServerRegistry,
        sessions: SessionGateway<FakeHost>,
        source: FakeSource,
        codec: FakeCodec,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            Self {
                registry: ServerRegistry::new(dir.path()),
                _dir: dir,
                sessions: SessionGateway::new(FakeHost::default(), "bsw-"),
                source: FakeSource::serving(URL_A),
                codec: FakeCodec::bedrock(),
            }
        }

        fn updater(&self) -> UpdateCoordinator<'_, FakeSource, FakeCodec, FakeHost> {
            UpdateCoordinator::new(
                &self.registry,
                &self.sessions,
                &self.source,
                &self.codec,
                DEFAULT_PLATFORM_TAG,
            )
        }
    }

    #[test]
    fn preserved_entries() {
        assert!(is_preserved("server.properties"));
        assert!(is_preserved("./permissions.json"));
        assert!(is_preserved("config"));
        assert!(is_preserved("config/"));
        assert!(is_preserved("config/default/permissions.json"));
        assert!(!is_preserved("configuration.txt"));
        assert!(!is_preserved("behavior_packs/server.properties"));
        assert!(!is_preserved("bedrock_server"));
    }

    #[test]
    fn resolves_platform_link() {
        let fx = Fixture::new();
        assert_eq!(fx.updater().resolve_download_url().unwrap(), URL_A);

        fx.source.set_links(vec![DistributionLink {
            download_type: "serverBedrockWindows".to_string(),
            download_url: URL_B.to_string(),
        }]);
        assert!(matches!(
            fx.updater().resolve_download_url(),
            Err(UpdateError::NoMatchingDistribution { .. })
        ));
    }

    #[test]
    fn links_payload_shape() {
        let payload: LinksPayload = serde_json::from_str(
            r#"{"result":{"links":[{"downloadType":"serverBedrockLinux","downloadUrl":"https://x/y.zip"}]}}"#,
        )
        .unwrap();
        assert_eq!(payload.result.links[0].download_type, "serverBedrockLinux");
        assert_eq!(payload.result.links[0].download_url, "https://x/y.zip");
    }

    #[test]
    fn fresh_install_is_full_and_persists_reference_last() {
        let fx = Fixture::new();
        let alpha = id("alpha1");
        assert!(fx.updater().check(&alpha).unwrap().needs_update);

        let outcome = fx.updater().update(&alpha, false).unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                url: URL_A.to_string(),
                mode: OverwriteMode::Full
            }
        );
        let install = fx.registry.installation(&alpha);
        assert!(install.is_complete());
        assert_eq!(install.read_reference().unwrap(), URL_A);
        assert_eq!(
            fs::read_to_string(install.starter_path()).unwrap(),
            install.starter_script()
        );
        assert!(install.server_dir().join("config/default/permissions.json").is_file());
        assert_eq!(fx.codec.extractions(), vec![Vec::<String>::new()]);
        assert!(!fx.updater().check(&alpha).unwrap().needs_update);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for path in [install.executable_path(), install.starter_path()] {
                let mode = fs::metadata(path).unwrap().permissions().mode();
                assert_eq!(mode & 0o111, 0o111);
            }
        }
    }

    #[test]
    fn selective_update_keeps_operator_files() {
        let fx = Fixture::new();
        let alpha = id("alpha1");
        fx.updater().update(&alpha, false).unwrap();
        let install = fx.registry.installation(&alpha);
        fs::write(install.properties_path(), "server-port=19200\n").unwrap();

        fx.source.set_url(URL_B);
        assert!(fx.updater().check(&alpha).unwrap().needs_update);
        let outcome = fx.updater().update(&alpha, false).unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                url: URL_B.to_string(),
                mode: OverwriteMode::Selective
            }
        );
        assert_eq!(
            fs::read_to_string(install.properties_path()).unwrap(),
            "server-port=19200\n"
        );
        let excluded = fx.codec.extractions().pop().unwrap();
        assert!(excluded.contains(&"server.properties".to_string()));
        assert!(excluded.contains(&"permissions.json".to_string()));
        assert!(excluded.contains(&"config/".to_string()));
        assert!(excluded.contains(&"config/default/permissions.json".to_string()));
        assert!(!excluded.contains(&"bedrock_server".to_string()));
        assert_eq!(install.read_reference().unwrap(), URL_B);
    }

    #[test]
    fn current_installation_is_left_alone_unless_forced() {
        let fx = Fixture::new();
        let alpha = id("alpha1");
        fx.updater().update(&alpha, false).unwrap();
        assert_eq!(
            fx.updater().update(&alpha, false).unwrap(),
            UpdateOutcome::AlreadyCurrent {
                url: URL_A.to_string()
            }
        );
        assert_eq!(fx.source.downloads().len(), 1);
        fx.updater().update(&alpha, true).unwrap();
        assert_eq!(fx.source.downloads().len(), 2);
    }

    #[test]
    fn incomplete_installation_forces_reinstall() {
        let fx = Fixture::new();
        let alpha = id("alpha1");
        let install = fx.registry.installation(&alpha);
        populate(&install);
        install.write_reference(URL_A).unwrap();
        assert!(!fx.updater().check(&alpha).unwrap().needs_update);

        fs::remove_file(install.starter_path()).unwrap();
        assert!(fx.updater().check(&alpha).unwrap().needs_update);
        let outcome = fx.updater().update(&alpha, false).unwrap();
        assert!(matches!(
            outcome,
            UpdateOutcome::Applied {
                mode: OverwriteMode::Full,
                ..
            }
        ));
    }

    #[test]
    fn running_server_blocks_update_before_any_network_call() {
        let fx = Fixture::new();
        let alpha = id("alpha1");
        fx.sessions.create(&alpha, &args(["starter.sh"])).unwrap();
        assert!(matches!(
            fx.updater().update(&alpha, true),
            Err(UpdateError::ServerRunning { .. })
        ));
        assert_eq!(fx.source.link_requests(), 0);
        assert!(!fx.registry.installation(&alpha).folder().exists());
    }

    #[test]
    fn failed_download_keeps_previous_reference() {
        let fx = Fixture::new();
        let alpha = id("alpha1");
        fx.updater().update(&alpha, false).unwrap();
        fx.source.set_url(URL_B);
        fx.source.fail_downloads();
        assert!(matches!(
            fx.updater().update(&alpha, false),
            Err(UpdateError::DownloadFailed { .. })
        ));
        let install = fx.registry.installation(&alpha);
        assert_eq!(install.read_reference().unwrap(), URL_A);
    }

    #[test]
    fn archive_without_executable_is_rejected() {
        let fx = Fixture::new();
        fx.codec.remove_entry("bedrock_server");
        let alpha = id("alpha1");
        assert!(matches!(
            fx.updater().update(&alpha, false),
            Err(UpdateError::MissingExecutable { .. })
        ));
        assert_eq!(
            fx.registry.installation(&alpha).read_reference().unwrap(),
            ""
        );
    }

    #[test]
    fn links_timeout_is_distinct() {
        let fx = Fixture::new();
        fx.source.time_out_links();
        assert!(matches!(
            fx.updater().check(&id("alpha1")),
            Err(UpdateError::LinksTimeout { .. })
        ));
    }

    #[test]
    fn lan_visibility_does_not_block_update() {
        let fx = Fixture::new();
        let alpha = id("alpha1");
        fx.updater().update(&alpha, false).unwrap();
        let install = fx.registry.installation(&alpha);
        fs::write(
            install.properties_path(),
            "server-port=19132\nenable-lan-visibility=true\n",
        )
        .unwrap();
        assert!(fx.updater().update(&alpha, true).is_ok());
    }
}
