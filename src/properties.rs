//! Reads and edits `server.properties`, the managed server's own
//! `key=value` configuration file.
//!
//! Parsing is permissive: blank lines and `#` comments are ignored, and a
//! line without `=` is skipped instead of failing the whole read. Edits
//! rewrite only the affected line so comments and ordering survive.

use crate::fsutil::write_atomic_text_file_preserving_mode;
use crate::identity::ServerIdentity;
use crate::registry::ServerRegistry;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

pub const SERVER_PORT: &str = "server-port";
pub const SERVER_PORT_V6: &str = "server-port-v6";
pub const LAN_VISIBILITY: &str = "enable-lan-visibility";

pub const MIN_PORT: i64 = 1024;
pub const MAX_PORT: i64 = 65535;

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("server configuration not found: {}", path.display())]
    ConfigMissing { path: PathBuf },
    #[error("{key} not found in server.properties")]
    ConfigKeyMissing { key: String },
    #[error("{key} in server.properties is not an integer: {value:?}")]
    ConfigTypeError { key: String, value: String },
    #[error("{key} in server.properties is out of range ({min}-{max}): {value}", min = MIN_PORT, max = MAX_PORT)]
    ConfigRangeError { key: String, value: i64 },
    #[error("invalid property {key:?}: {reason}")]
    InvalidEntry { key: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFamily {
    V4,
    V6,
}

impl PortFamily {
    pub fn key(self) -> &'static str {
        match self {
            Self::V4 => SERVER_PORT,
            Self::V6 => SERVER_PORT_V6,
        }
    }
}

/// Parsed view of a `server.properties` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerProperties {
    entries: BTreeMap<String, String>,
}

impl ServerProperties {
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                debug!(line = %line, "skipping malformed server.properties line");
                continue;
            };
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn port(&self, family: PortFamily) -> Result<u16, PropertyError> {
        let key = family.key();
        let raw = self
            .get(key)
            .ok_or_else(|| PropertyError::ConfigKeyMissing {
                key: key.to_string(),
            })?;
        let value: i64 = raw.parse().map_err(|_| PropertyError::ConfigTypeError {
            key: key.to_string(),
            value: raw.to_string(),
        })?;
        if !(MIN_PORT..=MAX_PORT).contains(&value) {
            return Err(PropertyError::ConfigRangeError {
                key: key.to_string(),
                value,
            });
        }
        u16::try_from(value).map_err(|_| PropertyError::ConfigRangeError {
            key: key.to_string(),
            value,
        })
    }

    /// `true` only for the literal string `true`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }
}

/// Per-call access to each identity's `server.properties`. Nothing is
/// cached between calls, so properties of different identities can never
/// bleed into each other.
#[derive(Debug, Clone)]
pub struct PropertyStore {
    registry: ServerRegistry,
}

impl PropertyStore {
    pub fn new(registry: ServerRegistry) -> Self {
        Self { registry }
    }

    pub fn read(&self, identity: &ServerIdentity) -> Result<ServerProperties, PropertyError> {
        let path = self.registry.installation(identity).properties_path();
        match fs::read_to_string(&path) {
            Ok(text) => Ok(ServerProperties::parse(&text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(PropertyError::ConfigMissing { path })
            }
            Err(err) => Err(PropertyError::Io(err)),
        }
    }

    pub fn get_port(
        &self,
        identity: &ServerIdentity,
        family: PortFamily,
    ) -> Result<u16, PropertyError> {
        self.read(identity)?.port(family)
    }

    /// Sets `key` to `value`, replacing every existing assignment of the key
    /// in place or appending a new line when absent.
    pub fn set(
        &self,
        identity: &ServerIdentity,
        key: &str,
        value: &str,
    ) -> Result<(), PropertyError> {
        validate_entry(key, value)?;
        let path = self.registry.installation(identity).properties_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PropertyError::ConfigMissing { path })
            }
            Err(err) => return Err(PropertyError::Io(err)),
        };
        let updated = rewrite_entry(&text, key, value);
        write_atomic_text_file_preserving_mode(&path, &updated, 0o644)?;
        debug!(server = %identity, key, "updated server.properties");
        Ok(())
    }
}

fn validate_entry(key: &str, value: &str) -> Result<(), PropertyError> {
    let invalid = |reason: &str| PropertyError::InvalidEntry {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if key.is_empty() || key != key.trim() {
        return Err(invalid("key must be non-empty without surrounding whitespace"));
    }
    if key.starts_with('#') || key.contains('=') {
        return Err(invalid("key must not start with '#' or contain '='"));
    }
    if key.contains(['\n', '\r']) || value.contains(['\n', '\r']) {
        return Err(invalid("line breaks are not allowed"));
    }
    if value != value.trim() {
        return Err(invalid("value must not have surrounding whitespace"));
    }
    Ok(())
}

fn rewrite_entry(text: &str, key: &str, value: &str) -> String {
    let replacement = format!("{key}={value}");
    let mut found = false;
    let mut lines: Vec<String> = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        let matches = !line.starts_with('#')
            && line
                .split_once('=')
                .map(|(k, _)| k.trim() == key)
                .unwrap_or(false);
        if matches {
            found = true;
            lines.push(replacement.clone());
        } else {
            lines.push(raw.to_string());
        }
    }
    if !found {
        lines.push(replacement);
    }
    let mut out = lines.join("\n");
    if text.ends_with('\n') || !found {
        out.push('\n');
    }
    out
}
