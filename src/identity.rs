use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MIN_NAME_LEN: usize = 4;
pub const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error(
        "invalid server name {name:?}: must be alphanumeric and {min}-{max} characters long",
        min = MIN_NAME_LEN,
        max = MAX_NAME_LEN
    )]
    Invalid { name: String },
}

/// Case-normalized server name. Every on-disk path and session name is
/// derived from it, so two inputs differing only in case map to the same
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ServerIdentity(String);

impl ServerIdentity {
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let name = raw.to_lowercase();
        if !is_valid_name(&name) {
            return Err(IdentityError::Invalid {
                name: raw.to_string(),
            });
        }
        Ok(Self(name))
    }

    /// Accepts only names already in normalized form. Directory scans use
    /// this so a folder like `MyWorld` is never mistaken for `myworld`.
    pub fn from_canonical(raw: &str) -> Option<Self> {
        if raw.to_lowercase() == raw && is_valid_name(raw) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_name(name: &str) -> bool {
    let len = name.chars().count();
    (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) && name.chars().all(|c| c.is_ascii_alphanumeric())
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_alphanumeric_names_in_range() {
        let id = ServerIdentity::parse("myworld").unwrap();
        assert_eq!(id.as_str(), "myworld");
        assert!(ServerIdentity::parse("abcd").is_ok());
        assert!(ServerIdentity::parse(&"a".repeat(32)).is_ok());
    }

    #[test]
    fn rejects_short_long_and_punctuated_names() {
        assert!(ServerIdentity::parse("ab").is_err());
        assert!(ServerIdentity::parse(&"a".repeat(33)).is_err());
        assert!(ServerIdentity::parse("my-world").is_err());
        assert!(ServerIdentity::parse("my world").is_err());
        assert!(ServerIdentity::parse("").is_err());
        assert!(ServerIdentity::parse("wörld1").is_err());
    }

    #[test]
    fn normalizes_case() {
        let upper = ServerIdentity::parse("MyWorld").unwrap();
        let lower = ServerIdentity::parse("myworld").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.to_string(), "myworld");
    }

    #[test]
    fn canonical_form_rejects_mixed_case() {
        assert!(ServerIdentity::from_canonical("MyWorld").is_none());
        assert!(ServerIdentity::from_canonical("myworld").is_some());
        assert!(ServerIdentity::from_canonical("my-world").is_none());
    }

    #[test]
    fn error_names_the_rejected_input() {
        let err = ServerIdentity::parse("ab").unwrap_err();
        assert!(err.to_string().contains("\"ab\""));
        assert!(err.to_string().contains("4-32"));
    }
}
