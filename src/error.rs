use crate::identity::IdentityError;
use crate::lifecycle::LifecycleError;
use crate::properties::PropertyError;
use crate::session::SessionError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BswError {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
}
