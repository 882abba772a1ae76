use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    ClusterError(#[from] orkestra_k8s_util::error::Error),

    #[error("helm {command} failed: {message}")]
    HelmError { command: String, message: String },

    #[error("prerequisite not found: {tool} - {hint}")]
    PrerequisiteNotFound { tool: String, hint: String },

    #[error("{0}: {1}")]
    IoError(String, #[source] std::io::Error),

    #[error("{0}: {1}")]
    YamlError(String, #[source] serde_yaml::Error),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("{0}: {1}")]
    PkiError(String, #[source] openssl::error::ErrorStack),

    #[error("{0}: {1}")]
    UrlParseError(String, #[source] url::ParseError),

    #[error("invalid deployment target: {0}")]
    InvalidTarget(String),

    #[error("{resource} not ready after {attempts} attempts")]
    ReadinessTimeout { resource: String, attempts: u32 },

    #[error("install lock {name} is held by {holder}")]
    LockHeld { name: String, holder: String },

    #[error("install lock {name} was lost, now held by {holder}")]
    LockLost { name: String, holder: String },

    #[error("admin bootstrap returned an unrecognized result: {0}")]
    AmbiguousBootstrap(String),

    #[error("{0}")]
    MissingData(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn io(msg: impl Into<String>, e: std::io::Error) -> Self {
        Error::IoError(msg.into(), e)
    }

    pub fn pki(msg: impl Into<String>, e: openssl::error::ErrorStack) -> Self {
        Error::PkiError(msg.into(), e)
    }
}
