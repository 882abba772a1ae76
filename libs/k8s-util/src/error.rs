use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1:?}")]
    KubeError(String, #[source] Box<kube::Error>),

    #[error("kube exec error: {0}")]
    KubeExecError(String),

    #[error("{0}")]
    MissingData(String),

    #[error("receive output error: {0}")]
    ReceiveOutput(String),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("{0}: {1}")]
    Utf8Error(String, #[source] std::string::FromUtf8Error),
}

impl Error {
    /// Wrap a kube error with a message describing the failed operation.
    pub fn kube(msg: impl Into<String>, e: kube::Error) -> Self {
        Error::KubeError(msg.into(), Box::new(e))
    }

    /// HTTP status code of the Kubernetes API response, when the error carries one.
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(_, e) => match e.as_ref() {
                kube::Error::Api(ae) => Some(ae.code),
                _ => None,
            },
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
