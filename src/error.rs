use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by backends and the manifest pipeline.
///
/// Operations a backend cannot perform are not errors; see
/// [`crate::backend::Outcome`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("{backend}: authentication failed: {message}")]
    Auth { backend: String, message: String },

    #[error("secret not found: path={path}, secret={secret}, version={version}")]
    NotFound {
        path: String,
        secret: String,
        version: String,
    },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("service responded {status}: {message}")]
    Service { status: u16, message: String },

    #[error("deadline exceeded during {operation}")]
    DeadlineExceeded { operation: &'static str },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to parse manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("{message}")]
    Manifest { message: String },
}

impl Error {
    pub fn auth(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn not_found(path: &str, secret: &str, version: &str) -> Self {
        Self::NotFound {
            path: path.to_string(),
            secret: secret.to_string(),
            version: version.to_string(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::transport(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::config(format!("invalid URL: {err}"))
    }
}
