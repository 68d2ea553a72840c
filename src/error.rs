//! Error types for contained.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Security profile lookup and definition errors.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// The requested name is not a member of the registry.
    #[error("Docker profile {name:?} is invalid")]
    Unknown { name: String },

    /// The name is accepted by the registry but has no policy behind it.
    #[error("seccomp config not found for profile: {name:?}")]
    MissingPolicy { name: String },

    /// The policy document for a profile does not parse.
    #[error("seccomp config for profile {name:?} is invalid: {reason}")]
    InvalidPolicy { name: String, reason: String },
}

impl ProfileError {
    /// Configuration defects, as opposed to bad user input.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProfileError::Unknown { .. })
    }
}

/// Host port validation errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PortError {
    #[error("invalid port {value:?}")]
    Malformed { value: String },

    #[error("port not in range [{min}, {max}], given: {port}")]
    OutOfRange { port: u64, min: u16, max: u16 },
}

/// Per-request validation errors. None of these ever reach the engine.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Port(#[from] PortError),
}

/// Container engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to connect to engine at {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("{operation} failed for {target}: {reason}")]
    Operation {
        operation: &'static str,
        target: String,
        reason: String,
    },

    #[error("No such {what}")]
    NotFound { what: String },

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl EngineError {
    pub fn operation(
        operation: &'static str,
        target: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        EngineError::Operation {
            operation,
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors that abort session establishment. The Display text is what the
/// browser terminal shows.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("generating container info failed: {0}")]
    Request(#[from] RequestError),

    #[error("pulling {image} failed: {source}")]
    Pull {
        image: String,
        #[source]
        source: EngineError,
    },

    #[error("creating container failed: {0}")]
    Create(#[source] EngineError),

    #[error("attaching to container {container} failed: {source}")]
    Attach {
        container: String,
        #[source]
        source: EngineError,
    },

    #[error("starting container {container} failed: {source}")]
    Start {
        container: String,
        #[source]
        source: EngineError,
    },
}

/// Errors on the browser-facing channel.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A frame that does not decode as a relay message. The frame is skipped.
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    /// The channel itself failed or is closing.
    #[error("transport error: {0}")]
    Transport(String),
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server failed to start: {reason}")]
    StartupFailed { reason: String },
}
