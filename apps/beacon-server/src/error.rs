use thiserror::Error;

/// Every failure the hub can report to a peer or observe from a collaborator.
///
/// None of these are fatal to the process. State-machine and validation
/// errors go back to the originating connection only, as an `error` frame.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Already authenticated")]
    AlreadyAuthenticated,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Username is already taken")]
    DuplicateUsername,

    #[error("Username must be at least {min} characters")]
    WeakUsername { min: usize },

    #[error("Password must be at least {min} characters")]
    WeakPassword { min: usize },

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    ExpiredToken,

    #[error("Unknown command type: {0}")]
    UnknownCommandType(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Storage unavailable: {0}")]
    PersistenceFailure(String),

    #[error("Delivery to {connection_id} failed: {reason}")]
    DeliveryFailure {
        connection_id: String,
        reason: &'static str,
    },

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Connection {0} is already registered")]
    DuplicateConnection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Stable wire code carried in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            HubError::AlreadyAuthenticated => "ALREADY_AUTHENTICATED",
            HubError::InvalidCredentials => "INVALID_CREDENTIALS",
            HubError::DuplicateUsername => "DUPLICATE_USERNAME",
            HubError::WeakUsername { .. } => "WEAK_USERNAME",
            HubError::WeakPassword { .. } => "WEAK_PASSWORD",
            HubError::InvalidToken => "INVALID_TOKEN",
            HubError::ExpiredToken => "EXPIRED_TOKEN",
            HubError::UnknownCommandType(_) => "UNKNOWN_COMMAND_TYPE",
            HubError::MalformedMessage(_) => "MALFORMED_MESSAGE",
            HubError::PersistenceFailure(_) => "PERSISTENCE_FAILURE",
            HubError::DeliveryFailure { .. } => "DELIVERY_FAILURE",
            HubError::ConnectionClosed => "CONNECTION_CLOSED",
            HubError::DuplicateConnection(_) => "DUPLICATE_CONNECTION",
            HubError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Text shown to the peer. Storage and internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            HubError::PersistenceFailure(_) => "Message could not be stored".to_string(),
            HubError::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<diesel::result::Error> for HubError {
    fn from(err: diesel::result::Error) -> Self {
        tracing::error!(?err, "database error");
        Self::PersistenceFailure(err.to_string())
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for HubError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        tracing::error!(?err, "pool error");
        Self::PersistenceFailure(err.to_string())
    }
}
