use thiserror::Error;

/// Error code the tracking service uses for a revoked or unknown session key.
pub const SESSION_REVOKED_CODE: u32 = 9;

/// Error code returned by `auth.getSession` while the user has not yet
/// approved the request token.
pub const TOKEN_NOT_AUTHORIZED_CODE: u32 = 14;

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("API error {code}: {message}")]
    Api { code: u32, message: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ServiceError {
    pub fn code(&self) -> Option<u32> {
        match self {
            ServiceError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_session_revoked(&self) -> bool {
        self.code() == Some(SESSION_REVOKED_CODE)
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("user store unavailable: {0}")]
    Unavailable(String),
}

/// Terminal failures of a pairing attempt.
#[derive(Debug, Clone, Error)]
pub enum PairingError {
    #[error("the authorization link expired before it was approved")]
    Expired,

    #[error("pairing failed: {0}")]
    Failed(#[source] ServiceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Error)]
pub enum AccountError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
