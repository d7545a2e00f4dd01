use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("XRPC error (status {status}) {error}: {message}")]
    Api {
        status: u16,
        error: String,
        message: String,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("No active session")]
    NotAuthenticated,
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        UpstreamError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        UpstreamError::Parse(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Login attempts are being throttled; retrying prolongs the lockout.
    #[error("Login rate limit exceeded")]
    RateLimited,

    #[error("A one-time authentication code is required")]
    ChallengeRequired,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
