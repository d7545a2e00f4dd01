//! Session continuity: resume a persisted session, fall back to a fresh login,
//! answer step-up challenges, and persist every rotated token pair.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, instrument, warn};

use crate::bsky::{AuthError, Authenticator, LoginRequest, SessionSink};
use crate::db::{keys, Store};
use crate::model::Session;

/// Long-lived account credentials supplied from configuration.
#[derive(Clone)]
pub struct Credentials {
    pub identifier: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

/// Out-of-band source for one-time step-up codes.
#[async_trait]
pub trait CodePrompt: Send + Sync {
    async fn one_time_code(&self, message: &str) -> Result<String, AuthError>;
}

/// Reads the code from the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinCodePrompt;

#[async_trait]
impl CodePrompt for StdinCodePrompt {
    async fn one_time_code(&self, message: &str) -> Result<String, AuthError> {
        if !std::io::stdin().is_terminal() {
            error!("step-up code required but stdin is not a terminal");
            return Err(AuthError::ChallengeRequired);
        }
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("{} ", message).as_bytes())
            .await
            .context("failed to write prompt")?;
        stdout.flush().await.context("failed to flush prompt")?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .context("failed to read code from stdin")?;
        let code = line.trim().to_string();
        if code.is_empty() {
            return Err(AuthError::ChallengeRequired);
        }
        Ok(code)
    }
}

/// Writes rotated sessions to the store as soon as the client reports them.
pub struct StoreSessionSink {
    store: Arc<dyn Store>,
    started_at: DateTime<Utc>,
}

impl StoreSessionSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            started_at: Utc::now(),
        }
    }
}

#[async_trait]
impl SessionSink for StoreSessionSink {
    async fn session_updated(&self, session: &Session) -> anyhow::Result<()> {
        save_session(self.store.as_ref(), session).await?;
        let uptime = Utc::now() - self.started_at;
        info!(
            handle = %session.handle,
            uptime_minutes = uptime.num_minutes(),
            "session updated & saved"
        );
        Ok(())
    }
}

async fn save_session(store: &dyn Store, session: &Session) -> anyhow::Result<()> {
    let blob = serde_json::to_string(session).context("failed to encode session")?;
    store
        .set(keys::SESSION_BLOB, &blob)
        .await
        .context("failed to persist session")
}

pub struct SessionManager {
    auth: Arc<dyn Authenticator>,
    store: Arc<dyn Store>,
    prompt: Arc<dyn CodePrompt>,
    credentials: Credentials,
}

impl SessionManager {
    pub fn new(
        auth: Arc<dyn Authenticator>,
        store: Arc<dyn Store>,
        prompt: Arc<dyn CodePrompt>,
        credentials: Credentials,
    ) -> Self {
        Self {
            auth,
            store,
            prompt,
            credentials,
        }
    }

    /// Returns the authenticated handle.
    #[instrument(skip_all, fields(identifier = %self.credentials.identifier))]
    pub async fn authenticate(&self) -> Result<String, AuthError> {
        info!("authenticating");
        if let Some(session) = self.try_resume().await? {
            return Ok(session.handle);
        }

        let session = self.login().await?;
        save_session(self.store.as_ref(), &session).await?;
        Ok(session.handle)
    }

    /// `Ok(None)` when there is nothing to resume or resumption failed; a
    /// failed blob is deleted so the next start goes straight to login.
    async fn try_resume(&self) -> Result<Option<Session>, AuthError> {
        let Some(blob) = self.store.get(keys::SESSION_BLOB).await? else {
            return Ok(None);
        };

        let resumed = match serde_json::from_str::<Session>(&blob) {
            Ok(saved) => {
                info!(handle = %saved.handle, "reusing saved session");
                self.auth.resume_session(saved).await
            }
            Err(err) => {
                warn!(%err, "saved session is unreadable");
                Err(AuthError::Storage(anyhow::anyhow!("unreadable session blob")))
            }
        };

        match resumed {
            Ok(session) => {
                save_session(self.store.as_ref(), &session).await?;
                Ok(Some(session))
            }
            Err(err) => {
                warn!(%err, "resume failed; discarding saved session");
                self.store.del(keys::SESSION_BLOB).await?;
                Ok(None)
            }
        }
    }

    async fn login(&self) -> Result<Session, AuthError> {
        let mut request = LoginRequest {
            identifier: self.credentials.identifier.clone(),
            password: self.credentials.password.clone(),
            auth_factor_token: None,
        };

        let outcome = match self.auth.create_session(&request).await {
            Err(AuthError::ChallengeRequired) => {
                info!("step-up challenge issued");
                let code = self
                    .prompt
                    .one_time_code("Enter the auth code sent to you via email:")
                    .await?;
                request.auth_factor_token = Some(code);
                self.auth.create_session(&request).await?
            }
            other => other?,
        };

        if let Some(remaining) = outcome.rate_limit_remaining {
            info!(remaining, "logins remain");
        }
        Ok(outcome.session)
    }
}
