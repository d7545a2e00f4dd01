use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::model::Session;

pub mod error;
pub mod model;

pub use error::{AuthError, UpstreamError};
pub use model::{LoginOutcome, LoginRequest, SearchPage, SearchQuery};

use model::{GetSessionResp, SessionResp, XrpcErrorBody};

pub const DEFAULT_SERVICE: &str = "https://bsky.social/";

/// Login and session resumption against the upstream account service.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Re-activate a persisted session, refreshing its tokens if they expired.
    async fn resume_session(&self, saved: Session) -> Result<Session, AuthError>;

    async fn create_session(&self, login: &LoginRequest) -> Result<LoginOutcome, AuthError>;
}

#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn search_posts(&self, query: &SearchQuery) -> Result<SearchPage, UpstreamError>;
}

/// Receives every session the client starts using after a token rotation.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn session_updated(&self, session: &Session) -> anyhow::Result<()>;
}

pub struct BlueskyClient {
    http: Client,
    base_url: Url,
    session: RwLock<Option<Session>>,
    sink: Option<Arc<dyn SessionSink>>,
}

impl fmt::Debug for BlueskyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlueskyClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Non-success XRPC response, kept whole so callers can classify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct XrpcFailure {
    pub status: u16,
    pub error: String,
    pub message: String,
}

impl XrpcFailure {
    async fn from_response(res: Response) -> Self {
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        Self::from_body(status, &body)
    }

    fn from_body(status: u16, body: &str) -> Self {
        let parsed: XrpcErrorBody = serde_json::from_str(body).unwrap_or_default();
        Self {
            status,
            error: parsed.error.unwrap_or_default(),
            message: parsed.message.unwrap_or_else(|| body.to_string()),
        }
    }

    fn is_expired_token(&self) -> bool {
        (self.status == 400 || self.status == 401) && self.error == "ExpiredToken"
    }

    fn into_login_error(self) -> AuthError {
        if self.status == StatusCode::TOO_MANY_REQUESTS.as_u16() || self.error == "RateLimitExceeded" {
            return AuthError::RateLimited;
        }
        if self.status == StatusCode::UNAUTHORIZED.as_u16() {
            if self.error == "AuthFactorTokenRequired" {
                return AuthError::ChallengeRequired;
            }
            return AuthError::InvalidCredentials(self.message);
        }
        AuthError::Upstream(self.into())
    }
}

impl From<XrpcFailure> for UpstreamError {
    fn from(f: XrpcFailure) -> Self {
        UpstreamError::Api {
            status: f.status,
            error: f.error,
            message: f.message,
        }
    }
}

impl BlueskyClient {
    pub fn new(service: &str) -> anyhow::Result<Self> {
        // `Url::join` drops the last path segment unless it ends with '/'.
        let normalized = format!("{}/", service.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .with_context(|| format!("invalid service URL {}", service))?;
        let http = Client::builder()
            .user_agent("doodle-listener/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            session: RwLock::new(None),
            sink: None,
        })
    }

    pub fn with_session_sink(mut self, sink: Arc<dyn SessionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn endpoint(&self, nsid: &str) -> Result<Url, UpstreamError> {
        self.base_url
            .join(&format!("xrpc/{}", nsid))
            .map_err(|e| UpstreamError::Parse(format!("invalid endpoint {}: {}", nsid, e)))
    }

    pub fn build_search_request(
        &self,
        query: &SearchQuery,
        access_jwt: &str,
    ) -> Result<reqwest::Request, UpstreamError> {
        let request = self
            .http
            .get(self.endpoint("app.bsky.feed.searchPosts")?)
            .bearer_auth(access_jwt)
            .query(&query.params())
            .build()?;
        Ok(request)
    }

    async fn access_jwt(&self) -> Result<String, UpstreamError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_jwt.clone())
            .ok_or(UpstreamError::NotAuthenticated)
    }

    async fn install_session(&self, session: Session) {
        *self.session.write().await = Some(session);
    }

    async fn current_session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    /// Exchange the refresh token for a new token pair and hand it to the sink.
    async fn refresh_session(&self) -> Result<Session, UpstreamError> {
        let refresh_jwt = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.refresh_jwt.clone())
            .ok_or(UpstreamError::NotAuthenticated)?;

        let res = self
            .http
            .post(self.endpoint("com.atproto.server.refreshSession")?)
            .bearer_auth(refresh_jwt)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(XrpcFailure::from_response(res).await.into());
        }
        let body = res.text().await?;
        let session: Session = serde_json::from_str::<SessionResp>(&body)?.into();
        self.install_session(session.clone()).await;
        debug!(handle = %session.handle, "session tokens rotated");

        if let Some(sink) = &self.sink {
            if let Err(err) = sink.session_updated(&session).await {
                error!(?err, "failed to persist rotated session");
            }
        }
        Ok(session)
    }

    /// Authenticated GET that rotates an expired access token once and retries.
    async fn authed_get<T: DeserializeOwned>(
        &self,
        nsid: &str,
        build: impl Fn(&str) -> Result<reqwest::Request, UpstreamError>,
    ) -> Result<T, UpstreamError> {
        let mut refreshed = false;
        loop {
            let token = self.access_jwt().await?;
            let request = build(&token)?;
            debug!(url = %request.url(), "xrpc request");
            let res = self.http.execute(request).await?;
            if res.status().is_success() {
                let body = res.text().await?;
                return serde_json::from_str(&body)
                    .map_err(|e| UpstreamError::Parse(format!("{}: {}", nsid, e)));
            }
            let failure = XrpcFailure::from_response(res).await;
            if failure.is_expired_token() && !refreshed {
                refreshed = true;
                self.refresh_session().await?;
                continue;
            }
            return Err(failure.into());
        }
    }
}

#[async_trait]
impl Authenticator for BlueskyClient {
    async fn resume_session(&self, saved: Session) -> Result<Session, AuthError> {
        self.install_session(saved).await;
        let endpoint = self.endpoint("com.atproto.server.getSession")?;
        let outcome: Result<GetSessionResp, UpstreamError> = self
            .authed_get("com.atproto.server.getSession", |token| {
                Ok(self.http.get(endpoint.clone()).bearer_auth(token).build()?)
            })
            .await;

        match outcome {
            Ok(info) => {
                let mut session = self
                    .current_session()
                    .await
                    .ok_or(UpstreamError::NotAuthenticated)?;
                session.handle = info.handle;
                session.did = info.did;
                self.install_session(session.clone()).await;
                Ok(session)
            }
            Err(err) => {
                *self.session.write().await = None;
                Err(err.into())
            }
        }
    }

    async fn create_session(&self, login: &LoginRequest) -> Result<LoginOutcome, AuthError> {
        let res = self
            .http
            .post(self.endpoint("com.atproto.server.createSession")?)
            .json(login)
            .send()
            .await
            .map_err(UpstreamError::from)?;

        if !res.status().is_success() {
            return Err(XrpcFailure::from_response(res).await.into_login_error());
        }

        let rate_limit_remaining = res
            .headers()
            .get("ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok());
        let body = res.text().await.map_err(UpstreamError::from)?;
        let session: Session = serde_json::from_str::<SessionResp>(&body)
            .map_err(UpstreamError::from)?
            .into();
        self.install_session(session.clone()).await;
        info!(handle = %session.handle, "created new session");

        Ok(LoginOutcome {
            session,
            rate_limit_remaining,
        })
    }
}

#[async_trait]
impl SearchApi for BlueskyClient {
    async fn search_posts(&self, query: &SearchQuery) -> Result<SearchPage, UpstreamError> {
        self.authed_get("app.bsky.feed.searchPosts", |token| {
            self.build_search_request(query, token)
        })
        .await
    }
}
