use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{Post, Session};

/// Query for `app.bsky.feed.searchPosts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub q: String,
    pub limit: u32,
    pub sort: &'static str,
    pub cursor: Option<String>,
}

impl SearchQuery {
    pub fn latest(q: impl Into<String>, limit: u32, cursor: Option<String>) -> Self {
        Self {
            q: q.into(),
            limit,
            sort: "latest",
            cursor,
        }
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("q", self.q.clone()),
            ("limit", self.limit.to_string()),
            ("sort", self.sort.to_string()),
        ];
        if let Some(cursor) = &self.cursor {
            params.push(("cursor", cursor.clone()));
        }
        params
    }
}

/// One page of search results, newest first. `cursor: None` ends the results.
///
/// Posts are decoded one at a time; a post that does not fit the `Post` shape
/// is dropped with a warning and counted in `skipped` instead of failing the
/// whole page.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(from = "RawSearchPage")]
pub struct SearchPage {
    pub posts: Vec<Post>,
    pub cursor: Option<String>,
    pub skipped: usize,
}

#[derive(Deserialize)]
struct RawSearchPage {
    #[serde(default)]
    posts: Vec<serde_json::Value>,
    #[serde(default)]
    cursor: Option<String>,
}

impl From<RawSearchPage> for SearchPage {
    fn from(raw: RawSearchPage) -> Self {
        let mut page = SearchPage {
            posts: Vec::with_capacity(raw.posts.len()),
            cursor: raw.cursor,
            skipped: 0,
        };
        for value in raw.posts {
            let uri = value
                .get("uri")
                .and_then(|u| u.as_str())
                .unwrap_or("<missing uri>")
                .to_string();
            match serde_json::from_value::<Post>(value) {
                Ok(post) => page.posts.push(post),
                Err(err) => {
                    warn!(%uri, %err, "skipping unreadable post");
                    page.skipped += 1;
                }
            }
        }
        page
    }
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub identifier: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_factor_token: Option<String>,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("identifier", &self.identifier)
            .field("password", &"[REDACTED]")
            .field("auth_factor_token", &self.auth_factor_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub session: Session,
    /// `ratelimit-remaining` header of the login response, when present.
    pub rate_limit_remaining: Option<u32>,
}

/// Body of `createSession` / `refreshSession`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionResp {
    pub access_jwt: String,
    pub refresh_jwt: String,
    pub handle: String,
    pub did: String,
}

impl From<SessionResp> for Session {
    fn from(r: SessionResp) -> Self {
        Session {
            access_jwt: r.access_jwt,
            refresh_jwt: r.refresh_jwt,
            handle: r.handle,
            did: r.did,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct GetSessionResp {
    pub handle: String,
    pub did: String,
}

/// Standard XRPC error body.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct XrpcErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
