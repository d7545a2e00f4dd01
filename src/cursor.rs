//! Backward pagination over search results down to the last-seen marker.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::bsky::{SearchApi, SearchQuery};
use crate::db::{keys, Store};
use crate::model::Post;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorOptions {
    pub hashtag: String,
    pub batch_size: u32,
    pub max_pages: u32,
}

/// Result of one scan. `posts` is oldest-first.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub posts: Vec<Post>,
    pub pages: u32,
    pub scanned: usize,
    pub marker_found: bool,
    /// The page bound was hit before the marker showed up; older posts were dropped.
    pub truncated: bool,
}

pub struct SearchCursor<'a> {
    api: &'a dyn SearchApi,
    store: &'a dyn Store,
    opts: &'a CursorOptions,
}

impl<'a> SearchCursor<'a> {
    pub fn new(api: &'a dyn SearchApi, store: &'a dyn Store, opts: &'a CursorOptions) -> Self {
        Self { api, store, opts }
    }

    pub async fn last_seen(&self) -> Result<Option<String>> {
        self.store.get(keys::CURSOR_LAST_SEEN).await
    }

    /// Record `uri` as the newest fully processed post.
    pub async fn advance(&self, uri: &str) -> Result<()> {
        self.store
            .set(keys::CURSOR_LAST_SEEN, uri)
            .await
            .context("failed to advance cursor marker")
    }

    #[instrument(skip_all)]
    pub async fn fetch_new_posts(&self) -> Result<FetchOutcome> {
        let marker = self.last_seen().await?;
        info!(
            last_seen = marker.as_deref().unwrap_or("none (first run)"),
            hashtag = %self.opts.hashtag,
            "searching"
        );

        let mut out = FetchOutcome::default();
        let mut cursor: Option<String> = None;

        while out.pages < self.opts.max_pages {
            out.pages += 1;
            debug!(page = out.pages, limit = self.opts.batch_size, "fetching page");
            let query =
                SearchQuery::latest(self.opts.hashtag.clone(), self.opts.batch_size, cursor.take());
            let page = self
                .api
                .search_posts(&query)
                .await
                .with_context(|| format!("search page {} failed", out.pages))?;

            if page.posts.is_empty() && page.skipped == 0 {
                debug!("no more posts found");
                break;
            }
            out.scanned += page.posts.len() + page.skipped;

            for post in page.posts {
                if marker.as_deref() == Some(post.uri.as_str()) {
                    info!(page = out.pages, "found last seen post");
                    out.marker_found = true;
                    break;
                }
                out.posts.push(post);
            }
            if out.marker_found {
                break;
            }

            let Some(next) = page.cursor else {
                debug!("no more pages available");
                break;
            };
            if marker.is_none() {
                info!("first run; processing only the latest page");
                break;
            }
            cursor = Some(next);
        }

        if marker.is_some() && !out.marker_found && out.pages >= self.opts.max_pages {
            out.truncated = true;
            warn!(
                max_pages = self.opts.max_pages,
                "reached page limit without finding last seen post; some posts may have been missed"
            );
        }

        out.posts.reverse();
        info!(
            new = out.posts.len(),
            scanned = out.scanned,
            pages = out.pages,
            "collected new posts"
        );
        Ok(out)
    }
}
