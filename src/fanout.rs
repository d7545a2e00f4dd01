//! Screening, image splitting and per-filter idempotent writes.

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::db::{keys, Store};
use crate::extract::{extract_images, ExtractOptions};
use crate::model::{image_uri, DoodleRecord, Filter, Post};

/// Post-level screening rules shared by every filter.
#[derive(Debug, Clone)]
pub struct IngestRules {
    hashtag: String,
    skip_markers: Option<Regex>,
    skip_labels: Vec<String>,
    extract: ExtractOptions,
}

/// Why a post was or was not considered for fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screening {
    MissingHashtag,
    SkipMarker,
    NoImages,
    Accepted(Vec<String>),
}

impl IngestRules {
    pub fn new(
        hashtag: &str,
        skip_tags: &[String],
        skip_labels: &[String],
        extract: ExtractOptions,
    ) -> Self {
        let alternation = skip_tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("|");
        let skip_markers = (!alternation.is_empty())
            .then(|| Regex::new(&format!("(?i)(?:{})", alternation)))
            .and_then(|r| r.ok());
        Self {
            hashtag: hashtag.to_lowercase(),
            skip_markers,
            skip_labels: skip_labels.to_vec(),
            extract,
        }
    }

    pub fn has_hashtag(&self, text: &str) -> bool {
        text.to_lowercase().contains(&self.hashtag)
    }

    pub fn is_skipped(&self, post: &Post) -> bool {
        if let Some(re) = &self.skip_markers {
            if re.is_match(&post.record.text) {
                return true;
            }
        }
        post.labels
            .iter()
            .any(|l| self.skip_labels.iter().any(|s| s == &l.val))
    }

    pub fn screen(&self, post: &Post) -> Screening {
        if !self.has_hashtag(&post.record.text) {
            return Screening::MissingHashtag;
        }
        if self.is_skipped(post) {
            return Screening::SkipMarker;
        }
        let urls = extract_images(post, self.extract);
        if urls.is_empty() {
            return Screening::NoImages;
        }
        Screening::Accepted(urls)
    }
}

pub struct FanoutEngine<'a> {
    store: &'a dyn Store,
    rules: &'a IngestRules,
}

impl<'a> FanoutEngine<'a> {
    pub fn new(store: &'a dyn Store, rules: &'a IngestRules) -> Self {
        Self { store, rules }
    }

    /// Write `post` to every matching filter. Returns the number of records
    /// written; redelivered images are no-ops.
    #[instrument(skip_all, fields(uri = %post.uri))]
    pub async fn process(&self, post: &Post, filters: &[Filter]) -> Result<usize> {
        let urls = match self.rules.screen(post) {
            Screening::Accepted(urls) => urls,
            other => {
                debug!(?other, "post screened out");
                return Ok(0);
            }
        };
        let Some(post_url) = post.web_url() else {
            warn!("post uri is not a well-formed at:// uri; skipping");
            return Ok(0);
        };

        let mut written = 0;
        for filter in filters {
            if !filter.accepts_author(&post.author.handle) {
                continue;
            }
            written += self.write_to_filter(post, &urls, &post_url, filter).await?;
        }
        Ok(written)
    }

    async fn write_to_filter(
        &self,
        post: &Post,
        urls: &[String],
        post_url: &str,
        filter: &Filter,
    ) -> Result<usize> {
        let records_key = keys::records(&filter.name);
        let dedup_key = keys::dedup(&filter.name);
        let mut written = 0;

        for (i, url) in urls.iter().enumerate() {
            let uri = image_uri(&post.uri, i);
            if self.store.is_member(&dedup_key, &uri).await? {
                continue;
            }
            let record = DoodleRecord {
                uri: uri.clone(),
                author_handle: post.author.handle.clone(),
                author_display_name: post.display_name().to_string(),
                text: post.record.text.clone(),
                image_urls: vec![url.clone()],
                created_at: post.record.created_at.clone(),
                post_url: post_url.to_string(),
            };
            let body = serde_json::to_string(&record).context("failed to encode record")?;
            self.store
                .push_with_member(&records_key, &body, &dedup_key, &uri)
                .await?;
            written += 1;
            info!(
                filter = %filter.name,
                image = i + 1,
                of = urls.len(),
                author = %post.author.handle,
                text = %preview(&post.record.text),
                "added doodle"
            );
        }

        self.store.add_member(&dedup_key, &post.uri).await?;
        Ok(written)
    }
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}
