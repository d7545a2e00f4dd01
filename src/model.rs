use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

static POST_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^at://(?P<repo>[^/]+)/(?P<collection>[^/]+)/(?P<rkey>[^/#?]+)$")
        .expect("valid at-uri pattern")
});

/// A post as returned by `app.bsky.feed.searchPosts` (`PostView`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub uri: String,
    pub author: Author,
    pub record: PostRecord,
    #[serde(default, deserialize_with = "lenient_embed")]
    pub embed: Option<Embed>,
    #[serde(default)]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub handle: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Label {
    pub val: String,
}

/// Hydrated embed views, keyed on `$type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "$type")]
pub enum Embed {
    #[serde(rename = "app.bsky.embed.images#view")]
    Images {
        #[serde(default)]
        images: Vec<ImageView>,
    },
    #[serde(rename = "app.bsky.embed.recordWithMedia#view")]
    RecordWithMedia { media: Media },
    #[serde(rename = "app.bsky.embed.video#view")]
    Video {
        #[serde(default)]
        thumbnail: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// The `media` half of a record-with-media embed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "$type")]
pub enum Media {
    #[serde(rename = "app.bsky.embed.images#view")]
    Images {
        #[serde(default)]
        images: Vec<ImageView>,
    },
    #[serde(rename = "app.bsky.embed.video#view")]
    Video {
        #[serde(default)]
        thumbnail: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageView {
    #[serde(default)]
    pub fullsize: String,
    #[serde(default)]
    pub thumb: Option<String>,
    #[serde(default)]
    pub alt: Option<String>,
}

/// An embed that does not match its declared `$type` carries no media.
fn lenient_embed<'de, D>(deserializer: D) -> Result<Option<Embed>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<serde_json::Value>::deserialize(deserializer)? else {
        return Ok(None);
    };
    match serde_json::from_value(raw) {
        Ok(embed) => Ok(Some(embed)),
        Err(err) => {
            warn!(%err, "unreadable embed; treating post as having no media");
            Ok(Some(Embed::Unknown))
        }
    }
}

impl Post {
    /// Record key (last path segment) of the post's `at://` URI.
    pub fn rkey(&self) -> Option<&str> {
        POST_URI
            .captures(&self.uri)
            .and_then(|c| c.name("rkey"))
            .map(|m| m.as_str())
    }

    /// Public web URL for the post, if the URI is well formed.
    pub fn web_url(&self) -> Option<String> {
        self.rkey().map(|rkey| {
            format!(
                "https://bsky.app/profile/{}/post/{}",
                self.author.handle, rkey
            )
        })
    }

    pub fn display_name(&self) -> &str {
        match self.author.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.author.handle,
        }
    }
}

/// The stored unit: one image of one post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DoodleRecord {
    pub uri: String,
    pub author_handle: String,
    pub author_display_name: String,
    pub text: String,
    pub image_urls: Vec<String>,
    pub created_at: String,
    pub post_url: String,
}

/// Image-scoped URI for image `index` of `post_uri`.
pub fn image_uri(post_uri: &str, index: usize) -> String {
    format!("{}#image{}", post_uri, index)
}

/// A named destination stream, optionally restricted to one author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub handle: Option<String>,
}

impl Filter {
    pub fn unbound(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: None,
        }
    }

    pub fn bound(name: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: Some(handle.into()),
        }
    }

    pub fn accepts_author(&self, handle: &str) -> bool {
        match &self.handle {
            None => true,
            Some(bound) => bound == handle,
        }
    }
}

/// Persisted credential blob.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_jwt: String,
    pub refresh_jwt: String,
    pub handle: String,
    pub did: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("did", &self.did)
            .finish_non_exhaustive()
    }
}
