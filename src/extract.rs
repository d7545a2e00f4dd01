//! Image extraction from hydrated post embeds.

use crate::model::{Embed, ImageView, Media, Post};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Accept a video's thumbnail as a still image.
    pub video_thumbnails: bool,
}

/// Image URLs carried by `post`, in embed order. Empty means "skip this post".
pub fn extract_images(post: &Post, opts: ExtractOptions) -> Vec<String> {
    match &post.embed {
        Some(Embed::Images { images }) => fullsize_urls(images),
        Some(Embed::RecordWithMedia { media }) => match media {
            Media::Images { images } => fullsize_urls(images),
            Media::Video { thumbnail } => video_thumbnail(thumbnail, opts),
            Media::Unknown => Vec::new(),
        },
        Some(Embed::Video { thumbnail }) => video_thumbnail(thumbnail, opts),
        Some(Embed::Unknown) | None => Vec::new(),
    }
}

fn fullsize_urls(images: &[ImageView]) -> Vec<String> {
    images
        .iter()
        .map(|img| img.fullsize.clone())
        .filter(|url| !url.is_empty())
        .collect()
}

fn video_thumbnail(thumbnail: &Option<String>, opts: ExtractOptions) -> Vec<String> {
    if !opts.video_thumbnails {
        return Vec::new();
    }
    thumbnail
        .iter()
        .filter(|url| !url.is_empty())
        .cloned()
        .collect()
}
