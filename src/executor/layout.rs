//! Target paths for downloaded files.

use crate::cache::{Artist, Post};
use std::path::PathBuf;

/// Longest title kept in a directory name, in characters
const MAX_TITLE_CHARS: usize = 80;

/// Decides where a file of a post lands, relative to the download root
pub trait PathLayout: Send + Sync {
    /// Relative target path for file `index` (named `name`) of `post`
    fn file_path(&self, artist: &Artist, post: &Post, index: usize, name: &str) -> PathBuf;
}

/// `{service}/{artist}/[{YYYY-MM-DD}] {title}/{index:02}_{name}`
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultLayout;

impl PathLayout for DefaultLayout {
    fn file_path(&self, artist: &Artist, post: &Post, index: usize, name: &str) -> PathBuf {
        let title: String = sanitize(&post.title).chars().take(MAX_TITLE_CHARS).collect();
        let post_dir = format!("[{}] {}", post.published.format("%Y-%m-%d"), title.trim());

        PathBuf::from(sanitize(&artist.service))
            .join(sanitize(artist.display_name()))
            .join(post_dir.trim())
            .join(format!("{:02}_{}", index, sanitize(name)))
    }
}

/// Replace characters that are invalid in path components on common filesystems
pub fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let cleaned = cleaned.trim().trim_end_matches('.');
    match cleaned {
        "" | "." | ".." => "_".to_string(),
        other => other.to_string(),
    }
}
