use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::util::validate_url;

#[derive(Debug, Error)]
pub enum FeedListError {
    #[error("Failed to read feed list '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reads the feed list file (one URL per line).
///
/// See [`parse_feed_list`] for the line rules.
pub async fn read_feed_list(path: &Path) -> Result<Vec<Url>, FeedListError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| FeedListError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let urls = parse_feed_list(&content);
    tracing::info!(path = %path.display(), feeds = urls.len(), "Loaded feed list");
    Ok(urls)
}

/// Parses feed list content.
///
/// Blank lines and `#` comments are skipped. Lines that are not valid
/// http(s) URLs are skipped with a warning. Repeated URLs are kept once, in
/// first-seen order.
pub fn parse_feed_list(content: &str) -> Vec<Url> {
    let mut urls: Vec<Url> = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim().trim_start_matches('\u{feff}').trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match validate_url(line) {
            Ok(url) => {
                if urls.contains(&url) {
                    tracing::debug!(url = %url, "Duplicate feed URL, ignoring");
                } else {
                    urls.push(url);
                }
            }
            Err(e) => {
                tracing::warn!(line = index + 1, value = %line, error = %e, "Skipping invalid feed URL");
            }
        }
    }

    urls
}
