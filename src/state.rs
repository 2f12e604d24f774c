//! Feed fingerprints from the last successful push.
//!
//! Lets a scheduled run skip the marketplace entirely when no vendor feed
//! changed since the previous run.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to write state file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedFingerprint {
    pub fingerprint: String,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub feeds: BTreeMap<String, FeedFingerprint>,
}

impl SyncState {
    /// Loads the state file.
    ///
    /// A missing file is a first run. An unreadable or corrupt file is
    /// logged and treated as empty, which forces a full push.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No state file, treating all feeds as changed");
                return Self::default();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read state file, ignoring");
                return Self::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Corrupt state file, ignoring");
                Self::default()
            }
        }
    }

    /// True if any of the given `(url, fingerprint)` pairs differs from the
    /// stored one, or is new. An empty input has no changes.
    pub fn has_changes<'a, I>(&self, current: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        current.into_iter().any(|(url, fingerprint)| {
            self.feeds
                .get(url)
                .is_none_or(|stored| stored.fingerprint != fingerprint)
        })
    }

    /// Stores the given fingerprints and drops feeds no longer listed.
    pub fn record<'a, I>(&mut self, current: I, listed: &[&str], now: DateTime<Utc>)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (url, fingerprint) in current {
            self.feeds.insert(
                url.to_string(),
                FeedFingerprint {
                    fingerprint: fingerprint.to_string(),
                    checked_at: now,
                },
            );
        }
        self.feeds.retain(|url, _| listed.contains(&url.as_str()));
    }

    /// Writes the state atomically (temp file, fsync, rename).
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_vec_pretty(self)?;

        // Randomized temp name so a stale temp file never blocks the write
        let random_suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        let written = file.write_all(&content).and_then(|_| file.sync_all());
        drop(file);
        if let Err(e) = written {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }

        // On Windows, rename fails if destination exists
        #[cfg(windows)]
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        if let Err(e) = std::fs::rename(&temp_path, path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }

        tracing::debug!(path = %path.display(), feeds = self.feeds.len(), "State saved");
        Ok(())
    }
}
