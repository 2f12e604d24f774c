//! The sync pipeline: feeds in, Prom updates out.
//!
//! 1. Fetch and parse every feed (bounded concurrency, input order kept)
//! 2. Skip the push when no feed changed since the last successful run
//! 3. Drop duplicate codes across feeds (first occurrence wins)
//! 4. Turn offers into [`ProductUpdate`]s for the configured mode
//! 5. Send batches with bounded concurrency, or just log them on a dry run
//! 6. Summarize everything in a [`SyncReport`]
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use url::Url;

use crate::config::{ConfigError, Settings, UpdateMode};
use crate::feed::{self, FetchOptions, FetchResult, Offer};
use crate::prom::{PromClient, PromError, ProductUpdate};
use crate::state::SyncState;
use crate::util::RetryPolicy;

/// Errors that stop a run before any update is sent.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("No feed URLs to process")]
    NoFeeds,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error(transparent)]
    Prom(#[from] PromError),
}

/// Per-run switches that do not belong in [`Settings`].
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Push even when every feed fingerprint matches the stored state.
    pub force: bool,
    /// Overrides the retry schedule for both feed fetches and Prom calls.
    pub retry: Option<RetryPolicy>,
}

/// Offers turned into updates, ready for batching.
#[derive(Debug, Default, PartialEq)]
pub struct UpdatePlan {
    pub updates: Vec<ProductUpdate>,
    /// Offers dropped because an earlier offer had the same code.
    pub duplicates: usize,
    /// Offers with nothing to send in the current mode.
    pub skipped: usize,
}

/// Builds the update list from parsed feeds, in order.
///
/// Each code appears at most once in the result; later duplicates are
/// counted and dropped.
pub fn plan_updates<'a, I>(feeds: I, mode: UpdateMode) -> UpdatePlan
where
    I: IntoIterator<Item = &'a [Offer]>,
{
    let mut plan = UpdatePlan::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for offers in feeds {
        for offer in offers {
            if !seen.insert(offer.code.as_str()) {
                tracing::debug!(code = %offer.code, "Duplicate offer code, keeping first");
                plan.duplicates += 1;
                continue;
            }
            match ProductUpdate::from_offer(offer, mode) {
                Some(update) => plan.updates.push(update),
                None => plan.skipped += 1,
            }
        }
    }

    plan
}

/// Summary of one run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    pub dry_run: bool,
    pub feeds_total: usize,
    pub feeds_failed: usize,
    /// Feeds whose XML broke partway; their earlier offers were still used.
    pub feeds_partial: usize,
    /// Set when the push was skipped because no feed changed.
    pub unchanged: bool,
    pub offers_parsed: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub updates_planned: usize,
    pub batches_total: usize,
    pub batches_failed: usize,
    /// Items Prom accepted.
    pub updated: usize,
    /// Items Prom refused individually (e.g. unknown external id).
    pub rejected: usize,
    /// Items in batches that failed as a whole.
    pub failed: usize,
    /// Feed and batch failure messages.
    pub errors: Vec<String>,
}

impl SyncReport {
    /// A run succeeds when every feed was read and every batch was delivered.
    /// Individual rejections do not fail the run.
    pub fn is_success(&self) -> bool {
        self.feeds_failed == 0 && self.batches_failed == 0
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.dry_run { " (dry run)" } else { "" };
        writeln!(f, "Sync summary{}", mode)?;
        writeln!(
            f,
            "  feeds:    {} total, {} failed, {} partial",
            self.feeds_total, self.feeds_failed, self.feeds_partial
        )?;
        if self.unchanged {
            writeln!(f, "  no feed changed since the last run, nothing sent")?;
        }
        writeln!(
            f,
            "  offers:   {} parsed, {} duplicates, {} with nothing to send",
            self.offers_parsed, self.duplicates, self.skipped
        )?;
        if self.dry_run {
            writeln!(
                f,
                "  updates:  {} planned in {} batches, none sent",
                self.updates_planned, self.batches_total
            )?;
        } else {
            writeln!(
                f,
                "  updates:  {} planned, {} updated, {} rejected, {} failed ({}/{} batches failed)",
                self.updates_planned,
                self.updated,
                self.rejected,
                self.failed,
                self.batches_failed,
                self.batches_total
            )?;
        }
        for error in &self.errors {
            writeln!(f, "  error: {}", error)?;
        }
        Ok(())
    }
}

/// Runs the whole pipeline for the given feed URLs.
///
/// # Errors
///
/// - [`SyncError::NoFeeds`] when `feeds` is empty
/// - [`SyncError::Config`] when no token is set outside a dry run
///
/// Feed and batch failures are not errors; they are counted in the report.
pub async fn run(
    settings: &Settings,
    feeds: &[Url],
    options: &SyncOptions,
) -> Result<SyncReport, SyncError> {
    if feeds.is_empty() {
        return Err(SyncError::NoFeeds);
    }

    // Fail before downloading anything if we could never push
    let client = if settings.dry_run {
        None
    } else {
        settings.token()?;
        let mut client = PromClient::new(settings)?;
        if let Some(retry) = options.retry {
            client = client.with_retry(retry);
        }
        Some(client)
    };

    let mut report = SyncReport {
        dry_run: settings.dry_run,
        feeds_total: feeds.len(),
        ..Default::default()
    };

    let mut fetch_options = FetchOptions::new(
        settings.vendor_prefix.clone(),
        settings.http_timeout,
        settings.max_concurrent_requests,
    );
    if let Some(retry) = options.retry {
        fetch_options.retry = retry;
    }

    let http = feed::build_client(settings.http_timeout).map_err(SyncError::Client)?;
    let results = feed::fetch_all(&http, feeds, &fetch_options).await;

    let fetched = tally_fetches(&results, &mut report);

    let fingerprints: Vec<(&str, &str)> = fetched
        .iter()
        .map(|(url, feed)| (url.as_str(), feed.fingerprint.as_str()))
        .collect();

    let mut state = settings.state_file.as_deref().map(SyncState::load);

    if let Some(state) = &state {
        if !fingerprints.is_empty()
            && !state.has_changes(fingerprints.iter().copied())
            && !settings.dry_run
            && !options.force
        {
            tracing::info!(feeds = fingerprints.len(), "No feed changed since last run, skipping push");
            report.unchanged = true;
            return Ok(report);
        }
    }

    let plan = plan_updates(
        fetched.iter().map(|(_, feed)| feed.offers.as_slice()),
        settings.update_mode,
    );
    report.duplicates = plan.duplicates;
    report.skipped = plan.skipped;
    report.updates_planned = plan.updates.len();

    let batches: Vec<&[ProductUpdate]> = plan.updates.chunks(settings.batch_size).collect();
    report.batches_total = batches.len();

    tracing::info!(
        offers = report.offers_parsed,
        duplicates = report.duplicates,
        skipped = report.skipped,
        updates = report.updates_planned,
        batches = report.batches_total,
        mode = %settings.update_mode,
        "Update plan ready"
    );

    let Some(client) = client else {
        log_dry_run(&batches);
        return Ok(report);
    };

    let total = batches.len();
    let outcomes: Vec<_> = stream::iter(batches.iter().enumerate())
        .map(|(index, batch)| {
            let client = &client;
            async move {
                let outcome = client.update_products(batch).await;
                match &outcome {
                    Ok(o) => tracing::info!(
                        batch = index + 1,
                        total = total,
                        items = batch.len(),
                        updated = o.accepted,
                        rejected = o.rejected.len(),
                        "Batch sent"
                    ),
                    Err(e) => tracing::error!(
                        batch = index + 1,
                        total = total,
                        items = batch.len(),
                        error = %e,
                        "Batch failed"
                    ),
                }
                (index, batch.len(), outcome)
            }
        })
        .buffer_unordered(settings.max_concurrent_requests.max(1))
        .collect()
        .await;

    for (index, size, outcome) in outcomes {
        match outcome {
            Ok(o) => {
                report.updated += o.accepted;
                report.rejected += o.rejected.len();
            }
            Err(e) => {
                report.batches_failed += 1;
                report.failed += size;
                report.errors.push(format!("batch {}/{}: {}", index + 1, total, e));
            }
        }
    }

    // Only remember fingerprints once everything was delivered, so a failed
    // batch is retried on the next run even if the feeds stay the same
    if let (Some(path), Some(state)) = (settings.state_file.as_deref(), state.as_mut()) {
        if report.batches_failed == 0 && !fingerprints.is_empty() {
            let listed: Vec<&str> = feeds.iter().map(Url::as_str).collect();
            state.record(fingerprints.iter().copied(), &listed, Utc::now());
            if let Err(e) = state.save(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to save sync state");
            }
        }
    }

    Ok(report)
}

/// Splits fetch results into usable feeds and counts the rest.
fn tally_fetches<'a>(
    results: &'a [FetchResult],
    report: &mut SyncReport,
) -> Vec<(&'a Url, &'a feed::FetchedFeed)> {
    let mut fetched = Vec::with_capacity(results.len());
    for FetchResult { url, result } in results {
        match result {
            Ok(feed) => {
                report.offers_parsed += feed.offers.len();
                if let Some(e) = &feed.parse_error {
                    report.feeds_partial += 1;
                    report.errors.push(format!("{}: partial parse: {}", url, e));
                }
                fetched.push((url, feed));
            }
            Err(e) => {
                report.feeds_failed += 1;
                report.errors.push(format!("{}: {}", url, e));
            }
        }
    }
    fetched
}

/// Updates logged at `info` on a dry run; the rest go to `debug`.
const DRY_RUN_SAMPLE: usize = 20;

fn log_dry_run(batches: &[&[ProductUpdate]]) {
    let items = batches
        .iter()
        .enumerate()
        .flat_map(|(index, batch)| batch.iter().map(move |update| (index + 1, update)));

    let mut total = 0;
    for (batch, update) in items {
        if total < DRY_RUN_SAMPLE {
            tracing::info!(
                batch = batch,
                id = %update.id,
                price = ?update.price,
                quantity = ?update.quantity_in_stock,
                presence = ?update.presence,
                "Dry run: would update"
            );
        } else {
            tracing::debug!(
                batch = batch,
                id = %update.id,
                price = ?update.price,
                quantity = ?update.quantity_in_stock,
                presence = ?update.presence,
                "Dry run: would update"
            );
        }
        total += 1;
    }

    if total > DRY_RUN_SAMPLE {
        tracing::info!(
            shown = DRY_RUN_SAMPLE,
            remaining = total - DRY_RUN_SAMPLE,
            "Dry run: more updates at debug level"
        );
    }
    tracing::info!(batches = batches.len(), updates = total, "Dry run: nothing sent");
}
