//! Pipeline orchestration.
//!
//! Coordinates the full run: fetch → extract → normalize → reconcile →
//! load, one (query, page) unit at a time. Queries of a source run
//! concurrently (bounded by `max_concurrency`); the pages of one query run
//! in order so its checkpoint only moves forward.
//!
//! | Failure | Handling |
//! |---------|----------|
//! | Fetch error (after the fetcher's own retries) | Recorded; the query stops at that page |
//! | Schema drift | Recorded with a snippet; the query stops at that page |
//! | Invalid value | Recorded; the record is skipped |
//! | Write conflict | Re-reconcile and retry, bounded by `conflict_retries` |
//! | Storage unavailable | Retried with backoff, then the run fails and cancels its workers |
//!
//! A page that extracts no candidates ends the query and resets its
//! checkpoint to page 1 for the next run.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rumah_harness_core::error::{ExtractError, FetchError, StorageError};
use rumah_harness_core::geocode::Geocoder;
use rumah_harness_core::loader::{LoadOutcome, Loader};
use rumah_harness_core::models::{
    now_millis, CandidateRecord, Checkpoint, Decision, NormalizedListing, RawDocument,
    RunSummary,
};
use rumah_harness_core::normalize::Normalizer;
use rumah_harness_core::reconcile::Reconciler;
use rumah_harness_core::store::ListingStore;

use crate::config::{Config, SourceConfig};
use crate::db;
use crate::extract::Extractor;
use crate::fetch::{Fetcher, HttpTransport, ReqwestTransport};
use crate::geocode;
use crate::migrate;
use crate::progress::{NoProgress, RunProgressEvent, RunProgressReporter};
use crate::retry::{retry_with_backoff, RetryDecision, RetryFailure, RetryPolicy};
use crate::sqlite_store::SqliteStore;

/// Run-level failures. Per-record failures go to the summary instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error("source '{source_id}' cannot be set up: {message}")]
    Setup { source_id: String, message: String },

    #[error("storage unavailable for source '{source_id}' after {attempts} attempts: {error}")]
    StorageUnavailable {
        source_id: String,
        attempts: u32,
        #[source]
        error: StorageError,
    },
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::UnknownSource(_) => "unknown_source",
            PipelineError::Setup { .. } => "setup",
            PipelineError::StorageUnavailable { .. } => "unavailable",
        }
    }
}

/// Runs sources end to end against one store.
pub struct Pipeline {
    config: Config,
    store: Arc<dyn ListingStore>,
    transport: Arc<dyn HttpTransport>,
    geocoder: Arc<dyn Geocoder>,
    progress: Arc<dyn RunProgressReporter>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: Arc<dyn ListingStore>,
        transport: Arc<dyn HttpTransport>,
        geocoder: Arc<dyn Geocoder>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            geocoder,
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }

    /// Production wiring: SQLite store, reqwest transport, configured geocoder.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::migrate_pool(&pool).await?;
        let store: Arc<dyn ListingStore> = Arc::new(SqliteStore::new(pool));
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(&config.fetch)?);
        let geocoder = geocode::from_config(&config.geocoding, &config.fetch)?;
        Ok(Self::new(config, store, transport, geocoder))
    }

    pub fn with_progress(mut self, progress: Arc<dyn RunProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    /// Token that stops every run of this pipeline when cancelled.
    ///
    /// In-flight fetches are abandoned and the current page is not
    /// checkpointed; runs return the counts gathered so far.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one source over `queries` (the source's defaults when empty).
    ///
    /// Listings whose source-reported date is before `since` are counted as
    /// skipped and not written.
    pub async fn run_pipeline(
        &self,
        source_id: &str,
        queries: &[String],
        since: Option<NaiveDate>,
    ) -> Result<RunSummary, PipelineError> {
        let source = self
            .config
            .sources
            .get(source_id)
            .ok_or_else(|| PipelineError::UnknownSource(source_id.to_string()))?;
        let queries = if queries.is_empty() {
            source.effective_queries()
        } else {
            queries.to_vec()
        };

        let run = self.source_run(source_id, source, since, queries.len() as u64)?;
        info!(
            source = source_id,
            queries = queries.len(),
            pages_per_run = source.pages_per_run,
            "run started"
        );

        let results: Vec<Result<RunSummary, PipelineError>> = stream::iter(queries)
            .map(|query| run.run_query(query))
            .buffer_unordered(source.max_concurrency)
            .collect()
            .await;

        let mut summary = RunSummary::new(source_id);
        for result in results {
            summary.merge(result?);
        }
        info!(
            source = source_id,
            records = summary.records_seen,
            new = summary.new,
            updated = summary.updated,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            errors = summary.errors.len(),
            "run finished"
        );
        Ok(summary)
    }

    /// Run every configured source concurrently.
    pub async fn run_all(
        &self,
        since: Option<NaiveDate>,
    ) -> Vec<(String, Result<RunSummary, PipelineError>)> {
        let runs = self.config.sources.keys().map(|id| async move {
            (id.clone(), self.run_pipeline(id, &[], since).await)
        });
        futures::future::join_all(runs).await
    }

    fn source_run(
        &self,
        source_id: &str,
        source: &SourceConfig,
        since: Option<NaiveDate>,
        queries: u64,
    ) -> Result<SourceRun, PipelineError> {
        let extractor =
            Extractor::for_source(source_id, source).map_err(|e| PipelineError::Setup {
                source_id: source_id.to_string(),
                message: e.to_string(),
            })?;
        let fetch = &self.config.fetch;
        let fetcher = Fetcher::new(
            source_id,
            self.transport.clone(),
            self.store.clone(),
            RetryPolicy::new(
                fetch.max_attempts,
                Duration::from_millis(fetch.base_delay_ms),
                Duration::from_millis(fetch.max_delay_ms),
            ),
            Duration::from_millis(source.min_interval_ms),
        );
        let normalizer = Normalizer::new(
            self.config.normalize.rules(),
            source.effective_field_map(),
            source.locale,
            self.geocoder.clone(),
        );
        let pipeline = &self.config.pipeline;
        let backoff = Duration::from_millis(pipeline.storage_backoff_ms);

        Ok(SourceRun {
            id: source_id.to_string(),
            pages_per_run: source.pages_per_run,
            follow_details: source.follow_details,
            since,
            extractor,
            fetcher,
            normalizer,
            reconciler: Reconciler::new(self.config.reconcile.clone(), self.store.clone()),
            loader: Loader::new(self.store.clone(), self.config.reconcile.fingerprint.clone()),
            store: self.store.clone(),
            storage_policy: RetryPolicy::new(
                pipeline.storage_attempts,
                backoff,
                backoff.saturating_mul(16),
            ),
            conflict_policy: RetryPolicy::new(
                pipeline.conflict_retries.saturating_add(1),
                Duration::from_millis(5),
                Duration::from_millis(100),
            ),
            progress: self.progress.clone(),
            cancel: self.cancel.child_token(),
            pages_total: queries * u64::from(source.pages_per_run),
            pages_done: AtomicU64::new(0),
            records_done: AtomicU64::new(0),
        })
    }
}

enum PageOutcome {
    /// Every record was handled; the checkpoint advances.
    Complete,
    /// No candidates; the query is exhausted.
    Exhausted,
    /// The page could not be fetched or parsed.
    Failed,
    /// Cancelled before the page finished.
    Interrupted,
}

/// Per-source state for one run.
struct SourceRun {
    id: String,
    pages_per_run: u32,
    follow_details: bool,
    since: Option<NaiveDate>,
    extractor: Extractor,
    fetcher: Fetcher,
    normalizer: Normalizer,
    reconciler: Reconciler,
    loader: Loader,
    store: Arc<dyn ListingStore>,
    storage_policy: RetryPolicy,
    conflict_policy: RetryPolicy,
    progress: Arc<dyn RunProgressReporter>,
    cancel: CancellationToken,
    pages_total: u64,
    pages_done: AtomicU64,
    records_done: AtomicU64,
}

/// Retry a storage call while the backend reports `Unavailable`.
async fn with_storage_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: F,
) -> Result<T, RetryFailure<StorageError>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    retry_with_backoff(policy, op, |e: &StorageError| match e {
        StorageError::Unavailable(_) => RetryDecision::Retry,
        StorageError::Conflict { .. } => RetryDecision::GiveUp,
    })
    .await
}

impl SourceRun {
    /// Fail the run and stop its other workers.
    fn abort(&self, failure: RetryFailure<StorageError>) -> PipelineError {
        let (attempts, error) = match failure {
            RetryFailure::Permanent(e) => (1, e),
            RetryFailure::Exhausted { attempts, last } => (attempts, last),
        };
        warn!(source = %self.id, attempts, error = %error, "storage unavailable, cancelling run");
        self.cancel.cancel();
        PipelineError::StorageUnavailable {
            source_id: self.id.clone(),
            attempts,
            error,
        }
    }

    /// Fetch raced against cancellation. `None` when cancelled.
    async fn fetch(&self, url: &str) -> Option<Result<RawDocument, FetchError>> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = self.fetcher.fetch(url) => Some(result),
        }
    }

    async fn run_query(&self, query: String) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::new(&self.id);
        let start = with_storage_retry(&self.storage_policy, |_| {
            self.store.checkpoint(&self.id, &query)
        })
        .await
        .map_err(|f| self.abort(f))?
        .map(|cp| cp.next_page.max(1))
        .unwrap_or(1);

        for page in start..start.saturating_add(self.pages_per_run) {
            if self.cancel.is_cancelled() {
                break;
            }
            let outcome = self.run_page(&query, page, &mut summary).await?;
            self.progress.report(RunProgressEvent::Processed {
                source: self.id.clone(),
                done: self.pages_done.fetch_add(1, Ordering::Relaxed) + 1,
                total: self.pages_total,
                records: self.records_done.load(Ordering::Relaxed),
            });
            match outcome {
                PageOutcome::Complete => self.save_checkpoint(&query, page + 1).await?,
                PageOutcome::Exhausted => {
                    info!(source = %self.id, query = %query, page, "no more results, checkpoint reset");
                    self.save_checkpoint(&query, 1).await?;
                    break;
                }
                PageOutcome::Failed | PageOutcome::Interrupted => break,
            }
        }
        Ok(summary)
    }

    async fn save_checkpoint(&self, query: &str, next_page: u32) -> Result<(), PipelineError> {
        let checkpoint = Checkpoint {
            source_id: self.id.clone(),
            query: query.to_string(),
            next_page,
            updated_at: now_millis(),
        };
        with_storage_retry(&self.storage_policy, |_| {
            self.store.set_checkpoint(&checkpoint)
        })
        .await
        .map_err(|f| self.abort(f))
    }

    async fn run_page(
        &self,
        query: &str,
        page: u32,
        summary: &mut RunSummary,
    ) -> Result<PageOutcome, PipelineError> {
        let url = self.extractor.page_url(query, page);
        self.progress.report(RunProgressEvent::Fetching {
            source: self.id.clone(),
            query: query.to_string(),
            page,
        });

        let doc = match self.fetch(&url).await {
            None => return Ok(PageOutcome::Interrupted),
            Some(Ok(doc)) => doc,
            Some(Err(FetchError::Archive(e))) => {
                return Err(self.abort(RetryFailure::Permanent(e)))
            }
            Some(Err(e)) => {
                summary.record_error(e.kind(), format!("{}: {}", url, e));
                return Ok(PageOutcome::Failed);
            }
        };

        let candidates = match self.extractor.extract(&doc) {
            Ok(candidates) => candidates,
            Err(e) => {
                let ExtractError::SchemaDrift {
                    anchor, snippet, ..
                } = &e;
                warn!(source = %self.id, url = %url, anchor = %anchor, snippet = %snippet, "schema drift");
                summary.record_error(e.kind(), format!("{}: missing {}", url, anchor));
                return Ok(PageOutcome::Failed);
            }
        };
        if candidates.is_empty() {
            return Ok(PageOutcome::Exhausted);
        }

        let count = candidates.len() as u64;
        for (i, mut candidate) in candidates.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(PageOutcome::Interrupted);
            }
            summary.records_seen += 1;
            let context = match candidate.get("listing_id") {
                Some(id) => format!("{} #{} ({})", url, i + 1, id),
                None => format!("{} #{}", url, i + 1),
            };

            if self.follow_details && !self.enrich(&mut candidate).await? {
                return Ok(PageOutcome::Interrupted);
            }

            let listing = match self.normalizer.normalize(&candidate).await {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(source = %self.id, record = %context, error = %e, "record skipped");
                    summary.record_error(e.kind(), format!("{}: {}", context, e));
                    continue;
                }
            };

            if let (Some(since), Some(listed_at)) = (self.since, listing.listed_at) {
                if listed_at < since {
                    debug!(record = %context, %listed_at, "older than --since, skipped");
                    summary.skipped += 1;
                    continue;
                }
            }

            match self.reconcile_and_load(&listing).await {
                Ok((decision, LoadOutcome::Applied(_))) => {
                    debug!(record = %context, decision = decision.label(), "record loaded");
                    summary.record_decision(&decision);
                }
                Ok((_, LoadOutcome::Unchanged(_))) => {
                    debug!(record = %context, "observation already applied");
                    summary.duplicates += 1;
                }
                Err(RetryFailure::Permanent(e @ StorageError::Conflict { .. })) => {
                    warn!(source = %self.id, record = %context, error = %e, "conflict retries exhausted");
                    summary.record_error(e.kind(), format!("{}: {}", context, e));
                }
                Err(failure) => return Err(self.abort(failure)),
            }
        }

        self.records_done.fetch_add(count, Ordering::Relaxed);
        info!(source = %self.id, query = %query, page, records = count, "page processed");
        Ok(PageOutcome::Complete)
    }

    /// Merge the candidate's detail page. Returns `false` when cancelled.
    ///
    /// A failed detail fetch keeps the card-level fields.
    async fn enrich(&self, candidate: &mut CandidateRecord) -> Result<bool, PipelineError> {
        let Some(url) = self.extractor.detail_url(candidate).map(str::to_string) else {
            return Ok(true);
        };
        match self.fetch(&url).await {
            None => Ok(false),
            Some(Ok(detail)) => {
                if let Err(e) = self.extractor.merge_detail(candidate, &detail) {
                    warn!(source = %self.id, url = %url, error = %e, "detail page not parsed, keeping card fields");
                }
                Ok(true)
            }
            Some(Err(FetchError::Archive(e))) => Err(self.abort(RetryFailure::Permanent(e))),
            Some(Err(e)) => {
                warn!(source = %self.id, url = %url, error = %e, "detail fetch failed, keeping card fields");
                Ok(true)
            }
        }
    }

    /// Reconcile then write, re-reconciling after a lost compare-and-set.
    async fn reconcile_and_load(
        &self,
        listing: &NormalizedListing,
    ) -> Result<(Decision, LoadOutcome), RetryFailure<StorageError>> {
        let storage = &self.storage_policy;
        let result = retry_with_backoff(
            &self.conflict_policy,
            |attempt| async move {
                if attempt > 1 {
                    debug!(
                        source_listing_id = %listing.source_listing_id,
                        attempt,
                        "re-reconciling after conflict"
                    );
                }
                let decision =
                    with_storage_retry(storage, |_| self.reconciler.reconcile(listing)).await?;
                let outcome =
                    with_storage_retry(storage, |_| self.loader.upsert(listing, &decision))
                        .await?;
                Ok((decision, outcome))
            },
            |failure: &RetryFailure<StorageError>| match failure {
                RetryFailure::Permanent(StorageError::Conflict { .. }) => RetryDecision::Retry,
                _ => RetryDecision::GiveUp,
            },
        )
        .await;

        match result {
            Ok(loaded) => Ok(loaded),
            Err(RetryFailure::Permanent(inner)) => Err(inner),
            Err(RetryFailure::Exhausted { last, .. }) => Err(last),
        }
    }
}
