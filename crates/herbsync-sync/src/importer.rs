//! Progressive, resumable per-provider import.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herbsync_adapters::{
    is_candidate, map_record, AdapterError, FetchedPage, FilterDecision, MappingError,
    ProviderRecord, RecordSource,
};
use herbsync_core::{
    CheckpointEvent, ImportCheckpoint, ImportRunLog, RunCounts, TransitionError,
};
use herbsync_storage::{CatalogStore, CheckpointStore, RunLogStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::{DedupEngine, ResolveOutcome};

pub const DEFAULT_PAGES_PER_RUN: u32 = 3;
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Processed at least one page without reaching the end of the catalog.
    Advanced,
    CatalogExhausted,
    AlreadyComplete,
    Aborted { page: Option<u32>, reason: String },
    SkippedDisabled,
    SkippedConfiguration { reason: String },
    SkippedBusy,
}

impl RunOutcome {
    /// Short form stored on the run log.
    pub fn label(&self) -> String {
        match self {
            Self::Advanced => "advanced".to_string(),
            Self::CatalogExhausted => "catalog_exhausted".to_string(),
            Self::AlreadyComplete => "already_complete".to_string(),
            Self::Aborted {
                page: Some(page),
                reason,
            } => format!("aborted at page {page}: {reason}"),
            Self::Aborted { page: None, reason } => format!("aborted: {reason}"),
            Self::SkippedDisabled => "skipped_disabled".to_string(),
            Self::SkippedConfiguration { reason } => format!("skipped_configuration: {reason}"),
            Self::SkippedBusy => "skipped_busy".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub provider: String,
    pub counts: RunCounts,
    pub first_page: Option<u32>,
    pub last_page: Option<u32>,
    pub is_complete: bool,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn to_run_log(&self) -> ImportRunLog {
        ImportRunLog {
            id: Uuid::new_v4(),
            run_id: self.run_id,
            provider: self.provider.clone(),
            counts: self.counts,
            first_page: self.first_page,
            last_page: self.last_page,
            is_complete: self.is_complete,
            outcome: self.outcome.label(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("an import for {provider} is running")]
    Busy { provider: String },
}

/// Failure while handling a single record. Counted and skipped, except for a
/// store that is unreachable altogether, which aborts the page.
#[derive(Debug, Error)]
enum RecordError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum RecordResult {
    Created,
    Updated,
    Skipped,
    Flagged,
}

#[derive(Debug, Default)]
struct RunProgress {
    counts: RunCounts,
    first_page: Option<u32>,
    last_page: Option<u32>,
    attempted_page: Option<u32>,
    is_complete: bool,
}

async fn append_log(run_log: &dyn RunLogStore, summary: &RunSummary) {
    if let Err(err) = run_log.append_run_log(&summary.to_run_log()).await {
        warn!(provider = %summary.provider, error = %err, "failed to append import run log");
    }
}

/// Records an invocation that never reached the importer (disabled provider,
/// missing credential) so every trigger leaves a run log behind.
pub async fn log_skipped_run(
    run_log: &dyn RunLogStore,
    provider: &str,
    outcome: RunOutcome,
) -> RunSummary {
    let now = Utc::now();
    let summary = RunSummary {
        run_id: Uuid::new_v4(),
        provider: provider.to_string(),
        counts: RunCounts::default(),
        first_page: None,
        last_page: None,
        is_complete: false,
        outcome,
        started_at: now,
        finished_at: now,
    };
    info!(provider, outcome = %summary.outcome.label(), "import skipped");
    append_log(run_log, &summary).await;
    summary
}

/// Operator reset: back to page 1, not complete. Refuses while a run holds the lease.
pub async fn reset_checkpoint(
    checkpoints: &dyn CheckpointStore,
    provider: &str,
    lease_ttl: Duration,
) -> Result<ImportCheckpoint, ImportError> {
    let holder = Uuid::new_v4();
    if !checkpoints.try_acquire_lease(provider, holder, lease_ttl).await? {
        return Err(ImportError::Busy {
            provider: provider.to_string(),
        });
    }
    let result = async {
        let checkpoint = checkpoints.load_checkpoint(provider).await?;
        let patch = checkpoint.transition(CheckpointEvent::OperatorReset, Utc::now())?;
        Ok::<_, ImportError>(checkpoints.save_checkpoint(provider, &patch).await?)
    }
    .await;
    checkpoints.release_lease(provider, holder).await?;
    if result.is_ok() {
        info!(provider, "checkpoint reset by operator");
    }
    result
}

pub struct ProgressiveImporter {
    source: Arc<dyn RecordSource>,
    catalog: Arc<dyn CatalogStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    run_log: Arc<dyn RunLogStore>,
    dedup: DedupEngine,
    pages_per_run: u32,
    lease_ttl: Duration,
}

impl ProgressiveImporter {
    pub fn new(
        source: Arc<dyn RecordSource>,
        catalog: Arc<dyn CatalogStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        run_log: Arc<dyn RunLogStore>,
    ) -> Self {
        Self {
            source,
            catalog,
            checkpoints,
            run_log,
            dedup: DedupEngine::default(),
            pages_per_run: DEFAULT_PAGES_PER_RUN,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_pages_per_run(mut self, pages: u32) -> Self {
        self.pages_per_run = pages.max(1);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_dedup(mut self, dedup: DedupEngine) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn provider_id(&self) -> &str {
        self.source.provider_id()
    }

    /// One scheduled invocation. Never fails: every problem ends up in the
    /// returned outcome and in the appended run log.
    pub async fn run(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("import_run", provider = %self.provider_id(), %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> RunSummary {
        let provider = self.provider_id().to_string();
        let started_at = Utc::now();
        let mut progress = RunProgress::default();

        let outcome = match self
            .checkpoints
            .try_acquire_lease(&provider, run_id, self.lease_ttl)
            .await
        {
            Ok(true) => {
                let outcome = match self.run_pages(&provider, &mut progress).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(error = %err, page = ?progress.attempted_page, "import aborted");
                        RunOutcome::Aborted {
                            page: progress.attempted_page,
                            reason: err.to_string(),
                        }
                    }
                };
                if let Err(err) = self.checkpoints.release_lease(&provider, run_id).await {
                    warn!(error = %err, "failed to release import lease");
                }
                outcome
            }
            Ok(false) => {
                info!("another import holds the lease; skipping");
                RunOutcome::SkippedBusy
            }
            Err(err) => {
                warn!(error = %err, "could not acquire import lease");
                RunOutcome::Aborted {
                    page: None,
                    reason: err.to_string(),
                }
            }
        };

        let summary = RunSummary {
            run_id,
            provider,
            counts: progress.counts,
            first_page: progress.first_page,
            last_page: progress.last_page,
            is_complete: progress.is_complete,
            outcome,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            outcome = %summary.outcome.label(),
            processed = summary.counts.processed,
            created = summary.counts.created,
            updated = summary.counts.updated,
            skipped = summary.counts.skipped,
            errors = summary.counts.errors,
            flagged = summary.counts.flagged,
            first_page = ?summary.first_page,
            last_page = ?summary.last_page,
            is_complete = summary.is_complete,
            "import run finished"
        );
        append_log(self.run_log.as_ref(), &summary).await;
        summary
    }

    async fn run_pages(
        &self,
        provider: &str,
        progress: &mut RunProgress,
    ) -> Result<RunOutcome, ImportError> {
        let mut checkpoint = self.checkpoints.load_checkpoint(provider).await?;
        progress.is_complete = checkpoint.is_complete;
        if checkpoint.is_complete {
            debug!("catalog already consumed; waiting for an operator reset");
            return Ok(RunOutcome::AlreadyComplete);
        }

        for _ in 0..self.pages_per_run {
            let page = checkpoint.current_page.max(1);
            progress.attempted_page = Some(page);

            let fetched = match self.source.fetch_page(page).await {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(page, error = %err, "page fetch failed; checkpoint stays on this page");
                    return Ok(RunOutcome::Aborted {
                        page: Some(page),
                        reason: err.to_string(),
                    });
                }
            };

            if fetched.is_empty() {
                let patch = checkpoint.transition(CheckpointEvent::CatalogExhausted, Utc::now())?;
                self.checkpoints.save_checkpoint(provider, &patch).await?;
                progress.is_complete = true;
                info!(page, "empty page; provider catalog exhausted");
                return Ok(RunOutcome::CatalogExhausted);
            }

            self.process_page(page, fetched, &mut progress.counts).await?;

            let patch = checkpoint.transition(CheckpointEvent::PageProcessed { page }, Utc::now())?;
            checkpoint = self.checkpoints.save_checkpoint(provider, &patch).await?;
            progress.first_page.get_or_insert(page);
            progress.last_page = Some(page);
            debug!(page, next_page = checkpoint.current_page, "page committed");
        }
        Ok(RunOutcome::Advanced)
    }

    /// An unreachable store aborts the page so the checkpoint does not move
    /// past records that were never written. Any other failure stays with
    /// its record.
    async fn process_page(
        &self,
        page: u32,
        fetched: FetchedPage,
        counts: &mut RunCounts,
    ) -> Result<(), StoreError> {
        for bad in &fetched.malformed {
            counts.processed += 1;
            counts.errors += 1;
            warn!(
                page,
                position = bad.position,
                record_id = ?bad.record_id,
                reason = %bad.reason,
                "malformed record; continuing with the page"
            );
        }
        for record in fetched.records {
            let record_id = record.record_id();
            counts.processed += 1;
            match self.process_record(record).await {
                Ok(RecordResult::Created) => counts.created += 1,
                Ok(RecordResult::Updated) => counts.updated += 1,
                Ok(RecordResult::Skipped) => counts.skipped += 1,
                Ok(RecordResult::Flagged) => counts.flagged += 1,
                Err(RecordError::Store(err)) if err.is_unavailable() => return Err(err),
                Err(err) => {
                    counts.errors += 1;
                    warn!(page, record_id, error = %err, "record failed; continuing with the page");
                }
            }
        }
        Ok(())
    }

    async fn process_record(
        &self,
        record: ProviderRecord,
    ) -> Result<RecordResult, RecordError> {
        let record_id = record.record_id();
        if let FilterDecision::Reject(reason) = is_candidate(&record) {
            debug!(record_id, ?reason, "record filtered");
            return Ok(RecordResult::Skipped);
        }

        let record = self.source.enrich(record).await?;
        if let FilterDecision::Reject(reason) = is_candidate(&record) {
            debug!(record_id, ?reason, "record filtered after enrichment");
            return Ok(RecordResult::Skipped);
        }

        let candidate = map_record(&record)?;
        let resolution = self
            .dedup
            .resolve(self.catalog.as_ref(), &candidate, Utc::now())
            .await?;

        Ok(match resolution.outcome {
            ResolveOutcome::Created => RecordResult::Created,
            ResolveOutcome::Updated => RecordResult::Updated,
            ResolveOutcome::Unchanged => RecordResult::Skipped,
            ResolveOutcome::Conflict => RecordResult::Flagged,
        })
    }
}
