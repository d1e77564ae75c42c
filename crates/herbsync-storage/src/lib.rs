//! Rate-limited provider HTTP client + catalog, checkpoint and run-log stores.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herbsync_core::{
    CatalogEntity, CheckpointPatch, EntityPatch, ImportCheckpoint, ImportRunLog, LifecycleStatus,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod pg;

pub use pg::PgStore;

pub const CRATE_NAME: &str = "herbsync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    Success,
    RateLimited,
    Transient,
    Fatal,
}

pub fn classify_status(status: StatusCode) -> ResponseDisposition {
    if status.is_success() {
        ResponseDisposition::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ResponseDisposition::RateLimited
    } else if status.is_server_error() {
        ResponseDisposition::Transient
    } else {
        ResponseDisposition::Fatal
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Used in log fields only.
    pub label: String,
    pub base_url: String,
    pub min_interval: Duration,
    pub rate_limit_wait: Duration,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl ClientConfig {
    pub fn new(label: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            base_url: base_url.into(),
            min_interval: Duration::from_secs(1),
            rate_limit_wait: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.url.clone(),
            source,
        })
    }
}

/// Errors surfaced to callers. HTTP 429 never appears here: the client waits and retries.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient failure for {url}: {reason}")]
    Transient { url: String, reason: String },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Enforces a minimum spacing between consecutive requests.
#[derive(Debug)]
struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// One client per provider. Requests are paced by `min_interval`; a 429 sleeps
/// `rate_limit_wait` and re-sends the same request, without an upper bound.
#[derive(Debug)]
pub struct RateLimitedClient {
    client: reqwest::Client,
    label: String,
    base_url: String,
    pacer: RequestPacer,
    rate_limit_wait: Duration,
}

impl RateLimitedClient {
    pub fn new(config: ClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(|err| FetchError::Transient {
            url: config.base_url.clone(),
            reason: format!("building http client: {}", err.without_url()),
        })?;

        Ok(Self {
            client,
            label: config.label,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            pacer: RequestPacer::new(config.min_interval),
            rate_limit_wait: config.rate_limit_wait,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Query strings are kept out of logs and errors since they carry credentials.
    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<RawResponse, FetchError> {
        let url = self.url_for(path);
        let span = info_span!("provider_request", provider = %self.label, %url);
        self.get_inner(url, params).instrument(span).await
    }

    async fn get_inner(&self, url: String, params: &[(&str, &str)]) -> Result<RawResponse, FetchError> {
        let mut rate_limited = 0u32;
        loop {
            self.pacer.wait_turn().await;

            let resp = self
                .client
                .get(&url)
                .query(params)
                .send()
                .await
                .map_err(|err| FetchError::Transient {
                    url: url.clone(),
                    reason: err.without_url().to_string(),
                })?;
            let status = resp.status();

            match classify_status(status) {
                ResponseDisposition::Success => {
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|err| FetchError::Transient {
                            url: url.clone(),
                            reason: err.without_url().to_string(),
                        })?
                        .to_vec();
                    debug!(status = status.as_u16(), bytes = body.len(), "provider response");
                    return Ok(RawResponse { status, url, body });
                }
                ResponseDisposition::RateLimited => {
                    rate_limited += 1;
                    warn!(
                        attempt = rate_limited,
                        wait_secs = self.rate_limit_wait.as_secs_f64(),
                        "provider returned 429; waiting before retrying the same request"
                    );
                    tokio::time::sleep(self.rate_limit_wait).await;
                }
                ResponseDisposition::Transient => {
                    return Err(FetchError::Transient {
                        reason: format!("http status {}", status.as_u16()),
                        url,
                    });
                }
                ResponseDisposition::Fatal => {
                    return Err(FetchError::Status {
                        status: status.as_u16(),
                        url,
                    });
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("catalog entity {0} not found")]
    NotFound(Uuid),
    #[error("invalid stored value: {0}")]
    Invalid(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serializing stored document: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// The store as a whole is unreachable, as opposed to one row being bad.
    /// Callers stop a batch on these and skip the record on everything else.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Database(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            Self::Io(_) => true,
            _ => false,
        }
    }
}

/// The catalog operations the importer and bulk consolidation need.
/// Name lookups take already-normalized keys.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_by_provenance_id(
        &self,
        provider: &str,
        record_id: i64,
    ) -> Result<Option<CatalogEntity>, StoreError>;
    async fn find_by_scientific_name(
        &self,
        scientific_key: &str,
    ) -> Result<Option<CatalogEntity>, StoreError>;
    async fn find_by_display_name(&self, display_key: &str)
        -> Result<Option<CatalogEntity>, StoreError>;
    async fn create_draft(&self, entity: CatalogEntity) -> Result<CatalogEntity, StoreError>;
    async fn update_by_id(&self, id: Uuid, patch: &EntityPatch) -> Result<CatalogEntity, StoreError>;
    async fn list_all(&self) -> Result<Vec<CatalogEntity>, StoreError>;
    async fn delete_by_id(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// Per-provider checkpoint rows. The lease gives one writer per provider.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns a zero-value checkpoint (page 1, not complete) when none exists yet.
    async fn load_checkpoint(&self, provider: &str) -> Result<ImportCheckpoint, StoreError>;
    async fn save_checkpoint(
        &self,
        provider: &str,
        patch: &CheckpointPatch,
    ) -> Result<ImportCheckpoint, StoreError>;
    async fn list_checkpoints(&self) -> Result<Vec<ImportCheckpoint>, StoreError>;
    async fn try_acquire_lease(
        &self,
        provider: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
    async fn release_lease(&self, provider: &str, holder: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RunLogStore: Send + Sync {
    async fn append_run_log(&self, entry: &ImportRunLog) -> Result<(), StoreError>;
    /// Newest first.
    async fn recent_run_logs(&self, limit: usize) -> Result<Vec<ImportRunLog>, StoreError>;
}

fn first_by_age<'a>(
    entities: impl Iterator<Item = &'a CatalogEntity>,
) -> Option<CatalogEntity> {
    entities
        .min_by_key(|e| (e.created_at, e.id))
        .cloned()
}

fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, StoreError> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|err| StoreError::Invalid(format!("lease ttl out of range: {err}")))?;
    Ok(now + ttl)
}

/// In-process store used by tests and `HERBSYNC_STORE=memory`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: Mutex<BTreeMap<Uuid, CatalogEntity>>,
    checkpoints: Mutex<BTreeMap<String, ImportCheckpoint>>,
    leases: Mutex<HashMap<String, (Uuid, DateTime<Utc>)>>,
    run_logs: Mutex<Vec<ImportRunLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity as-is, bypassing draft creation (manual curation, fixtures).
    pub async fn seed_entity(&self, entity: CatalogEntity) {
        self.entities.lock().await.insert(entity.id, entity);
    }

    pub async fn entity(&self, id: Uuid) -> Option<CatalogEntity> {
        self.entities.lock().await.get(&id).cloned()
    }

    pub async fn entity_count(&self) -> usize {
        self.entities.lock().await.len()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn find_by_provenance_id(
        &self,
        provider: &str,
        record_id: i64,
    ) -> Result<Option<CatalogEntity>, StoreError> {
        let entities = self.entities.lock().await;
        Ok(first_by_age(
            entities
                .values()
                .filter(|e| e.provenance.get(provider) == Some(&record_id)),
        ))
    }

    async fn find_by_scientific_name(
        &self,
        scientific_key: &str,
    ) -> Result<Option<CatalogEntity>, StoreError> {
        let entities = self.entities.lock().await;
        Ok(first_by_age(
            entities
                .values()
                .filter(|e| e.scientific_key() == scientific_key),
        ))
    }

    async fn find_by_display_name(
        &self,
        display_key: &str,
    ) -> Result<Option<CatalogEntity>, StoreError> {
        let entities = self.entities.lock().await;
        Ok(first_by_age(
            entities.values().filter(|e| e.display_key() == display_key),
        ))
    }

    async fn create_draft(&self, mut entity: CatalogEntity) -> Result<CatalogEntity, StoreError> {
        entity.status = LifecycleStatus::Draft;
        self.entities.lock().await.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn update_by_id(&self, id: Uuid, patch: &EntityPatch) -> Result<CatalogEntity, StoreError> {
        let mut entities = self.entities.lock().await;
        let entity = entities.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        patch.apply_to(entity, Utc::now());
        Ok(entity.clone())
    }

    async fn list_all(&self) -> Result<Vec<CatalogEntity>, StoreError> {
        let entities = self.entities.lock().await;
        let mut all: Vec<_> = entities.values().cloned().collect();
        all.sort_by_key(|e| (e.created_at, e.id));
        Ok(all)
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.entities.lock().await.remove(&id).is_some())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(&self, provider: &str) -> Result<ImportCheckpoint, StoreError> {
        let mut checkpoints = self.checkpoints.lock().await;
        Ok(checkpoints
            .entry(provider.to_string())
            .or_insert_with(|| ImportCheckpoint::new(provider))
            .clone())
    }

    async fn save_checkpoint(
        &self,
        provider: &str,
        patch: &CheckpointPatch,
    ) -> Result<ImportCheckpoint, StoreError> {
        let mut checkpoints = self.checkpoints.lock().await;
        let checkpoint = checkpoints
            .entry(provider.to_string())
            .or_insert_with(|| ImportCheckpoint::new(provider));
        checkpoint.apply(patch);
        Ok(checkpoint.clone())
    }

    async fn list_checkpoints(&self) -> Result<Vec<ImportCheckpoint>, StoreError> {
        Ok(self.checkpoints.lock().await.values().cloned().collect())
    }

    async fn try_acquire_lease(
        &self,
        provider: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut leases = self.leases.lock().await;
        if let Some((current, expires_at)) = leases.get(provider) {
            if *current != holder && *expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(provider.to_string(), (holder, lease_expiry(now, ttl)?));
        Ok(true)
    }

    async fn release_lease(&self, provider: &str, holder: Uuid) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().await;
        if leases.get(provider).map(|(h, _)| *h) == Some(holder) {
            leases.remove(provider);
        }
        Ok(())
    }
}

#[async_trait]
impl RunLogStore for MemoryStore {
    async fn append_run_log(&self, entry: &ImportRunLog) -> Result<(), StoreError> {
        self.run_logs.lock().await.push(entry.clone());
        Ok(())
    }

    async fn recent_run_logs(&self, limit: usize) -> Result<Vec<ImportRunLog>, StoreError> {
        let logs = self.run_logs.lock().await;
        Ok(logs.iter().rev().take(limit).cloned().collect())
    }
}

/// Append-only JSON-lines run log, for deployments without a database.
#[derive(Debug, Clone)]
pub struct JsonlRunLog {
    path: PathBuf,
}

impl JsonlRunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_reports_dir(workspace_root: &Path) -> Self {
        Self::new(workspace_root.join("reports").join("import_runs.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RunLogStore for JsonlRunLog {
    async fn append_run_log(&self, entry: &ImportRunLog) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn recent_run_logs(&self, limit: usize) -> Result<Vec<ImportRunLog>, StoreError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path).await?;
        let mut entries = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            entries.push(serde_json::from_str::<ImportRunLog>(line)?);
        }
        Ok(entries.into_iter().rev().take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::Router;
    use herbsync_core::{
        CultivationFacts, HerbCandidate, Provenance, RunCounts, SafetyFacts,
    };
    use tempfile::tempdir;

    async fn spawn_provider(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fast_config(base_url: String) -> ClientConfig {
        ClientConfig {
            min_interval: Duration::from_millis(0),
            rate_limit_wait: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
            ..ClientConfig::new("test-provider", base_url)
        }
    }

    async fn rate_limited_once(
        State(hits): State<Arc<AtomicUsize>>,
        Query(params): Query<StdHashMap<String, String>>,
    ) -> (AxumStatus, String) {
        let n = hits.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            return (AxumStatus::TOO_MANY_REQUESTS, String::new());
        }
        let page = params.get("page").cloned().unwrap_or_default();
        (AxumStatus::OK, format!(r#"{{"page":"{page}"}}"#))
    }

    async fn always_status(State(status): State<(Arc<AtomicUsize>, u16)>) -> AxumStatus {
        status.0.fetch_add(1, Ordering::SeqCst);
        AxumStatus::from_u16(status.1).unwrap()
    }

    #[test]
    fn only_connectivity_failures_count_as_unavailable() {
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(StoreError::Database(sqlx::Error::PoolClosed).is_unavailable());
        assert!(StoreError::Io(std::io::Error::other("disk gone")).is_unavailable());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_unavailable());
        assert!(!StoreError::Invalid("corrupt row".to_string()).is_unavailable());
        assert!(!StoreError::NotFound(Uuid::new_v4()).is_unavailable());
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::OK), ResponseDisposition::Success);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ResponseDisposition::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            ResponseDisposition::Transient
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ResponseDisposition::Fatal);
    }

    #[tokio::test]
    async fn rate_limited_request_is_retried_after_waiting() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route("/species", get(rate_limited_once))
            .with_state(hits.clone());
        let base = spawn_provider(router).await;
        let client = RateLimitedClient::new(fast_config(base)).unwrap();

        let resp = client.get("/species", &[("page", "2")]).await.unwrap();
        let body: serde_json::Value = resp.json().unwrap();
        assert_eq!(body["page"], "2");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route("/species", get(always_status))
            .with_state((hits.clone(), 503));
        let base = spawn_provider(router).await;
        let client = RateLimitedClient::new(fast_config(base)).unwrap();

        let err = client.get("species", &[("token", "secret")]).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!err.to_string().contains("secret"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_errors_propagate_as_status() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route("/species", get(always_status))
            .with_state((hits.clone(), 404));
        let base = spawn_provider(router).await;
        let client = RateLimitedClient::new(fast_config(base)).unwrap();

        let err = client.get("/species", &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn consecutive_requests_respect_min_interval() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route("/species", get(always_status))
            .with_state((hits.clone(), 200));
        let base = spawn_provider(router).await;
        let client = RateLimitedClient::new(ClientConfig {
            min_interval: Duration::from_millis(150),
            ..fast_config(base)
        })
        .unwrap();

        let started = std::time::Instant::now();
        client.get("/species", &[]).await.unwrap();
        client.get("/species", &[]).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    fn entity(name: &str, provider: &str, record_id: i64) -> CatalogEntity {
        let candidate = HerbCandidate {
            scientific_name: name.to_string(),
            common_name: None,
            family: None,
            synonyms: vec![],
            provenance: Provenance {
                provider: provider.to_string(),
                record_id,
            },
            images: vec![],
            cultivation: CultivationFacts::default(),
            safety: SafetyFacts::default(),
        };
        CatalogEntity::draft_from_candidate(&candidate, Utc::now())
    }

    #[tokio::test]
    async fn memory_catalog_lookups_use_normalized_keys() {
        let store = MemoryStore::new();
        let created = store
            .create_draft(entity("Thymus vulgaris L.", "trefle", 7))
            .await
            .unwrap();

        let by_name = store.find_by_scientific_name("thymus vulgaris").await.unwrap();
        assert_eq!(by_name.map(|e| e.id), Some(created.id));
        let by_id = store.find_by_provenance_id("trefle", 7).await.unwrap();
        assert_eq!(by_id.map(|e| e.id), Some(created.id));
        assert!(store.find_by_provenance_id("perenual", 7).await.unwrap().is_none());

        let mut patch = EntityPatch {
            display_name: Some("Thyme".into()),
            ..Default::default()
        };
        patch.provenance.insert("perenual".into(), 99);
        store.update_by_id(created.id, &patch).await.unwrap();
        assert!(store.find_by_display_name("thyme").await.unwrap().is_some());
        assert!(store.find_by_provenance_id("perenual", 99).await.unwrap().is_some());

        assert!(store.delete_by_id(created.id).await.unwrap());
        assert!(matches!(
            store.update_by_id(created.id, &patch).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn checkpoint_is_created_lazily_and_patched() {
        let store = MemoryStore::new();
        let cp = store.load_checkpoint("trefle").await.unwrap();
        assert_eq!(cp, ImportCheckpoint::new("trefle"));

        let saved = store
            .save_checkpoint(
                "trefle",
                &CheckpointPatch {
                    current_page: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(saved.current_page, 4);
        assert!(!saved.is_complete);
        assert_eq!(store.load_checkpoint("trefle").await.unwrap().current_page, 4);
    }

    #[tokio::test]
    async fn lease_excludes_a_second_holder_until_released() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lease("trefle", a, ttl).await.unwrap());
        assert!(!store.try_acquire_lease("trefle", b, ttl).await.unwrap());
        assert!(store.try_acquire_lease("perenual", b, ttl).await.unwrap());
        store.release_lease("trefle", a).await.unwrap();
        assert!(store.try_acquire_lease("trefle", b, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = MemoryStore::new();
        assert!(store
            .try_acquire_lease("trefle", Uuid::new_v4(), Duration::from_millis(0))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store
            .try_acquire_lease("trefle", Uuid::new_v4(), Duration::from_secs(60))
            .await
            .unwrap());
    }

    fn run_log(provider: &str, processed: u32) -> ImportRunLog {
        let now = Utc::now();
        ImportRunLog {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            provider: provider.to_string(),
            counts: RunCounts {
                processed,
                ..Default::default()
            },
            first_page: Some(1),
            last_page: Some(2),
            is_complete: false,
            outcome: "advanced".into(),
            started_at: now,
            finished_at: now,
        }
    }

    #[tokio::test]
    async fn jsonl_run_log_appends_and_reads_newest_first() {
        let dir = tempdir().expect("tempdir");
        let log = JsonlRunLog::in_reports_dir(dir.path());
        assert!(log.recent_run_logs(5).await.unwrap().is_empty());

        log.append_run_log(&run_log("trefle", 1)).await.unwrap();
        log.append_run_log(&run_log("perenual", 2)).await.unwrap();
        log.append_run_log(&run_log("trefle", 3)).await.unwrap();

        let recent = log.recent_run_logs(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].counts.processed, 3);
        assert_eq!(recent[1].provider, "perenual");
        assert!(log.path().exists());
    }
}
