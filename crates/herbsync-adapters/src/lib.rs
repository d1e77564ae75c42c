//! Provider adapters: one typed raw record per provider, the paginated HTTP
//! fetchers, fixture-backed record sources, and the pure candidate filter and
//! record mapper that turn raw records into `HerbCandidate`s.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use herbsync_core::{
    normalize_scientific_name, CultivationFacts, HerbCandidate, ImageRef, Provenance, SafetyFacts,
};
use herbsync_storage::{FetchError, RateLimitedClient};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "herbsync-adapters";

pub const TREFLE: &str = "trefle";
pub const PERENUAL: &str = "perenual";

/// Free-tier responses replace gated fields with an upsell string.
const PREMIUM_PLACEHOLDER_PREFIX: &str = "Upgrade Plans";

/// Ranks above species that Trefle lists alongside species records.
const NON_SPECIES_RANKS: &[&str] = &[
    "genus", "subgenus", "section", "tribe", "subfamily", "family", "order", "class", "division",
    "phylum", "kingdom",
];

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

// ---------------------------------------------------------------------------
// Trefle

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrefleSynonym {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        author: Option<String>,
    },
}

impl TrefleSynonym {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Detailed { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrefleTemperature {
    #[serde(default)]
    pub deg_c: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrefleGrowth {
    /// 0 (no light) to 10 (very intensive insolation).
    #[serde(default)]
    pub light: Option<u32>,
    #[serde(default)]
    pub ph_minimum: Option<f64>,
    #[serde(default)]
    pub ph_maximum: Option<f64>,
    #[serde(default)]
    pub minimum_temperature: Option<TrefleTemperature>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrefleSpecifications {
    #[serde(default)]
    pub growth_habit: Option<String>,
    #[serde(default)]
    pub toxicity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrefleImage {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub copyright: Option<String>,
}

/// A Trefle species. List pages fill the top-level fields; the detail
/// endpoint adds growth, specifications and the categorized image map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrefleRecord {
    pub id: i64,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub scientific_name: Option<String>,
    #[serde(default)]
    pub rank: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub family_common_name: Option<String>,
    #[serde(default)]
    pub genus: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub synonyms: Vec<TrefleSynonym>,
    #[serde(default)]
    pub edible: Option<bool>,
    #[serde(default)]
    pub vegetable: Option<bool>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub edible_part: Vec<String>,
    #[serde(default)]
    pub images: Option<BTreeMap<String, Vec<TrefleImage>>>,
    #[serde(default)]
    pub growth: Option<TrefleGrowth>,
    #[serde(default)]
    pub specifications: Option<TrefleSpecifications>,
}

#[derive(Debug, Deserialize)]
struct TrefleDetail {
    data: TrefleRecord,
}

// ---------------------------------------------------------------------------
// Perenual

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::One(value) => vec![value.as_str()],
            Self::Many(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

/// Perenual encodes booleans as `true`, `1` or a placeholder string depending
/// on the endpoint and tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Flag {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Int(value) => Some(*value != 0),
            Self::Text(value) => match value.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerenualImage {
    #[serde(default)]
    pub license_name: Option<String>,
    #[serde(default)]
    pub original_url: Option<String>,
    #[serde(default)]
    pub regular_url: Option<String>,
    #[serde(default)]
    pub medium_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerenualHardiness {
    #[serde(default)]
    pub min: Option<serde_json::Value>,
    #[serde(default)]
    pub max: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerenualRecord {
    pub id: i64,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub scientific_name: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub other_name: Vec<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub cycle: Option<String>,
    #[serde(default)]
    pub watering: Option<String>,
    #[serde(default)]
    pub sunlight: Option<OneOrMany>,
    #[serde(default)]
    pub default_image: Option<PerenualImage>,
    #[serde(default)]
    pub care_level: Option<String>,
    #[serde(default)]
    pub hardiness: Option<PerenualHardiness>,
    #[serde(default)]
    pub poisonous_to_humans: Option<Flag>,
    #[serde(default)]
    pub poisonous_to_pets: Option<Flag>,
    #[serde(default)]
    pub medicinal: Option<Flag>,
    #[serde(default)]
    pub cuisine: Option<Flag>,
    #[serde(default)]
    pub edible_leaf: Option<Flag>,
}

/// List envelope shared by both providers. Rows stay untyped until each one
/// is decoded on its own.
#[derive(Debug, Deserialize)]
struct RawPage {
    #[serde(default, deserialize_with = "null_as_empty")]
    data: Vec<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Tagged record

/// A raw provider record. Each variant is consumed only by its own provider's
/// filter and mapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", content = "record", rename_all = "snake_case")]
pub enum ProviderRecord {
    Trefle(TrefleRecord),
    Perenual(PerenualRecord),
}

impl ProviderRecord {
    pub fn provider_id(&self) -> &'static str {
        match self {
            Self::Trefle(_) => TREFLE,
            Self::Perenual(_) => PERENUAL,
        }
    }

    pub fn record_id(&self) -> i64 {
        match self {
            Self::Trefle(record) => record.id,
            Self::Perenual(record) => record.id,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {provider} payload: {source}")]
    Decode {
        provider: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown provider {0}")]
    UnknownProvider(String),
    #[error("{provider} detail for record {requested} returned record {returned}")]
    DetailMismatch {
        provider: String,
        requested: i64,
        returned: i64,
    },
}

/// A list row that could not be decoded into its provider's record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    /// Zero-based row index within the page.
    pub position: usize,
    pub record_id: Option<i64>,
    pub reason: String,
}

/// One decoded list page. Malformed rows are kept apart so the rest of the
/// page still imports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedPage {
    pub records: Vec<ProviderRecord>,
    pub malformed: Vec<MalformedRecord>,
}

impl FetchedPage {
    /// No rows at all, decodable or not. This is how providers signal the end.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.malformed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.malformed.len()
    }
}

impl From<Vec<ProviderRecord>> for FetchedPage {
    fn from(records: Vec<ProviderRecord>) -> Self {
        Self {
            records,
            malformed: Vec::new(),
        }
    }
}

fn decode_rows<T: DeserializeOwned>(
    rows: Vec<serde_json::Value>,
    wrap: fn(T) -> ProviderRecord,
) -> FetchedPage {
    let mut page = FetchedPage::default();
    for (position, row) in rows.into_iter().enumerate() {
        let record_id = row.get("id").and_then(serde_json::Value::as_i64);
        match serde_json::from_value::<T>(row) {
            Ok(record) => page.records.push(wrap(record)),
            Err(err) => page.malformed.push(MalformedRecord {
                position,
                record_id,
                reason: err.to_string(),
            }),
        }
    }
    page
}

fn decode<T: DeserializeOwned>(provider: &str, body: &[u8]) -> Result<T, AdapterError> {
    serde_json::from_slice(body).map_err(|source| AdapterError::Decode {
        provider: provider.to_string(),
        source,
    })
}

/// Decodes one list page body into tagged records. Only a broken envelope
/// fails the whole page; a bad row lands in `FetchedPage::malformed`.
pub fn decode_page(provider: &str, body: &[u8]) -> Result<FetchedPage, AdapterError> {
    match provider {
        TREFLE => {
            let page: RawPage = decode(provider, body)?;
            Ok(decode_rows::<TrefleRecord>(page.data, ProviderRecord::Trefle))
        }
        PERENUAL => {
            let page: RawPage = decode(provider, body)?;
            Ok(decode_rows::<PerenualRecord>(page.data, ProviderRecord::Perenual))
        }
        other => Err(AdapterError::UnknownProvider(other.to_string())),
    }
}

pub fn decode_detail(provider: &str, body: &[u8]) -> Result<ProviderRecord, AdapterError> {
    match provider {
        TREFLE => {
            let detail: TrefleDetail = decode(provider, body)?;
            Ok(ProviderRecord::Trefle(detail.data))
        }
        PERENUAL => Ok(ProviderRecord::Perenual(decode(provider, body)?)),
        other => Err(AdapterError::UnknownProvider(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Adapters

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn fetch_page(
        &self,
        http: &RateLimitedClient,
        credential: &str,
        page: u32,
    ) -> Result<FetchedPage, AdapterError>;

    async fn fetch_detail(
        &self,
        http: &RateLimitedClient,
        credential: &str,
        record_id: i64,
    ) -> Result<ProviderRecord, AdapterError>;
}

#[derive(Debug, Clone, Copy)]
struct TrefleAdapter;

#[derive(Debug, Clone, Copy)]
struct PerenualAdapter;

#[async_trait]
impl ProviderAdapter for TrefleAdapter {
    fn provider_id(&self) -> &'static str {
        TREFLE
    }

    async fn fetch_page(
        &self,
        http: &RateLimitedClient,
        credential: &str,
        page: u32,
    ) -> Result<FetchedPage, AdapterError> {
        let page = page.to_string();
        let resp = http
            .get("species", &[("page", page.as_str()), ("token", credential)])
            .await?;
        decode_page(TREFLE, &resp.body)
    }

    async fn fetch_detail(
        &self,
        http: &RateLimitedClient,
        credential: &str,
        record_id: i64,
    ) -> Result<ProviderRecord, AdapterError> {
        let resp = http
            .get(&format!("species/{record_id}"), &[("token", credential)])
            .await?;
        decode_detail(TREFLE, &resp.body)
    }
}

#[async_trait]
impl ProviderAdapter for PerenualAdapter {
    fn provider_id(&self) -> &'static str {
        PERENUAL
    }

    async fn fetch_page(
        &self,
        http: &RateLimitedClient,
        credential: &str,
        page: u32,
    ) -> Result<FetchedPage, AdapterError> {
        let page = page.to_string();
        let resp = http
            .get("species-list", &[("page", page.as_str()), ("key", credential)])
            .await?;
        decode_page(PERENUAL, &resp.body)
    }

    async fn fetch_detail(
        &self,
        http: &RateLimitedClient,
        credential: &str,
        record_id: i64,
    ) -> Result<ProviderRecord, AdapterError> {
        let resp = http
            .get(&format!("species/details/{record_id}"), &[("key", credential)])
            .await?;
        decode_detail(PERENUAL, &resp.body)
    }
}

pub fn trefle_adapter() -> impl ProviderAdapter {
    TrefleAdapter
}

pub fn perenual_adapter() -> impl ProviderAdapter {
    PerenualAdapter
}

pub fn adapter_for_provider(provider_id: &str) -> Option<Box<dyn ProviderAdapter>> {
    match provider_id {
        TREFLE => Some(Box::new(TrefleAdapter)),
        PERENUAL => Some(Box::new(PerenualAdapter)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Record sources

/// What the importer pulls records from: one page at a time, plus optional
/// per-record enrichment.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn provider_id(&self) -> &str;

    /// An empty page means the catalog is exhausted.
    async fn fetch_page(&self, page: u32) -> Result<FetchedPage, AdapterError>;

    /// Returns the record unchanged when the source does not enrich.
    async fn enrich(&self, record: ProviderRecord) -> Result<ProviderRecord, AdapterError>;
}

pub struct HttpRecordSource {
    adapter: Box<dyn ProviderAdapter>,
    http: Arc<RateLimitedClient>,
    credential: String,
    enrich_details: bool,
}

impl HttpRecordSource {
    pub fn new(
        adapter: Box<dyn ProviderAdapter>,
        http: Arc<RateLimitedClient>,
        credential: impl Into<String>,
        enrich_details: bool,
    ) -> Self {
        Self {
            adapter,
            http,
            credential: credential.into(),
            enrich_details,
        }
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    fn provider_id(&self) -> &str {
        self.adapter.provider_id()
    }

    async fn fetch_page(&self, page: u32) -> Result<FetchedPage, AdapterError> {
        let fetched = self
            .adapter
            .fetch_page(&self.http, &self.credential, page)
            .await?;
        debug!(
            provider = self.adapter.provider_id(),
            page,
            records = fetched.records.len(),
            malformed = fetched.malformed.len(),
            "fetched page"
        );
        Ok(fetched)
    }

    async fn enrich(&self, record: ProviderRecord) -> Result<ProviderRecord, AdapterError> {
        if !self.enrich_details {
            return Ok(record);
        }
        let requested = record.record_id();
        let detail = self
            .adapter
            .fetch_detail(&self.http, &self.credential, requested)
            .await?;
        if detail.record_id() != requested {
            return Err(AdapterError::DetailMismatch {
                provider: self.adapter.provider_id().to_string(),
                requested,
                returned: detail.record_id(),
            });
        }
        Ok(detail)
    }
}

/// Serves pages and detail records captured on disk (or built in memory),
/// with optional injected failures. Pages past the last one are empty.
#[derive(Debug, Default)]
pub struct FixtureRecordSource {
    provider_id: String,
    pages: Vec<FetchedPage>,
    details: HashMap<i64, ProviderRecord>,
    failing_pages: HashSet<u32>,
    failing_details: HashSet<i64>,
    fetch_log: Mutex<Vec<u32>>,
}

impl FixtureRecordSource {
    pub fn new(provider_id: impl Into<String>, pages: Vec<Vec<ProviderRecord>>) -> Self {
        Self::from_pages(provider_id, pages.into_iter().map(FetchedPage::from).collect())
    }

    pub fn from_pages(provider_id: impl Into<String>, pages: Vec<FetchedPage>) -> Self {
        Self {
            provider_id: provider_id.into(),
            pages,
            ..Self::default()
        }
    }

    /// Loads `page-1.json`, `page-2.json`, ... until the first gap, plus every
    /// `detail-<id>.json` in the directory.
    pub fn from_fixture_dir(provider_id: &str, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut pages = Vec::new();
        loop {
            let path = dir.join(format!("page-{}.json", pages.len() + 1));
            if !path.exists() {
                break;
            }
            let body = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let page = decode_page(provider_id, &body)
                .with_context(|| format!("parsing {}", path.display()))?;
            pages.push(page);
        }

        let mut details = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
            let path = entry?.path();
            let is_detail = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("detail-") && name.ends_with(".json"));
            if !is_detail {
                continue;
            }
            let body = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            details.push(
                decode_detail(provider_id, &body)
                    .with_context(|| format!("parsing {}", path.display()))?,
            );
        }

        Ok(Self::from_pages(provider_id, pages).with_details(details))
    }

    pub fn with_details(mut self, details: Vec<ProviderRecord>) -> Self {
        self.details
            .extend(details.into_iter().map(|record| (record.record_id(), record)));
        self
    }

    pub fn fail_page(mut self, page: u32) -> Self {
        self.failing_pages.insert(page);
        self
    }

    pub fn fail_detail(mut self, record_id: i64) -> Self {
        self.failing_details.insert(record_id);
        self
    }

    /// Every page requested so far, in request order.
    pub fn fetched_pages(&self) -> Vec<u32> {
        self.fetch_log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn injected_failure(&self, what: String) -> AdapterError {
        AdapterError::Fetch(FetchError::Transient {
            url: format!("fixture://{}/{what}", self.provider_id),
            reason: "injected failure".to_string(),
        })
    }
}

#[async_trait]
impl RecordSource for FixtureRecordSource {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn fetch_page(&self, page: u32) -> Result<FetchedPage, AdapterError> {
        self.fetch_log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(page);
        if self.failing_pages.contains(&page) {
            return Err(self.injected_failure(format!("page/{page}")));
        }
        let index = (page as usize).saturating_sub(1);
        Ok(self.pages.get(index).cloned().unwrap_or_default())
    }

    async fn enrich(&self, record: ProviderRecord) -> Result<ProviderRecord, AdapterError> {
        let record_id = record.record_id();
        if self.failing_details.contains(&record_id) {
            return Err(self.injected_failure(format!("detail/{record_id}")));
        }
        Ok(self.details.get(&record_id).cloned().unwrap_or(record))
    }
}

// ---------------------------------------------------------------------------
// Candidate filter

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    MissingScientificName,
    NotASpecies,
    NotAHerb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Reject(RejectReason),
}

impl FilterDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

pub fn is_placeholder(value: &str) -> bool {
    value.trim_start().starts_with(PREMIUM_PLACEHOLDER_PREFIX)
}

/// Decides whether a raw record is worth importing. Absent herb indicators
/// never reject; only indicators that are present and all negative do.
pub fn is_candidate(record: &ProviderRecord) -> FilterDecision {
    let verdict = match record {
        ProviderRecord::Trefle(record) => filter_trefle(record),
        ProviderRecord::Perenual(record) => filter_perenual(record),
    };
    match verdict {
        Ok(()) => FilterDecision::Accept,
        Err(reason) => FilterDecision::Reject(reason),
    }
}

fn check_species_name(name: Option<&str>) -> Result<(), RejectReason> {
    let name = clean_text(name).ok_or(RejectReason::MissingScientificName)?;
    if name.split_whitespace().count() < 2 {
        return Err(RejectReason::NotASpecies);
    }
    Ok(())
}

fn filter_trefle(record: &TrefleRecord) -> Result<(), RejectReason> {
    check_species_name(record.scientific_name.as_deref())?;

    if let Some(rank) = clean_text(record.rank.as_deref()) {
        if NON_SPECIES_RANKS.contains(&rank.to_lowercase().as_str()) {
            return Err(RejectReason::NotASpecies);
        }
    }

    let habit = record
        .specifications
        .as_ref()
        .and_then(|spec| clean_text(spec.growth_habit.as_deref()));
    if let Some(habit) = habit {
        let only_tree = habit
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .all(|part| part.eq_ignore_ascii_case("tree"));
        if only_tree {
            return Err(RejectReason::NotAHerb);
        }
    }
    Ok(())
}

fn filter_perenual(record: &PerenualRecord) -> Result<(), RejectReason> {
    check_species_name(perenual_scientific_name(record).as_deref())?;

    let indicators: Vec<bool> = [&record.medicinal, &record.cuisine, &record.edible_leaf]
        .into_iter()
        .filter_map(|flag| flag.as_ref().and_then(Flag::as_bool))
        .collect();
    if !indicators.is_empty() && indicators.iter().all(|value| !value) {
        return Err(RejectReason::NotAHerb);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Record mapper

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("{provider} record {record_id} has no usable scientific name")]
    MissingScientificName {
        provider: &'static str,
        record_id: i64,
    },
    #[error("{provider} record has invalid id {record_id}")]
    InvalidRecordId {
        provider: &'static str,
        record_id: i64,
    },
}

/// Pure translation of a raw record into a candidate. Empty strings and
/// premium placeholders become absent; non-http(s) image URLs are dropped.
pub fn map_record(record: &ProviderRecord) -> Result<HerbCandidate, MappingError> {
    let provider = record.provider_id();
    let record_id = record.record_id();
    if record_id <= 0 {
        return Err(MappingError::InvalidRecordId { provider, record_id });
    }
    match record {
        ProviderRecord::Trefle(record) => map_trefle(record),
        ProviderRecord::Perenual(record) => map_perenual(record),
    }
}

fn clean_text(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() || is_placeholder(trimmed) {
        return None;
    }
    Some(trimmed.to_string())
}

fn http_url(value: Option<&str>) -> Option<String> {
    clean_text(value).filter(|url| url.starts_with("https://") || url.starts_with("http://"))
}

fn push_unique_text(out: &mut Vec<String>, value: String) {
    let key = value.to_lowercase();
    if !out.iter().any(|existing| existing.to_lowercase() == key) {
        out.push(value);
    }
}

fn push_unique_image(out: &mut Vec<ImageRef>, image: ImageRef) {
    if !out.iter().any(|existing| existing.url == image.url) {
        out.push(image);
    }
}

/// Synonyms that normalize to the accepted name itself are not synonyms.
fn collect_synonyms<'a>(scientific_name: &str, names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let own_key = normalize_scientific_name(scientific_name);
    let mut out = Vec::new();
    for name in names {
        if let Some(name) = clean_text(Some(name)) {
            if normalize_scientific_name(&name) != own_key {
                push_unique_text(&mut out, name);
            }
        }
    }
    out
}

fn trefle_light_label(light: u32) -> &'static str {
    match light {
        0..=3 => "full shade",
        4..=6 => "part shade",
        _ => "full sun",
    }
}

fn map_trefle(record: &TrefleRecord) -> Result<HerbCandidate, MappingError> {
    let scientific_name = clean_text(record.scientific_name.as_deref()).ok_or(
        MappingError::MissingScientificName {
            provider: TREFLE,
            record_id: record.id,
        },
    )?;
    let common_name = clean_text(record.common_name.as_deref());

    let mut images = Vec::new();
    if let Some(url) = http_url(record.image_url.as_deref()) {
        push_unique_image(
            &mut images,
            ImageRef {
                url,
                caption: common_name.clone(),
                source: TREFLE.to_string(),
            },
        );
    }
    for (category, category_images) in record.images.iter().flatten() {
        for image in category_images {
            let Some(url) = http_url(image.image_url.as_deref()) else {
                continue;
            };
            let caption = match clean_text(image.copyright.as_deref()) {
                Some(copyright) => format!("{category} ({copyright})"),
                None => category.clone(),
            };
            push_unique_image(
                &mut images,
                ImageRef {
                    url,
                    caption: Some(caption),
                    source: TREFLE.to_string(),
                },
            );
        }
    }

    let growth = record.growth.clone().unwrap_or_default();
    let specs = record.specifications.clone().unwrap_or_default();
    let cultivation = CultivationFacts {
        sunlight: growth
            .light
            .map(|light| vec![trefle_light_label(light).to_string()])
            .unwrap_or_default(),
        growth_habit: clean_text(specs.growth_habit.as_deref()),
        soil_ph_min: growth.ph_minimum,
        soil_ph_max: growth.ph_maximum,
        min_temperature_c: growth.minimum_temperature.and_then(|temp| temp.deg_c),
        ..CultivationFacts::default()
    };

    let mut safety = SafetyFacts::default();
    if let Some(toxicity) = clean_text(specs.toxicity.as_deref()) {
        if toxicity.eq_ignore_ascii_case("none") {
            safety.toxic_to_humans = Some(false);
        } else {
            safety.warnings.push(format!("Toxicity: {toxicity}"));
            safety.toxic_to_humans = Some(true);
        }
    }

    Ok(HerbCandidate {
        synonyms: collect_synonyms(
            &scientific_name,
            record.synonyms.iter().map(TrefleSynonym::name),
        ),
        scientific_name,
        common_name,
        family: clean_text(record.family.as_deref()),
        provenance: Provenance {
            provider: TREFLE.to_string(),
            record_id: record.id,
        },
        images,
        cultivation,
        safety,
    })
}

fn perenual_scientific_name(record: &PerenualRecord) -> Option<String> {
    record
        .scientific_name
        .iter()
        .find_map(|name| clean_text(Some(name)))
}

fn json_scalar_text(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(text) => clean_text(Some(text)),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn perenual_hardiness(hardiness: Option<&PerenualHardiness>) -> Option<String> {
    let hardiness = hardiness?;
    let min = json_scalar_text(hardiness.min.as_ref());
    let max = json_scalar_text(hardiness.max.as_ref());
    match (min, max) {
        (Some(min), Some(max)) if min == max => Some(format!("zone {min}")),
        (Some(min), Some(max)) => Some(format!("zones {min}-{max}")),
        (Some(zone), None) | (None, Some(zone)) => Some(format!("zone {zone}")),
        (None, None) => None,
    }
}

fn map_perenual(record: &PerenualRecord) -> Result<HerbCandidate, MappingError> {
    let scientific_name =
        perenual_scientific_name(record).ok_or(MappingError::MissingScientificName {
            provider: PERENUAL,
            record_id: record.id,
        })?;
    let common_name = clean_text(record.common_name.as_deref());

    let names = record
        .scientific_name
        .iter()
        .chain(record.other_name.iter())
        .map(String::as_str);
    let synonyms = collect_synonyms(&scientific_name, names);

    let mut images = Vec::new();
    if let Some(image) = &record.default_image {
        let url = http_url(image.original_url.as_deref())
            .or_else(|| http_url(image.regular_url.as_deref()))
            .or_else(|| http_url(image.medium_url.as_deref()));
        if let Some(url) = url {
            images.push(ImageRef {
                url,
                caption: common_name.clone(),
                source: PERENUAL.to_string(),
            });
        }
    }

    let mut sunlight = Vec::new();
    for value in record.sunlight.iter().flat_map(OneOrMany::values) {
        if let Some(value) = clean_text(Some(value)) {
            push_unique_text(&mut sunlight, value);
        }
    }
    let cultivation = CultivationFacts {
        sunlight,
        watering: clean_text(record.watering.as_deref()),
        cycle: clean_text(record.cycle.as_deref()),
        care_level: clean_text(record.care_level.as_deref()),
        hardiness: perenual_hardiness(record.hardiness.as_ref()),
        ..CultivationFacts::default()
    };

    let mut safety = SafetyFacts {
        toxic_to_humans: record.poisonous_to_humans.as_ref().and_then(Flag::as_bool),
        toxic_to_pets: record.poisonous_to_pets.as_ref().and_then(Flag::as_bool),
        ..SafetyFacts::default()
    };
    if safety.toxic_to_humans == Some(true) {
        safety.warnings.push("Poisonous to humans".to_string());
    }
    if safety.toxic_to_pets == Some(true) {
        safety.warnings.push("Poisonous to pets".to_string());
    }

    Ok(HerbCandidate {
        scientific_name,
        common_name,
        family: clean_text(record.family.as_deref()),
        synonyms,
        provenance: Provenance {
            provider: PERENUAL.to_string(),
            record_id: record.id,
        },
        images,
        cultivation,
        safety,
    })
}
