//! Core domain model for herbsync: import candidates, catalog entities and
//! the per-provider import checkpoint.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "herbsync-core";

/// Taxonomic author abbreviations stripped from the end of a scientific name
/// before matching, so that "Mentha spicata L." and "Mentha spicata" collide.
const AUTHOR_SUFFIXES: &[&str] = &[
    "l.", "l.f.", "mill.", "dc.", "c.a.mey.", "mey.", "benth.", "hook.", "hook.f.", "willd.",
    "lam.", "thunb.", "sm.", "nutt.", "pers.", "spreng.", "kunth", "kuntze", "roxb.", "wall.",
    "maxim.", "sieb.", "zucc.", "nees", "desf.", "boiss.", "schult.", "michx.", "a.gray", "torr.",
    "engelm.", "hort.", "ait.", "aiton", "vahl", "schrad.", "rchb.", "j.presl", "c.presl", "koch",
    "moench", "huds.", "scop.", "sweet", "raf.", "medik.", "gaertn.", "all.", "jacq.", "retz.",
    "blume", "miq.", "franch.", "makino", "nakai", "f.",
];

const AUTHOR_CONNECTORS: &[&str] = &["ex", "&", "et"];

fn is_author_token(token: &str) -> bool {
    AUTHOR_SUFFIXES.contains(&token)
        || AUTHOR_CONNECTORS.contains(&token)
        || token.starts_with('(')
        || token.ends_with(')')
}

/// Matching key for a scientific name: lower-cased, whitespace collapsed and
/// trailing author citations removed. Genus and epithet are never stripped.
pub fn normalize_scientific_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut tokens: Vec<&str> = lowered.split_whitespace().collect();
    while tokens.len() > 2 {
        match tokens.last() {
            Some(last) if is_author_token(last) => {
                tokens.pop();
            }
            _ => break,
        }
    }
    tokens.join(" ")
}

/// Matching key for a display/common name.
pub fn normalize_display_name(name: &str) -> String {
    name.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    pub caption: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CultivationFacts {
    #[serde(default)]
    pub sunlight: Vec<String>,
    pub watering: Option<String>,
    pub cycle: Option<String>,
    pub care_level: Option<String>,
    pub hardiness: Option<String>,
    pub growth_habit: Option<String>,
    pub soil_ph_min: Option<f64>,
    pub soil_ph_max: Option<f64>,
    pub min_temperature_c: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SafetyFacts {
    #[serde(default)]
    pub warnings: Vec<String>,
    pub toxic_to_humans: Option<bool>,
    pub toxic_to_pets: Option<bool>,
}

/// Provider name plus the numeric id that provider assigned to the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub provider: String,
    pub record_id: i64,
}

/// A mapped external record that has not been reconciled against the catalog yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HerbCandidate {
    pub scientific_name: String,
    pub common_name: Option<String>,
    pub family: Option<String>,
    pub synonyms: Vec<String>,
    pub provenance: Provenance,
    pub images: Vec<ImageRef>,
    pub cultivation: CultivationFacts,
    pub safety: SafetyFacts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Draft,
    Published,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
        }
    }
}

/// How an entity entered the catalog. Manual entries win bulk consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOrigin {
    Imported,
    Manual,
}

/// Marks a candidate that matched an entity by name but disagreed on family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFlag {
    pub provider: String,
    pub record_id: i64,
    pub scientific_name: String,
    pub reason: String,
    pub flagged_at: DateTime<Utc>,
}

/// Persisted herb record. Only the fields the ingestion pipeline reads or writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntity {
    pub id: Uuid,
    pub display_name: String,
    pub scientific_name: String,
    pub family: Option<String>,
    pub synonyms: Vec<String>,
    pub images: Vec<ImageRef>,
    pub cultivation: CultivationFacts,
    pub safety: SafetyFacts,
    pub provenance: BTreeMap<String, i64>,
    pub last_synced_at: BTreeMap<String, DateTime<Utc>>,
    pub status: LifecycleStatus,
    pub origin: EntityOrigin,
    #[serde(default)]
    pub review_flags: Vec<ReviewFlag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogEntity {
    /// New imported entity. Always a draft: imported data needs review before publication.
    pub fn draft_from_candidate(candidate: &HerbCandidate, now: DateTime<Utc>) -> Self {
        let display_name = candidate
            .common_name
            .clone()
            .unwrap_or_else(|| candidate.scientific_name.clone());
        let mut provenance = BTreeMap::new();
        provenance.insert(
            candidate.provenance.provider.clone(),
            candidate.provenance.record_id,
        );
        let mut last_synced_at = BTreeMap::new();
        last_synced_at.insert(candidate.provenance.provider.clone(), now);

        Self {
            id: Uuid::new_v4(),
            display_name,
            scientific_name: candidate.scientific_name.clone(),
            family: candidate.family.clone(),
            synonyms: candidate.synonyms.clone(),
            images: candidate.images.clone(),
            cultivation: candidate.cultivation.clone(),
            safety: candidate.safety.clone(),
            provenance,
            last_synced_at,
            status: LifecycleStatus::Draft,
            origin: EntityOrigin::Imported,
            review_flags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn scientific_key(&self) -> String {
        normalize_scientific_name(&self.scientific_name)
    }

    pub fn display_key(&self) -> String {
        normalize_display_name(&self.display_name)
    }
}

/// Field-level update for a catalog entity. `None` leaves a field untouched;
/// provenance and sync stamps are upserted per provider.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityPatch {
    pub display_name: Option<String>,
    pub family: Option<String>,
    pub synonyms: Option<Vec<String>>,
    pub images: Option<Vec<ImageRef>>,
    pub cultivation: Option<CultivationFacts>,
    pub safety: Option<SafetyFacts>,
    pub review_flags: Option<Vec<ReviewFlag>>,
    #[serde(default)]
    pub provenance: BTreeMap<String, i64>,
    #[serde(default)]
    pub last_synced_at: BTreeMap<String, DateTime<Utc>>,
}

impl EntityPatch {
    pub fn is_empty(&self) -> bool {
        !self.touches_fields() && self.provenance.is_empty() && self.last_synced_at.is_empty()
    }

    /// True when the patch changes catalog content, as opposed to only
    /// provenance or sync bookkeeping.
    pub fn touches_fields(&self) -> bool {
        self.display_name.is_some()
            || self.family.is_some()
            || self.synonyms.is_some()
            || self.images.is_some()
            || self.cultivation.is_some()
            || self.safety.is_some()
            || self.review_flags.is_some()
    }

    pub fn apply_to(&self, entity: &mut CatalogEntity, now: DateTime<Utc>) {
        if let Some(v) = &self.display_name {
            entity.display_name = v.clone();
        }
        if let Some(v) = &self.family {
            entity.family = Some(v.clone());
        }
        if let Some(v) = &self.synonyms {
            entity.synonyms = v.clone();
        }
        if let Some(v) = &self.images {
            entity.images = v.clone();
        }
        if let Some(v) = &self.cultivation {
            entity.cultivation = v.clone();
        }
        if let Some(v) = &self.safety {
            entity.safety = v.clone();
        }
        if let Some(v) = &self.review_flags {
            entity.review_flags = v.clone();
        }
        for (provider, record_id) in &self.provenance {
            entity.provenance.insert(provider.clone(), *record_id);
        }
        for (provider, at) in &self.last_synced_at {
            entity.last_synced_at.insert(provider.clone(), *at);
        }
        entity.updated_at = now;
    }
}

/// Explicit import lifecycle for one provider, derived from the persisted checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ImportState {
    NotStarted,
    InProgress { next_page: u32 },
    Completed { completed_at: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointEvent {
    PageProcessed { page: u32 },
    CatalogExhausted,
    OperatorReset,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("checkpoint for {provider} is complete; reset it before importing again")]
    AlreadyComplete { provider: String },
    #[error("checkpoint for {provider} expects page {expected}, got page {got}")]
    PageOutOfOrder {
        provider: String,
        expected: u32,
        got: u32,
    },
}

/// Partial checkpoint update; the store merges present fields into the stored row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointPatch {
    pub current_page: Option<u32>,
    pub is_complete: Option<bool>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCheckpoint {
    pub provider: String,
    pub current_page: u32,
    pub is_complete: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

impl ImportCheckpoint {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            current_page: 1,
            is_complete: false,
            last_run_at: None,
            last_completed_at: None,
        }
    }

    pub fn state(&self) -> ImportState {
        if self.is_complete {
            ImportState::Completed {
                completed_at: self.last_completed_at,
            }
        } else if self.current_page <= 1 && self.last_run_at.is_none() {
            ImportState::NotStarted
        } else {
            ImportState::InProgress {
                next_page: self.current_page.max(1),
            }
        }
    }

    /// Validate `event` against the current state and return the patch to persist.
    pub fn transition(
        &self,
        event: CheckpointEvent,
        now: DateTime<Utc>,
    ) -> Result<CheckpointPatch, TransitionError> {
        match (self.state(), event) {
            (ImportState::Completed { .. }, CheckpointEvent::PageProcessed { .. })
            | (ImportState::Completed { .. }, CheckpointEvent::CatalogExhausted) => {
                Err(TransitionError::AlreadyComplete {
                    provider: self.provider.clone(),
                })
            }
            (_, CheckpointEvent::PageProcessed { page }) => {
                let expected = self.current_page.max(1);
                if page != expected {
                    return Err(TransitionError::PageOutOfOrder {
                        provider: self.provider.clone(),
                        expected,
                        got: page,
                    });
                }
                Ok(CheckpointPatch {
                    current_page: Some(page + 1),
                    last_run_at: Some(now),
                    ..Default::default()
                })
            }
            (_, CheckpointEvent::CatalogExhausted) => Ok(CheckpointPatch {
                current_page: Some(1),
                is_complete: Some(true),
                last_run_at: Some(now),
                last_completed_at: Some(now),
            }),
            (_, CheckpointEvent::OperatorReset) => Ok(CheckpointPatch {
                current_page: Some(1),
                is_complete: Some(false),
                ..Default::default()
            }),
        }
    }

    pub fn apply(&mut self, patch: &CheckpointPatch) {
        if let Some(page) = patch.current_page {
            self.current_page = page;
        }
        if let Some(done) = patch.is_complete {
            self.is_complete = done;
        }
        if let Some(at) = patch.last_run_at {
            self.last_run_at = Some(at);
        }
        if let Some(at) = patch.last_completed_at {
            self.last_completed_at = Some(at);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub processed: u32,
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
    pub errors: u32,
    pub flagged: u32,
}

/// Append-only record of one importer invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRunLog {
    pub id: Uuid,
    pub run_id: Uuid,
    pub provider: String,
    pub counts: RunCounts,
    pub first_page: Option<u32>,
    pub last_page: Option<u32>,
    pub is_complete: bool,
    pub outcome: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
