//! Candidate resolution against the catalog and the offline consolidation pass.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use herbsync_core::{
    normalize_display_name, normalize_scientific_name, CatalogEntity, CultivationFacts,
    EntityOrigin, EntityPatch, HerbCandidate, ImageRef, LifecycleStatus, ReviewFlag, SafetyFacts,
};
use herbsync_storage::{CatalogStore, StoreError};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Minimum Jaro-Winkler score for two distinct names in one genus to be
    /// reported as a possible duplicate by `consolidate`.
    pub near_duplicate_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            near_duplicate_threshold: 0.96,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Provenance,
    ScientificName,
    DisplayName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveOutcome {
    Created,
    Updated,
    /// Matched, but the merge changed nothing beyond the sync stamp.
    Unchanged,
    /// Matched by name but cannot be merged safely (different family, or the
    /// entity already carries another record from the same provider);
    /// flagged for review instead.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub entity_id: Uuid,
    pub outcome: ResolveOutcome,
    pub matched_by: Option<MatchedBy>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidationConflict {
    pub scientific_key: String,
    pub primary_id: Uuid,
    pub primary_family: Option<String>,
    pub entity_id: Uuid,
    pub family: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearDuplicate {
    pub name_a: String,
    pub name_b: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidationReport {
    pub dry_run: bool,
    pub groups_examined: usize,
    pub duplicate_groups: usize,
    pub merged: usize,
    pub deleted: usize,
    pub conflicts: Vec<ConsolidationConflict>,
    pub near_duplicates: Vec<NearDuplicate>,
}

/// Two non-empty families that differ (case-insensitively) mark a taxonomic
/// conflict rather than a duplicate.
pub fn family_conflict(existing: Option<&str>, incoming: Option<&str>) -> bool {
    let clean = |v: Option<&str>| v.map(str::trim).filter(|v| !v.is_empty()).map(str::to_lowercase);
    match (clean(existing), clean(incoming)) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

fn fill_text(slot: &mut Option<String>, incoming: &Option<String>) {
    if is_blank(slot.as_deref()) && !is_blank(incoming.as_deref()) {
        *slot = incoming.clone();
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if slot.is_none() {
        *slot = incoming.clone();
    }
}

/// Case-insensitive union keeping the first spelling seen. Values whose
/// scientific key equals `exclude_key` are dropped.
fn union_text(existing: &[String], incoming: &[String], exclude_key: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(existing.len() + incoming.len());
    let mut seen: Vec<String> = Vec::with_capacity(out.capacity());
    for value in existing.iter().chain(incoming) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        if exclude_key.is_some_and(|key| normalize_scientific_name(trimmed) == key) {
            continue;
        }
        let key = trimmed.to_lowercase();
        if !seen.contains(&key) {
            seen.push(key);
            out.push(trimmed.to_string());
        }
    }
    out
}

fn union_images(existing: &[ImageRef], incoming: &[ImageRef]) -> Vec<ImageRef> {
    let mut out = existing.to_vec();
    for image in incoming {
        if !out.iter().any(|e| e.url == image.url) {
            out.push(image.clone());
        }
    }
    out
}

fn merge_cultivation(existing: &CultivationFacts, incoming: &CultivationFacts) -> CultivationFacts {
    let mut merged = existing.clone();
    merged.sunlight = union_text(&existing.sunlight, &incoming.sunlight, None);
    fill_text(&mut merged.watering, &incoming.watering);
    fill_text(&mut merged.cycle, &incoming.cycle);
    fill_text(&mut merged.care_level, &incoming.care_level);
    fill_text(&mut merged.hardiness, &incoming.hardiness);
    fill_text(&mut merged.growth_habit, &incoming.growth_habit);
    fill(&mut merged.soil_ph_min, &incoming.soil_ph_min);
    fill(&mut merged.soil_ph_max, &incoming.soil_ph_max);
    fill(&mut merged.min_temperature_c, &incoming.min_temperature_c);
    merged
}

fn merge_safety(existing: &SafetyFacts, incoming: &SafetyFacts) -> SafetyFacts {
    SafetyFacts {
        warnings: union_text(&existing.warnings, &incoming.warnings, None),
        toxic_to_humans: existing.toxic_to_humans.or(incoming.toxic_to_humans),
        toxic_to_pets: existing.toxic_to_pets.or(incoming.toxic_to_pets),
    }
}

fn union_flags(existing: &[ReviewFlag], incoming: &[ReviewFlag]) -> Vec<ReviewFlag> {
    let mut out = existing.to_vec();
    for flag in incoming {
        if !out
            .iter()
            .any(|f| f.provider == flag.provider && f.record_id == flag.record_id)
        {
            out.push(flag.clone());
        }
    }
    out
}

/// Non-destructive field merge of `incoming` into `existing`: scalars only
/// fill empty slots, lists are unioned. Provenance is left to the caller.
pub fn merge_fields(existing: &CatalogEntity, incoming: &CatalogEntity) -> EntityPatch {
    let mut patch = EntityPatch::default();

    if existing.display_name.trim().is_empty() && !incoming.display_name.trim().is_empty() {
        patch.display_name = Some(incoming.display_name.clone());
    }
    if is_blank(existing.family.as_deref()) && !is_blank(incoming.family.as_deref()) {
        patch.family = incoming.family.clone();
    }

    let own_key = existing.scientific_key();
    let synonyms = union_text(&existing.synonyms, &incoming.synonyms, Some(&own_key));
    if synonyms != existing.synonyms {
        patch.synonyms = Some(synonyms);
    }

    let images = union_images(&existing.images, &incoming.images);
    if images.len() != existing.images.len() {
        patch.images = Some(images);
    }

    let cultivation = merge_cultivation(&existing.cultivation, &incoming.cultivation);
    if cultivation != existing.cultivation {
        patch.cultivation = Some(cultivation);
    }

    let safety = merge_safety(&existing.safety, &incoming.safety);
    if safety != existing.safety {
        patch.safety = Some(safety);
    }

    let flags = union_flags(&existing.review_flags, &incoming.review_flags);
    if flags.len() != existing.review_flags.len() {
        patch.review_flags = Some(flags);
    }

    patch
}

/// Merge a mapped candidate into a matched entity. The candidate's provider
/// always rewrites its own provenance id and sync stamp.
pub fn plan_merge(existing: &CatalogEntity, candidate: &HerbCandidate, now: DateTime<Utc>) -> EntityPatch {
    let incoming = CatalogEntity::draft_from_candidate(candidate, now);
    let mut patch = merge_fields(existing, &incoming);
    let provider = &candidate.provenance.provider;
    patch
        .provenance
        .insert(provider.clone(), candidate.provenance.record_id);
    patch.last_synced_at.insert(provider.clone(), now);
    patch
}

/// Merge a consolidation loser into the primary. Providers the primary
/// already tracks keep the primary's record id.
pub fn merge_entities(primary: &CatalogEntity, loser: &CatalogEntity) -> EntityPatch {
    let mut patch = merge_fields(primary, loser);
    for (provider, record_id) in &loser.provenance {
        if !primary.provenance.contains_key(provider) {
            patch.provenance.insert(provider.clone(), *record_id);
            if let Some(at) = loser.last_synced_at.get(provider) {
                patch.last_synced_at.insert(provider.clone(), *at);
            }
        }
    }
    patch
}

/// Consolidation priority, best first: manual origin, more provenance
/// sources, published, oldest, smallest id.
pub fn primary_order(a: &CatalogEntity, b: &CatalogEntity) -> Ordering {
    let manual = |e: &CatalogEntity| e.origin == EntityOrigin::Manual;
    let published = |e: &CatalogEntity| e.status == LifecycleStatus::Published;
    manual(b)
        .cmp(&manual(a))
        .then_with(|| b.provenance.len().cmp(&a.provenance.len()))
        .then_with(|| published(b).cmp(&published(a)))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Patch that turns `original` into `target`, field by field.
fn diff_patch(original: &CatalogEntity, target: &CatalogEntity) -> EntityPatch {
    let mut patch = EntityPatch::default();
    if target.display_name != original.display_name {
        patch.display_name = Some(target.display_name.clone());
    }
    if target.family != original.family {
        patch.family = target.family.clone();
    }
    if target.synonyms != original.synonyms {
        patch.synonyms = Some(target.synonyms.clone());
    }
    if target.images != original.images {
        patch.images = Some(target.images.clone());
    }
    if target.cultivation != original.cultivation {
        patch.cultivation = Some(target.cultivation.clone());
    }
    if target.safety != original.safety {
        patch.safety = Some(target.safety.clone());
    }
    if target.review_flags != original.review_flags {
        patch.review_flags = Some(target.review_flags.clone());
    }
    for (provider, record_id) in &target.provenance {
        if original.provenance.get(provider) != Some(record_id) {
            patch.provenance.insert(provider.clone(), *record_id);
        }
    }
    for (provider, at) in &target.last_synced_at {
        if original.last_synced_at.get(provider) != Some(at) {
            patch.last_synced_at.insert(provider.clone(), *at);
        }
    }
    patch
}

fn genus_of(scientific_key: &str) -> &str {
    scientific_key.split_whitespace().next().unwrap_or_default()
}

pub struct DedupEngine {
    config: DedupConfig,
}

impl Default for DedupEngine {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Provenance id, then normalized scientific name, then display name.
    /// First hit wins.
    pub async fn find_match(
        &self,
        store: &dyn CatalogStore,
        candidate: &HerbCandidate,
    ) -> Result<Option<(CatalogEntity, MatchedBy)>, StoreError> {
        let provenance = &candidate.provenance;
        if let Some(entity) = store
            .find_by_provenance_id(&provenance.provider, provenance.record_id)
            .await?
        {
            return Ok(Some((entity, MatchedBy::Provenance)));
        }

        let scientific_key = normalize_scientific_name(&candidate.scientific_name);
        if !scientific_key.is_empty() {
            if let Some(entity) = store.find_by_scientific_name(&scientific_key).await? {
                return Ok(Some((entity, MatchedBy::ScientificName)));
            }
        }

        let display = candidate
            .common_name
            .as_deref()
            .unwrap_or(&candidate.scientific_name);
        let display_key = normalize_display_name(display);
        if !display_key.is_empty() {
            if let Some(entity) = store.find_by_display_name(&display_key).await? {
                return Ok(Some((entity, MatchedBy::DisplayName)));
            }
        }
        Ok(None)
    }

    pub async fn resolve(
        &self,
        store: &dyn CatalogStore,
        candidate: &HerbCandidate,
        now: DateTime<Utc>,
    ) -> Result<Resolution, StoreError> {
        let Some((existing, matched_by)) = self.find_match(store, candidate).await? else {
            let created = store
                .create_draft(CatalogEntity::draft_from_candidate(candidate, now))
                .await?;
            debug!(entity_id = %created.id, scientific_name = %candidate.scientific_name, "created draft");
            return Ok(Resolution {
                entity_id: created.id,
                outcome: ResolveOutcome::Created,
                matched_by: None,
            });
        };

        let provider = &candidate.provenance.provider;
        if matched_by != MatchedBy::Provenance {
            if family_conflict(existing.family.as_deref(), candidate.family.as_deref()) {
                let reason = format!(
                    "family {} differs from {}",
                    candidate.family.as_deref().unwrap_or_default(),
                    existing.family.as_deref().unwrap_or_default()
                );
                return self
                    .flag_for_review(store, &existing, candidate, matched_by, reason, now)
                    .await;
            }
            // One provider record per entity; a second one would flip the
            // provenance slot back and forth on every pass.
            if let Some(held) = existing
                .provenance
                .get(provider)
                .filter(|held| **held != candidate.provenance.record_id)
            {
                let reason = format!("entity already linked to {provider} record {held}");
                return self
                    .flag_for_review(store, &existing, candidate, matched_by, reason, now)
                    .await;
            }
        }

        let patch = plan_merge(&existing, candidate, now);
        let changed = patch.touches_fields()
            || existing.provenance.get(provider) != Some(&candidate.provenance.record_id);
        store.update_by_id(existing.id, &patch).await?;

        Ok(Resolution {
            entity_id: existing.id,
            outcome: if changed {
                ResolveOutcome::Updated
            } else {
                ResolveOutcome::Unchanged
            },
            matched_by: Some(matched_by),
        })
    }

    async fn flag_for_review(
        &self,
        store: &dyn CatalogStore,
        existing: &CatalogEntity,
        candidate: &HerbCandidate,
        matched_by: MatchedBy,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<Resolution, StoreError> {
        let provenance = &candidate.provenance;
        let already_flagged = existing
            .review_flags
            .iter()
            .any(|f| f.provider == provenance.provider && f.record_id == provenance.record_id);
        if !already_flagged {
            warn!(
                entity_id = %existing.id,
                provider = %provenance.provider,
                record_id = provenance.record_id,
                matched_by = ?matched_by,
                reason = %reason,
                "name match not merged; flagging for review"
            );
            let mut flags = existing.review_flags.clone();
            flags.push(ReviewFlag {
                provider: provenance.provider.clone(),
                record_id: provenance.record_id,
                scientific_name: candidate.scientific_name.clone(),
                reason,
                flagged_at: now,
            });
            let patch = EntityPatch {
                review_flags: Some(flags),
                ..EntityPatch::default()
            };
            store.update_by_id(existing.id, &patch).await?;
        }
        Ok(Resolution {
            entity_id: existing.id,
            outcome: ResolveOutcome::Conflict,
            matched_by: Some(matched_by),
        })
    }

    /// Offline maintenance: group the catalog by normalized scientific name,
    /// fold each group into its primary and delete the rest.
    pub async fn consolidate(
        &self,
        store: &dyn CatalogStore,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<ConsolidationReport, StoreError> {
        let mut groups: BTreeMap<String, Vec<CatalogEntity>> = BTreeMap::new();
        for entity in store.list_all().await? {
            groups.entry(entity.scientific_key()).or_default().push(entity);
        }

        let mut report = ConsolidationReport {
            dry_run,
            groups_examined: groups.len(),
            ..ConsolidationReport::default()
        };

        for (key, mut members) in groups.iter().map(|(k, v)| (k, v.clone())) {
            if members.len() < 2 {
                continue;
            }
            report.duplicate_groups += 1;
            members.sort_by(primary_order);
            let original = members.remove(0);
            let mut primary = original.clone();
            let mut losers = Vec::new();

            for member in members {
                if family_conflict(primary.family.as_deref(), member.family.as_deref()) {
                    report.conflicts.push(ConsolidationConflict {
                        scientific_key: key.clone(),
                        primary_id: primary.id,
                        primary_family: primary.family.clone(),
                        entity_id: member.id,
                        family: member.family.clone(),
                    });
                    continue;
                }
                merge_entities(&primary, &member).apply_to(&mut primary, now);
                losers.push(member.id);
            }

            report.merged += losers.len();
            report.deleted += losers.len();
            if dry_run || losers.is_empty() {
                continue;
            }

            let patch = diff_patch(&original, &primary);
            if !patch.is_empty() {
                store.update_by_id(original.id, &patch).await?;
            }
            for loser in &losers {
                store.delete_by_id(*loser).await?;
            }
            info!(primary_id = %original.id, scientific_key = %key, merged = losers.len(), "consolidated group");
        }

        report.near_duplicates = self.near_duplicates(groups.keys());
        Ok(report)
    }

    fn near_duplicates<'a>(&self, keys: impl Iterator<Item = &'a String>) -> Vec<NearDuplicate> {
        let mut by_genus: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for key in keys {
            by_genus.entry(genus_of(key)).or_default().push(key.as_str());
        }

        let mut out = Vec::new();
        for names in by_genus.values() {
            for (i, a) in names.iter().enumerate() {
                for b in &names[i + 1..] {
                    let score = jaro_winkler(a, b);
                    if score >= self.config.near_duplicate_threshold {
                        out.push(NearDuplicate {
                            name_a: (*a).to_string(),
                            name_b: (*b).to_string(),
                            score,
                        });
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use herbsync_core::Provenance;
    use herbsync_storage::MemoryStore;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).single().unwrap()
    }

    fn image(url: &str, source: &str) -> ImageRef {
        ImageRef {
            url: url.to_string(),
            caption: None,
            source: source.to_string(),
        }
    }

    fn candidate(provider: &str, record_id: i64, scientific: &str, common: Option<&str>) -> HerbCandidate {
        HerbCandidate {
            scientific_name: scientific.to_string(),
            common_name: common.map(str::to_string),
            family: Some("Lamiaceae".to_string()),
            synonyms: Vec::new(),
            provenance: Provenance {
                provider: provider.to_string(),
                record_id,
            },
            images: Vec::new(),
            cultivation: CultivationFacts::default(),
            safety: SafetyFacts::default(),
        }
    }

    fn entity_from(c: &HerbCandidate, day: u32) -> CatalogEntity {
        CatalogEntity::draft_from_candidate(c, ts(day))
    }

    #[tokio::test]
    async fn unmatched_candidate_becomes_a_draft() {
        let store = MemoryStore::new();
        let engine = DedupEngine::default();
        let c = candidate("trefle", 1, "Mentha spicata", Some("Spearmint"));

        let resolution = engine.resolve(&store, &c, ts(1)).await.unwrap();
        assert_eq!(resolution.outcome, ResolveOutcome::Created);
        assert_eq!(resolution.matched_by, None);

        let stored = store.entity(resolution.entity_id).await.unwrap();
        assert_eq!(stored.status, LifecycleStatus::Draft);
        assert_eq!(stored.display_name, "Spearmint");
        assert_eq!(stored.provenance.get("trefle"), Some(&1));
    }

    #[tokio::test]
    async fn provenance_match_beats_name_match() {
        let store = MemoryStore::new();
        let by_name = entity_from(&candidate("perenual", 9, "Mentha spicata", None), 1);
        let by_id = entity_from(&candidate("trefle", 7, "Mentha viridis", None), 2);
        store.seed_entity(by_name.clone()).await;
        store.seed_entity(by_id.clone()).await;

        let engine = DedupEngine::default();
        let c = candidate("trefle", 7, "Mentha spicata", None);
        let resolution = engine.resolve(&store, &c, ts(3)).await.unwrap();
        assert_eq!(resolution.entity_id, by_id.id);
        assert_eq!(resolution.matched_by, Some(MatchedBy::Provenance));
    }

    #[tokio::test]
    async fn published_match_gains_provenance_and_stays_published() {
        let store = MemoryStore::new();
        let mut existing = entity_from(&candidate("perenual", 2468, "Salvia officinalis", Some("Garden sage")), 1);
        existing.status = LifecycleStatus::Published;
        store.seed_entity(existing.clone()).await;

        let engine = DedupEngine::default();
        let c = candidate("trefle", 263319, "Salvia officinalis L.", Some("Sage"));
        let resolution = engine.resolve(&store, &c, ts(2)).await.unwrap();
        assert_eq!(resolution.outcome, ResolveOutcome::Updated);
        assert_eq!(resolution.matched_by, Some(MatchedBy::ScientificName));

        let stored = store.entity(existing.id).await.unwrap();
        assert_eq!(stored.status, LifecycleStatus::Published);
        assert_eq!(stored.provenance.len(), 2);
        assert_eq!(stored.provenance.get("trefle"), Some(&263319));
        assert_eq!(stored.last_synced_at.get("trefle"), Some(&ts(2)));
        // first writer wins for scalars
        assert_eq!(stored.display_name, "Garden sage");
        assert_eq!(stored.scientific_name, "Salvia officinalis");
    }

    #[tokio::test]
    async fn display_name_is_the_last_resort() {
        let store = MemoryStore::new();
        let existing = entity_from(&candidate("perenual", 1822, "Melissa officinalis", Some("Lemon balm")), 1);
        store.seed_entity(existing.clone()).await;

        let engine = DedupEngine::default();
        let c = candidate("trefle", 55, "Melissa officinalis subsp. altissima", Some("lemon   BALM"));
        let resolution = engine.resolve(&store, &c, ts(2)).await.unwrap();
        assert_eq!(resolution.entity_id, existing.id);
        assert_eq!(resolution.matched_by, Some(MatchedBy::DisplayName));
    }

    #[tokio::test]
    async fn two_providers_fan_into_one_entity() {
        let store = MemoryStore::new();
        let engine = DedupEngine::default();

        let mut a = candidate("trefle", 1, "Panax ginseng C.A.Mey.", Some("Asian ginseng"));
        a.images = vec![image("https://img.example/a.jpg", "trefle")];
        let mut b = candidate("perenual", 2, "panax   ginseng", None);
        b.images = vec![image("https://img.example/b.jpg", "perenual")];

        let first = engine.resolve(&store, &a, ts(1)).await.unwrap();
        let second = engine.resolve(&store, &b, ts(2)).await.unwrap();
        assert_eq!(first.entity_id, second.entity_id);
        assert_eq!(second.outcome, ResolveOutcome::Updated);
        assert_eq!(store.entity_count().await, 1);

        let stored = store.entity(first.entity_id).await.unwrap();
        let urls: Vec<&str> = stored.images.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["https://img.example/a.jpg", "https://img.example/b.jpg"]);
        assert_eq!(stored.provenance.len(), 2);
    }

    #[tokio::test]
    async fn sparse_candidate_never_erases_fields() {
        let store = MemoryStore::new();
        let mut rich = candidate("trefle", 1, "Thymus vulgaris", Some("Thyme"));
        rich.synonyms = vec!["Thymus collinus".to_string()];
        rich.images = vec![image("https://img.example/thyme.jpg", "trefle")];
        rich.cultivation.watering = Some("Minimum".to_string());
        rich.cultivation.soil_ph_min = Some(6.0);
        rich.safety.warnings = vec!["Avoid in pregnancy".to_string()];
        let existing = entity_from(&rich, 1);
        store.seed_entity(existing.clone()).await;

        let mut sparse = candidate("perenual", 3, "Thymus vulgaris", None);
        sparse.family = None;
        sparse.cultivation.watering = Some("Frequent".to_string());
        sparse.synonyms = vec!["thymus COLLINUS".to_string(), "Thymus vulgaris L.".to_string()];

        let engine = DedupEngine::default();
        engine.resolve(&store, &sparse, ts(2)).await.unwrap();

        let stored = store.entity(existing.id).await.unwrap();
        assert_eq!(stored.family.as_deref(), Some("Lamiaceae"));
        assert_eq!(stored.display_name, "Thyme");
        assert_eq!(stored.synonyms, vec!["Thymus collinus".to_string()]);
        assert_eq!(stored.images.len(), 1);
        assert_eq!(stored.cultivation.watering.as_deref(), Some("Minimum"));
        assert_eq!(stored.cultivation.soil_ph_min, Some(6.0));
        assert_eq!(stored.safety.warnings, vec!["Avoid in pregnancy".to_string()]);
    }

    #[tokio::test]
    async fn resync_of_identical_candidate_is_unchanged() {
        let store = MemoryStore::new();
        let engine = DedupEngine::default();
        let mut c = candidate("trefle", 10, "Ocimum basilicum", Some("Basil"));
        c.images = vec![image("https://img.example/basil.jpg", "trefle")];
        c.cultivation.sunlight = vec!["full sun".to_string()];

        let first = engine.resolve(&store, &c, ts(1)).await.unwrap();
        let second = engine.resolve(&store, &c, ts(2)).await.unwrap();
        assert_eq!(second.outcome, ResolveOutcome::Unchanged);
        assert_eq!(second.matched_by, Some(MatchedBy::Provenance));

        let stored = store.entity(first.entity_id).await.unwrap();
        assert_eq!(stored.last_synced_at.get("trefle"), Some(&ts(2)));
    }

    #[tokio::test]
    async fn family_mismatch_on_name_match_is_flagged_once() {
        let store = MemoryStore::new();
        let existing = entity_from(&candidate("perenual", 4, "Ruta graveolens", Some("Rue")), 1);
        store.seed_entity(existing.clone()).await;

        let mut c = candidate("trefle", 77, "Ruta graveolens", Some("Rue"));
        c.family = Some("Rutaceae".to_string());
        c.images = vec![image("https://img.example/rue.jpg", "trefle")];

        let engine = DedupEngine::default();
        let first = engine.resolve(&store, &c, ts(2)).await.unwrap();
        let second = engine.resolve(&store, &c, ts(3)).await.unwrap();
        assert_eq!(first.outcome, ResolveOutcome::Conflict);
        assert_eq!(second.outcome, ResolveOutcome::Conflict);

        let stored = store.entity(existing.id).await.unwrap();
        assert_eq!(stored.review_flags.len(), 1);
        assert_eq!(stored.review_flags[0].record_id, 77);
        assert!(stored.images.is_empty());
        assert!(!stored.provenance.contains_key("trefle"));
    }

    #[tokio::test]
    async fn second_record_from_same_provider_is_flagged_not_relinked() {
        let store = MemoryStore::new();
        let engine = DedupEngine::default();
        let arvensis = candidate("trefle", 10, "Mentha arvensis", Some("Mint"));
        let spicata = candidate("trefle", 11, "Mentha spicata", Some("Mint"));

        let first = engine.resolve(&store, &arvensis, ts(1)).await.unwrap();
        let second = engine.resolve(&store, &spicata, ts(1)).await.unwrap();
        assert_eq!(second.entity_id, first.entity_id);
        assert_eq!(second.outcome, ResolveOutcome::Conflict);
        assert_eq!(second.matched_by, Some(MatchedBy::DisplayName));

        // A later pass over both records settles: no relinking either way.
        let again = engine.resolve(&store, &arvensis, ts(2)).await.unwrap();
        assert_eq!(again.outcome, ResolveOutcome::Unchanged);
        let again = engine.resolve(&store, &spicata, ts(2)).await.unwrap();
        assert_eq!(again.outcome, ResolveOutcome::Conflict);

        let stored = store.entity(first.entity_id).await.unwrap();
        assert_eq!(stored.provenance.get("trefle"), Some(&10));
        assert_eq!(stored.review_flags.len(), 1);
        assert_eq!(stored.review_flags[0].record_id, 11);
        assert!(stored.review_flags[0].reason.contains("trefle record 10"));
    }

    #[test]
    fn family_conflict_ignores_case_and_absence() {
        assert!(!family_conflict(Some("Lamiaceae"), Some("lamiaceae ")));
        assert!(!family_conflict(None, Some("Lamiaceae")));
        assert!(!family_conflict(Some(""), Some("Lamiaceae")));
        assert!(family_conflict(Some("Lamiaceae"), Some("Rutaceae")));
    }

    #[test]
    fn primary_priority_prefers_manual_then_provenance_then_published() {
        let base = candidate("trefle", 1, "Mentha spicata", None);
        let mut manual = entity_from(&base, 5);
        manual.origin = EntityOrigin::Manual;
        manual.provenance.clear();
        let mut rich = entity_from(&base, 4);
        rich.provenance.insert("perenual".to_string(), 2);
        let mut published = entity_from(&base, 3);
        published.status = LifecycleStatus::Published;
        let oldest = entity_from(&base, 1);

        let mut all = vec![oldest.clone(), published.clone(), rich.clone(), manual.clone()];
        all.sort_by(primary_order);
        let ids: Vec<Uuid> = all.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![manual.id, rich.id, published.id, oldest.id]);
    }

    #[tokio::test]
    async fn consolidation_folds_losers_into_manual_primary() {
        let store = MemoryStore::new();

        let mut manual = entity_from(&candidate("manual", 0, "Mentha spicata", Some("Spearmint")), 3);
        manual.origin = EntityOrigin::Manual;
        manual.provenance.clear();
        manual.last_synced_at.clear();
        let mut a = entity_from(&candidate("trefle", 11, "Mentha spicata L.", None), 1);
        a.images = vec![image("https://img.example/m1.jpg", "trefle")];
        let mut b = entity_from(&candidate("perenual", 22, "mentha spicata", None), 2);
        b.images = vec![image("https://img.example/m2.jpg", "perenual")];
        b.synonyms = vec!["Mentha viridis".to_string()];
        let mut odd = entity_from(&candidate("perenual", 33, "Mentha spicata", None), 4);
        odd.family = Some("Rosaceae".to_string());
        let loner = entity_from(&candidate("trefle", 44, "Mentha spicatta", None), 5);
        for e in [&manual, &a, &b, &odd, &loner] {
            store.seed_entity(e.clone()).await;
        }

        let engine = DedupEngine::default();
        let preview = engine.consolidate(&store, true, ts(9)).await.unwrap();
        assert!(preview.dry_run);
        assert_eq!(preview.deleted, 2);
        assert_eq!(store.entity_count().await, 5);

        let report = engine.consolidate(&store, false, ts(9)).await.unwrap();
        assert_eq!(report.groups_examined, 2);
        assert_eq!(report.duplicate_groups, 1);
        assert_eq!(report.merged, 2);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].entity_id, odd.id);
        assert_eq!(report.near_duplicates.len(), 1);
        assert_eq!(report.near_duplicates[0].name_a, "mentha spicata");
        assert_eq!(report.near_duplicates[0].name_b, "mentha spicatta");

        assert_eq!(store.entity_count().await, 3);
        assert!(store.entity(a.id).await.is_none());
        assert!(store.entity(b.id).await.is_none());
        assert!(store.entity(odd.id).await.is_some());

        let primary = store.entity(manual.id).await.unwrap();
        assert_eq!(primary.origin, EntityOrigin::Manual);
        assert_eq!(primary.display_name, "Spearmint");
        assert_eq!(primary.images.len(), 2);
        assert_eq!(primary.provenance.get("trefle"), Some(&11));
        assert_eq!(primary.provenance.get("perenual"), Some(&22));
        assert_eq!(primary.synonyms, vec!["Mentha viridis".to_string()]);
    }
}
