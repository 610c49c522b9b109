//! Target registry: the single source of truth for monitored targets.
//!
//! No two stored targets share a URL comparison key. Seeding and
//! administrative adds that collide with an existing target are merged
//! into it instead of failing.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{MonitorTarget, Proof, Store};
use crate::error::MonitorError;
use crate::normalize::{
    build_url_comparison_key, collapse_whitespace, generate_normalized_key, normalize_to_canonical,
    normalize_url_for_storage, strip_mirror_suffix,
};
use crate::planner::{base_name_key, tag_preference, UNKNOWN_GROUP};
use crate::seed::{SeedTarget, PRIORITY_SERVICES};

/// Category used when none is given.
pub const DEFAULT_CATEGORY: &str = "Other";

pub struct Registry {
    store: Arc<Store>,
    seeds: Vec<SeedTarget>,
    // Serializes read-check-write sequences so dedup decisions hold.
    write_lock: Mutex<()>,
}

impl Registry {
    pub fn new(store: Arc<Store>, seeds: Vec<SeedTarget>) -> Self {
        Self {
            store,
            seeds,
            write_lock: Mutex::new(()),
        }
    }

    /// Merge the seed list into the store. Safe to call on every startup.
    ///
    /// Returns the number of targets inserted or updated.
    pub fn ensure_seed_data(&self) -> Result<usize, MonitorError> {
        let _guard = self.write_lock.lock();
        let mut snapshot = self.store.load_all()?;

        let mut by_key: HashMap<String, usize> = HashMap::new();
        for (idx, target) in snapshot.iter().enumerate() {
            by_key.entry(build_url_comparison_key(&target.url)).or_insert(idx);
        }
        let mut urls_in_use: HashMap<String, i64> =
            snapshot.iter().map(|t| (t.url.clone(), t.id)).collect();

        let mut seen_seed_keys = HashSet::new();
        let mut touched: Vec<usize> = Vec::new();
        let mut inserts: Vec<MonitorTarget> = Vec::new();

        for seed in &self.seeds {
            let name = collapse_whitespace(&seed.name);
            let stored_url = normalize_url_for_storage(&seed.url);
            if name.is_empty() || stored_url.is_empty() {
                warn!("Skipping incomplete seed {:?}", seed);
                continue;
            }
            let key = build_url_comparison_key(&stored_url);
            if !seen_seed_keys.insert(key.clone()) {
                debug!("Seed {} duplicates an earlier seed, skipping", name);
                continue;
            }
            let category = canonical_category_in(&seed.category, &snapshot, &self.seeds);

            match by_key.get(&key) {
                Some(&idx) => {
                    let existing = &mut snapshot[idx];
                    let mut modified = set_name(existing, &name);
                    if existing.description != category {
                        existing.description = category;
                        modified = true;
                    }
                    if existing.url != stored_url {
                        match urls_in_use.get(&stored_url) {
                            Some(&owner) if owner != existing.id => {
                                warn!(
                                    "Seed URL {} already belongs to target {}, keeping {}",
                                    stored_url, owner, existing.url
                                );
                            }
                            _ => {
                                urls_in_use.remove(&existing.url);
                                urls_in_use.insert(stored_url.clone(), existing.id);
                                existing.url = stored_url;
                                modified = true;
                            }
                        }
                    }
                    if modified {
                        touched.push(idx);
                    }
                }
                None => {
                    if urls_in_use.contains_key(&stored_url) {
                        continue;
                    }
                    urls_in_use.insert(stored_url.clone(), 0);
                    let mut target = MonitorTarget {
                        description: category,
                        url: stored_url,
                        ..Default::default()
                    };
                    set_name(&mut target, &name);
                    inserts.push(target);
                }
            }
        }

        let changed = touched.len() + inserts.len();
        if changed > 0 {
            let mut batch: Vec<MonitorTarget> = touched.iter().map(|&i| snapshot[i].clone()).collect();
            batch.append(&mut inserts);
            self.store.save_changes(&mut batch)?;
            info!("Seed data merged: {} inserted or updated", changed);
        }

        self.relink_mirrors()?;
        Ok(changed)
    }

    /// Add a target, or merge into the one already using the same URL.
    pub fn add(
        &self,
        name: &str,
        description: &str,
        url: &str,
        proof: Option<Proof>,
    ) -> Result<MonitorTarget, MonitorError> {
        let _guard = self.write_lock.lock();

        let name = collapse_whitespace(name);
        if name.is_empty() {
            return Err(MonitorError::InvalidInput("name is required".to_string()));
        }
        let stored_url = normalize_url_for_storage(url);
        if stored_url.is_empty() {
            return Err(MonitorError::InvalidInput("url is required".to_string()));
        }
        let key = build_url_comparison_key(&stored_url);
        let proof = proof.filter(|p| !p.content.trim().is_empty());

        let snapshot = self.store.load_all()?;
        let category = canonical_category_in(description, &snapshot, &self.seeds);

        if let Some(existing) = snapshot.iter().find(|t| build_url_comparison_key(&t.url) == key) {
            let mut existing = existing.clone();
            let mut changed = false;

            let placeholder = existing.description.trim().is_empty()
                || existing.description.eq_ignore_ascii_case(DEFAULT_CATEGORY);
            if placeholder && !category.eq_ignore_ascii_case(DEFAULT_CATEGORY) {
                existing.description = category;
                changed = true;
            }

            if let Some(mut proof) = proof {
                let known = existing
                    .proofs
                    .iter()
                    .any(|p| p.content.trim() == proof.content.trim());
                if !known {
                    proof.target_id = existing.id;
                    existing.proofs.push(proof);
                    changed = true;
                }
            }

            if changed {
                self.store.save_changes(std::slice::from_mut(&mut existing))?;
            }
            info!("Add merged into existing target {} ({})", existing.id, existing.url);
            return Ok(existing);
        }

        let display = resolve_canonical_name_in(&name, &snapshot);
        let mut target = MonitorTarget {
            description: category,
            url: stored_url,
            ..Default::default()
        };
        set_name(&mut target, &display);
        if let Some(proof) = proof {
            target.proofs.push(proof);
        }

        self.store.save_changes(std::slice::from_mut(&mut target))?;
        info!("Added target {} '{}' at {}", target.id, target.name, target.url);

        self.relink_mirrors()?;
        Ok(self.store.get_target(target.id)?.unwrap_or(target))
    }

    /// Display name a new entry called `candidate` should use so that a
    /// family of mirrors keeps one base name.
    pub fn resolve_canonical_name(&self, candidate: &str) -> Result<String, MonitorError> {
        let snapshot = self.store.load_all()?;
        Ok(resolve_canonical_name_in(&collapse_whitespace(candidate), &snapshot))
    }

    /// Canonical category label for free text.
    pub fn canonical_category(&self, raw: &str) -> Result<String, MonitorError> {
        let snapshot = self.store.load_all()?;
        Ok(canonical_category_in(raw, &snapshot, &self.seeds))
    }

    /// Administrative edit. Returns `None` when the target no longer exists.
    pub fn update(
        &self,
        id: i64,
        name: &str,
        description: &str,
        url: &str,
    ) -> Result<Option<MonitorTarget>, MonitorError> {
        let _guard = self.write_lock.lock();
        let snapshot = self.store.load_all()?;
        let Some(current) = snapshot.iter().find(|t| t.id == id) else {
            return Ok(None);
        };

        let name = collapse_whitespace(name);
        if name.is_empty() {
            return Err(MonitorError::InvalidInput("name is required".to_string()));
        }
        let stored_url = normalize_url_for_storage(url);
        if stored_url.is_empty() {
            return Err(MonitorError::InvalidInput("url is required".to_string()));
        }
        let key = build_url_comparison_key(&stored_url);
        if snapshot
            .iter()
            .any(|t| t.id != id && build_url_comparison_key(&t.url) == key)
        {
            return Err(MonitorError::DuplicateUrl(stored_url));
        }

        let mut target = current.clone();
        set_name(&mut target, &name);
        target.description = canonical_category_in(description, &snapshot, &self.seeds);
        target.url = stored_url;

        self.store.save_changes(std::slice::from_mut(&mut target))?;
        self.relink_mirrors()?;
        Ok(self.store.get_target(id)?)
    }

    /// Delete a target and its proofs. Returns false for unknown ids.
    pub fn remove(&self, id: i64) -> Result<bool, MonitorError> {
        let _guard = self.write_lock.lock();
        let removed = self.store.delete_target(id)?;
        if removed {
            info!("Removed target {}", id);
            self.relink_mirrors()?;
        }
        Ok(removed)
    }

    /// All targets ordered by category, then name.
    pub fn get_all(&self) -> Result<Vec<MonitorTarget>, MonitorError> {
        let mut targets = self.store.load_all()?;
        targets.sort_by(|a, b| {
            a.description
                .to_lowercase()
                .cmp(&b.description.to_lowercase())
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(targets)
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<MonitorTarget>, MonitorError> {
        Ok(self.store.get_target(id)?)
    }

    pub fn get_proof_by_id(&self, proof_id: i64) -> Result<Option<Proof>, MonitorError> {
        Ok(self.store.get_proof(proof_id)?)
    }

    /// Count a click. Mirrors roll their clicks up to the parent, but the
    /// returned URL is always the clicked target's own.
    pub fn register_click(&self, id: i64) -> Result<Option<String>, MonitorError> {
        let Some(target) = self.store.get_target(id)? else {
            return Ok(None);
        };

        let counted = match (target.is_mirror, target.parent_id) {
            (true, Some(parent)) => parent,
            _ => target.id,
        };
        if !self.store.increment_clicks(counted)? && counted != target.id {
            // Parent vanished under us; keep the click.
            self.store.increment_clicks(target.id)?;
        }

        Ok(Some(target.url))
    }

    /// Most clicked primaries. When too few have been clicked, well-known
    /// services fill the gaps, then whatever ranks next.
    pub fn get_top_by_clicks(&self, take: usize) -> Result<Vec<MonitorTarget>, MonitorError> {
        if take == 0 {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<MonitorTarget> = self
            .store
            .load_all()?
            .into_iter()
            .filter(|t| !t.is_mirror || t.parent_id.is_none())
            .collect();
        candidates.sort_by(|a, b| {
            b.click_count
                .cmp(&a.click_count)
                .then_with(|| a.display_name().to_lowercase().cmp(&b.display_name().to_lowercase()))
        });

        let mut top: Vec<MonitorTarget> = candidates
            .iter()
            .filter(|t| t.click_count > 0)
            .take(take)
            .cloned()
            .collect();
        if top.len() >= take {
            return Ok(top);
        }

        let mut seen: HashSet<i64> = top.iter().map(|t| t.id).collect();
        for needle in PRIORITY_SERVICES {
            if top.len() >= take {
                break;
            }
            let found = candidates
                .iter()
                .find(|t| !seen.contains(&t.id) && names_service(t, needle));
            if let Some(target) = found {
                seen.insert(target.id);
                top.push(target.clone());
            }
        }

        for target in &candidates {
            if top.len() >= take {
                break;
            }
            if seen.insert(target.id) {
                top.push(target.clone());
            }
        }

        Ok(top)
    }

    fn relink_mirrors(&self) -> Result<usize, MonitorError> {
        let mut snapshot = self.store.load_all()?;
        let changed = link_mirror_families(&mut snapshot);
        if changed.is_empty() {
            return Ok(0);
        }

        let batch: Vec<MonitorTarget> = changed.iter().map(|&i| snapshot[i].clone()).collect();
        self.store.save_mirror_links(&batch)?;
        debug!("Relinked {} mirror rows", batch.len());
        Ok(batch.len())
    }
}

/// Recompute mirror relationships from names.
///
/// Targets whose names share a base-name key (the same grouping sweeps
/// plan with) form a family whose best-tagged member (lowest id on ties)
/// is the primary; the rest become its mirrors, ranked by id. Nameless
/// targets are never linked. Returns the indices of targets whose mirror
/// fields changed.
pub fn link_mirror_families(targets: &mut [MonitorTarget]) -> Vec<usize> {
    let mut families: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, target) in targets.iter().enumerate() {
        let key = base_name_key(&target.name);
        if key != UNKNOWN_GROUP {
            families.entry(key).or_default().push(idx);
        }
    }

    let mut assignments: Vec<(bool, Option<i64>, i32)> = vec![(false, None, 0); targets.len()];
    for members in families.values() {
        if members.len() < 2 {
            continue;
        }

        let primary = *members
            .iter()
            .min_by(|&&a, &&b| {
                tag_preference(&targets[a].name)
                    .cmp(&tag_preference(&targets[b].name))
                    .then_with(|| targets[a].id.cmp(&targets[b].id))
            })
            .unwrap_or(&members[0]);
        let primary_id = targets[primary].id;

        let mut rest: Vec<usize> = members.iter().copied().filter(|&i| i != primary).collect();
        rest.sort_by_key(|&i| targets[i].id);
        for (rank, idx) in rest.into_iter().enumerate() {
            assignments[idx] = (true, Some(primary_id), rank as i32 + 1);
        }
    }

    let mut changed = Vec::new();
    for (idx, target) in targets.iter_mut().enumerate() {
        let (is_mirror, parent_id, priority) = assignments[idx];
        if target.is_mirror != is_mirror || target.parent_id != parent_id || target.mirror_priority != priority {
            target.is_mirror = is_mirror;
            target.parent_id = parent_id;
            target.mirror_priority = priority;
            changed.push(idx);
        }
    }
    changed
}

/// Substring match tolerant of spacing: "DuckDuckGo" names "duckduckgo".
fn names_service(target: &MonitorTarget, needle: &str) -> bool {
    let compact: String = needle.chars().filter(|c| c.is_alphanumeric()).collect();
    target.name.to_lowercase().contains(needle)
        || (!compact.is_empty() && target.normalized_key.contains(&compact))
}

fn set_name(target: &mut MonitorTarget, name: &str) -> bool {
    let canonical = normalize_to_canonical(name);
    let key = generate_normalized_key(name);
    let changed = target.name != name || target.canonical_name != canonical || target.normalized_key != key;
    target.name = name.to_string();
    target.canonical_name = canonical;
    target.normalized_key = key;
    changed
}

fn resolve_canonical_name_in(candidate: &str, snapshot: &[MonitorTarget]) -> String {
    let lowered = candidate.to_lowercase();

    if let Some(existing) = snapshot.iter().find(|t| t.name.to_lowercase() == lowered) {
        return existing.name.clone();
    }

    let mirror_prefix = format!("{} (mirror", lowered);
    if let Some(existing) = snapshot
        .iter()
        .find(|t| t.name.to_lowercase().starts_with(&mirror_prefix))
    {
        return strip_mirror_suffix(&existing.name);
    }

    candidate.to_string()
}

fn canonical_category_in(raw: &str, snapshot: &[MonitorTarget], seeds: &[SeedTarget]) -> String {
    let collapsed = collapse_whitespace(raw);
    if collapsed.is_empty() {
        return DEFAULT_CATEGORY.to_string();
    }

    let in_use = snapshot.iter().map(|t| t.description.as_str());
    let seeded = seeds.iter().map(|s| s.category.as_str());
    in_use
        .chain(seeded)
        .map(collapse_whitespace)
        .find(|c| !c.is_empty() && c.to_lowercase() == collapsed.to_lowercase())
        .unwrap_or(collapsed)
}
