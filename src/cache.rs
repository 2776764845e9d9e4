//! # Result Cache
//!
//! Content-addressable key/value store that memoizes completed aggregated
//! results and the per-user tile/project-set handle.
//!
//! Failure semantics: a backend problem on read degrades to a miss (the
//! request recomputes), a failed write is logged and swallowed (the already
//! computed result is still returned). Concurrent identical requests may
//! both miss and both recompute; last writer wins. That race is accepted,
//! not a bug to fix here.

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::types::{SimulationKind, UserId};

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries held in memory.
    pub max_items: usize,
    /// Disable to force recomputation of every request.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 10_000,
            enabled: true,
        }
    }
}

/// In-memory content-addressable cache.
///
/// Values are stored JSON-serialized so the store stays homogeneous and the
/// serialized form matches what an external store (e.g. Redis) would hold.
pub struct ResultCache {
    config: CacheConfig,
    entries: DashMap<String, String>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Look up a key. Any failure (including a value that no longer
    /// deserializes) is reported as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.config.enabled {
            return None;
        }

        match self.entries.get(key) {
            Some(entry) => match serde_json::from_str(entry.value()) {
                Ok(value) => {
                    debug!("cache hit: {}", key);
                    Some(value)
                }
                Err(e) => {
                    warn!("cache entry for {} is unreadable, treating as miss: {}", key, e);
                    None
                }
            },
            None => {
                debug!("cache miss: {}", key);
                None
            }
        }
    }

    /// Store a value. A failed write must never fail the overall request, so
    /// errors are logged and dropped.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) {
        if !self.config.enabled {
            return;
        }

        let serialized = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to serialize cache value for {}: {}", key, e);
                return;
            }
        };

        if self.entries.len() >= self.config.max_items && !self.entries.contains_key(key) {
            warn!("cache full ({} items), dropping write for {}", self.entries.len(), key);
            return;
        }

        self.entries.insert(key.to_string(), serialized);
        debug!("cache set: {}", key);
    }

    /// Remove a key, e.g. when a per-user project set was invalidated.
    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
        debug!("cache delete: {}", key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Cache Keys
// ============================================================================

/// The engine's cache key vocabulary. Keys are built here and nowhere else;
/// callers never infer cacheability from argument shapes.
pub struct CacheKeys;

impl CacheKeys {
    /// Key of a completed aggregated result. Stable across process restarts.
    pub fn result(kind: SimulationKind, building_set_hash: &str, settings_hash: &str) -> String {
        format!("{kind}_{building_set_hash}_{settings_hash}")
    }

    /// Key of the per-user tile/project-set handle.
    pub fn projects(user: &UserId) -> String {
        format!("infrared_projects_{user}")
    }
}

// ============================================================================
// Canonical Content Hashing
// ============================================================================

/// Hash a JSON value canonically: object keys are emitted in sorted order
/// (serde_json's default map representation), so two structurally equal
/// payloads hash identically regardless of original key order.
pub fn canonical_hash(value: &serde_json::Value) -> String {
    let canonical = value.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash a serializable settings value.
pub fn hash_settings<T: Serialize>(settings: &T) -> String {
    match serde_json::to_value(settings) {
        Ok(value) => canonical_hash(&value),
        Err(e) => {
            // Unreachable for our own types; fall back to a hash of the
            // error text so a key is still produced deterministically.
            warn!("failed to canonicalize settings for hashing: {}", e);
            canonical_hash(&serde_json::Value::String(e.to_string()))
        }
    }
}

/// Hash a building snapshot. Features are hashed individually and the
/// digests sorted before the final hash, so feature ordering does not
/// change the key.
pub fn hash_building_set(fc: &geojson::FeatureCollection) -> String {
    let mut digests: Vec<String> = fc
        .features
        .iter()
        .map(|feature| {
            let value = serde_json::to_value(feature).unwrap_or(serde_json::Value::Null);
            canonical_hash(&value)
        })
        .collect();
    digests.sort();

    let mut hasher = Sha256::new();
    for digest in &digests {
        hasher.update(digest.as_bytes());
    }
    hex::encode(hasher.finalize())
}
