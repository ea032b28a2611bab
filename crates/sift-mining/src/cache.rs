//! URL/attribute freshness cache.
//!
//! Entries are keyed by `(url, attribute)` and record when the value was
//! last mined and under which schema version. Lookups never touch disk or
//! the network; persistence is an explicit snapshot.

use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sift_core::{composite_hash, Clock};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

type CacheKey = (String, String);

/// Record of one successful extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub last_mined_at: DateTime<Utc>,
    pub schema_version: String,
    pub ttl_ms: u64,
}

#[derive(Debug, Default)]
struct Slot {
    entry: Option<CacheEntry>,
    in_flight: bool,
}

/// Proof that the caller owns the in-flight claim on a key.
///
/// Must be settled with [`UrlCache::record_result`] or [`UrlCache::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a claim must be recorded or released"]
pub struct CacheClaim {
    url: String,
    attribute: String,
}

impl CacheClaim {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }
}

/// Result of an atomic freshness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// A fresh result exists; nothing to do.
    Fresh,
    /// The caller now owns the key and must mine it.
    Stale(CacheClaim),
    /// Another worker is mining this key right now.
    InFlight,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    url: String,
    attribute: String,
    last_mined_at: DateTime<Utc>,
    schema_version: String,
    ttl_ms: u64,
    checksum: String,
}

impl SnapshotRecord {
    fn checksum_of(
        url: &str,
        attribute: &str,
        at: &DateTime<Utc>,
        version: &str,
        ttl_ms: u64,
    ) -> String {
        composite_hash([
            url.as_bytes(),
            attribute.as_bytes(),
            at.to_rfc3339().as_bytes(),
            version.as_bytes(),
            &ttl_ms.to_le_bytes(),
        ])
    }

    fn is_intact(&self) -> bool {
        self.checksum
            == Self::checksum_of(
                &self.url,
                &self.attribute,
                &self.last_mined_at,
                &self.schema_version,
                self.ttl_ms,
            )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    schema_versions: Vec<(String, String)>,
    entries: Vec<Value>,
}

/// Shared freshness cache used by every worker.
pub struct UrlCache {
    slots: DashMap<CacheKey, Slot>,
    schema_versions: DashMap<String, String>,
    default_ttl_ms: u64,
    clock: Arc<dyn Clock>,
}

impl UrlCache {
    pub fn new(default_ttl_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            schema_versions: DashMap::new(),
            default_ttl_ms,
            clock,
        }
    }

    pub fn default_ttl_ms(&self) -> u64 {
        self.default_ttl_ms
    }

    /// Set the current schema version of an attribute.
    ///
    /// Returns `true` when a different version was registered before, in
    /// which case every cached result for the attribute is invalidated.
    pub fn register_schema_version(&self, attribute: &str, version: &str) -> bool {
        let previous = self
            .schema_versions
            .insert(attribute.to_string(), version.to_string());

        match previous {
            Some(prev) if prev != version => {
                let removed = self.invalidate(attribute);
                info!(
                    attribute,
                    from = %prev,
                    to = version,
                    removed,
                    "Schema version changed, cached results invalidated"
                );
                true
            }
            _ => false,
        }
    }

    pub fn current_schema_version(&self, attribute: &str) -> Option<String> {
        self.schema_versions.get(attribute).map(|v| v.value().clone())
    }

    /// Pure lookup: is there a fresh result for this key?
    pub fn is_fresh(&self, url: &str, attribute: &str) -> bool {
        let current = self.current_schema_version(attribute);
        let now = self.clock.now();
        self.slots
            .get(&(url.to_string(), attribute.to_string()))
            .and_then(|slot| {
                slot.entry
                    .as_ref()
                    .map(|e| entry_is_fresh(e, current.as_deref(), now))
            })
            .unwrap_or(false)
    }

    /// Check freshness and, when stale, claim the key in one step.
    pub fn check_and_claim(&self, url: &str, attribute: &str) -> Freshness {
        let current = self.current_schema_version(attribute);
        let now = self.clock.now();
        let mut slot = self
            .slots
            .entry((url.to_string(), attribute.to_string()))
            .or_default();

        if slot.in_flight {
            return Freshness::InFlight;
        }
        let fresh = slot
            .entry
            .as_ref()
            .is_some_and(|e| entry_is_fresh(e, current.as_deref(), now));
        if fresh {
            return Freshness::Fresh;
        }

        slot.in_flight = true;
        Freshness::Stale(CacheClaim {
            url: url.to_string(),
            attribute: attribute.to_string(),
        })
    }

    /// Record a successful extraction with the default TTL.
    pub fn record_result(&self, url: &str, attribute: &str, schema_version: &str) {
        self.record_result_with_ttl(url, attribute, schema_version, self.default_ttl_ms);
    }

    /// Record a successful extraction and drop any in-flight claim.
    pub fn record_result_with_ttl(
        &self,
        url: &str,
        attribute: &str,
        schema_version: &str,
        ttl_ms: u64,
    ) {
        let entry = CacheEntry {
            last_mined_at: self.clock.now(),
            schema_version: schema_version.to_string(),
            ttl_ms,
        };
        let mut slot = self
            .slots
            .entry((url.to_string(), attribute.to_string()))
            .or_default();
        slot.entry = Some(entry);
        slot.in_flight = false;
    }

    /// Give up a claim without recording a result.
    pub fn release(&self, claim: CacheClaim) {
        self.release_key(&claim.url, &claim.attribute);
    }

    pub(crate) fn release_key(&self, url: &str, attribute: &str) {
        let key = (url.to_string(), attribute.to_string());
        let mut remove = false;
        if let Some(mut slot) = self.slots.get_mut(&key) {
            slot.in_flight = false;
            remove = slot.entry.is_none();
        }
        if remove {
            self.slots.remove_if(&key, |_, slot| slot.entry.is_none() && !slot.in_flight);
        }
    }

    /// Drop every cached result for `attribute`. Returns the number removed.
    pub fn invalidate(&self, attribute: &str) -> usize {
        let mut removed = 0;
        self.slots.retain(|(_, attr), slot| {
            if attr != attribute || slot.entry.is_none() {
                return true;
            }
            removed += 1;
            slot.entry = None;
            slot.in_flight
        });
        removed
    }

    pub fn entry(&self, url: &str, attribute: &str) -> Option<CacheEntry> {
        self.slots
            .get(&(url.to_string(), attribute.to_string()))
            .and_then(|slot| slot.entry.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write all entries and schema versions to `path` as JSON.
    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let entries = self
            .slots
            .iter()
            .filter_map(|slot| {
                let (url, attribute) = slot.key();
                let entry = slot.entry.as_ref()?;
                let record = SnapshotRecord {
                    checksum: SnapshotRecord::checksum_of(
                        url,
                        attribute,
                        &entry.last_mined_at,
                        &entry.schema_version,
                        entry.ttl_ms,
                    ),
                    url: url.clone(),
                    attribute: attribute.clone(),
                    last_mined_at: entry.last_mined_at,
                    schema_version: entry.schema_version.clone(),
                    ttl_ms: entry.ttl_ms,
                };
                serde_json::to_value(record).ok()
            })
            .collect::<Vec<_>>();

        let snapshot = Snapshot {
            schema_versions: self
                .schema_versions
                .iter()
                .map(|kv| (kv.key().clone(), kv.value().clone()))
                .collect(),
            entries,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?).await?;
        tokio::fs::rename(&tmp, path).await?;

        info!(path = %path.display(), entries = snapshot.entries.len(), "Cache snapshot saved");
        Ok(())
    }

    /// Merge a snapshot written by [`save_snapshot`](Self::save_snapshot).
    ///
    /// Damaged records are skipped so that the affected keys read as stale.
    /// Returns the number of entries loaded.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        let now = self.clock.now();

        for (attribute, version) in snapshot.schema_versions {
            self.schema_versions.entry(attribute).or_insert(version);
        }

        let mut loaded = 0;
        let mut dropped = 0;
        for raw in snapshot.entries {
            let record = match serde_json::from_value::<SnapshotRecord>(raw) {
                Ok(record) if record.is_intact() => record,
                Ok(_) | Err(_) => {
                    dropped += 1;
                    continue;
                }
            };
            if record.schema_version.is_empty() || record.last_mined_at > now {
                dropped += 1;
                continue;
            }
            let mut slot = self.slots.entry((record.url, record.attribute)).or_default();
            slot.entry = Some(CacheEntry {
                last_mined_at: record.last_mined_at,
                schema_version: record.schema_version,
                ttl_ms: record.ttl_ms,
            });
            loaded += 1;
        }

        if dropped > 0 {
            warn!(path = %path.display(), dropped, "Dropped damaged cache records");
        }
        debug!(path = %path.display(), loaded, "Cache snapshot loaded");
        Ok(loaded)
    }
}

fn entry_is_fresh(entry: &CacheEntry, current_version: Option<&str>, now: DateTime<Utc>) -> bool {
    let Some(current) = current_version else {
        return false;
    };
    if entry.schema_version.is_empty() || entry.schema_version != current {
        return false;
    }
    if entry.ttl_ms == 0 || entry.last_mined_at > now {
        return false;
    }
    let Ok(ttl) = i64::try_from(entry.ttl_ms) else {
        return false;
    };
    now - entry.last_mined_at < ChronoDuration::milliseconds(ttl)
}
