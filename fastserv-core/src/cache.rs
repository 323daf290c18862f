//! Storage, lookup, invalidation and eviction of per-module attention state.
//!
//! One explicitly owned engine per model process (or several, side by side);
//! no global state. Lookups take the read lock and may run concurrently, all
//! mutation is serialized behind the write lock, and eviction happens
//! synchronously inside `insert`, so cache state is consistent the moment any
//! mutating call returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::backend::KvState;
use crate::error::InvalidKeyError;
use crate::schema::NodePath;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub schema_identity: u64,
    pub module_path: NodePath,
    pub param_hash: u64,
    pub model_id: String,
}

impl CacheKey {
    pub fn validate(&self) -> Result<(), InvalidKeyError> {
        if self.module_path.is_empty() {
            return Err(InvalidKeyError("empty module path".to_string()));
        }
        if self.model_id.is_empty() {
            return Err(InvalidKeyError("empty model id".to_string()));
        }
        Ok(())
    }
}

struct CacheEntry {
    state: Arc<KvState>,
    token_count: usize,
    size_bytes: usize,
    /// Logical access clock; bumped on every hit.
    last_access: AtomicU64,
    /// Insertion sequence number, the eviction tie-breaker.
    inserted_at: u64,
}

/// A read-only view of a cache hit. The underlying buffers may back any
/// number of concurrent assemblies; splicing copies, never mutates.
#[derive(Clone)]
pub struct CacheHit {
    pub state: Arc<KvState>,
    pub token_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The single entry exceeds the whole budget. Non-fatal: the request that
    /// produced it simply proceeds uncached for that module.
    RejectedOversized,
}

struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    used_bytes: usize,
}

pub struct CacheEngine {
    inner: RwLock<CacheInner>,
    budget_bytes: usize,
    clock: AtomicU64,
}

impl CacheEngine {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                used_bytes: 0,
            }),
            budget_bytes,
            clock: AtomicU64::new(0),
        }
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.read().expect("cache lock poisoned").used_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// O(1) average; bumps the entry's access time on a hit.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CacheHit>, InvalidKeyError> {
        key.validate()?;
        let inner = self.inner.read().expect("cache lock poisoned");
        Ok(inner.entries.get(key).map(|entry| {
            entry
                .last_access
                .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
            CacheHit {
                state: Arc::clone(&entry.state),
                token_count: entry.token_count,
            }
        }))
    }

    /// Insert a module's state, evicting least-recently-used entries first
    /// until the byte budget holds.
    pub fn insert(&self, key: CacheKey, state: KvState) -> Result<InsertOutcome, InvalidKeyError> {
        key.validate()?;
        let size_bytes = state.size_bytes();
        if size_bytes > self.budget_bytes {
            warn!(
                module = %key.module_path,
                size_bytes,
                budget = self.budget_bytes,
                "module state exceeds the whole cache budget, serving uncached"
            );
            return Ok(InsertOutcome::RejectedOversized);
        }

        let mut inner = self.inner.write().expect("cache lock poisoned");
        if let Some(old) = inner.entries.remove(&key) {
            inner.used_bytes -= old.size_bytes;
        }
        while inner.used_bytes + size_bytes > self.budget_bytes {
            let Some(victim) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.last_access.load(Ordering::Relaxed), e.inserted_at))
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            let evicted = inner.entries.remove(&victim).expect("victim just found");
            inner.used_bytes -= evicted.size_bytes;
            debug!(module = %victim.module_path, freed = evicted.size_bytes, "evicted cache entry");
        }

        let token_count = state.seq_len();
        let now = self.clock.fetch_add(1, Ordering::Relaxed);
        inner.entries.insert(
            key,
            CacheEntry {
                state: Arc::new(state),
                token_count,
                size_bytes,
                last_access: AtomicU64::new(now),
                inserted_at: now,
            },
        );
        inner.used_bytes += size_bytes;
        Ok(InsertOutcome::Inserted)
    }

    /// Drop every entry for a schema identity. Idempotent.
    pub fn invalidate_schema(&self, schema_identity: u64) -> usize {
        self.retain(|key| key.schema_identity != schema_identity)
    }

    /// Drop every entry for a model identity. Idempotent.
    pub fn invalidate_model(&self, model_id: &str) -> usize {
        self.retain(|key| key.model_id != model_id)
    }

    fn retain(&self, keep: impl Fn(&CacheKey) -> bool) -> usize {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        let before = inner.entries.len();
        let mut freed = 0;
        inner.entries.retain(|key, entry| {
            let kept = keep(key);
            if !kept {
                freed += entry.size_bytes;
            }
            kept
        });
        inner.used_bytes -= freed;
        before - inner.entries.len()
    }
}
