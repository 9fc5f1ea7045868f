//! Bounded pool of loaded speech models.
//!
//! Models are expensive to load and dominate latency for short inputs, so
//! the pool keeps them resident: lazy load on first demand, LRU eviction
//! when the global bound is hit, and automatic fallback to the next-smaller
//! tier when a load reports out-of-memory.
//!
//! Bookkeeping (free lists, loaded set, counters) lives behind one mutex;
//! the actual load happens outside it so a slow load never blocks other
//! tiers. Waiters park on a [`Notify`] until a release or eviction frees
//! capacity, up to the acquire timeout.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::kernel::engine::ModelTier;

// ============================================================================
// Loader contract
// ============================================================================

/// A model the loader has brought into memory.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub tier: ModelTier,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("out of memory loading {0} model")]
    OutOfMemory(ModelTier),
    #[error("model load failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, tier: ModelTier) -> Result<LoadedModel, LoadError>;
}

/// Loader for subprocess engines: the engine process maps the model itself,
/// so loading here is capacity accounting with per-tier memory estimates.
pub struct StaticModelLoader;

#[async_trait]
impl ModelLoader for StaticModelLoader {
    async fn load(&self, tier: ModelTier) -> Result<LoadedModel, LoadError> {
        let memory_bytes = match tier {
            ModelTier::Tiny => 72 << 20,
            ModelTier::Base => 139 << 20,
            ModelTier::Small => 461 << 20,
            ModelTier::Medium => 1_500 << 20,
            ModelTier::Large => 2_900 << 20,
        };
        Ok(LoadedModel { tier, memory_bytes })
    }
}

// ============================================================================
// Pool
// ============================================================================

/// A borrowed model. Returned by [`ModelPool::acquire`]; must be handed back
/// with [`ModelPool::release`].
#[derive(Debug, Clone)]
pub struct ModelLease {
    pub id: u64,
    pub tier: ModelTier,
    pub loaded_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub use_count: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out waiting for a {0} model")]
    AcquireTimeout(ModelTier),
    #[error("out of memory loading {0} and no smaller tier to fall back to")]
    OutOfMemory(ModelTier),
    #[error("model load failed: {0}")]
    Load(String),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Soft cap of free handles kept per tier.
    pub pool_size: usize,
    /// Hard cap of simultaneously loaded models across all tiers.
    pub max_pool_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            max_pool_size: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub oom_fallbacks: u64,
    pub total_loaded: usize,
    pub free_by_tier: HashMap<ModelTier, usize>,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct ModelEntry {
    id: u64,
    tier: ModelTier,
    loaded_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    use_count: u64,
    memory_bytes: u64,
}

#[derive(Default)]
struct PoolState {
    free: HashMap<ModelTier, VecDeque<u64>>,
    entries: HashMap<u64, ModelEntry>,
    borrowed: HashSet<u64>,
    loading: usize,
    next_id: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    oom_fallbacks: u64,
}

impl ModelEntry {
    fn lease(&self) -> ModelLease {
        ModelLease {
            id: self.id,
            tier: self.tier,
            loaded_at: self.loaded_at,
            last_used: self.last_used,
            use_count: self.use_count,
            memory_bytes: self.memory_bytes,
        }
    }
}

impl PoolState {
    /// Globally least-recently-used free entry: oldest `last_used`,
    /// tie-break on lowest `use_count`. Borrowed handles are never
    /// candidates.
    fn lru_free_candidate(&self) -> Option<u64> {
        self.entries
            .values()
            .filter(|e| !self.borrowed.contains(&e.id))
            .min_by_key(|e| (e.last_used, e.use_count))
            .map(|e| e.id)
    }

    fn remove_entry(&mut self, id: u64) -> Option<ModelTier> {
        let entry = self.entries.remove(&id)?;
        if let Some(queue) = self.free.get_mut(&entry.tier) {
            queue.retain(|&queued| queued != id);
        }
        Some(entry.tier)
    }
}

pub struct ModelPool {
    loader: Arc<dyn ModelLoader>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    notify: Notify,
}

impl ModelPool {
    pub fn new(loader: Arc<dyn ModelLoader>, config: PoolConfig) -> Self {
        info!(
            pool_size = config.pool_size,
            max_pool_size = config.max_pool_size,
            "model pool initialized"
        );
        Self {
            loader,
            config,
            state: Mutex::new(PoolState::default()),
            notify: Notify::new(),
        }
    }

    /// Acquire a model of `tier`, waiting up to `timeout` when the pool is
    /// at capacity with every handle borrowed. Falls back to smaller tiers
    /// on out-of-memory loads.
    pub async fn acquire(
        &self,
        tier: ModelTier,
        timeout: Duration,
    ) -> Result<ModelLease, PoolError> {
        let requested = tier;
        let deadline = Instant::now() + timeout;
        let mut tier = tier;

        loop {
            let must_wait = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

                // Fast path: a free handle of the requested tier.
                if let Some(id) = state.free.get_mut(&tier).and_then(|q| q.pop_front()) {
                    state.hits += 1;
                    state.borrowed.insert(id);
                    if let Some(entry) = state.entries.get_mut(&id) {
                        entry.last_used = Utc::now();
                        entry.use_count += 1;
                        debug!(tier = %tier, use_count = entry.use_count, "model pool hit");
                        return Ok(entry.lease());
                    }
                }

                // Slow path: load a new model, evicting the LRU free handle
                // when the pool is at capacity.
                let mut must_wait = false;
                if state.entries.len() + state.loading >= self.config.max_pool_size {
                    match state.lru_free_candidate() {
                        Some(victim) => {
                            if let Some(victim_tier) = state.remove_entry(victim) {
                                state.evictions += 1;
                                info!(tier = %victim_tier, "evicted LRU model");
                            }
                        }
                        None => {
                            // Everything loaded is borrowed: wait for a release.
                            must_wait = true;
                        }
                    }
                }

                if !must_wait {
                    state.misses += 1;
                    state.loading += 1;
                }
                must_wait
            };

            if must_wait {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if timeout_at(deadline, notified).await.is_err() {
                    return Err(PoolError::AcquireTimeout(requested));
                }
                continue;
            }

            // Load outside the lock; the reserved slot keeps the bound.
            match self.loader.load(tier).await {
                Ok(model) => {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.loading -= 1;
                    let id = state.next_id;
                    state.next_id += 1;
                    let now = Utc::now();
                    let entry = ModelEntry {
                        id,
                        tier: model.tier,
                        loaded_at: now,
                        last_used: now,
                        use_count: 1,
                        memory_bytes: model.memory_bytes,
                    };
                    let lease = entry.lease();
                    state.entries.insert(id, entry);
                    state.borrowed.insert(id);
                    info!(
                        tier = %lease.tier,
                        total_loaded = state.entries.len(),
                        "loaded model into pool"
                    );
                    return Ok(lease);
                }
                Err(LoadError::OutOfMemory(_)) => {
                    {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.loading -= 1;
                        state.oom_fallbacks += 1;
                    }
                    self.notify.notify_waiters();

                    match tier.next_smaller() {
                        Some(smaller) => {
                            warn!(from = %tier, to = %smaller, "OOM loading model, falling back");
                            tier = smaller;
                            continue;
                        }
                        None => return Err(PoolError::OutOfMemory(requested)),
                    }
                }
                Err(LoadError::Other(message)) => {
                    {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.loading -= 1;
                    }
                    self.notify.notify_waiters();
                    return Err(PoolError::Load(message));
                }
            }
        }
    }

    /// Return a borrowed model. If the tier's free set is already at the
    /// soft cap, the handle is unloaded instead of kept.
    pub fn release(&self, lease: ModelLease) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if !state.borrowed.remove(&lease.id) {
            return;
        }

        let free_len = state.free.get(&lease.tier).map(|q| q.len()).unwrap_or(0);
        if free_len >= self.config.pool_size {
            debug!(tier = %lease.tier, "per-tier free set full, unloading model");
            state.entries.remove(&lease.id);
        } else {
            state.free.entry(lease.tier).or_default().push_back(lease.id);
        }

        drop(state);
        self.notify.notify_waiters();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut free_by_tier = HashMap::new();
        for (tier, queue) in &state.free {
            if !queue.is_empty() {
                free_by_tier.insert(*tier, queue.len());
            }
        }
        let lookups = state.hits + state.misses;
        PoolStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            oom_fallbacks: state.oom_fallbacks,
            total_loaded: state.entries.len(),
            free_by_tier,
            hit_rate: if lookups > 0 {
                state.hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}
