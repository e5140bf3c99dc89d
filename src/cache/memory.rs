//! Bounded in-process tier.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::traits::{CacheEntry, CacheStats, StatsRecorder, StorageTier, TierKind};

/// Default number of entries held in memory.
pub const DEFAULT_MEMORY_CAPACITY: usize = 200;

/// In-process cache tier with a fixed entry budget.
///
/// When full, inserting a new key evicts the key that was inserted first.
/// This is insertion order, not LRU: reads do not refresh a key's position,
/// and overwriting an existing key keeps its original slot.
pub struct MemoryTier {
  state: Mutex<MemoryState>,
  capacity: usize,
  stats: StatsRecorder,
}

#[derive(Default)]
struct MemoryState {
  entries: HashMap<String, CacheEntry>,
  /// Keys in insertion order
  order: VecDeque<String>,
}

impl MemoryState {
  fn remove(&mut self, key: &str) -> Option<CacheEntry> {
    let removed = self.entries.remove(key)?;
    if let Some(pos) = self.order.iter().position(|k| k == key) {
      self.order.remove(pos);
    }
    Some(removed)
  }
}

impl MemoryTier {
  pub fn new(capacity: usize) -> Self {
    Self {
      state: Mutex::new(MemoryState::default()),
      capacity: capacity.max(1),
      stats: StatsRecorder::default(),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Number of entries currently held, expired ones included.
  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Remove every entry carrying at least one of `tags`. Returns how many went.
  pub fn clear_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
    let mut state = self.lock();
    let doomed: Vec<String> = state
      .entries
      .iter()
      .filter(|(_, entry)| entry.has_any_tag(tags))
      .map(|(key, _)| key.clone())
      .collect();

    for key in &doomed {
      state.remove(key);
      self.stats.delete();
    }
    self.stats.shrink(doomed.len() as u64);
    doomed.len()
  }

  fn lock(&self) -> MutexGuard<'_, MemoryState> {
    // Poison is ignored: every mutation leaves whole entries behind.
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn lookup(&self, key: &str, count: bool) -> Option<CacheEntry> {
    let mut state = self.lock();
    let live = match state.entries.get(key).map(CacheEntry::is_live) {
      None => None,
      Some(true) => state.entries.get(key).cloned(),
      Some(false) => {
        state.remove(key);
        self.stats.shrink(1);
        None
      }
    };

    if count {
      match live {
        Some(_) => self.stats.hit(),
        None => self.stats.miss(),
      }
    }
    live
  }

  fn insert(&self, key: &str, entry: CacheEntry) {
    let mut state = self.lock();
    let is_new = !state.entries.contains_key(key);

    if is_new && state.entries.len() >= self.capacity {
      if let Some(oldest) = state.order.pop_front() {
        state.entries.remove(&oldest);
        self.stats.shrink(1);
      }
    }

    state.entries.insert(key.to_string(), entry);
    if is_new {
      state.order.push_back(key.to_string());
      self.stats.grow();
    }
    self.stats.set();
  }

  fn remove(&self, key: &str) -> bool {
    let removed = self.lock().remove(key).is_some();
    if removed {
      self.stats.delete();
      self.stats.shrink(1);
    }
    removed
  }
}

impl Default for MemoryTier {
  fn default() -> Self {
    Self::new(DEFAULT_MEMORY_CAPACITY)
  }
}

#[async_trait]
impl StorageTier for MemoryTier {
  fn kind(&self) -> TierKind {
    TierKind::Memory
  }

  async fn get(&self, key: &str) -> Option<CacheEntry> {
    self.lookup(key, true)
  }

  async fn set(&self, key: &str, entry: CacheEntry) -> bool {
    self.insert(key, entry);
    true
  }

  async fn delete(&self, key: &str) -> bool {
    self.remove(key)
  }

  async fn clear(&self) {
    let mut state = self.lock();
    state.entries.clear();
    state.order.clear();
    self.stats.set_size(0);
  }

  async fn has(&self, key: &str) -> bool {
    self.lookup(key, false).is_some()
  }

  fn stats(&self) -> CacheStats {
    self.stats.snapshot()
  }
}
