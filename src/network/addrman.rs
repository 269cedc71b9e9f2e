//! Address manager: seed addresses, cached peer addresses and the
//! currently-connected set.
//!
//! Seeds come from configuration and are never discarded. Cached addresses
//! are learned from peers and persisted to a newline-delimited file.
//! Persistence is best-effort; failures are logged, never propagated.

use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

/// File holding cached peer addresses, one per line.
pub const CACHE_FILE: &str = "addrs.cache";

struct Inner {
    seeds: Vec<String>,
    cached: Vec<String>,
    connected: HashSet<String>,
}

/// Thread-safe address book.
pub struct AddrManager {
    inner: RwLock<Inner>,
    cache_file: PathBuf,
}

impl AddrManager {
    /// Create a manager with the configured seeds, loading any previously
    /// cached addresses from `cache_file`.
    pub fn new(seeds: Vec<String>, cache_file: PathBuf) -> Self {
        let mut cached = Vec::new();
        if let Ok(data) = fs::read_to_string(&cache_file) {
            for line in data.lines() {
                let addr = line.trim();
                if !addr.is_empty() && !seeds.contains(&addr.to_string()) {
                    cached.push(addr.to_string());
                }
            }
        }
        Self {
            inner: RwLock::new(Inner {
                seeds,
                cached,
                connected: HashSet::new(),
            }),
            cache_file,
        }
    }

    /// Up to `count` random known addresses that are not connected.
    pub fn idle(&self, count: usize) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut idle: Vec<String> = inner
            .seeds
            .iter()
            .chain(inner.cached.iter())
            .filter(|addr| !inner.connected.contains(*addr))
            .cloned()
            .collect();
        idle.dedup();
        idle.shuffle(&mut rand::thread_rng());
        idle.truncate(count);
        idle
    }

    /// Record an address learned from a peer's `addr` message.
    pub fn learn(&self, addr: &str) {
        let mut inner = self.inner.write().unwrap();
        if !inner.seeds.iter().any(|s| s == addr) && !inner.cached.iter().any(|c| c == addr) {
            inner.cached.push(addr.to_string());
            self.save_cached(&inner);
        }
    }

    /// Mark an address connected, caching it if it is new.
    pub fn add(&self, addr: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.connected.insert(addr.to_string());
        if !inner.seeds.iter().any(|s| s == addr) && !inner.cached.iter().any(|c| c == addr) {
            inner.cached.push(addr.to_string());
            self.save_cached(&inner);
        }
    }

    /// Drop an address from the cache (it keeps misbehaving or is
    /// unreachable). Seeds are never discarded.
    pub fn discard(&self, addr: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(pos) = inner.cached.iter().position(|c| c == addr) {
            log::info!("discarding cached address {}", addr);
            inner.cached.remove(pos);
            self.save_cached(&inner);
        }
    }

    /// Remove an address from the connected set only.
    pub fn disconnected(&self, addr: &str) {
        self.inner.write().unwrap().connected.remove(addr);
    }

    pub fn connected_count(&self) -> usize {
        self.inner.read().unwrap().connected.len()
    }

    pub fn is_connected(&self, addr: &str) -> bool {
        self.inner.read().unwrap().connected.contains(addr)
    }

    fn save_cached(&self, inner: &Inner) {
        let mut data = String::new();
        for addr in &inner.cached {
            data.push_str(addr);
            data.push('\n');
        }
        if let Err(e) = fs::write(&self.cache_file, data) {
            log::warn!("failed to save {}: {}", self.cache_file.display(), e);
        }
    }
}
