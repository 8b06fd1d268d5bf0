use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::debug;

/// Expiring key-value store the console keeper reads session records from.
///
/// `set` reports success as a plain flag. Callers treat a `false` as a
/// bookkeeping miss, never as a request failure, and nothing retries.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn set(&self, key: &[u8], value: &str) -> bool;
}

#[derive(Clone)]
pub struct RedisSessionStore {
    redis: ConnectionManager,
    ttl: Option<Duration>,
}

impl RedisSessionStore {
    pub async fn new(redis_url: &str, ttl: Option<Duration>) -> anyhow::Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;

        Ok(Self { redis, ttl })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn set(&self, key: &[u8], value: &str) -> bool {
        let mut conn = self.redis.clone();
        let result = match self.ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await,
            None => conn.set::<_, _, ()>(key, value).await,
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "redis session write failed");
                false
            }
        }
    }
}

/// Records kept by [`MemorySessionStore::new`] before the oldest is dropped.
pub const DEFAULT_MEMORY_STORE_CAPACITY: usize = 10_000;

struct MemoryEntry {
    value: String,
    sequence: u64,
    expires_at: Option<Instant>,
}

/// Process-local store used when no Redis is configured.
///
/// Holds at most `capacity` records; once full, the oldest write is dropped.
pub struct MemorySessionStore {
    entries: DashMap<Vec<u8>, MemoryEntry>,
    ttl: Option<Duration>,
    capacity: usize,
    next_sequence: AtomicU64,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MemorySessionStore {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self::with_capacity(ttl, DEFAULT_MEMORY_STORE_CAPACITY)
    }

    pub fn with_capacity(ttl: Option<Duration>, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
            next_sequence: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<String> {
        {
            let entry = self.entries.get(key)?;
            match entry.expires_at {
                Some(deadline) if Instant::now() >= deadline => {}
                _ => return Some(entry.value.clone()),
            }
        }
        self.entries.remove(key);
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.sequence)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn set(&self, key: &[u8], value: &str) -> bool {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |deadline| deadline > now));
        if !self.entries.contains_key(key) {
            while self.entries.len() >= self.capacity {
                debug!("memory session store full; dropping oldest record");
                self.evict_oldest();
            }
        }
        self.entries.insert(
            key.to_vec(),
            MemoryEntry {
                value: value.to_string(),
                sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
                expires_at: self.ttl.map(|ttl| now + ttl),
            },
        );
        true
    }
}
