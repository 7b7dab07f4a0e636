use std::env;

/// Packet cache tunables.
#[derive(Debug, Clone)]
pub struct PacketCacheConfig {
    /// Total entry limit, divided evenly across the shards.
    pub max_entries: usize,
    /// Number of lock stripes; fixed for the lifetime of the cache.
    pub shard_count: usize,
    /// Ceiling applied to a response's minimum TTL.
    pub max_ttl: u32,
    /// Responses with a shorter TTL than this are not worth a slot.
    pub min_ttl: u32,
    /// TTL for ServFail/Refused responses; zero disables caching them.
    pub temp_failure_ttl: u32,
    /// Serve-stale grace window in seconds.
    pub stale_ttl: u32,
    /// Serve stored TTLs as-is instead of aging them.
    pub dont_age: bool,
    /// Inserts drop instead of waiting for a contended shard lock.
    pub deferrable_insert_lock: bool,
}

impl Default for PacketCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 200_000,
            shard_count: 4,
            max_ttl: 86_400,
            min_ttl: 0,
            temp_failure_ttl: 60,
            stale_ttl: 60,
            dont_age: false,
            deferrable_insert_lock: true,
        }
    }
}

impl PacketCacheConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_entries: env::var("MIMIR_MAX_ENTRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_entries),
            shard_count: env::var("MIMIR_SHARD_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.shard_count),
            max_ttl: env::var("MIMIR_MAX_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_ttl),
            min_ttl: env::var("MIMIR_MIN_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_ttl),
            temp_failure_ttl: env::var("MIMIR_TEMP_FAILURE_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.temp_failure_ttl),
            stale_ttl: env::var("MIMIR_STALE_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.stale_ttl),
            dont_age: env::var("MIMIR_DONT_AGE")
                .map(|v| v.parse().unwrap_or(defaults.dont_age))
                .unwrap_or(defaults.dont_age),
            deferrable_insert_lock: env::var("MIMIR_DEFERRABLE_INSERT_LOCK")
                .map(|v| v.parse().unwrap_or(defaults.deferrable_insert_lock))
                .unwrap_or(defaults.deferrable_insert_lock),
        }
    }
}
