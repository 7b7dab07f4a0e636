use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder, opts};

use crate::cache::PacketCache;

/// Prometheus collectors mirroring the packet cache counters.
pub struct CacheMetrics {
    registry: Registry,

    hits: IntCounter,
    misses: IntCounter,
    deferred_inserts: IntCounter,
    deferred_lookups: IntCounter,
    insert_collisions: IntCounter,
    lookup_collisions: IntCounter,
    ttl_too_shorts: IntCounter,

    size: IntGauge,
    hit_rate: Gauge,
}

impl CacheMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let hits = IntCounter::with_opts(opts!(
            "mimir_cache_hits_total",
            "Queries answered from the cache"
        ))?;
        let misses = IntCounter::with_opts(opts!(
            "mimir_cache_misses_total",
            "Queries the cache could not answer"
        ))?;
        let deferred_inserts = IntCounter::with_opts(opts!(
            "mimir_cache_deferred_inserts_total",
            "Inserts dropped because the shard lock was busy"
        ))?;
        let deferred_lookups = IntCounter::with_opts(opts!(
            "mimir_cache_deferred_lookups_total",
            "Lookups reported as misses because the shard lock was busy"
        ))?;
        let insert_collisions = IntCounter::with_opts(opts!(
            "mimir_cache_insert_collisions_total",
            "Inserts refused because a different query owns the key"
        ))?;
        let lookup_collisions = IntCounter::with_opts(opts!(
            "mimir_cache_lookup_collisions_total",
            "Lookups refused because the stored entry is for a different query"
        ))?;
        let ttl_too_shorts = IntCounter::with_opts(opts!(
            "mimir_cache_ttl_too_shorts_total",
            "Responses not cached because their TTL was below the floor"
        ))?;
        let size = IntGauge::with_opts(opts!(
            "mimir_cache_size",
            "Entries currently cached (best-effort)"
        ))?;
        let hit_rate = Gauge::with_opts(opts!(
            "mimir_cache_hit_rate",
            "Fraction of lookups answered from the cache"
        ))?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(deferred_inserts.clone()))?;
        registry.register(Box::new(deferred_lookups.clone()))?;
        registry.register(Box::new(insert_collisions.clone()))?;
        registry.register(Box::new(lookup_collisions.clone()))?;
        registry.register(Box::new(ttl_too_shorts.clone()))?;
        registry.register(Box::new(size.clone()))?;
        registry.register(Box::new(hit_rate.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            deferred_inserts,
            deferred_lookups,
            insert_collisions,
            lookup_collisions,
            ttl_too_shorts,
            size,
            hit_rate,
        })
    }

    /// Refresh the collectors from the cache's live counters. Counters
    /// are reset and re-incremented so the exported values track the
    /// cache's monotonic totals.
    pub fn update_from(&self, cache: &PacketCache) {
        let snapshot = cache.stats().snapshot();

        self.hits.reset();
        self.hits.inc_by(snapshot.hits);
        self.misses.reset();
        self.misses.inc_by(snapshot.misses);
        self.deferred_inserts.reset();
        self.deferred_inserts.inc_by(snapshot.deferred_inserts);
        self.deferred_lookups.reset();
        self.deferred_lookups.inc_by(snapshot.deferred_lookups);
        self.insert_collisions.reset();
        self.insert_collisions.inc_by(snapshot.insert_collisions);
        self.lookup_collisions.reset();
        self.lookup_collisions.inc_by(snapshot.lookup_collisions);
        self.ttl_too_shorts.reset();
        self.ttl_too_shorts.inc_by(snapshot.ttl_too_shorts);

        self.size.set(cache.len() as i64);
        self.hit_rate.set(cache.stats().hit_rate());
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of the current collector values.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
