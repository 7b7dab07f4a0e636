//! Sharded, TTL-bounded cache for wire-format DNS responses.
//!
//! The cache keys a query to a previously observed response and hands
//! the stored bytes back with the caller's transaction id and freshly
//! aged TTLs. Lookups and inserts on the hot path never wait for a
//! contended shard: a busy read lock reports a miss, a busy write lock
//! (when configured as deferrable) drops the insert, and counters
//! record both so operators can see the contention.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::config::PacketCacheConfig;
use crate::dns::{self, HEADER_SIZE, QTYPE_ANY, RCODE_REFUSED, RCODE_SERVFAIL, WireName};
use crate::error::{CacheError, Result};
use crate::hash::burtle;

/// Transport a query arrived over. Entries never cross transports: a
/// TCP answer may exceed what the UDP path is allowed to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Transport {
    Udp = 0,
    Tcp = 1,
}

/// A query as the lookup path sees it: the raw wire bytes plus the
/// question fields the pipeline has already parsed out of them.
#[derive(Debug, Clone, Copy)]
pub struct CacheQuery<'a> {
    /// Full query packet, header included.
    pub packet: &'a [u8],
    /// Question name exactly as the client sent it.
    pub qname: &'a WireName,
    pub qtype: u16,
    pub qclass: u16,
    pub transport: Transport,
}

/// Outcome of a lookup. The key is valid hit or miss; callers hand it
/// back to [`PacketCache::insert`] once the real response arrives.
#[derive(Debug, Clone, Copy)]
pub struct Lookup {
    pub key: u32,
    /// Bytes written into the caller's buffer, on a hit.
    pub len: Option<usize>,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        self.len.is_some()
    }
}

/// A cached response and the identity of the query that produced it.
#[derive(Debug, Clone)]
struct CacheEntry {
    qname: WireName,
    qtype: u16,
    qclass: u16,
    transport: Transport,
    /// Seconds since epoch when the entry was stored.
    added: u64,
    /// Seconds since epoch past which the entry is expired.
    validity: u64,
    payload: Vec<u8>,
}

impl CacheEntry {
    fn matches(&self, qname: &WireName, qtype: u16, qclass: u16, transport: Transport) -> bool {
        self.transport == transport
            && self.qtype == qtype
            && self.qclass == qclass
            && self.qname == *qname
    }
}

/// Monotonic cache counters. Updates are relaxed; a lost increment
/// under race is tolerated.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub deferred_inserts: AtomicU64,
    pub deferred_lookups: AtomicU64,
    pub insert_collisions: AtomicU64,
    pub lookup_collisions: AtomicU64,
    pub ttl_too_shorts: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred_insert(&self) {
        self.deferred_inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred_lookup(&self) {
        self.deferred_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert_collision(&self) {
        self.insert_collisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup_collision(&self) {
        self.lookup_collisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ttl_too_short(&self) {
        self.ttl_too_shorts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            deferred_inserts: self.deferred_inserts.load(Ordering::Relaxed),
            deferred_lookups: self.deferred_lookups.load(Ordering::Relaxed),
            insert_collisions: self.insert_collisions.load(Ordering::Relaxed),
            lookup_collisions: self.lookup_collisions.load(Ordering::Relaxed),
            ttl_too_shorts: self.ttl_too_shorts.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of the counters, for exports and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub deferred_inserts: u64,
    pub deferred_lookups: u64,
    pub insert_collisions: u64,
    pub lookup_collisions: u64,
    pub ttl_too_shorts: u64,
}

struct Shard {
    map: RwLock<HashMap<u32, CacheEntry>>,
    /// Kept in lockstep with the map by write-lock holders; read
    /// without the lock for the best-effort capacity check and `len`.
    entries: AtomicU64,
}

impl Shard {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::with_capacity(capacity)),
            entries: AtomicU64::new(0),
        }
    }
}

/// 32-bit cache key over the parts of a query that identify it: the
/// header minus the transaction id, the lowercased wire qname, the
/// packet tail after the question name (qtype, qclass, EDNS), and the
/// transport. Transaction id and qname case are excluded so equivalent
/// queries land on the same key.
pub fn compute_key(query: &CacheQuery<'_>) -> Result<u32> {
    let packet = query.packet;
    if packet.len() < HEADER_SIZE {
        return Err(CacheError::InvalidPacket(format!(
            "{} bytes is too short for a cache key",
            packet.len()
        )));
    }
    let consumed = query.qname.wire_len();
    if packet.len() < HEADER_SIZE + consumed {
        return Err(CacheError::InvalidPacket(format!(
            "{} bytes cannot hold a {} byte question name",
            packet.len(),
            consumed
        )));
    }
    let mut key = burtle(&packet[2..HEADER_SIZE], 0);
    key = burtle(&query.qname.to_lowercase_wire(), key);
    if packet.len() > HEADER_SIZE + consumed {
        key = burtle(&packet[HEADER_SIZE + consumed..], key);
    }
    key = burtle(&[query.transport as u8], key);
    Ok(key)
}

pub struct PacketCache {
    shards: Vec<Shard>,
    max_entries: usize,
    shard_count: usize,
    max_ttl: u32,
    min_ttl: u32,
    temp_failure_ttl: u32,
    stale_ttl: u32,
    dont_age: bool,
    deferrable_insert_lock: bool,
    expunge_cursor: AtomicUsize,
    stats: CacheStats,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn clamp_age(secs: u64) -> u32 {
    secs.min(u64::from(u32::MAX)) as u32
}

impl PacketCache {
    pub fn new(config: PacketCacheConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        // One spare slot keeps a full shard at load factor <= 1, so the
        // hot path never rehashes.
        let per_shard = config.max_entries / shard_count + 1;
        let shards = (0..shard_count)
            .map(|_| Shard::with_capacity(per_shard))
            .collect();

        info!(
            max_entries = config.max_entries,
            shard_count,
            max_ttl = config.max_ttl,
            min_ttl = config.min_ttl,
            temp_failure_ttl = config.temp_failure_ttl,
            stale_ttl = config.stale_ttl,
            "initializing packet cache"
        );

        Self {
            shards,
            max_entries: config.max_entries,
            shard_count,
            max_ttl: config.max_ttl,
            min_ttl: config.min_ttl,
            temp_failure_ttl: config.temp_failure_ttl,
            stale_ttl: config.stale_ttl,
            dont_age: config.dont_age,
            deferrable_insert_lock: config.deferrable_insert_lock,
            expunge_cursor: AtomicUsize::new(0),
            stats: CacheStats::default(),
        }
    }

    fn shard_index(&self, key: u32) -> usize {
        key as usize % self.shard_count
    }

    /// Store `response` under `key` (obtained from a prior [`get`]).
    ///
    /// Refusals are silent: responses shorter than a header, transient
    /// failures with a zero TTL, responses without a usable TTL, TTLs
    /// below the configured floor, a full shard, a busy lock, and
    /// key collisions with a live entry all leave the cache unchanged,
    /// with the relevant counter bumped where one exists.
    ///
    /// [`get`]: PacketCache::get
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        key: u32,
        qname: &WireName,
        qtype: u16,
        qclass: u16,
        transport: Transport,
        response: &[u8],
        rcode: u8,
        temp_failure_ttl: Option<u32>,
    ) {
        self.insert_at(
            key,
            qname,
            qtype,
            qclass,
            transport,
            response,
            rcode,
            temp_failure_ttl,
            unix_now(),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_at(
        &self,
        key: u32,
        qname: &WireName,
        qtype: u16,
        qclass: u16,
        transport: Transport,
        response: &[u8],
        rcode: u8,
        temp_failure_ttl: Option<u32>,
        now: u64,
    ) {
        if response.len() < HEADER_SIZE {
            return;
        }

        let effective_ttl = if rcode == RCODE_SERVFAIL || rcode == RCODE_REFUSED {
            let ttl = temp_failure_ttl.unwrap_or(self.temp_failure_ttl);
            if ttl == 0 {
                return;
            }
            ttl
        } else {
            let Some(mut ttl) = dns::min_ttl(response) else {
                // No TTL to honour, nothing worth caching.
                return;
            };
            if ttl > self.max_ttl {
                ttl = self.max_ttl;
            }
            if ttl < self.min_ttl {
                self.stats.record_ttl_too_short();
                return;
            }
            ttl
        };

        let shard = &self.shards[self.shard_index(key)];
        let per_shard_cap = (self.max_entries / self.shard_count) as u64;
        if shard.entries.load(Ordering::Relaxed) >= per_shard_cap {
            return;
        }

        let entry = CacheEntry {
            qname: qname.clone(),
            qtype,
            qclass,
            transport,
            added: now,
            validity: now + u64::from(effective_ttl),
            payload: response.to_vec(),
        };

        if self.deferrable_insert_lock {
            match shard.map.try_write() {
                Some(mut map) => self.insert_locked(shard, &mut map, key, entry, now),
                None => self.stats.record_deferred_insert(),
            }
        } else {
            let mut map = shard.map.write();
            self.insert_locked(shard, &mut map, key, entry, now);
        }
    }

    fn insert_locked(
        &self,
        shard: &Shard,
        map: &mut HashMap<u32, CacheEntry>,
        key: u32,
        entry: CacheEntry,
        now: u64,
    ) {
        // The unlocked capacity check races with other writers; check
        // again now that the lock is held.
        if map.len() >= self.max_entries / self.shard_count {
            return;
        }

        match map.entry(key) {
            MapEntry::Vacant(slot) => {
                slot.insert(entry);
                shard.entries.fetch_add(1, Ordering::Relaxed);
            }
            MapEntry::Occupied(mut slot) => {
                let existing = slot.get();
                let expired = existing.validity <= now;
                if !expired
                    && !existing.matches(&entry.qname, entry.qtype, entry.qclass, entry.transport)
                {
                    // A different query landed on the same key; keep the
                    // live entry.
                    self.stats.record_insert_collision();
                    return;
                }
                // Never shorten the time to die.
                if entry.validity <= existing.validity {
                    return;
                }
                slot.insert(entry);
            }
        }
    }

    /// Look up a response for `query`, writing it into `response` on a
    /// hit: the caller's transaction id, the caller's qname spelling,
    /// and TTLs aged by the entry's time in cache. Entries expired for
    /// less than `allow_expired` seconds are served stale.
    ///
    /// The returned [`Lookup`] always carries the query's key. The only
    /// error is a query packet too short to be keyed; every other
    /// refusal (busy lock, undersized buffer, key collision) reports a
    /// miss.
    pub fn get(
        &self,
        query: &CacheQuery<'_>,
        txn_id: u16,
        response: &mut [u8],
        allow_expired: u32,
        skip_aging: bool,
    ) -> Result<Lookup> {
        self.get_at(query, txn_id, response, allow_expired, skip_aging, unix_now())
    }

    fn get_at(
        &self,
        query: &CacheQuery<'_>,
        txn_id: u16,
        response: &mut [u8],
        allow_expired: u32,
        skip_aging: bool,
        now: u64,
    ) -> Result<Lookup> {
        let key = compute_key(query)?;
        let miss = Lookup { key, len: None };
        let shard = &self.shards[self.shard_index(key)];

        let mut stale = false;
        let len;
        let age;
        {
            let map = match shard.map.try_read() {
                Some(guard) => guard,
                None => {
                    self.stats.record_deferred_lookup();
                    return Ok(miss);
                }
            };

            let entry = match map.get(&key) {
                Some(entry) => entry,
                None => {
                    self.stats.record_miss();
                    trace!(key, "cache miss");
                    return Ok(miss);
                }
            };

            if entry.validity < now {
                if now - entry.validity >= u64::from(allow_expired) {
                    self.stats.record_miss();
                    trace!(key, "entry expired past the serve-stale window");
                    return Ok(miss);
                }
                stale = true;
            }

            // An undersized buffer (or a sub-header payload) is the
            // caller's problem, neither a hit nor a miss.
            if response.len() < entry.payload.len() || entry.payload.len() < HEADER_SIZE {
                return Ok(miss);
            }

            if !entry.matches(query.qname, query.qtype, query.qclass, query.transport) {
                self.stats.record_lookup_collision();
                return Ok(miss);
            }

            response[..2].copy_from_slice(&txn_id.to_be_bytes());
            response[2..HEADER_SIZE].copy_from_slice(&entry.payload[2..HEADER_SIZE]);

            if entry.payload.len() == HEADER_SIZE {
                // Header-only entry, nothing to age.
                self.stats.record_hit();
                trace!(key, "cache hit (header only)");
                return Ok(Lookup {
                    key,
                    len: Some(HEADER_SIZE),
                });
            }

            let qname_len = query.qname.wire_len();
            if entry.payload.len() < HEADER_SIZE + qname_len {
                return Ok(miss);
            }
            // Echo the name the client sent, never the stored spelling.
            response[HEADER_SIZE..HEADER_SIZE + qname_len].copy_from_slice(query.qname.as_wire());
            if entry.payload.len() > HEADER_SIZE + qname_len {
                response[HEADER_SIZE + qname_len..entry.payload.len()]
                    .copy_from_slice(&entry.payload[HEADER_SIZE + qname_len..]);
            }
            len = entry.payload.len();
            age = if stale {
                // A stale hit serves what is left of the grace window.
                // A window longer than the original TTL floors every
                // served TTL at zero.
                let original_ttl = entry.validity - entry.added;
                match original_ttl.checked_sub(u64::from(self.stale_ttl)) {
                    Some(aged) => clamp_age(aged),
                    None => u32::MAX,
                }
            } else {
                clamp_age(now.saturating_sub(entry.added))
            };
        }

        if !self.dont_age && !skip_aging {
            dns::age_response(&mut response[..len], age);
        }
        self.stats.record_hit();
        trace!(key, len, age, stale, "cache hit");
        Ok(Lookup {
            key,
            len: Some(len),
        })
    }

    /// Delete expired entries until at most `up_to` remain. Shards are
    /// visited circularly from a cursor so repeated sweeps spread the
    /// work; live entries are never touched, even when that means the
    /// target is missed.
    pub fn purge_expired(&self, up_to: u64) {
        self.purge_expired_at(up_to, unix_now());
    }

    fn purge_expired_at(&self, up_to: u64, now: u64) {
        let size = self.len();
        if up_to >= size {
            return;
        }
        let mut to_remove = size - up_to;
        let target = to_remove;
        let mut scanned = 0;
        while to_remove > 0 && scanned < self.shard_count {
            let shard_index =
                self.expunge_cursor.fetch_add(1, Ordering::Relaxed) % self.shard_count;
            let shard = &self.shards[shard_index];
            let mut map = shard.map.write();
            map.retain(|_, entry| {
                if to_remove > 0 && entry.validity < now {
                    to_remove -= 1;
                    shard.entries.fetch_sub(1, Ordering::Relaxed);
                    false
                } else {
                    true
                }
            });
            scanned += 1;
        }
        debug!(
            removed = target - to_remove,
            remaining = self.len(),
            "purged expired entries"
        );
    }

    /// Drop arbitrary entries until at most `up_to` remain, ignoring
    /// TTLs. The quota is split proportionally across the shards still
    /// to visit; a shard smaller than its quota is emptied and the
    /// deficit is not carried over, keeping the work per shard bounded.
    pub fn expunge(&self, up_to: u64) {
        let size = self.len();
        if up_to >= size {
            return;
        }
        let to_remove = (size - up_to) as usize;
        let mut removed = 0usize;
        for (visited, shard) in self.shards.iter().enumerate() {
            let mut map = shard.map.write();
            let quota = (to_remove - removed) / (self.shard_count - visited);
            if map.len() >= quota {
                let doomed: Vec<u32> = map.keys().take(quota).copied().collect();
                for key in doomed {
                    map.remove(&key);
                }
                shard.entries.fetch_sub(quota as u64, Ordering::Relaxed);
                removed += quota;
            } else {
                removed += map.len();
                shard.entries.store(0, Ordering::Relaxed);
                map.clear();
            }
        }
        debug!(removed, remaining = self.len(), "expunged entries");
    }

    /// Remove every entry for `name` (and its subdomains when
    /// `suffix_match`) whose qtype matches. [`QTYPE_ANY`] matches all
    /// record types.
    pub fn expunge_by_name(&self, name: &WireName, qtype: u16, suffix_match: bool) {
        let mut removed = 0u64;
        for shard in &self.shards {
            let mut map = shard.map.write();
            map.retain(|_, entry| {
                let name_matches = entry.qname == *name
                    || (suffix_match && entry.qname.is_subdomain_of(name));
                let qtype_matches = qtype == QTYPE_ANY || entry.qtype == qtype;
                if name_matches && qtype_matches {
                    shard.entries.fetch_sub(1, Ordering::Relaxed);
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        debug!(name = %name, qtype, suffix_match, removed, "expunged entries by name");
    }

    /// Best-effort entry count: per-shard counters summed without
    /// locking, so concurrent writers may skew the total slightly.
    pub fn len(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.entries.load(Ordering::Relaxed))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_entries as u64
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl fmt::Display for PacketCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.len(), self.max_entries)
    }
}
