use mimir::cache::{CacheQuery, PacketCache, Transport, compute_key};
use mimir::config::PacketCacheConfig;
use mimir::dns::{HEADER_SIZE, QTYPE_ANY, RCODE_SERVFAIL, WireName, min_ttl};

fn test_config() -> PacketCacheConfig {
    PacketCacheConfig {
        max_entries: 256,
        shard_count: 4,
        max_ttl: 86_400,
        min_ttl: 0,
        temp_failure_ttl: 60,
        stale_ttl: 60,
        dont_age: false,
        deferrable_insert_lock: true,
    }
}

fn name(ascii: &str) -> WireName {
    WireName::from_ascii(ascii).unwrap()
}

fn build_query(qname: &WireName, qtype: u16, txn: u16) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&txn.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // rd
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    packet.extend_from_slice(qname.as_wire());
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // IN
    packet
}

fn build_response(qname: &WireName, qtype: u16, ttl: u32) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&[0x00, 0x00]); // id, rewritten on serve
    packet.extend_from_slice(&[0x81, 0x80]);
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
    packet.extend_from_slice(qname.as_wire());
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&[0xC0, 0x0C]); // name pointer to the question
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&ttl.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x04, 192, 0, 2, 1]);
    packet
}

/// Miss, resolve, insert; returns the key the entry is stored under.
fn populate(cache: &PacketCache, qname: &WireName, qtype: u16, ttl: u32) -> u32 {
    let packet = build_query(qname, qtype, 0x0001);
    let query = CacheQuery {
        packet: &packet,
        qname,
        qtype,
        qclass: 1,
        transport: Transport::Udp,
    };
    let mut buf = vec![0u8; 512];
    let lookup = cache.get(&query, 0x0001, &mut buf, 0, false).unwrap();
    assert!(!lookup.is_hit());
    let response = build_response(qname, qtype, ttl);
    cache.insert(
        lookup.key,
        qname,
        qtype,
        1,
        Transport::Udp,
        &response,
        0,
        None,
    );
    lookup.key
}

#[test]
fn insert_then_get_serves_the_response() {
    let cache = PacketCache::new(test_config());
    let qname = name("example.com");
    populate(&cache, &qname, 1, 300);

    let packet = build_query(&qname, 1, 0x1234);
    let query = CacheQuery {
        packet: &packet,
        qname: &qname,
        qtype: 1,
        qclass: 1,
        transport: Transport::Udp,
    };
    let mut buf = vec![0u8; 512];
    let lookup = cache.get(&query, 0x1234, &mut buf, 0, false).unwrap();
    let len = lookup.len.expect("hit");

    let expected = build_response(&qname, 1, 300);
    assert_eq!(len, expected.len());
    assert_eq!(&buf[..2], &[0x12, 0x34]);
    // The wall clock may tick between insert and get; allow one second
    // of aging.
    let served_ttl = min_ttl(&buf[..len]).unwrap();
    assert!((299..=300).contains(&served_ttl), "ttl {served_ttl}");

    let snapshot = cache.stats().snapshot();
    assert_eq!(snapshot.hits, 1);
    assert_eq!(snapshot.misses, 1);
}

#[test]
fn get_echoes_the_callers_qname_spelling() {
    let cache = PacketCache::new(test_config());
    let stored = name("example.com");
    populate(&cache, &stored, 1, 300);

    let queried = name("EXAMPLE.COM");
    let packet = build_query(&queried, 1, 0x0002);
    let query = CacheQuery {
        packet: &packet,
        qname: &queried,
        qtype: 1,
        qclass: 1,
        transport: Transport::Udp,
    };
    let mut buf = vec![0u8; 512];
    let lookup = cache.get(&query, 0x0002, &mut buf, 0, false).unwrap();
    let len = lookup.len.expect("case-insensitive hit");

    let qname_len = queried.wire_len();
    assert_eq!(
        &buf[HEADER_SIZE..HEADER_SIZE + qname_len],
        queried.as_wire()
    );
    assert_ne!(queried.as_wire(), stored.as_wire());
    assert!(len > HEADER_SIZE + qname_len);
}

#[test]
fn same_query_different_txn_ids_share_a_key() {
    let qname = name("example.com");
    let packet_a = build_query(&qname, 1, 0x1111);
    let packet_b = build_query(&qname, 1, 0x2222);
    let query_a = CacheQuery {
        packet: &packet_a,
        qname: &qname,
        qtype: 1,
        qclass: 1,
        transport: Transport::Udp,
    };
    let query_b = CacheQuery {
        packet: &packet_b,
        ..query_a
    };
    assert_eq!(compute_key(&query_a).unwrap(), compute_key(&query_b).unwrap());
}

#[test]
fn servfail_is_cached_header_only() {
    let cache = PacketCache::new(test_config());
    let qname = name("fail.example.com");
    let packet = build_query(&qname, 1, 0x0001);
    let query = CacheQuery {
        packet: &packet,
        qname: &qname,
        qtype: 1,
        qclass: 1,
        transport: Transport::Udp,
    };
    let mut buf = vec![0u8; 512];
    let lookup = cache.get(&query, 0x0001, &mut buf, 0, false).unwrap();

    let response = [
        0x00, 0x00, 0x80, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    cache.insert(
        lookup.key,
        &qname,
        1,
        1,
        Transport::Udp,
        &response,
        RCODE_SERVFAIL,
        None,
    );
    assert_eq!(cache.len(), 1);

    let mut out = vec![0u8; HEADER_SIZE];
    let lookup = cache.get(&query, 0xBEEF, &mut out, 0, false).unwrap();
    assert_eq!(lookup.len, Some(HEADER_SIZE));
    assert_eq!(&out[..2], &[0xBE, 0xEF]);
    assert_eq!(&out[2..], &response[2..]);
}

#[test]
fn ttl_floor_refusal_shows_up_in_stats() {
    let cache = PacketCache::new(PacketCacheConfig {
        min_ttl: 60,
        ..test_config()
    });
    let qname = name("short.example.com");
    let packet = build_query(&qname, 1, 0x0001);
    let query = CacheQuery {
        packet: &packet,
        qname: &qname,
        qtype: 1,
        qclass: 1,
        transport: Transport::Udp,
    };
    let mut buf = vec![0u8; 512];
    let lookup = cache.get(&query, 0x0001, &mut buf, 0, false).unwrap();

    let response = build_response(&qname, 1, 30);
    cache.insert(
        lookup.key,
        &qname,
        1,
        1,
        Transport::Udp,
        &response,
        0,
        None,
    );
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.stats().snapshot().ttl_too_shorts, 1);
}

#[test]
fn expunge_by_name_makes_the_name_miss() {
    let cache = PacketCache::new(test_config());
    let qname = name("example.com");
    populate(&cache, &qname, 1, 300);
    populate(&cache, &name("other.example.org"), 1, 300);

    cache.expunge_by_name(&qname, QTYPE_ANY, false);
    assert_eq!(cache.len(), 1);

    let packet = build_query(&qname, 1, 0x0002);
    let query = CacheQuery {
        packet: &packet,
        qname: &qname,
        qtype: 1,
        qclass: 1,
        transport: Transport::Udp,
    };
    let mut buf = vec![0u8; 512];
    let lookup = cache.get(&query, 0x0002, &mut buf, 0, false).unwrap();
    assert!(!lookup.is_hit());
}

#[test]
fn purge_expired_leaves_live_entries_alone() {
    let cache = PacketCache::new(test_config());
    for i in 0..4 {
        populate(&cache, &name(&format!("host{i}.example.com")), 1, 600);
    }
    cache.purge_expired(0);
    assert_eq!(cache.len(), 4);
}

#[test]
fn expunge_reduces_to_the_target() {
    // One shard makes the proportional quota exact; with more shards
    // the split may leave a bounded remainder in early shards.
    let cache = PacketCache::new(PacketCacheConfig {
        shard_count: 1,
        ..test_config()
    });
    for i in 0..8 {
        populate(&cache, &name(&format!("host{i}.example.com")), 1, 600);
    }
    cache.expunge(3);
    assert_eq!(cache.len(), 3);
    cache.expunge(0);
    assert!(cache.is_empty());
}

#[test]
fn undersized_buffer_is_refused() {
    let cache = PacketCache::new(test_config());
    let qname = name("example.com");
    populate(&cache, &qname, 1, 300);

    let packet = build_query(&qname, 1, 0x0002);
    let query = CacheQuery {
        packet: &packet,
        qname: &qname,
        qtype: 1,
        qclass: 1,
        transport: Transport::Udp,
    };
    let mut tiny = vec![0u8; 16];
    let lookup = cache.get(&query, 0x0002, &mut tiny, 0, false).unwrap();
    assert!(!lookup.is_hit());

    let mut big = vec![0u8; 512];
    let lookup = cache.get(&query, 0x0002, &mut big, 0, false).unwrap();
    assert!(lookup.is_hit());
}

#[test]
fn display_tracks_size_and_capacity() {
    let cache = PacketCache::new(PacketCacheConfig {
        max_entries: 16,
        ..test_config()
    });
    assert_eq!(cache.to_string(), "0/16");
    populate(&cache, &name("example.com"), 1, 300);
    assert_eq!(cache.to_string(), "1/16");
    assert!(!cache.is_full());
}

#[test]
fn stats_snapshot_serializes() {
    let cache = PacketCache::new(test_config());
    populate(&cache, &name("example.com"), 1, 300);

    let json = serde_json::to_value(cache.stats().snapshot()).unwrap();
    assert_eq!(json["misses"], 1);
    assert_eq!(json["hits"], 0);
}
