use std::time::Duration;
use switchboard::dedup::SeenCache;
use uuid::Uuid;

#[test]
fn test_check_then_write_is_idempotent() {
    let cache = SeenCache::new(100, Duration::from_secs(60));
    let channel = Uuid::new_v4();

    assert!(!cache.contains(channel, "ext-1"));
    cache.insert(channel, "ext-1");
    cache.insert(channel, "ext-1");
    assert!(cache.contains(channel, "ext-1"));
}

#[test]
fn test_capacity_is_per_channel() {
    let cache = SeenCache::new(2, Duration::from_secs(60));
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    cache.insert(a, "1");
    cache.insert(a, "2");
    cache.insert(b, "1");
    cache.insert(b, "2");

    // filling channel b never evicts from channel a
    assert!(cache.contains(a, "1"));
    assert!(cache.contains(a, "2"));

    cache.insert(a, "3");
    assert!(!cache.contains(a, "1"));
    assert!(cache.contains(b, "1"));
}

#[test]
fn test_eviction_order_is_insertion_order() {
    let cache = SeenCache::new(3, Duration::from_secs(60));
    let channel = Uuid::new_v4();
    for id in ["a", "b", "c"] {
        cache.insert(channel, id);
    }
    cache.insert(channel, "d");
    assert!(!cache.contains(channel, "a"));
    cache.insert(channel, "e");
    assert!(!cache.contains(channel, "b"));
    assert!(cache.contains(channel, "c"));
}

#[test]
fn test_zero_ttl_expires_immediately() {
    let cache = SeenCache::new(10, Duration::ZERO);
    let channel = Uuid::new_v4();
    cache.insert(channel, "ext-1");
    assert!(!cache.contains(channel, "ext-1"));
}
