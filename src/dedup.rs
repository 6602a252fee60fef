use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Bounded per-channel cache of provider external ids we have already
/// accepted. Advisory only: the durable store's unique constraint is the
/// authority, this just avoids re-doing the work for the common retry.
pub struct SeenCache {
    capacity: usize,
    ttl: Duration,
    channels: RwLock<HashMap<Uuid, Arc<Mutex<ChannelSeen>>>>,
}

struct ChannelSeen {
    order: VecDeque<String>,
    entries: HashMap<String, Instant>,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> SeenCache {
        SeenCache {
            capacity: capacity.max(1),
            ttl,
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn channel_entry(&self, channel: Uuid) -> Arc<Mutex<ChannelSeen>> {
        if let Some(entry) = self.channels.read().get(&channel) {
            return entry.clone();
        }
        self.channels
            .write()
            .entry(channel)
            .or_insert_with(|| {
                Arc::new(Mutex::new(ChannelSeen {
                    order: VecDeque::new(),
                    entries: HashMap::new(),
                }))
            })
            .clone()
    }

    pub fn contains(&self, channel: Uuid, external_id: &str) -> bool {
        if external_id.is_empty() {
            return false;
        }
        let entry = self.channel_entry(channel);
        let seen = entry.lock();
        match seen.entries.get(external_id) {
            Some(inserted) => inserted.elapsed() < self.ttl,
            None => false,
        }
    }

    pub fn insert(&self, channel: Uuid, external_id: &str) {
        if external_id.is_empty() {
            return;
        }
        let entry = self.channel_entry(channel);
        let mut seen = entry.lock();

        if seen.entries.insert(external_id.to_string(), Instant::now()).is_some() {
            seen.order.retain(|id| id != external_id);
        }
        seen.order.push_back(external_id.to_string());

        while seen.order.len() > self.capacity {
            if let Some(evicted) = seen.order.pop_front() {
                seen.entries.remove(&evicted);
            }
        }
    }
}
