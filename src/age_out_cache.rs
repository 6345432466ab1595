use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

/// Deadline tracking for destinations that are not (yet) group members.
///
/// A destination is registered when the first message goes out to it; if the
/// deadline passes without the membership view confirming the peer, the layer
/// tears both connection windows down. The cache itself is clock-free: callers
/// pass the current time, and the retransmit sweep polls for expiry.
pub struct AgeOutCache<K> {
    timeout: Duration,
    deadlines: Mutex<FxHashMap<K, u64>>,
}

impl<K: Hash + Eq + Clone> AgeOutCache<K> {
    pub fn new(timeout: Duration) -> AgeOutCache<K> {
        AgeOutCache {
            timeout,
            deadlines: Mutex::new(FxHashMap::default()),
        }
    }

    /// Registers `key` with a deadline of `now + timeout`. Re-registering an
    /// already tracked key keeps the earlier deadline.
    pub fn add(&self, key: K, now: u64) {
        self.deadlines
            .lock()
            .unwrap()
            .entry(key)
            .or_insert(now + self.timeout.as_millis() as u64);
    }

    /// Drops all keys that are confirmed members - membership supersedes the
    /// age-out deadline.
    pub fn remove_all(&self, members: &[K]) {
        let mut deadlines = self.deadlines.lock().unwrap();
        for member in members {
            deadlines.remove(member);
        }
    }

    /// Removes and returns all keys whose deadline has passed.
    pub fn take_expired(&self, now: u64) -> Vec<K> {
        let mut deadlines = self.deadlines.lock().unwrap();
        let expired: Vec<K> = deadlines
            .iter()
            .filter(|(_, &deadline)| deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            deadlines.remove(key);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.deadlines.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.deadlines.lock().unwrap().clear();
    }
}
