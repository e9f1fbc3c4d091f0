//! Forward Cache
//!
//! Loop guard for relayed CHATs. A message that comes back on a different
//! link than the one it first arrived on, within a short window, is a copy
//! travelling a loop and is not forwarded again. The same text arriving again
//! on the same link is a new message and passes. Entries are keyed by a
//! SHA-256 digest of the message fields so the cache never holds content.

use log::trace;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::types::{Identity, LinkAddress};

type Fingerprint = [u8; 32];

#[derive(Debug, Clone, Default, Serialize)]
pub struct ForwardCacheStats {
    pub entries: usize,
    pub suppressed: u64,
    pub admitted: u64,
}

#[derive(Debug)]
struct Seen {
    via: LinkAddress,
    at: Instant,
}

#[derive(Debug)]
pub struct ForwardCache {
    window: Duration,
    capacity: usize,
    seen: HashMap<Fingerprint, Seen>,
    /// Insertion order; an item is stale once `seen` holds a newer time for its key
    order: VecDeque<(Fingerprint, Instant)>,
    stats: ForwardCacheStats,
}

impl ForwardCache {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
            stats: ForwardCacheStats::default(),
        }
    }

    pub fn fingerprint(sender: &Identity, target: &Identity, content: &str) -> Fingerprint {
        let mut hasher = Sha256::new();
        for field in [sender.as_str(), target.as_str(), content] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&hasher.finalize());
        fingerprint
    }

    /// Record the message arriving on `via` and return true if it may be
    /// forwarded, false if it is a looped copy of one forwarded within the window.
    pub fn admit(
        &mut self,
        via: &LinkAddress,
        sender: &Identity,
        target: &Identity,
        content: &str,
        now: Instant,
    ) -> bool {
        self.expire(now);

        let key = Self::fingerprint(sender, target, content);
        if let Some(seen) = self.seen.get_mut(&key) {
            if &seen.via != via {
                trace!("Suppressing looped copy {} via {}", hex::encode(&key[..8]), via);
                self.stats.suppressed += 1;
                return false;
            }

            seen.at = now;
            self.order.push_back((key, now));
            self.stats.admitted += 1;
            return true;
        }

        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some((oldest, at)) => self.forget(&oldest, at),
                None => break,
            }
        }

        self.seen.insert(key, Seen { via: via.clone(), at: now });
        self.order.push_back((key, now));
        self.stats.admitted += 1;
        true
    }

    fn expire(&mut self, now: Instant) {
        while let Some((key, at)) = self.order.front().copied() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.order.pop_front();
            self.forget(&key, at);
        }
    }

    fn forget(&mut self, key: &Fingerprint, at: Instant) {
        if self.seen.get(key).map_or(false, |seen| seen.at == at) {
            self.seen.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn stats(&self) -> ForwardCacheStats {
        ForwardCacheStats {
            entries: self.seen.len(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::from(s)
    }

    fn addr(s: &str) -> LinkAddress {
        LinkAddress::from(s)
    }

    #[test]
    fn test_copy_from_another_link_is_suppressed() {
        let mut cache = ForwardCache::new(Duration::from_secs(5), 16);
        let now = Instant::now();

        assert!(cache.admit(&addr("A"), &id("dev1"), &id("dev3"), "hi", now));
        assert!(!cache.admit(&addr("D"), &id("dev1"), &id("dev3"), "hi", now + Duration::from_secs(1)));
        assert!(cache.admit(&addr("D"), &id("dev1"), &id("dev3"), "hi again", now));

        let stats = cache.stats();
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.suppressed, 1);
        assert_eq!(stats.entries, 2);
    }

    #[test]
    fn test_repeat_on_same_link_passes() {
        let mut cache = ForwardCache::new(Duration::from_secs(5), 16);
        let now = Instant::now();

        assert!(cache.admit(&addr("A"), &id("dev1"), &id("dev3"), "ok", now));
        assert!(cache.admit(&addr("A"), &id("dev1"), &id("dev3"), "ok", now));
        assert_eq!(cache.len(), 1);

        // The refreshed entry still catches a looped copy later on.
        assert!(!cache.admit(&addr("D"), &id("dev1"), &id("dev3"), "ok", now + Duration::from_secs(4)));
    }

    #[test]
    fn test_entries_expire_after_window() {
        let mut cache = ForwardCache::new(Duration::from_secs(5), 16);
        let now = Instant::now();

        assert!(cache.admit(&addr("A"), &id("dev1"), &id("dev3"), "hi", now));
        assert!(cache.admit(&addr("D"), &id("dev1"), &id("dev3"), "hi", now + Duration::from_secs(6)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_refreshed_entry_outlives_its_first_sighting() {
        let mut cache = ForwardCache::new(Duration::from_secs(5), 16);
        let now = Instant::now();

        cache.admit(&addr("A"), &id("dev1"), &id("dev3"), "ok", now);
        cache.admit(&addr("A"), &id("dev1"), &id("dev3"), "ok", now + Duration::from_secs(4));

        assert!(!cache.admit(&addr("D"), &id("dev1"), &id("dev3"), "ok", now + Duration::from_secs(6)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = ForwardCache::new(Duration::from_secs(5), 2);
        let now = Instant::now();

        cache.admit(&addr("A"), &id("a"), &id("z"), "1", now);
        cache.admit(&addr("A"), &id("a"), &id("z"), "2", now);
        cache.admit(&addr("A"), &id("a"), &id("z"), "3", now);

        assert_eq!(cache.len(), 2);
        assert!(cache.admit(&addr("D"), &id("a"), &id("z"), "1", now), "oldest entry was evicted");
    }

    #[test]
    fn test_field_boundaries_matter() {
        assert_ne!(
            ForwardCache::fingerprint(&id("ab"), &id("c"), "x"),
            ForwardCache::fingerprint(&id("a"), &id("bc"), "x")
        );
    }
}
