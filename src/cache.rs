use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use md5::{Digest, Md5};
use tracing::{debug, trace};

use crate::dns::{DnsPacket, RecordClass, RecordType};
use crate::error::CacheError;

/// A normalised DNS question: lowercased name with the trailing dot
/// stripped. Its rendered form feeds the cache fingerprint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl Question {
    pub fn new(name: &str, qtype: RecordType, qclass: RecordClass) -> Self {
        Self {
            name: name.trim_end_matches('.').to_lowercase(),
            qtype,
            qclass,
        }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.qclass, self.qtype)
    }
}

/// Fingerprint for a question. The hash only shortens the map key; it is
/// identity, not a security token.
pub fn cache_key(question: &Question) -> String {
    let digest = Md5::digest(question.to_string().as_bytes());
    let key = hex::encode(digest);
    trace!("cache key {} for {}", key, question);
    key
}

#[derive(Clone, Debug)]
struct CacheEntry {
    packet: DnsPacket,
    blocked: bool,
    expires_at: Instant,
}

/// TTL-tracking response cache over a concurrent map. Reads are lock-free;
/// an atomic counter tracks occupancy so `is_full` never walks the map.
/// Expired entries are dropped lazily on access.
pub struct ResponseCache {
    backend: DashMap<String, CacheEntry>,
    size: AtomicUsize,
    max_size: i64,
}

impl ResponseCache {
    /// `max_size <= 0` means unbounded.
    pub fn new(max_size: i64) -> Self {
        Self {
            backend: DashMap::new(),
            size: AtomicUsize::new(0),
            max_size,
        }
    }

    /// Fetch a response. The returned clone has every answer TTL rewritten
    /// to the whole seconds remaining (rounded up), so clients observe a
    /// decreasing TTL while the stored entry stays untouched.
    pub fn get(&self, key: &str) -> Result<(DnsPacket, bool), CacheError> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &str, now: Instant) -> Result<(DnsPacket, bool), CacheError> {
        let key = key.to_lowercase();

        let entry = match self.backend.get(&key) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!("cache: cannot find key {}", key);
                return Err(CacheError::KeyNotFound(key));
            }
        };

        if now > entry.expires_at {
            debug!("cache: key expired {}", key);
            // Only drop the entry we actually observed; a concurrent
            // overwrite must survive this removal.
            let expired_at = entry.expires_at;
            let removed = self
                .backend
                .remove_if(&key, |_, current| current.expires_at == expired_at);
            if removed.is_some() {
                self.size.fetch_sub(1, Ordering::Relaxed);
            }
            return Err(CacheError::KeyExpired(key));
        }

        let remaining = ceil_secs(entry.expires_at.saturating_duration_since(now));
        let mut packet = entry.packet;
        for answer in &mut packet.answers {
            answer.ttl = remaining;
        }

        Ok((packet, entry.blocked))
    }

    /// Insert a response, deriving the entry lifetime from the smallest
    /// answer TTL (zero when there are no answers).
    pub fn set(&self, key: &str, packet: DnsPacket, blocked: bool) -> Result<(), CacheError> {
        let ttl = packet.answers.iter().map(|a| a.ttl).min().unwrap_or(0);
        self.set_with_ttl(key, packet, blocked, ttl)
    }

    /// Insert a response with an explicit lifetime, used for block replies
    /// and negative entries whose TTL is policy, not wire data.
    pub fn set_with_ttl(
        &self,
        key: &str,
        packet: DnsPacket,
        blocked: bool,
        ttl: u32,
    ) -> Result<(), CacheError> {
        self.set_at(key, packet, blocked, ttl, Instant::now())
    }

    fn set_at(
        &self,
        key: &str,
        packet: DnsPacket,
        blocked: bool,
        ttl: u32,
        now: Instant,
    ) -> Result<(), CacheError> {
        let key = key.to_lowercase();

        if self.is_full() && !self.backend.contains_key(&key) {
            return Err(CacheError::CacheFull);
        }

        let entry = CacheEntry {
            packet,
            blocked,
            expires_at: now + Duration::from_secs(ttl as u64),
        };
        if self.backend.insert(key, entry).is_none() {
            self.size.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) {
        if self.backend.remove(&key.to_lowercase()).is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.backend.contains_key(&key.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.max_size > 0 && self.len() as i64 >= self.max_size
    }
}

fn ceil_secs(duration: Duration) -> u32 {
    let mut secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs += 1;
    }
    secs.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::DnsResource;
    use std::net::Ipv4Addr;

    fn response(name: &str, ttl: u32) -> DnsPacket {
        let query = DnsPacket::query(1, name, RecordType::A);
        let mut reply = DnsPacket::reply_to(&query);
        reply
            .answers
            .push(DnsResource::new_a(name, ttl, Ipv4Addr::new(10, 10, 0, 1)));
        reply.sync_counts();
        reply
    }

    fn key_for(name: &str) -> String {
        cache_key(&Question::new(name, RecordType::A, RecordClass::In))
    }

    #[test]
    fn fingerprint_normalises_case_and_fqdn() {
        let a = Question::new("Example.COM.", RecordType::A, RecordClass::In);
        let b = Question::new("example.com", RecordType::A, RecordClass::In);
        assert_eq!(cache_key(&a), cache_key(&b));
        assert_eq!(a.to_string(), "example.com IN A");
    }

    #[test]
    fn set_then_get_returns_value() {
        let cache = ResponseCache::new(0);
        let key = key_for("example.com");
        cache.set(&key, response("example.com", 10), false).unwrap();

        let (packet, blocked) = cache.get(&key).unwrap();
        assert!(!blocked);
        assert_eq!(packet.answers.len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn ttl_counts_down_and_expires() {
        let cache = ResponseCache::new(0);
        let key = key_for("ttl.example");
        let t0 = Instant::now();
        cache
            .set_at(&key, response("ttl.example", 10), false, 10, t0)
            .unwrap();

        let (at5, _) = cache.get_at(&key, t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(at5.answers[0].ttl, 5);

        let (at10, _) = cache.get_at(&key, t0 + Duration::from_secs(10)).unwrap();
        assert_eq!(at10.answers[0].ttl, 0);

        let err = cache
            .get_at(&key, t0 + Duration::from_secs(11))
            .unwrap_err();
        assert!(matches!(err, CacheError::KeyExpired(_)));

        // Eagerly removed: the next access misses.
        let err = cache
            .get_at(&key, t0 + Duration::from_secs(11))
            .unwrap_err();
        assert!(matches!(err, CacheError::KeyNotFound(_)));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn subsecond_reads_round_up() {
        let cache = ResponseCache::new(0);
        let key = key_for("sub.example");
        let t0 = Instant::now();
        cache
            .set_at(&key, response("sub.example", 10), false, 10, t0)
            .unwrap();

        let (packet, _) = cache.get_at(&key, t0 + Duration::from_millis(300)).unwrap();
        assert_eq!(packet.answers[0].ttl, 10);

        let (packet, _) = cache
            .get_at(&key, t0 + Duration::from_millis(1500))
            .unwrap();
        assert_eq!(packet.answers[0].ttl, 9);
    }

    #[test]
    fn rewrite_is_monotonically_non_increasing() {
        let cache = ResponseCache::new(0);
        let key = key_for("mono.example");
        let t0 = Instant::now();
        cache
            .set_at(&key, response("mono.example", 30), false, 30, t0)
            .unwrap();

        let mut last = u32::MAX;
        for millis in [0u64, 400, 900, 1000, 2500, 15000, 29999] {
            let (packet, _) = cache
                .get_at(&key, t0 + Duration::from_millis(millis))
                .unwrap();
            assert!(packet.answers[0].ttl <= last);
            last = packet.answers[0].ttl;
        }
    }

    #[test]
    fn entry_with_no_answers_expires_immediately() {
        let cache = ResponseCache::new(0);
        let key = key_for("empty.example");
        let query = DnsPacket::query(1, "empty.example", RecordType::A);
        let t0 = Instant::now();
        cache
            .set_at(&key, DnsPacket::reply_to(&query), false, 0, t0)
            .unwrap();

        assert!(cache.get_at(&key, t0).is_ok());
        assert!(matches!(
            cache.get_at(&key, t0 + Duration::from_millis(1)),
            Err(CacheError::KeyExpired(_))
        ));
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let cache = ResponseCache::new(0);
        let key = key_for("dup.example");
        cache.set(&key, response("dup.example", 10), false).unwrap();
        cache.set(&key, response("dup.example", 99), true).unwrap();

        assert_eq!(cache.len(), 1);
        let (_, blocked) = cache.get(&key).unwrap();
        assert!(blocked);
    }

    #[test]
    fn full_cache_rejects_new_keys_but_allows_overwrite() {
        let cache = ResponseCache::new(2);
        cache
            .set(&key_for("a.example"), response("a.example", 10), false)
            .unwrap();
        cache
            .set(&key_for("b.example"), response("b.example", 10), false)
            .unwrap();
        assert!(cache.is_full());

        let err = cache
            .set(&key_for("c.example"), response("c.example", 10), false)
            .unwrap_err();
        assert_eq!(err, CacheError::CacheFull);

        // Overwriting a resident key is always allowed.
        cache
            .set(&key_for("a.example"), response("a.example", 20), false)
            .unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn unbounded_cache_never_full() {
        let cache = ResponseCache::new(0);
        for i in 0..100 {
            let name = format!("host{}.example", i);
            cache.set(&key_for(&name), response(&name, 10), false).unwrap();
        }
        assert!(!cache.is_full());
        assert_eq!(cache.len(), 100);
    }

    #[test]
    fn remove_updates_length() {
        let cache = ResponseCache::new(0);
        let key = key_for("gone.example");
        cache.set(&key, response("gone.example", 10), false).unwrap();
        cache.remove(&key);
        assert_eq!(cache.len(), 0);
        assert!(matches!(
            cache.get(&key),
            Err(CacheError::KeyNotFound(_))
        ));
    }
}
