// Bounded record of request ids already processed
//
// Gossip loop suppression relies only on this set, so it must never forget an
// id while copies of that request can still be circulating. Entries expire
// after `ttl`; when full, the oldest entry is evicted first.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

struct Inner {
    /// request id -> (source peer, inserted at). `None` marks our own requests.
    entries: HashMap<String, (Option<String>, Instant)>,
    order: VecDeque<String>,
}

pub struct SeenRequests {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl SeenRequests {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Record `request_id`, returning `false` if it was already seen
    pub fn insert(&self, request_id: &str, source: Option<&str>) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.expire(&mut inner, now);

        if inner.entries.contains_key(request_id) {
            return false;
        }
        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
        inner
            .entries
            .insert(request_id.to_string(), (source.map(str::to_string), now));
        inner.order.push_back(request_id.to_string());
        true
    }

    /// Where a seen request came from: `Some(None)` for our own requests
    pub fn source(&self, request_id: &str) -> Option<Option<String>> {
        let mut inner = self.inner.lock();
        self.expire(&mut inner, Instant::now());
        inner.entries.get(request_id).map(|(source, _)| source.clone())
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.source(request_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire(&self, inner: &mut Inner, now: Instant) {
        while let Some(oldest) = inner.order.front() {
            let expired = inner
                .entries
                .get(oldest)
                .map(|(_, at)| now.duration_since(*at) >= self.ttl)
                .unwrap_or(true);
            if !expired {
                break;
            }
            if let Some(id) = inner.order.pop_front() {
                inner.entries.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_insert_is_rejected() {
        let seen = SeenRequests::new(16, Duration::from_secs(60));
        assert!(seen.insert("req", Some("bob")));
        assert!(!seen.insert("req", Some("carol")));
        assert_eq!(seen.source("req"), Some(Some("bob".to_string())));
    }

    #[test]
    fn test_own_requests_have_no_source() {
        let seen = SeenRequests::new(16, Duration::from_secs(60));
        seen.insert("mine", None);
        assert_eq!(seen.source("mine"), Some(None));
        assert_eq!(seen.source("unknown"), None);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let seen = SeenRequests::new(3, Duration::from_secs(60));
        for id in ["a", "b", "c", "d"] {
            assert!(seen.insert(id, None));
        }
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains("a"));
        assert!(seen.contains("d"));
    }

    #[test]
    fn test_entries_expire() {
        let seen = SeenRequests::new(16, Duration::from_millis(20));
        seen.insert("old", None);
        std::thread::sleep(Duration::from_millis(40));
        assert!(!seen.contains("old"));
        assert!(seen.insert("old", None));
    }
}
