//! Session affinity tracking
//!
//! Maps a session id to the worker that last served it. Entries expire once
//! the TTL has passed since their last access; the TTL is read from the live
//! configuration on every lookup and sweep, so a changed TTL applies to
//! existing entries immediately.

use chrono::{DateTime, Utc};
use snakepit_config::ConfigHandle;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::worker::WorkerId;

#[derive(Debug, Clone)]
struct AffinityEntry {
    worker_id: WorkerId,
    bound_at: DateTime<Utc>,
    last_access: Instant,
}

/// Result of resolving a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffinityLookup {
    /// The session is bound to this worker
    Hit(WorkerId),
    /// No entry for the session
    Miss,
    /// The entry had outlived the TTL and was removed
    Expired(WorkerId),
}

/// Session to worker bindings
pub struct AffinityTracker {
    config: ConfigHandle,
    entries: HashMap<String, AffinityEntry>,
}

impl AffinityTracker {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    fn ttl(&self) -> Duration {
        self.config.read(|c| c.affinity.ttl)
    }

    /// Bind `session_id` to `worker_id`; the latest bind wins
    pub fn bind(&mut self, session_id: &str, worker_id: &WorkerId) {
        let now = Instant::now();
        match self.entries.get_mut(session_id) {
            Some(entry) if entry.worker_id == *worker_id => entry.last_access = now,
            _ => {
                self.entries.insert(
                    session_id.to_string(),
                    AffinityEntry {
                        worker_id: worker_id.clone(),
                        bound_at: Utc::now(),
                        last_access: now,
                    },
                );
            }
        }
    }

    /// Resolve a session, expiring its entry if the TTL has passed
    pub fn lookup(&mut self, session_id: &str) -> AffinityLookup {
        let ttl = self.ttl();
        match self.entries.get(session_id) {
            None => AffinityLookup::Miss,
            Some(entry) if entry.last_access.elapsed() >= ttl => {
                let worker_id = entry.worker_id.clone();
                self.entries.remove(session_id);
                AffinityLookup::Expired(worker_id)
            }
            Some(entry) => AffinityLookup::Hit(entry.worker_id.clone()),
        }
    }

    /// Restart the TTL of an existing entry
    pub fn refresh(&mut self, session_id: &str) -> bool {
        match self.entries.get_mut(session_id) {
            Some(entry) => {
                entry.last_access = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove every expired entry, returning the removed bindings
    pub fn expire_sweep(&mut self) -> Vec<(String, WorkerId)> {
        let ttl = self.ttl();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.last_access.elapsed() >= ttl)
            .map(|(session, _)| session.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|session| {
                let entry = self.entries.remove(&session)?;
                Some((session, entry.worker_id))
            })
            .collect()
    }

    /// Remove one session, returning the worker it was bound to
    pub fn remove(&mut self, session_id: &str) -> Option<WorkerId> {
        self.entries.remove(session_id).map(|entry| entry.worker_id)
    }

    /// Drop every entry pointing at `worker_id`
    pub fn remove_worker(&mut self, worker_id: &WorkerId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.worker_id != *worker_id);
        before - self.entries.len()
    }

    /// When the session was first bound to its current worker
    pub fn bound_at(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(session_id).map(|entry| entry.bound_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snakepit_config::SnakepitConfig;
    use std::thread;

    fn tracker(ttl_ms: u64) -> (ConfigHandle, AffinityTracker) {
        let mut config = SnakepitConfig::default();
        config.affinity.ttl = Duration::from_millis(ttl_ms);
        let handle = ConfigHandle::new(config).unwrap();
        (handle.clone(), AffinityTracker::new(handle))
    }

    fn worker(n: usize) -> WorkerId {
        WorkerId::new(format!("worker-{}-test", n))
    }

    #[test]
    fn test_bind_and_lookup() {
        let (_, mut tracker) = tracker(10_000);
        assert_eq!(tracker.lookup("a"), AffinityLookup::Miss);

        tracker.bind("a", &worker(1));
        assert_eq!(tracker.lookup("a"), AffinityLookup::Hit(worker(1)));

        tracker.bind("a", &worker(2));
        assert_eq!(tracker.lookup("a"), AffinityLookup::Hit(worker(2)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let (_, mut tracker) = tracker(50);
        tracker.bind("a", &worker(1));
        thread::sleep(Duration::from_millis(80));

        assert_eq!(tracker.lookup("a"), AffinityLookup::Expired(worker(1)));
        assert_eq!(tracker.lookup("a"), AffinityLookup::Miss);
    }

    #[test]
    fn test_refresh_extends_ttl() {
        let (_, mut tracker) = tracker(100);
        tracker.bind("a", &worker(1));
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(50));
            assert!(tracker.refresh("a"));
        }
        assert_eq!(tracker.lookup("a"), AffinityLookup::Hit(worker(1)));
        assert!(!tracker.refresh("missing"));
    }

    #[test]
    fn test_ttl_change_applies_to_existing_entries() {
        let (config, mut tracker) = tracker(60_000);
        tracker.bind("a", &worker(1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(tracker.lookup("a"), AffinityLookup::Hit(worker(1)));

        config
            .update(|c| c.affinity.ttl = Duration::from_millis(10))
            .unwrap();
        assert_eq!(tracker.lookup("a"), AffinityLookup::Expired(worker(1)));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (_, mut tracker) = tracker(60);
        tracker.bind("old", &worker(1));
        thread::sleep(Duration::from_millis(90));
        tracker.bind("new", &worker(2));

        let swept = tracker.expire_sweep();
        assert_eq!(swept, vec![("old".to_string(), worker(1))]);
        assert_eq!(tracker.lookup("new"), AffinityLookup::Hit(worker(2)));
    }

    #[test]
    fn test_remove_worker_drops_its_sessions() {
        let (_, mut tracker) = tracker(10_000);
        tracker.bind("a", &worker(1));
        tracker.bind("b", &worker(1));
        tracker.bind("c", &worker(2));

        assert_eq!(tracker.remove_worker(&worker(1)), 2);
        assert_eq!(tracker.lookup("a"), AffinityLookup::Miss);
        assert_eq!(tracker.lookup("c"), AffinityLookup::Hit(worker(2)));
        assert!(tracker.bound_at("c").is_some());
    }
}
