//! Bounded see-once windows with per-entry TTL.
//!
//! The upstream stream may re-emit the same logical event with the same id
//! (reconnection replays) or with a different id (duplicate row inserts a
//! few milliseconds apart). Each engine therefore runs two windows: an
//! id-window with a long TTL and a content-window with a short one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A TTL-bounded set with an atomic check-and-insert.
#[derive(Debug)]
pub struct DedupWindow {
    name: &'static str,
    entries: Mutex<HashMap<String, Instant>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupStats {
    pub live_entries: usize,
}

impl DedupWindow {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Check-and-insert. Returns whether the key was already present and
    /// unexpired. Expired entries are evicted on the way through.
    pub fn mark(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expiry| *expiry > now);
        if entries.contains_key(key) {
            return true;
        }
        entries.insert(key.to_string(), now + ttl);
        false
    }

    /// Observe without inserting.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries.get(key).is_some_and(|expiry| *expiry > now)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> DedupStats {
        let now = Instant::now();
        let entries = self.entries.lock();
        DedupStats {
            live_entries: entries.values().filter(|expiry| **expiry > now).count(),
        }
    }
}

/// Content fingerprint for inbound user messages: `chat_id|user_id|prefix`.
pub fn content_key(chat_id: &str, user_id: &str, text: &str) -> String {
    let prefix: String = text.chars().take(80).collect();
    format!("{}|{}|{}", chat_id, user_id, prefix)
}

/// Fingerprint for peer-chat dedup: `speaker|prefix`.
pub fn speaker_key(speaker: &str, text: &str, prefix_chars: usize) -> String {
    let prefix: String = text.chars().take(prefix_chars).collect();
    format!("{}|{}", speaker, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_sees_once() {
        let window = DedupWindow::new("id");
        assert!(!window.mark("m-1", Duration::from_secs(60)));
        assert!(window.mark("m-1", Duration::from_secs(60)));
        assert!(!window.mark("m-2", Duration::from_secs(60)));
    }

    #[test]
    fn test_entries_expire() {
        let window = DedupWindow::new("content");
        assert!(!window.mark("k", Duration::from_millis(0)));
        // Zero TTL expires immediately; the second mark is a fresh insert.
        assert!(!window.mark("k", Duration::from_secs(60)));
        assert!(window.contains("k"));
    }

    #[test]
    fn test_clear() {
        let window = DedupWindow::new("id");
        window.mark("a", Duration::from_secs(60));
        window.mark("b", Duration::from_secs(60));
        assert_eq!(window.stats().live_entries, 2);
        window.clear();
        assert_eq!(window.stats().live_entries, 0);
        assert!(!window.contains("a"));
    }

    #[test]
    fn test_content_key_truncates_to_eighty_chars() {
        let long = "x".repeat(200);
        let key = content_key("c-1", "u-1", &long);
        assert_eq!(key.len(), "c-1|u-1|".len() + 80);
    }

    #[test]
    fn test_speaker_key() {
        assert_eq!(speaker_key("beta", "hello there", 5), "beta|hello");
    }
}
