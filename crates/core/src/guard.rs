use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Transport-layer duplicate suppression for webhook message IDs.
///
/// Distinct from the durable delivery log: this map only makes immediate
/// redeliveries (the event source resending before it saw our ack) cheap
/// no-ops. Entries expire after the retention window and are removed by the
/// maintenance sweep.
pub struct ReplayGuard {
    retention: Duration,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ReplayGuard {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Guard with the 15 minute retention the webhook layer uses.
    pub fn with_default_retention() -> Self {
        Self::new(Duration::minutes(15))
    }

    /// Records the message ID and reports whether it was already present.
    ///
    /// The first receipt timestamp is kept on duplicates so the entry ages
    /// out relative to the original delivery.
    pub fn check_and_insert(&self, message_id: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().expect("replay guard poisoned");
        if seen.contains_key(message_id) {
            return true;
        }
        seen.insert(message_id.to_string(), now);
        false
    }

    /// Drops entries older than the retention window, returning the count.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut seen = self.seen.lock().expect("replay guard poisoned");
        let before = seen.len();
        seen.retain(|_, received_at| *received_at > cutoff);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("replay guard poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        raw.parse().expect("timestamp")
    }

    #[test]
    fn first_receipt_is_not_a_duplicate() {
        let guard = ReplayGuard::with_default_retention();
        let now = at("2024-05-01T18:00:00Z");

        assert!(!guard.check_and_insert("msg-1", now));
        assert!(guard.check_and_insert("msg-1", now));
        assert!(!guard.check_and_insert("msg-2", now));
    }

    #[test]
    fn sweep_evicts_entries_past_retention() {
        let guard = ReplayGuard::new(Duration::minutes(15));
        let start = at("2024-05-01T18:00:00Z");

        guard.check_and_insert("old", start);
        guard.check_and_insert("fresh", start + Duration::minutes(14));

        let evicted = guard.evict_expired(start + Duration::minutes(16));
        assert_eq!(evicted, 1);
        assert_eq!(guard.len(), 1);

        // The evicted ID is treated as new again.
        assert!(!guard.check_and_insert("old", start + Duration::minutes(16)));
    }

    #[test]
    fn duplicate_keeps_original_receipt_time() {
        let guard = ReplayGuard::new(Duration::minutes(15));
        let start = at("2024-05-01T18:00:00Z");

        guard.check_and_insert("msg", start);
        assert!(guard.check_and_insert("msg", start + Duration::minutes(10)));

        // Ages out relative to the first receipt, not the retry.
        assert_eq!(guard.evict_expired(start + Duration::minutes(16)), 1);
    }
}
