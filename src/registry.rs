//! In-memory registry of devices known to a gateway.
//!
//! Keeps the last full state payload per device plus a last-seen timestamp
//! for every identifier that appeared in any message. Records are never
//! explicitly deleted; they soft-expire through the liveness check.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Last-known state of a single device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// Model string as reported by the gateway.
    pub model: String,
    /// Full state payload from the most recent `read_ack`.
    pub payload: Value,
    /// When a message referencing this device was last processed.
    pub last_seen: Instant,
}

/// Registry of device state and liveness, owned by the gateway session.
///
/// Timestamps are passed in explicitly so liveness logic can be driven with
/// simulated time in tests.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    records: HashMap<String, DeviceRecord>,
    last_seen: HashMap<String, Instant>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite the full record for a device.
    pub fn upsert(&mut self, sid: &str, model: &str, payload: Value, now: Instant) {
        self.records.insert(
            sid.to_string(),
            DeviceRecord {
                model: model.to_string(),
                payload,
                last_seen: now,
            },
        );
        self.touch(sid, now);
    }

    /// Update only the last-seen timestamp for a device.
    ///
    /// Used when a message references a device without carrying full state.
    /// The timestamp is monotonically non-decreasing per identifier.
    pub fn touch(&mut self, sid: &str, now: Instant) {
        self.last_seen
            .entry(sid.to_string())
            .and_modify(|seen| {
                if now > *seen {
                    *seen = now;
                }
            })
            .or_insert(now);

        if let Some(record) = self.records.get_mut(sid) {
            if now > record.last_seen {
                record.last_seen = now;
            }
        }
    }

    pub fn get(&self, sid: &str) -> Option<&DeviceRecord> {
        self.records.get(sid)
    }

    /// Stable id-sorted traversal of all full-state records.
    ///
    /// Used to deliver an initial catch-up to a newly subscribed observer.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        let mut entries: Vec<(String, Value)> = self
            .records
            .iter()
            .map(|(sid, record)| (sid.clone(), record.payload.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Whether a message touching `sid` was processed within `timeout` of
    /// `now`. False for never-seen identifiers.
    pub fn is_live(&self, sid: &str, now: Instant, timeout: Duration) -> bool {
        match self.last_seen.get(sid) {
            Some(seen) => now.saturating_duration_since(*seen) < timeout,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn test_is_live_false_for_unknown_sid() {
        let registry = DeviceRegistry::new();
        assert!(!registry.is_live("158d0001000001", Instant::now(), TIMEOUT));
    }

    #[test]
    fn test_is_live_within_timeout() {
        let mut registry = DeviceRegistry::new();
        let t0 = Instant::now();

        registry.touch("DEV1", t0);
        assert!(registry.is_live("DEV1", t0 + Duration::from_secs(29), TIMEOUT));
        assert!(!registry.is_live("DEV1", t0 + Duration::from_secs(30), TIMEOUT));
        assert!(!registry.is_live("DEV1", t0 + Duration::from_secs(31), TIMEOUT));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut registry = DeviceRegistry::new();
        let t0 = Instant::now();

        registry.touch("DEV1", t0 + Duration::from_secs(10));
        // An out-of-order datagram must not move the timestamp backwards.
        registry.touch("DEV1", t0);
        assert!(registry.is_live(
            "DEV1",
            t0 + Duration::from_secs(10) + Duration::from_secs(29),
            TIMEOUT
        ));
    }

    #[test]
    fn test_upsert_overwrites_payload() {
        let mut registry = DeviceRegistry::new();
        let t0 = Instant::now();

        registry.upsert("DEV1", "plug", json!({"status": "off"}), t0);
        registry.upsert("DEV1", "plug", json!({"status": "on"}), t0 + Duration::from_secs(1));

        let record = registry.get("DEV1").unwrap();
        assert_eq!(record.payload["status"], "on");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_is_id_sorted() {
        let mut registry = DeviceRegistry::new();
        let t0 = Instant::now();

        registry.upsert("B", "plug", json!({"n": 2}), t0);
        registry.upsert("A", "motion", json!({"n": 1}), t0);
        registry.upsert("C", "switch", json!({"n": 3}), t0);

        let snapshot = registry.snapshot();
        let ids: Vec<&str> = snapshot.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_touch_does_not_create_a_record() {
        let mut registry = DeviceRegistry::new();
        registry.touch("GHOST", Instant::now());

        assert!(registry.get("GHOST").is_none());
        assert!(registry.snapshot().is_empty());
        assert!(registry.is_live("GHOST", Instant::now(), TIMEOUT));
    }
}
