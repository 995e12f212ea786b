//! Cache admission jail.
//!
//! Every request fingerprint is counted here before the cache is touched.
//! While a fingerprint's count is at or below the threshold it is "jailed":
//! the response is served live and never cached. Records age out only
//! through the jail's TTL.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

/// Observation record for one fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailRecord {
    /// How many times the fingerprint has been seen.
    pub count: u64,
    /// When it was last seen.
    pub last_seen: DateTime<Utc>,
}

/// Thread-safe fingerprint counter (moka handles concurrent access).
pub struct Jail {
    records: Cache<String, JailRecord>,
    threshold: u64,
}

impl Jail {
    pub fn new(threshold: u64, ttl: Duration, max_entries: u64) -> Self {
        let records = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self { records, threshold }
    }

    /// Count one more observation of `fingerprint`.
    ///
    /// The upsert is atomic per key, so concurrent observations are never
    /// lost.
    pub fn observe(&self, fingerprint: &str) -> JailRecord {
        let now = Utc::now();
        self.records
            .entry(fingerprint.to_string())
            .and_upsert_with(|existing| match existing {
                Some(entry) => {
                    let record = entry.into_value();
                    JailRecord {
                        count: record.count.saturating_add(1),
                        last_seen: now,
                    }
                }
                None => JailRecord {
                    count: 1,
                    last_seen: now,
                },
            })
            .into_value()
    }

    /// Whether a record has graduated (count strictly above the threshold).
    pub fn is_released(&self, record: &JailRecord) -> bool {
        record.count > self.threshold
    }

    pub fn get(&self, fingerprint: &str) -> Option<JailRecord> {
        self.records.get(fingerprint)
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// All live records, ordered by fingerprint.
    pub fn snapshot(&self) -> BTreeMap<String, JailRecord> {
        self.records
            .iter()
            .map(|(k, v)| (String::clone(&k), v))
            .collect()
    }

    /// Replace every record with `records`.
    pub fn restore(&self, records: BTreeMap<String, JailRecord>) {
        let stale: Vec<_> = self
            .records
            .iter()
            .map(|(k, _)| k)
            .filter(|k| !records.contains_key(k.as_str()))
            .collect();
        for key in stale {
            self.records.invalidate(key.as_str());
        }
        for (fingerprint, record) in records {
            self.records.insert(fingerprint, record);
        }
    }
}
