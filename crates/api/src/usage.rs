//! Per-request usage recording for billing.
//!
//! Recorded after the response is produced, keyed by API key, and held
//! in a bounded in-process buffer the billing exporter drains. Counters
//! also feed the metrics registry.

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;

/// Upper bound on buffered records; oldest entries are dropped first.
const BUFFER_CAP: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub api_key: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct UsageRecorder {
    records: Mutex<Vec<UsageRecord>>,
}

impl UsageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, api_key: &str, method: &str, path: &str, status: u16) {
        counter!("verdant_api_requests_total").increment(1);
        if status >= 400 {
            counter!("verdant_api_request_errors_total").increment(1);
        }

        let mut records = self.records.lock();
        if records.len() >= BUFFER_CAP {
            records.remove(0);
        }
        records.push(UsageRecord {
            api_key: api_key.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            status,
            recorded_at: Utc::now(),
        });
    }

    /// Hand the buffered records to the billing exporter and reset.
    pub fn drain(&self) -> Vec<UsageRecord> {
        std::mem::take(&mut *self.records.lock())
    }
}
