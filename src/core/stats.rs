// src/core/stats.rs

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Process-wide outcome counters for one run.
#[derive(Debug)]
pub struct Stats {
    started_at: Mutex<DateTime<Utc>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    port_open: AtomicU32,
    port_closed: AtomicU32,
    request_successful: AtomicU32,
    request_failed: AtomicU32,
    response_code_2xx: AtomicU32,
    response_code_3xx: AtomicU32,
    response_code_4xx: AtomicU32,
    response_code_5xx: AtomicU32,
    screenshot_successful: AtomicU32,
    screenshot_failed: AtomicU32,
}

/// Serializable view of [`Stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub port_open: u32,
    pub port_closed: u32,
    pub request_successful: u32,
    pub request_failed: u32,
    pub response_code_2xx: u32,
    pub response_code_3xx: u32,
    pub response_code_4xx: u32,
    pub response_code_5xx: u32,
    pub screenshot_successful: u32,
    pub screenshot_failed: u32,
}

impl StatsSnapshot {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at
            .map(|finished| finished - self.started_at)
            .unwrap_or_else(chrono::Duration::zero)
    }
}

fn bump(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::from_snapshot(StatsSnapshot {
            started_at: Utc::now(),
            ..Default::default()
        })
    }

    pub fn from_snapshot(s: StatsSnapshot) -> Self {
        Self {
            started_at: Mutex::new(s.started_at),
            finished_at: Mutex::new(s.finished_at),
            port_open: AtomicU32::new(s.port_open),
            port_closed: AtomicU32::new(s.port_closed),
            request_successful: AtomicU32::new(s.request_successful),
            request_failed: AtomicU32::new(s.request_failed),
            response_code_2xx: AtomicU32::new(s.response_code_2xx),
            response_code_3xx: AtomicU32::new(s.response_code_3xx),
            response_code_4xx: AtomicU32::new(s.response_code_4xx),
            response_code_5xx: AtomicU32::new(s.response_code_5xx),
            screenshot_successful: AtomicU32::new(s.screenshot_successful),
            screenshot_failed: AtomicU32::new(s.screenshot_failed),
        }
    }

    pub fn start(&self) {
        *self.started_at.lock() = Utc::now();
        *self.finished_at.lock() = None;
    }

    pub fn finish(&self) {
        *self.finished_at.lock() = Some(Utc::now());
    }

    pub fn increment_port_open(&self) {
        bump(&self.port_open);
    }

    pub fn increment_port_closed(&self) {
        bump(&self.port_closed);
    }

    pub fn increment_request_successful(&self) {
        bump(&self.request_successful);
    }

    pub fn increment_request_failed(&self) {
        bump(&self.request_failed);
    }

    /// Counts a response in its 2xx-5xx bucket. Codes outside 200..=599 are not bucketed.
    pub fn record_response_code(&self, code: u16) {
        match code {
            500..=599 => bump(&self.response_code_5xx),
            400..=499 => bump(&self.response_code_4xx),
            300..=399 => bump(&self.response_code_3xx),
            200..=299 => bump(&self.response_code_2xx),
            _ => {}
        }
    }

    pub fn increment_screenshot_successful(&self) {
        bump(&self.screenshot_successful);
    }

    pub fn increment_screenshot_failed(&self) {
        bump(&self.screenshot_failed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU32| c.load(Ordering::Relaxed);
        StatsSnapshot {
            started_at: *self.started_at.lock(),
            finished_at: *self.finished_at.lock(),
            port_open: load(&self.port_open),
            port_closed: load(&self.port_closed),
            request_successful: load(&self.request_successful),
            request_failed: load(&self.request_failed),
            response_code_2xx: load(&self.response_code_2xx),
            response_code_3xx: load(&self.response_code_3xx),
            response_code_4xx: load(&self.response_code_4xx),
            response_code_5xx: load(&self.response_code_5xx),
            screenshot_successful: load(&self.screenshot_successful),
            screenshot_failed: load(&self.screenshot_failed),
        }
    }
}
