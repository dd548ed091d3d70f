//! Sliding-window admission gate for write requests.
//!
//! Writes are classified into a bucket by method and path; reads are never
//! limited. Each `bucket:client` key keeps the instants of its admitted
//! requests inside the window. A check trims expired instants from the
//! front, rejects when the remainder is at the bucket's limit, and
//! otherwise records the request.
//!
//! All state sits behind one mutex held for the whole check-and-update.
//! Every `cleanup_every` checks the same critical section also sweeps the
//! map and drops keys with nothing left in the window.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;

use crate::config::RateLimitConfig;

pub const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Bulk source upload, feed import, refresh, observation ingestion.
    WriteHeavy,
    WriteDefault,
}

impl Bucket {
    pub fn name(&self) -> &'static str {
        match self {
            Bucket::WriteHeavy => "write_heavy",
            Bucket::WriteDefault => "write_default",
        }
    }
}

/// Bucket for a request, or `None` for reads.
pub fn classify(method: &str, path: &str) -> Option<Bucket> {
    let method = method.to_ascii_uppercase();
    if !matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE") {
        return None;
    }
    let path = path.trim_end_matches('/');
    let heavy = path.starts_with("/actors/")
        && ["/sources", "/sources/import-feeds", "/refresh", "/observations", "/taxii/sync"]
            .iter()
            .any(|suffix| path.ends_with(suffix));
    Some(if heavy {
        Bucket::WriteHeavy
    } else {
        Bucket::WriteDefault
    })
}

/// First hop of `X-Forwarded-For`, else the peer address, else `unknown`.
pub fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty());
    match (forwarded, peer) {
        (Some(hop), _) => hop.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => UNKNOWN_CLIENT.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny { retry_after: u64, limit: usize },
}

#[derive(Default)]
struct State {
    windows: HashMap<String, VecDeque<Instant>>,
    checks: u64,
}

pub struct RateLimiter {
    enabled: bool,
    window: Duration,
    default_limit: usize,
    heavy_limit: usize,
    cleanup_every: u64,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            window: Duration::from_secs(config.window_seconds.max(1)),
            default_limit: config.default_per_window.max(1),
            heavy_limit: config.heavy_per_window.max(1),
            cleanup_every: config.cleanup_every.max(1),
            state: Mutex::new(State::default()),
        }
    }

    pub fn limit_for(&self, bucket: Bucket) -> usize {
        match bucket {
            Bucket::WriteHeavy => self.heavy_limit,
            Bucket::WriteDefault => self.default_limit,
        }
    }

    pub fn check(&self, method: &str, path: &str, client: &str) -> Admission {
        self.check_at(method, path, client, Instant::now())
    }

    pub fn check_at(&self, method: &str, path: &str, client: &str, now: Instant) -> Admission {
        if !self.enabled {
            return Admission::Allow;
        }
        let Some(bucket) = classify(method, path) else {
            return Admission::Allow;
        };
        let limit = self.limit_for(bucket);
        let key = format!("{}:{}", bucket.name(), client);

        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.checks = state.checks.wrapping_add(1);
        if state.checks % self.cleanup_every == 0 {
            prune(&mut state.windows, now, self.window);
        }

        let timestamps = state.windows.entry(key).or_default();
        trim(timestamps, now, self.window);
        if timestamps.len() >= limit {
            let oldest = timestamps.front().copied().unwrap_or(now);
            let elapsed = now.saturating_duration_since(oldest);
            let remaining = self.window.saturating_sub(elapsed).as_secs();
            return Admission::Deny {
                retry_after: (remaining + 1).max(1),
                limit,
            };
        }
        timestamps.push_back(now);
        Admission::Allow
    }

    /// Keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .windows
            .len()
    }
}

fn trim(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = timestamps.front() {
        if now.saturating_duration_since(*front) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

fn prune(windows: &mut HashMap<String, VecDeque<Instant>>, now: Instant, window: Duration) {
    windows.retain(|_, timestamps| {
        trim(timestamps, now, window);
        !timestamps.is_empty()
    });
}
