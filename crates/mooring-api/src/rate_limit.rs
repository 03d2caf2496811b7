use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mooring_core::util::fingerprint;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// Windows kept before expired ones are swept out of the table
const SWEEP_THRESHOLD: usize = 4_096;

/// Endpoint classes with separate per-client quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectedEndpoint {
    /// Delta pulls and status reads
    DeltaSync,
    /// Operation submits and versioned updates
    Write,
}

impl ProtectedEndpoint {
    pub const fn label(self) -> &'static str {
        match self {
            Self::DeltaSync => "delta_sync",
            Self::Write => "write",
        }
    }
}

/// Quota and counters of one endpoint class
struct ClassQuota {
    limit: u32,
    allowed: AtomicU64,
    limited: AtomicU64,
}

impl ClassQuota {
    const fn new(limit: u32) -> Self {
        Self {
            limit,
            allowed: AtomicU64::new(0),
            limited: AtomicU64::new(0),
        }
    }

    fn record(&self, allowed: bool) {
        let counter = if allowed {
            &self.allowed
        } else {
            &self.limited
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

/// Fixed-window limiter over (endpoint class, client id)
#[derive(Clone)]
pub struct EndpointRateLimiter {
    windows: Arc<Mutex<HashMap<(ProtectedEndpoint, String), RateWindow>>>,
    window: Duration,
    delta: Arc<ClassQuota>,
    write: Arc<ClassQuota>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitMetricsSnapshot {
    pub delta_allowed: u64,
    pub delta_limited: u64,
    pub write_allowed: u64,
    pub write_limited: u64,
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.delta_rate_limit_per_window,
            config.write_rate_limit_per_window,
        )
    }

    fn new(window: Duration, delta_limit: u32, write_limit: u32) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            window,
            delta: Arc::new(ClassQuota::new(delta_limit)),
            write: Arc::new(ClassQuota::new(write_limit)),
        }
    }

    fn quota(&self, endpoint: ProtectedEndpoint) -> &ClassQuota {
        match endpoint {
            ProtectedEndpoint::DeltaSync => &self.delta,
            ProtectedEndpoint::Write => &self.write,
        }
    }

    /// Count one request, or refuse it with the seconds until the window resets
    pub async fn check(&self, endpoint: ProtectedEndpoint, client_id: &str) -> Result<(), AppError> {
        let quota = self.quota(endpoint);
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        if windows.len() >= SWEEP_THRESHOLD {
            let window = self.window;
            windows.retain(|_, entry| now.duration_since(entry.started_at) < window);
        }

        let entry = windows
            .entry((endpoint, client_id.to_string()))
            .or_insert(RateWindow {
                started_at: now,
                count: 0,
            });
        let mut elapsed = now.duration_since(entry.started_at);
        if elapsed >= self.window {
            *entry = RateWindow {
                started_at: now,
                count: 0,
            };
            elapsed = Duration::ZERO;
        }

        if entry.count >= quota.limit {
            let remaining = self.window.saturating_sub(elapsed);
            let retry_after_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            quota.record(false);
            tracing::warn!(
                endpoint = endpoint.label(),
                client = fingerprint(client_id),
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(AppError::too_many_requests(
                format!("Too many {} requests", endpoint.label()),
                retry_after_secs.max(1),
            ));
        }

        entry.count += 1;
        quota.record(true);
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            delta_allowed: self.delta.allowed.load(Ordering::Relaxed),
            delta_limited: self.delta.limited.load(Ordering::Relaxed),
            write_allowed: self.write.allowed.load(Ordering::Relaxed),
            write_limited: self.write.limited.load(Ordering::Relaxed),
        }
    }
}
