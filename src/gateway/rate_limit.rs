//! Per-principal command rate limiting with per-operation cooldown.
//!
//! Each principal owns one [`RateLimitEntry`] shared by all of its
//! operations: a fixed counting window that resets wholesale on expiry, plus
//! the name and time of the most recent operation for cooldown tracking.
//! The whole check-and-update for a principal runs under one lock with no
//! await point inside, so two concurrent checks can never both spend the
//! last slot of a window.
//!
//! Memory is bounded by `max_principals`. When the table is full and a new
//! principal arrives, closed windows are dropped first; if that frees
//! nothing, the least recently active principal is evicted even though its
//! window is still open. Its next request starts a fresh window, so under
//! sustained cardinality pressure the per-window limit is best-effort.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::config::RateLimitConfig;

/// Fallback max distinct principals tracked when the config says 0.
pub const MAX_PRINCIPALS_DEFAULT: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub window_count: u32,
    pub window_reset_at: Instant,
    pub last_operation: String,
    pub last_operation_at: Instant,
}

impl RateLimitEntry {
    fn fresh(operation: &str, now: Instant, window: Duration) -> Self {
        Self {
            window_count: 1,
            window_reset_at: now + window,
            last_operation: operation.to_owned(),
            last_operation_at: now,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.window_reset_at
    }
}

/// Why a check was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// Same operation repeated inside the cooldown.
    Cooldown,
    /// Window budget exhausted.
    WindowExhausted,
}

impl DenialReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cooldown => "cooldown",
            Self::WindowExhausted => "window_exhausted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Denied {
        retry_after_secs: u64,
        reason: DenialReason,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Allowed => None,
            Self::Denied {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    cooldown: Duration,
    max_principals: usize,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(
        max_per_window: u32,
        window: Duration,
        cooldown: Duration,
        max_principals: usize,
    ) -> Self {
        Self {
            max_per_window,
            window,
            cooldown,
            max_principals: max_principals.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.max_per_window,
            Duration::from_millis(config.window_ms),
            Duration::from_millis(config.cooldown_ms),
            normalize_max_principals(config.max_principals),
        )
    }

    /// Decide whether `principal` may run `operation` now, recording the
    /// attempt when it is allowed.
    pub fn check(&self, principal: &str, operation: &str) -> RateLimitDecision {
        self.check_at(principal, operation, Instant::now())
    }

    pub(crate) fn check_at(
        &self,
        principal: &str,
        operation: &str,
        now: Instant,
    ) -> RateLimitDecision {
        if self.max_per_window == 0 {
            return RateLimitDecision::Allowed;
        }

        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(principal) {
            if !entry.is_expired(now) {
                if entry.last_operation == operation {
                    let elapsed = now.saturating_duration_since(entry.last_operation_at);
                    if elapsed < self.cooldown {
                        return RateLimitDecision::Denied {
                            retry_after_secs: ceil_secs(self.cooldown - elapsed),
                            reason: DenialReason::Cooldown,
                        };
                    }
                }

                if entry.window_count >= self.max_per_window {
                    return RateLimitDecision::Denied {
                        retry_after_secs: ceil_secs(
                            entry.window_reset_at.saturating_duration_since(now),
                        ),
                        reason: DenialReason::WindowExhausted,
                    };
                }

                entry.window_count += 1;
                operation.clone_into(&mut entry.last_operation);
                entry.last_operation_at = now;
                return RateLimitDecision::Allowed;
            }

            *entry = RateLimitEntry::fresh(operation, now, self.window);
            return RateLimitDecision::Allowed;
        }

        if entries.len() >= self.max_principals {
            // Opportunistic stale cleanup before eviction under cardinality pressure.
            entries.retain(|_, entry| !entry.is_expired(now));

            if entries.len() >= self.max_principals {
                let evict_key = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_operation_at)
                    .map(|(k, _)| k.clone());
                if let Some((evicted, entry)) = evict_key.and_then(|k| entries.remove_entry(&k)) {
                    tracing::warn!(
                        principal = %evicted,
                        window_count = entry.window_count,
                        max_principals = self.max_principals,
                        "rate limiter full; evicted principal with an open window"
                    );
                }
            }
        }

        entries.insert(
            principal.to_owned(),
            RateLimitEntry::fresh(operation, now, self.window),
        );
        RateLimitDecision::Allowed
    }

    /// Drop every entry whose window has closed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn tracked_principals(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn entry(&self, principal: &str) -> Option<RateLimitEntry> {
        self.entries.lock().get(principal).cloned()
    }

    /// Run [`sweep`](Self::sweep) every `every` on the tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the limiter is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let removed = limiter.sweep();
                if removed > 0 {
                    tracing::debug!(
                        removed,
                        remaining = limiter.tracked_principals(),
                        "rate limiter sweep"
                    );
                }
            }
        })
    }
}

fn ceil_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_millis().div_ceil(1000);
    u64::try_from(secs).unwrap_or(u64::MAX).max(1)
}

pub(crate) fn normalize_max_principals(configured: usize) -> usize {
    if configured == 0 {
        MAX_PRINCIPALS_DEFAULT
    } else {
        configured
    }
}
