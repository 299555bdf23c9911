//! Admission control for service calls.
//!
//! Two independent limits gate every call:
//!
//! ```text
//! acquire() ──▶ [semaphore: max_concurrent] ──▶ [start log: N per window] ──▶ Ticket
//! ```
//!
//! The concurrency permit is taken first so a worker waiting on the rolling
//! window already holds its slot and cannot be overtaken indefinitely.
//! The start log is a sliding log of call start times: entries older than
//! the window are evicted on every acquisition, and a full log suspends the
//! caller until its oldest entry leaves the window.

use crate::error::ExtractError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Limits enforced by [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum outstanding tickets.
    pub max_concurrent: usize,
    /// Maximum acquisitions starting within any trailing `window`.
    pub max_requests_per_window: usize,
    pub window: Duration,
    /// Fixed minimum gap between consecutive acquisitions. Zero disables it.
    pub min_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_requests_per_window: 60,
            window: Duration::from_secs(60),
            min_interval: Duration::ZERO,
        }
    }
}

/// Proof of admission. Holding it counts against the concurrency ceiling.
///
/// Dropping a ticket releases it, so early returns and panics in a worker
/// never leak a slot.
#[derive(Debug)]
pub struct Ticket {
    id: u64,
    permit: Option<OwnedSemaphorePermit>,
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }
}

/// Concurrency ceiling plus rolling-window rate limit.
#[derive(Debug)]
pub struct Scheduler {
    limits: RateLimitConfig,
    permits: Arc<Semaphore>,
    starts: Mutex<VecDeque<Instant>>,
    next_ticket: AtomicU64,
}

impl Scheduler {
    pub fn new(limits: RateLimitConfig) -> Self {
        let limits = RateLimitConfig {
            max_concurrent: limits.max_concurrent.max(1),
            max_requests_per_window: limits.max_requests_per_window.max(1),
            ..limits
        };
        Self {
            permits: Arc::new(Semaphore::new(limits.max_concurrent)),
            starts: Mutex::new(VecDeque::with_capacity(limits.max_requests_per_window)),
            next_ticket: AtomicU64::new(1),
            limits,
        }
    }

    pub fn limits(&self) -> &RateLimitConfig {
        &self.limits
    }

    /// Wait until both limits admit one more call.
    pub async fn acquire(&self) -> Result<Ticket, ExtractError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| ExtractError::Internal(format!("scheduler closed: {e}")))?;

        while let Some(wait) = self.reserve_start() {
            debug!(wait_ms = wait.as_millis() as u64, "rate window full, waiting");
            tokio::time::sleep(wait).await;
        }

        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        Ok(Ticket {
            id,
            permit: Some(permit),
        })
    }

    /// Give a ticket back. Releasing the same ticket twice is logged and ignored.
    pub fn release(&self, ticket: &mut Ticket) {
        match ticket.permit.take() {
            Some(permit) => drop(permit),
            None => warn!(ticket = ticket.id, "ticket released twice, ignoring"),
        }
    }

    /// Tickets currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.limits.max_concurrent - self.permits.available_permits()
    }

    /// Record a call start if the window and pacing allow it now; otherwise
    /// return how long to wait before checking again.
    fn reserve_start(&self) -> Option<Duration> {
        let mut starts = self.starts.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        while let Some(&oldest) = starts.front() {
            if now.duration_since(oldest) >= self.limits.window {
                starts.pop_front();
            } else {
                break;
            }
        }

        let mut wait = Duration::ZERO;
        if starts.len() >= self.limits.max_requests_per_window {
            if let Some(&oldest) = starts.front() {
                wait = (oldest + self.limits.window).saturating_duration_since(now);
            }
        }
        if !self.limits.min_interval.is_zero() {
            if let Some(&latest) = starts.back() {
                wait = wait.max((latest + self.limits.min_interval).saturating_duration_since(now));
            }
        }

        if wait.is_zero() {
            starts.push_back(now);
            None
        } else {
            Some(wait)
        }
    }
}
