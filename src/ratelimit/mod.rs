//! Rate-limit coordination between the two collector roles.
//!
//! The server enforces one sliding-window rate budget per user, shared by
//! the priority and background collectors. The coordinator owns a mutual
//! exclusion gate: a priority poll locks the gate, sleeps one full window
//! so in-flight background activity ages out, performs its poll, then
//! sleeps another window before releasing. The background collector checks
//! the gate before each page request, so a burst of background paging can
//! never cause the priority collector's requests to be throttled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::api::RateLimits;

/// Shared coordination state for one API server's rate window.
///
/// Created once at startup from the server's rate-limit discovery query;
/// the cached parameters are immutable for the process lifetime.
#[derive(Debug)]
pub struct RateLimitCoordinator {
    limits: RateLimits,
    gate: Mutex<()>,
}

impl RateLimitCoordinator {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            gate: Mutex::new(()),
        }
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    fn window(&self) -> Duration {
        Duration::from_secs_f64(self.limits.window_size_secs)
    }

    /// Begin a priority poll: block the background collector, then let its
    /// recent activity age out of the server's window.
    ///
    /// The returned guard must be released with [`PriorityGuard::release`]
    /// once the poll completes, which settles again before unblocking.
    pub async fn begin_priority(&self) -> PriorityGuard<'_> {
        let guard = self.gate.lock().await;
        debug!(
            settle_secs = self.limits.window_size_secs,
            "Priority gate acquired, settling"
        );
        tokio::time::sleep(self.window()).await;
        PriorityGuard {
            _guard: guard,
            window: self.window(),
        }
    }

    /// Background pre-request check: waits out any in-progress priority
    /// poll. Called before every page request, not just once per poll, so
    /// a priority poll that begins mid-drain parks the background stream.
    ///
    /// The lock is dropped immediately; the background collector never
    /// holds the gate across its own requests.
    pub async fn background_checkpoint(&self) {
        let _guard: MutexGuard<'_, ()> = self.gate.lock().await;
    }
}

/// Exclusive hold on the rate window for one priority poll.
pub struct PriorityGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    window: Duration,
}

impl PriorityGuard<'_> {
    /// Settle one more window so the priority poll's own activity ages
    /// out, then release the gate.
    pub async fn release(self) {
        debug!(
            settle_secs = self.window.as_secs_f64(),
            "Priority poll done, settling before release"
        );
        tokio::time::sleep(self.window).await;
    }
}

/// Background batch-size scaling during catch-up.
///
/// On start-up, collection might be well behind schedule; half-size
/// batches bound the time until each resource's oldest records are
/// collected. The first time the background scheduler actually sleeps it
/// has caught up to real time, and the full batch size is restored.
#[derive(Debug)]
pub struct BatchScale {
    base: f64,
    halved: AtomicBool,
}

impl BatchScale {
    /// Scale for a collector starting in catch-up (background role).
    pub fn catching_up(base: f64) -> Self {
        Self {
            base,
            halved: AtomicBool::new(true),
        }
    }

    /// Scale for a collector that never halves (priority role).
    pub fn full(base: f64) -> Self {
        Self {
            base,
            halved: AtomicBool::new(false),
        }
    }

    pub fn factor(&self) -> f64 {
        if self.halved.load(Ordering::Relaxed) {
            self.base / 2.0
        } else {
            self.base
        }
    }

    /// Mark the collector caught up. Returns true if the batch size was
    /// restored by this call.
    pub fn caught_up(&self) -> bool {
        self.halved.swap(false, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(window_secs: f64) -> RateLimits {
        RateLimits {
            window_size_secs: window_secs,
            segment_count: 6,
            max_page_size: 1000,
            per_user_threshold: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_poll_settles_two_full_windows() {
        let coordinator = RateLimitCoordinator::new(limits(60.0));

        let started = tokio::time::Instant::now();
        let guard = coordinator.begin_priority().await;
        guard.release().await;

        assert!(started.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_blocked_while_priority_holds_gate() {
        let coordinator = std::sync::Arc::new(RateLimitCoordinator::new(limits(60.0)));

        let guard = coordinator.begin_priority().await;

        // The background checkpoint cannot complete while the gate is held.
        let blocked = coordinator.clone();
        let check = tokio::spawn(async move { blocked.background_checkpoint().await });
        tokio::task::yield_now().await;
        assert!(!check.is_finished());

        guard.release().await;
        check.await.unwrap();
    }

    #[test]
    fn test_batch_scale_halves_then_restores_once() {
        let scale = BatchScale::catching_up(1.0);
        assert_eq!(scale.factor(), 0.5);

        assert!(scale.caught_up());
        assert_eq!(scale.factor(), 1.0);
        // Second sleep is a no-op
        assert!(!scale.caught_up());
    }

    #[test]
    fn test_priority_scale_never_halved() {
        let scale = BatchScale::full(2.0);
        assert_eq!(scale.factor(), 2.0);
        assert!(!scale.caught_up());
    }
}
