//! Cancellable one-shot timers.
//!
//! Timers back the authentication timeout and the stream-close grace
//! period. Each scheduled task owns only the values it needs; the handle is
//! stored in the connection's scoped storage so whichever path finalizes the
//! connection first can cancel the other.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a scheduled timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    /// Cancel the timer.
    ///
    /// Returns true if the timer had not fired yet, meaning its task will
    /// never run.
    pub fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.token.cancel();
        won
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

/// Shared timer service.
///
/// All timers are children of one shutdown token, so shutting the service
/// down cancels every pending timer at once.
#[derive(Debug, Clone)]
pub struct TimerService {
    shutdown: CancellationToken,
}

impl TimerService {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }

    /// Run `task` after `delay` unless cancelled first.
    pub fn schedule<F, Fut>(&self, name: &'static str, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let state = Arc::new(AtomicU8::new(PENDING));
        let handle = TimerHandle {
            token: token.clone(),
            state: Arc::clone(&state),
        };

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!(timer = name, "Timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    if state
                        .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        trace!(timer = name, "Timer fired");
                        task().await;
                    }
                }
            }
        });

        handle
    }

    /// Cancel every pending timer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let timers = TimerService::new(CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let handle = timers.schedule("test", Duration::from_secs(10), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(handle.is_pending());
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(handle.has_fired());
        assert!(!handle.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_expiry() {
        let timers = TimerService::new(CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let handle = timers.schedule("test", Duration::from_secs(10), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(handle.cancel());
        assert!(!handle.cancel());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending() {
        let timers = TimerService::new(CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        timers.schedule("test", Duration::from_secs(5), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timers.shutdown();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
