use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Cooperative pause switch for a running flow.
///
/// Clone handles share the flag: the UI side pauses/resumes, the flow task
/// parks in [`wait_if_paused`] between commands. Waking re-checks the
/// cancellation signal so a paused flow can still be torn down.
///
/// [`wait_if_paused`]: FlowController::wait_if_paused
#[derive(Clone, Default)]
pub struct FlowController {
    paused: Arc<AtomicBool>,
}

impl FlowController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Park while paused, polling at 500 ms granularity at most.
    pub async fn wait_if_paused(&self, cancellation: &CancellationToken) {
        while self.is_paused() && !cancellation.is_cancelled() {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_not_paused_returns_immediately() {
        let controller = FlowController::new();
        let token = CancellationToken::new();
        // Must not hang.
        controller.wait_if_paused(&token).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_waits_until_resume() {
        let controller = FlowController::new();
        controller.pause();
        let token = CancellationToken::new();

        let waiter = controller.clone();
        let waiter_token = token.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_if_paused(&waiter_token).await;
        });

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!handle.is_finished());

        controller.resume();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(handle.is_finished());
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_wakes_a_paused_flow() {
        let controller = FlowController::new();
        controller.pause();
        let token = CancellationToken::new();

        let waiter = controller.clone();
        let waiter_token = token.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_if_paused(&waiter_token).await;
        });

        token.cancel();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(handle.is_finished());
        handle.await.unwrap();
    }
}
