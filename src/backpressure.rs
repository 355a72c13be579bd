//! Backpressure Controller (C2): per-stream credit window with throttle
//! signaling.
//!
//! Modeled on the teacher's suspend-until-channel-progresses pattern in
//! `session/client.rs::write_with_timeout` (which blocks a writer on a
//! bounded `mpsc` channel rather than an unbounded buffer), generalized into
//! an explicit credit ledger so a stream's "in flight" budget is visible
//! instead of implicit channel capacity.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{EngineError, Result};

/// Per-stream write credit window. A write consumes credit; an
/// acknowledgement (the transport confirming delivery) refunds it.
pub struct BackpressureController {
    initial_credit: usize,
    max_credit: usize,
    throttle_ratio: f64,
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    window: usize,
    in_flight: usize,
    destroyed: bool,
}

impl BackpressureController {
    pub fn new(initial_credit: usize, max_credit: usize, throttle_ratio: f64) -> Self {
        Self {
            initial_credit,
            max_credit,
            throttle_ratio,
            state: Mutex::new(State {
                window: initial_credit,
                in_flight: 0,
                destroyed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Reserves `size` bytes of credit for an in-flight write, waiting if the
    /// window is currently exhausted. Returns an error if the stream has been
    /// destroyed while waiting.
    pub async fn reserve(&self, size: usize) -> Result<()> {
        loop {
            {
                let mut state = self.state.lock().expect("backpressure mutex poisoned");
                if state.destroyed {
                    return Err(EngineError::ConnectionClosed);
                }
                if state.in_flight + size <= state.window {
                    state.in_flight += size;
                    return Ok(());
                }
            }
            self.notify.notified().await;
        }
    }

    /// Acknowledges delivery of `size` bytes, refunding credit and growing
    /// the window up to `max_credit` as the transport proves it can keep up.
    pub fn acknowledge(&self, size: usize) {
        let mut state = self.state.lock().expect("backpressure mutex poisoned");
        state.in_flight = state.in_flight.saturating_sub(size);
        if state.window < self.max_credit {
            state.window = (state.window + size).min(self.max_credit);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// True when 75% or more of the current window is in flight; producers
    /// should pause upstream I/O until this clears.
    pub fn should_throttle(&self) -> bool {
        let state = self.state.lock().expect("backpressure mutex poisoned");
        if state.window == 0 {
            return false;
        }
        (state.in_flight as f64 / state.window as f64) >= self.throttle_ratio
    }

    /// Resets the window to its initial value, e.g. after a reconnect.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("backpressure mutex poisoned");
        state.window = self.initial_credit;
        state.in_flight = 0;
        state.destroyed = false;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Marks the stream destroyed: all pending/future reservations fail with
    /// a cancellation error and any waiters are woken to observe it.
    pub fn destroy(&self) {
        let mut state = self.state.lock().expect("backpressure mutex poisoned");
        state.destroyed = true;
        drop(state);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn reserve_succeeds_within_window() {
        let controller = BackpressureController::new(1024, 4096, 0.75);
        controller.reserve(512).await.unwrap();
        assert!(!controller.should_throttle());
    }

    #[tokio::test]
    async fn throttle_signals_at_75_percent() {
        let controller = BackpressureController::new(1000, 1000, 0.75);
        controller.reserve(750).await.unwrap();
        assert!(controller.should_throttle());
    }

    #[tokio::test]
    async fn reserve_blocks_until_acknowledge_frees_credit() {
        let controller = Arc::new(BackpressureController::new(100, 100, 0.75));
        controller.reserve(100).await.unwrap();

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.reserve(50).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        controller.acknowledge(100);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete after acknowledge")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn destroy_fails_pending_and_future_reservations() {
        let controller = Arc::new(BackpressureController::new(10, 10, 0.75));
        controller.reserve(10).await.unwrap();

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.reserve(5).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.destroy();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(EngineError::ConnectionClosed)));
        assert!(controller.reserve(1).await.is_err());
    }
}
