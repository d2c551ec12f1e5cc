use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const RETRY_INTERVAL: Duration = Duration::from_millis(10);
const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct FlowState {
    in_flight: usize,
    window_start: Instant,
    window_count: u32,
}

/// Shared gate limiting requests in flight (`parallel`) and requests per
/// second (`qps`). A zero limit disables that check.
#[derive(Debug)]
pub struct FlowControl {
    parallel: usize,
    qps: u32,
    state: Mutex<FlowState>,
}

impl FlowControl {
    pub fn new(parallel: usize, qps: u32) -> Self {
        Self {
            parallel,
            qps,
            state: Mutex::new(FlowState {
                in_flight: 0,
                window_start: Instant::now(),
                window_count: 0,
            }),
        }
    }

    pub fn parallel(&self) -> usize {
        self.parallel
    }

    pub fn qps(&self) -> u32 {
        self.qps
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).in_flight
    }

    /// Take a passport if both limits allow it right now.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Passport> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.parallel > 0 && state.in_flight >= self.parallel {
            return None;
        }
        if self.qps > 0 {
            let now = Instant::now();
            if now.duration_since(state.window_start) >= WINDOW {
                state.window_start = now;
                state.window_count = 0;
            }
            if state.window_count >= self.qps {
                return None;
            }
            state.window_count += 1;
        }
        state.in_flight += 1;
        Some(Passport {
            gate: Arc::clone(self),
            released: false,
        })
    }

    /// Wait for a passport, retrying every 10 ms.
    pub async fn acquire(self: &Arc<Self>) -> Passport {
        loop {
            if let Some(passport) = self.try_acquire() {
                return passport;
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// A permit from [`FlowControl`]. Released by [`Passport::cancel`] or on drop.
#[derive(Debug)]
pub struct Passport {
    gate: Arc<FlowControl>,
    released: bool,
}

impl Passport {
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.gate.release();
        }
    }
}

impl Drop for Passport {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_limit_caps_in_flight() {
        let gate = Arc::new(FlowControl::new(2, 0));
        let first = gate.try_acquire().unwrap();
        let _second = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.in_flight(), 2);

        first.cancel();
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn drop_releases_passport() {
        let gate = Arc::new(FlowControl::new(1, 0));
        {
            let _passport = gate.try_acquire().unwrap();
            assert!(gate.try_acquire().is_none());
        }
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn qps_limit_counts_per_window() {
        let gate = Arc::new(FlowControl::new(0, 3));
        for _ in 0..3 {
            gate.try_acquire().unwrap().cancel();
        }
        assert!(gate.try_acquire().is_none());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let gate = Arc::new(FlowControl::new(1, 0));
        let held = gate.try_acquire().unwrap();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        held.cancel();
        let passport = waiter.await.unwrap();
        assert_eq!(gate.in_flight(), 1);
        drop(passport);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn qps_window_resets_lazily() {
        let gate = Arc::new(FlowControl::new(0, 1));
        gate.try_acquire().unwrap().cancel();
        assert!(gate.try_acquire().is_none());
        let started = Instant::now();
        gate.acquire().await.cancel();
        assert!(started.elapsed() >= Duration::from_millis(500));
    }
}
