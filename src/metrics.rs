//! Process-wide metrics shared by every worker.
//!
//! Monotonic counters are atomics; the rolling RPS and flow-duration windows
//! sit behind a small mutex that is held only long enough to push or prune.
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Window over which requests-per-second is computed.
const RPS_WINDOW: Duration = Duration::from_secs(10);
/// Number of completed iterations the rolling average covers.
const FLOW_DURATION_WINDOW: usize = 100;

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    running: AtomicBool,
    active_users: AtomicU64,
    total_requests: AtomicU64,
    flow_count: AtomicU64,
    windows: Mutex<Windows>,
}

#[derive(Debug, Default)]
struct Windows {
    request_times: VecDeque<Instant>,
    flow_durations: VecDeque<Duration>,
}

/// A consistent copy of the live metrics, serializable for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub running: bool,
    pub active_simulated_users: u64,
    pub total_requests: u64,
    pub rps: f64,
    pub flow_count: u64,
    pub avg_flow_duration_ms: f64,
}

impl MetricsAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn user_started(&self) {
        self.active_users.fetch_add(1, Ordering::Relaxed);
    }

    pub fn user_finished(&self) {
        loop {
            let current = self.active_users.load(Ordering::Relaxed);
            let Some(next) = current.checked_sub(1) else {
                break;
            };
            if self
                .active_users
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Records one completed request (a final response was received).
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|err| err.into_inner());
        windows.request_times.push_back(now);
        prune_requests(&mut windows, now);
    }

    /// Records the duration of one flow iteration that finished without an
    /// error.
    pub fn record_flow_duration(&self, duration: Duration) {
        self.flow_count.fetch_add(1, Ordering::Relaxed);
        let mut windows = self.windows.lock().unwrap_or_else(|err| err.into_inner());
        windows.flow_durations.push_back(duration);
        while windows.flow_durations.len() > FLOW_DURATION_WINDOW {
            windows.flow_durations.pop_front();
        }
    }

    #[must_use]
    pub fn active_users(&self) -> u64 {
        self.active_users.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|err| err.into_inner());
        prune_requests(&mut windows, now);
        let rps = windows.request_times.len() as f64 / RPS_WINDOW.as_secs_f64();
        let avg_flow_duration_ms = if windows.flow_durations.is_empty() {
            0.0
        } else {
            let total: Duration = windows.flow_durations.iter().sum();
            total.as_secs_f64() * 1000.0 / windows.flow_durations.len() as f64
        };
        drop(windows);

        MetricsSnapshot {
            running: self.running.load(Ordering::Relaxed),
            active_simulated_users: self.active_users.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rps,
            flow_count: self.flow_count.load(Ordering::Relaxed),
            avg_flow_duration_ms,
        }
    }
}

fn prune_requests(windows: &mut Windows, now: Instant) {
    while let Some(oldest) = windows.request_times.front() {
        if now.duration_since(*oldest) > RPS_WINDOW {
            windows.request_times.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() -> Result<(), String> {
        let metrics = MetricsAggregator::new();
        for _ in 0..5 {
            metrics.record_request();
        }
        metrics.record_flow_duration(Duration::from_millis(10));

        let snapshot = metrics.snapshot();
        if snapshot.total_requests != 5 {
            return Err(format!("expected 5 requests, got {}", snapshot.total_requests));
        }
        if snapshot.flow_count != 1 {
            return Err(format!("expected 1 flow, got {}", snapshot.flow_count));
        }
        if snapshot.rps <= 0.0 {
            return Err("rps should be positive right after requests".to_owned());
        }
        Ok(())
    }

    #[test]
    fn active_users_never_underflow() -> Result<(), String> {
        let metrics = MetricsAggregator::new();
        metrics.user_finished();
        if metrics.active_users() != 0 {
            return Err("decrement below zero must saturate".to_owned());
        }
        metrics.user_started();
        metrics.user_started();
        metrics.user_finished();
        if metrics.active_users() != 1 {
            return Err(format!("expected 1 active user, got {}", metrics.active_users()));
        }
        Ok(())
    }

    #[test]
    fn average_flow_duration_is_rolling() -> Result<(), String> {
        let metrics = MetricsAggregator::new();
        // Fill the window with 10 ms iterations, then push enough 20 ms ones
        // to evict them all.
        for _ in 0..FLOW_DURATION_WINDOW {
            metrics.record_flow_duration(Duration::from_millis(10));
        }
        for _ in 0..FLOW_DURATION_WINDOW {
            metrics.record_flow_duration(Duration::from_millis(20));
        }
        let snapshot = metrics.snapshot();
        if (snapshot.avg_flow_duration_ms - 20.0).abs() > 0.01 {
            return Err(format!(
                "expected rolling average 20 ms, got {}",
                snapshot.avg_flow_duration_ms
            ));
        }
        if snapshot.flow_count != 2 * FLOW_DURATION_WINDOW as u64 {
            return Err("flow_count must stay monotonic while the window rolls".to_owned());
        }
        Ok(())
    }

    #[test]
    fn empty_window_reports_zero_average() -> Result<(), String> {
        let snapshot = MetricsAggregator::new().snapshot();
        if snapshot.avg_flow_duration_ms != 0.0 || snapshot.rps != 0.0 {
            return Err("empty metrics should report zeros".to_owned());
        }
        Ok(())
    }
}
