//! Derive the watermark of a tiered store from memory-mapping activity.
//!
//! Something outside this crate observes mapping events, for instance a tracepoint on the
//! `mmap` syscall, and reports how many it saw. The [`PressureMonitor`] sums the counts over a
//! sliding window and publishes [`Level::High`] once the sum reaches a threshold, and
//! [`Level::Low`] again when it falls back below a second, lower one.
use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tiered_shm::{Level, Watermark};

/// Thresholds of a [`PressureMonitor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Events older than this no longer count.
    pub window: Duration,
    /// Switch to high pressure at this many events within the window.
    pub high_threshold: u64,
    /// Switch back to low pressure at this many events or fewer.
    pub low_threshold: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("low threshold {low} is above high threshold {high}")]
    InvertedThresholds { low: u64, high: u64 },
}

/// Counts mapping events and keeps a [`Watermark`] up to date.
pub struct PressureMonitor {
    options: MonitorOptions,
    watermark: Watermark,
    events: VecDeque<(Instant, u64)>,
    total: u64,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        MonitorOptions {
            window: Duration::from_secs(1),
            high_threshold: 1024,
            low_threshold: 512,
        }
    }
}

impl PressureMonitor {
    pub fn new(watermark: Watermark, options: MonitorOptions) -> Result<Self, MonitorError> {
        if options.low_threshold > options.high_threshold {
            return Err(MonitorError::InvertedThresholds {
                low: options.low_threshold,
                high: options.high_threshold,
            });
        }

        Ok(PressureMonitor {
            options,
            watermark,
            events: VecDeque::new(),
            total: 0,
        })
    }

    /// Account `count` events observed at `now`.
    pub fn record(&mut self, now: Instant, count: u64) {
        if count == 0 {
            return;
        }

        self.events.push_back((now, count));
        self.total = self.total.saturating_add(count);
    }

    /// Expire old events, then publish and return the resulting level.
    pub fn evaluate(&mut self, now: Instant) -> Level {
        while let Some(&(at, count)) = self.events.front() {
            if now.saturating_duration_since(at) < self.options.window {
                break;
            }

            self.events.pop_front();
            // `record` saturates, so the sum may be below the parts.
            self.total = self.total.saturating_sub(count);
        }

        let current = self.watermark.level();
        let next = match current {
            Level::Low if self.total >= self.options.high_threshold => Level::High,
            Level::High if self.total <= self.options.low_threshold => Level::Low,
            level => level,
        };

        if next != current {
            self.watermark.set(next);
            tracing::info!(from = %current, to = %next, events = self.total, "watermark changed");
        }

        next
    }

    /// Events within the window as of the last `record` or `evaluate`.
    pub fn events_in_window(&self) -> u64 {
        self.total
    }

    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }
}

/// Run `monitor` on its own thread, fed with event counts from `events`.
///
/// The level is re-evaluated on every message and at least every `tick`. The thread exits when
/// all senders are gone.
pub fn spawn(
    mut monitor: PressureMonitor,
    events: Receiver<u64>,
    tick: Duration,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        match events.recv_timeout(tick) {
            Ok(count) => monitor.record(Instant::now(), count),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!("event source closed, stopping monitor");
                break;
            }
        }

        monitor.evaluate(Instant::now());
    })
}
