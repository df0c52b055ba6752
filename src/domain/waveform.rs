//! ECG Waveform Batcher
//!
//! Coalesces raw ECG samples and publishes them in batches, bounded by a
//! time window and a size cap, so the event rate stays low regardless of
//! the notification rate.

use crate::domain::events::{EcgEvent, EventBus};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

pub type SharedBatcher = Arc<Mutex<WaveformBatcher>>;

/// Lock a shared batcher, recovering the data if a holder panicked.
pub fn lock(batcher: &SharedBatcher) -> MutexGuard<'_, WaveformBatcher> {
    batcher.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    pub window: Duration,
    pub max_batch: usize,
    pub sample_rate: u32,
    pub scale_factor: f32,
}

pub struct WaveformBatcher {
    config: BatcherConfig,
    buffer: Vec<i16>,
    /// Arrival time of the oldest buffered sample
    window_start: Option<Instant>,
    session_open: bool,
    bus: EventBus,
}

impl WaveformBatcher {
    pub fn new(config: BatcherConfig, bus: EventBus) -> Self {
        Self {
            config: BatcherConfig {
                max_batch: config.max_batch.max(1),
                ..config
            },
            buffer: Vec::new(),
            window_start: None,
            session_open: false,
            bus,
        }
    }

    pub fn shared(config: BatcherConfig, bus: EventBus) -> SharedBatcher {
        Arc::new(Mutex::new(Self::new(config, bus)))
    }

    pub fn window(&self) -> Duration {
        self.config.window
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Opens a session with an empty buffer.
    pub fn begin_session(&mut self) {
        self.clear();
        self.session_open = true;
    }

    /// Flushes what is pending and closes the session.
    pub fn end_session(&mut self) {
        self.flush();
        self.clear();
        self.session_open = false;
    }

    /// Drops pending samples without publishing them.
    pub fn discard_session(&mut self) {
        self.clear();
        self.session_open = false;
    }

    pub fn push(&mut self, samples: &[i16]) {
        if !self.session_open {
            trace!("Dropping {} ECG samples outside a session", samples.len());
            return;
        }
        if samples.is_empty() {
            return;
        }
        if self.buffer.is_empty() {
            self.window_start = Some(Instant::now());
        }
        self.buffer.extend_from_slice(samples);

        while self.buffer.len() >= self.config.max_batch {
            let batch: Vec<i16> = self.buffer.drain(..self.config.max_batch).collect();
            self.publish(batch);
            self.window_start = if self.buffer.is_empty() {
                None
            } else {
                Some(Instant::now())
            };
        }
    }

    /// Flushes if the oldest pending sample has waited a full window.
    pub fn flush_if_due(&mut self, now: Instant) {
        if let Some(start) = self.window_start {
            if now.duration_since(start) >= self.config.window {
                self.flush();
            }
        }
    }

    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        self.window_start = None;
        self.publish(batch);
    }

    fn publish(&self, samples: Vec<i16>) {
        self.bus.emit_ecg(EcgEvent::Data {
            samples,
            sample_rate: self.config.sample_rate,
            scale_factor: self.config.scale_factor,
        });
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.window_start = None;
    }
}

/// Periodically flushes a shared batcher until the task is aborted.
pub async fn run_flush_ticker(batcher: SharedBatcher, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let now = interval.tick().await;
        lock(&batcher).flush_if_due(now);
    }
}
