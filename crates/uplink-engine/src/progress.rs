//! Per-job progress reporting
//!
//! Protocol clients call [`ProgressReporter::advance`] after every chunk.
//! The reporter turns that into [`ProgressEvent`]s at bounded intervals:
//! one event per `interval_bytes` or per `interval`, whichever comes first.
//!
//! Reported values are a high-water mark clamped to the total, so a
//! protocol that restarts from zero after a failure never makes the shell's
//! progress bar go backwards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use uplink_core::{now_millis, JobId, ProgressEvent, TransferConfig, TransferEvent};

use crate::event_bus::EventBus;

#[derive(Debug)]
struct ProgressState {
    /// Position within the current attempt
    current: u64,
    /// Highest position ever reached, clamped to `total`
    reported: u64,
    total: u64,
    last_emitted: Option<u64>,
    last_emit_at: Instant,
}

/// Progress sink for one job; clones share state
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    state: Arc<Mutex<ProgressState>>,
    bus: EventBus,
    interval_bytes: u64,
    interval: Duration,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, total: u64, bus: EventBus, config: &TransferConfig) -> Self {
        Self::with_intervals(
            job_id,
            total,
            bus,
            config.progress_interval_bytes,
            config.progress_interval(),
        )
    }

    pub fn with_intervals(
        job_id: JobId,
        total: u64,
        bus: EventBus,
        interval_bytes: u64,
        interval: Duration,
    ) -> Self {
        Self {
            job_id,
            state: Arc::new(Mutex::new(ProgressState {
                current: 0,
                reported: 0,
                total,
                last_emitted: None,
                last_emit_at: Instant::now(),
            })),
            bus,
            interval_bytes: interval_bytes.max(1),
            interval,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Update the total after re-reading the source file
    pub fn set_total(&self, total: u64) {
        let mut state = self.state.lock();
        state.total = total;
        state.reported = state.reported.min(total);
    }

    /// Start a new attempt at `offset` (0 for a full restart)
    pub fn begin_attempt(&self, offset: u64) {
        let mut state = self.state.lock();
        state.current = offset;
        if offset > state.reported {
            state.reported = offset.min(state.total);
            self.emit(&mut state);
        }
    }

    /// Record `bytes` more bytes written to the remote side
    pub fn advance(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.current = state.current.saturating_add(bytes);
        let reported = state.current.min(state.total);
        if reported <= state.reported {
            return;
        }
        state.reported = reported;

        let since_bytes = reported - state.last_emitted.unwrap_or(0);
        if since_bytes >= self.interval_bytes
            || state.last_emit_at.elapsed() >= self.interval
            || reported == state.total
        {
            self.emit(&mut state);
        }
    }

    /// Emit the latest value if it was not reported yet
    pub fn flush(&self) {
        let mut state = self.state.lock();
        if state.last_emitted != Some(state.reported) {
            self.emit(&mut state);
        }
    }

    /// Bytes reported so far (high-water mark)
    pub fn bytes_sent(&self) -> u64 {
        self.state.lock().reported
    }

    /// Position within the current attempt
    pub fn position(&self) -> u64 {
        self.state.lock().current
    }

    pub fn total(&self) -> u64 {
        self.state.lock().total
    }

    fn emit(&self, state: &mut ProgressState) {
        state.last_emitted = Some(state.reported);
        state.last_emit_at = Instant::now();
        self.bus.publish(TransferEvent::Progress(ProgressEvent {
            job_id: self.job_id,
            bytes_sent: state.reported,
            bytes_total: state.total,
            timestamp_ms: now_millis(),
        }));
    }
}
