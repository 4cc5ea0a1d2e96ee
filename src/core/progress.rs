//! Transfer progress: a bounded, lossy event channel plus an in-memory latest-status store.
//!
//! The engine never waits on a consumer. Events that do not fit in the channel are
//! dropped; terminal events are still attempted so a live display sees the end state.
//! Nothing here is persisted; only set/member state transitions reach the index.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::logging::LogThrottle;

/// Smoothing factor for the exponentially weighted throughput.
const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressPhase {
    Hashing,
    Transferring,
    Verifying,
    Succeeded,
    Failed,
    Paused,
}

impl ProgressPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Paused)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub task_id: Uuid,
    pub file_name: String,
    pub phase: ProgressPhase,
    pub bytes_confirmed: u64,
    pub total_bytes: u64,
    /// Bytes per second since the previous emitted event.
    pub instant_bps: f64,
    pub smoothed_bps: f64,
    pub eta_secs: Option<u64>,
}

impl ProgressEvent {
    pub fn percentage(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        ((self.bytes_confirmed as f64 / self.total_bytes as f64) * 100.0).min(100.0) as u8
    }
}

/// Instantaneous and smoothed throughput from successive byte counts.
#[derive(Debug)]
pub struct ThroughputMeter {
    last_at: Instant,
    last_bytes: u64,
    smoothed: Option<f64>,
}

impl ThroughputMeter {
    pub fn new(start_bytes: u64) -> Self {
        Self {
            last_at: Instant::now(),
            last_bytes: start_bytes,
            smoothed: None,
        }
    }

    /// Returns `(instant, smoothed)` bytes per second.
    pub fn sample(&mut self, bytes: u64) -> (f64, f64) {
        self.sample_at(bytes, Instant::now())
    }

    fn sample_at(&mut self, bytes: u64, now: Instant) -> (f64, f64) {
        let elapsed = now.duration_since(self.last_at).as_secs_f64();
        let delta = bytes.saturating_sub(self.last_bytes) as f64;
        let instant = if elapsed > 0.0 { delta / elapsed } else { 0.0 };

        let smoothed = match self.smoothed {
            Some(prev) if elapsed > 0.0 => EWMA_ALPHA * instant + (1.0 - EWMA_ALPHA) * prev,
            Some(prev) => prev,
            None => instant,
        };
        if elapsed > 0.0 {
            self.smoothed = Some(smoothed);
            self.last_at = now;
            self.last_bytes = bytes;
        }
        (instant, smoothed)
    }
}

fn eta(remaining: u64, bps: f64) -> Option<u64> {
    if remaining == 0 {
        return Some(0);
    }
    (bps > 0.0).then(|| (remaining as f64 / bps).ceil() as u64)
}

pub type ProgressReceiver = mpsc::Receiver<ProgressEvent>;

/// Create a lossy progress channel holding at most `capacity` undelivered events,
/// emitting intermediate events no more often than `interval`.
pub fn channel(capacity: usize, interval: Duration) -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ProgressSender::new(tx, interval), rx)
}

/// Sending half shared by every task of one operation.
#[derive(Clone)]
pub struct ProgressSender {
    tx: Option<mpsc::Sender<ProgressEvent>>,
    interval: Duration,
}

impl ProgressSender {
    fn new(tx: mpsc::Sender<ProgressEvent>, interval: Duration) -> Self {
        Self { tx: Some(tx), interval }
    }

    /// A sender with no consumer; every event is discarded.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            interval: Duration::from_secs(3600),
        }
    }

    /// Per-task emitter with its own rate limit and throughput meter.
    pub fn task(&self, task_id: Uuid, file_name: impl Into<String>, total_bytes: u64, start_bytes: u64) -> TaskProgress {
        TaskProgress {
            sender: self.clone(),
            throttle: LogThrottle::new(self.interval),
            meter: ThroughputMeter::new(start_bytes),
            task_id,
            file_name: file_name.into(),
            total_bytes,
            dropped: 0,
        }
    }

    fn try_send(&self, event: ProgressEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }
}

pub struct TaskProgress {
    sender: ProgressSender,
    throttle: LogThrottle,
    meter: ThroughputMeter,
    task_id: Uuid,
    file_name: String,
    total_bytes: u64,
    dropped: u64,
}

impl TaskProgress {
    /// Emit if the rate limit allows. Never blocks.
    pub fn update(&mut self, phase: ProgressPhase, bytes_confirmed: u64) {
        if self.throttle.should_log() {
            self.emit(phase, bytes_confirmed);
        }
    }

    /// Emit regardless of the rate limit. Still dropped when the channel is full.
    pub fn force(&mut self, phase: ProgressPhase, bytes_confirmed: u64) {
        self.throttle.reset();
        self.update(phase, bytes_confirmed);
    }

    /// Events lost to a full or closed channel.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn emit(&mut self, phase: ProgressPhase, bytes_confirmed: u64) {
        let (instant_bps, smoothed_bps) = self.meter.sample(bytes_confirmed);
        let event = ProgressEvent {
            task_id: self.task_id,
            file_name: self.file_name.clone(),
            phase,
            bytes_confirmed,
            total_bytes: self.total_bytes,
            instant_bps,
            smoothed_bps,
            eta_secs: eta(self.total_bytes.saturating_sub(bytes_confirmed), smoothed_bps),
        };
        if !self.sender.try_send(event) {
            self.dropped += 1;
        }
    }
}

/// Thread-safe in-memory store of the latest event per task.
///
/// Shared via `AppContext`; fed by [`ProgressTracker::consume`].
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<Uuid, ProgressEvent>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, event: ProgressEvent) {
        let mut map = self.inner.write().await;
        map.insert(event.task_id, event);
    }

    pub async fn get(&self, task_id: &Uuid) -> Option<ProgressEvent> {
        let map = self.inner.read().await;
        map.get(task_id).cloned()
    }

    pub async fn remove(&self, task_id: &Uuid) {
        let mut map = self.inner.write().await;
        map.remove(task_id);
    }

    pub async fn get_all(&self) -> HashMap<Uuid, ProgressEvent> {
        let map = self.inner.read().await;
        map.clone()
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.values().filter(|e| !e.phase.is_terminal()).count()
    }

    /// Drain `rx` until every sender is gone, calling `on_event` for each event.
    pub async fn consume(&self, mut rx: ProgressReceiver, mut on_event: impl FnMut(&ProgressEvent)) {
        while let Some(event) = rx.recv().await {
            on_event(&event);
            self.update(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(task_id: Uuid, phase: ProgressPhase, bytes: u64) -> ProgressEvent {
        ProgressEvent {
            task_id,
            file_name: "db.sql.gz".to_string(),
            phase,
            bytes_confirmed: bytes,
            total_bytes: 1000,
            instant_bps: 0.0,
            smoothed_bps: 0.0,
            eta_secs: None,
        }
    }

    #[tokio::test]
    async fn test_progress_tracker_basic_operations() {
        let tracker = ProgressTracker::new();
        let id = Uuid::now_v7();

        assert_eq!(tracker.active_count().await, 0);
        assert!(tracker.get(&id).await.is_none());

        tracker.update(event(id, ProgressPhase::Transferring, 500)).await;
        assert_eq!(tracker.active_count().await, 1);
        assert_eq!(tracker.get(&id).await.unwrap().percentage(), 50);

        tracker.update(event(id, ProgressPhase::Transferring, 750)).await;
        assert_eq!(tracker.get(&id).await.unwrap().percentage(), 75);

        tracker.update(event(id, ProgressPhase::Succeeded, 1000)).await;
        assert_eq!(tracker.active_count().await, 0);

        tracker.remove(&id).await;
        assert!(tracker.get(&id).await.is_none());
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (sender, _rx) = channel(2, Duration::ZERO);
        let mut progress = sender.task(Uuid::now_v7(), "big.tar", 100, 0);
        for i in 0..10 {
            progress.force(ProgressPhase::Transferring, i * 10);
        }
        assert_eq!(progress.dropped(), 8);
    }

    #[test]
    fn closed_channel_is_harmless() {
        let (sender, rx) = channel(4, Duration::ZERO);
        drop(rx);
        let mut progress = sender.task(Uuid::now_v7(), "big.tar", 100, 0);
        progress.force(ProgressPhase::Succeeded, 100);
        assert_eq!(progress.dropped(), 1);
    }

    #[test]
    fn rate_limit_suppresses_bursts() {
        let (sender, mut rx) = channel(64, Duration::from_secs(60));
        let mut progress = sender.task(Uuid::now_v7(), "big.tar", 100, 0);
        for i in 0..20 {
            progress.update(ProgressPhase::Transferring, i);
        }
        progress.force(ProgressPhase::Succeeded, 100);

        let mut received = Vec::new();
        while let Ok(e) = rx.try_recv() {
            received.push(e);
        }
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].phase, ProgressPhase::Succeeded);
    }

    #[test]
    fn meter_smooths_towards_new_rate() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::new(0);
        meter.last_at = start;

        let (instant, smoothed) = meter.sample_at(1000, start + Duration::from_secs(1));
        assert_eq!(instant, 1000.0);
        assert_eq!(smoothed, 1000.0);

        let (instant, smoothed) = meter.sample_at(4000, start + Duration::from_secs(2));
        assert_eq!(instant, 3000.0);
        assert!(smoothed > 1000.0 && smoothed < 3000.0);
    }

    #[test]
    fn eta_uses_smoothed_rate() {
        assert_eq!(eta(1000, 100.0), Some(10));
        assert_eq!(eta(0, 0.0), Some(0));
        assert_eq!(eta(10, 0.0), None);
    }
}
