//! Coalesced progress reporting.
//!
//! Downloaders feed every written chunk into a [`ProgressTracker`]; listeners
//! only see an event when the configured interval has passed (plus a final
//! event on completion), never one per chunk.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::ProgressConfig;

/// Snapshot of one job's transfer state.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub job_id: String,
    /// Monotonically non-decreasing for a given job.
    pub bytes_written: u64,
    pub total_bytes: Option<u64>,
    /// Smoothed rate in bytes per second.
    pub rate: f64,
    pub eta: Option<Duration>,
    /// Set on the last event of a job run.
    pub finished: bool,
}

impl ProgressEvent {
    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes
            .filter(|t| *t > 0)
            .map(|t| (self.bytes_written as f64 / t as f64).min(1.0))
    }
}

/// Receiver of progress events (presentation layer, logging, channels).
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}

pub type SharedProgressListener = Arc<dyn ProgressListener>;

/// Forward events into an unbounded channel.
pub fn channel_listener(tx: mpsc::UnboundedSender<ProgressEvent>) -> SharedProgressListener {
    Arc::new(move |event: &ProgressEvent| {
        // A dropped receiver only means nobody is watching.
        let _ = tx.send(event.clone());
    })
}

/// Per-job coalescing tracker.
pub struct ProgressTracker {
    job_id: String,
    listener: Option<SharedProgressListener>,
    min_interval: Duration,
    smoothing: f64,
    bytes_written: u64,
    total_bytes: Option<u64>,
    rate: f64,
    last_sample: Option<(Instant, u64)>,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(
        job_id: impl Into<String>,
        config: &ProgressConfig,
        listener: Option<SharedProgressListener>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            listener,
            min_interval: Duration::from_millis(config.min_interval_ms),
            smoothing: config.rate_smoothing,
            bytes_written: 0,
            total_bytes: None,
            rate: 0.0,
            last_sample: None,
            last_emit: None,
        }
    }

    /// Set the starting point (resumed bytes) without counting them towards the rate.
    pub fn start_at(&mut self, bytes_written: u64) {
        self.bytes_written = self.bytes_written.max(bytes_written);
        self.last_sample = Some((Instant::now(), self.bytes_written));
    }

    pub fn set_total(&mut self, total: Option<u64>) {
        if total.is_some() {
            self.total_bytes = total;
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Record the new absolute byte count; emits when the interval has elapsed.
    pub fn update(&mut self, bytes_written: u64) {
        let now = Instant::now();
        self.bytes_written = self.bytes_written.max(bytes_written);
        self.sample(now);

        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.min_interval);
        if due {
            self.emit(now, false);
        }
    }

    pub fn add(&mut self, delta: u64) {
        self.update(self.bytes_written + delta);
    }

    /// Emit a final event regardless of the interval.
    pub fn finish(&mut self) {
        let now = Instant::now();
        self.sample(now);
        self.emit(now, true);
    }

    fn sample(&mut self, now: Instant) {
        match self.last_sample {
            Some((at, bytes)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                // Sub-10ms samples are too noisy to feed the average.
                if elapsed >= 0.01 {
                    let instantaneous = (self.bytes_written - bytes) as f64 / elapsed;
                    self.rate = if self.rate == 0.0 {
                        instantaneous
                    } else {
                        self.smoothing * instantaneous + (1.0 - self.smoothing) * self.rate
                    };
                    self.last_sample = Some((now, self.bytes_written));
                }
            }
            None => self.last_sample = Some((now, self.bytes_written)),
        }
    }

    fn emit(&mut self, now: Instant, finished: bool) {
        self.last_emit = Some(now);
        let Some(listener) = &self.listener else {
            return;
        };
        let eta = match self.total_bytes {
            Some(total) if self.rate > 0.0 && total >= self.bytes_written => Some(
                Duration::from_secs_f64((total - self.bytes_written) as f64 / self.rate),
            ),
            _ => None,
        };
        listener.on_progress(&ProgressEvent {
            job_id: self.job_id.clone(),
            bytes_written: self.bytes_written,
            total_bytes: self.total_bytes,
            rate: self.rate,
            eta,
            finished,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn collecting() -> (SharedProgressListener, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let listener: SharedProgressListener =
            Arc::new(move |e: &ProgressEvent| sink.lock().push(e.clone()));
        (listener, events)
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_coalesced() {
        let (listener, events) = collecting();
        let config = ProgressConfig {
            min_interval_ms: 100,
            rate_smoothing: 0.5,
        };
        let mut tracker = ProgressTracker::new("job", &config, Some(listener));
        tracker.set_total(Some(10_000));

        for _ in 0..50 {
            tracker.add(10);
        }
        assert_eq!(events.lock().len(), 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        tracker.add(10);
        assert_eq!(events.lock().len(), 2);

        tracker.finish();
        let events = events.lock();
        assert_eq!(events.len(), 3);
        assert!(events.last().unwrap().finished);
        assert_eq!(events.last().unwrap().bytes_written, 510);
    }

    #[tokio::test(start_paused = true)]
    async fn bytes_never_decrease() {
        let (listener, events) = collecting();
        let config = ProgressConfig {
            min_interval_ms: 0,
            rate_smoothing: 0.5,
        };
        let mut tracker = ProgressTracker::new("job", &config, Some(listener));
        tracker.update(100);
        tracker.update(50);
        tracker.update(200);
        let seen: Vec<u64> = events.lock().iter().map(|e| e.bytes_written).collect();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(tracker.bytes_written(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_and_eta_are_reported() {
        let (listener, events) = collecting();
        let config = ProgressConfig {
            min_interval_ms: 0,
            rate_smoothing: 1.0,
        };
        let mut tracker = ProgressTracker::new("job", &config, Some(listener));
        tracker.set_total(Some(2_000));
        tracker.start_at(0);
        tokio::time::advance(Duration::from_secs(1)).await;
        tracker.update(1_000);

        let last = events.lock().last().cloned().unwrap();
        assert!((last.rate - 1_000.0).abs() < 1.0);
        let eta = last.eta.unwrap();
        assert!(eta >= Duration::from_millis(990) && eta <= Duration::from_millis(1010));
        assert_eq!(last.fraction(), Some(0.5));
    }
}
