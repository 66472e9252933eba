//! Buffered, retrying delivery of line protocol batches to a time-series sink
//!
//! Producers hand batches to [`UploadAdapter::submit`], which never blocks on
//! I/O. A single flush task started with [`UploadAdapter::run`] delivers the
//! oldest batch first, gated on sink reachability, and retries with bounded
//! exponential backoff. Outcomes are published as [`UploadStatus`] events and
//! never flow back into the runs that produced the data.

mod influx;

pub use influx::InfluxSink;

use crate::config::UploadConfig;
use crate::pipeline::{EventBus, PipelineEvent};
use async_trait::async_trait;
use protocol::LineProtocolPoint;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Sink rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Batch cannot be serialized: {0}")]
    Invalid(String),
}

impl SinkError {
    /// Client errors other than throttling will fail the same way again
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Unavailable(_) | SinkError::Transport(_) => true,
            SinkError::Rejected { status, .. } => *status == 429 || *status >= 500,
            SinkError::Invalid(_) => false,
        }
    }
}

/// Destination for encoded points
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write_batch(&self, points: &[LineProtocolPoint]) -> Result<(), SinkError>;

    /// Cheap reachability probe
    async fn ping(&self) -> bool;
}

/// One-way delivery notifications
#[derive(Debug, Clone, PartialEq)]
pub enum UploadStatus {
    Delivered { points: usize },
    SinkUnavailable,
    Retrying { attempt: u32, delay_ms: u64, error: String },
    Failed { points: usize, error: String },
    Backpressure { dropped_points: usize },
}

/// `min(base * factor^attempt, max) + jitter`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub factor: u32,
    pub max: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base: Duration::from_millis(config.backoff_ms),
            factor: config.backoff_factor.max(1),
            max: Duration::from_millis(config.max_backoff_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let scale = self.factor.checked_pow(attempt).unwrap_or(u32::MAX);
        let backoff = self.base.saturating_mul(scale).min(self.max);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

struct Buffered {
    id: u64,
    points: Vec<LineProtocolPoint>,
}

#[derive(Default)]
struct Buffer {
    next_id: u64,
    batches: VecDeque<Buffered>,
}

pub struct UploadAdapter {
    sink: Arc<dyn Sink>,
    policy: RetryPolicy,
    max_buffered: usize,
    ping_timeout: Duration,
    buffer: Mutex<Buffer>,
    work: Notify,
    buffered: watch::Sender<usize>,
    bus: EventBus,
}

enum Delivery {
    Done,
    Cancelled,
}

impl UploadAdapter {
    pub fn new(sink: Arc<dyn Sink>, config: &UploadConfig, bus: EventBus) -> Self {
        let (buffered, _) = watch::channel(0);
        Self {
            sink,
            policy: RetryPolicy::from_config(config),
            max_buffered: config.max_buffered_batches.max(1),
            ping_timeout: Duration::from_millis(config.ping_timeout_ms),
            buffer: Mutex::new(Buffer::default()),
            work: Notify::new(),
            buffered,
            bus,
        }
    }

    /// Queue a batch for delivery, evicting the oldest batch when full
    pub fn submit(&self, points: Vec<LineProtocolPoint>) {
        if points.is_empty() {
            return;
        }

        let mut dropped = Vec::new();
        let len = {
            let mut buffer = self.lock();
            let id = buffer.next_id;
            buffer.next_id += 1;
            buffer.batches.push_back(Buffered { id, points });
            while buffer.batches.len() > self.max_buffered {
                if let Some(oldest) = buffer.batches.pop_front() {
                    dropped.push(oldest.points.len());
                }
            }
            buffer.batches.len()
        };
        self.buffered.send_replace(len);

        for dropped_points in dropped {
            warn!("Upload buffer full, dropped oldest batch of {} points", dropped_points);
            self.emit(UploadStatus::Backpressure { dropped_points });
        }
        self.work.notify_one();
    }

    pub fn buffered(&self) -> usize {
        *self.buffered.borrow()
    }

    /// Wait until every buffered batch is delivered or given up on
    ///
    /// Returns false if the timeout elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut rx = self.buffered.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok()
    }

    /// Flush loop; returns when cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Upload adapter started");
        loop {
            let front = self
                .lock()
                .batches
                .front()
                .map(|b| (b.id, b.points.clone()));

            let Some((id, points)) = front else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.work.notified() => {}
                }
                continue;
            };

            if let Delivery::Cancelled = self.deliver(id, &points, &cancel).await {
                break;
            }
        }
        info!("Upload adapter stopped with {} batches buffered", self.buffered());
    }

    async fn deliver(
        &self,
        id: u64,
        points: &[LineProtocolPoint],
        cancel: &CancellationToken,
    ) -> Delivery {
        let mut attempts = 0u32;
        let mut unavailable = 0u32;

        loop {
            if !self.reachable().await {
                if unavailable == 0 {
                    info!("Sink unreachable, holding {} buffered batches", self.buffered());
                }
                self.emit(UploadStatus::SinkUnavailable);
                let delay = self.policy.delay(unavailable);
                unavailable = unavailable.saturating_add(1);
                if !sleep_or_cancel(delay, cancel).await {
                    return Delivery::Cancelled;
                }
                // the batch may have been evicted meanwhile
                if !self.contains(id) {
                    return Delivery::Done;
                }
                continue;
            }
            unavailable = 0;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Delivery::Cancelled,
                r = self.sink.write_batch(points) => r,
            };

            match result {
                Ok(()) => {
                    debug!("Delivered batch of {} points", points.len());
                    self.remove(id);
                    self.emit(UploadStatus::Delivered {
                        points: points.len(),
                    });
                    return Delivery::Done;
                }
                Err(e) => {
                    // a write that times out after a good ping still costs an attempt
                    if let SinkError::Unavailable(reason) = &e {
                        debug!("Sink went away during write: {}", reason);
                    }
                    attempts += 1;
                    if !e.is_retryable() || attempts >= self.policy.max_retries {
                        warn!(
                            "Giving up on batch of {} points after {} attempts: {}",
                            points.len(),
                            attempts,
                            e
                        );
                        self.remove(id);
                        self.emit(UploadStatus::Failed {
                            points: points.len(),
                            error: e.to_string(),
                        });
                        return Delivery::Done;
                    }

                    let delay = self.policy.delay(attempts - 1);
                    warn!("Write attempt {} failed: {}, retrying in {:?}", attempts, e, delay);
                    self.emit(UploadStatus::Retrying {
                        attempt: attempts,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    if !sleep_or_cancel(delay, cancel).await {
                        return Delivery::Cancelled;
                    }
                    if !self.contains(id) {
                        return Delivery::Done;
                    }
                }
            }
        }
    }

    async fn reachable(&self) -> bool {
        tokio::time::timeout(self.ping_timeout, self.sink.ping())
            .await
            .unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Buffer> {
        // a panic while holding this lock leaves the queue itself consistent
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn contains(&self, id: u64) -> bool {
        self.lock().batches.iter().any(|b| b.id == id)
    }

    fn remove(&self, id: u64) {
        let len = {
            let mut buffer = self.lock();
            buffer.batches.retain(|b| b.id != id);
            buffer.batches.len()
        };
        self.buffered.send_replace(len);
    }

    fn emit(&self, status: UploadStatus) {
        self.bus.publish(PipelineEvent::Upload(status));
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
