//! The queue monitor: live counters and event fan-out.
//!
//! Polls the per-state counts on an interval, derives completion
//! throughput over a rolling window, pushes everything to Prometheus and
//! republishes snapshots on a `watch` channel. Optionally it also drains
//! the queue's pub/sub event stream into event counters. Pure observer:
//! nothing here influences scheduling.

use crate::config::MonitorOptions;
use crate::error::QueueError;
use crate::events::EventSubscriber;
use crate::metrics;
use crate::queue::Queue;
use futures::StreamExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Aggregate snapshot published on every poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub active: u64,
    pub waiting: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    /// Completions per second over the rolling window.
    pub throughput_per_sec: f64,
}

/// Rolling window of `(instant, completed_total)` samples.
pub(crate) struct ThroughputWindow {
    samples: VecDeque<(Instant, u64)>,
    capacity: usize,
}

impl ThroughputWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    /// Record a sample and return the completion rate across the window.
    pub fn push(&mut self, at: Instant, completed_total: u64) -> f64 {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, completed_total));
        self.rate()
    }

    fn rate(&self) -> f64 {
        let (Some(&(first_at, first_count)), Some(&(last_at, last_count))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };

        let elapsed = last_at.duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 || last_count <= first_count {
            return 0.0;
        }
        (last_count - first_count) as f64 / elapsed
    }
}

/// Observes one queue.
pub struct QueueMonitor {
    queue: Queue,
    opts: MonitorOptions,
    metrics_tx: watch::Sender<QueueMetrics>,
}

impl QueueMonitor {
    pub fn new(queue: Queue, opts: MonitorOptions) -> Self {
        let (metrics_tx, _) = watch::channel(QueueMetrics::default());
        Self {
            queue,
            opts,
            metrics_tx,
        }
    }

    /// Latest snapshot, updated on every poll.
    pub fn subscribe(&self) -> watch::Receiver<QueueMetrics> {
        self.metrics_tx.subscribe()
    }

    /// Run until shutdown. When an `EventSubscriber` is supplied its
    /// events are counted per kind alongside the polling loop.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        events: Option<EventSubscriber>,
    ) -> Result<(), QueueError> {
        info!(
            queue = %self.queue.name(),
            interval_ms = %self.opts.metrics_interval_ms,
            history = %self.opts.history_size,
            events = events.is_some(),
            "Starting queue monitor"
        );

        let interval = Duration::from_millis(self.opts.metrics_interval_ms);
        let mut window = ThroughputWindow::new(self.opts.history_size);
        let mut event_stream = events.map(|subscriber| Box::pin(subscriber.into_stream()));

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.poll(&mut window).await {
                        warn!(queue = %self.queue.name(), error = %e, "Metrics poll failed");
                    }
                }
                event = next_event(&mut event_stream), if event_stream.is_some() => {
                    match event {
                        Some(event) => {
                            metrics::observe_event(self.queue.name(), event.event);
                            debug!(
                                queue = %self.queue.name(),
                                event = event.event.as_str(),
                                job_id = %event.job_id,
                                "Observed lifecycle event"
                            );
                        }
                        None => {
                            warn!(queue = %self.queue.name(), "Event stream ended");
                            event_stream = None;
                        }
                    }
                }
            }
        }

        info!(queue = %self.queue.name(), "Queue monitor stopped");
        Ok(())
    }

    async fn poll(&self, window: &mut ThroughputWindow) -> Result<(), QueueError> {
        let counts = self.queue.job_counts().await?;
        let throughput = window.push(Instant::now(), counts.completed);

        let snapshot = QueueMetrics {
            active: counts.active,
            waiting: counts.waiting,
            completed: counts.completed,
            failed: counts.failed,
            delayed: counts.delayed,
            throughput_per_sec: throughput,
        };

        let name = self.queue.name();
        metrics::gauge_depths(name, &counts);
        metrics::gauge_throughput(name, throughput);

        self.metrics_tx.send_replace(snapshot);
        Ok(())
    }
}

/// Await the next event, or pend forever when no subscriber was supplied
/// (keeps the `select!` arms uniform).
async fn next_event<S>(stream: &mut Option<S>) -> Option<crate::events::QueueEvent>
where
    S: futures::Stream<Item = crate::events::QueueEvent> + Unpin,
{
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_window_needs_two_samples() {
        let mut window = ThroughputWindow::new(10);
        let now = Instant::now();
        assert_eq!(window.push(now, 5), 0.0);
    }

    #[test]
    fn test_throughput_window_rate() {
        let mut window = ThroughputWindow::new(10);
        let start = Instant::now();
        window.push(start, 100);
        let rate = window.push(start + Duration::from_secs(10), 150);
        assert!((rate - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_throughput_window_evicts_oldest() {
        let mut window = ThroughputWindow::new(2);
        let start = Instant::now();
        window.push(start, 0);
        window.push(start + Duration::from_secs(1), 10);
        // Third sample evicts the first; rate spans samples 2→3 only.
        let rate = window.push(start + Duration::from_secs(2), 30);
        assert!((rate - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_throughput_zero_when_counter_resets() {
        // An obliterated queue resets the completed counter; the window
        // must not report a negative rate.
        let mut window = ThroughputWindow::new(4);
        let start = Instant::now();
        window.push(start, 500);
        let rate = window.push(start + Duration::from_secs(5), 3);
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn test_queue_metrics_serialize() {
        let metrics = QueueMetrics {
            active: 1,
            waiting: 2,
            completed: 3,
            failed: 0,
            delayed: 4,
            throughput_per_sec: 1.5,
        };
        let value = serde_json::to_value(metrics).unwrap();
        assert_eq!(value["active"], 1);
        assert_eq!(value["throughput_per_sec"], 1.5);
    }
}
