//! Queue event stream.
//!
//! State changes are published as immutable records over a
//! `tokio::sync::broadcast` channel. Subscribers (a GUI, the CLI printer)
//! consume them asynchronously; the scheduler never calls back into
//! presentation code. Events for a single job are published in transition
//! order; no ordering is guaranteed across different jobs.

use crate::job::JobStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default broadcast capacity. Slow subscribers that fall further behind
/// than this observe a `Lagged` error and miss events.
const DEFAULT_CAPACITY: usize = 256;

/// Per-status counts over the active set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

impl QueueStats {
    /// Count one record with the given status.
    pub fn record(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Skipped => self.skipped += 1,
        }
    }

    /// Whether nothing is queued or in flight.
    pub fn is_drained(&self) -> bool {
        self.queued == 0 && self.running == 0
    }
}

/// An immutable event record describing one observable queue change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A job moved between states.
    StatusChanged {
        job_id: String,
        /// None for the initial transition into the queue.
        old_status: Option<JobStatus>,
        new_status: JobStatus,
        progress: f32,
        message: Option<String>,
        timestamp_ms: i64,
    },
    /// A running job reported progress.
    Progress {
        job_id: String,
        fraction: f32,
        timestamp_ms: i64,
    },
    /// The last queued or running job reached a terminal state.
    QueueDrained {
        stats: QueueStats,
        timestamp_ms: i64,
    },
}

/// Broadcast wrapper the scheduler publishes through.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A send with no live subscribers is not an error.
    pub fn publish(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(QueueEvent::StatusChanged {
            job_id: "a".into(),
            old_status: None,
            new_status: JobStatus::Queued,
            progress: 0.0,
            message: None,
            timestamp_ms: 1,
        });
        bus.publish(QueueEvent::Progress {
            job_id: "a".into(),
            fraction: 0.5,
            timestamp_ms: 2,
        });

        match rx.recv().await.unwrap() {
            QueueEvent::StatusChanged { new_status, .. } => {
                assert_eq!(new_status, JobStatus::Queued)
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            QueueEvent::Progress { fraction, .. } => assert!((fraction - 0.5).abs() < 1e-6),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(QueueEvent::QueueDrained {
            stats: QueueStats::default(),
            timestamp_ms: 0,
        });
    }

    #[test]
    fn test_event_serde_tagging() {
        let event = QueueEvent::Progress {
            job_id: "j1".into(),
            fraction: 0.25,
            timestamp_ms: 42,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"progress\""));

        let parsed: QueueEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_stats_counting() {
        let mut stats = QueueStats::default();
        stats.record(JobStatus::Queued);
        stats.record(JobStatus::Running);
        stats.record(JobStatus::Completed);
        stats.record(JobStatus::Completed);

        assert_eq!(stats.total, 4);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 2);
        assert!(!stats.is_drained());

        let drained = QueueStats {
            total: 3,
            completed: 2,
            failed: 1,
            ..QueueStats::default()
        };
        assert!(drained.is_drained());
    }
}
