//! The Streaming Channel: a bounded, single-producer, multi-consumer
//! sequence of `StreamEvent`s from one plugin's process to every sink (UI,
//! Metrics Collector, History Store).
//!
//! One tagged enum of progress events fanned out to per-consumer buffers
//! with a priority drop policy, which plain `tokio::sync::mpsc`
//! backpressure cannot express since it blocks the producer rather than
//! discarding.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::domain::Phase;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Output channel tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Out,
    Err,
}

/// Tagged-variant event sequence for a single plugin.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Output {
        line: String,
        channel: Channel,
    },
    Progress {
        phase: Phase,
        percent: Option<f32>,
        message: Option<String>,
        bytes_done: Option<u64>,
        bytes_total: Option<u64>,
        items_done: Option<u64>,
        items_total: Option<u64>,
    },
    PhaseStart {
        phase: Phase,
    },
    PhaseEnd {
        phase: Phase,
        success: bool,
        error: Option<String>,
    },
    Error {
        message: String,
    },
    Completion {
        success: bool,
        exit_code: Option<i32>,
        packages_updated: u32,
        error: Option<String>,
    },
}

impl StreamEvent {
    /// Events that must never be dropped under backpressure.
    fn is_high_priority(&self) -> bool {
        !matches!(self, StreamEvent::Output { .. })
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, StreamEvent::Completion { .. })
    }
}

/// A single consumer's bounded queue with the priority drop policy applied
/// on the producer side.
struct DropBuffer {
    events: VecDeque<StreamEvent>,
    capacity: usize,
    dropped_count: u64,
}

impl DropBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(256)),
            capacity,
            dropped_count: 0,
        }
    }

    fn push(&mut self, event: StreamEvent) {
        if self.events.len() >= self.capacity {
            if let Some(idx) = self.events.iter().position(|e| !e.is_high_priority()) {
                self.events.remove(idx);
                self.dropped_count += 1;
            } else if !event.is_high_priority() {
                // No Output to evict and the incoming event is itself
                // droppable output: drop it rather than growing unbounded.
                self.dropped_count += 1;
                return;
            }
            // Otherwise the incoming event is high priority and the buffer
            // holds only high-priority events: grow past capacity rather
            // than drop a Progress/Phase/Error/Completion event.
        }
        self.events.push_back(event);
    }
}

/// One consumer's handle on the bus.
pub struct EventReceiver {
    buffer: Arc<Mutex<DropBuffer>>,
    notify: Arc<Notify>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl EventReceiver {
    /// Awaits the next event, or `None` once the stream has closed (the
    /// `Completion` event has been delivered and drained).
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        loop {
            {
                let mut buf = self.buffer.lock().await;
                if let Some(event) = buf.events.pop_front() {
                    return Some(event);
                }
            }
            if self.closed.load(std::sync::atomic::Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Number of `Output` events dropped for this consumer so far.
    pub async fn dropped_count(&self) -> u64 {
        self.buffer.lock().await.dropped_count
    }
}

struct Subscriber {
    buffer: Arc<Mutex<DropBuffer>>,
    notify: Arc<Notify>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

/// The single-producer side: a plugin's execution publishes events here,
/// fanned out to every subscribed sink.
#[derive(Clone)]
pub struct EventSink {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    capacity: usize,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity,
        }
    }

    /// Registers a new sink and returns its receiver. Must be called before
    /// the stream is published to guarantee it observes the full sequence.
    pub async fn subscribe(&self) -> EventReceiver {
        let buffer = Arc::new(Mutex::new(DropBuffer::new(self.capacity)));
        let notify = Arc::new(Notify::new());
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        self.subscribers.lock().await.push(Subscriber {
            buffer: buffer.clone(),
            notify: notify.clone(),
            closed: closed.clone(),
        });
        EventReceiver {
            buffer,
            notify,
            closed,
        }
    }

    /// Publishes one event to every current subscriber. Never blocks the
    /// caller beyond acquiring the (uncontended, short-held) subscriber
    /// lock: the drop policy guarantees O(1) amortized work per publish.
    pub async fn publish(&self, event: StreamEvent) {
        let is_completion = event.is_completion();
        let subs = self.subscribers.lock().await;
        for sub in subs.iter() {
            {
                let mut buf = sub.buffer.lock().await;
                buf.push(event.clone());
            }
            sub.notify.notify_waiters();
            if is_completion {
                sub.closed.store(true, std::sync::atomic::Ordering::Release);
                sub.notify.notify_waiters();
            }
        }
    }

    /// Emits a diagnostic `Error` event with reason "slow-consumer" without
    /// applying the drop policy to the diagnostic itself.
    pub async fn publish_slow_consumer_warning(&self) {
        self.publish(StreamEvent::Error {
            message: "slow-consumer".to_string(),
        })
        .await;
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completion_is_always_delivered_last_and_stream_closes() {
        let sink = EventSink::new(4);
        let mut rx = sink.subscribe().await;
        sink.publish(StreamEvent::Output {
            line: "hi".into(),
            channel: Channel::Out,
        })
        .await;
        sink.publish(StreamEvent::Completion {
            success: true,
            exit_code: Some(0),
            packages_updated: 0,
            error: None,
        })
        .await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, StreamEvent::Output { .. }));
        let second = rx.recv().await.unwrap();
        assert!(second.is_completion());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_output_not_progress() {
        let sink = EventSink::new(2);
        let mut rx = sink.subscribe().await;

        sink.publish(StreamEvent::Output {
            line: "one".into(),
            channel: Channel::Out,
        })
        .await;
        sink.publish(StreamEvent::Output {
            line: "two".into(),
            channel: Channel::Out,
        })
        .await;
        // Buffer is full (capacity 2); this Progress must not be dropped,
        // and must evict the oldest Output instead.
        sink.publish(StreamEvent::Progress {
            phase: Phase::Check,
            percent: Some(50.0),
            message: None,
            bytes_done: None,
            bytes_total: None,
            items_done: None,
            items_total: None,
        })
        .await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, StreamEvent::Output { line, .. } if line == "two"));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, StreamEvent::Progress { .. }));
        assert_eq!(rx.dropped_count().await, 1);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_see_full_sequence() {
        let sink = EventSink::new(8);
        let mut a = sink.subscribe().await;
        let mut b = sink.subscribe().await;
        sink.publish(StreamEvent::Completion {
            success: true,
            exit_code: Some(0),
            packages_updated: 3,
            error: None,
        })
        .await;
        assert!(a.recv().await.unwrap().is_completion());
        assert!(b.recv().await.unwrap().is_completion());
    }
}
