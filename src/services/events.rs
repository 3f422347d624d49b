//! In-process event bus.
//!
//! One publisher side (queue service, worker pool, resource monitor), many
//! subscribers keyed by task id or wildcard. Each publish assigns the
//! per-task seq by writing the event to the persistent execution-history
//! log, then fans out without holding any lock across an await:
//!  - push-stream subscribers (bounded per-subscriber buffers,
//!    drop-oldest with a single gap notice on overflow),
//!  - registered taps (webhook dispatcher),
//!  - the bounded polling ring.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use sqlx::SqlitePool;
use tokio::sync::{mpsc, Notify};

use crate::db::models::{EventKind, TaskEvent};
use crate::db::repository::EventRepository;
use crate::error::AppResult;

/// Subscriber filter: a concrete task id or wildcard, optionally narrowed
/// to a set of event kinds.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub task_id: Option<String>,
    pub kinds: Option<Vec<EventKind>>,
}

impl EventFilter {
    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            kinds: None,
        }
    }

    pub fn matches(&self, event: &TaskEvent) -> bool {
        if let Some(ref task_id) = self.task_id {
            if task_id != &event.task_id {
                return false;
            }
        }
        if let Some(ref kinds) = self.kinds {
            if !kinds.is_empty() && !kinds.contains(&event.kind) {
                return false;
            }
        }
        true
    }
}

/// Items delivered on a push stream.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(Arc<TaskEvent>),
    /// The subscriber's buffer overflowed and old events were dropped.
    /// Clients should re-poll from the last seq they saw.
    Gap,
}

struct SubscriberInner {
    filter: EventFilter,
    capacity: usize,
    queue: Mutex<VecDeque<StreamItem>>,
    notify: Notify,
    closed: AtomicBool,
}

impl SubscriberInner {
    /// Push with the drop-oldest overflow policy. At most one gap notice
    /// sits at the front of the buffer at any time.
    fn push(&self, item: StreamItem) {
        let mut queue = self.queue.lock().expect("subscriber queue poisoned");
        if queue.len() >= self.capacity {
            while queue.len() >= self.capacity {
                queue.pop_front();
            }
            if !matches!(queue.front(), Some(StreamItem::Gap)) {
                queue.push_front(StreamItem::Gap);
            }
        }
        queue.push_back(item);
        drop(queue);
        self.notify.notify_one();
    }
}

/// Consumer handle for one subscription. Dropping it unsubscribes.
pub struct EventStream {
    inner: Arc<SubscriberInner>,
}

impl EventStream {
    /// Await the next item. Cancel-safe: callers may select over this.
    pub async fn recv(&mut self) -> StreamItem {
        loop {
            if let Some(item) = {
                let mut queue = self.inner.queue.lock().expect("subscriber queue poisoned");
                queue.pop_front()
            } {
                return item;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking variant used by tests and the WebSocket writer.
    pub fn try_recv(&mut self) -> Option<StreamItem> {
        self.inner
            .queue
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Relaxed);
    }
}

/// Result of a ring-buffer catch-up poll.
#[derive(Debug)]
pub struct PollResult {
    pub events: Vec<Arc<TaskEvent>>,
    /// True when the requested range had already left the ring and the
    /// events were served from (or must be fetched from) the persistent
    /// log instead.
    pub resume_gap: bool,
}

pub struct EventBus {
    pool: SqlitePool,
    subscribers: RwLock<Vec<Arc<SubscriberInner>>>,
    taps: RwLock<Vec<mpsc::UnboundedSender<Arc<TaskEvent>>>>,
    ring: RwLock<VecDeque<Arc<TaskEvent>>>,
    ring_capacity: usize,
    default_buffer: usize,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(pool: SqlitePool, ring_capacity: usize, default_buffer: usize) -> Self {
        Self {
            pool,
            subscribers: RwLock::new(Vec::new()),
            taps: RwLock::new(Vec::new()),
            ring: RwLock::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
            default_buffer,
            published: AtomicU64::new(0),
        }
    }

    /// Persist the event (assigning its seq), then distribute it.
    pub async fn publish(
        &self,
        task_id: &str,
        kind: EventKind,
        data: serde_json::Value,
    ) -> AppResult<Arc<TaskEvent>> {
        let event = Arc::new(EventRepository::append(&self.pool, task_id, kind, &data).await?);
        self.published.fetch_add(1, Ordering::Relaxed);

        {
            let mut ring = self.ring.write().expect("ring poisoned");
            if ring.len() >= self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        let mut any_closed = false;
        {
            let subscribers = self.subscribers.read().expect("subscribers poisoned");
            for sub in subscribers.iter() {
                if sub.closed.load(Ordering::Relaxed) {
                    any_closed = true;
                    continue;
                }
                if sub.filter.matches(&event) {
                    sub.push(StreamItem::Event(event.clone()));
                }
            }
        }
        if any_closed {
            self.subscribers
                .write()
                .expect("subscribers poisoned")
                .retain(|sub| !sub.closed.load(Ordering::Relaxed));
        }

        let mut any_dead_tap = false;
        {
            let taps = self.taps.read().expect("taps poisoned");
            for tap in taps.iter() {
                if tap.send(event.clone()).is_err() {
                    any_dead_tap = true;
                }
            }
        }
        if any_dead_tap {
            self.taps
                .write()
                .expect("taps poisoned")
                .retain(|tap| !tap.is_closed());
        }

        Ok(event)
    }

    /// Register a push-stream subscriber with the default buffer size.
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        self.subscribe_with_capacity(filter, self.default_buffer)
    }

    pub fn subscribe_with_capacity(&self, filter: EventFilter, capacity: usize) -> EventStream {
        let inner = Arc::new(SubscriberInner {
            filter,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.subscribers
            .write()
            .expect("subscribers poisoned")
            .push(inner.clone());
        EventStream { inner }
    }

    /// Register an unbounded tap. Used by the webhook dispatcher, which
    /// needs publication order without the drop-oldest policy.
    pub fn add_tap(&self) -> mpsc::UnboundedReceiver<Arc<TaskEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.taps.write().expect("taps poisoned").push(tx);
        rx
    }

    /// Serve events with seq > since_seq from the ring, ascending.
    /// `resume_gap` is set when the range has already been evicted; the
    /// caller should fall back to the persistent log.
    pub fn poll_since(
        &self,
        task_id: Option<&str>,
        since_seq: i64,
        limit: usize,
    ) -> PollResult {
        let ring = self.ring.read().expect("ring poisoned");
        let mut events: Vec<Arc<TaskEvent>> = Vec::new();
        let mut min_seen: Option<i64> = None;

        for event in ring.iter() {
            if let Some(task_id) = task_id {
                if event.task_id != task_id {
                    continue;
                }
            }
            min_seen = Some(match min_seen {
                Some(min) => min.min(event.seq),
                None => event.seq,
            });
            if event.seq > since_seq && events.len() < limit {
                events.push(event.clone());
            }
        }
        events.sort_by_key(|e| (e.task_id.clone(), e.seq));

        // The ring no longer covers (since_seq, first-retained): the
        // caller fell behind and must re-fetch from the log.
        let resume_gap = match (task_id, min_seen) {
            (Some(_), Some(min)) => min > since_seq + 1,
            (Some(_), None) => since_seq > 0,
            // Wildcard polls cannot reason about per-task gaps.
            (None, _) => false,
        };

        PollResult { events, resume_gap }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::test_support::test_pool;

    async fn bus() -> EventBus {
        EventBus::new(test_pool().await, 16, 8)
    }

    #[tokio::test]
    async fn publish_assigns_contiguous_seq_and_fans_out() {
        let bus = bus().await;
        let mut all = bus.subscribe(EventFilter::default());
        let mut only_t1 = bus.subscribe(EventFilter::for_task("t1"));

        bus.publish("t1", EventKind::Heartbeat, serde_json::json!({}))
            .await
            .unwrap();
        bus.publish("t2", EventKind::Heartbeat, serde_json::json!({}))
            .await
            .unwrap();
        bus.publish("t1", EventKind::Progress, serde_json::json!({"percent": 10}))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            match all.recv().await {
                StreamItem::Event(e) => seen.push((e.task_id.clone(), e.seq)),
                StreamItem::Gap => panic!("no overflow expected"),
            }
        }
        assert_eq!(
            seen,
            vec![
                ("t1".to_string(), 1),
                ("t2".to_string(), 1),
                ("t1".to_string(), 2)
            ]
        );

        // The task-filtered subscriber only saw t1.
        let mut filtered = Vec::new();
        while let Some(StreamItem::Event(e)) = only_t1.try_recv() {
            filtered.push(e.seq);
        }
        assert_eq!(filtered, vec![1, 2]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_with_single_gap_notice() {
        let bus = bus().await;
        let mut sub = bus.subscribe_with_capacity(EventFilter::for_task("t1"), 2);

        for i in 0..5 {
            bus.publish("t1", EventKind::Progress, serde_json::json!({"percent": i}))
                .await
                .unwrap();
        }

        // Expect one gap notice, then the live tail.
        match sub.try_recv().unwrap() {
            StreamItem::Gap => {}
            StreamItem::Event(e) => panic!("expected gap, got seq {}", e.seq),
        }
        let mut tail = Vec::new();
        while let Some(item) = sub.try_recv() {
            match item {
                StreamItem::Event(e) => tail.push(e.seq),
                StreamItem::Gap => panic!("only a single gap notice expected"),
            }
        }
        assert_eq!(tail, vec![4, 5]);
    }

    #[tokio::test]
    async fn poll_since_serves_ascending_and_flags_evicted_ranges() {
        let bus = EventBus::new(test_pool().await, 4, 8);
        for i in 0..6 {
            bus.publish("t1", EventKind::Progress, serde_json::json!({"percent": i}))
                .await
                .unwrap();
        }

        // Ring holds seq 3..=6. Polling from 3 is served in full.
        let result = bus.poll_since(Some("t1"), 3, 100);
        let seqs: Vec<i64> = result.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5, 6]);
        assert!(!result.resume_gap);

        // Polling from 0 fell behind the ring.
        let result = bus.poll_since(Some("t1"), 0, 100);
        assert!(result.resume_gap);
    }

    #[tokio::test]
    async fn taps_receive_publication_order() {
        let bus = bus().await;
        let mut tap = bus.add_tap();
        for i in 0..3 {
            bus.publish("t1", EventKind::Progress, serde_json::json!({"percent": i}))
                .await
                .unwrap();
        }
        for expected_seq in 1..=3 {
            let event = tap.recv().await.unwrap();
            assert_eq!(event.seq, expected_seq);
        }
    }
}
