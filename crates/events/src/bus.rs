//! In-process event bus backed by `tokio::sync::broadcast` channels.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` across the application. It has
//! two sides:
//!
//! - the lifecycle firehose ([`emit`](EventBus::emit) /
//!   [`subscribe_lifecycle`](EventBus::subscribe_lifecycle)), one channel
//!   carrying every [`JobEvent`];
//! - correlation topics ([`publish`](EventBus::publish) /
//!   [`subscribe`](EventBus::subscribe)), one channel per correlation id
//!   carrying sequenced [`ProgressEvent`]s.
//!
//! A terminal publish closes its topic and is remembered in a bounded replay
//! cache, so a subscriber that arrives after the end still sees it. A topic
//! nobody published to is dropped with its last subscriber.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use hireflow_core::types::DbId;

use crate::event::{JobEvent, ProgressEvent, ProgressUpdate};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Buffer capacity of the lifecycle channel.
const DEFAULT_CAPACITY: usize = 1024;

/// Buffer capacity of each correlation topic.
const TOPIC_CAPACITY: usize = 256;

/// Number of terminal events kept for late subscribers.
const DEFAULT_REPLAY_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Topic state
// ---------------------------------------------------------------------------

struct Topic {
    sender: broadcast::Sender<ProgressEvent>,
    next_sequence: u64,
    /// Highest percent published so far; later updates never go below it.
    high_water: u8,
}

impl Topic {
    fn new(next_sequence: u64) -> Self {
        let (sender, _) = broadcast::channel(TOPIC_CAPACITY);
        Self {
            sender,
            next_sequence,
            high_water: 0,
        }
    }

    /// Nothing was published and nobody listens, so it carries no state.
    fn is_idle(&self) -> bool {
        self.next_sequence == 1 && self.sender.receiver_count() == 0
    }
}

#[derive(Default)]
struct Topics {
    live: HashMap<String, Topic>,
    terminal: HashMap<String, ProgressEvent>,
    /// Insertion order of `terminal`, oldest first.
    terminal_order: VecDeque<String>,
}

impl Topics {
    /// The live topic for `correlation_id`, created on first use.
    ///
    /// A topic reopened after a terminal event continues the old sequence.
    fn topic(&mut self, correlation_id: &str) -> &mut Topic {
        let terminal = &mut self.terminal;
        let terminal_order = &mut self.terminal_order;
        self.live
            .entry(correlation_id.to_string())
            .or_insert_with(|| match terminal.remove(correlation_id) {
                Some(last) => {
                    terminal_order.retain(|c| c != correlation_id);
                    Topic::new(last.sequence + 1)
                }
                None => Topic::new(1),
            })
    }

    /// The remembered terminal event, if it was for `job_id` and no newer
    /// topic is open.
    fn ended_by(&self, correlation_id: &str, job_id: Option<DbId>) -> Option<&ProgressEvent> {
        if job_id.is_none() || self.live.contains_key(correlation_id) {
            return None;
        }
        self.terminal
            .get(correlation_id)
            .filter(|last| last.job_id == job_id)
    }

    fn remember_terminal(&mut self, event: ProgressEvent, capacity: usize) {
        let key = event.correlation_id.clone();
        if self.terminal.insert(key.clone(), event).is_none() {
            self.terminal_order.push_back(key);
        }
        while self.terminal_order.len() > capacity {
            if let Some(oldest) = self.terminal_order.pop_front() {
                self.terminal.remove(&oldest);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// One subscriber's view of a correlation topic.
pub struct Subscription {
    correlation_id: String,
    replay: Option<ProgressEvent>,
    receiver: Option<broadcast::Receiver<ProgressEvent>>,
    /// The topic was created by this subscription.
    fresh: bool,
    topics: Arc<Mutex<Topics>>,
}

impl Subscription {
    /// Next event, or `None` once the topic has closed.
    ///
    /// A subscriber that falls more than the topic capacity behind skips the
    /// overwritten events.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.replay.take() {
            return Some(event);
        }
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Live subscriber lagged, skipping events");
                }
                Err(RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Whether the subscription has no live channel: it was served from the
    /// replay cache or its topic already closed.
    pub fn is_replay(&self) -> bool {
        self.receiver.is_none()
    }

    /// Whether the bus knew nothing about the correlation when this
    /// subscription was taken: no open topic and no remembered terminal.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        drop(receiver);
        let mut topics = lock(&self.topics);
        if topics
            .live
            .get(&self.correlation_id)
            .is_some_and(Topic::is_idle)
        {
            topics.live.remove(&self.correlation_id);
        }
    }
}

fn lock(topics: &Mutex<Topics>) -> MutexGuard<'_, Topics> {
    // Topic state stays consistent even if a holder panicked.
    topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// In-process fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use hireflow_events::{EventBus, EventKind, ProgressUpdate};
///
/// let bus = EventBus::default();
/// let mut sub = bus.subscribe("corr-1");
///
/// bus.publish("corr-1", ProgressUpdate::new(EventKind::Progress, "queued"));
/// ```
pub struct EventBus {
    lifecycle: broadcast::Sender<JobEvent>,
    topics: Arc<Mutex<Topics>>,
    replay_capacity: usize,
}

impl EventBus {
    /// Create a bus with a specific lifecycle channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (lifecycle, _) = broadcast::channel(capacity);
        Self {
            lifecycle,
            topics: Arc::new(Mutex::new(Topics::default())),
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
        }
    }

    pub fn with_replay_capacity(mut self, replay_capacity: usize) -> Self {
        self.replay_capacity = replay_capacity.max(1);
        self
    }

    fn topics(&self) -> MutexGuard<'_, Topics> {
        lock(&self.topics)
    }

    // -- lifecycle ---------------------------------------------------------

    /// Emit a job lifecycle event to internal consumers.
    pub fn emit(&self, event: JobEvent) {
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.lifecycle.send(event);
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<JobEvent> {
        self.lifecycle.subscribe()
    }

    // -- correlation topics ------------------------------------------------

    /// Publish an update to every subscriber of `correlation_id`.
    ///
    /// Assigns the next sequence number and raises `percent` to the topic's
    /// high-water mark. A terminal update closes the topic after delivery.
    /// Never blocks; with no subscribers the event is dropped (terminal
    /// events are still remembered for replay).
    ///
    /// An update for the job whose terminal event already closed the topic
    /// is stale: it is discarded and the remembered terminal event returned.
    pub fn publish(&self, correlation_id: &str, update: ProgressUpdate) -> ProgressEvent {
        let mut topics = self.topics();
        if let Some(last) = topics.ended_by(correlation_id, update.job_id) {
            tracing::debug!(
                correlation_id,
                job_id = ?update.job_id,
                stage = %update.stage,
                "Dropping update for an ended job",
            );
            return last.clone();
        }
        let topic = topics.topic(correlation_id);

        let percent = update.percent.map(|p| {
            let p = p.max(topic.high_water);
            topic.high_water = p;
            p
        });
        let terminal = update.kind.is_terminal();
        let event = ProgressEvent {
            kind: update.kind,
            correlation_id: correlation_id.to_string(),
            job_id: update.job_id,
            stage: update.stage,
            percent,
            message: update.message,
            data: update.data,
            sequence: topic.next_sequence,
            terminal,
            timestamp: Utc::now(),
        };
        topic.next_sequence += 1;
        let _ = topic.sender.send(event.clone());

        if terminal {
            // Dropping the sender closes every receiver after the buffered events.
            topics.live.remove(correlation_id);
            topics.remember_terminal(event.clone(), self.replay_capacity);
        }
        event
    }

    /// Subscribe to `correlation_id`.
    ///
    /// If the correlation already ended, the subscription yields the terminal
    /// event once and then closes.
    pub fn subscribe(&self, correlation_id: &str) -> Subscription {
        let mut topics = self.topics();
        let fresh = !topics.live.contains_key(correlation_id);
        let (replay, receiver) = match topics.terminal.get(correlation_id) {
            Some(last) if fresh => (Some(last.clone()), None),
            _ => (None, Some(topics.topic(correlation_id).sender.subscribe())),
        };
        Subscription {
            correlation_id: correlation_id.to_string(),
            fresh: fresh && replay.is_none(),
            replay,
            receiver,
            topics: Arc::clone(&self.topics),
        }
    }

    /// The terminal event of `correlation_id`, if it ended recently.
    pub fn last_terminal(&self, correlation_id: &str) -> Option<ProgressEvent> {
        self.topics().terminal.get(correlation_id).cloned()
    }

    /// Whether `job_id` published the last terminal event of
    /// `correlation_id` and nothing reopened it since.
    pub fn has_ended(&self, correlation_id: &str, job_id: DbId) -> bool {
        self.topics().ended_by(correlation_id, Some(job_id)).is_some()
    }

    /// Number of open correlation topics.
    pub fn topic_count(&self) -> usize {
        self.topics().live.len()
    }

    /// Correlation ids with an open topic.
    pub fn open_correlations(&self) -> Vec<String> {
        self.topics().live.keys().cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
