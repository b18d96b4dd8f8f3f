//! Fan-out of status and output events to any number of observers.
//!
//! Each subscriber owns a bounded queue. Publishing never waits on a
//! consumer: when a queue is full the oldest queued output chunk is
//! dropped to make room. Status events are never dropped, since the
//! scrollback can replay output but nothing replays a missed transition.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tokio::sync::Notify;

use crate::task::{TaskId, TaskView};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SupervisorEvent {
    /// Emitted after every completed transition.
    Status { id: TaskId, view: TaskView },
    /// One chunk read from a running task's terminal.
    Output {
        id: TaskId,
        #[serde(serialize_with = "serialize_base64")]
        data: Arc<[u8]>,
    },
}

impl SupervisorEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            SupervisorEvent::Status { id, .. } | SupervisorEvent::Output { id, .. } => id,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self, SupervisorEvent::Output { .. })
    }
}

fn serialize_base64<S: Serializer>(data: &Arc<[u8]>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(data))
}

/// Which events a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Task(TaskId),
}

impl EventFilter {
    fn accepts(&self, event: &SupervisorEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Task(id) => event.task_id() == id,
        }
    }
}

pub struct EventHub {
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
    capacity: usize,
}

struct SubscriberQueue {
    filter: EventFilter,
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<SupervisorEvent>,
    dropped: u64,
    closed: bool,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            filter,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        });
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    pub fn publish(&self, event: SupervisorEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| {
            let Some(queue) = weak.upgrade() else {
                return false;
            };
            if queue.filter.accepts(&event) {
                queue.push(event.clone(), self.capacity);
            }
            true
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// End every subscription; pending events are still delivered first.
    pub fn close(&self) {
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        for queue in subscribers.iter().filter_map(Weak::upgrade) {
            queue.state.lock().closed = true;
            queue.notify.notify_one();
        }
    }
}

impl SubscriberQueue {
    fn push(&self, event: SupervisorEvent, capacity: usize) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.events.len() >= capacity {
                match state.events.iter().position(SupervisorEvent::is_output) {
                    Some(oldest_output) => {
                        state.events.remove(oldest_output);
                        state.dropped += 1;
                    }
                    None if event.is_output() => {
                        state.dropped += 1;
                        return;
                    }
                    None => {}
                }
            }
            state.events.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// Receiving end of one observer. Dropping it unsubscribes.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Wait for the next event. `None` once the hub has closed and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<SupervisorEvent> {
        loop {
            {
                let mut state = self.queue.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<SupervisorEvent> {
        self.queue.state.lock().events.pop_front()
    }

    /// Output events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.state.lock().dropped
    }

    pub fn filter(&self) -> &EventFilter {
        &self.queue.filter
    }
}
