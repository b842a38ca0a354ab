use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::Notify;

use crate::{
    error::RelayError,
    frame::{Frame, SourceId},
};

pub const DEFAULT_QUEUE_DEPTH: usize = 2;

/// Fans one session's frames out to its viewers. Every subscriber owns a
/// small bounded queue; when it is full the oldest pending frame is dropped,
/// so a stalled viewer only ever loses its own frames.
pub struct FrameBroadcaster {
    source_id: SourceId,
    queue_depth: usize,
    next_id: AtomicU64,
    state: Mutex<BroadcasterState>,
}

struct BroadcasterState {
    subscribers: HashMap<u64, Arc<Slot>>,
    // Some once closed; late subscribers are handed this reason immediately
    closed: Option<Option<RelayError>>,
}

impl FrameBroadcaster {
    pub fn new(source_id: SourceId, queue_depth: usize) -> Self {
        Self {
            source_id,
            queue_depth: queue_depth.max(1),
            next_id: AtomicU64::new(1),
            state: Mutex::new(BroadcasterState {
                subscribers: HashMap::new(),
                closed: None,
            }),
        }
    }

    pub fn attach(&self) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new());

        let mut state = self.lock();
        match &state.closed {
            Some(reason) => slot.close(reason.clone()),
            None => {
                state.subscribers.insert(id, Arc::clone(&slot));
            }
        }
        Subscriber { id, slot }
    }

    /// Deregisters the subscriber. Anything still queued for it is discarded.
    pub fn detach(&self, subscriber: &Subscriber) {
        if let Some(slot) = self.lock().subscribers.remove(&subscriber.id) {
            slot.close(None);
        }
    }

    pub fn publish(&self, frame: &Frame) {
        let state = self.lock();
        for (id, slot) in state.subscribers.iter() {
            if slot.push(frame.clone(), self.queue_depth) {
                log::debug!(
                    "{}: subscriber {} is behind, dropped a stale frame before #{}",
                    self.source_id,
                    id,
                    frame.seq()
                );
            }
        }
    }

    /// Closes every subscriber, with `reason` delivered after their queued
    /// frames. Attaching afterwards yields an already closed subscriber.
    pub fn close(&self, reason: Option<RelayError>) {
        let mut state = self.lock();
        if state.closed.is_some() {
            return;
        }
        for (_, slot) in state.subscribers.drain() {
            slot.close(reason.clone());
        }
        state.closed = Some(reason);
    }

    pub fn len(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BroadcasterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Slot {
    queue: Mutex<SlotQueue>,
    notify: Notify,
}

struct SlotQueue {
    frames: VecDeque<Frame>,
    closed: Option<Closed>,
    dropped: u64,
}

enum Closed {
    Clean,
    Failed(RelayError),
}

impl Slot {
    fn new() -> Self {
        Self {
            queue: Mutex::new(SlotQueue {
                frames: VecDeque::new(),
                closed: None,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns true when a stale frame had to be dropped to make room.
    fn push(&self, frame: Frame, depth: usize) -> bool {
        let mut dropped = false;
        {
            let mut queue = self.lock();
            if queue.closed.is_some() {
                return false;
            }
            while queue.frames.len() >= depth {
                queue.frames.pop_front();
                queue.dropped += 1;
                dropped = true;
            }
            queue.frames.push_back(frame);
        }
        self.notify.notify_one();
        dropped
    }

    fn close(&self, reason: Option<RelayError>) {
        {
            let mut queue = self.lock();
            if queue.closed.is_some() {
                return;
            }
            queue.closed = Some(match reason {
                Some(err) => Closed::Failed(err),
                None => {
                    queue.frames.clear();
                    Closed::Clean
                }
            });
        }
        self.notify.notify_one();
    }
}

/// One attached viewer's end of the broadcaster.
pub struct Subscriber {
    id: u64,
    slot: Arc<Slot>,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next frame for this viewer. Yields the close reason once, after any
    /// frames still queued, and `None` from then on.
    pub async fn recv(&self) -> Option<Result<Frame, RelayError>> {
        loop {
            {
                let mut queue = self.slot.lock();
                if let Some(frame) = queue.frames.pop_front() {
                    return Some(Ok(frame));
                }
                match queue.closed.take() {
                    Some(Closed::Failed(err)) => {
                        queue.closed = Some(Closed::Clean);
                        return Some(Err(err));
                    }
                    Some(Closed::Clean) => {
                        queue.closed = Some(Closed::Clean);
                        return None;
                    }
                    None => {}
                }
            }
            self.slot.notify.notified().await;
        }
    }

    /// Frames this viewer lost to backpressure.
    pub fn dropped(&self) -> u64 {
        self.slot.lock().dropped
    }
}

#[cfg(test)]
#[path = "broadcaster_test.rs"]
mod broadcaster_test;
