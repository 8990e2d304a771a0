//! Delivery sinks and the subscriber registry owned by each producer.
//!
//! A `Sink` is the sending half of a queue that a consumer hands to a producer
//! through `subscribe`. Two flavours exist:
//! - `Sink::unbounded()`: every value is kept; a slow consumer accumulates a
//!   backlog instead of stalling the producer.
//! - `Sink::latest()`: a single slot; a new value evicts the unread one, so the
//!   consumer only ever sees the freshest value.
//!
//! Sink identity is the identity of the underlying channel, so a clone of a sink
//! counts as the same subscriber.

use crossbeam_channel::{Receiver, Sender, TrySendError};

pub struct Sink<T> {
    tx: Sender<T>,
    /// Present only on single-slot sinks; used to evict the stale value.
    evict: Option<Receiver<T>>,
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            evict: self.evict.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Sink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("single_slot", &self.evict.is_some())
            .field("pending", &self.tx.len())
            .finish()
    }
}

impl<T> Sink<T> {
    /// Unbounded fan-out sink.
    pub fn unbounded() -> (Self, Receiver<T>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx, evict: None }, rx)
    }

    /// Single-slot sink that keeps only the freshest value.
    pub fn latest() -> (Self, Receiver<T>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (
            Self {
                tx,
                evict: Some(rx.clone()),
            },
            rx,
        )
    }

    /// Deliver a value. Returns `false` once every receiver has been dropped.
    ///
    /// A single-slot sink holds a receiver of its own, so it never reports a
    /// dropped consumer; it has to be unsubscribed explicitly.
    pub fn push(&self, value: T) -> bool {
        let Some(evict) = &self.evict else {
            return self.tx.send(value).is_ok();
        };
        let mut value = value;
        loop {
            match self.tx.try_send(value) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(rejected)) => {
                    // The consumer may win the race for the stale value; either
                    // way the slot is free on the next attempt.
                    let _ = evict.try_recv();
                    value = rejected;
                }
            }
        }
    }

    /// True when both sinks feed the same queue.
    pub fn same_queue(&self, other: &Sink<T>) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Number of values waiting to be read.
    pub fn backlog(&self) -> usize {
        self.tx.len()
    }
}

/// Outcome of a registry change, used by the owner for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    Added,
    Removed,
    Unchanged,
}

/// The set of sinks a producer fans out to.
///
/// Owned by exactly one worker thread; callers reach it through that worker's
/// control queue.
pub struct Subscribers<T> {
    sinks: Vec<Sink<T>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self { sinks: Vec::new() }
    }
}

impl<T: Clone> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sink: Sink<T>) -> Registration {
        if self.contains(&sink) {
            return Registration::Unchanged;
        }
        self.sinks.push(sink);
        Registration::Added
    }

    pub fn remove(&mut self, sink: &Sink<T>) -> Registration {
        let before = self.sinks.len();
        self.sinks.retain(|existing| !existing.same_queue(sink));
        if self.sinks.len() == before {
            Registration::Unchanged
        } else {
            Registration::Removed
        }
    }

    pub fn contains(&self, sink: &Sink<T>) -> bool {
        self.sinks.iter().any(|existing| existing.same_queue(sink))
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Deliver one value to every sink. Sinks whose consumers are gone are
    /// dropped from the registry; the number pruned is returned.
    pub fn broadcast(&mut self, value: &T) -> usize {
        let before = self.sinks.len();
        self.sinks.retain(|sink| sink.push(value.clone()));
        before - self.sinks.len()
    }
}
