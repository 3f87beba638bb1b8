//! Live subscriber registries with filtered fan-out.
//!
//! A [`SubscriberRegistry`] holds the streaming sessions interested in one
//! message type. Publishing a message:
//! 1. prunes subscribers whose stream was cancelled,
//! 2. skips subscribers whose filter rejects the message,
//! 3. enqueues a clone on every remaining subscriber.
//!
//! A filter mismatch never removes a subscriber: a reservation stream for
//! space 3 stays registered while space 5 publishes. Only cancelled streams
//! are pruned, and [`SubscriberRegistry::end_streams_for`] removes the
//! streams it ends.
//!
//! Enqueueing never blocks: sessions buffer and drain on the reactor.
//!
//! # Locking
//!
//! The registry lock is held while calling [`Subscriber::write`] and
//! [`Subscriber::end`]. Sessions must never take a registry lock from those
//! methods.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use park_core::{PlateReadRequest, ReserveStatus, SpaceStatus};
use tracing::debug;

use crate::session::{PlateReaderSession, ReservationSession, StatusSession};

/// A streaming session that can receive published messages.
pub trait Subscriber<T>: Send + Sync {
    /// True once the underlying stream is gone.
    fn is_cancelled(&self) -> bool;

    /// Filter applied before each delivery.
    fn should_receive(&self, message: &T) -> bool;

    /// Enqueues a message for delivery.
    fn write(&self, message: T);

    /// Finishes the stream once queued messages are flushed.
    fn end(&self);
}

/// Concurrent set of subscribers for messages of type `T`.
pub struct SubscriberRegistry<T, S> {
    subscribers: Mutex<Vec<Arc<S>>>,
    _message: PhantomData<fn(T)>,
}

impl<T, S> Default for SubscriberRegistry<T, S> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            _message: PhantomData,
        }
    }
}

impl<T, S> SubscriberRegistry<T, S>
where
    T: Clone,
    S: Subscriber<T>,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber. Registering the same session twice is a no-op.
    pub fn register(&self, subscriber: Arc<S>) {
        let mut subscribers = self.lock();
        if !subscribers.iter().any(|s| Arc::ptr_eq(s, &subscriber)) {
            subscribers.push(subscriber);
        }
    }

    /// Delivers `message` to every live, matching subscriber.
    ///
    /// Returns the subscribers that received it.
    pub fn fan_out(&self, message: &T) -> Vec<Arc<S>> {
        let mut recipients = Vec::new();
        let mut pruned = 0usize;

        self.lock().retain(|subscriber| {
            if subscriber.is_cancelled() {
                pruned += 1;
                return false;
            }
            if subscriber.should_receive(message) {
                subscriber.write(message.clone());
                recipients.push(Arc::clone(subscriber));
            }
            true
        });

        if pruned > 0 {
            debug!(pruned, "Pruned cancelled subscribers");
        }

        recipients
    }

    /// Ends and removes every live subscriber that matches `message`.
    ///
    /// Returns how many streams were ended.
    pub fn end_streams_for(&self, message: &T) -> usize {
        let mut ended = 0usize;

        self.lock().retain(|subscriber| {
            if subscriber.is_cancelled() {
                return false;
            }
            if subscriber.should_receive(message) {
                subscriber.end();
                ended += 1;
                return false;
            }
            true
        });

        ended
    }

    /// Number of live subscribers that would receive `message`.
    pub fn interested(&self, message: &T) -> usize {
        self.lock()
            .iter()
            .filter(|s| !s.is_cancelled() && s.should_receive(message))
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<S>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The three registries the coordinator publishes to.
pub struct Subscribers {
    pub space_status: Arc<SubscriberRegistry<SpaceStatus, StatusSession>>,
    pub reservations: Arc<SubscriberRegistry<ReserveStatus, ReservationSession>>,
    pub plate_readers: Arc<SubscriberRegistry<PlateReadRequest, PlateReaderSession>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self {
            space_status: Arc::new(SubscriberRegistry::new()),
            reservations: Arc::new(SubscriberRegistry::new()),
            plate_readers: Arc::new(SubscriberRegistry::new()),
        }
    }
}

impl Default for Subscribers {
    fn default() -> Self {
        Self::new()
    }
}
