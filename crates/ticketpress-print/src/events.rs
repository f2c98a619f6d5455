// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Explicit-subscription event bus.
//
// Every subscriber gets its own unbounded channel, so a slow consumer never
// blocks the queue worker and never loses events. Subscribers that dropped
// their receiver are pruned on the next emit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use ticketpress_core::types::{JobError, JobId, PrintJob, ProfileId, QueueStatus};

use crate::diagnostics::Classification;

/// Handle returned by [`EventBus::subscribe`].
pub type SubscriptionId = u64;

/// A live subscription: the id to unsubscribe with and the event stream.
pub struct Subscription<E> {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.events.try_recv().ok()
    }
}

/// Fan-out bus. Cheap to clone; clones share subscribers.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

struct BusInner<E> {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, tx);
        Subscription { id, events: rx }
    }

    /// Stop delivery to a subscriber. Returns whether it was subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn emit(&self, event: E) {
        let mut subscribers = self.lock();
        subscribers.retain(|id, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                trace!(subscriber = id, "dropping closed subscriber");
            }
            alive
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, mpsc::UnboundedSender<E>>> {
        // A panic while holding this lock leaves the map itself intact.
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Job lifecycle notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    Created(PrintJob),
    /// Any other status or attempt change.
    Updated(PrintJob),
    Completed(PrintJob),
    Failed { job: PrintJob, error: JobError },
    QueueStatusChanged(QueueStatus),
}

impl JobEvent {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Created(job) | Self::Updated(job) | Self::Completed(job) => Some(job.id),
            Self::Failed { job, .. } => Some(job.id),
            Self::QueueStatusChanged(_) => None,
        }
    }
}

/// Connection manager notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    Connected(ProfileId),
    Disconnected { profile: ProfileId, reason: String },
    Reconnected(ProfileId),
    /// Auto-reconnect gave up.
    ConnectionLost { profile: ProfileId, attempts: u32 },
    Faulted { profile: ProfileId, reason: String },
}

/// Emitted by the diagnostics monitor when a printer's classification changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub profile: ProfileId,
    pub previous: Option<Classification>,
    pub current: Classification,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus: EventBus<u32> = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(1);
        bus.emit(2);
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[test]
    fn unsubscribed_receiver_gets_nothing_more() {
        let bus: EventBus<u32> = EventBus::new();
        let mut sub = bus.subscribe();
        bus.emit(1);
        assert!(bus.unsubscribe(sub.id));
        assert!(!bus.unsubscribe(sub.id));
        bus.emit(2);
        assert_eq!(sub.try_recv(), Some(1));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus: EventBus<u32> = EventBus::new();
        let sub = bus.subscribe();
        let _keep = bus.subscribe();
        drop(sub);
        bus.emit(7);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
