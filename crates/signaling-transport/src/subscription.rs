//! Typed event subscriptions with deterministic unsubscribe
//!
//! A [`Subscribers`] list fans each published event out to every live
//! [`Subscription`]. Channels are unbounded so a slow subscriber never makes
//! the publisher drop events or block. Dropping a `Subscription` removes it
//! from the list immediately; there is no callback to deregister.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

struct SubscriberList<T> {
    next_id: u64,
    senders: Vec<(u64, mpsc::UnboundedSender<T>)>,
}

/// Publisher side of a typed event stream
pub struct Subscribers<T> {
    list: Arc<Mutex<SubscriberList<T>>>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            list: Arc::clone(&self.list),
        }
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            list: Arc::new(Mutex::new(SubscriberList {
                next_id: 0,
                senders: Vec::new(),
            })),
        }
    }
}

impl<T> std::fmt::Debug for Subscribers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.subscriber_count())
            .finish()
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut list = self.list.lock();
        let id = list.next_id;
        list.next_id += 1;
        list.senders.push((id, tx));
        Subscription {
            id,
            rx,
            list: Arc::downgrade(&self.list),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.list.lock().senders.len()
    }
}

impl<T: Clone> Subscribers<T> {
    /// Deliver `event` to every subscriber, pruning any whose receiver is gone
    pub fn publish(&self, event: T) {
        let mut list = self.list.lock();
        list.senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

/// Receiving side of a typed event stream; unsubscribes on drop
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    list: Weak<Mutex<SubscriberList<T>>>,
}

impl<T> Subscription<T> {
    /// Wait for the next event; `None` once the publisher is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.lock().senders.retain(|(id, _)| *id != self.id);
        }
    }
}
