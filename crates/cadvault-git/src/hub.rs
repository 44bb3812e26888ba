//! Fan-out of notifications to connected observers.

use std::collections::BTreeSet;
use std::sync::Arc;

use cadvault_core::Notification;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Buffered notifications per observer before it counts as unresponsive
const OBSERVER_BUFFER: usize = 64;

pub type ObserverId = Uuid;

#[derive(Debug)]
struct Observer {
    user: String,
    sender: mpsc::Sender<Notification>,
}

/// Registry of observers keyed by id.
///
/// Delivery never blocks: an observer whose channel is closed or full is
/// dropped from the registry, and the remaining observers still receive the
/// event.
#[derive(Debug, Clone, Default)]
pub struct NotificationHub {
    observers: Arc<DashMap<ObserverId, Observer>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for `user`. Events arrive on the returned receiver.
    pub fn register(&self, user: &str) -> (ObserverId, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(OBSERVER_BUFFER);
        let id = Uuid::new_v4();
        self.observers.insert(
            id,
            Observer {
                user: user.to_string(),
                sender,
            },
        );
        debug!("Registered observer {} for {}", id, user);
        (id, receiver)
    }

    pub fn unregister(&self, id: &ObserverId) -> bool {
        let removed = self.observers.remove(id).is_some();
        if removed {
            debug!("Unregistered observer {}", id);
        }
        removed
    }

    fn deliver<F>(&self, notification: &Notification, mut wanted: F) -> usize
    where
        F: FnMut(&Observer) -> bool,
    {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for entry in self.observers.iter() {
            if !wanted(entry.value()) {
                continue;
            }
            match entry.value().sender.try_send(notification.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "Dropping observer {} ({}): {}",
                        entry.key(),
                        entry.value().user,
                        e
                    );
                    failed.push(*entry.key());
                }
            }
        }
        // Removal after the iterator is gone; DashMap shards are still locked inside it
        for id in failed {
            self.observers.remove(&id);
        }
        delivered
    }

    /// Send to every observer. Returns how many accepted the event.
    pub fn broadcast(&self, notification: &Notification) -> usize {
        let delivered = self.deliver(notification, |_| true);
        debug!("Broadcast {} to {} observers", notification.kind(), delivered);
        delivered
    }

    /// Send to a single observer.
    pub fn send_to(&self, id: &ObserverId, notification: &Notification) -> bool {
        let result = match self.observers.get(id) {
            Some(observer) => observer.sender.try_send(notification.clone()),
            None => return false,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping observer {}: {}", id, e);
                self.observers.remove(id);
                false
            }
        }
    }

    /// Send to every observer registered for `user`.
    pub fn send_to_user(&self, user: &str, notification: &Notification) -> usize {
        self.deliver(notification, |observer| observer.user == user)
    }

    /// Users with at least one registered observer.
    pub fn connected_users(&self) -> BTreeSet<String> {
        self.observers
            .iter()
            .map(|entry| entry.value().user.clone())
            .collect()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}
