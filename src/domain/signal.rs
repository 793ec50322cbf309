//! Observable Values
//!
//! A [`Signal`] is a single-value container that publishes every distinct
//! value it is set to. Subscribers receive changes in order; a subscriber
//! only sees values set after it subscribed.

use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Buffered emissions per subscriber before it starts lagging
const CHANNEL_CAPACITY: usize = 64;

pub struct Signal<T> {
    value: Mutex<T>,
    sender: broadcast::Sender<T>,
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    pub fn new(initial: T) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            value: Mutex::new(initial),
            sender,
        }
    }

    /// Current value
    pub fn get(&self) -> T {
        self.lock().clone()
    }

    /// Store `value` and publish it if it differs from the current one.
    ///
    /// Returns whether anything was published.
    pub fn set(&self, value: T) -> bool {
        let mut current = self.lock();
        if *current == value {
            return false;
        }
        *current = value.clone();
        // Publishing under the lock keeps emission order equal to set order.
        // No receivers is not an error.
        let _ = self.sender.send(value);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        // A panicking writer cannot leave a half-written value behind.
        self.value.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> Default for Signal<T>
where
    T: Clone + PartialEq + Send + Default + 'static,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}
