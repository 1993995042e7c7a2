//! Event bus shared by Chorus components
//!
//! Components publish typed notifications on an [`EventBus`] backed by a
//! `tokio::sync::broadcast` channel. Emitting never runs subscriber code
//! inline: subscribers observe events when they next poll their receiver,
//! i.e. after the operation that emitted them has completed.

use tokio::sync::broadcast;

/// Broadcast bus for one event type
///
/// Cloning the bus yields another handle to the same channel.
#[derive(Debug)]
pub struct EventBus<E: Clone> {
    tx: broadcast::Sender<E>,
    capacity: usize,
}

impl<E: Clone> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<E: Clone> EventBus<E> {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before lagging receivers
    ///   start losing the oldest ones (must be > 0)
    ///
    /// # Examples
    ///
    /// ```
    /// use chorus_common::events::EventBus;
    ///
    /// let bus: EventBus<String> = EventBus::new(100);
    /// assert_eq!(bus.capacity(), 100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: E) -> Result<usize, broadcast::error::SendError<E>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: E) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Ping {
        One,
        Two(u32),
    }

    #[test]
    fn test_eventbus_new() {
        let bus: EventBus<Ping> = EventBus::new(16);
        assert_eq!(bus.capacity(), 16);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_eventbus_zero_capacity_is_bumped() {
        let bus: EventBus<Ping> = EventBus::new(0);
        assert_eq!(bus.capacity(), 1);
    }

    #[test]
    fn test_eventbus_subscribe() {
        let bus: EventBus<Ping> = EventBus::new(16);
        let _rx = bus.subscribe();
        let _rx2 = bus.clone().subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_emit_without_subscribers_is_err() {
        let bus: EventBus<Ping> = EventBus::new(16);
        assert!(bus.emit(Ping::One).is_err());
        // Lossy variant must not panic
        bus.emit_lossy(Ping::One);
    }

    #[tokio::test]
    async fn test_events_arrive_in_emit_order() {
        let bus: EventBus<Ping> = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit_lossy(Ping::One);
        bus.emit_lossy(Ping::Two(7));

        assert_eq!(rx.recv().await.unwrap(), Ping::One);
        assert_eq!(rx.recv().await.unwrap(), Ping::Two(7));
    }
}
