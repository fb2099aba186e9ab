//! Event bus port — publish/subscribe for valve events.

use std::future::Future;

use valvehub_domain::event::ValveEvent;

/// Publishes valve events to interested subscribers.
pub trait EventPublisher: Send + Sync {
    /// Publish an event to all current subscribers. Delivery is best-effort.
    fn publish(&self, event: ValveEvent) -> impl Future<Output = ()> + Send;
}

impl<T: EventPublisher> EventPublisher for std::sync::Arc<T> {
    fn publish(&self, event: ValveEvent) -> impl Future<Output = ()> + Send {
        (**self).publish(event)
    }
}
