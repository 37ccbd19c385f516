use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

/// Trait implemented by payload types that can be carried on the bus.
pub trait Event: Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Event for T where T: Clone + Send + Sync + std::fmt::Debug + 'static {}

/// In-memory broadcast bus. Publishing never blocks, so the single threaded
/// engine can emit from inside host callbacks.
pub struct InMemoryBus<E>
where
    E: Event,
{
    sender: broadcast::Sender<E>,
}

impl<E> InMemoryBus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    /// Synchronous publish. Having no subscriber is not an error.
    pub fn emit(&self, event: E) {
        if self.sender.send(event).is_err() {
            trace!(target: "adsidebar.bus", "event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_every_subscriber() {
        let bus = InMemoryBus::<u32>::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.emit(7);
        assert_eq!(first.recv().await.unwrap(), 7);
        assert_eq!(second.recv().await.unwrap(), 7);
    }

    #[test]
    fn emit_without_subscribers_is_dropped() {
        let bus = InMemoryBus::<u32>::new(8);
        bus.emit(1);
        assert_eq!(bus.subscriber_count(), 0);

        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
