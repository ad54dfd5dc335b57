//! In-process fan-out of route and backend events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::Stream;
use gatehouse_types::Event;
use tokio::sync::mpsc;

/// Default per-subscriber buffer.
pub const DEFAULT_WATCH_BUFFER: usize = 64;

/// Publishes events to every registered subscriber.
///
/// Sends block until each subscriber has buffer space, so a stalled
/// subscriber back-pressures the publisher. Subscribers only see events sent
/// after they registered.
#[derive(Debug, Default)]
pub struct WatchManager {
    next_id: AtomicU64,
    watchers: Mutex<HashMap<u64, mpsc::Sender<Event>>>,
}

impl WatchManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a subscriber with the given channel capacity.
    pub fn watch(self: &Arc<Self>, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, tx);
        Subscription {
            id,
            rx: Some(rx),
            manager: Arc::clone(self),
        }
    }

    /// Deliver `event` to every current subscriber.
    pub async fn send(&self, event: Event) {
        let senders: Vec<_> = self.lock().values().cloned().collect();
        for tx in senders {
            // A closed receiver means the subscriber is mid-unregister.
            let _ = tx.send(event.clone()).await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn unwatch(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<Event>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered event subscriber. Dropping it unregisters.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: Option<mpsc::Receiver<Event>>,
    manager: Arc<WatchManager>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.as_mut()?.recv().await
    }

    /// Unregister and discard anything still buffered.
    pub fn close(mut self) {
        self.detach();
    }

    /// Convert into a stream that unregisters when dropped.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        futures_util::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }

    fn detach(&mut self) {
        self.manager.unwatch(self.id);
        if let Some(mut rx) = self.rx.take() {
            // Closing wakes publishers still blocked on this buffer.
            rx.close();
            while rx.try_recv().is_ok() {}
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use gatehouse_types::Route;
    use std::time::Duration;

    fn event(id: &str) -> Event {
        let mut route = Route::http("a.example", "web");
        route.id = id.to_string();
        Event::set(route)
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let manager = WatchManager::new();
        let mut a = manager.watch(4);
        let mut b = manager.watch(4);
        manager.send(event("1")).await;
        assert_eq!(a.recv().await.unwrap().route_id(), Some("1"));
        assert_eq!(b.recv().await.unwrap().route_id(), Some("1"));
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let manager = WatchManager::new();
        manager.send(event("early")).await;
        let mut sub = manager.watch(4);
        manager.send(event("late")).await;
        assert_eq!(sub.recv().await.unwrap().route_id(), Some("late"));
    }

    #[tokio::test]
    async fn test_close_and_drop_unregister() {
        let manager = WatchManager::new();
        let a = manager.watch(1);
        let b = manager.watch(1);
        assert_eq!(manager.subscriber_count(), 2);
        a.close();
        drop(b);
        assert_eq!(manager.subscriber_count(), 0);
        manager.send(event("x")).await;
    }

    #[tokio::test]
    async fn test_close_releases_blocked_publisher() {
        let manager = WatchManager::new();
        let sub = manager.watch(1);
        manager.send(event("1")).await;

        let publisher = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.send(event("2")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sub.close();
        tokio::time::timeout(Duration::from_secs(1), publisher)
            .await
            .expect("publisher stayed blocked")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stream_unregisters_on_drop() {
        let manager = WatchManager::new();
        let mut stream = Box::pin(manager.watch(4).into_stream());
        manager.send(event("1")).await;
        assert_eq!(stream.next().await.unwrap().route_id(), Some("1"));
        drop(stream);
        assert_eq!(manager.subscriber_count(), 0);
    }
}
