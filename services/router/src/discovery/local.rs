//! In-process discovery registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{Discovery, EventKind, Instance, ServiceEvent, ServiceStream};
use crate::error::RouterError;

type EventSender = mpsc::UnboundedSender<Result<ServiceEvent, RouterError>>;

#[derive(Debug, Default)]
struct ServiceState {
    instances: BTreeMap<String, Instance>,
    leader: Option<Instance>,
    watchers: Vec<EventSender>,
}

impl ServiceState {
    fn publish(&mut self, event: ServiceEvent) {
        self.watchers.retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }
}

/// Discovery backed by an in-memory registry.
///
/// Registration and watch share one lock, so a new watcher's snapshot and
/// `current` marker always precede later changes.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    services: Mutex<HashMap<String, ServiceState>>,
}

impl StaticDiscovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `addr` under `service`, using the address as instance id.
    pub fn register(&self, service: &str, addr: &str) -> Instance {
        let instance = Instance::new(addr);
        self.register_instance(service, instance.clone());
        instance
    }

    pub fn register_instance(&self, service: &str, instance: Instance) {
        let mut services = self.lock();
        let state = services.entry(service.to_string()).or_default();
        let kind = match state.instances.insert(instance.id.clone(), instance.clone()) {
            Some(previous) if previous == instance => return,
            Some(_) => EventKind::Update,
            None => EventKind::Up,
        };
        state.publish(ServiceEvent::new(service, kind, Some(instance)));
    }

    /// Remove the instance with id `id`. Returns whether it was registered.
    pub fn unregister(&self, service: &str, id: &str) -> bool {
        let mut services = self.lock();
        let Some(state) = services.get_mut(service) else {
            return false;
        };
        let Some(instance) = state.instances.remove(id) else {
            return false;
        };
        if state.leader.as_ref().is_some_and(|l| l.id == id) {
            state.leader = None;
        }
        state.publish(ServiceEvent::new(service, EventKind::Down, Some(instance)));
        true
    }

    /// Mark a registered instance as the service leader.
    pub fn set_leader(&self, service: &str, id: &str) -> bool {
        let mut services = self.lock();
        let Some(state) = services.get_mut(service) else {
            return false;
        };
        let Some(instance) = state.instances.get(id).cloned() else {
            return false;
        };
        state.leader = Some(instance.clone());
        state.publish(ServiceEvent::new(service, EventKind::Leader, Some(instance)));
        true
    }

    pub fn instances(&self, service: &str) -> Vec<Instance> {
        self.lock()
            .get(service)
            .map(|s| s.instances.values().cloned().collect())
            .unwrap_or_default()
    }

    /// End every open stream for `service`, as a dropped connection would.
    pub fn disconnect(&self, service: &str) {
        if let Some(state) = self.lock().get_mut(service) {
            state.watchers.clear();
        }
    }

    pub fn watcher_count(&self, service: &str) -> usize {
        self.lock()
            .get_mut(service)
            .map(|s| {
                s.watchers.retain(|tx| !tx.is_closed());
                s.watchers.len()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServiceState>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn watch(&self, service: &str) -> Result<ServiceStream, RouterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut services = self.lock();
        let state = services.entry(service.to_string()).or_default();
        for instance in state.instances.values() {
            let _ = tx.send(Ok(ServiceEvent::new(
                service,
                EventKind::Up,
                Some(instance.clone()),
            )));
        }
        if let Some(leader) = &state.leader {
            let _ = tx.send(Ok(ServiceEvent::new(
                service,
                EventKind::Leader,
                Some(leader.clone()),
            )));
        }
        let _ = tx.send(Ok(ServiceEvent::new(service, EventKind::Current, None)));
        state.watchers.push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_kind(stream: &mut ServiceStream) -> EventKind {
        stream.next().await.unwrap().unwrap().kind
    }

    #[tokio::test]
    async fn test_watch_sends_snapshot_then_current() {
        let discovery = StaticDiscovery::new();
        discovery.register("web", "127.0.0.1:1");
        discovery.register("web", "127.0.0.1:2");

        let mut stream = discovery.watch("web").await.unwrap();
        assert_eq!(next_kind(&mut stream).await, EventKind::Up);
        assert_eq!(next_kind(&mut stream).await, EventKind::Up);
        assert_eq!(next_kind(&mut stream).await, EventKind::Current);

        assert!(discovery.unregister("web", "127.0.0.1:1"));
        let down = stream.next().await.unwrap().unwrap();
        assert_eq!(down.kind, EventKind::Down);
        assert_eq!(down.instance.unwrap().addr, "127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_reregister_changed_instance_is_update() {
        let discovery = StaticDiscovery::new();
        let mut stream = discovery.watch("web").await.unwrap();
        assert_eq!(next_kind(&mut stream).await, EventKind::Current);

        discovery.register("web", "127.0.0.1:1");
        let mut changed = Instance::new("127.0.0.1:1");
        changed.proto = "http".to_string();
        discovery.register_instance("web", changed);
        assert_eq!(next_kind(&mut stream).await, EventKind::Up);
        assert_eq!(next_kind(&mut stream).await, EventKind::Update);
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams() {
        let discovery = StaticDiscovery::new();
        let mut stream = discovery.watch("web").await.unwrap();
        assert_eq!(next_kind(&mut stream).await, EventKind::Current);
        assert_eq!(discovery.watcher_count("web"), 1);
        discovery.disconnect("web");
        assert!(stream.next().await.is_none());
        assert!(!discovery.unregister("web", "missing"));
    }
}
