//! Live backend set for one service, driven by discovery events.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use gatehouse_types::{Backend, Event, EventType};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::discovery::{Discovery, EventKind, Instance, ServiceEvent, ServiceStream};
use crate::error::RouterError;
use crate::gate::ServiceGate;
use crate::watch::WatchManager;

/// Upper bound on waiting for the initial `current` marker.
pub const CURRENT_TIMEOUT: Duration = Duration::from_secs(30);

const RECONNECT_MIN: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct CacheState {
    instances: BTreeMap<String, Instance>,
    leader: Option<String>,
}

impl CacheState {
    /// Apply one event, returning the backend change it caused.
    fn apply(&mut self, event: &ServiceEvent) -> Option<(EventType, Instance)> {
        let instance = event.instance.as_ref()?;
        match event.kind {
            EventKind::Up | EventKind::Update => {
                let previous = self.instances.insert(instance.id.clone(), instance.clone());
                previous
                    .is_none()
                    .then(|| (EventType::BackendUp, instance.clone()))
            }
            EventKind::Down => {
                if self.leader.as_deref() == Some(instance.id.as_str()) {
                    self.leader = None;
                }
                self.instances
                    .remove(&instance.id)
                    .map(|removed| (EventType::BackendDown, removed))
            }
            EventKind::Leader => {
                self.leader = Some(instance.id.clone());
                None
            }
            EventKind::Current | EventKind::Unknown => None,
        }
    }
}

#[derive(Debug)]
struct Shared {
    service: String,
    state: RwLock<CacheState>,
    events: Option<Arc<WatchManager>>,
    tap: Mutex<Option<mpsc::UnboundedSender<ServiceEvent>>>,
}

impl Shared {
    async fn handle(&self, event: ServiceEvent) {
        self.forward(&event);
        let change = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(&event);
        if let Some((kind, instance)) = change {
            self.publish(kind, &instance).await;
        }
    }

    /// Swap in a full snapshot, publishing the difference.
    async fn replace(&self, next: CacheState) {
        let changes = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let mut changes = Vec::new();
            for (id, instance) in &state.instances {
                if !next.instances.contains_key(id) {
                    changes.push((EventType::BackendDown, instance.clone()));
                }
            }
            for (id, instance) in &next.instances {
                if !state.instances.contains_key(id) {
                    changes.push((EventType::BackendUp, instance.clone()));
                }
            }
            *state = next;
            changes
        };
        for (kind, instance) in changes {
            self.publish(kind, &instance).await;
        }
    }

    fn forward(&self, event: &ServiceEvent) {
        let mut tap = self.tap.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = tap.as_ref() {
            if tx.send(event.clone()).is_err() {
                *tap = None;
            }
        }
    }

    async fn publish(&self, kind: EventType, instance: &Instance) {
        debug!(service = %self.service, addr = %instance.addr, event = kind.as_str(), "backend changed");
        if let Some(events) = &self.events {
            let backend = Backend {
                service: self.service.clone(),
                addr: instance.addr.clone(),
                job_id: instance.job_id().to_string(),
            };
            events.send(Event::backend(kind, backend)).await;
        }
    }
}

/// Snapshot of the addresses registered for one service.
///
/// Construction blocks until discovery reports `current`. Afterwards a
/// background task applies changes and transparently re-subscribes when the
/// stream drops, replacing the whole snapshot once the new stream is current.
#[derive(Debug)]
pub struct BackendCache {
    shared: Arc<Shared>,
    gate: Arc<ServiceGate>,
    cancel: CancellationToken,
}

impl BackendCache {
    /// Subscribe to `service` and wait for its initial snapshot.
    pub async fn connect(
        discovery: Arc<dyn Discovery>,
        service: &str,
        events: Option<Arc<WatchManager>>,
    ) -> Result<Self, RouterError> {
        let mut stream = discovery.watch(service).await?;
        let state = read_snapshot(&mut stream, service).await?;
        info!(service = %service, backends = state.instances.len(), "backend cache current");

        let shared = Arc::new(Shared {
            service: service.to_string(),
            state: RwLock::new(state),
            events,
            tap: Mutex::new(None),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(
            run(Arc::clone(&shared), discovery, stream, cancel.clone())
                .instrument(tracing::debug_span!("backend_cache", service = %service)),
        );
        Ok(Self {
            shared,
            gate: Arc::new(ServiceGate::new()),
            cancel,
        })
    }

    pub fn service(&self) -> &str {
        &self.shared.service
    }

    /// Pause state and in-flight count for traffic to this service.
    pub fn gate(&self) -> &Arc<ServiceGate> {
        &self.gate
    }

    /// Addresses of every live backend.
    pub fn addrs(&self) -> Vec<String> {
        let state = self.shared.state.read().unwrap_or_else(PoisonError::into_inner);
        state.instances.values().map(|i| i.addr.clone()).collect()
    }

    /// Address of the leader, if one is known and live.
    pub fn leader_addrs(&self) -> Vec<String> {
        let state = self.shared.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .leader
            .as_ref()
            .and_then(|id| state.instances.get(id))
            .map(|i| vec![i.addr.clone()])
            .unwrap_or_default()
    }

    /// Receive every discovery event the cache processes from now on.
    pub fn tap(&self) -> mpsc::UnboundedReceiver<ServiceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.tap.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Cancel the subscription. The background task exits promptly.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for BackendCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reference-counted backend caches keyed by service name.
///
/// Routes sharing a service share one cache; the cache closes when the last
/// route releases it.
#[derive(Debug, Default)]
pub struct ServiceRefs {
    services: HashMap<String, (Arc<BackendCache>, usize)>,
}

impl ServiceRefs {
    /// The cache already held for `service`, without taking a reference.
    pub fn get(&self, service: &str) -> Option<Arc<BackendCache>> {
        self.services.get(service).map(|(cache, _)| Arc::clone(cache))
    }

    /// Take a reference on `service`, registering `cache` if none is held.
    pub fn acquire(&mut self, service: &str, cache: Arc<BackendCache>) -> Arc<BackendCache> {
        let (held, refs) = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| (Arc::clone(&cache), 0));
        *refs += 1;
        if !Arc::ptr_eq(held, &cache) {
            cache.close();
        }
        Arc::clone(held)
    }

    /// Drop a reference, closing the cache when it was the last.
    pub fn release(&mut self, service: &str) {
        let Some((_, refs)) = self.services.get_mut(service) else {
            return;
        };
        *refs -= 1;
        if *refs == 0 {
            if let Some((cache, _)) = self.services.remove(service) {
                debug!(service = %service, "closing backend cache");
                cache.close();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn close_all(&mut self) {
        for (_, (cache, _)) in self.services.drain() {
            cache.close();
        }
    }
}

async fn read_snapshot(
    stream: &mut ServiceStream,
    service: &str,
) -> Result<CacheState, RouterError> {
    let read = async {
        let mut state = CacheState::default();
        while let Some(event) = stream.next().await {
            let event = event?;
            if event.kind == EventKind::Current {
                return Ok(state);
            }
            state.apply(&event);
        }
        Err(RouterError::Discovery(format!(
            "{service}: stream ended before current"
        )))
    };
    tokio::time::timeout(CURRENT_TIMEOUT, read)
        .await
        .map_err(|_| RouterError::Discovery(format!("{service}: timed out waiting for current")))?
}

async fn run(
    shared: Arc<Shared>,
    discovery: Arc<dyn Discovery>,
    mut stream: ServiceStream,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    shared.handle(event).await;
                    continue;
                }
                Some(Err(e)) => warn!(error = %e, "discovery stream failed, reconnecting"),
                None => debug!("discovery stream ended, reconnecting"),
            },
        }

        match reconnect(&shared, discovery.as_ref(), &cancel).await {
            Some(next) => stream = next,
            None => return,
        }
    }
}

async fn reconnect(
    shared: &Shared,
    discovery: &dyn Discovery,
    cancel: &CancellationToken,
) -> Option<ServiceStream> {
    let mut delay = RECONNECT_MIN;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let attempt = async {
            let mut stream = discovery.watch(&shared.service).await?;
            let state = read_snapshot(&mut stream, &shared.service).await?;
            Ok::<_, RouterError>((stream, state))
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = attempt => result,
        };
        match result {
            Ok((stream, state)) => {
                shared.replace(state).await;
                info!("discovery stream re-established");
                return Some(stream);
            }
            Err(e) => warn!(error = %e, retry_in = ?delay, "discovery reconnect failed"),
        }
        delay = (delay * 2).min(RECONNECT_MAX);
    }
}
