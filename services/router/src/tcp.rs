//! TCP listener: one accept loop per routed port.
//!
//! Every port of the configured range is reserved at start by a listening
//! socket held in a free pool. Routing a port moves its socket out of the
//! pool into an accept loop; removing the route hands the socket back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::net::{self, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use gatehouse_types::{Event, Route, RouteError, RouteType, MAX_TCP_PORT};

use crate::backend_cache::{BackendCache, ServiceRefs};
use crate::discovery::Discovery;
use crate::error::RouterError;
use crate::gate::ServiceGate;
use crate::proxy::{proxy_bidirectional, Transport};
use crate::store::RouteStore;
use crate::sync::{SyncHandler, Syncer};
use crate::watch::{Subscription, WatchManager, DEFAULT_WATCH_BUFFER};

const LISTEN_BACKLOG: u32 = 1024;

/// Settings for a [`TcpListener`].
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Bind address for every routed port.
    pub ip: IpAddr,
    /// First port of the reserved range.
    pub port_start: u16,
    /// Last port of the reserved range, inclusive.
    pub port_end: u16,
}

impl TcpConfig {
    pub fn range(&self) -> RangeInclusive<u16> {
        self.port_start..=self.port_end
    }
}

/// Stable id of the TCP route on `port`: the MD5 of the decimal port,
/// formatted as a UUID.
pub fn route_id(port: i32) -> String {
    Uuid::from_bytes(md5::compute(port.to_string()).0).to_string()
}

/// Open a listening socket with address and port reuse.
fn bind_reusable(addr: SocketAddr) -> io::Result<net::TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// What an accepted connection is forwarded to. Swapped on route updates.
#[derive(Debug)]
struct Target {
    route_id: String,
    transport: Transport,
    disabled: bool,
}

#[derive(Debug)]
struct TcpRoute {
    route: Route,
    target: Arc<ArcSwap<Target>>,
    cancel: CancellationToken,
    task: JoinHandle<net::TcpListener>,
}

#[derive(Debug, Default)]
struct TcpState {
    closed: bool,
    pool: BTreeMap<u16, net::TcpListener>,
    routes: HashMap<String, TcpRoute>,
    services: ServiceRefs,
}

struct TcpInner {
    config: TcpConfig,
    store: Arc<dyn RouteStore>,
    discovery: Arc<dyn Discovery>,
    events: Arc<WatchManager>,
    state: RwLock<TcpState>,
    cancel: CancellationToken,
}

impl TcpInner {
    fn read(&self) -> RwLockReadGuard<'_, TcpState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TcpState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_range(&self, port: u16) -> bool {
        self.config.range().contains(&port)
    }
}

/// TCP listener synchronized from a route store.
#[derive(Clone)]
pub struct TcpListener {
    inner: Arc<TcpInner>,
}

impl TcpListener {
    pub fn new(
        config: TcpConfig,
        store: Arc<dyn RouteStore>,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        Self {
            inner: Arc::new(TcpInner {
                config,
                store,
                discovery,
                events: WatchManager::new(),
                state: RwLock::new(TcpState::default()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Reserve the port range and load the initial routing table.
    pub async fn start(&self) -> Result<(), RouterError> {
        let config = &self.inner.config;
        if config.port_start > config.port_end || i32::from(config.port_end) > MAX_TCP_PORT {
            return Err(RouterError::Config(format!(
                "invalid tcp port range {}-{}",
                config.port_start, config.port_end
            )));
        }
        let mut pool = BTreeMap::new();
        for port in config.range() {
            let listener = bind_reusable(SocketAddr::new(config.ip, port))?;
            pool.insert(port, listener);
        }
        info!(
            ip = %config.ip,
            port_start = config.port_start,
            port_end = config.port_end,
            "tcp port range reserved"
        );
        self.inner.write().pool = pool;

        let syncer = Syncer::new(Arc::clone(&self.inner.store), RouteType::Tcp);
        let stream = syncer.connect(self).await?;
        syncer.spawn(Arc::new(self.clone()), stream, self.inner.cancel.child_token());
        Ok(())
    }

    /// Stop every accept loop and release the reserved ports.
    ///
    /// Established connections are left to their peers.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.write();
        state.closed = true;
        for (_, route) in state.routes.drain() {
            route.cancel.cancel();
        }
        state.pool.clear();
        state.services.close_all();
        info!("tcp listener closed");
    }

    /// Reserved ports not bound to a route, ascending.
    pub fn free_ports(&self) -> Vec<u16> {
        self.inner.read().pool.keys().copied().collect()
    }

    pub fn events(&self) -> &Arc<WatchManager> {
        &self.inner.events
    }

    pub fn watch(&self) -> Subscription {
        self.inner.events.watch(DEFAULT_WATCH_BUFFER)
    }

    /// Create a TCP route. Port 0 claims the lowest reserved port the store
    /// accepts.
    pub async fn add_route(&self, mut route: Route) -> Result<Route, RouterError> {
        route.expect_type(RouteType::Tcp)?;
        if route.port != 0 {
            route.id = route_id(route.port);
            return self.inner.store.add(route).await;
        }
        for port in self.inner.config.range() {
            route.port = i32::from(port);
            route.id = route_id(route.port);
            match self.inner.store.add(route.clone()).await {
                Err(RouterError::Conflict(reason)) => {
                    debug!(port, reason = %reason, "port taken, trying next");
                }
                result => return result,
            }
        }
        Err(RouterError::NoPorts)
    }

    pub async fn update_route(&self, route: Route) -> Result<Route, RouterError> {
        route.expect_type(RouteType::Tcp)?;
        self.inner.store.update(route).await
    }

    pub async fn remove_route(&self, id: &str) -> Result<(), RouterError> {
        self.inner.store.remove(RouteType::Tcp, id).await
    }

    pub async fn get(&self, id: &str) -> Result<Route, RouterError> {
        self.inner.store.get(RouteType::Tcp, id).await
    }

    pub async fn list(&self) -> Result<Vec<Route>, RouterError> {
        self.inner.store.list(RouteType::Tcp).await
    }

    /// Traffic gate of a service routed by this listener.
    pub fn service_gate(&self, service: &str) -> Result<Arc<ServiceGate>, RouterError> {
        let cache = self.inner.read().services.get(service).ok_or(RouterError::NotFound)?;
        Ok(Arc::clone(cache.gate()))
    }

    /// Hold new tcp traffic for `service` until resumed.
    pub fn pause_service(&self, service: &str, paused: bool) -> Result<(), RouterError> {
        if self.service_gate(service)?.set_paused(paused) {
            info!(service = %service, paused, "tcp service pause changed");
        }
        Ok(())
    }

    async fn service_cache(&self, service: &str) -> Result<Arc<BackendCache>, RouterError> {
        if let Some(existing) = self.inner.read().services.get(service) {
            return Ok(existing);
        }
        let cache = BackendCache::connect(
            Arc::clone(&self.inner.discovery),
            service,
            Some(Arc::clone(&self.inner.events)),
        )
        .await?;
        Ok(Arc::new(cache))
    }

    /// Take the socket for `port` from the pool, or bind one outside the
    /// reserved range.
    fn claim_port(&self, port: u16) -> Result<net::TcpListener, RouterError> {
        if self.inner.in_range(port) {
            return self.inner.write().pool.remove(&port).ok_or_else(|| {
                RouterError::Conflict(format!("port {port} is already in use"))
            });
        }
        Ok(bind_reusable(SocketAddr::new(self.inner.config.ip, port))?)
    }

    /// Stop a route's accept loop and reclaim its socket.
    async fn release(&self, route: TcpRoute) {
        route.cancel.cancel();
        let port = route.route.port;
        match route.task.await {
            Ok(listener) => {
                let mut state = self.inner.write();
                let port = port as u16;
                if !state.closed && self.inner.in_range(port) {
                    state.pool.insert(port, listener);
                }
            }
            Err(e) => warn!(port, error = %e, "tcp accept loop failed"),
        }
    }
}

#[async_trait]
impl SyncHandler for TcpListener {
    async fn set(&self, route: Route) -> Result<(), RouterError> {
        if self.inner.read().closed {
            return Err(RouterError::Closed);
        }
        route.expect_type(RouteType::Tcp)?;
        let port = match u16::try_from(route.port) {
            Ok(port) if port != 0 && i32::from(port) <= MAX_TCP_PORT => port,
            _ => return Err(RouteError::InvalidPort(route.port).into()),
        };
        let cache = self.service_cache(&route.service).await?;

        // Same port: swap the target under the running accept loop.
        let swapped = {
            let mut state = self.inner.write();
            if state.closed {
                return Err(RouterError::Closed);
            }
            let state = &mut *state;
            match state.routes.get_mut(&route.id) {
                Some(existing) if existing.route.port == route.port => {
                    let cache = state.services.acquire(&route.service, cache.clone());
                    existing.target.store(Arc::new(Target {
                        route_id: route.id.clone(),
                        transport: Transport::new(cache, route.leader),
                        disabled: route.disabled,
                    }));
                    let old = std::mem::replace(&mut existing.route, route.clone());
                    state.services.release(&old.service);
                    true
                }
                _ => false,
            }
        };
        if swapped {
            debug!(route_id = %route.id, port, service = %route.service, "tcp route updated");
            self.inner.events.send(Event::set(route)).await;
            return Ok(());
        }

        // The previous entry keeps serving until the new port is claimed.
        let listener = self.claim_port(port)?;
        let previous = {
            let mut state = self.inner.write();
            if state.closed {
                return Err(RouterError::Closed);
            }
            let cache = state.services.acquire(&route.service, cache);
            let target = Arc::new(ArcSwap::from_pointee(Target {
                route_id: route.id.clone(),
                transport: Transport::new(cache, route.leader),
                disabled: route.disabled,
            }));
            let cancel = self.inner.cancel.child_token();
            let task = tokio::spawn(accept_loop(
                listener,
                port,
                Arc::clone(&target),
                cancel.clone(),
            ));
            state.routes.insert(
                route.id.clone(),
                TcpRoute {
                    route: route.clone(),
                    target,
                    cancel,
                    task,
                },
            )
        };
        if let Some(previous) = previous {
            let service = previous.route.service.clone();
            self.release(previous).await;
            self.inner.write().services.release(&service);
        }

        info!(route_id = %route.id, port, service = %route.service, "tcp route set");
        self.inner.events.send(Event::set(route)).await;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RouterError> {
        let removed = {
            let mut state = self.inner.write();
            if state.closed {
                return Err(RouterError::Closed);
            }
            state.routes.remove(id).ok_or(RouterError::NotFound)?
        };
        let route = removed.route.clone();
        self.release(removed).await;
        self.inner.write().services.release(&route.service);

        info!(route_id = %id, port = route.port, "tcp route removed");
        self.inner.events.send(Event::remove(route)).await;
        Ok(())
    }

    fn current(&self) -> HashSet<String> {
        self.inner.read().routes.keys().cloned().collect()
    }
}

/// Accept connections on `port` until cancelled, then hand the socket back.
async fn accept_loop(
    listener: net::TcpListener,
    port: u16,
    target: Arc<ArcSwap<Target>>,
    cancel: CancellationToken,
) -> net::TcpListener {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return listener,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let target = target.load_full();
                tokio::spawn(
                    proxy_connection(stream, target)
                        .instrument(tracing::info_span!("tcp", port, peer = %peer)),
                );
            }
            Err(e) => {
                error!(port, error = %e, "accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn proxy_connection(client: TcpStream, target: Arc<Target>) {
    if target.disabled {
        debug!(route_id = %target.route_id, "route disabled, closing connection");
        return;
    }
    let _in_flight = target.transport.gate().enter().await;
    let (backend, addr) = match target.transport.connect(None).await {
        Ok(connected) => connected,
        Err(e) => {
            debug!(route_id = %target.route_id, error = %e, "closing connection");
            return;
        }
    };
    let _ = client.set_nodelay(true);
    match proxy_bidirectional(client, backend).await {
        Ok((sent, received)) => debug!(backend = %addr, sent, received, "connection closed"),
        Err(e) => debug!(backend = %addr, error = %e, "connection failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_id_is_stable_per_port() {
        assert_eq!(route_id(3000), route_id(3000));
        assert_ne!(route_id(3000), route_id(3001));
        let digest = md5::compute("3000");
        assert_eq!(route_id(3000).replace('-', ""), format!("{digest:x}"));
    }

    #[test]
    fn test_range() {
        let config = TcpConfig {
            ip: IpAddr::from([127, 0, 0, 1]),
            port_start: 10,
            port_end: 12,
        };
        assert_eq!(config.range().count(), 3);
    }
}
