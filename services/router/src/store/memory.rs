//! In-process route store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use gatehouse_types::{Certificate, Event, Route, RouteError, RouteType};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use super::{RouteStore, RouteStream};
use crate::error::RouterError;

/// Events retained for slow watchers before they must re-list.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

#[derive(Debug)]
struct StoredCert {
    cert: Certificate,
    routes: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    http: BTreeMap<String, Route>,
    tcp: BTreeMap<String, Route>,
    certs: HashMap<String, StoredCert>,
    keys: HashMap<String, String>,
}

impl State {
    fn routes(&self, route_type: RouteType) -> &BTreeMap<String, Route> {
        match route_type {
            RouteType::Http => &self.http,
            RouteType::Tcp => &self.tcp,
        }
    }

    fn routes_mut(&mut self, route_type: RouteType) -> &mut BTreeMap<String, Route> {
        match route_type {
            RouteType::Http => &mut self.http,
            RouteType::Tcp => &mut self.tcp,
        }
    }

    /// Uniqueness and root-route rules for HTTP routes.
    fn check_http(&self, route: &Route) -> Result<(), RouterError> {
        let same_host = || {
            self.http.values().filter(|r| {
                r.id != route.id && r.domain == route.domain && r.port == route.port
            })
        };
        if same_host().any(|r| r.path == route.path) {
            return Err(RouterError::Conflict(format!(
                "domain {} port {} path {} is already in use",
                route.domain, route.port, route.path
            )));
        }
        if !route.is_root() && !same_host().any(Route::is_root) {
            return Err(RouteError::MissingRootRoute {
                domain: route.domain.clone(),
                port: route.port,
            }
            .into());
        }
        Ok(())
    }

    fn has_children(&self, root: &Route) -> bool {
        self.http.values().any(|r| {
            r.id != root.id && r.domain == root.domain && r.port == root.port && !r.is_root()
        })
    }

    fn check_tcp(&self, route: &Route) -> Result<(), RouterError> {
        if route.port == 0 {
            return Err(RouteError::InvalidPort(0).into());
        }
        if self.tcp.values().any(|r| r.id != route.id && r.port == route.port) {
            return Err(RouterError::Conflict(format!(
                "port {} is already in use",
                route.port
            )));
        }
        Ok(())
    }

    fn check_drain(&self, route: &Route) -> Result<(), RouterError> {
        let mismatch = self
            .http
            .values()
            .chain(self.tcp.values())
            .filter(|r| r.id != route.id && r.service == route.service)
            .any(|r| r.drain_backends != route.drain_backends);
        if mismatch {
            return Err(RouteError::DrainMismatch(route.service.clone()).into());
        }
        Ok(())
    }

    /// Resolve the route's certificate against stored ones, deduplicating by
    /// fingerprint.
    fn resolve_cert(&self, cert: &Certificate) -> Result<Certificate, RouterError> {
        if cert.chain.is_empty() {
            return self
                .certs
                .get(&cert.id)
                .map(|stored| stored.cert.clone())
                .ok_or_else(|| {
                    RouteError::InvalidCertificate(format!("unknown certificate {:?}", cert.id))
                        .into()
                });
        }

        let mut cert = cert.clone();
        cert.normalize()?;
        if let Some(stored) = self.certs.get(&cert.id) {
            return Ok(stored.cert.clone());
        }
        if cert.key.is_empty() {
            return Err(RouteError::InvalidCertificate("missing private key".to_string()).into());
        }
        let now = Utc::now();
        cert.routes.clear();
        cert.created_at = Some(now);
        cert.updated_at = Some(now);
        Ok(cert)
    }

    fn attach_cert(&mut self, route: &mut Route, cert: Certificate) {
        let stored = self
            .certs
            .entry(cert.id.clone())
            .or_insert_with(|| StoredCert {
                cert: cert.clone(),
                routes: BTreeSet::new(),
            });
        stored.routes.insert(route.id.clone());
        self.keys
            .entry(stored.cert.key_id.clone())
            .or_insert_with(|| stored.cert.key.clone());

        let mut attached = stored.cert.clone();
        attached.routes = stored.routes.iter().cloned().collect();
        route.certificate = Some(attached);
    }

    fn detach_cert(&mut self, route: &Route) {
        let Some(cert) = &route.certificate else {
            return;
        };
        let Some(stored) = self.certs.get_mut(&cert.id) else {
            return;
        };
        stored.routes.remove(&route.id);
        if !stored.routes.is_empty() {
            return;
        }
        if let Some(removed) = self.certs.remove(&cert.id) {
            let key_in_use = self
                .certs
                .values()
                .any(|c| c.cert.key_id == removed.cert.key_id);
            if !key_in_use {
                self.keys.remove(&removed.cert.key_id);
            }
        }
    }
}

/// Route store held entirely in memory.
///
/// Enforces the same constraints as the SQL schema: unique
/// `(domain, port, path)` for HTTP, unique TCP ports, a root route before any
/// sub-path, consistent `drain_backends` per service and one certificate per
/// fingerprint.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<Event>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_buffer(DEFAULT_EVENT_BUFFER)
    }

    /// Store whose watchers lag after `capacity` unread events.
    pub fn with_event_buffer(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: Event) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl RouteStore for MemoryStore {
    async fn add(&self, mut route: Route) -> Result<Route, RouterError> {
        route.normalize();
        route.validate()?;

        let mut state = self.lock();
        if route.id.is_empty() {
            route.id = Uuid::new_v4().to_string();
        } else if state.routes(route.route_type).contains_key(&route.id) {
            return Err(RouterError::Conflict(format!(
                "route {} already exists",
                route.formatted_id()
            )));
        }
        match route.route_type {
            RouteType::Http => state.check_http(&route)?,
            RouteType::Tcp => state.check_tcp(&route)?,
        }
        state.check_drain(&route)?;
        let cert = match &route.certificate {
            Some(cert) => Some(state.resolve_cert(cert)?),
            None => None,
        };

        let now = Utc::now();
        route.created_at = Some(now);
        route.updated_at = Some(now);
        if let Some(cert) = cert {
            state.attach_cert(&mut route, cert);
        }
        state
            .routes_mut(route.route_type)
            .insert(route.id.clone(), route.clone());
        self.publish(Event::set(route.without_key()));
        Ok(route.without_key())
    }

    async fn update(&self, mut route: Route) -> Result<Route, RouterError> {
        route.normalize();
        route.validate()?;

        let mut state = self.lock();
        let existing = state
            .routes(route.route_type)
            .get(&route.id)
            .cloned()
            .ok_or(RouterError::NotFound)?;
        match route.route_type {
            RouteType::Http => {
                if existing.domain != route.domain || existing.port != route.port {
                    return Err(RouterError::NotFound);
                }
                if existing.is_root() && !route.is_root() && state.has_children(&existing) {
                    return Err(RouteError::RootRouteInUse {
                        domain: existing.domain,
                        port: existing.port,
                    }
                    .into());
                }
                state.check_http(&route)?;
            }
            RouteType::Tcp => {
                if existing.port != route.port {
                    return Err(RouterError::NotFound);
                }
            }
        }
        state.check_drain(&route)?;
        let cert = match &route.certificate {
            Some(cert) => Some(state.resolve_cert(cert)?),
            None => None,
        };

        route.created_at = existing.created_at;
        route.updated_at = Some(Utc::now());
        state.detach_cert(&existing);
        route.certificate = None;
        if let Some(cert) = cert {
            state.attach_cert(&mut route, cert);
        }
        state
            .routes_mut(route.route_type)
            .insert(route.id.clone(), route.clone());
        self.publish(Event::set(route.without_key()));
        Ok(route.without_key())
    }

    async fn get(&self, route_type: RouteType, id: &str) -> Result<Route, RouterError> {
        self.lock()
            .routes(route_type)
            .get(id)
            .map(Route::without_key)
            .ok_or(RouterError::NotFound)
    }

    async fn list(&self, route_type: RouteType) -> Result<Vec<Route>, RouterError> {
        Ok(self.lock().routes(route_type).values().cloned().collect())
    }

    async fn remove(&self, route_type: RouteType, id: &str) -> Result<(), RouterError> {
        let mut state = self.lock();
        let route = state
            .routes(route_type)
            .get(id)
            .cloned()
            .ok_or(RouterError::NotFound)?;
        if route.route_type == RouteType::Http && route.is_root() && state.has_children(&route) {
            return Err(RouteError::RootRouteInUse {
                domain: route.domain,
                port: route.port,
            }
            .into());
        }
        state.routes_mut(route_type).remove(id);
        state.detach_cert(&route);
        self.publish(Event::remove(route.without_key()));
        Ok(())
    }

    async fn watch(&self, route_type: RouteType) -> Result<RouteStream, RouterError> {
        let events = BroadcastStream::new(self.events.subscribe());
        let stream = events.filter_map(move |item| {
            let item = match item {
                Ok(event) => event
                    .route
                    .as_ref()
                    .is_some_and(|r| r.route_type == route_type)
                    .then_some(Ok(event)),
                Err(BroadcastStreamRecvError::Lagged(_)) => Some(Err(RouterError::TooOld)),
            };
            std::future::ready(item)
        });
        Ok(stream.boxed())
    }

    async fn private_key(&self, key_id: &str) -> Result<String, RouterError> {
        self.lock()
            .keys
            .get(key_id)
            .cloned()
            .ok_or(RouterError::NotFound)
    }

    async fn ping(&self) -> Result<(), RouterError> {
        Ok(())
    }
}
