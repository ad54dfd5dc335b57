//! HTTP and HTTPS listener.
//!
//! Requests are matched by `(host, port)` then by longest path prefix, and
//! forwarded through the route's [`Transport`]. Port 0 routes are served on
//! the default plain and TLS addresses; routes with an explicit port get a
//! dedicated plain listener that lives as long as a route references it.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use http::header::{CONNECTION, HOST, SET_COOKIE};
use http::uri::Authority;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::sign::CertifiedKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use gatehouse_types::{is_valid_path, Event, Route, RouteError, RouteType};

use crate::backend_cache::{BackendCache, ServiceRefs};
use crate::cookie::CookieKey;
use crate::discovery::Discovery;
use crate::error::RouterError;
use crate::gate::{InFlight, ServiceGate};
use crate::path_tree::PathTree;
use crate::proxy::{
    empty, is_upgrade, prepare_request, prepare_response, proxy_bidirectional, text_response,
    ErrorPage, Forwarded, ProxyBody, Transport,
};
use crate::store::RouteStore;
use crate::sync::{SyncHandler, Syncer};
use crate::tls::{route_certified_key, server_config, wildcard_candidates, CertResolver};
use crate::watch::{Subscription, WatchManager, DEFAULT_WATCH_BUFFER};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for an [`HttpListener`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Plain HTTP address.
    pub addr: SocketAddr,
    /// HTTPS address (SNI certificate selection).
    pub tls_addr: SocketAddr,
    /// Served when no route certificate matches the SNI name.
    pub default_cert: Option<Arc<CertifiedKey>>,
    pub cookie_key: CookieKey,
    pub error_page: ErrorPage,
}

/// One route in the table, with the handles its requests need.
#[derive(Debug)]
struct HttpRoute {
    route: Route,
    transport: Transport,
    cert: Option<Arc<CertifiedKey>>,
}

#[derive(Debug)]
struct PortListener {
    addr: SocketAddr,
    cancel: CancellationToken,
    refs: usize,
}

#[derive(Debug, Default)]
struct HttpState {
    closed: bool,
    routes: HashMap<String, Arc<HttpRoute>>,
    services: ServiceRefs,
    domains: HashMap<(String, i32), PathTree<Arc<HttpRoute>>>,
    ports: HashMap<i32, PortListener>,
}

impl HttpState {
    /// Drop `entry`'s references to trees, services and ports.
    fn unlink(&mut self, entry: &HttpRoute, certs: &CertResolver) {
        let route = &entry.route;
        let key = (route.domain.clone(), route.port);
        if let Some(tree) = self.domains.get_mut(&key) {
            tree.remove(&route.path);
            if tree.is_empty() {
                self.domains.remove(&key);
            }
        }

        self.services.release(&route.service);

        if route.port != 0 {
            if let Some(port) = self.ports.get_mut(&route.port) {
                port.refs -= 1;
                if port.refs == 0 {
                    if let Some(port) = self.ports.remove(&route.port) {
                        info!(addr = %port.addr, "closing route port listener");
                        port.cancel.cancel();
                    }
                }
            }
        }

        if entry.cert.is_some() {
            self.refresh_cert(&route.domain, certs);
        }
    }

    /// Point the SNI entry for `domain` at a remaining route's certificate.
    fn refresh_cert(&self, domain: &str, certs: &CertResolver) {
        let remaining = self
            .routes
            .values()
            .filter(|r| r.route.domain == domain)
            .find_map(|r| r.cert.clone());
        match remaining {
            Some(key) => certs.insert(domain, key),
            None => certs.remove(domain),
        }
    }
}

/// Facts about the accepted connection a request arrived on.
#[derive(Debug, Clone, Copy)]
struct ConnInfo {
    proto: &'static str,
    listen_port: u16,
    route_port: i32,
    peer: SocketAddr,
}

struct HttpInner {
    config: HttpConfig,
    store: Arc<dyn RouteStore>,
    discovery: Arc<dyn Discovery>,
    events: Arc<WatchManager>,
    certs: Arc<CertResolver>,
    state: RwLock<HttpState>,
    addrs: OnceLock<(SocketAddr, SocketAddr)>,
    cancel: CancellationToken,
}

/// HTTP/HTTPS listener synchronized from a route store.
#[derive(Clone)]
pub struct HttpListener {
    inner: Arc<HttpInner>,
}

impl HttpListener {
    pub fn new(
        config: HttpConfig,
        store: Arc<dyn RouteStore>,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        let certs = Arc::new(CertResolver::new(config.default_cert.clone()));
        Self {
            inner: Arc::new(HttpInner {
                config,
                store,
                discovery,
                events: WatchManager::new(),
                certs,
                state: RwLock::new(HttpState::default()),
                addrs: OnceLock::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Bind the plain and TLS sockets and load the initial routing table.
    ///
    /// Returns once both sockets accept and every stored route is applied.
    pub async fn start(&self) -> Result<(), RouterError> {
        let inner = &self.inner;
        let tls = server_config(Arc::clone(&inner.certs))?;
        let plain = TcpListener::bind(inner.config.addr).await?;
        let secure = TcpListener::bind(inner.config.tls_addr).await?;
        let addrs = (plain.local_addr()?, secure.local_addr()?);
        if inner.addrs.set(addrs).is_err() {
            return Err(RouterError::Config("listener already started".to_string()));
        }
        info!(addr = %addrs.0, tls_addr = %addrs.1, "http listener started");

        let cancel = inner.cancel.child_token();
        tokio::spawn(accept_loop(Arc::clone(inner), plain, None, 0, cancel.clone()));
        tokio::spawn(accept_loop(
            Arc::clone(inner),
            secure,
            Some(TlsAcceptor::from(tls)),
            0,
            cancel,
        ));

        let syncer = Syncer::new(Arc::clone(&inner.store), RouteType::Http);
        let stream = syncer.connect(self).await?;
        syncer.spawn(Arc::new(self.clone()), stream, inner.cancel.child_token());
        Ok(())
    }

    /// Plain HTTP address, once started.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.inner.addrs.get().map(|a| a.0)
    }

    /// HTTPS address, once started.
    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.inner.addrs.get().map(|a| a.1)
    }

    /// Address of the listener serving routes on `port`, if open.
    pub fn port_addr(&self, port: i32) -> Option<SocketAddr> {
        self.inner.read().ports.get(&port).map(|p| p.addr)
    }

    /// Stop accepting, stop syncing and release every backend cache.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.write();
        state.closed = true;
        state.services.close_all();
        for (_, port) in state.ports.drain() {
            port.cancel.cancel();
        }
        state.domains.clear();
        state.routes.clear();
        info!("http listener closed");
    }

    /// Event publisher for this listener's route and backend changes.
    pub fn events(&self) -> &Arc<WatchManager> {
        &self.inner.events
    }

    pub fn watch(&self) -> Subscription {
        self.inner.events.watch(DEFAULT_WATCH_BUFFER)
    }

    pub async fn add_route(&self, route: Route) -> Result<Route, RouterError> {
        route.expect_type(RouteType::Http)?;
        self.inner.store.add(route).await
    }

    pub async fn update_route(&self, route: Route) -> Result<Route, RouterError> {
        route.expect_type(RouteType::Http)?;
        self.inner.store.update(route).await
    }

    pub async fn remove_route(&self, id: &str) -> Result<(), RouterError> {
        self.inner.store.remove(RouteType::Http, id).await
    }

    pub async fn get(&self, id: &str) -> Result<Route, RouterError> {
        self.inner.store.get(RouteType::Http, id).await
    }

    pub async fn list(&self) -> Result<Vec<Route>, RouterError> {
        let routes = self.inner.store.list(RouteType::Http).await?;
        Ok(routes.iter().map(Route::without_key).collect())
    }

    /// Traffic gate of a service routed by this listener.
    pub fn service_gate(&self, service: &str) -> Result<Arc<ServiceGate>, RouterError> {
        let cache = self.inner.read().services.get(service).ok_or(RouterError::NotFound)?;
        Ok(Arc::clone(cache.gate()))
    }

    /// Hold new http traffic for `service` until resumed.
    pub fn pause_service(&self, service: &str, paused: bool) -> Result<(), RouterError> {
        if self.service_gate(service)?.set_paused(paused) {
            info!(service = %service, paused, "http service pause changed");
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

    async fn bind_port(&self, port: i32) -> Result<Option<TcpListener>, RouterError> {
        if port == 0 || self.inner.read().ports.contains_key(&port) {
            return Ok(None);
        }
        let port = u16::try_from(port).map_err(|_| RouteError::InvalidPort(port))?;
        let ip = self.inner.config.addr.ip();
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        Ok(Some(listener))
    }
}

#[async_trait]
impl SyncHandler for HttpListener {
    async fn set(&self, route: Route) -> Result<(), RouterError> {
        if self.inner.read().closed {
            return Err(RouterError::Closed);
        }
        route.expect_type(RouteType::Http)?;
        if route.domain.is_empty() {
            return Err(RouteError::InvalidDomain(route.domain).into());
        }
        if !is_valid_path(&route.path) {
            return Err(RouteError::InvalidPath(route.path).into());
        }
        let cert = route
            .certificate
            .as_ref()
            .map(route_certified_key)
            .transpose()?;
        let cache = self.service_cache(&route.service).await?;
        let port_listener = self.bind_port(route.port).await?;

        {
            let mut state = self.inner.write();
            if state.closed {
                return Err(RouterError::Closed);
            }

            // Take the new references before releasing the old ones so a
            // shared service or port is never torn down in between.
            if route.port != 0 {
                let port = match state.ports.entry(route.port) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let Some(listener) = port_listener else {
                            return Err(RouterError::Io(std::io::Error::other(
                                "route port listener missing",
                            )));
                        };
                        let addr = listener.local_addr()?;
                        let cancel = self.inner.cancel.child_token();
                        info!(addr = %addr, "opening route port listener");
                        tokio::spawn(accept_loop(
                            Arc::clone(&self.inner),
                            listener,
                            None,
                            route.port,
                            cancel.clone(),
                        ));
                        entry.insert(PortListener {
                            addr,
                            cancel,
                            refs: 0,
                        })
                    }
                };
                port.refs += 1;
            }

            let cache = state.services.acquire(&route.service, cache);

            if let Some(previous) = state.routes.remove(&route.id) {
                state.unlink(&previous, &self.inner.certs);
            }

            let entry = Arc::new(HttpRoute {
                transport: Transport::new(cache, route.leader),
                cert: cert.clone(),
                route: route.clone(),
            });
            state
                .domains
                .entry((route.domain.clone(), route.port))
                .or_default()
                .insert(&route.path, Arc::clone(&entry));
            state.routes.insert(route.id.clone(), entry);
            if let Some(key) = cert {
                self.inner.certs.insert(&route.domain, key);
            }
        }

        debug!(route_id = %route.id, domain = %route.domain, path = %route.path, service = %route.service, "http route set");
        self.inner.events.send(Event::set(route.without_key())).await;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RouterError> {
        let removed = {
            let mut state = self.inner.write();
            if state.closed {
                return Err(RouterError::Closed);
            }
            let entry = state.routes.remove(id).ok_or(RouterError::NotFound)?;
            state.unlink(&entry, &self.inner.certs);
            entry
        };
        debug!(route_id = %id, domain = %removed.route.domain, "http route removed");
        self.inner
            .events
            .send(Event::remove(removed.route.without_key()))
            .await;
        Ok(())
    }

    fn current(&self) -> HashSet<String> {
        self.inner.read().routes.keys().cloned().collect()
    }
}

impl HttpInner {
    fn read(&self) -> RwLockReadGuard<'_, HttpState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HttpState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route for a normalized host on a listener port, by longest path
    /// prefix.
    fn find(&self, host: &str, port: i32, path: &str) -> Option<Arc<HttpRoute>> {
        let state = self.read();
        let tree = state.domains.get(&(host.to_string(), port)).or_else(|| {
            wildcard_candidates(host).find_map(|name| state.domains.get(&(name, port)))
        })?;
        tree.lookup(path).cloned()
    }

    async fn handle(&self, req: Request<Incoming>, conn: ConnInfo) -> Response<ProxyBody> {
        let entry = request_host(&req)
            .and_then(|host| self.find(&host, conn.route_port, req.uri().path()));
        let Some(entry) = entry.filter(|e| !e.route.disabled) else {
            return text_response(StatusCode::NOT_FOUND, "Not Found\n");
        };

        let forwarded = Forwarded {
            proto: conn.proto,
            port: conn.listen_port,
            client_ip: conn.peer.ip(),
        };
        let sticky = if entry.route.sticky {
            self.config.cookie_key.sticky_backend(req.headers())
        } else {
            None
        };

        let in_flight = entry.transport.gate().enter().await;
        if is_upgrade(req.headers()) {
            return self
                .upgrade(&entry, req, &forwarded, sticky.as_deref(), in_flight)
                .await;
        }

        let req = prepare_request(req, &forwarded);
        match entry.transport.round_trip(req, sticky.as_deref()).await {
            Ok((mut res, backend)) => {
                prepare_response(&mut res);
                let mut res = res.map(|body| hold_body(body, in_flight));
                if entry.route.sticky && sticky.as_deref() != Some(backend.as_str()) {
                    if let Some(cookie) = self.config.cookie_key.sticky_cookie(&backend) {
                        res.headers_mut().append(SET_COOKIE, cookie);
                    }
                }
                res
            }
            Err(e) => self.fail(&entry.route, e),
        }
    }

    /// Forward an upgrade request; on `101` bridge both connections.
    async fn upgrade(
        &self,
        entry: &HttpRoute,
        mut req: Request<Incoming>,
        forwarded: &Forwarded,
        sticky: Option<&str>,
        in_flight: InFlight,
    ) -> Response<ProxyBody> {
        let client = hyper::upgrade::on(&mut req);
        let req = prepare_request(req, forwarded);
        let (mut res, backend) = match entry.transport.upgrade(req, sticky).await {
            Ok(ok) => ok,
            Err(e) => return self.fail(&entry.route, e),
        };
        prepare_response(&mut res);

        if res.status() != StatusCode::SWITCHING_PROTOCOLS {
            res.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
            return res.map(|body| hold_body(body, in_flight));
        }

        let upstream = hyper::upgrade::on(&mut res);
        tokio::spawn(
            async move {
                let _in_flight = in_flight;
                match tokio::try_join!(client, upstream) {
                    Ok((client, upstream)) => {
                        match proxy_bidirectional(TokioIo::new(client), TokioIo::new(upstream))
                            .await
                        {
                            Ok((sent, received)) => {
                                debug!(sent, received, "upgraded connection closed")
                            }
                            Err(e) => debug!(error = %e, "upgraded connection failed"),
                        }
                    }
                    Err(e) => debug!(error = %e, "upgrade failed"),
                }
            }
            .instrument(tracing::debug_span!("upgrade", backend = %backend)),
        );
        let (parts, _) = res.into_parts();
        Response::from_parts(parts, empty())
    }

    fn fail(&self, route: &Route, err: RouterError) -> Response<ProxyBody> {
        match err {
            RouterError::NoBackends => {
                debug!(route_id = %route.id, service = %route.service, "no backends available");
                self.config.error_page.service_unavailable()
            }
            e => {
                warn!(route_id = %route.id, service = %route.service, error = %e, "upstream request failed");
                self.config.error_page.upstream_failed()
            }
        }
    }
}

/// Count the request as in flight until its response body is dropped.
fn hold_body(body: Incoming, in_flight: InFlight) -> ProxyBody {
    body.map_err(move |e| {
        let _ = &in_flight;
        e
    })
    .boxed()
}

/// Lowercased request host without any port.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())?;
    let host = match raw.parse::<Authority>() {
        Ok(authority) => authority.host().to_string(),
        Err(_) => raw.to_string(),
    };
    Some(host.trim_end_matches('.').to_ascii_lowercase())
}

async fn accept_loop(
    inner: Arc<HttpInner>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    route_port: i32,
    cancel: CancellationToken,
) {
    let listen_port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    let proto = if tls.is_some() { "https" } else { "http" };
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(port = listen_port, error = %e, "accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let conn = ConnInfo {
            proto,
            listen_port,
            route_port,
            peer,
        };
        let span = tracing::info_span!("connection", peer = %peer, proto);
        tokio::spawn(
            handle_connection(Arc::clone(&inner), stream, tls.clone(), conn, cancel.clone())
                .instrument(span),
        );
    }
}

async fn handle_connection(
    inner: Arc<HttpInner>,
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
    conn: ConnInfo,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    match tls {
        Some(acceptor) => {
            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => serve_connection(inner, stream, conn, cancel).await,
                Ok(Err(e)) => debug!(error = %e, "tls handshake failed"),
                Err(_) => debug!("tls handshake timed out"),
            }
        }
        None => serve_connection(inner, stream, conn, cancel).await,
    }
}

async fn serve_connection<I>(inner: Arc<HttpInner>, io: I, conn: ConnInfo, cancel: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let inner = Arc::clone(&inner);
        async move { Ok::<_, Infallible>(inner.handle(req, conn).await) }
    });
    let connection = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades();
    tokio::select! {
        result = connection => {
            if let Err(e) = result {
                debug!(error = %e, "connection error");
            }
        }
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_host() {
        let req = Request::get("/").header(HOST, "Example.COM:8080").body(()).unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("example.com"));

        let req = Request::get("http://a.example./x").body(()).unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("a.example"));

        let req = Request::get("/").header(HOST, "[::1]:80").body(()).unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("[::1]"));

        let req = Request::get("/").body(()).unwrap();
        assert_eq!(request_host(&req), None);
    }
}
