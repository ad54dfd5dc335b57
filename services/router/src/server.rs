//! The routing data plane: both listeners over one store and discovery
//! client.

use std::sync::Arc;

use gatehouse_types::{Route, RouteType};
use tracing::info;

use crate::discovery::Discovery;
use crate::error::RouterError;
use crate::gate::ServiceGate;
use crate::http::{HttpConfig, HttpListener};
use crate::store::RouteStore;
use crate::tcp::{TcpConfig, TcpListener};

/// HTTP and TCP listeners sharing a route store.
#[derive(Clone)]
pub struct Gateway {
    pub http: HttpListener,
    pub tcp: TcpListener,
    store: Arc<dyn RouteStore>,
}

impl Gateway {
    pub fn new(
        http: HttpConfig,
        tcp: TcpConfig,
        store: Arc<dyn RouteStore>,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        Self {
            http: HttpListener::new(http, Arc::clone(&store), Arc::clone(&discovery)),
            tcp: TcpListener::new(tcp, Arc::clone(&store), discovery),
            store,
        }
    }

    /// Bind every listener and load the initial routing tables.
    ///
    /// On failure, whatever was started is closed again.
    pub async fn start(&self) -> Result<(), RouterError> {
        if let Err(e) = self.http.start().await {
            self.http.close();
            return Err(e);
        }
        if let Err(e) = self.tcp.start().await {
            self.close();
            return Err(e);
        }
        info!(
            http = ?self.http.addr(),
            https = ?self.http.tls_addr(),
            "gateway started"
        );
        Ok(())
    }

    pub fn close(&self) {
        self.http.close();
        self.tcp.close();
    }

    pub fn store(&self) -> &Arc<dyn RouteStore> {
        &self.store
    }

    /// Create a route through the listener owning its type.
    pub async fn add_route(&self, route: Route) -> Result<Route, RouterError> {
        match route.route_type {
            RouteType::Http => self.http.add_route(route).await,
            RouteType::Tcp => self.tcp.add_route(route).await,
        }
    }

    pub async fn update_route(&self, route: Route) -> Result<Route, RouterError> {
        match route.route_type {
            RouteType::Http => self.http.update_route(route).await,
            RouteType::Tcp => self.tcp.update_route(route).await,
        }
    }

    pub async fn get_route(&self, route_type: RouteType, id: &str) -> Result<Route, RouterError> {
        match route_type {
            RouteType::Http => self.http.get(id).await,
            RouteType::Tcp => self.tcp.get(id).await,
        }
    }

    pub async fn remove_route(&self, route_type: RouteType, id: &str) -> Result<(), RouterError> {
        match route_type {
            RouteType::Http => self.http.remove_route(id).await,
            RouteType::Tcp => self.tcp.remove_route(id).await,
        }
    }

    /// Pause or resume traffic to a service of one route type.
    pub fn pause_service(
        &self,
        route_type: RouteType,
        service: &str,
        paused: bool,
    ) -> Result<(), RouterError> {
        match route_type {
            RouteType::Http => self.http.pause_service(service, paused),
            RouteType::Tcp => self.tcp.pause_service(service, paused),
        }
    }

    pub fn service_gate(
        &self,
        route_type: RouteType,
        service: &str,
    ) -> Result<Arc<ServiceGate>, RouterError> {
        match route_type {
            RouteType::Http => self.http.service_gate(service),
            RouteType::Tcp => self.tcp.service_gate(service),
        }
    }

    /// Routes of both types, newest first, without private keys.
    pub async fn list_routes(&self) -> Result<Vec<Route>, RouterError> {
        let mut routes = self.http.list().await?;
        routes.extend(self.tcp.list().await?.iter().map(Route::without_key));
        routes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(routes)
    }
}
