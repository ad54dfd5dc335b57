//! Route stores: the authoritative source of the routing table.
//!
//! Listeners never persist routes themselves. They list and watch a
//! [`RouteStore`] through the syncer and mutate it only on behalf of API
//! callers.

mod memory;
mod postgres;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use gatehouse_types::{Event, Route, RouteType};

use crate::error::RouterError;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Change events for one route type. `set` and `remove` only.
///
/// Certificates in `set` events carry no private key; fetch it with
/// [`RouteStore::private_key`].
pub type RouteStream = BoxStream<'static, Result<Event, RouterError>>;

#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Create a route, assigning an id when it has none.
    async fn add(&self, route: Route) -> Result<Route, RouterError>;

    /// Update a route's mutable fields.
    async fn update(&self, route: Route) -> Result<Route, RouterError>;

    async fn get(&self, route_type: RouteType, id: &str) -> Result<Route, RouterError>;

    /// Every live route of `route_type`, keys included.
    async fn list(&self, route_type: RouteType) -> Result<Vec<Route>, RouterError>;

    async fn remove(&self, route_type: RouteType, id: &str) -> Result<(), RouterError>;

    /// Subscribe to changes made after this call returns.
    async fn watch(&self, route_type: RouteType) -> Result<RouteStream, RouterError>;

    /// PEM private key for a certificate's `key_id`.
    async fn private_key(&self, key_id: &str) -> Result<String, RouterError>;

    async fn ping(&self) -> Result<(), RouterError>;
}
