//! Route management and event stream API.
//!
//! Routes are returned with ids in `{type}/{id}` form and never carry a
//! certificate private key.

use std::collections::HashSet;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{
        sse::{self, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, put},
    Json, Router,
};
use futures_util::{stream, StreamExt};
use gatehouse_types::{EventType, Route, RouteType};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::RouterError;
use crate::server::Gateway;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(30);
const SSE_CONTENT_TYPE: &str = "text/event-stream; charset=utf-8";

/// Build the API router.
pub fn create_router(gateway: Gateway) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/routes", get(list_routes).post(create_route).put(update_route))
        .route("/routes/{route_type}/{id}", get(get_route).delete(delete_route))
        .route("/services/{route_type}/{service}", put(pause_service))
        .route("/services/{route_type}/{service}/drain", get(stream_drain))
        .route("/events", get(stream_events))
        .with_state(gateway)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// JSON error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        let message = err.to_string();
        match err {
            RouterError::Validation(_) => Self::bad_request(message),
            RouterError::NotFound => Self::new(StatusCode::NOT_FOUND, "not_found", message),
            RouterError::Conflict(_) => Self::new(StatusCode::CONFLICT, "conflict", message),
            RouterError::NoPorts => Self::new(StatusCode::CONFLICT, "no_ports", message),
            RouterError::Closed => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
            }
            _ => {
                error!(error = %message, "api request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// =============================================================================
// Routes
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListRoutesQuery {
    pub parent_ref: Option<String>,
}

/// Route as returned by the API.
fn present(route: &Route) -> Route {
    let mut route = route.without_key();
    route.id = route.formatted_id();
    route
}

/// Accept both bare and `{type}/{id}` ids in request bodies.
fn bare_id(route: &mut Route) {
    let prefix = format!("{}/", route.route_type);
    if let Some(id) = route.id.strip_prefix(&prefix) {
        route.id = id.to_string();
    }
}

async fn ping(State(gateway): State<Gateway>) -> Result<StatusCode, ApiError> {
    gateway.store().ping().await?;
    Ok(StatusCode::OK)
}

async fn list_routes(
    State(gateway): State<Gateway>,
    Query(query): Query<ListRoutesQuery>,
) -> Result<Json<Vec<Route>>, ApiError> {
    let routes = gateway.list_routes().await?;
    let routes = routes
        .iter()
        .filter(|r| query.parent_ref.as_ref().is_none_or(|p| &r.parent_ref == p))
        .map(present)
        .collect();
    Ok(Json(routes))
}

async fn create_route(
    State(gateway): State<Gateway>,
    Json(mut route): Json<Route>,
) -> Result<Json<Route>, ApiError> {
    // Ids are assigned on create.
    route.id.clear();
    let route = gateway.add_route(route).await?;
    debug!(route_id = %route.formatted_id(), "route created");
    Ok(Json(present(&route)))
}

async fn update_route(
    State(gateway): State<Gateway>,
    Json(mut route): Json<Route>,
) -> Result<Json<Route>, ApiError> {
    bare_id(&mut route);
    if route.id.is_empty() {
        return Err(ApiError::bad_request("route id is required"));
    }
    let route = gateway.update_route(route).await?;
    Ok(Json(present(&route)))
}

fn parse_type(route_type: &str) -> Result<RouteType, ApiError> {
    route_type
        .parse()
        .map_err(|e: gatehouse_types::RouteError| ApiError::bad_request(e.to_string()))
}

async fn get_route(
    State(gateway): State<Gateway>,
    Path((route_type, id)): Path<(String, String)>,
) -> Result<Json<Route>, ApiError> {
    let route_type = parse_type(&route_type)?;
    let route = gateway.get_route(route_type, &id).await?;
    Ok(Json(present(&route)))
}

async fn delete_route(
    State(gateway): State<Gateway>,
    Path((route_type, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let route_type = parse_type(&route_type)?;
    gateway.remove_route(route_type, &id).await?;
    debug!(route_type = %route_type, route_id = %id, "route deleted");
    Ok(StatusCode::OK)
}

// =============================================================================
// Services
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    pub paused: bool,
}

/// Unknown route types are reported as missing services.
fn service_type(route_type: &str) -> Result<RouteType, ApiError> {
    route_type
        .parse()
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "not_found", "not found"))
}

async fn pause_service(
    State(gateway): State<Gateway>,
    Path((route_type, service)): Path<(String, String)>,
    Json(req): Json<PauseRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let route_type = service_type(&route_type)?;
    gateway.pause_service(route_type, &service, req.paused)?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Serialize)]
struct DrainEvent {
    event: &'static str,
}

/// Emits `drained` each time the service has nothing in flight.
async fn stream_drain(
    State(gateway): State<Gateway>,
    Path((route_type, service)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let route_type = service_type(&route_type)?;
    let gate = gateway.service_gate(route_type, &service)?;
    let events = gate
        .drained()
        .map(|()| sse::Event::default().json_data(DrainEvent { event: "drained" }));

    let sse = Sse::new(events).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE));
    Ok(([(CONTENT_TYPE, SSE_CONTENT_TYPE)], sse))
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated event types; empty means all.
    pub types: Option<String>,
}

fn parse_types(types: Option<&str>) -> Result<HashSet<EventType>, ApiError> {
    types
        .unwrap_or_default()
        .split(',')
        .filter(|name| !name.trim().is_empty())
        .map(|name| {
            EventType::parse(name)
                .ok_or_else(|| ApiError::bad_request(format!("unknown event type {name:?}")))
        })
        .collect()
}

/// Server-sent events from both listeners.
async fn stream_events(
    State(gateway): State<Gateway>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let types = parse_types(query.types.as_deref())?;
    let events = stream::select(
        gateway.http.watch().into_stream(),
        gateway.tcp.watch().into_stream(),
    )
    .filter(move |event| {
        let wanted = types.is_empty() || types.contains(&event.event);
        async move { wanted }
    })
    .map(|event| sse::Event::default().json_data(event));

    let sse = Sse::new(events).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE));
    Ok(([(CONTENT_TYPE, SSE_CONTENT_TYPE)], sse))
}
