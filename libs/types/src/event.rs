//! Route and backend change events.

use serde::{Deserialize, Serialize};

use crate::Route;

/// Kind of change an [`Event`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    /// A route was created or updated.
    Set,
    /// A route was deleted.
    Remove,
    /// A backend joined a service in use by a route.
    BackendUp,
    /// A backend left a service in use by a route.
    BackendDown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Set => "set",
            EventType::Remove => "remove",
            EventType::BackendUp => "backend-up",
            EventType::BackendDown => "backend-down",
        }
    }

    /// Parse a single name as used in `?types=` filters.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "set" => Some(EventType::Set),
            "remove" => Some(EventType::Remove),
            "backend-up" => Some(EventType::BackendUp),
            "backend-down" => Some(EventType::BackendDown),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub service: String,
    pub addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_id: String,
}

/// A change published by a listener.
///
/// `set` and `remove` carry the route (for `remove`, at least its id and
/// type); backend events carry the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event: EventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn set(route: Route) -> Self {
        Event::route(EventType::Set, route)
    }

    pub fn remove(route: Route) -> Self {
        Event::route(EventType::Remove, route)
    }

    fn route(event: EventType, route: Route) -> Self {
        Event {
            event,
            route: Some(route),
            backend: None,
            error: None,
        }
    }

    pub fn backend(event: EventType, backend: Backend) -> Self {
        Event {
            event,
            route: None,
            backend: Some(backend),
            error: None,
        }
    }

    /// Id of the route this event refers to, if any.
    pub fn route_id(&self) -> Option<&str> {
        self.route.as_ref().map(|r| r.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_serialization() {
        assert_eq!(
            serde_json::to_string(&EventType::BackendUp).unwrap(),
            "\"backend-up\""
        );
        assert_eq!(serde_json::to_string(&EventType::Set).unwrap(), "\"set\"");
        assert_eq!(EventType::parse(" remove"), Some(EventType::Remove));
        assert_eq!(EventType::parse("backend-drained"), None);
    }

    #[test]
    fn test_event_omits_empty_fields() {
        let mut route = Route::http("a.example", "web");
        route.id = "r1".to_string();
        let json = serde_json::to_value(Event::set(route)).unwrap();
        assert_eq!(json["event"], "set");
        assert_eq!(json["route"]["id"], "r1");
        assert!(json.get("backend").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_backend_event() {
        let event = Event::backend(
            EventType::BackendDown,
            Backend {
                service: "web".to_string(),
                addr: "10.0.0.1:80".to_string(),
                job_id: String::new(),
            },
        );
        assert_eq!(event.route_id(), None);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"event":"backend-down","backend":{"service":"web","addr":"10.0.0.1:80"}}"#
        );
    }
}
