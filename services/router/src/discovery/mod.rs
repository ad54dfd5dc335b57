//! Service discovery.
//!
//! A [`Discovery`] implementation streams membership changes for one service.
//! Each new stream starts with the service's current instances as `up`
//! events followed by a single `current` marker, then live changes.

mod discoverd;
mod local;

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::RouterError;

pub use discoverd::DiscoverdClient;
pub use local::StaticDiscovery;

/// Stream of discovery events for one service.
pub type ServiceStream = BoxStream<'static, Result<ServiceEvent, RouterError>>;

/// Source of service membership.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Subscribe to `service`. The stream ends when the subscription drops.
    async fn watch(&self, service: &str) -> Result<ServiceStream, RouterError>;
}

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Up,
    Update,
    Down,
    Leader,
    Current,
    #[serde(other)]
    Unknown,
}

/// A registered service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub addr: String,
    #[serde(default)]
    pub proto: String,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl Instance {
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self {
            id: addr.clone(),
            addr,
            proto: "tcp".to_string(),
            meta: HashMap::new(),
        }
    }

    /// Scheduler job id, when the instance carries one.
    pub fn job_id(&self) -> &str {
        self.meta.get("JOB_ID").map(String::as_str).unwrap_or_default()
    }
}

/// One discovery event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    #[serde(default)]
    pub service: String,
    pub kind: EventKind,
    #[serde(default)]
    pub instance: Option<Instance>,
}

impl ServiceEvent {
    pub fn new(service: &str, kind: EventKind, instance: Option<Instance>) -> Self {
        Self {
            service: service.to_string(),
            kind,
            instance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_parsing() {
        let event: ServiceEvent = serde_json::from_str(
            r#"{"service":"web","kind":"up","instance":{"id":"i1","addr":"10.0.0.1:80","proto":"http","meta":{"JOB_ID":"host-job"}}}"#,
        )
        .unwrap();
        assert_eq!(event.kind, EventKind::Up);
        let instance = event.instance.unwrap();
        assert_eq!(instance.addr, "10.0.0.1:80");
        assert_eq!(instance.job_id(), "host-job");

        let current: ServiceEvent =
            serde_json::from_str(r#"{"service":"web","kind":"current"}"#).unwrap();
        assert_eq!(current.kind, EventKind::Current);
        assert!(current.instance.is_none());

        let meta: ServiceEvent =
            serde_json::from_str(r#"{"service":"web","kind":"service_meta"}"#).unwrap();
        assert_eq!(meta.kind, EventKind::Unknown);
    }
}
