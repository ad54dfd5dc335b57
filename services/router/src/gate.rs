//! Pausing and in-flight tracking for one service's traffic.
//!
//! While a service is paused, new requests and connections wait at the gate
//! instead of being forwarded. Callers draining a service watch for the
//! moment nothing is in flight.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

#[derive(Debug)]
pub struct ServiceGate {
    paused: watch::Sender<bool>,
    in_flight: watch::Sender<usize>,
}

impl Default for ServiceGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceGate {
    pub fn new() -> Self {
        Self {
            paused: watch::channel(false).0,
            in_flight: watch::channel(0).0,
        }
    }

    /// Pause or resume the service. Returns whether the state changed.
    pub fn set_paused(&self, paused: bool) -> bool {
        self.paused.send_replace(paused) != paused
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Requests or connections currently holding an [`InFlight`] guard.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait until the service is not paused, then count one unit of traffic
    /// until the returned guard drops.
    pub async fn enter(self: &Arc<Self>) -> InFlight {
        let mut paused = self.paused.subscribe();
        // The sender is owned by `self`, so waiting cannot fail.
        let _ = paused.wait_for(|paused| !*paused).await;
        self.in_flight.send_modify(|n| *n += 1);
        InFlight {
            gate: Arc::clone(self),
        }
    }

    /// Yields whenever nothing is in flight, immediately if idle now.
    pub fn drained(&self) -> impl Stream<Item = ()> + Send + 'static {
        WatchStream::new(self.in_flight.subscribe())
            .filter_map(|n| async move { (n == 0).then_some(()) })
    }
}

/// Guard counting one request or connection against a [`ServiceGate`].
#[derive(Debug)]
pub struct InFlight {
    gate: Arc<ServiceGate>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.gate
            .in_flight
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}
