//! Load-balanced dialing and request forwarding.
//!
//! Backends are tried in shuffled order, with the sticky backend (when live)
//! moved to the front. Dial errors advance to the next backend; anything that
//! fails after a successful dial is returned to the caller unretried.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::{Request, Response};
use hyper::body::{Body, Incoming};
use hyper_util::rt::TokioIo;
use rand::seq::SliceRandom;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend_cache::BackendCache;
use crate::error::RouterError;
use crate::gate::ServiceGate;

/// Per-attempt dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// TCP keep-alive idle time on backend connections.
const KEEPALIVE: Duration = Duration::from_secs(30);

/// Shuffle `addrs`, then move `sticky` to the front if present.
pub fn order_backends(mut addrs: Vec<String>, sticky: Option<&str>) -> Vec<String> {
    addrs.shuffle(&mut rand::rng());
    if let Some(sticky) = sticky {
        if let Some(idx) = addrs.iter().position(|a| a == sticky) {
            addrs.swap(0, idx);
        }
    }
    addrs
}

/// Connect to `addr` with a timeout and TCP keep-alive.
pub async fn dial(addr: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
    let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout"));
        }
    };
    SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Forwards traffic for one route to its service's backends.
#[derive(Debug, Clone)]
pub struct Transport {
    backends: Arc<BackendCache>,
    leader_only: bool,
    dial_timeout: Duration,
}

impl Transport {
    pub fn new(backends: Arc<BackendCache>, leader_only: bool) -> Self {
        Self {
            backends,
            leader_only,
            dial_timeout: DIAL_TIMEOUT,
        }
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn gate(&self) -> &Arc<ServiceGate> {
        self.backends.gate()
    }

    /// Candidate backends in the order they will be dialed.
    pub fn ordered_backends(&self, sticky: Option<&str>) -> Vec<String> {
        let addrs = if self.leader_only {
            self.backends.leader_addrs()
        } else {
            self.backends.addrs()
        };
        order_backends(addrs, sticky)
    }

    /// Dial the first reachable backend.
    pub async fn connect(&self, sticky: Option<&str>) -> Result<(TcpStream, String), RouterError> {
        for addr in self.ordered_backends(sticky) {
            match dial(&addr, self.dial_timeout).await {
                Ok(stream) => return Ok((stream, addr)),
                Err(e) => warn!(backend = %addr, error = %e, "backend dial failed"),
            }
        }
        debug!(service = %self.backends.service(), "no backends available");
        Err(RouterError::NoBackends)
    }

    /// Send `req` to a backend and return its response headers.
    ///
    /// The response body streams from the backend connection as the caller
    /// polls it.
    pub async fn round_trip<B>(
        &self,
        req: Request<B>,
        sticky: Option<&str>,
    ) -> Result<(Response<Incoming>, String), RouterError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (stream, backend) = self.connect(sticky).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        let addr = backend.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(backend = %addr, error = %e, "backend connection error");
            }
        });
        let res = sender.send_request(req).await?;
        Ok((res, backend))
    }

    /// Like [`Transport::round_trip`], keeping the connection upgradeable.
    ///
    /// On a `101` response, `hyper::upgrade::on` yields the backend stream.
    pub async fn upgrade<B>(
        &self,
        req: Request<B>,
        sticky: Option<&str>,
    ) -> Result<(Response<Incoming>, String), RouterError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (stream, backend) = self.connect(sticky).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        let addr = backend.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(backend = %addr, error = %e, "backend upgrade connection error");
            }
        });
        let res = sender.send_request(req).await?;
        Ok((res, backend))
    }
}
