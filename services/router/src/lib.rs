//! gatehouse router library.
//!
//! The crate ships the `router` binary; the library surface exists for
//! integration testing and reuse.

pub mod api;
pub mod backend_cache;
pub mod config;
pub mod cookie;
pub mod discovery;
pub mod error;
pub mod gate;
pub mod http;
pub mod path_tree;
pub mod proxy;
pub mod server;
pub mod store;
pub mod sync;
pub mod tcp;
pub mod tls;
pub mod watch;

pub use error::RouterError;
pub use http::{HttpConfig, HttpListener};
pub use server::Gateway;
pub use tcp::{TcpConfig, TcpListener};
