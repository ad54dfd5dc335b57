//! # gatehouse-types
//!
//! Wire types shared by the gatehouse router and its clients.
//!
//! ## Routes
//!
//! A [`Route`] is a single struct with a [`RouteType`] discriminant. HTTP
//! routes match on `(domain, port, path)`; TCP routes match on a listen port.
//! Both forward to a named service whose backends come from discovery.
//!
//! Normalization ([`Route::normalize`]) happens at the store boundary; the
//! router's lookup code assumes normalized input.
//!
//! ## Events
//!
//! Route and backend changes are published as [`Event`]s with the JSON shape
//! `{event, route?, backend?, error?}`.

mod certificate;
mod error;
mod event;
mod route;

pub use certificate::*;
pub use error::RouteError;
pub use event::*;
pub use route::*;
