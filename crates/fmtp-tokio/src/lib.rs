//! Tokio-based implementation of the FMTP protocol
//!
//! This crate runs the sans-IO machines of `fmtp-core` over any tokio byte
//! stream, TCP in practice.
//!
//! - [`Client`] opens connections (initiator role) and keeps one connection
//!   per remote identifier.
//! - [`Server`] accepts connections (responder role) into a client.
//! - [`Connection`] is a cheap handle to the per connection agent task,
//!   every operation takes a deadline.
//! - Received user data is passed to a [`Handler`].
//!
//! # Examples
//!
//! See the `server` binary and the `client` example for a minimal pair.

mod agent;
mod client;
mod connection;
mod handler;
mod message;
mod server;
pub mod transport;

pub use client::{Client, Dialer, ERROR_INDICATOR};
pub use connection::{Connection, Status};
pub use handler::{ConnectionEvent, Discard, Handler, HandlerFn, handler_fn};
pub use message::{Body, Message};
pub use server::Server;
