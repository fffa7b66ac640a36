//! culvert-client: the client side of the culvert HTTP tunnel.
//!
//! Connects to the server's control channel, registers a public domain, and
//! relays framed requests to an HTTP application on loopback.

pub mod dispatcher;
pub mod proxy;

pub use dispatcher::TunnelClient;
