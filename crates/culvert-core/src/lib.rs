//! culvert-core: Shared protocol library for the culvert HTTP tunnel.
//!
//! Provides the framed JSON control-channel protocol (envelope + typed
//! payloads), the channel endpoint wrapping one WebSocket connection with
//! serialized writes, header forwarding utilities, and the shared error type.

pub mod channel;
pub mod error;
pub mod headers;
pub mod protocol;

// Re-export commonly used items at crate root.
pub use channel::{ChannelEndpoint, ChannelReceiver};
pub use error::{TunnelError, TunnelResult};
pub use headers::{forwardable_headers, Headers};
pub use protocol::{
    mint_request_id, mint_tunnel_id, Envelope, ErrorPayload, HttpRequestPayload,
    HttpResponsePayload, MsgType, RegisterPayload, RegisteredPayload, PROTOCOL_VERSION,
};
