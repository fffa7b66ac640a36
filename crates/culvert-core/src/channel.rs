//! One bidirectional control channel over a WebSocket connection.
//!
//! The underlying transport forbids concurrent writes, so the endpoint owns
//! the write half behind a mutex covering exactly one frame per lock. The
//! read half has a single owner (the reader task) and needs no lock.

use crate::error::{TunnelError, TunnelResult};
use crate::protocol::Envelope;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

type FrameSink = Box<dyn Sink<Message, Error = tungstenite::Error> + Send + Unpin>;
type FrameSource = Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send + Unpin>;

/// Write half of a control channel plus its identity.
///
/// Cheap to share between tasks; every sender serializes on the internal
/// write lock. Closing is idempotent and safe to race with the reader.
pub struct ChannelEndpoint {
    domain: String,
    tunnel_id: String,
    writer: Mutex<FrameSink>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("domain", &self.domain)
            .field("tunnel_id", &self.tunnel_id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Read half of a control channel. Single owner; not cloneable.
pub struct ChannelReceiver {
    frames: FrameSource,
}

impl std::fmt::Debug for ChannelReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReceiver").finish_non_exhaustive()
    }
}

impl ChannelEndpoint {
    /// Split a WebSocket stream into a shared endpoint and its receiver.
    pub fn split<S>(
        domain: impl Into<String>,
        tunnel_id: impl Into<String>,
        ws: WebSocketStream<S>,
    ) -> (Arc<Self>, ChannelReceiver)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let endpoint = Arc::new(Self {
            domain: domain.into(),
            tunnel_id: tunnel_id.into(),
            writer: Mutex::new(Box::new(sink)),
            closed: AtomicBool::new(false),
        });
        let receiver = ChannelReceiver {
            frames: Box::new(stream),
        };
        (endpoint, receiver)
    }

    /// The public hostname this channel serves.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The server-minted tunnel id for this channel instance.
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// Write one frame. Does not close the channel on failure; the owning
    /// multiplexer or dispatcher decides when to tear down.
    pub async fn send(&self, envelope: &Envelope) -> TunnelResult<()> {
        let text = envelope.to_json()?;
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::text(text))
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))
    }

    /// Send a graceful close frame and release the write half. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "tunnel closed".into(),
        };
        let _ = writer.send(Message::Close(Some(frame))).await;
        let _ = writer.close().await;
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ChannelReceiver {
    /// Block until one envelope is available.
    ///
    /// Returns `Ok(None)` once the peer closes. Frames that are not valid
    /// envelopes surface as [`TunnelError::InvalidFrame`] and leave the
    /// channel readable, so callers can log and drop them; transport errors
    /// are passed through verbatim and are terminal.
    pub async fn next_envelope(&mut self) -> TunnelResult<Option<Envelope>> {
        loop {
            match self.frames.next().await {
                Some(Ok(Message::Text(text))) => return Envelope::from_json(&text).map(Some),
                Some(Ok(Message::Binary(_))) => {
                    return Err(TunnelError::InvalidFrame(
                        "unexpected binary frame".into(),
                    ))
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Transport-level ping/pong is answered by the library.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TunnelError::Transport(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorPayload, MsgType};
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    #[tokio::test]
    async fn concurrent_senders_produce_intact_frames() {
        let (server, client) = ws_pair().await;
        let (endpoint, _receiver) = ChannelEndpoint::split("dev.example.com", "t1", server);
        let (_peer, mut peer_rx) = ChannelEndpoint::split("dev.example.com", "t1", client);

        let mut handles = Vec::new();
        for i in 0..16 {
            let endpoint = endpoint.clone();
            handles.push(tokio::spawn(async move {
                let payload = ErrorPayload {
                    code: format!("CODE_{i}"),
                    message: "x".repeat(512),
                };
                endpoint
                    .send(&Envelope::encode(MsgType::Error, &payload).unwrap())
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for _ in 0..16 {
            let envelope = peer_rx.next_envelope().await.unwrap().unwrap();
            assert_eq!(envelope.msg_type, MsgType::Error);
            let payload: ErrorPayload = envelope.decode(MsgType::Error).unwrap();
            assert!(payload.code.starts_with("CODE_"));
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_visible_to_peer() {
        let (server, client) = ws_pair().await;
        let (endpoint, _rx) = ChannelEndpoint::split("dev.example.com", "t1", server);
        let (_peer, mut peer_rx) = ChannelEndpoint::split("dev.example.com", "t1", client);

        endpoint.close().await;
        endpoint.close().await;
        assert!(endpoint.is_closed());

        assert!(peer_rx.next_envelope().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_frame_is_recoverable() {
        let (server, mut client) = ws_pair().await;
        let (_endpoint, mut receiver) = ChannelEndpoint::split("dev.example.com", "t1", server);

        client.send(Message::text("not json")).await.unwrap();
        client
            .send(Message::text(
                Envelope::bare(MsgType::Ping).to_json().unwrap(),
            ))
            .await
            .unwrap();

        match receiver.next_envelope().await {
            Err(TunnelError::InvalidFrame(_)) => {}
            other => panic!("expected invalid frame, got {other:?}"),
        }
        let envelope = receiver.next_envelope().await.unwrap().unwrap();
        assert_eq!(envelope.msg_type, MsgType::Ping);
    }

    #[tokio::test]
    async fn accessors_expose_identity() {
        let (server, _client) = ws_pair().await;
        let (endpoint, _rx) = ChannelEndpoint::split("dev.example.com", "abc123", server);
        assert_eq!(endpoint.domain(), "dev.example.com");
        assert_eq!(endpoint.tunnel_id(), "abc123");
    }
}
