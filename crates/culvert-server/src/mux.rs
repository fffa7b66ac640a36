//! Tunnel multiplexer: channel lifecycle, response correlation, and public
//! request forwarding.
//!
//! Each accepted channel gets exactly one reader task. Forwarded requests
//! wait on a one-shot slot guarded by a deadline; the reader never blocks on
//! a particular request. The pending table's remove-under-lock is the atomic
//! load-and-delete that keeps delivery and expiry mutually exclusive.

use crate::registry::{TunnelEntry, TunnelRegistry};
use culvert_core::{
    mint_tunnel_id, ChannelEndpoint, ChannelReceiver, Envelope, ErrorPayload, HttpRequestPayload,
    HttpResponsePayload, MsgType, RegisterPayload, TunnelError, PROTOCOL_VERSION,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Outcome of [`TunnelMux::forward`] when no response was produced.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no tunnel registered for domain: {0}")]
    NoTunnel(String),

    #[error("failed to send request to tunnel: {0}")]
    SendFailed(TunnelError),

    #[error("timeout waiting for response")]
    Timeout,
}

/// Server-side tunnel multiplexer.
pub struct TunnelMux {
    registry: Arc<TunnelRegistry>,
    pending: Mutex<HashMap<String, oneshot::Sender<HttpResponsePayload>>>,
    request_timeout: Duration,
}

impl TunnelMux {
    pub fn new(registry: Arc<TunnelRegistry>, request_timeout: Duration) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
            request_timeout,
        }
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// Drive one incoming control channel from first frame to teardown.
    ///
    /// The channel must open with `register` at a matching protocol version;
    /// anything else is answered with an `error` frame and closed. After a
    /// successful registration the channel serves until the peer disconnects,
    /// at which point the domain is released. In-flight forwarded requests
    /// are deliberately left to their own deadlines.
    pub async fn handle_channel<S>(&self, mut ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // AwaitRegister: exactly one frame decides acceptance.
        let first = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(Message::Binary(_))) => {
                    reject(&mut ws, "INVALID_MESSAGE", "Expected registration message").await;
                    return;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "channel failed before registration");
                    return;
                }
            }
        };

        let envelope = match Envelope::from_json(&first) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "malformed registration frame");
                reject(&mut ws, "INVALID_MESSAGE", "Expected registration message").await;
                return;
            }
        };

        if envelope.msg_type != MsgType::Register {
            warn!(msg_type = %envelope.msg_type, "expected register as first frame");
            reject(&mut ws, "INVALID_MESSAGE", "Expected registration message").await;
            return;
        }

        let register: RegisterPayload = match envelope.decode(MsgType::Register) {
            Ok(register) => register,
            Err(e) => {
                warn!(error = %e, "undecodable register payload");
                reject(&mut ws, "DECODE_ERROR", &e.to_string()).await;
                return;
            }
        };

        if register.protocol_version != PROTOCOL_VERSION {
            warn!(
                domain = %register.domain,
                version = %register.protocol_version,
                "unsupported protocol version"
            );
            reject(
                &mut ws,
                "INVALID_MESSAGE",
                &format!("unsupported protocol version: {}", register.protocol_version),
            )
            .await;
            return;
        }

        // Registering: mint the identity, claim the domain.
        let domain = register.domain;
        let tunnel_id = mint_tunnel_id();
        let (endpoint, mut receiver) = ChannelEndpoint::split(domain.clone(), tunnel_id.clone(), ws);

        let entry = TunnelEntry {
            domain: domain.clone(),
            tunnel_id: tunnel_id.clone(),
            endpoint: endpoint.clone(),
        };
        if let Err(e) = self.registry.register(entry).await {
            let error = ErrorPayload {
                code: "REGISTRATION_FAILED".into(),
                message: e.to_string(),
            };
            if let Ok(envelope) = Envelope::encode(MsgType::Error, &error) {
                let _ = endpoint.send(&envelope).await;
            }
            endpoint.close().await;
            return;
        }

        let registered = culvert_core::RegisteredPayload {
            tunnel_id: tunnel_id.clone(),
            server_url: format!("https://{domain}"),
        };
        let confirmed = match Envelope::encode(MsgType::Registered, &registered) {
            Ok(envelope) => endpoint.send(&envelope).await,
            Err(e) => Err(e),
        };
        if let Err(e) = confirmed {
            warn!(domain = %domain, error = %e, "failed to confirm registration");
            self.registry.unregister(&domain).await;
            endpoint.close().await;
            return;
        }

        // Serving.
        self.serve(&endpoint, &mut receiver).await;

        self.registry.unregister(&domain).await;
        endpoint.close().await;
    }

    /// Serving loop: correlate responses, answer pings, drop the rest.
    async fn serve(&self, endpoint: &Arc<ChannelEndpoint>, receiver: &mut ChannelReceiver) {
        loop {
            match receiver.next_envelope().await {
                Ok(Some(envelope)) => match envelope.msg_type {
                    MsgType::HttpResponse => self.correlate(&envelope).await,
                    MsgType::Ping => {
                        if let Err(e) = endpoint.send(&Envelope::bare(MsgType::Pong)).await {
                            warn!(domain = %endpoint.domain(), error = %e, "failed to send pong");
                        }
                    }
                    other => {
                        warn!(domain = %endpoint.domain(), msg_type = %other, "unexpected message from client");
                    }
                },
                Ok(None) => {
                    info!(
                        domain = %endpoint.domain(),
                        tunnel_id = %endpoint.tunnel_id(),
                        "tunnel disconnected"
                    );
                    return;
                }
                Err(TunnelError::InvalidFrame(detail)) => {
                    warn!(domain = %endpoint.domain(), detail = %detail, "malformed frame dropped");
                }
                Err(e) => {
                    info!(
                        domain = %endpoint.domain(),
                        tunnel_id = %endpoint.tunnel_id(),
                        error = %e,
                        "tunnel receive failed"
                    );
                    return;
                }
            }
        }
    }

    /// Deliver an `http_response` to its waiter, if it still exists.
    async fn correlate(&self, envelope: &Envelope) {
        let response: HttpResponsePayload = match envelope.decode(MsgType::HttpResponse) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "undecodable http_response dropped");
                return;
            }
        };
        // Atomic load-and-delete: at most one of delivery or expiry wins.
        let slot = self.pending.lock().await.remove(&response.request_id);
        match slot {
            Some(tx) => {
                // The waiter may have just timed out; a lost send is the
                // acceptable tie-break outcome.
                let _ = tx.send(response);
            }
            None => {
                warn!(
                    request_id = %response.request_id,
                    "response for unknown request id"
                );
            }
        }
    }

    /// Forward one public request to the channel serving `domain` and wait
    /// for its correlated response or the deadline.
    pub async fn forward(
        &self,
        domain: &str,
        request: HttpRequestPayload,
    ) -> Result<HttpResponsePayload, ForwardError> {
        let entry = self
            .registry
            .lookup(domain)
            .await
            .ok_or_else(|| ForwardError::NoTunnel(domain.to_string()))?;

        let envelope = Envelope::encode(MsgType::HttpRequest, &request)
            .map_err(ForwardError::SendFailed)?;
        let request_id = request.request_id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(e) = entry.endpoint.send(&envelope).await {
            self.pending.lock().await.remove(&request_id);
            return Err(ForwardError::SendFailed(e));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Slot dropped without a send; only reachable if the table entry
            // was discarded, so treat it as a failed exchange.
            Ok(Err(_)) => Err(ForwardError::SendFailed(TunnelError::Closed)),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ForwardError::Timeout)
            }
        }
    }

    /// Number of requests currently awaiting correlation.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Answer a not-yet-registered channel with an `error` frame and close it.
async fn reject<S>(ws: &mut WebSocketStream<S>, code: &str, message: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let error = ErrorPayload {
        code: code.into(),
        message: message.into(),
    };
    if let Ok(envelope) = Envelope::encode(MsgType::Error, &error) {
        if let Ok(text) = envelope.to_json() {
            let _ = ws.send(Message::text(text)).await;
        }
    }
    let _ = ws.close(None).await;
}
