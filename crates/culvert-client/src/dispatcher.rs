//! Tunnel client: connect, register, heartbeat, and the serve loop.

use crate::proxy;
use culvert_core::{
    ChannelEndpoint, ChannelReceiver, Envelope, ErrorPayload, HttpRequestPayload, MsgType,
    RegisterPayload, RegisteredPayload, TunnelError, TunnelResult, PROTOCOL_VERSION,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// How often the client pings the server to keep the channel alive.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One registered tunnel: the control channel plus the loopback target.
#[derive(Debug)]
pub struct TunnelClient {
    endpoint: Arc<ChannelEndpoint>,
    receiver: ChannelReceiver,
    registered: RegisteredPayload,
    local_port: u16,
    rewrite_host: bool,
}

impl TunnelClient {
    /// Dial the control channel and register `domain`.
    ///
    /// Fails on connect errors, on an `error` answer from the server
    /// (surfaced as [`TunnelError::Rejected`]), and on protocol violations.
    pub async fn connect(
        server_url: &str,
        domain: &str,
        local_port: u16,
        rewrite_host: bool,
    ) -> TunnelResult<Self> {
        info!(server = %server_url, domain = %domain, "connecting to server");
        let (ws, _response) = connect_async(server_url)
            .await
            .map_err(|e| TunnelError::Transport(format!("failed to connect: {e}")))?;
        Self::register_on(ws, domain, local_port, rewrite_host).await
    }

    /// Register over an already-established channel.
    pub(crate) async fn register_on<S>(
        mut ws: WebSocketStream<S>,
        domain: &str,
        local_port: u16,
        rewrite_host: bool,
    ) -> TunnelResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let register = RegisterPayload {
            domain: domain.to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        let frame = Envelope::encode(MsgType::Register, &register)?.to_json()?;
        ws.send(Message::text(frame))
            .await
            .map_err(|e| TunnelError::Transport(format!("failed to send register: {e}")))?;

        let envelope = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break Envelope::from_json(&text)?,
                Some(Ok(Message::Close(_))) | None => return Err(TunnelError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TunnelError::Transport(e.to_string())),
            }
        };

        let registered = match envelope.msg_type {
            MsgType::Registered => envelope.decode::<RegisteredPayload>(MsgType::Registered)?,
            MsgType::Error => {
                let error: ErrorPayload = envelope.decode(MsgType::Error)?;
                return Err(TunnelError::Rejected {
                    code: error.code,
                    message: error.message,
                });
            }
            other => {
                return Err(TunnelError::UnexpectedType {
                    expected: MsgType::Registered,
                    got: other,
                })
            }
        };

        let (endpoint, receiver) =
            ChannelEndpoint::split(domain, registered.tunnel_id.clone(), ws);
        info!(
            tunnel_id = %registered.tunnel_id,
            public_url = %registered.server_url,
            local_port,
            "tunnel registered"
        );

        Ok(Self {
            endpoint,
            receiver,
            registered,
            local_port,
            rewrite_host,
        })
    }

    /// The public URL the server confirmed for this tunnel.
    pub fn public_url(&self) -> &str {
        &self.registered.server_url
    }

    pub fn tunnel_id(&self) -> &str {
        &self.registered.tunnel_id
    }

    /// Shared write handle, e.g. for a graceful close from a signal handler.
    pub fn endpoint(&self) -> Arc<ChannelEndpoint> {
        self.endpoint.clone()
    }

    /// Serve until the channel ends.
    ///
    /// The reader stays dedicated to the channel: every inbound request is
    /// handed to its own task, and writes from those tasks serialize on the
    /// endpoint lock. Returns an error when the server goes away.
    pub async fn run(mut self) -> TunnelResult<()> {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.endpoint.send(&Envelope::bare(MsgType::Ping)).await?;
                }
                frame = self.receiver.next_envelope() => match frame {
                    Ok(Some(envelope)) => self.dispatch(envelope),
                    Ok(None) => {
                        info!("server closed the tunnel");
                        return Err(TunnelError::Closed);
                    }
                    Err(TunnelError::InvalidFrame(detail)) => {
                        warn!(detail = %detail, "malformed frame dropped");
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }

    /// Hand one inbound frame to its handler without blocking the reader.
    fn dispatch(&self, envelope: Envelope) {
        match envelope.msg_type {
            MsgType::HttpRequest => {
                let request: HttpRequestPayload =
                    match envelope.decode(MsgType::HttpRequest) {
                        Ok(request) => request,
                        Err(e) => {
                            error!(error = %e, "failed to decode http_request");
                            return;
                        }
                    };
                debug!(
                    request_id = %request.request_id,
                    method = %request.method,
                    path = %request.path,
                    "received request"
                );
                let endpoint = self.endpoint.clone();
                let local_port = self.local_port;
                let rewrite_host = self.rewrite_host;
                tokio::spawn(async move {
                    let response = proxy::relay(local_port, rewrite_host, request).await;
                    match Envelope::encode(MsgType::HttpResponse, &response) {
                        Ok(envelope) => {
                            if let Err(e) = endpoint.send(&envelope).await {
                                error!(error = %e, "failed to send response");
                            }
                        }
                        Err(e) => error!(error = %e, "failed to encode response"),
                    }
                });
            }
            // Heartbeat replies; nothing to do.
            MsgType::Pong => {}
            other => warn!(msg_type = %other, "unknown message type from server"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use culvert_core::{Headers, HttpResponsePayload};
    use http_body_util::Full;
    use hyper::Response;
    use hyper_util::rt::TokioIo;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    async fn server_recv(ws: &mut WebSocketStream<tokio::io::DuplexStream>) -> Envelope {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return Envelope::from_json(&text).unwrap(),
                Message::Close(_) => panic!("unexpected close"),
                _ => continue,
            }
        }
    }

    async fn server_send<T: serde::Serialize>(
        ws: &mut WebSocketStream<tokio::io::DuplexStream>,
        msg_type: MsgType,
        payload: &T,
    ) {
        let text = Envelope::encode(msg_type, payload)
            .unwrap()
            .to_json()
            .unwrap();
        ws.send(Message::text(text)).await.unwrap();
    }

    #[tokio::test]
    async fn registration_happy_path() {
        let (mut server, client_ws) = ws_pair().await;

        let server_task = tokio::spawn(async move {
            let envelope = server_recv(&mut server).await;
            let register: RegisterPayload = envelope.decode(MsgType::Register).unwrap();
            assert_eq!(register.domain, "dev.example.com");
            assert_eq!(register.protocol_version, PROTOCOL_VERSION);
            server_send(
                &mut server,
                MsgType::Registered,
                &RegisteredPayload {
                    tunnel_id: "cafe".repeat(8),
                    server_url: "https://dev.example.com".into(),
                },
            )
            .await;
            server
        });

        let client = TunnelClient::register_on(client_ws, "dev.example.com", 3000, false)
            .await
            .unwrap();
        assert_eq!(client.public_url(), "https://dev.example.com");
        assert_eq!(client.tunnel_id(), "cafe".repeat(8));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn registration_error_is_surfaced() {
        let (mut server, client_ws) = ws_pair().await;

        tokio::spawn(async move {
            let _register = server_recv(&mut server).await;
            server_send(
                &mut server,
                MsgType::Error,
                &ErrorPayload {
                    code: "REGISTRATION_FAILED".into(),
                    message: "domain already registered: dev.example.com".into(),
                },
            )
            .await;
        });

        let err = TunnelClient::register_on(client_ws, "dev.example.com", 3000, false)
            .await
            .unwrap_err();
        match err {
            TunnelError::Rejected { code, .. } => assert_eq!(code, "REGISTRATION_FAILED"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn inbound_requests_are_dispatched_to_loopback() {
        // Local application standing behind the dispatcher.
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let local_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = hyper::service::service_fn(|_req| async {
                Ok::<_, std::convert::Infallible>(Response::new(Full::new(
                    Bytes::from_static(b"hi"),
                )))
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let (mut server, client_ws) = ws_pair().await;
        let register_task = tokio::spawn(async move {
            let _register = server_recv(&mut server).await;
            server_send(
                &mut server,
                MsgType::Registered,
                &RegisteredPayload {
                    tunnel_id: "t".repeat(32),
                    server_url: "https://dev.example.com".into(),
                },
            )
            .await;
            server
        });

        let client = TunnelClient::register_on(client_ws, "dev.example.com", local_port, false)
            .await
            .unwrap();
        let mut server = register_task.await.unwrap();
        tokio::spawn(client.run());

        let request = HttpRequestPayload {
            request_id: "req-1234".into(),
            method: "GET".into(),
            path: "/".into(),
            headers: Headers::new(),
            body: Vec::new(),
        };
        server_send(&mut server, MsgType::HttpRequest, &request).await;

        let envelope = server_recv(&mut server).await;
        assert_eq!(envelope.msg_type, MsgType::HttpResponse);
        let response: HttpResponsePayload = envelope.decode(MsgType::HttpResponse).unwrap();
        assert_eq!(response.request_id, "req-1234");
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, b"hi");
    }

    #[tokio::test]
    async fn run_ends_when_server_disappears() {
        let (mut server, client_ws) = ws_pair().await;
        let register_task = tokio::spawn(async move {
            let _register = server_recv(&mut server).await;
            server_send(
                &mut server,
                MsgType::Registered,
                &RegisteredPayload {
                    tunnel_id: "t".repeat(32),
                    server_url: "https://dev.example.com".into(),
                },
            )
            .await;
            server
        });

        let client = TunnelClient::register_on(client_ws, "dev.example.com", 3000, false)
            .await
            .unwrap();
        let server = register_task.await.unwrap();
        drop(server);

        assert!(client.run().await.is_err());
    }
}
