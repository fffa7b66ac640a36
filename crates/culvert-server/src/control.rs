//! Control-channel listener: TLS + WebSocket upgrade at `/tunnel`.

use crate::mux::TunnelMux;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Accept control connections until shutdown. Each accepted channel is
/// handed to the multiplexer on its own task.
pub async fn serve(
    listener: TcpListener,
    tls: TlsAcceptor,
    mux: Arc<TunnelMux>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "control accept failed");
                    continue;
                }
            },
        };

        let tls = tls.clone();
        let mux = mux.clone();
        tracker.spawn(async move {
            let tls_stream = match tls.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(remote = %remote, error = %e, "control TLS handshake failed");
                    return;
                }
            };

            let ws = match tokio_tungstenite::accept_hdr_async(tls_stream, require_tunnel_path)
                .await
            {
                Ok(ws) => ws,
                Err(e) => {
                    debug!(remote = %remote, error = %e, "WebSocket upgrade failed");
                    return;
                }
            };

            info!(remote = %remote, "new control connection");
            mux.handle_channel(ws).await;
        });
    }
    info!("control listener stopped");
}

/// Upgrade callback: the control protocol lives at `/tunnel` only.
fn require_tunnel_path(req: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if req.uri().path() == "/tunnel" {
        Ok(response)
    } else {
        let not_found = http::Response::builder()
            .status(http::StatusCode::NOT_FOUND)
            .body(Some("not found".to_string()))
            .expect("static response parts are valid");
        Err(not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request(path: &str) -> Request {
        http::Request::builder()
            .method("GET")
            .uri(path)
            .body(())
            .unwrap()
    }

    #[test]
    fn tunnel_path_is_accepted() {
        let response = http::Response::builder().body(()).unwrap();
        assert!(require_tunnel_path(&upgrade_request("/tunnel"), response).is_ok());
    }

    #[test]
    fn other_paths_are_rejected() {
        let response = http::Response::builder().body(()).unwrap();
        let err = require_tunnel_path(&upgrade_request("/other"), response).unwrap_err();
        assert_eq!(err.status(), http::StatusCode::NOT_FOUND);
    }
}
