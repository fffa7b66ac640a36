//! Public HTTPS ingress: translates inbound HTTP to framed tunnel requests
//! and framed responses back to HTTP.

use crate::mux::{ForwardError, TunnelMux};
use bytes::Bytes;
use culvert_core::{forwardable_headers, mint_request_id, Headers, HttpRequestPayload};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Accept public TLS connections until shutdown; every connection and every
/// request runs in its own task.
pub async fn serve(
    listener: TcpListener,
    tls: TlsAcceptor,
    mux: Arc<TunnelMux>,
    max_body_bytes: u64,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "public accept failed");
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
                    debug!(remote = %remote, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = service_fn(move |req| {
                let mux = mux.clone();
                async move {
                    Ok::<_, Infallible>(handle_public_request(&mux, max_body_bytes, req).await)
                }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                debug!(remote = %remote, error = %e, "public connection ended with error");
            }
        });
    }
    info!("public ingress stopped");
}

/// Translate one public request into a framed exchange and back.
pub(crate) async fn handle_public_request<B>(
    mux: &TunnelMux,
    max_body_bytes: u64,
    req: Request<B>,
) -> Response<Full<Bytes>>
where
    B: Body + Send,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let Some(domain) = request_host(&req) else {
        return text_response(StatusCode::BAD_REQUEST, "Missing Host header");
    };

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let method = req.method().as_str().to_string();

    let mut headers = Headers::new();
    for (name, value) in req.headers() {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    let headers = forwardable_headers(&headers);

    let body = req.into_body();
    let collected: Result<Bytes, Box<dyn std::error::Error + Send + Sync>> =
        if max_body_bytes > 0 {
            Limited::new(body, max_body_bytes as usize)
                .collect()
                .await
                .map(|collected| collected.to_bytes())
        } else {
            body.collect()
                .await
                .map(|collected| collected.to_bytes())
                .map_err(Into::into)
        };
    let body = match collected {
        Ok(bytes) => bytes,
        Err(e) if e.is::<http_body_util::LengthLimitError>() => {
            return text_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read request body",
            );
        }
    };

    let request = HttpRequestPayload {
        request_id: mint_request_id(),
        method,
        path: path.clone(),
        headers,
        body: body.to_vec(),
    };

    debug!(domain = %domain, path = %path, request_id = %request.request_id, "forwarding public request");

    match mux.forward(&domain, request).await {
        Ok(response) => tunnel_response(response),
        Err(ForwardError::NoTunnel(domain)) => text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("No tunnel registered for domain: {domain}"),
        ),
        Err(ForwardError::Timeout) => {
            text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway timeout")
        }
        Err(e) => {
            error!(domain = %domain, error = %e, "failed to forward request");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

/// Rebuild an HTTP response from a framed `http_response`.
fn tunnel_response(payload: culvert_core::HttpResponsePayload) -> Response<Full<Bytes>> {
    let status = match StatusCode::from_u16(payload.status_code) {
        Ok(status) => status,
        Err(_) => {
            warn!(status = payload.status_code, "invalid status code from tunnel");
            return text_response(StatusCode::BAD_GATEWAY, "Invalid response from tunnel");
        }
    };

    let mut response = Response::builder().status(status);
    if let Some(header_map) = response.headers_mut() {
        for (name, values) in &payload.headers {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                debug!(name = %name, "skipping invalid response header name");
                continue;
            };
            for value in values {
                match HeaderValue::from_str(value) {
                    Ok(value) => {
                        header_map.append(name.clone(), value);
                    }
                    Err(_) => debug!(name = %name, "skipping invalid response header value"),
                }
            }
        }
    }

    response
        .body(Full::new(Bytes::from(payload.body)))
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to assemble response");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        })
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(format!("{message}\n"))))
        .expect("static response parts are valid")
}

/// Hostname of the request authority: the URI when absolute, otherwise the
/// Host header, with any port stripped.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return host_only(host);
    }
    let value = req.headers().get(HOST)?.to_str().ok()?;
    host_only(value)
}

fn host_only(authority: &str) -> Option<String> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }
    // Bracketed IPv6 literal, possibly with a port.
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        return Some(format!("[{}]", &rest[..end].to_ascii_lowercase()));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            Some(host.to_ascii_lowercase())
        }
        _ => Some(authority.to_ascii_lowercase()),
    }
}
