//! Loopback dispatch: one framed request in, one framed response out.

use bytes::Bytes;
use culvert_core::{
    forwardable_headers, Headers, HttpRequestPayload, HttpResponsePayload, TunnelError,
    TunnelResult,
};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Relay a framed request to the local application.
///
/// Transport failures never surface as protocol errors: the response is a
/// synthesized 502 so the public caller always gets an answer.
pub async fn relay(
    local_port: u16,
    rewrite_host: bool,
    request: HttpRequestPayload,
) -> HttpResponsePayload {
    let request_id = request.request_id.clone();
    match call_loopback(local_port, rewrite_host, &request).await {
        Ok(response) => {
            debug!(
                request_id = %request_id,
                status = response.status_code,
                "request proxied"
            );
            response
        }
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "loopback call failed");
            HttpResponsePayload {
                request_id,
                status_code: 502,
                headers: Headers::new(),
                body: format!("Bad Gateway: {e}").into_bytes(),
            }
        }
    }
}

async fn call_loopback(
    local_port: u16,
    rewrite_host: bool,
    request: &HttpRequestPayload,
) -> TunnelResult<HttpResponsePayload> {
    let stream = TcpStream::connect(("127.0.0.1", local_port)).await?;
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| TunnelError::Transport(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "loopback connection error");
        }
    });

    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|e| TunnelError::Other(format!("invalid method {:?}: {e}", request.method)))?;
    let mut builder = Request::builder().method(method).uri(request.path.as_str());

    if let Some(header_map) = builder.headers_mut() {
        let mut has_host = false;
        for (name, values) in &request.headers {
            if rewrite_host && name.eq_ignore_ascii_case("host") {
                continue;
            }
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                debug!(name = %name, "skipping invalid request header name");
                continue;
            };
            for value in values {
                match HeaderValue::from_str(value) {
                    Ok(value) => {
                        if name == HOST {
                            has_host = true;
                        }
                        header_map.append(name.clone(), value);
                    }
                    Err(_) => debug!(name = %name, "skipping invalid request header value"),
                }
            }
        }
        if rewrite_host || !has_host {
            let authority = format!("127.0.0.1:{local_port}");
            header_map.insert(HOST, HeaderValue::from_str(&authority).expect("valid authority"));
        }
    }

    let outbound = builder
        .body(Full::new(Bytes::from(request.body.clone())))
        .map_err(|e| TunnelError::Other(e.to_string()))?;
    let response = sender
        .send_request(outbound)
        .await
        .map_err(|e| TunnelError::Transport(e.to_string()))?;

    let status_code = response.status().as_u16();
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    // The buffered body is reframed on the way back; connection-scoped
    // headers from the local server must not travel with it.
    let headers = forwardable_headers(&headers);
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| TunnelError::Transport(e.to_string()))?
        .to_bytes();

    Ok(HttpResponsePayload {
        request_id: request.request_id.clone(),
        status_code,
        headers,
        body: body.to_vec(),
    })
}
