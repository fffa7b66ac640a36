//! Certificate collaborator interface: host policy, SNI certificate
//! resolution from the cache directory, and the HTTP-01 challenge listener.
//!
//! Certificate acquisition and renewal run outside this process; the
//! collaborator contract is a cache directory with `<host>.crt`/`<host>.key`
//! PEM pairs and `challenges/<token>` response files. Hosts in the policy
//! with no cached certificate get an in-memory self-signed certificate so
//! the listeners can come up before first issuance.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::header::{CONTENT_TYPE, HOST, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// TLS and challenge source for all three listeners.
pub struct CertManager {
    email: Option<String>,
    cache_dir: PathBuf,
    challenges: RwLock<HashMap<String, String>>,
    resolver: Arc<CachedCertResolver>,
}

impl CertManager {
    pub fn new(domains: Vec<String>, email: Option<String>, cache_dir: PathBuf) -> Self {
        let domains: Vec<String> = domains
            .into_iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
        let resolver = Arc::new(CachedCertResolver {
            allowed: domains,
            cache_dir: cache_dir.clone(),
            certs: RwLock::new(HashMap::new()),
        });
        Self {
            email,
            cache_dir,
            challenges: RwLock::new(HashMap::new()),
            resolver,
        }
    }

    /// Contact address for the external renewal process.
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// A server TLS configuration resolving certificates per SNI name.
    pub fn tls_config(&self) -> Arc<rustls::ServerConfig> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.resolver.clone());
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Key authorization for an HTTP-01 token, from the in-memory store or
    /// the cache directory.
    pub fn challenge_response(&self, token: &str) -> Option<String> {
        let token = sanitize_token(token)?;
        if let Some(response) = self.challenges.read().expect("lock poisoned").get(token) {
            return Some(response.clone());
        }
        let path = self.cache_dir.join("challenges").join(token);
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim_end().to_string())
    }

    /// Publish a challenge response. Called by the renewal integration.
    #[allow(dead_code)]
    pub fn install_challenge(&self, token: &str, response: &str) {
        self.challenges
            .write()
            .expect("lock poisoned")
            .insert(token.to_string(), response.to_string());
    }
}

/// Reject tokens that could escape the challenge directory.
fn sanitize_token(token: &str) -> Option<&str> {
    if token.is_empty()
        || token.contains('/')
        || token.contains('\\')
        || token.contains("..")
        || token.contains('\0')
    {
        None
    } else {
        Some(token)
    }
}

/// SNI resolver over the certificate cache with self-signed fallback.
struct CachedCertResolver {
    allowed: Vec<String>,
    cache_dir: PathBuf,
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl CachedCertResolver {
    fn certified_for(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let host = host.to_ascii_lowercase();
        if !self.allowed.iter().any(|d| *d == host) {
            debug!(host = %host, "SNI name not in host policy");
            return None;
        }
        if let Some(key) = self.certs.read().expect("lock poisoned").get(&host) {
            return Some(key.clone());
        }
        let key = match self.load_cached(&host) {
            Some(key) => key,
            None => {
                warn!(host = %host, "no cached certificate, serving self-signed");
                self.self_signed(&host)?
            }
        };
        self.certs
            .write()
            .expect("lock poisoned")
            .insert(host, key.clone());
        Some(key)
    }

    /// `<cache>/<host>.crt` + `<cache>/<host>.key` PEM pair.
    fn load_cached(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let cert_pem = std::fs::read(self.cache_dir.join(format!("{host}.crt"))).ok()?;
        let key_pem = std::fs::read(self.cache_dir.join(format!("{host}.key"))).ok()?;

        let certs: Vec<_> = match rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<_, _>>()
        {
            Ok(certs) => certs,
            Err(e) => {
                warn!(host = %host, error = %e, "unreadable cached certificate");
                return None;
            }
        };
        let key = match rustls_pemfile::private_key(&mut &key_pem[..]) {
            Ok(Some(key)) => key,
            Ok(None) => {
                warn!(host = %host, "no private key in cached PEM");
                return None;
            }
            Err(e) => {
                warn!(host = %host, error = %e, "unreadable cached key");
                return None;
            }
        };
        let signing_key = match any_supported_type(&key) {
            Ok(key) => key,
            Err(e) => {
                warn!(host = %host, error = %e, "unsupported cached key type");
                return None;
            }
        };
        info!(host = %host, "loaded certificate from cache");
        Some(Arc::new(CertifiedKey::new(certs, signing_key)))
    }

    fn self_signed(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let mut params = match rcgen::CertificateParams::new(vec![host.to_string()]) {
            Ok(params) => params,
            Err(e) => {
                warn!(host = %host, error = %e, "invalid subject for self-signed certificate");
                return None;
            }
        };
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, host);

        let key_pair = rcgen::KeyPair::generate().ok()?;
        let cert = params.self_signed(&key_pair).ok()?;
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = any_supported_type(&key_der).ok()?;
        Some(Arc::new(CertifiedKey::new(
            vec![cert.der().clone()],
            signing_key,
        )))
    }
}

impl ResolvesServerCert for CachedCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        self.certified_for(name)
    }
}

impl fmt::Debug for CachedCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedCertResolver")
            .field("allowed", &self.allowed)
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

/// Plain-HTTP listener: HTTP-01 challenges, 301 for everything else.
pub async fn serve_http(
    listener: TcpListener,
    manager: Arc<CertManager>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "http accept failed");
                    continue;
                }
            },
        };

        let manager = manager.clone();
        tracker.spawn(async move {
            let service = service_fn(move |req| {
                let manager = manager.clone();
                async move { Ok::<_, Infallible>(handle_acme_request(&manager, req)) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(remote = %remote, error = %e, "http connection ended with error");
            }
        });
    }
    info!("http listener stopped");
}

/// Serve a challenge response or redirect to the HTTPS authority.
fn handle_acme_request<B: Body>(manager: &CertManager, req: Request<B>) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    if let Some(token) = path.strip_prefix("/.well-known/acme-challenge/") {
        return match manager.challenge_response(token) {
            Some(response) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain")
                .body(Full::new(Bytes::from(response)))
                .expect("static response parts are valid"),
            None => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from_static(b"not found\n")))
                .expect("static response parts are valid"),
        };
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if host.is_empty() {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Full::new(Bytes::from_static(b"missing host\n")))
            .expect("static response parts are valid");
    }
    let target = format!(
        "https://{host}{}",
        req.uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, target)
        .body(Full::new(Bytes::new()))
        .expect("static response parts are valid")
}
