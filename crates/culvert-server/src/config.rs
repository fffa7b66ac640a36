//! Server configuration, sourced from the environment (or matching flags).

use std::path::PathBuf;
use std::time::Duration;

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Plain HTTP listener port (ACME challenges and redirects).
    pub http_port: u16,
    /// Public HTTPS listener port (tunnel traffic).
    pub https_port: u16,
    /// Control channel listener port (WebSocket upgrade at `/tunnel`).
    pub ws_port: u16,
    /// Hostnames permitted in the TLS host policy.
    pub domains: Vec<String>,
    /// Contact email passed to the certificate collaborator.
    pub autocert_email: Option<String>,
    /// Certificate cache directory.
    pub autocert_cache_dir: PathBuf,
    /// Maximum accepted request body size in bytes; 0 means unbounded.
    pub max_body_bytes: u64,
    /// Wall-clock limit from forward to response.
    pub request_timeout: Duration,
    /// Time allowed for in-flight requests to drain on shutdown.
    pub shutdown_grace: Duration,
}

/// Split `AUTOCERT_DOMAINS` into trimmed, non-empty hostnames.
pub fn parse_domains(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_trims() {
        assert_eq!(
            parse_domains("a.example.com, b.example.com ,c.example.com"),
            vec!["a.example.com", "b.example.com", "c.example.com"]
        );
    }

    #[test]
    fn drops_empty_entries() {
        assert_eq!(parse_domains("a.example.com,,  ,"), vec!["a.example.com"]);
        assert!(parse_domains("").is_empty());
        assert!(parse_domains(" , ").is_empty());
    }
}
