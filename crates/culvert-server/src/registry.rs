//! Tunnel registry: the concurrent mapping of public hostname to the
//! channel currently serving it.

use culvert_core::{ChannelEndpoint, TunnelError, TunnelResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One live tunnel: the binding of a domain to a channel instance.
#[derive(Clone)]
pub struct TunnelEntry {
    pub domain: String,
    pub tunnel_id: String,
    pub endpoint: Arc<ChannelEndpoint>,
}

/// Registry of active tunnels, keyed by domain.
///
/// Mutations are linearizable through the single writer lock; no I/O ever
/// runs under it.
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, TunnelEntry>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a tunnel for its domain. Fails if a live entry already exists.
    pub async fn register(&self, entry: TunnelEntry) -> TunnelResult<()> {
        let mut tunnels = self.tunnels.write().await;
        if tunnels.contains_key(&entry.domain) {
            return Err(TunnelError::DomainInUse(entry.domain.clone()));
        }
        info!(
            domain = %entry.domain,
            tunnel_id = %entry.tunnel_id,
            active = tunnels.len() + 1,
            "tunnel registered"
        );
        tunnels.insert(entry.domain.clone(), entry);
        Ok(())
    }

    /// Remove a domain's tunnel. Idempotent; absent domains are a no-op.
    pub async fn unregister(&self, domain: &str) {
        let mut tunnels = self.tunnels.write().await;
        if let Some(entry) = tunnels.remove(domain) {
            info!(
                domain = %domain,
                tunnel_id = %entry.tunnel_id,
                active = tunnels.len(),
                "tunnel unregistered"
            );
        } else {
            debug!(domain = %domain, "unregister for unknown domain");
        }
    }

    /// Look up the tunnel serving a domain.
    pub async fn lookup(&self, domain: &str) -> Option<TunnelEntry> {
        self.tunnels.read().await.get(domain).cloned()
    }

    /// Number of active tunnels.
    pub async fn count(&self) -> usize {
        self.tunnels.read().await.len()
    }

    /// All registered domains.
    pub async fn list(&self) -> Vec<String> {
        self.tunnels.read().await.keys().cloned().collect()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use culvert_core::ChannelEndpoint;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    async fn entry(domain: &str, tunnel_id: &str) -> TunnelEntry {
        let (a, _b) = tokio::io::duplex(1024);
        let ws = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let (endpoint, _receiver) = ChannelEndpoint::split(domain, tunnel_id, ws);
        TunnelEntry {
            domain: domain.into(),
            tunnel_id: tunnel_id.into(),
            endpoint,
        }
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = TunnelRegistry::new();
        registry
            .register(entry("dev.example.com", "t1").await)
            .await
            .unwrap();
        let found = registry.lookup("dev.example.com").await.unwrap();
        assert_eq!(found.tunnel_id, "t1");
        assert_eq!(registry.count().await, 1);
        assert!(registry.lookup("other.example.com").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_domain_is_rejected() {
        let registry = TunnelRegistry::new();
        registry
            .register(entry("dev.example.com", "t1").await)
            .await
            .unwrap();
        let err = registry
            .register(entry("dev.example.com", "t2").await)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::DomainInUse(_)));
        // The original registration survives the conflict.
        let found = registry.lookup("dev.example.com").await.unwrap();
        assert_eq!(found.tunnel_id, "t1");
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = TunnelRegistry::new();
        registry
            .register(entry("dev.example.com", "t1").await)
            .await
            .unwrap();
        registry.unregister("dev.example.com").await;
        registry.unregister("dev.example.com").await;
        assert_eq!(registry.count().await, 0);
        assert!(registry.lookup("dev.example.com").await.is_none());
    }

    #[tokio::test]
    async fn reregister_after_release() {
        let registry = TunnelRegistry::new();
        registry
            .register(entry("dev.example.com", "t1").await)
            .await
            .unwrap();
        registry.unregister("dev.example.com").await;
        registry
            .register(entry("dev.example.com", "t2").await)
            .await
            .unwrap();
        let found = registry.lookup("dev.example.com").await.unwrap();
        assert_eq!(found.tunnel_id, "t2");
    }

    #[tokio::test]
    async fn concurrent_registration_has_one_winner() {
        let registry = Arc::new(TunnelRegistry::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            let entry = entry("dev.example.com", &format!("t{i}")).await;
            handles.push(tokio::spawn(
                async move { registry.register(entry).await },
            ));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn list_reports_domains() {
        let registry = TunnelRegistry::new();
        registry
            .register(entry("a.example.com", "t1").await)
            .await
            .unwrap();
        registry
            .register(entry("b.example.com", "t2").await)
            .await
            .unwrap();
        let mut domains = registry.list().await;
        domains.sort();
        assert_eq!(domains, vec!["a.example.com", "b.example.com"]);
    }
}
