//! Name resolution for bypassed domains
//!
//! One attempt per name per pass with a short timeout. IPv4 answers are
//! preferred since bypass routes go through an IPv4 gateway in practice.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::system_conf::read_system_conf;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("DNS resolution failed for {host}: {message}")]
    Failed { host: String, message: String },
    #[error("No IP addresses found for host: {0}")]
    NoAddressFound(String),
    #[error("DNS resolution timed out for {0}")]
    Timeout(String),
}

/// DNS collaborator used by the planner
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Result<IpAddr, ResolveError>;
}

/// Pick the address to route: first IPv4, else whatever came first
pub fn pick_address<I>(addrs: I) -> Option<IpAddr>
where
    I: IntoIterator<Item = IpAddr>,
{
    let mut first = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        first.get_or_insert(addr);
    }
    first
}

/// Resolver backed by the system's DNS configuration
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        let (config, mut opts) = match read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                warn!("Cannot read system DNS config ({}), using defaults", e);
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        opts.timeout = timeout;
        opts.attempts = 1;
        // The planner's own cache decides when to re-resolve
        opts.cache_size = 0;

        info!("DNS resolver initialized (timeout {:?})", timeout);
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            timeout,
        }
    }
}

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, hostname: &str) -> Result<IpAddr, ResolveError> {
        debug!("Resolving {} via system DNS", hostname);
        let lookup = tokio::time::timeout(self.timeout, self.resolver.lookup_ip(hostname))
            .await
            .map_err(|_| ResolveError::Timeout(hostname.to_string()))?
            .map_err(|e| ResolveError::Failed {
                host: hostname.to_string(),
                message: e.to_string(),
            })?;

        let ip = pick_address(lookup.iter())
            .ok_or_else(|| ResolveError::NoAddressFound(hostname.to_string()))?;
        debug!("Resolved {} -> {}", hostname, ip);
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_display() {
        let err = ResolveError::NoAddressFound("test.example.com".to_string());
        assert_eq!(
            err.to_string(),
            "No IP addresses found for host: test.example.com"
        );

        let err = ResolveError::Failed {
            host: "a.test".to_string(),
            message: "NXDOMAIN".to_string(),
        };
        assert!(err.to_string().contains("a.test"));
        assert!(err.to_string().contains("NXDOMAIN"));
    }

    #[test]
    fn test_pick_address_prefers_ipv4() {
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        let v4: IpAddr = "93.184.216.34".parse().unwrap();
        assert_eq!(pick_address([v6, v4]), Some(v4));
        assert_eq!(pick_address([v6]), Some(v6));
        assert_eq!(pick_address([]), None);
    }

    #[tokio::test]
    async fn test_resolve_nonexistent_host() {
        let resolver = SystemResolver::new(Duration::from_secs(2));
        let result = resolver
            .resolve("this-domain-definitely-does-not-exist-12345.invalid")
            .await;
        assert!(result.is_err());
    }
}
