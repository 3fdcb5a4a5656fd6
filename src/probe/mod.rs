//! Probe module for network monitoring.
//!
//! Supports ICMP echo sessions and phase-timed HTTP requests.

mod http;
mod icmp;
mod ping;

pub use http::*;
pub use icmp::*;
pub use ping::*;

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("cannot resolve target: {0}")]
    Resolve(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// The host being monitored. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    host: String,
}

impl Target {
    pub fn new(host: impl Into<String>) -> Result<Self, ProbeError> {
        let host = host.into().trim().to_string();
        if host.is_empty() {
            return Err(ProbeError::Config("target must not be empty".to_string()));
        }
        Ok(Self { host })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host part with any URL scheme, path or port stripped.
    pub fn hostname(&self) -> &str {
        let rest = self
            .host
            .strip_prefix("http://")
            .or_else(|| self.host.strip_prefix("https://"))
            .unwrap_or(&self.host);
        let rest = rest.split('/').next().unwrap_or(rest);
        // Bracketed IPv6 literal, optionally followed by a port.
        if let Some(inner) = rest.strip_prefix('[') {
            return inner.split(']').next().unwrap_or(inner);
        }
        if rest.parse::<IpAddr>().is_ok() {
            return rest;
        }
        rest.split(':').next().unwrap_or(rest)
    }

    /// URL used by the HTTP probe.
    pub fn http_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.clone()
        } else {
            format!("http://{}/", self.host)
        }
    }

    /// Resolve to a single IP address.
    pub async fn resolve(&self) -> Result<IpAddr, ProbeError> {
        let host = self.hostname();

        // Try direct parse first
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let mut addrs = tokio::net::lookup_host(format!("{}:0", host))
            .await
            .map_err(|e| ProbeError::Resolve(format!("{}: {}", host, e)))?;

        addrs
            .next()
            .map(|sa| sa.ip())
            .ok_or_else(|| ProbeError::Resolve(format!("no addresses found for {}", host)))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_target_rejected() {
        assert!(matches!(Target::new("  "), Err(ProbeError::Config(_))));
    }

    #[test]
    fn test_hostname_strips_url_parts() {
        assert_eq!(Target::new("www.google.com").unwrap().hostname(), "www.google.com");
        assert_eq!(
            Target::new("https://example.com:8443/health").unwrap().hostname(),
            "example.com"
        );
        assert_eq!(Target::new("[::1]:80").unwrap().hostname(), "::1");
        assert_eq!(Target::new("2001:db8::1").unwrap().hostname(), "2001:db8::1");
    }

    #[test]
    fn test_http_url() {
        assert_eq!(
            Target::new("www.google.com").unwrap().http_url(),
            "http://www.google.com/"
        );
        assert_eq!(
            Target::new("https://example.com/x").unwrap().http_url(),
            "https://example.com/x"
        );
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let target = Target::new("127.0.0.1").unwrap();
        assert_eq!(target.resolve().await.unwrap(), IpAddr::from([127, 0, 0, 1]));
    }

    #[tokio::test]
    async fn test_resolve_invalid_host() {
        let target = Target::new("no-such-host.invalid").unwrap();
        assert!(matches!(target.resolve().await, Err(ProbeError::Resolve(_))));
    }
}
