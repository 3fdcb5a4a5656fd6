//! Public address cache.
//!
//! Holds the monitor's last known public IP. Only `refresh` writes it; readers
//! get a snapshot without blocking. At most one refresh runs at a time, and a
//! refresh that finds another one in flight is skipped rather than queued.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;

/// Public address lookup errors.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("lookup request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("lookup service returned HTTP {0}")]
    Status(u16),
    #[error("lookup service returned an invalid address: {0:?}")]
    InvalidAddress(String),
}

/// Source of the monitor's public IP.
#[async_trait]
pub trait AddressLookup: Send + Sync {
    async fn lookup(&self) -> Result<IpAddr, LookupError>;
}

/// Looks up the public IP through an HTTP "what is my IP" service.
///
/// Accepts either a JSON body of the form `{"ip": "..."}` or a bare address.
pub struct HttpAddressLookup {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct IpResponse {
    ip: String,
}

impl HttpAddressLookup {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AddressLookup for HttpAddressLookup {
    async fn lookup(&self) -> Result<IpAddr, LookupError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        parse_address(&body)
    }
}

fn parse_address(body: &str) -> Result<IpAddr, LookupError> {
    let raw = match serde_json::from_str::<IpResponse>(body) {
        Ok(parsed) => parsed.ip,
        Err(_) => body.trim().to_string(),
    };
    raw.parse()
        .map_err(|_| LookupError::InvalidAddress(raw.clone()))
}

/// Result of a `refresh` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The lookup succeeded and its value is now current.
    Updated { changed: bool },
    /// Another refresh was in flight; nothing was done.
    Skipped,
}

/// Cache of the last successfully observed public IP.
pub struct PublicAddressCache {
    lookup: Box<dyn AddressLookup>,
    current: watch::Sender<IpAddr>,
    busy: AtomicBool,
}

/// Clears the busy flag when the refresh ends, including on cancellation.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PublicAddressCache {
    /// Perform the first lookup and build the cache from it.
    ///
    /// A cache never exists without a known address, so a failure here is
    /// returned to the caller instead of leaving the cache empty.
    pub async fn initialize(lookup: Box<dyn AddressLookup>) -> Result<Arc<Self>, LookupError> {
        let ip = lookup.lookup().await?;
        tracing::info!(public_ip = %ip, "Public address: {}", ip);
        let (current, _) = watch::channel(ip);
        Ok(Arc::new(Self {
            lookup,
            current,
            busy: AtomicBool::new(false),
        }))
    }

    /// The last committed address.
    pub fn current(&self) -> IpAddr {
        *self.current.borrow()
    }

    /// Look up the public address again and commit it on success.
    ///
    /// On failure the previous value stays current and the error is returned.
    pub async fn refresh(&self) -> Result<RefreshOutcome, LookupError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            tracing::warn!("Public address refresh already in progress, skipping");
            return Ok(RefreshOutcome::Skipped);
        }
        let _guard = BusyGuard(&self.busy);

        let ip = self.lookup.lookup().await?;
        let previous = self.current.send_replace(ip);
        if previous != ip {
            tracing::info!(public_ip = %ip, previous = %previous, "Public address changed");
        }
        Ok(RefreshOutcome::Updated {
            changed: previous != ip,
        })
    }
}
