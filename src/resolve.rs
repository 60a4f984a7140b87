//! Hostname to IP resolution for template variables

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::transport::RemoteTransport;
use crate::{Error, Result};

/// Looks up the address of a fleet host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    /// First address `hostname` resolves to
    async fn resolve(&self, hostname: &str) -> Result<IpAddr>;
}

/// Resolves through the local system resolver
#[derive(Clone, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, hostname: &str) -> Result<IpAddr> {
        let mut addrs = tokio::net::lookup_host((hostname, 0))
            .await
            .map_err(|e| Error::resolution(hostname, e.to_string()))?;
        match addrs.next() {
            Some(addr) => {
                debug!(host = %hostname, ip = %addr.ip(), "resolved");
                Ok(addr.ip())
            }
            None => Err(Error::resolution(hostname, "no addresses")),
        }
    }
}

/// Resolves by running `dig +short` on a jump host
///
/// For fleets whose names only resolve inside their own network.
pub struct JumpHostResolver {
    transport: Arc<dyn RemoteTransport>,
    jumphost: String,
}

impl JumpHostResolver {
    /// Resolve via `jumphost`
    pub fn new(transport: Arc<dyn RemoteTransport>, jumphost: impl Into<String>) -> Self {
        Self {
            transport,
            jumphost: jumphost.into(),
        }
    }
}

#[async_trait]
impl Resolver for JumpHostResolver {
    async fn resolve(&self, hostname: &str) -> Result<IpAddr> {
        let output = self
            .transport
            .execute_command_with_output(&self.jumphost, &format!("dig +short {hostname}"))
            .await
            .map_err(|e| Error::transport(&self.jumphost, e))?;

        // dig prints CNAME targets before the address records
        let ip = output
            .lines()
            .filter_map(|line| line.trim().parse::<IpAddr>().ok())
            .next()
            .ok_or_else(|| Error::resolution(hostname, format!("no address in {output:?}")))?;
        debug!(host = %hostname, ip = %ip, via = %self.jumphost, "resolved");
        Ok(ip)
    }
}
