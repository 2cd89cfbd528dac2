//! Stand-in `NetboxClient` implementations for the CLI demo harness. The
//! real Netbox HTTP client is explicitly out of scope for this crate (see
//! §1 of the spec this binary drives); only its `Fetch() -> (cidr, error)`
//! contract is consumed here, by a client that either hands out addresses
//! from a locally-configured demo range or reports the backend as
//! unreachable.

use allocator_core::{NetboxClient, NetboxError};
use ipcidr::IpCidr;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Hands out successive single-address CIDRs drawn from `base`, wrapping
/// back to the start if exhausted. Good enough to drive the literal
/// scenarios in the spec's §8 without a real IPAM; not a substitute for
/// one.
#[derive(Debug)]
pub struct DemoNetboxClient {
    base: IpCidr,
    next: AtomicU64,
}

impl DemoNetboxClient {
    pub fn new(base: IpCidr) -> Self {
        DemoNetboxClient {
            base,
            next: AtomicU64::new(0),
        }
    }

    fn nth_address(&self, n: u64) -> IpAddr {
        match self.base.network_addr() {
            IpAddr::V4(addr) => {
                let base = u32::from(addr);
                IpAddr::V4(std::net::Ipv4Addr::from(base.wrapping_add(n as u32)))
            }
            IpAddr::V6(addr) => {
                let base = u128::from(addr);
                IpAddr::V6(std::net::Ipv6Addr::from(base.wrapping_add(n as u128)))
            }
        }
    }
}

impl NetboxClient for DemoNetboxClient {
    fn fetch(&self, _deadline: Duration) -> Result<IpCidr, NetboxError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let addr = self.nth_address(n);
        Ok(IpCidr::from_singleton(addr))
    }
}

/// Reports every call as a backend failure. Used for `netbox` groups when
/// the operator hasn't pointed the CLI at a demo range; this mirrors what
/// a genuinely unreachable IPAM looks like to the allocator.
#[derive(Debug)]
pub struct UnconfiguredNetboxClient {
    url: String,
    tenant: String,
}

impl UnconfiguredNetboxClient {
    pub fn new(url: impl Into<String>, tenant: impl Into<String>) -> Self {
        UnconfiguredNetboxClient {
            url: url.into(),
            tenant: tenant.into(),
        }
    }
}

impl NetboxClient for UnconfiguredNetboxClient {
    fn fetch(&self, _deadline: Duration) -> Result<IpCidr, NetboxError> {
        Err(NetboxError::Backend(format!(
            "no netbox backend configured for {}@{} (pass --demo-netbox-base to exercise this pool in the demo harness)",
            self.tenant, self.url
        )))
    }
}

/// Builds either kind of client for every `netbox` group in the catalog,
/// depending on whether the operator passed `--demo-netbox-base`.
pub struct CliNetboxFactory {
    demo_base: Option<IpCidr>,
}

impl CliNetboxFactory {
    pub fn new(demo_base: Option<&str>) -> Result<Self, std::io::Error> {
        let demo_base = demo_base.map(IpCidr::from_str).transpose()?;
        Ok(CliNetboxFactory { demo_base })
    }
}

impl allocator_core::NetboxClientFactory for CliNetboxFactory {
    fn build(&self, url: &str, tenant: &str) -> Box<dyn NetboxClient> {
        match &self.demo_base {
            Some(base) => Box::new(DemoNetboxClient::new(base.clone())),
            None => Box::new(UnconfiguredNetboxClient::new(url, tenant)),
        }
    }
}
