//! A pool backed by an external IPAM (Netbox). Selection is fully
//! delegated: the only thing this pool owns is the bookkeeping of what it
//! has already handed out, so that `Release`/`Contains` work without a
//! second round trip. The HTTP client that actually talks to Netbox is
//! explicitly out of scope here; only its `Fetch` contract is consumed.

use crate::pool::{Pool, PoolError};
use crate::service::{Port, ServiceRef, SharingKey};
use ipcidr::{AddressFamily, IpCidr, IpRange};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetboxError {
    #[error("netbox request exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
    #[error("netbox backend error: {0}")]
    Backend(String),
}

/// The narrow boundary the allocator consumes from the real Netbox client.
/// Implementations are responsible for honoring `deadline` themselves; the
/// allocator blocks on this call for at most that long.
pub trait NetboxClient: std::fmt::Debug + Send {
    fn fetch(&self, deadline: Duration) -> Result<IpCidr, NetboxError>;
}

#[derive(Debug)]
pub struct NetboxPool {
    name: String,
    client: Box<dyn NetboxClient>,
    deadline: Duration,
    addresses_in_use: HashMap<IpAddr, Vec<ServiceRef>>,
    by_service: HashMap<ServiceRef, Vec<IpAddr>>,
}

impl NetboxPool {
    pub fn new(name: impl Into<String>, client: Box<dyn NetboxClient>, deadline: Duration) -> Self {
        NetboxPool {
            name: name.into(),
            client,
            deadline,
            addresses_in_use: HashMap::new(),
            by_service: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn commit(&mut self, ip: IpAddr, service: &ServiceRef) {
        let occupants = self.addresses_in_use.entry(ip).or_default();
        if !occupants.contains(service) {
            occupants.push(service.clone());
        }
        let owned = self.by_service.entry(service.clone()).or_default();
        if !owned.contains(&ip) {
            owned.push(ip);
        }
    }

    fn release_ip_internal(&mut self, service: &ServiceRef, ip: IpAddr) {
        if let Some(occupants) = self.addresses_in_use.get_mut(&ip) {
            occupants.retain(|s| s != service);
            if occupants.is_empty() {
                self.addresses_in_use.remove(&ip);
            }
        }
    }
}

impl Pool for NetboxPool {
    fn notify(&mut self, service: &ServiceRef, ip: IpAddr, _ports: &[Port], _key: &SharingKey) {
        self.commit(ip, service);
    }

    fn assign_next(
        &mut self,
        service: &ServiceRef,
        _families: &[AddressFamily],
        _ports: &[Port],
        _key: &SharingKey,
    ) -> Result<Vec<IpAddr>, PoolError> {
        // Backend failures (unreachable, deadline exceeded) are reported as
        // exhaustion-equivalent: the service is left unassigned and the
        // reconcile driver retries on the next pass.
        let cidr = self
            .client
            .fetch(self.deadline)
            .map_err(|_| PoolError::Exhausted)?;
        let ip = cidr.network_addr();
        self.commit(ip, service);
        Ok(vec![ip])
    }

    fn assign(
        &mut self,
        ip: IpAddr,
        service: &ServiceRef,
        _ports: &[Port],
        _key: &SharingKey,
    ) -> Result<(), PoolError> {
        self.commit(ip, service);
        Ok(())
    }

    fn release(&mut self, service: &ServiceRef) {
        if let Some(ips) = self.by_service.remove(service) {
            for ip in ips {
                self.release_ip_internal(service, ip);
            }
        }
    }

    fn release_ip(&mut self, service: &ServiceRef, ip: IpAddr) {
        if let Some(ips) = self.by_service.get_mut(service) {
            ips.retain(|a| *a != ip);
            if ips.is_empty() {
                self.by_service.remove(service);
            }
        }
        self.release_ip_internal(service, ip);
    }

    fn in_use(&self) -> u64 {
        self.addresses_in_use.len() as u64
    }

    fn size(&self) -> u64 {
        0
    }

    fn ranges(&self) -> &[IpRange] {
        &[]
    }

    fn contains(&self, ip: IpAddr) -> bool {
        self.addresses_in_use.contains_key(&ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FakeClient {
        next: AtomicUsize,
    }

    impl NetboxClient for FakeClient {
        fn fetch(&self, _deadline: Duration) -> Result<IpCidr, NetboxError> {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            Ok(IpCidr::from_str(&format!("10.10.0.{n}/32")).unwrap())
        }
    }

    #[test]
    fn assign_next_delegates_to_fetch_and_tracks_handouts() {
        let client = Box::new(FakeClient { next: AtomicUsize::new(1) });
        let mut pool = NetboxPool::new("nb", client, Duration::from_secs(1));
        let s1 = ServiceRef::new("default", "s1");

        let ips = pool.assign_next(&s1, &[], &[], &SharingKey::none()).unwrap();
        assert_eq!(ips.len(), 1);
        assert!(pool.contains(ips[0]));
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.size(), 0);

        pool.release(&s1);
        assert!(!pool.contains(ips[0]));
        assert_eq!(pool.in_use(), 0);
    }

    #[derive(Debug)]
    struct FailingClient;
    impl NetboxClient for FailingClient {
        fn fetch(&self, deadline: Duration) -> Result<IpCidr, NetboxError> {
            Err(NetboxError::DeadlineExceeded(deadline))
        }
    }

    #[test]
    fn backend_failure_is_reported_as_exhaustion() {
        let mut pool = NetboxPool::new("nb", Box::new(FailingClient), Duration::from_millis(50));
        let s1 = ServiceRef::new("default", "s1");
        let err = pool
            .assign_next(&s1, &[], &[], &SharingKey::none())
            .unwrap_err();
        assert_eq!(err, PoolError::Exhausted);
    }
}
