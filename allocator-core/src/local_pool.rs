//! A range-backed pool: addresses come from ranges the operator configured
//! directly (as opposed to [`crate::netbox_pool::NetboxPool`], which asks an
//! external IPAM for each address). This is where the sharing protocol and
//! port bookkeeping actually live.

use crate::catalog::AddressRangeSpec;
use crate::pool::{Pool, PoolError};
use crate::service::{Port, ServiceRef, SharingKey};
use ipcidr::{cidr_contains_inclusive, AddressFamily, IpCidr, IpRange, RangeParseError};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocalPoolError {
    #[error("no valid address range found")]
    NoValidRange,
    #[error(transparent)]
    RangeParse(#[from] RangeParseError),
    #[error("invalid subnet {0}")]
    InvalidSubnet(String),
    #[error("range {range} is not contained by subnet {subnet}")]
    RangeNotInSubnet { range: String, subnet: String },
}

#[derive(Debug)]
pub struct LocalPool {
    name: String,
    ranges: Vec<IpRange>,
    addresses_in_use: HashMap<IpAddr, Vec<ServiceRef>>,
    sharing_keys: HashMap<IpAddr, String>,
    ports_in_use: HashMap<IpAddr, HashMap<Port, ServiceRef>>,
    sharing_key_to_ip: HashMap<(String, AddressFamily), IpAddr>,
    by_service: HashMap<ServiceRef, Vec<IpAddr>>,
}

impl LocalPool {
    pub fn new(name: impl Into<String>, ranges: Vec<IpRange>) -> Result<Self, LocalPoolError> {
        if ranges.is_empty() {
            return Err(LocalPoolError::NoValidRange);
        }
        Ok(LocalPool {
            name: name.into(),
            ranges,
            addresses_in_use: HashMap::new(),
            sharing_keys: HashMap::new(),
            ports_in_use: HashMap::new(),
            sharing_key_to_ip: HashMap::new(),
            by_service: HashMap::new(),
        })
    }

    /// Parses and validates a declarative `v4`/`v6` range list, rejecting
    /// the whole pool if any single range fails to parse or escapes its
    /// declared subnet.
    pub fn from_specs(
        name: impl Into<String>,
        v4: &[AddressRangeSpec],
        v6: &[AddressRangeSpec],
    ) -> Result<Self, LocalPoolError> {
        let mut ranges = Vec::new();
        for spec in v4.iter().chain(v6.iter()) {
            let range = IpRange::from_str(&spec.pool)?;
            let subnet = IpCidr::from_str(&spec.subnet)
                .map_err(|_| LocalPoolError::InvalidSubnet(spec.subnet.clone()))?;
            if !range.contained_by(&subnet) {
                return Err(LocalPoolError::RangeNotInSubnet {
                    range: spec.pool.clone(),
                    subnet: spec.subnet.clone(),
                });
            }
            ranges.push(range);
        }
        Self::new(name, ranges)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn has_family(&self, service: &ServiceRef, family: AddressFamily) -> bool {
        self.by_service
            .get(service)
            .map(|ips| ips.iter().any(|ip| family_of(ip) == family))
            .unwrap_or(false)
    }

    /// The five-step availability predicate: family-sharing binding, the
    /// empty-address and same-service fast paths, key agreement, then port
    /// disjointness.
    fn available(
        &self,
        ip: &IpAddr,
        service: &ServiceRef,
        ports: &[Port],
        key: &SharingKey,
    ) -> Result<(), PoolError> {
        let family = family_of(ip);

        if let Some(k) = key.as_str() {
            if let Some(bound) = self.sharing_key_to_ip.get(&(k.to_string(), family)) {
                if bound != ip {
                    return Err(PoolError::SharingKeyConflict { bound_to: *bound });
                }
            }
        }

        let Some(occupants) = self.addresses_in_use.get(ip) else {
            return Ok(());
        };

        if occupants.iter().all(|s| s == service) {
            return Ok(());
        }

        let existing_key = self.sharing_keys.get(ip).map(|s| s.as_str());
        match (existing_key, key.as_str()) {
            (Some(existing), Some(requested)) if existing == requested => {}
            _ => return Err(PoolError::SharingKeyConflict { bound_to: *ip }),
        }

        if let Some(held) = self.ports_in_use.get(ip) {
            for p in ports {
                if let Some(holder) = held.get(p) {
                    if holder != service {
                        return Err(PoolError::PortConflict(*p));
                    }
                }
            }
        }

        Ok(())
    }

    fn commit(&mut self, ip: IpAddr, service: &ServiceRef, ports: &[Port], key: &SharingKey) {
        let occupants = self.addresses_in_use.entry(ip).or_default();
        if !occupants.contains(service) {
            occupants.push(service.clone());
        }

        if let Some(k) = key.as_str() {
            self.sharing_keys.insert(ip, k.to_string());
            self.sharing_key_to_ip
                .insert((k.to_string(), family_of(&ip)), ip);
        }

        let held = self.ports_in_use.entry(ip).or_default();
        for p in ports {
            held.insert(*p, service.clone());
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
                if let Some(k) = self.sharing_keys.remove(&ip) {
                    self.sharing_key_to_ip.remove(&(k, family_of(&ip)));
                }
            }
        }
        if let Some(held) = self.ports_in_use.get_mut(&ip) {
            held.retain(|_, s| s != service);
            if held.is_empty() {
                self.ports_in_use.remove(&ip);
            }
        }
    }

    fn assign_first_available(
        &mut self,
        family: AddressFamily,
        service: &ServiceRef,
        ports: &[Port],
        key: &SharingKey,
    ) -> Result<IpAddr, PoolError> {
        let mut first_rejection: Option<PoolError> = None;
        for range in self.ranges.iter().filter(|r| r.family() == family) {
            let mut candidate = Some(range.first());
            while let Some(ip) = candidate {
                match self.available(&ip, service, ports, key) {
                    Ok(()) => {
                        self.commit(ip, service, ports, key);
                        return Ok(ip);
                    }
                    Err(e) => {
                        if first_rejection.is_none() {
                            first_rejection = Some(e);
                        }
                    }
                }
                candidate = range.next(&ip);
            }
        }
        Err(first_rejection.unwrap_or(PoolError::Exhausted))
    }
}

fn family_of(ip: &IpAddr) -> AddressFamily {
    match ip {
        IpAddr::V4(_) => AddressFamily::V4,
        IpAddr::V6(_) => AddressFamily::V6,
    }
}

impl Pool for LocalPool {
    fn notify(&mut self, service: &ServiceRef, ip: IpAddr, ports: &[Port], key: &SharingKey) {
        self.commit(ip, service, ports, key);
    }

    fn assign_next(
        &mut self,
        service: &ServiceRef,
        families: &[AddressFamily],
        ports: &[Port],
        key: &SharingKey,
    ) -> Result<Vec<IpAddr>, PoolError> {
        if families.is_empty() {
            for family in [AddressFamily::V6, AddressFamily::V4] {
                if self.has_family(service, family) {
                    return Ok(Vec::new());
                }
                if let Ok(ip) = self.assign_first_available(family, service, ports, key) {
                    return Ok(vec![ip]);
                }
            }
            return Err(PoolError::Exhausted);
        }

        let mut assigned = Vec::new();
        for &family in families {
            if self.has_family(service, family) {
                continue;
            }
            let ip = self.assign_first_available(family, service, ports, key)?;
            assigned.push(ip);
        }
        Ok(assigned)
    }

    fn assign(
        &mut self,
        ip: IpAddr,
        service: &ServiceRef,
        ports: &[Port],
        key: &SharingKey,
    ) -> Result<(), PoolError> {
        if !self.contains(ip) {
            return Err(PoolError::AddressNotAllowed(ip));
        }
        self.available(&ip, service, ports, key)?;
        self.commit(ip, service, ports, key);
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
        self.ranges.iter().fold(0u64, |acc, r| acc.saturating_add(r.size()))
    }

    fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    fn contains(&self, ip: IpAddr) -> bool {
        self.ranges.iter().any(|r| r.contains(&ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str) -> ServiceRef {
        ServiceRef::new("default", name)
    }

    fn pool(cidr: &str) -> LocalPool {
        LocalPool::new("default", vec![IpRange::from_str(cidr).unwrap()]).unwrap()
    }

    #[test]
    fn basic_exhaustion_and_release() {
        let mut p = pool("1.2.3.0/31");
        let s1 = svc("s1");
        let s2 = svc("s2");
        let s3 = svc("s3");

        let a1 = p.assign_next(&s1, &[], &[], &SharingKey::none()).unwrap();
        let a2 = p.assign_next(&s2, &[], &[], &SharingKey::none()).unwrap();
        assert_ne!(a1, a2);

        let err = p
            .assign_next(&s3, &[], &[], &SharingKey::none())
            .unwrap_err();
        assert_eq!(err, PoolError::Exhausted);

        p.release(&s1);
        let a3 = p.assign_next(&s3, &[], &[], &SharingKey::none()).unwrap();
        assert_eq!(a3, a1);
    }

    #[test]
    fn sharing_with_disjoint_ports() {
        let mut p = pool("1.2.3.0/31");
        let s1 = svc("s1");
        let s2 = svc("s2");
        let s3 = svc("s3");
        let key = SharingKey::new("k");
        let p80 = Port { proto: crate::service::NetProto::Tcp, port: 80 };
        let p443 = Port { proto: crate::service::NetProto::Tcp, port: 443 };

        let a1 = p.assign_next(&s1, &[], &[p80], &key).unwrap()[0];
        let a2 = p.assign(a1, &s2, &[p443], &key);
        assert!(a2.is_ok());

        let err = p.assign_next(&s3, &[], &[p80], &key).unwrap_err();
        assert_eq!(err, PoolError::PortConflict(p80));
    }

    #[test]
    fn sharing_key_is_bound_per_family() {
        let mut p4 = pool("1.2.3.0/30");
        let mut p6 = pool("2001:db8::/127");
        let s1 = svc("s1");
        let key = SharingKey::new("k");
        let p80 = Port { proto: crate::service::NetProto::Tcp, port: 80 };

        let a1 = p4.assign_next(&s1, &[], &[p80], &key).unwrap()[0];

        let s2 = svc("s2");
        let a2 = p6
            .assign_next(&s2, &[AddressFamily::V6], &[p80], &key)
            .unwrap();
        assert_eq!(a2.len(), 1);

        let s3 = svc("s3");
        let other_v4: IpAddr = "1.2.3.2".parse().unwrap();
        let err = p4.assign(other_v4, &s3, &[p80], &key).unwrap_err();
        assert_eq!(err, PoolError::SharingKeyConflict { bound_to: a1 });
    }

    #[test]
    fn dual_stack_transition_keeps_existing_family() {
        let mut p = LocalPool::new(
            "dual",
            vec![
                IpRange::from_str("1.2.3.0/31").unwrap(),
                IpRange::from_str("2001:db8::/127").unwrap(),
            ],
        )
        .unwrap();
        let s1 = svc("s1");
        let v4: IpAddr = "1.2.3.0".parse().unwrap();
        p.assign(v4, &s1, &[], &SharingKey::none()).unwrap();

        let assigned = p
            .assign_next(&s1, &[AddressFamily::V4, AddressFamily::V6], &[], &SharingKey::none())
            .unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(family_of(&assigned[0]), AddressFamily::V6);

        assert_eq!(p.in_use(), 2);
        p.release_ip(&s1, assigned[0]);
        assert_eq!(p.in_use(), 1);
    }
}
