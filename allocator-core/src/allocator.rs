//! The façade the reconcile driver talks to: `SetPools`, `NotifyExisting`,
//! `AllocateAnyIP`, `Unassign`. Everything below this module is an
//! implementation detail the driver never touches directly.

use crate::catalog::{Catalog, CatalogEventKind, NetboxClientFactory, ServiceGroup};
use crate::events::{EventRecorder, TracingEventRecorder};
use crate::metrics;
use crate::pool::PoolError;
use crate::service::{AllocationRequest, ServiceRef};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("no pool named {0}")]
    NoSuchPool(String),
    #[error("address {address} belongs to pool {actual_pool}, not the requested group {requested_group}")]
    GroupMismatch {
        address: IpAddr,
        actual_pool: String,
        requested_group: String,
    },
    #[error("address {0} does not belong to any configured pool")]
    AddressNotInAnyPool(IpAddr),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub struct Allocator<R: EventRecorder = TracingEventRecorder> {
    catalog: Catalog,
    events: R,
}

impl Allocator<TracingEventRecorder> {
    pub fn new() -> Self {
        Allocator {
            catalog: Catalog::empty(),
            events: TracingEventRecorder,
        }
    }
}

impl Default for Allocator<TracingEventRecorder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: EventRecorder> Allocator<R> {
    pub fn with_recorder(events: R) -> Self {
        Allocator {
            catalog: Catalog::empty(),
            events,
        }
    }

    /// Replaces the pool catalog wholesale. Metrics for pools that no
    /// longer exist are zeroed; metrics for surviving and new pools are
    /// refreshed immediately.
    pub fn set_pools(
        &mut self,
        groups: &[ServiceGroup],
        netbox_clients: &dyn NetboxClientFactory,
        netbox_deadline: Duration,
    ) {
        let (catalog, events) = Catalog::from_groups(groups, netbox_clients, netbox_deadline);

        let removed: Vec<String> = self
            .catalog
            .names()
            .filter(|name| catalog.get(name).is_none())
            .map(|s| s.to_string())
            .collect();
        for name in &removed {
            metrics::clear_pool_metrics(name);
        }

        for event in &events {
            let subject = format!("pool/{}", event.group);
            match &event.kind {
                CatalogEventKind::Accepted => {
                    self.events.infof(&subject, "Parsed", "pool accepted");
                }
                CatalogEventKind::ParseFailed(msg) => {
                    self.events.errorf(&subject, "ParseFailed", msg);
                }
                CatalogEventKind::DuplicateName => {
                    self.events
                        .errorf(&subject, "ParseFailed", "duplicate pool name");
                }
                CatalogEventKind::Overlap { with } => {
                    self.events.errorf(
                        &subject,
                        "ParseFailed",
                        &format!("overlaps with pool {with}"),
                    );
                }
            }
        }

        self.catalog = catalog;
        self.refresh_all_metrics();
    }

    /// Startup replay: tell the named pool about an address the cluster
    /// already reports as assigned. If the pool no longer exists (the
    /// config changed since the address was handed out) this is a no-op.
    pub fn notify_existing(
        &mut self,
        pool_name: &str,
        request: &AllocationRequest,
        ip: IpAddr,
    ) {
        if let Some(pool) = self.catalog.get_mut(pool_name) {
            pool.notify(&request.service, ip, &request.ports, &request.sharing_key);
            self.refresh_all_metrics();
        }
    }

    /// Resolves and assigns addresses for `request`. A prior assignment for
    /// the service is released only once the requested address/group has
    /// been validated — a rejected request (group mismatch, unknown pool,
    /// unknown address) must leave any existing assignment untouched.
    pub fn allocate_any_ip(
        &mut self,
        request: &AllocationRequest,
    ) -> Result<Vec<IpAddr>, AllocatorError> {
        if request.desired_from_deprecated_field {
            self.events.errorf(
                &request.service.to_string(),
                "DeprecationWarning",
                "spec.loadBalancerIP is deprecated; use the addresses annotation instead",
            );
        }

        let result = if !request.desired_addresses.is_empty() {
            self.allocate_explicit(request)
        } else {
            self.allocate_from_group(request)
        };

        self.refresh_all_metrics();
        result
    }

    fn allocate_explicit(
        &mut self,
        request: &AllocationRequest,
    ) -> Result<Vec<IpAddr>, AllocatorError> {
        // Resolve and validate every requested address before touching any
        // pool's state, so a rejection here leaves the prior assignment in
        // place.
        let mut pool_names = Vec::with_capacity(request.desired_addresses.len());
        for &ip in &request.desired_addresses {
            let pool_name = self
                .catalog
                .resolve_address(ip)
                .ok_or(AllocatorError::AddressNotInAnyPool(ip))?
                .to_string();

            if let Some(group) = &request.desired_group {
                if group != &pool_name {
                    let err = AllocatorError::GroupMismatch {
                        address: ip,
                        actual_pool: pool_name.clone(),
                        requested_group: group.clone(),
                    };
                    self.events.errorf(
                        &request.service.to_string(),
                        "GroupMismatch",
                        &err.to_string(),
                    );
                    return Err(err);
                }
            }

            pool_names.push(pool_name);
        }

        self.release_from_all_pools(&request.service);

        let mut assigned = Vec::new();
        for (&ip, pool_name) in request.desired_addresses.iter().zip(pool_names) {
            let pool = self
                .catalog
                .get_mut(&pool_name)
                .expect("pool resolved by address lookup must exist");
            match pool.assign(ip, &request.service, &request.ports, &request.sharing_key) {
                Ok(()) => assigned.push(ip),
                Err(e) => {
                    if let Some(reason) = e.reject_reason() {
                        metrics::record_rejection(&pool_name, reason);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(assigned)
    }

    fn allocate_from_group(
        &mut self,
        request: &AllocationRequest,
    ) -> Result<Vec<IpAddr>, AllocatorError> {
        let pool_name = request
            .desired_group
            .clone()
            .unwrap_or_else(|| "default".to_string());
        if self.catalog.get(&pool_name).is_none() {
            return Err(AllocatorError::NoSuchPool(pool_name));
        }

        self.release_from_all_pools(&request.service);

        let pool = self
            .catalog
            .get_mut(&pool_name)
            .expect("pool existence just checked above");

        match pool.assign_next(&request.service, &request.ip_families, &request.ports, &request.sharing_key) {
            Ok(ips) => Ok(ips),
            Err(e) => {
                if let Some(reason) = e.reject_reason() {
                    metrics::record_rejection(&pool_name, reason);
                }
                Err(e.into())
            }
        }
    }

    /// Releases every address held by `service`, across all pools.
    /// Idempotent: a service the catalog never allocated to is a no-op.
    pub fn unassign(&mut self, service: &ServiceRef) {
        self.release_from_all_pools(service);
        self.refresh_all_metrics();
    }

    fn release_from_all_pools(&mut self, service: &ServiceRef) {
        for (_, pool) in self.catalog.iter_mut() {
            pool.release(service);
        }
    }

    fn refresh_all_metrics(&self) {
        for name in self.catalog.names() {
            let pool = self.catalog.get(name).expect("name came from the catalog");
            metrics::report_pool_size(name, pool.size());
            metrics::report_pool_in_use(name, pool.in_use());
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AddressRangeSpec, ServiceGroupSpec};
    use crate::netbox_pool::{NetboxClient, NetboxError};
    use crate::service::SharingKey;

    #[derive(Debug)]
    struct UnreachableClient;
    impl NetboxClient for UnreachableClient {
        fn fetch(&self, _deadline: Duration) -> Result<ipcidr::IpCidr, NetboxError> {
            Err(NetboxError::Backend("not used in this test".into()))
        }
    }

    fn no_netbox() -> impl Fn(&str, &str) -> Box<dyn NetboxClient> {
        |_, _| Box::new(UnreachableClient)
    }

    fn local_group(name: &str, range: &str, subnet: &str) -> ServiceGroup {
        ServiceGroup {
            name: name.to_string(),
            spec: ServiceGroupSpec::Local {
                v4: vec![AddressRangeSpec {
                    pool: range.to_string(),
                    subnet: subnet.to_string(),
                    aggregation: None,
                }],
                v6: vec![],
            },
        }
    }

    fn request(name: &str) -> AllocationRequest {
        AllocationRequest {
            service: ServiceRef::new("default", name),
            ports: vec![],
            sharing_key: SharingKey::none(),
            ip_families: vec![],
            desired_addresses: vec![],
            desired_group: None,
            desired_from_deprecated_field: false,
        }
    }

    #[test]
    fn allocates_from_default_pool_and_is_idempotent() {
        let mut allocator = Allocator::new();
        allocator.set_pools(
            &[local_group("default", "1.2.3.0/31", "1.2.3.0/24")],
            &no_netbox(),
            Duration::from_secs(1),
        );

        let req = request("s1");
        let first = allocator.allocate_any_ip(&req).unwrap();
        let second = allocator.allocate_any_ip(&req).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn explicit_group_mismatch_is_rejected() {
        let mut allocator = Allocator::new();
        allocator.set_pools(
            &[
                local_group("default", "1.2.3.0/31", "1.2.3.0/24"),
                local_group("alt", "3.2.1.0/31", "3.2.1.0/24"),
            ],
            &no_netbox(),
            Duration::from_secs(1),
        );

        let mut req = request("s1");
        req.desired_addresses = vec!["1.2.3.0".parse().unwrap()];
        req.desired_group = Some("alt".to_string());

        let err = allocator.allocate_any_ip(&req).unwrap_err();
        assert!(matches!(err, AllocatorError::GroupMismatch { .. }));
    }

    #[test]
    fn group_mismatch_leaves_prior_assignment_untouched() {
        let mut allocator = Allocator::new();
        allocator.set_pools(
            &[
                local_group("default", "1.2.3.0/31", "1.2.3.0/24"),
                local_group("alt", "3.2.1.0/31", "3.2.1.0/24"),
            ],
            &no_netbox(),
            Duration::from_secs(1),
        );

        let mut req = request("s1");
        req.desired_addresses = vec!["1.2.3.0".parse().unwrap()];
        let first = allocator.allocate_any_ip(&req).unwrap();
        assert_eq!(first, vec!["1.2.3.0".parse::<IpAddr>().unwrap()]);

        req.desired_group = Some("alt".to_string());
        let err = allocator.allocate_any_ip(&req).unwrap_err();
        assert!(matches!(err, AllocatorError::GroupMismatch { .. }));

        let default_pool = allocator.catalog().get("default").unwrap();
        assert_eq!(default_pool.in_use(), 1);
        assert!(default_pool.contains("1.2.3.0".parse().unwrap()));
    }

    #[test]
    fn unknown_group_leaves_prior_assignment_untouched() {
        let mut allocator = Allocator::new();
        allocator.set_pools(
            &[local_group("default", "1.2.3.0/31", "1.2.3.0/24")],
            &no_netbox(),
            Duration::from_secs(1),
        );

        let req = request("s1");
        allocator.allocate_any_ip(&req).unwrap();

        let mut req2 = request("s1");
        req2.desired_group = Some("missing".to_string());
        let err = allocator.allocate_any_ip(&req2).unwrap_err();
        assert!(matches!(err, AllocatorError::NoSuchPool(_)));

        let default_pool = allocator.catalog().get("default").unwrap();
        assert_eq!(default_pool.in_use(), 1);
    }

    #[derive(Debug, Default)]
    struct RecordingRecorder {
        events: std::cell::RefCell<Vec<(String, String)>>,
    }

    impl EventRecorder for RecordingRecorder {
        fn infof(&self, _subject: &str, reason: &str, message: &str) {
            self.events
                .borrow_mut()
                .push((reason.to_string(), message.to_string()));
        }

        fn errorf(&self, _subject: &str, reason: &str, message: &str) {
            self.events
                .borrow_mut()
                .push((reason.to_string(), message.to_string()));
        }
    }

    #[test]
    fn deprecated_field_raises_exactly_one_warning_per_update() {
        let mut allocator = Allocator::with_recorder(RecordingRecorder::default());
        allocator.set_pools(
            &[local_group("default", "1.2.3.0/31", "1.2.3.0/24")],
            &no_netbox(),
            Duration::from_secs(1),
        );

        let mut req = request("s1");
        req.desired_addresses = vec!["1.2.3.0".parse().unwrap()];
        req.desired_from_deprecated_field = true;
        allocator.allocate_any_ip(&req).unwrap();

        let count = allocator
            .events
            .events
            .borrow()
            .iter()
            .filter(|(reason, _)| reason == "DeprecationWarning")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn unassign_releases_and_is_idempotent() {
        let mut allocator = Allocator::new();
        allocator.set_pools(
            &[local_group("default", "1.2.3.0/31", "1.2.3.0/24")],
            &no_netbox(),
            Duration::from_secs(1),
        );
        let req = request("s1");
        allocator.allocate_any_ip(&req).unwrap();
        allocator.unassign(&req.service);
        allocator.unassign(&req.service);

        let reallocated = allocator.allocate_any_ip(&req).unwrap();
        assert_eq!(reallocated.len(), 1);
    }

    #[test]
    fn startup_replay_reserves_the_observed_address() {
        let mut allocator = Allocator::new();
        allocator.set_pools(
            &[local_group("default", "192.168.1.2/31", "192.168.1.0/24")],
            &no_netbox(),
            Duration::from_secs(1),
        );

        let existing = request("s1");
        allocator.notify_existing("default", &existing, "192.168.1.2".parse().unwrap());

        let req2 = request("s2");
        let assigned = allocator.allocate_any_ip(&req2).unwrap();
        assert_eq!(assigned, vec!["192.168.1.3".parse::<IpAddr>().unwrap()]);
    }
}
