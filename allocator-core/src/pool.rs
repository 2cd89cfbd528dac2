//! The `Pool` capability set shared by [`crate::local_pool::LocalPool`] and
//! [`crate::netbox_pool::NetboxPool`]. Dispatch between the two is always
//! through `dyn Pool`; there is no enum-of-pool-kinds anywhere above this
//! module.

use crate::service::{Port, ServiceRef, SharingKey};
use ipcidr::{AddressFamily, IpRange};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    Exhausted,
    PortConflict,
    SharingKeyConflict,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Exhausted => "exhausted",
            RejectReason::PortConflict => "port_conflict",
            RejectReason::SharingKeyConflict => "sharing_key_conflict",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("no available address satisfies the request")]
    Exhausted,
    #[error("port {0} is already in use on this address")]
    PortConflict(Port),
    #[error("sharing key is bound to a different address: {bound_to}")]
    SharingKeyConflict { bound_to: IpAddr },
    #[error("address {0} does not belong to this pool")]
    AddressNotAllowed(IpAddr),
}

impl PoolError {
    /// The rejection reason counted in the `allocation_rejected_total`
    /// metric, or `None` for errors that are never an assignment-time
    /// rejection (e.g. a caller asking for an address outside the pool).
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            PoolError::Exhausted => Some(RejectReason::Exhausted),
            PoolError::PortConflict(_) => Some(RejectReason::PortConflict),
            PoolError::SharingKeyConflict { .. } => Some(RejectReason::SharingKeyConflict),
            PoolError::AddressNotAllowed(_) => None,
        }
    }
}

pub trait Pool: std::fmt::Debug + Send {
    /// Record an address as already assigned to `service`, without
    /// re-running the availability predicate. Used for startup replay.
    fn notify(&mut self, service: &ServiceRef, ip: IpAddr, ports: &[Port], key: &SharingKey);

    /// Pick addresses for `service`, one per family in `families` (or, if
    /// `families` is empty, exactly one address in whichever family is
    /// available, IPv6 first). Returns the newly-assigned addresses;
    /// families the service already holds an address in are left alone.
    fn assign_next(
        &mut self,
        service: &ServiceRef,
        families: &[AddressFamily],
        ports: &[Port],
        key: &SharingKey,
    ) -> Result<Vec<IpAddr>, PoolError>;

    /// Assign a caller-chosen address.
    fn assign(
        &mut self,
        ip: IpAddr,
        service: &ServiceRef,
        ports: &[Port],
        key: &SharingKey,
    ) -> Result<(), PoolError>;

    /// Release every address held by `service`. Idempotent: releasing a
    /// service the pool never held is a no-op.
    fn release(&mut self, service: &ServiceRef);

    /// Release a single address held by `service`, leaving any other
    /// address of theirs untouched (used on a dual-stack to single-stack
    /// transition).
    fn release_ip(&mut self, service: &ServiceRef, ip: IpAddr);

    /// Count of addresses with at least one occupant.
    fn in_use(&self) -> u64;

    /// Total addressable size of the pool. `NetboxPool` reports 0: it has
    /// no bounded range of its own.
    fn size(&self) -> u64;

    /// The ranges backing this pool, for overlap detection. Empty for
    /// pools (like `NetboxPool`) that do not own a numeric range.
    fn ranges(&self) -> &[IpRange];

    /// True iff `ip` belongs to this pool: for a range-backed pool, numeric
    /// containment; for `NetboxPool`, "previously handed out by this pool".
    fn contains(&self, ip: IpAddr) -> bool;
}

/// Two pools overlap iff any of their ranges overlap. A pool with no ranges
/// of its own (`NetboxPool`) never overlaps anything, which is exactly what
/// we want: the aggregate it draws from is not ours to validate.
pub fn pools_overlap(a: &dyn Pool, b: &dyn Pool) -> bool {
    a.ranges()
        .iter()
        .any(|ra| b.ranges().iter().any(|rb| ra.overlaps(rb)))
}
