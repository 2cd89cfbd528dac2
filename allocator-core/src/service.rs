//! The identity and per-request data a pool needs to decide whether an
//! address can be handed to a service: who is asking, which ports they
//! want, what sharing key they carry, and which families they need.

use ipcidr::AddressFamily;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

impl ServiceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ServiceRef {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for ServiceRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NetProto {
    Tcp,
    Udp,
    Sctp,
}

impl Display for NetProto {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Sctp => write!(f, "sctp"),
        }
    }
}

impl AsRef<str> for NetProto {
    fn as_ref(&self) -> &str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Port {
    pub proto: NetProto,
    pub port: u16,
}

impl Display for Port {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.proto, self.port)
    }
}

/// An opaque sharing key. The empty string is normalized to "no key",
/// which disables sharing entirely: two services with no key can never
/// co-occupy an address, regardless of ports.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SharingKey(Option<String>);

impl SharingKey {
    pub fn none() -> Self {
        SharingKey(None)
    }

    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        if key.is_empty() {
            SharingKey(None)
        } else {
            SharingKey(Some(key))
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_shared(&self) -> bool {
        self.0.is_some()
    }
}

impl From<Option<String>> for SharingKey {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(s) => SharingKey::new(s),
            None => SharingKey::none(),
        }
    }
}

/// Everything the allocator needs to know about a service for the
/// duration of one `AllocateAnyIP` call. The reconcile driver builds this
/// from the service's annotations; the allocator itself never reaches
/// into a Kubernetes object directly.
#[derive(Clone, Debug, Default)]
pub struct AllocationRequest {
    pub service: ServiceRef,
    pub ports: Vec<Port>,
    pub sharing_key: SharingKey,
    pub ip_families: Vec<AddressFamily>,
    /// Explicit addresses requested via the `addresses` annotation (or the
    /// deprecated `spec.loadBalancerIP`); at most one per family.
    pub desired_addresses: Vec<IpAddr>,
    /// Preferred pool requested via the `service-group` annotation.
    pub desired_group: Option<String>,
    /// Set when `desired_addresses` was populated from the deprecated
    /// `spec.loadBalancerIP` field rather than the `addresses` annotation.
    /// The allocator raises one `DeprecationWarning` event per update when
    /// this is set; it has no other effect on allocation behavior.
    pub desired_from_deprecated_field: bool,
}
