//! The scripted stand-in for a reconcile driver's call sequence: an
//! ordered list of steps read from a YAML file and replayed against the
//! allocator one at a time, exactly as §8's literal end-to-end scenarios
//! describe them.

use allocator_core::{AllocationRequest, NetProto, Port, ServiceRef, SharingKey};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse scenario file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("step {index} ({step}): invalid address {address:?}")]
    InvalidAddress {
        index: usize,
        step: &'static str,
        address: String,
    },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortSpec {
    pub proto: NetProtoSpec,
    pub port: u16,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetProtoSpec {
    Tcp,
    Udp,
    Sctp,
}

impl From<NetProtoSpec> for NetProto {
    fn from(value: NetProtoSpec) -> Self {
        match value {
            NetProtoSpec::Tcp => NetProto::Tcp,
            NetProtoSpec::Udp => NetProto::Udp,
            NetProtoSpec::Sctp => NetProto::Sctp,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FamilySpec {
    V4,
    V6,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "step", rename_all = "kebab-case")]
pub enum ScenarioStep {
    /// Replay an already-assigned address into the named pool, as the
    /// reconcile driver does once per existing service at startup.
    #[serde(rename_all = "kebab-case")]
    NotifyExisting {
        namespace: String,
        name: String,
        pool: String,
        address: String,
        #[serde(default)]
        ports: Vec<PortSpec>,
        #[serde(default)]
        sharing_key: Option<String>,
    },
    /// `AllocateAnyIP` for a service.
    #[serde(rename_all = "kebab-case")]
    Allocate {
        namespace: String,
        name: String,
        #[serde(default)]
        ports: Vec<PortSpec>,
        #[serde(default)]
        sharing_key: Option<String>,
        #[serde(default)]
        ip_families: Vec<FamilySpec>,
        #[serde(default)]
        desired_addresses: Vec<String>,
        #[serde(default)]
        desired_group: Option<String>,
        /// The deprecated `spec.loadBalancerIP` equivalent. Only consulted
        /// when `desired_addresses` is empty; raises one deprecation event
        /// per step when present.
        #[serde(default)]
        load_balancer_ip: Option<String>,
    },
    /// `Unassign` a service.
    Unassign { namespace: String, name: String },
}

pub fn load(path: &std::path::Path) -> Result<Vec<ScenarioStep>, ScenarioError> {
    let file = std::fs::File::open(path).map_err(|source| ScenarioError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_reader(file).map_err(|source| ScenarioError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn ports_of(specs: &[PortSpec]) -> Vec<Port> {
    specs
        .iter()
        .map(|p| Port {
            proto: p.proto.into(),
            port: p.port,
        })
        .collect()
}

fn parse_address(index: usize, step: &'static str, raw: &str) -> Result<IpAddr, ScenarioError> {
    IpAddr::from_str(raw.trim()).map_err(|_| ScenarioError::InvalidAddress {
        index,
        step,
        address: raw.to_string(),
    })
}

/// Everything needed to drive one `Allocate` step, pre-parsed so the
/// caller never has to inspect `ScenarioStep` directly.
pub struct AllocateStep {
    pub request: AllocationRequest,
}

impl ScenarioStep {
    /// The service identity a step addresses, for logging.
    pub fn service(&self) -> ServiceRef {
        match self {
            ScenarioStep::NotifyExisting { namespace, name, .. }
            | ScenarioStep::Allocate { namespace, name, .. }
            | ScenarioStep::Unassign { namespace, name, .. } => {
                ServiceRef::new(namespace.clone(), name.clone())
            }
        }
    }

    pub fn as_allocate(&self, index: usize) -> Option<Result<AllocateStep, ScenarioError>> {
        let ScenarioStep::Allocate {
            ports,
            sharing_key,
            ip_families,
            desired_addresses,
            desired_group,
            load_balancer_ip,
            ..
        } = self
        else {
            return None;
        };

        let mut addrs = Vec::with_capacity(desired_addresses.len());
        for raw in desired_addresses {
            match parse_address(index, "allocate", raw) {
                Ok(ip) => addrs.push(ip),
                Err(e) => return Some(Err(e)),
            }
        }

        // The deprecated field is only consulted when the annotation-driven
        // list came back empty, matching the precedence the reconcile
        // driver is expected to apply before ever calling AllocateAnyIP.
        let desired_from_deprecated_field = addrs.is_empty() && load_balancer_ip.is_some();
        if addrs.is_empty() {
            if let Some(raw) = load_balancer_ip {
                match parse_address(index, "allocate", raw) {
                    Ok(ip) => addrs.push(ip),
                    Err(e) => return Some(Err(e)),
                }
            }
        }

        Some(Ok(AllocateStep {
            request: AllocationRequest {
                service: self.service(),
                ports: ports_of(ports),
                sharing_key: SharingKey::from(sharing_key.clone()),
                ip_families: ip_families
                    .iter()
                    .map(|f| match f {
                        FamilySpec::V4 => ipcidr::AddressFamily::V4,
                        FamilySpec::V6 => ipcidr::AddressFamily::V6,
                    })
                    .collect(),
                desired_addresses: addrs,
                desired_group: desired_group.clone(),
                desired_from_deprecated_field,
            },
        }))
    }

    pub fn as_notify_existing(
        &self,
        index: usize,
    ) -> Option<Result<(String, AllocationRequest, IpAddr), ScenarioError>> {
        let ScenarioStep::NotifyExisting {
            pool,
            address,
            ports,
            sharing_key,
            ..
        } = self
        else {
            return None;
        };

        Some(parse_address(index, "notify-existing", address).map(|ip| {
            (
                pool.clone(),
                AllocationRequest {
                    service: self.service(),
                    ports: ports_of(ports),
                    sharing_key: SharingKey::from(sharing_key.clone()),
                    ip_families: Vec::new(),
                    desired_addresses: Vec::new(),
                    desired_group: None,
                    desired_from_deprecated_field: false,
                },
                ip,
            )
        }))
    }
}
