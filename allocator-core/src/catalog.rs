//! Builds a name-keyed set of pools from declarative group specs, dropping
//! (and reporting) anything ill-formed, duplicate, or overlapping rather
//! than failing the whole configuration.

use crate::local_pool::LocalPool;
use crate::netbox_pool::{NetboxClient, NetboxPool};
use crate::pool::{pools_overlap, Pool};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddressRangeSpec {
    /// Either a CIDR (`1.2.3.0/24`) or an explicit `A - B` range.
    pub pool: String,
    /// The subnet the range must fall within.
    pub subnet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetboxSpec {
    pub url: String,
    pub tenant: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceGroupSpec {
    /// Addresses announced directly by the node the allocator shares a
    /// data plane with.
    Local {
        #[serde(default)]
        v4: Vec<AddressRangeSpec>,
        #[serde(default)]
        v6: Vec<AddressRangeSpec>,
    },
    /// Addresses announced by an upstream router (e.g. over BGP). The
    /// allocation algorithm is identical to `Local`; only the downstream
    /// announcer differs, and the announcer is out of scope for this
    /// crate.
    Remote {
        #[serde(default)]
        v4: Vec<AddressRangeSpec>,
        #[serde(default)]
        v6: Vec<AddressRangeSpec>,
    },
    Netbox(NetboxSpec),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub name: String,
    #[serde(flatten)]
    pub spec: ServiceGroupSpec,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogEventKind {
    Accepted,
    ParseFailed(String),
    DuplicateName,
    Overlap { with: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogEvent {
    pub group: String,
    pub kind: CatalogEventKind,
}

/// Builds `NetboxClient`s for netbox-backed groups. The crate never
/// constructs an HTTP client itself; the reconcile driver supplies this
/// factory at `SetPools` time.
pub trait NetboxClientFactory {
    fn build(&self, url: &str, tenant: &str) -> Box<dyn NetboxClient>;
}

impl<F> NetboxClientFactory for F
where
    F: Fn(&str, &str) -> Box<dyn NetboxClient>,
{
    fn build(&self, url: &str, tenant: &str) -> Box<dyn NetboxClient> {
        self(url, tenant)
    }
}

#[derive(Default, Debug)]
pub struct Catalog {
    pools: Vec<(String, Box<dyn Pool>)>,
}

impl Catalog {
    pub fn empty() -> Self {
        Catalog { pools: Vec::new() }
    }

    /// Processes `groups` in order, accepting each pool only if it parses,
    /// has a unique name, and does not overlap any already-accepted pool.
    /// A later entry always loses to an earlier one.
    pub fn from_groups(
        groups: &[ServiceGroup],
        netbox_clients: &dyn NetboxClientFactory,
        netbox_deadline: Duration,
    ) -> (Catalog, Vec<CatalogEvent>) {
        let mut pools: Vec<(String, Box<dyn Pool>)> = Vec::new();
        let mut events = Vec::new();

        for group in groups {
            if pools.iter().any(|(name, _)| name == &group.name) {
                tracing::warn!(pool = %group.name, "dropping pool with duplicate name");
                events.push(CatalogEvent {
                    group: group.name.clone(),
                    kind: CatalogEventKind::DuplicateName,
                });
                continue;
            }

            let built: Result<Box<dyn Pool>, String> = match &group.spec {
                ServiceGroupSpec::Netbox(NetboxSpec { url, tenant }) => {
                    let client = netbox_clients.build(url, tenant);
                    Ok(Box::new(NetboxPool::new(group.name.clone(), client, netbox_deadline)))
                }
                ServiceGroupSpec::Local { v4, v6 } | ServiceGroupSpec::Remote { v4, v6 } => {
                    LocalPool::from_specs(group.name.clone(), v4, v6)
                        .map(|p| Box::new(p) as Box<dyn Pool>)
                        .map_err(|e| e.to_string())
                }
            };

            let pool = match built {
                Ok(p) => p,
                Err(message) => {
                    tracing::warn!(pool = %group.name, error = %message, "dropping ill-formed pool");
                    events.push(CatalogEvent {
                        group: group.name.clone(),
                        kind: CatalogEventKind::ParseFailed(message),
                    });
                    continue;
                }
            };

            if let Some((other, _)) = pools
                .iter()
                .find(|(_, existing)| pools_overlap(existing.as_ref(), pool.as_ref()))
            {
                let other = other.clone();
                tracing::warn!(pool = %group.name, overlaps_with = %other, "dropping overlapping pool");
                events.push(CatalogEvent {
                    group: group.name.clone(),
                    kind: CatalogEventKind::Overlap { with: other },
                });
                continue;
            }

            events.push(CatalogEvent {
                group: group.name.clone(),
                kind: CatalogEventKind::Accepted,
            });
            pools.push((group.name.clone(), pool));
        }

        (Catalog { pools }, events)
    }

    pub fn get(&self, name: &str) -> Option<&dyn Pool> {
        self.pools
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn Pool + 'static)> {
        self.pools
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.as_mut())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pools.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut (dyn Pool + 'static))> {
        self.pools.iter_mut().map(|(n, p)| (n.as_str(), p.as_mut()))
    }

    /// The name of the pool that owns `ip`, if any. Well-defined because
    /// accepted pools never overlap.
    pub fn resolve_address(&self, ip: IpAddr) -> Option<&str> {
        self.pools
            .iter()
            .find(|(_, p)| p.contains(ip))
            .map(|(n, _)| n.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netbox_pool::NetboxError;

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

    #[test]
    fn drops_duplicate_and_overlapping_pools_keeping_the_earlier_one() {
        let groups = vec![
            local_group("default", "1.2.3.0/24", "1.2.3.0/24"),
            local_group("default", "5.5.5.0/24", "5.5.5.0/24"),
            local_group("other", "1.2.3.128/25", "1.2.3.0/24"),
        ];
        let (catalog, events) = Catalog::from_groups(&groups, &no_netbox(), Duration::from_secs(1));

        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["default"]);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, CatalogEventKind::Accepted);
        assert_eq!(events[1].kind, CatalogEventKind::DuplicateName);
        assert_eq!(
            events[2].kind,
            CatalogEventKind::Overlap { with: "default".to_string() }
        );
    }

    #[test]
    fn drops_ill_formed_pool_without_affecting_others() {
        let groups = vec![
            local_group("bad", "1.2.3.0/31", "9.9.9.0/24"),
            local_group("good", "10.0.0.0/31", "10.0.0.0/24"),
        ];
        let (catalog, events) = Catalog::from_groups(&groups, &no_netbox(), Duration::from_secs(1));
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["good"]);
        assert!(matches!(events[0].kind, CatalogEventKind::ParseFailed(_)));
    }
}
