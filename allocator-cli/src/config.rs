//! The CLI's command-line surface: paths to the pool configuration and an
//! optional scenario file, mirroring the teacher daemon's `XcConfigArg`
//! (a `clap::Parser` struct consumed once at startup, next to a YAML
//! document parsed separately).

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

fn default_netbox_timeout() -> Duration {
    Duration::from_millis(2_000)
}

/// Drives the allocator core against a YAML pool file and, optionally, a
/// scripted scenario file. Plays the role of a stand-in reconcile driver:
/// no watch/informer machinery, no leader election, no CRD client.
#[derive(Parser, Debug, Clone)]
#[command(name = "allocator-cli", version, about)]
pub struct CliArgs {
    /// YAML document listing the pool groups (`ServiceGroup` records).
    #[arg(long = "pools", short = 'p')]
    pub pools_path: PathBuf,

    /// YAML document listing scenario steps to replay in order. Without
    /// one, the CLI loads the pool file, prints the catalog, and exits.
    #[arg(long = "scenario", short = 's')]
    pub scenario_path: Option<PathBuf>,

    /// Deadline passed to every `NetboxPool::assign_next` call.
    #[arg(long = "netbox-timeout-ms", default_value_t = 2_000)]
    pub netbox_timeout_ms: u64,

    /// A CIDR to hand out addresses from for any `netbox` pool group, so
    /// that scenario files can exercise `NetboxPool` without a live
    /// backend. Without this, netbox groups fail every `assign_next` with
    /// a backend error, exactly as an unreachable IPAM would.
    #[arg(long = "demo-netbox-base")]
    pub demo_netbox_base: Option<String>,

    /// If set, installs a Prometheus recorder and serves the three
    /// `address_pool_*` series over HTTP at this address for the
    /// lifetime of the process.
    #[arg(long = "metrics-addr")]
    pub metrics_addr: Option<SocketAddr>,
}

impl CliArgs {
    pub fn netbox_timeout(&self) -> Duration {
        if self.netbox_timeout_ms == 0 {
            default_netbox_timeout()
        } else {
            Duration::from_millis(self.netbox_timeout_ms)
        }
    }
}
