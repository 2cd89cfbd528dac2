// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

//! A scripted stand-in for the Kubernetes reconcile driver that would
//! normally sit in front of `allocator-core`: loads a pool file, optionally
//! replays a scenario file against the allocator, and logs every step the
//! way a real driver would turn allocator events into cluster events. No
//! watch/informer machinery, leader election, or CRD client lives here;
//! those stay out of scope per the core's own design.

mod config;
mod netbox;
mod scenario;

use allocator_core::Allocator;
use anyhow::Context;
use clap::Parser;
use config::CliArgs;
use netbox::CliNetboxFactory;
use scenario::ScenarioStep;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = CliArgs::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .build()
        .context("failed to start the async runtime")?;
    rt.block_on(run(args))
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    if let Some(addr) = args.metrics_addr {
        // Series names already carry the `allocator_` namespace prefix
        // (see allocator_core::metrics), so no global prefix is configured
        // on the exporter itself.
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install the Prometheus recorder")?;
        info!(%addr, "serving allocator_address_pool_* metrics");
    }

    let groups = load_pools(&args.pools_path)?;
    let netbox_factory = CliNetboxFactory::new(args.demo_netbox_base.as_deref())
        .context("invalid --demo-netbox-base")?;

    let allocator = Arc::new(Mutex::new(Allocator::new()));
    {
        let mut allocator = allocator.lock().await;
        allocator.set_pools(&groups, &netbox_factory, args.netbox_timeout());
        info!(
            pools = ?allocator.catalog().names().collect::<Vec<_>>(),
            "pool catalog loaded",
        );
    }

    let Some(scenario_path) = &args.scenario_path else {
        return Ok(());
    };

    let steps = scenario::load(scenario_path).context("failed to load scenario file")?;
    for (index, step) in steps.into_iter().enumerate() {
        run_step(&allocator, index, &step).await;
    }

    Ok(())
}

fn load_pools(path: &std::path::Path) -> anyhow::Result<Vec<allocator_core::ServiceGroup>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open pool file {path:?}"))?;
    serde_yaml::from_reader(file).with_context(|| format!("failed to parse pool file {path:?}"))
}

/// Runs one scenario step against the allocator and logs the outcome.
/// Errors are reported, never fatal to the scenario as a whole: a real
/// reconcile driver leaves the service in its prior state and retries at
/// its own cadence, and the demo harness mirrors that by simply moving on.
async fn run_step(allocator: &Arc<Mutex<Allocator>>, index: usize, step: &ScenarioStep) {
    let service = step.service();

    if let Some(result) = step.as_notify_existing(index) {
        match result {
            Ok((pool, request, ip)) => {
                let mut allocator = allocator.lock().await;
                allocator.notify_existing(&pool, &request, ip);
                info!(%service, %pool, %ip, "replayed existing assignment");
            }
            Err(e) => error!(step = index, %service, error = %e, "invalid notify-existing step"),
        }
        return;
    }

    if let Some(result) = step.as_allocate(index) {
        match result {
            Ok(allocate) => {
                let mut allocator = allocator.lock().await;
                match allocator.allocate_any_ip(&allocate.request) {
                    Ok(ips) => info!(%service, ?ips, "allocated"),
                    Err(e) => warn!(step = index, %service, error = %e, "allocation rejected"),
                }
            }
            Err(e) => error!(step = index, %service, error = %e, "invalid allocate step"),
        }
        return;
    }

    if let ScenarioStep::Unassign { .. } = step {
        let mut allocator = allocator.lock().await;
        allocator.unassign(&service);
        info!(%service, "unassigned");
    }
}
