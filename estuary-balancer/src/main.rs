mod args_parse;
mod assignment;
mod balancer_metrics;
mod balancer_service;
mod dispatcher;
mod partition;
mod service_configuration;
mod switches;
mod traffic;
mod transition;

use std::{fs::read_to_string, path::Path, sync::Arc, time::Duration};

use crate::{
    args_parse::Args,
    balancer_metrics::init_metrics,
    balancer_service::BalancerService,
    service_configuration::{LoadConfiguration, ServiceConfiguration},
    switches::{memory::MemorySwitch, Switches},
};

use anyhow::{Context, Result};
use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Parse command line arguments
    let args = Args::parse()?;

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(Path::new(&args.config_file))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&config_content)?;

    // Attempt to transform LoadConfiguration into ServiceConfiguration
    let mut service_config: ServiceConfiguration = load_config.try_into()?;

    // If `prom_exporter` is provided via command-line args, override the value from the config file
    if let Some(prom_exporter) = args.prom_exporter {
        let prom_address: SocketAddr = prom_exporter.parse().context(format!(
            "Failed to parse into Socket address: {}",
            prom_exporter
        ))?;
        service_config.prom_exporter = Some(prom_address);
    }

    // If `reassignment_interval` is provided via command-line args, override the config value
    if let Some(interval) = args.reassignment_interval {
        service_config.reassignment_interval = Duration::from_secs(interval);
    }

    // Init metrics with or without prometheus exporter
    init_metrics(service_config.prom_exporter);

    // Register the configured switches with the dispatcher. The wire-level
    // forwarding client is supplied by the integration build; standalone
    // the balancer runs against in-memory switches, which makes --once a
    // full dry run of the placement and rollout.
    let switches = Switches::new();
    for endpoint in &service_config.switches {
        info!(
            switch_id = endpoint.id,
            address = %endpoint.address,
            "registering switch"
        );
        switches.connect(endpoint.id, Arc::new(MemorySwitch::new()));
    }

    info!(
        cluster = %service_config.cluster_name,
        targets = service_config.targets.len(),
        switches = switches.len(),
        client_range = %service_config.client_range,
        "initializing Estuary balancer control plane"
    );

    let service = Arc::new(BalancerService::new(service_config, switches));

    // Compute and roll out the initial placement before serving anything.
    let outcome = service.rebalance().await?;
    info!(
        transitions = outcome.transitions,
        rules_installed = outcome.rules_installed,
        "initial placement rolled out"
    );

    if args.once {
        return Ok(());
    }

    // Periodic byte-counter collection and reassignment.
    let reassignment_loop = service.clone().start_reassignment_loop();

    info!("Estuary balancer control plane has started succesfully");

    reassignment_loop
        .await
        .context("reassignment loop terminated")?;

    Ok(())
}
