use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use estuary_core::{Ipv4Prefix, TargetId};

use crate::assignment::Constraint;
use crate::switches::SwitchId;

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LoadConfiguration {
    /// Estuary cluster name
    pub(crate) cluster_name: String,
    /// Balancing behavior: mode, granularity, cadence
    pub(crate) balancer: BalancerConfig,
    /// Backend targets traffic is spread across
    pub(crate) targets: Vec<TargetConfig>,
    /// Address ranges that must never be assigned (multicast and reserved
    /// space by default)
    #[serde(default)]
    pub(crate) reserved_ranges: Option<Vec<Ipv4Net>>,
    /// Switches the dispatcher pushes rules to
    #[serde(default)]
    pub(crate) switches: Vec<SwitchConfig>,
}

/// Balancing section of the config file
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BalancerConfig {
    /// Weight-proportional or traffic-proportional partitioning
    #[serde(default)]
    pub(crate) mode: BalancingMode,
    /// Bit budget for weight normalization; blocks subdivide the client
    /// range at most this many levels deep
    pub(crate) max_prefix_length: u8,
    /// The source address range being balanced
    pub(crate) client_range: Ipv4Net,
    /// How often byte counters are collected and placement reconsidered
    pub(crate) reassignment_interval_seconds: u64,
    /// A measurement leaf splits while it carries more than this fraction
    /// of total traffic
    #[serde(default = "default_expand_threshold")]
    pub(crate) traffic_expand_threshold: f64,
    /// Per-switch unit-of-work timeout during dispatch
    #[serde(default = "default_dispatch_timeout_seconds")]
    pub(crate) dispatch_timeout_seconds: u64,
    /// Prometheus exporter address (optional)
    pub(crate) prom_exporter: Option<String>,
}

fn default_expand_threshold() -> f64 {
    1.0 / 64.0
}

fn default_dispatch_timeout_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum BalancingMode {
    /// Shares proportional to the configured target weights
    Weights,
    /// Shares proportional to measured per-target traffic
    Traffic,
}

impl Default for BalancingMode {
    fn default() -> Self {
        Self::Weights
    }
}

/// One backend target as configured
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TargetConfig {
    pub(crate) name: String,
    /// Stable identity; defaults to the 1-based position in the list
    pub(crate) id: Option<u64>,
    pub(crate) weight: f64,
}

/// One switch endpoint as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SwitchConfig {
    pub(crate) id: SwitchId,
    pub(crate) address: String,
}

/// Validated runtime configuration for the balancer service
#[derive(Debug)]
pub(crate) struct ServiceConfiguration {
    pub(crate) cluster_name: String,
    pub(crate) mode: BalancingMode,
    pub(crate) max_prefix_length: u8,
    pub(crate) client_range: Ipv4Prefix,
    pub(crate) reassignment_interval: Duration,
    pub(crate) traffic_expand_threshold: f64,
    pub(crate) dispatch_timeout: Duration,
    pub(crate) prom_exporter: Option<SocketAddr>,
    pub(crate) targets: Vec<BackendTarget>,
    pub(crate) reserved_ranges: Vec<Ipv4Prefix>,
    pub(crate) switches: Vec<SwitchConfig>,
}

/// A configured backend with its stable registry identity
#[derive(Debug, Clone)]
pub(crate) struct BackendTarget {
    pub(crate) id: TargetId,
    pub(crate) name: String,
    pub(crate) weight: f64,
}

impl ServiceConfiguration {
    pub(crate) fn target_ids(&self) -> Vec<TargetId> {
        self.targets.iter().map(|target| target.id).collect()
    }

    pub(crate) fn target_name(&self, id: TargetId) -> Option<&str> {
        self.targets
            .iter()
            .find(|target| target.id == id)
            .map(|target| target.name.as_str())
    }

    /// The standing constraints every placement must respect: reserved
    /// ranges plus everything outside the client range.
    pub(crate) fn constraints(&self) -> Vec<Constraint> {
        let mut constraints = Constraint::outside_client_range(self.client_range);
        constraints.extend(self.reserved_ranges.iter().copied().map(Constraint::reserve));
        constraints
    }
}

/// Implementing the TryFrom trait to transform LoadConfiguration into ServiceConfiguration
impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        let client_range: Ipv4Prefix = config
            .balancer
            .client_range
            .try_into()
            .context("client_range must be a canonical CIDR block")?;

        let max_prefix_length = config.balancer.max_prefix_length;
        // The weight capacity keeps 1/8 of the budget as slack, so fewer
        // than 3 bits leaves nothing to hand out.
        if max_prefix_length < 3 {
            bail!("max_prefix_length must be at least 3");
        }
        if u32::from(max_prefix_length) + u32::from(client_range.len()) > 32 {
            bail!(
                "max_prefix_length {} is too deep for client_range {}",
                max_prefix_length,
                client_range
            );
        }

        let threshold = config.balancer.traffic_expand_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            bail!("traffic_expand_threshold must be within (0, 1]");
        }

        if config.balancer.reassignment_interval_seconds == 0 {
            bail!("reassignment_interval_seconds must be positive");
        }

        if config.targets.is_empty() {
            bail!("at least one backend target is required");
        }
        let mut targets = Vec::with_capacity(config.targets.len());
        let mut seen_ids = HashSet::new();
        for (position, target) in config.targets.iter().enumerate() {
            if !(target.weight.is_finite() && target.weight >= 0.0) {
                bail!("target {} has an invalid weight {}", target.name, target.weight);
            }
            let id = TargetId(target.id.unwrap_or(position as u64 + 1));
            if !seen_ids.insert(id) {
                bail!("duplicate target id {} for {}", id, target.name);
            }
            targets.push(BackendTarget {
                id,
                name: target.name.clone(),
                weight: target.weight,
            });
        }

        let mut seen_switches = HashSet::new();
        for switch in &config.switches {
            if !seen_switches.insert(switch.id) {
                bail!("duplicate switch id {}", switch.id);
            }
        }

        let reserved_ranges: Vec<Ipv4Prefix> = match &config.reserved_ranges {
            Some(ranges) => ranges
                .iter()
                .map(|net| {
                    Ipv4Prefix::try_from(*net)
                        .with_context(|| format!("reserved range {} is not canonical", net))
                })
                .collect::<Result<_>>()?,
            // Multicast plus the reserved class E space.
            None => vec!["224.0.0.0/3".parse().expect("well-formed default range")],
        };

        let prom_exporter: Option<SocketAddr> = match &config.balancer.prom_exporter {
            Some(addr) => Some(addr.parse().context(format!(
                "Failed to parse into Socket address: {}",
                addr
            ))?),
            None => None,
        };

        Ok(ServiceConfiguration {
            cluster_name: config.cluster_name,
            mode: config.balancer.mode,
            max_prefix_length,
            client_range,
            reassignment_interval: Duration::from_secs(
                config.balancer.reassignment_interval_seconds,
            ),
            traffic_expand_threshold: threshold,
            dispatch_timeout: Duration::from_secs(config.balancer.dispatch_timeout_seconds),
            prom_exporter,
            targets,
            reserved_ranges,
            switches: config.switches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
cluster_name: estuary-lab
balancer:
  mode: weights
  max_prefix_length: 6
  client_range: "0.0.0.0/0"
  reassignment_interval_seconds: 60
targets:
  - name: backend-a
    weight: 1.0
  - name: backend-b
    weight: 3.0
  - name: backend-c
    id: 12
    weight: 4.0
switches:
  - id: 1
    address: "192.0.2.10:6653"
  - id: 2
    address: "192.0.2.11:6653"
"#;

    #[test]
    fn sample_config_round_trips() {
        let load: LoadConfiguration = serde_yaml::from_str(SAMPLE).unwrap();
        let service: ServiceConfiguration = load.try_into().unwrap();

        assert_eq!(service.cluster_name, "estuary-lab");
        assert_eq!(service.mode, BalancingMode::Weights);
        assert_eq!(service.client_range, Ipv4Prefix::ZERO);
        assert_eq!(service.reassignment_interval, Duration::from_secs(60));
        assert_eq!(
            service.target_ids(),
            vec![TargetId(1), TargetId(2), TargetId(12)]
        );
        let weights: Vec<f64> = service.targets.iter().map(|t| t.weight).collect();
        assert_eq!(weights, vec![1.0, 3.0, 4.0]);
        assert_eq!(service.target_name(TargetId(12)), Some("backend-c"));
        assert_eq!(service.switches.len(), 2);
        // Default reserved range stands in when none is configured.
        assert_eq!(
            service.reserved_ranges,
            vec!["224.0.0.0/3".parse().unwrap()]
        );
    }

    #[test]
    fn too_deep_subdivision_is_rejected() {
        let mut load: LoadConfiguration = serde_yaml::from_str(SAMPLE).unwrap();
        load.balancer.max_prefix_length = 12;
        load.balancer.client_range = "10.20.0.0/24".parse().unwrap();
        let result: Result<ServiceConfiguration> = load.try_into();
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_target_ids_are_rejected() {
        let mut load: LoadConfiguration = serde_yaml::from_str(SAMPLE).unwrap();
        load.targets[2].id = Some(2);
        let result: Result<ServiceConfiguration> = load.try_into();
        assert!(result.is_err());
    }

    #[test]
    fn negative_weights_are_rejected() {
        let mut load: LoadConfiguration = serde_yaml::from_str(SAMPLE).unwrap();
        load.targets[0].weight = -1.0;
        let result: Result<ServiceConfiguration> = load.try_into();
        assert!(result.is_err());
    }

    #[test]
    fn constraints_cover_reserved_and_outside_space() {
        let mut load: LoadConfiguration = serde_yaml::from_str(SAMPLE).unwrap();
        load.balancer.client_range = "10.0.0.0/8".parse().unwrap();
        load.balancer.max_prefix_length = 6;
        let service: ServiceConfiguration = load.try_into().unwrap();

        let constraints = service.constraints();
        // 8 complement blocks plus the default reserved range.
        assert_eq!(constraints.len(), 9);
    }
}
