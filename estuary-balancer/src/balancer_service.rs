use std::sync::{Arc, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use estuary_core::{AddressTrie, ChangeSet, Ipv4Prefix, Target, TargetId};

use crate::assignment::AssignmentEngine;
use crate::balancer_metrics::{
    ASSIGNMENT_LEAVES, CONNECTED_SWITCHES, DISPATCH_BATCH_DURATION_SECONDS,
    DISPATCH_FAILURES_TOTAL, LAST_REBUILD_TRANSITIONS, REBUILDS_TOTAL, REBUILD_DURATION_SECONDS,
    REBUILD_FAILURES_TOTAL, RULES_INSTALLED_TOTAL, RULES_REMOVED_TOTAL,
};
use crate::dispatcher::Dispatcher;
use crate::partition::{capacity_for, normalize_weights, plan_blocks};
use crate::service_configuration::{BalancingMode, ServiceConfiguration};
use crate::switches::{SwitchRule, Switches, TransitionRule};
use crate::traffic::{weight_within, TrafficMerger};
use crate::transition::{diff, Transition};

/// What one reassignment cycle did.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub(crate) struct RebalanceOutcome {
    pub(crate) transitions: usize,
    pub(crate) rules_installed: usize,
    pub(crate) rules_removed: usize,
    pub(crate) switch_failures: usize,
}

/// State only the single control path touches, guarded by one mutex.
struct ControlState {
    /// Current per-target weights, seeded from the configuration and
    /// updated when the configuration layer pushes new ones.
    weights: std::collections::HashMap<TargetId, f64>,
    /// Measurement snapshot from the last collection interval.
    measurements: Option<AddressTrie<f64>>,
}

/// The balancer control plane: owns the committed assignment tree,
/// rebuilds it when weights or traffic change, and rolls the difference
/// out to every switch.
///
/// Mutation runs on one logical writer (the control mutex); readers
/// classify against the committed tree concurrently, because a rebuild
/// works on a fresh tree and only the final pointer swap is shared.
pub(crate) struct BalancerService {
    config: ServiceConfiguration,
    switches: Switches,
    dispatcher: Dispatcher,
    merger: TrafficMerger,
    committed: RwLock<Arc<AddressTrie<Target>>>,
    control: Mutex<ControlState>,
}

impl BalancerService {
    pub(crate) fn new(config: ServiceConfiguration, switches: Switches) -> Self {
        let dispatcher = Dispatcher::new(switches.clone(), config.dispatch_timeout);
        let merger = TrafficMerger::new(config.client_range, config.traffic_expand_threshold);
        gauge!(CONNECTED_SWITCHES.name).set(switches.len() as f64);
        let weights = config
            .targets
            .iter()
            .map(|target| (target.id, target.weight))
            .collect();
        BalancerService {
            config,
            switches,
            dispatcher,
            merger,
            committed: RwLock::new(Arc::new(AddressTrie::new(Target::Unassigned))),
            control: Mutex::new(ControlState {
                weights,
                measurements: None,
            }),
        }
    }

    /// The committed assignment tree. Cheap to take; the Arc keeps the
    /// snapshot alive across any number of rebuilds.
    pub(crate) fn current_tree(&self) -> Arc<AddressTrie<Target>> {
        self.committed
            .read()
            .expect("committed tree lock poisoned")
            .clone()
    }

    /// Which target currently handles a source address.
    pub(crate) fn classify(&self, addr: u32) -> Target {
        *self.current_tree().value_at(addr)
    }

    /// Recomputes the partition from the current weights and rolls the
    /// difference out. A failure on the way leaves the previously
    /// committed tree active.
    pub(crate) async fn rebalance(&self) -> Result<RebalanceOutcome> {
        let control = self.control.lock().await;
        self.rebalance_locked(&control).await
    }

    /// Entry point for the configuration layer: adopt new per-target
    /// weights and rebuild immediately. Unknown target IDs are rejected
    /// before anything changes.
    pub(crate) async fn apply_weights(
        &self,
        weights: &[(TargetId, f64)],
    ) -> Result<RebalanceOutcome> {
        let mut control = self.control.lock().await;
        for (id, weight) in weights {
            if self.config.target_name(*id).is_none() {
                anyhow::bail!("unknown target id {}", id);
            }
            if !(weight.is_finite() && *weight >= 0.0) {
                anyhow::bail!("invalid weight {} for {}", weight, id);
            }
            control.weights.insert(*id, *weight);
        }
        self.rebalance_locked(&control).await
    }

    /// Collects byte counters from every switch, folds them into a fresh
    /// measurement tree, and (in traffic mode) re-plans placement from the
    /// measured per-target load.
    pub(crate) async fn run_reassignment_cycle(&self) -> Result<RebalanceOutcome> {
        let mut control = self.control.lock().await;

        let switch_ids = self.switches.ids();
        let batch_started = Instant::now();
        let results = self
            .dispatcher
            .run_on_each(&switch_ids, |_, client| async move {
                client.read_byte_counters().await
            })
            .await;
        histogram!(DISPATCH_BATCH_DURATION_SECONDS.name)
            .record(batch_started.elapsed().as_secs_f64());

        let mut samples: Vec<(Ipv4Prefix, f64)> = Vec::new();
        for (switch_id, result) in results {
            match result {
                Ok(counters) => {
                    samples.extend(
                        counters
                            .into_iter()
                            .map(|(prefix, bytes)| (prefix, bytes as f64)),
                    );
                }
                Err(e) => {
                    counter!(DISPATCH_FAILURES_TOTAL.name).increment(1);
                    warn!(switch_id, error = %e, "failed to read byte counters");
                }
            }
        }

        let mut measured = self.merger.merge(&samples);
        self.merger.adjust(&mut measured);
        control.measurements = Some(measured);

        if self.config.mode == BalancingMode::Traffic {
            self.rebalance_locked(&control).await
        } else {
            Ok(RebalanceOutcome::default())
        }
    }

    /// Periodic collection and reassignment, at the configured interval.
    pub(crate) fn start_reassignment_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_seconds = self.config.reassignment_interval.as_secs(),
                mode = ?self.config.mode,
                "starting reassignment loop"
            );
            let mut interval = tokio::time::interval(self.config.reassignment_interval);
            // The boot rollout already happened; skip the immediate tick.
            interval.tick().await;
            loop {
                interval.tick().await;
                match self.run_reassignment_cycle().await {
                    Ok(outcome) if outcome.transitions > 0 => {
                        info!(
                            transitions = outcome.transitions,
                            rules_installed = outcome.rules_installed,
                            rules_removed = outcome.rules_removed,
                            "reassignment cycle rolled out changes"
                        );
                    }
                    Ok(_) => debug!("reassignment cycle made no changes"),
                    Err(e) => error!(error = %e, "reassignment cycle failed"),
                }
            }
        })
    }

    async fn rebalance_locked(&self, control: &ControlState) -> Result<RebalanceOutcome> {
        let started = Instant::now();
        let previous = self.current_tree();

        let weights = self.effective_weights(control, &previous);
        let requirements = self.plan_requirements(&weights);

        let rebuilt = AssignmentEngine::rebuild_minimizing_churn(
            &requirements,
            &previous,
            self.config.constraints(),
        );
        let (engine, changes) = match rebuilt {
            Ok(result) => result,
            Err(e) => {
                counter!(REBUILD_FAILURES_TOTAL.name).increment(1);
                return Err(e).context("rebuild failed, previous tree stays active");
            }
        };

        let next = Arc::new(engine.into_tree());
        let transitions = diff(&previous, &next);
        if transitions.is_empty() {
            debug!("placement unchanged, nothing to roll out");
            return Ok(RebalanceOutcome::default());
        }
        for transition in &transitions {
            debug!(
                kind = ?transition.kind(),
                region = %transition.region(),
                detail = %serde_json::to_string(transition).unwrap_or_default(),
                "planned transition"
            );
        }

        let outcome = self.roll_out(&transitions, &changes).await;

        *self
            .committed
            .write()
            .expect("committed tree lock poisoned") = next.clone();

        counter!(REBUILDS_TOTAL.name).increment(1);
        gauge!(ASSIGNMENT_LEAVES.name).set(next.leaves().len() as f64);
        gauge!(LAST_REBUILD_TRANSITIONS.name).set(transitions.len() as f64);
        histogram!(REBUILD_DURATION_SECONDS.name).record(started.elapsed().as_secs_f64());
        info!(
            transitions = outcome.transitions,
            rules_installed = outcome.rules_installed,
            rules_removed = outcome.rules_removed,
            switch_failures = outcome.switch_failures,
            "assignment tree committed"
        );
        Ok(outcome)
    }

    /// Pushes one rebuild to every switch in the only order that never
    /// leaves live traffic without a matching rule: migration rules first,
    /// then the new final rules, stale rules removed last.
    async fn roll_out(
        &self,
        transitions: &[Transition],
        changes: &ChangeSet<Target>,
    ) -> RebalanceOutcome {
        let switch_ids = self.switches.ids();
        let expiry_secs = self.config.reassignment_interval.as_secs();
        let mut switch_failures = 0usize;

        let transition_rules: Arc<Vec<TransitionRule>> = Arc::new(
            transitions
                .iter()
                .map(|transition| TransitionRule {
                    transition: transition.clone(),
                    expiry_secs,
                })
                .collect(),
        );
        let results = self
            .dispatcher
            .run_on_each(&switch_ids, {
                let rules = transition_rules.clone();
                move |_, client| {
                    let rules = rules.clone();
                    async move { client.install_transitions(&rules).await }
                }
            })
            .await;
        switch_failures += results.values().filter(|result| result.is_err()).count();

        // Rules exist only for concrete assignments; unassigned space is
        // the absence of a rule.
        let install_rules: Arc<Vec<SwitchRule>> = Arc::new(
            changes
                .additions
                .iter()
                .filter(|(_, target)| !target.is_unassigned())
                .map(|(prefix, target)| SwitchRule {
                    prefix: *prefix,
                    target: *target,
                })
                .collect(),
        );
        if !install_rules.is_empty() {
            let results = self
                .dispatcher
                .run_on_each(&switch_ids, {
                    let rules = install_rules.clone();
                    move |_, client| {
                        let rules = rules.clone();
                        async move { client.install_rules(&rules).await }
                    }
                })
                .await;
            switch_failures += results.values().filter(|result| result.is_err()).count();
            counter!(RULES_INSTALLED_TOTAL.name).increment(install_rules.len() as u64);
        }

        let removals: Arc<Vec<Ipv4Prefix>> = Arc::new(
            changes
                .deletions
                .iter()
                .filter(|(_, target)| !target.is_unassigned())
                .map(|(prefix, _)| *prefix)
                .collect(),
        );
        if !removals.is_empty() {
            let results = self
                .dispatcher
                .run_on_each(&switch_ids, {
                    let prefixes = removals.clone();
                    move |_, client| {
                        let prefixes = prefixes.clone();
                        async move { client.remove_rules(&prefixes).await }
                    }
                })
                .await;
            switch_failures += results.values().filter(|result| result.is_err()).count();
            counter!(RULES_REMOVED_TOTAL.name).increment(removals.len() as u64);
        }

        if switch_failures > 0 {
            counter!(DISPATCH_FAILURES_TOTAL.name).increment(switch_failures as u64);
        }

        RebalanceOutcome {
            transitions: transitions.len(),
            rules_installed: install_rules.len(),
            rules_removed: removals.len(),
            switch_failures,
        }
    }

    /// The weight vector the next partition derives from: configured
    /// weights, or measured per-target traffic when in traffic mode. An
    /// all-zero vector falls back to one unit per target so the partition
    /// never degenerates.
    fn effective_weights(
        &self,
        control: &ControlState,
        committed: &AddressTrie<Target>,
    ) -> Vec<f64> {
        let mut weights = match (self.config.mode, &control.measurements) {
            (BalancingMode::Traffic, Some(measured)) => {
                let per_leaf = committed.leaves();
                self.config
                    .target_ids()
                    .into_iter()
                    .map(|id| {
                        per_leaf
                            .iter()
                            .filter(|(_, target)| *target == Target::Concrete(id))
                            .map(|(prefix, _)| weight_within(measured, *prefix))
                            .sum()
                    })
                    .collect()
            }
            (BalancingMode::Traffic, None) => {
                debug!("no measurements collected yet, using configured weights");
                self.current_weights(control)
            }
            (BalancingMode::Weights, _) => self.current_weights(control),
        };
        if weights.iter().sum::<f64>() <= 0.0 {
            weights = vec![1.0; weights.len()];
        }
        weights
    }

    /// The live weight vector in configured target order.
    fn current_weights(&self, control: &ControlState) -> Vec<f64> {
        self.config
            .targets
            .iter()
            .map(|target| {
                control
                    .weights
                    .get(&target.id)
                    .copied()
                    .unwrap_or(target.weight)
            })
            .collect()
    }

    /// Block requirements for the planner, largest block first. Planned
    /// sizes subdivide the client range, so the absolute mask length is
    /// offset by the range's own length.
    fn plan_requirements(&self, weights: &[f64]) -> Vec<(u8, TargetId)> {
        let capacity = capacity_for(self.config.max_prefix_length);
        let normalized = normalize_weights(weights, capacity);
        let plan = plan_blocks(&normalized, self.config.max_prefix_length);
        let ids = self.config.target_ids();
        let base = self.config.client_range.len();
        let mut requirements = Vec::new();
        for (mask_length, indices) in &plan {
            for &index in indices {
                requirements.push((base + *mask_length, ids[index]));
            }
        }
        requirements
    }
}

#[cfg(test)]
#[path = "rollout_test.rs"]
mod tests;
