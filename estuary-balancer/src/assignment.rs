use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use estuary_core::{AddressTrie, ChangeSet, CoreError, Ipv4Prefix, NodeId, Target, TargetId};

/// Class of targets a constrained range is allowed to resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TargetClass {
    /// The range must stay unassigned (reserved ranges, space outside the
    /// client range).
    Unassigned,
    /// The range must resolve to some backend.
    Concrete,
}

impl TargetClass {
    fn allows(&self, target: &Target) -> bool {
        match self {
            TargetClass::Unassigned => target.is_unassigned(),
            TargetClass::Concrete => !target.is_unassigned(),
        }
    }
}

/// A standing rule restricting which targets may cover a prefix.
///
/// Constraints are checked before every mutating operation and are never
/// stored as tree values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct Constraint {
    pub(crate) prefix: Ipv4Prefix,
    pub(crate) required: TargetClass,
}

impl Constraint {
    pub(crate) fn reserve(prefix: Ipv4Prefix) -> Self {
        Constraint {
            prefix,
            required: TargetClass::Unassigned,
        }
    }

    /// Constraints pinning everything outside `client_range` to
    /// `Unassigned`: one per sibling on the path from the range up to the
    /// root, which together tile the complement exactly.
    pub(crate) fn outside_client_range(client_range: Ipv4Prefix) -> Vec<Constraint> {
        let mut constraints = Vec::new();
        let mut current = client_range;
        while let Some(sibling) = current.sibling() {
            constraints.push(Constraint::reserve(sibling));
            current = current.parent().expect("a prefix with a sibling has a parent");
        }
        constraints
    }
}

#[derive(Debug, Error)]
pub(crate) enum AssignmentError {
    #[error("Assigning {target} to {prefix} violates the constraint on {constrained}")]
    ConstraintViolation {
        prefix: Ipv4Prefix,
        target: Target,
        constrained: Ipv4Prefix,
    },

    #[error("No eligible prefix of mask length {mask_length} for {target}")]
    NoEligiblePrefix { mask_length: u8, target: TargetId },

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Which half of a candidate search the traversal currently sees: a real
/// trie node, or a virtual sub-block of a leaf whose value covers it
/// uniformly.
#[derive(Clone, Copy)]
enum Region {
    Node(NodeId),
    Uniform(Target),
}

/// What counts against a candidate position.
#[derive(Clone, Copy, PartialEq)]
enum PlacementCost {
    /// Addresses held by a *different* concrete target. Used by the
    /// standalone best-fit operation, where claiming the target's own
    /// space is a no-op.
    Foreign,
    /// Addresses held by *any* concrete target. Used by the rebuild's
    /// least-assigned search, where landing on the target's own block
    /// would silently shrink its share.
    Assigned,
}

/// Owner of the assignment tree and its constraints.
///
/// Exactly one control path mutates an engine at a time; readers only ever
/// see trees the engine has already released.
#[derive(Debug)]
pub(crate) struct AssignmentEngine {
    tree: AddressTrie<Target>,
    constraints: Vec<Constraint>,
}

impl AssignmentEngine {
    pub(crate) fn new(constraints: Vec<Constraint>) -> Self {
        AssignmentEngine {
            tree: AddressTrie::new(Target::Unassigned),
            constraints,
        }
    }

    pub(crate) fn tree(&self) -> &AddressTrie<Target> {
        &self.tree
    }

    pub(crate) fn into_tree(self) -> AddressTrie<Target> {
        self.tree
    }

    /// Assigns `target` to exactly `prefix`, restoring canonical form on
    /// the way back up, and reports the leaf-level delta.
    pub(crate) fn assign_exact(
        &mut self,
        prefix: Ipv4Prefix,
        target: Target,
    ) -> Result<ChangeSet<Target>, AssignmentError> {
        if let Some(constraint) = self.constraint_conflict(&prefix, &target) {
            return Err(AssignmentError::ConstraintViolation {
                prefix,
                target,
                constrained: constraint.prefix,
            });
        }
        let before = self.tree.leaves();
        let node = self.tree.assign(prefix, target)?;
        self.tree.collapse_equal_leaves_upwards(node);
        Ok(ChangeSet::between(&before, &self.tree.leaves()))
    }

    /// Places one block of the given size for `target` at the eligible
    /// position currently holding the fewest addresses of other concrete
    /// targets. Ties prefer the lower-addressed candidate, so placement is
    /// deterministic.
    /// Entry point for one-off placements outside a full rebuild.
    #[allow(dead_code)]
    pub(crate) fn assign_best_fit(
        &mut self,
        mask_length: u8,
        target: TargetId,
    ) -> Result<ChangeSet<Target>, AssignmentError> {
        let (prefix, foreign) = self
            .best_fit_prefix(mask_length, target)
            .ok_or(AssignmentError::NoEligiblePrefix {
                mask_length,
                target,
            })?;
        debug!(%prefix, foreign_addresses = foreign, %target, "best-fit candidate selected");
        self.assign_exact(prefix, Target::Concrete(target))
    }

    /// The winning candidate for [`AssignmentEngine::assign_best_fit`],
    /// without mutating the tree. `None` when every position of that size
    /// violates a constraint.
    pub(crate) fn best_fit_prefix(
        &self,
        mask_length: u8,
        target: TargetId,
    ) -> Option<(Ipv4Prefix, u64)> {
        self.best_candidate_from_root(mask_length, target, PlacementCost::Foreign)
    }

    /// The cheapest position by total assigned addresses, own blocks
    /// included. The rebuild places through this search so a target's new
    /// block never swallows one of its own existing blocks for free.
    fn least_assigned_prefix(
        &self,
        mask_length: u8,
        target: TargetId,
    ) -> Option<(Ipv4Prefix, u64)> {
        self.best_candidate_from_root(mask_length, target, PlacementCost::Assigned)
    }

    fn best_candidate_from_root(
        &self,
        mask_length: u8,
        target: TargetId,
        cost: PlacementCost,
    ) -> Option<(Ipv4Prefix, u64)> {
        self.best_candidate(
            Region::Node(self.tree.root()),
            Ipv4Prefix::ZERO,
            mask_length,
            target,
            cost,
        )
    }

    fn best_candidate(
        &self,
        region: Region,
        prefix: Ipv4Prefix,
        mask_length: u8,
        target: TargetId,
        cost: PlacementCost,
    ) -> Option<(Ipv4Prefix, u64)> {
        if prefix.len() == mask_length {
            if self
                .constraint_conflict(&prefix, &Target::Concrete(target))
                .is_some()
            {
                return None;
            }
            let occupied = match region {
                Region::Node(node) => self.occupied_addresses(node, target, cost),
                Region::Uniform(value) => occupied_size(&prefix, &value, target, cost),
            };
            return Some((prefix, occupied));
        }

        let (region0, region1) = match region {
            Region::Node(node) => match self.tree.children(node) {
                Some([child0, child1]) => (Region::Node(child0), Region::Node(child1)),
                None => {
                    let value = *self.tree.value(node);
                    (Region::Uniform(value), Region::Uniform(value))
                }
            },
            Region::Uniform(value) => (Region::Uniform(value), Region::Uniform(value)),
        };

        let left = self.best_candidate(region0, prefix.child(false), mask_length, target, cost);
        if let Some((_, 0)) = left {
            // Nothing can beat a free block, and left wins ties anyway.
            return left;
        }
        let right = self.best_candidate(region1, prefix.child(true), mask_length, target, cost);
        match (left, right) {
            (Some(l), Some(r)) => {
                if l.1 <= r.1 {
                    Some(l)
                } else {
                    Some(r)
                }
            }
            (left, None) => left,
            (None, right) => right,
        }
    }

    /// Addresses under `node` counting against a candidate for `target`.
    fn occupied_addresses(&self, node: NodeId, target: TargetId, cost: PlacementCost) -> u64 {
        let mut occupied = 0;
        let mut stack = vec![node];
        while let Some(at) = stack.pop() {
            match self.tree.children(at) {
                Some([child0, child1]) => {
                    stack.push(child0);
                    stack.push(child1);
                }
                None => {
                    occupied += occupied_size(
                        &self.tree.prefix_of(at),
                        self.tree.value(at),
                        target,
                        cost,
                    );
                }
            }
        }
        occupied
    }

    fn constraint_conflict(&self, prefix: &Ipv4Prefix, target: &Target) -> Option<&Constraint> {
        self.constraints
            .iter()
            .find(|constraint| {
                constraint.prefix.overlaps(prefix) && !constraint.required.allows(target)
            })
    }

    /// True when the whole region is a single unassigned leaf.
    fn region_is_free(&self, prefix: Ipv4Prefix) -> bool {
        let node = self.tree.seek(prefix);
        self.tree.is_leaf(node) && self.tree.value(node).is_unassigned()
    }

    /// Builds a fresh tree satisfying `requirements` while disturbing the
    /// previous placement as little as possible.
    ///
    /// Requirements already satisfied by `previous` at the exact same
    /// position are pinned unchanged. The rest are placed largest block
    /// first through the least-assigned subtree search; when a placement
    /// is forced onto space holding another block, the victim is cleared
    /// and its requirement re-queued. This is a best-effort
    /// minimum-disruption heuristic, not a provably optimal diff.
    pub(crate) fn rebuild_minimizing_churn(
        requirements: &[(u8, TargetId)],
        previous: &AddressTrie<Target>,
        constraints: Vec<Constraint>,
    ) -> Result<(AssignmentEngine, ChangeSet<Target>), AssignmentError> {
        let mut engine = AssignmentEngine::new(constraints);
        let previous_leaves = previous.leaves();

        let mut pending: VecDeque<(u8, TargetId)> = VecDeque::new();
        for &(mask_length, target) in requirements {
            let pinned = previous_leaves.iter().find(|(prefix, value)| {
                prefix.len() == mask_length && *value == Target::Concrete(target)
            });
            let mut satisfied = false;
            if let Some((prefix, _)) = pinned {
                if engine.region_is_free(*prefix)
                    && engine
                        .constraint_conflict(prefix, &Target::Concrete(target))
                        .is_none()
                {
                    engine.assign_exact(*prefix, Target::Concrete(target))?;
                    debug!(prefix = %prefix, %target, "pinned unchanged placement");
                    satisfied = true;
                }
            }
            if !satisfied {
                pending.push_back((mask_length, target));
            }
        }

        // Each eviction shrinks the space still worth fighting over, so
        // the queue settles; the round limit turns a surprise loop into an
        // error instead of a hang.
        let round_limit = requirements.len().max(1) * 64;
        let mut rounds = 0usize;
        while let Some((mask_length, target)) = pending.pop_front() {
            rounds += 1;
            if rounds > round_limit {
                warn!(mask_length, %target, rounds, "block placement did not settle");
                return Err(AssignmentError::NoEligiblePrefix {
                    mask_length,
                    target,
                });
            }

            let (prefix, occupied) = engine.least_assigned_prefix(mask_length, target).ok_or(
                AssignmentError::NoEligiblePrefix {
                    mask_length,
                    target,
                },
            )?;

            if occupied > 0 {
                let victims: Vec<(Ipv4Prefix, TargetId)> = engine
                    .tree
                    .leaves()
                    .into_iter()
                    .filter(|(victim, _)| victim.overlaps(&prefix))
                    .filter_map(|(victim, value)| value.concrete().map(|id| (victim, id)))
                    .filter(|&(victim, id)| !(victim == prefix && id == target))
                    .collect();
                for (victim, victim_target) in victims {
                    debug!(
                        victim = %victim,
                        %victim_target,
                        evictor = %prefix,
                        "evicting placement, re-queueing its requirement"
                    );
                    engine.assign_exact(victim, Target::Unassigned)?;
                    pending.push_back((victim.len(), victim_target));
                }
            }

            engine.assign_exact(prefix, Target::Concrete(target))?;
        }

        let changes = ChangeSet::between(&previous_leaves, &engine.tree.leaves());
        Ok((engine, changes))
    }
}

fn occupied_size(prefix: &Ipv4Prefix, value: &Target, target: TargetId, cost: PlacementCost) -> u64 {
    match value {
        Target::Unassigned => 0,
        Target::Concrete(id) if *id == target && cost == PlacementCost::Foreign => 0,
        // A region mid-migration towards this target is no obstacle when
        // only foreign space counts.
        Target::Transitional { next, .. }
            if *next == target && cost == PlacementCost::Foreign =>
        {
            0
        }
        _ => prefix.size(),
    }
}

#[cfg(test)]
#[path = "assignment_test.rs"]
mod tests;
