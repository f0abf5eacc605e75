use serde::Serialize;

use estuary_core::{AddressTrie, Ipv4Prefix, NodeId, Target};

/// One contiguous region of address space whose target assignment changed
/// between two trees, with the leaf partitions on both sides.
///
/// The kind is derived from the shape, never stored: both sides a single
/// leaf is a direct reassignment, one old leaf scattering into several new
/// ones is a split, several old leaves folding into one is a merge. The
/// side with a single entry is the coarsest prefix representing the whole
/// region, which is what the rule installer matches migration traffic on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Transition {
    pub(crate) from: Vec<(Ipv4Prefix, Target)>,
    pub(crate) to: Vec<(Ipv4Prefix, Target)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionKind {
    Direct,
    Split,
    Merge,
}

impl Transition {
    pub(crate) fn kind(&self) -> TransitionKind {
        match (self.from.len(), self.to.len()) {
            (1, 1) => TransitionKind::Direct,
            (1, _) => TransitionKind::Split,
            _ => TransitionKind::Merge,
        }
    }

    /// The coarsest prefix covering the whole changed region.
    pub(crate) fn region(&self) -> Ipv4Prefix {
        match self.kind() {
            TransitionKind::Direct | TransitionKind::Split => self.from[0].0,
            TransitionKind::Merge => self.to[0].0,
        }
    }
}

/// Diffs two assignment trees in lock-step, emitting the smallest set of
/// transitions such that every changed address is accounted for exactly
/// once. Transitions come out ordered by region base address.
pub(crate) fn diff(from: &AddressTrie<Target>, to: &AddressTrie<Target>) -> Vec<Transition> {
    let mut transitions = Vec::new();
    walk(from, from.root(), to, to.root(), &mut transitions);
    transitions
}

fn walk(
    from: &AddressTrie<Target>,
    from_node: NodeId,
    to: &AddressTrie<Target>,
    to_node: NodeId,
    out: &mut Vec<Transition>,
) {
    match (from.children(from_node), to.children(to_node)) {
        // Two leaves: at most a direct reassignment. A pure assign or
        // unassign is still direct, with Unassigned on one side.
        (None, None) => {
            let old = from.value(from_node);
            let new = to.value(to_node);
            if old != new {
                out.push(Transition {
                    from: vec![(from.prefix_of(from_node), *old)],
                    to: vec![(to.prefix_of(to_node), *new)],
                });
            }
        }

        // Both internal: the halves change independently, no event here.
        (Some([from0, from1]), Some([to0, to1])) => {
            walk(from, from0, to, to0, out);
            walk(from, from1, to, to1, out);
        }

        // One old leaf scattering into finer new assignments: one split
        // accumulating every descendant leaf of the new side.
        (None, Some(_)) => {
            let mut transition = Transition {
                from: vec![(from.prefix_of(from_node), *from.value(from_node))],
                to: Vec::new(),
            };
            collect_leaves(to, to_node, &mut transition.to);
            out.push(transition);
        }

        // Finer old assignments folding into one new leaf: one merge
        // accumulating every descendant leaf of the old side.
        (Some(_), None) => {
            let mut transition = Transition {
                from: Vec::new(),
                to: vec![(to.prefix_of(to_node), *to.value(to_node))],
            };
            collect_leaves(from, from_node, &mut transition.from);
            out.push(transition);
        }
    }
}

fn collect_leaves(
    tree: &AddressTrie<Target>,
    node: NodeId,
    into: &mut Vec<(Ipv4Prefix, Target)>,
) {
    match tree.children(node) {
        None => into.push((tree.prefix_of(node), *tree.value(node))),
        Some([child0, child1]) => {
            collect_leaves(tree, child0, into);
            collect_leaves(tree, child1, into);
        }
    }
}

#[cfg(test)]
#[path = "transition_test.rs"]
mod tests;
