use tracing::debug;

use estuary_core::{AddressTrie, Ipv4Prefix, NodeId};

// Measurement trees reuse the address trie with plain weights as values.
// Leaves carry measured traffic; after aggregation every internal node
// holds the total of its subtree, so any block's weight can be read off
// in one descent.

/// Folds externally collected per-prefix byte counts into a measurement
/// tree and reshapes it so hot regions are finely subdivided and cold
/// regions cheap, ready to drive traffic-proportional placement.
pub(crate) struct TrafficMerger {
    client_range: Ipv4Prefix,
    /// A leaf expands while its weight exceeds this fraction of the total;
    /// an internal node below it collapses.
    expand_threshold: f64,
}

impl TrafficMerger {
    pub(crate) fn new(client_range: Ipv4Prefix, expand_threshold: f64) -> Self {
        TrafficMerger {
            client_range,
            expand_threshold,
        }
    }

    /// Builds a measurement tree from `(prefix, weight)` samples.
    ///
    /// Samples are clipped to the client range: one falling outside is
    /// dropped, one covering the whole range is attributed to it. The tree
    /// refines only as deep as the samples themselves; a sample spanning
    /// an already-subdivided node splits evenly between the halves. A
    /// post-order pass then gives every internal node the total of its
    /// subtree.
    pub(crate) fn merge(&self, measurements: &[(Ipv4Prefix, f64)]) -> AddressTrie<f64> {
        let mut tree = AddressTrie::new(0.0);
        let root = tree.root();
        for &(prefix, weight) in measurements {
            let clipped = if self.client_range.contains(&prefix) {
                prefix
            } else if prefix.contains(&self.client_range) {
                self.client_range
            } else {
                debug!(%prefix, "measurement outside the client range, dropped");
                continue;
            };
            deposit(&mut tree, root, clipped, weight);
        }
        aggregate(&mut tree);
        tree
    }

    /// Reshapes the tree for the next interval: leaves hotter than
    /// `expand_threshold × total` split in half (down to host routes),
    /// subtrees colder than it fold into a single leaf.
    pub(crate) fn adjust(&self, tree: &mut AddressTrie<f64>) {
        let root = tree.root();
        let total = *tree.value(root);
        if total <= 0.0 {
            return;
        }
        adjust_node(tree, root, self.expand_threshold * total);
    }
}

/// Total measured weight inside `prefix`. Reads the aggregate when the
/// tree reaches that depth, otherwise the covering leaf's uniform share.
pub(crate) fn weight_within(tree: &AddressTrie<f64>, prefix: Ipv4Prefix) -> f64 {
    let node = tree.seek(prefix);
    let range = tree.prefix_of(node);
    let value = *tree.value(node);
    if range == prefix {
        value
    } else {
        value * (prefix.size() as f64 / range.size() as f64)
    }
}

fn deposit(tree: &mut AddressTrie<f64>, node: NodeId, prefix: Ipv4Prefix, weight: f64) {
    let range = tree.prefix_of(node);
    if prefix.contains(&range) {
        match tree.children(node) {
            None => {
                let value = *tree.value(node);
                tree.set_value(node, value + weight);
            }
            // The sample straddles both halves: split evenly.
            Some([child0, child1]) => {
                deposit(tree, child0, prefix, weight / 2.0);
                deposit(tree, child1, prefix, weight / 2.0);
            }
        }
        return;
    }

    // The sample is finer than this node: refine towards it. The range
    // strictly contains the sample, so it is wider than a host route and
    // the expansion cannot fail.
    if tree.is_leaf(node) {
        let half = *tree.value(node) / 2.0;
        tree.expand(node, half, half)
            .expect("a refined node is wider than a host route");
    }
    let children = tree.children(node).expect("refined above");
    let child = children[prefix.bit(range.len()) as usize];
    deposit(tree, child, prefix, weight);
}

fn aggregate(tree: &mut AddressTrie<f64>) {
    for node in tree.post_order() {
        if let Some([child0, child1]) = tree.children(node) {
            let total = *tree.value(child0) + *tree.value(child1);
            tree.set_value(node, total);
        }
    }
}

fn adjust_node(tree: &mut AddressTrie<f64>, node: NodeId, cutoff: f64) {
    match tree.children(node) {
        None => {
            let value = *tree.value(node);
            if value > cutoff && tree.prefix_of(node).len() < 32 {
                let half = value / 2.0;
                let [child0, child1] = tree
                    .expand(node, half, half)
                    .expect("checked against host routes");
                adjust_node(tree, child0, cutoff);
                adjust_node(tree, child1, cutoff);
            }
        }
        Some([child0, child1]) => {
            let value = *tree.value(node);
            if value < cutoff {
                // The whole subtree is cold: fold it back into one leaf.
                tree.assign(tree.prefix_of(node), value)
                    .expect("a node's own range is assignable");
            } else {
                adjust_node(tree, child0, cutoff);
                adjust_node(tree, child1, cutoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Ipv4Prefix {
        s.parse().expect("test prefix")
    }

    fn whole_space() -> TrafficMerger {
        TrafficMerger::new(Ipv4Prefix::ZERO, 0.25)
    }

    #[test]
    fn merge_aggregates_totals_bottom_up() {
        let tree = whole_space().merge(&[(p("10.0.0.0/8"), 100.0), (p("10.0.0.0/9"), 50.0)]);
        assert_eq!(*tree.value(tree.root()), 150.0);
        assert_eq!(weight_within(&tree, p("10.0.0.0/8")), 150.0);
        assert_eq!(weight_within(&tree, p("10.0.0.0/9")), 100.0);
        assert_eq!(weight_within(&tree, p("10.128.0.0/9")), 50.0);
    }

    #[test]
    fn straddling_samples_split_evenly() {
        let tree = whole_space().merge(&[(p("0.0.0.0/2"), 8.0), (p("0.0.0.0/0"), 4.0)]);
        // The /0 sample spreads one unit into each existing quarter of the
        // lower half and two into the untouched upper half.
        assert_eq!(weight_within(&tree, p("0.0.0.0/2")), 9.0);
        assert_eq!(weight_within(&tree, p("64.0.0.0/2")), 1.0);
        assert_eq!(weight_within(&tree, p("128.0.0.0/1")), 2.0);
        assert_eq!(*tree.value(tree.root()), 12.0);
    }

    #[test]
    fn samples_outside_the_client_range_are_dropped() {
        let merger = TrafficMerger::new(p("0.0.0.0/1"), 0.25);
        let tree = merger.merge(&[(p("128.0.0.0/2"), 50.0)]);
        assert_eq!(*tree.value(tree.root()), 0.0);
    }

    #[test]
    fn samples_covering_the_client_range_are_clipped_to_it() {
        let merger = TrafficMerger::new(p("10.0.0.0/8"), 0.25);
        let tree = merger.merge(&[(p("0.0.0.0/0"), 80.0)]);
        assert_eq!(weight_within(&tree, p("10.0.0.0/8")), 80.0);
        assert_eq!(*tree.value(tree.root()), 80.0);
    }

    #[test]
    fn hot_leaves_expand_until_below_the_threshold() {
        let merger = whole_space();
        let mut tree = merger.merge(&[(p("0.0.0.0/1"), 100.0)]);
        merger.adjust(&mut tree);

        let leaves = tree.leaves();
        // 100 splits to 50s at /2, 25s at /3; 25 does not exceed the
        // cutoff of 0.25 x 100, so refinement stops there.
        assert_eq!(
            leaves,
            vec![
                (p("0.0.0.0/3"), 25.0),
                (p("32.0.0.0/3"), 25.0),
                (p("64.0.0.0/3"), 25.0),
                (p("96.0.0.0/3"), 25.0),
                (p("128.0.0.0/1"), 0.0),
            ]
        );
    }

    #[test]
    fn cold_subtrees_collapse_into_one_leaf() {
        let merger = TrafficMerger::new(Ipv4Prefix::ZERO, 0.5);
        let mut tree = merger.merge(&[
            (p("0.0.0.0/2"), 2.0),
            (p("64.0.0.0/2"), 1.0),
            (p("128.0.0.0/1"), 13.0),
        ]);
        merger.adjust(&mut tree);

        assert_eq!(
            tree.leaves(),
            vec![
                (p("0.0.0.0/1"), 3.0),
                (p("128.0.0.0/2"), 6.5),
                (p("192.0.0.0/2"), 6.5),
            ]
        );
    }

    #[test]
    fn uniform_leaves_report_proportional_shares() {
        let tree = whole_space().merge(&[(p("0.0.0.0/1"), 8.0)]);
        assert_eq!(weight_within(&tree, p("0.0.0.0/3")), 2.0);
    }
}
