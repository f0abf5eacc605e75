use estuary_core::{AddressTrie, Ipv4Prefix, Target, TargetId};

use super::{diff, TransitionKind};

fn p(s: &str) -> Ipv4Prefix {
    s.parse().expect("test prefix")
}

fn concrete(id: u64) -> Target {
    Target::Concrete(TargetId(id))
}

fn tree_of(assignments: &[(&str, Target)]) -> AddressTrie<Target> {
    let mut tree = AddressTrie::new(Target::Unassigned);
    for (prefix, target) in assignments {
        let node = tree.assign(p(prefix), *target).expect("test assignment");
        tree.collapse_equal_leaves_upwards(node);
    }
    tree
}

#[test]
fn identical_trees_produce_no_transitions() {
    let tree = tree_of(&[("0.0.0.0/1", concrete(1)), ("128.0.0.0/1", concrete(2))]);
    assert!(diff(&tree, &tree.clone()).is_empty());
}

#[test]
fn changed_leaf_emits_a_direct_transition() {
    let before = tree_of(&[("0.0.0.0/1", concrete(1)), ("128.0.0.0/1", concrete(2))]);
    let after = tree_of(&[("0.0.0.0/1", concrete(1)), ("128.0.0.0/1", concrete(3))]);

    let transitions = diff(&before, &after);
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].kind(), TransitionKind::Direct);
    assert_eq!(transitions[0].from, vec![(p("128.0.0.0/1"), concrete(2))]);
    assert_eq!(transitions[0].to, vec![(p("128.0.0.0/1"), concrete(3))]);
    assert_eq!(transitions[0].region(), p("128.0.0.0/1"));
}

#[test]
fn unassignment_is_a_direct_transition() {
    let before = tree_of(&[("0.0.0.0/1", concrete(1)), ("128.0.0.0/1", concrete(2))]);
    let after = tree_of(&[("0.0.0.0/1", concrete(1))]);

    let transitions = diff(&before, &after);
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].kind(), TransitionKind::Direct);
    assert_eq!(transitions[0].from, vec![(p("128.0.0.0/1"), concrete(2))]);
    assert_eq!(
        transitions[0].to,
        vec![(p("128.0.0.0/1"), Target::Unassigned)]
    );
}

#[test]
fn subdividing_one_leaf_emits_a_single_split() {
    let before = tree_of(&[("0.0.0.0/1", concrete(1)), ("128.0.0.0/1", concrete(2))]);
    let after = tree_of(&[
        ("0.0.0.0/1", concrete(1)),
        ("128.0.0.0/2", concrete(3)),
        ("192.0.0.0/2", concrete(4)),
    ]);

    let transitions = diff(&before, &after);
    assert_eq!(transitions.len(), 1);
    let split = &transitions[0];
    assert_eq!(split.kind(), TransitionKind::Split);
    assert_eq!(split.from, vec![(p("128.0.0.0/1"), concrete(2))]);
    assert_eq!(
        split.to,
        vec![
            (p("128.0.0.0/2"), concrete(3)),
            (p("192.0.0.0/2"), concrete(4)),
        ]
    );
    assert_eq!(split.region(), p("128.0.0.0/1"));
}

#[test]
fn folding_a_region_emits_a_single_merge() {
    let before = tree_of(&[
        ("128.0.0.0/2", concrete(3)),
        ("192.0.0.0/3", concrete(4)),
        ("224.0.0.0/3", concrete(5)),
    ]);
    let after = tree_of(&[("128.0.0.0/1", concrete(3))]);

    let transitions = diff(&before, &after);
    assert_eq!(transitions.len(), 1);
    let merge = &transitions[0];
    assert_eq!(merge.kind(), TransitionKind::Merge);
    assert_eq!(merge.to, vec![(p("128.0.0.0/1"), concrete(3))]);
    // All three old leaves belong to the same contiguous region, in
    // address order.
    assert_eq!(
        merge.from,
        vec![
            (p("128.0.0.0/2"), concrete(3)),
            (p("192.0.0.0/3"), concrete(4)),
            (p("224.0.0.0/3"), concrete(5)),
        ]
    );
    assert_eq!(merge.region(), p("128.0.0.0/1"));
}

#[test]
fn independent_halves_diff_independently() {
    let before = tree_of(&[("0.0.0.0/2", concrete(1)), ("128.0.0.0/1", concrete(2))]);
    let after = tree_of(&[("0.0.0.0/2", concrete(9)), ("128.0.0.0/1", concrete(2))]);

    let transitions = diff(&before, &after);
    assert_eq!(transitions.len(), 1, "untouched half must not appear");
    assert_eq!(transitions[0].region(), p("0.0.0.0/2"));
}

#[test]
fn reapplying_the_diff_reproduces_the_target_tree() {
    let before = tree_of(&[
        ("0.0.0.0/2", concrete(1)),
        ("64.0.0.0/2", concrete(2)),
        ("128.0.0.0/1", concrete(3)),
    ]);
    let after = tree_of(&[
        ("0.0.0.0/1", concrete(1)),
        ("128.0.0.0/2", concrete(3)),
        ("192.0.0.0/2", concrete(5)),
    ]);

    let mut rebuilt = before.clone();
    for transition in diff(&before, &after) {
        for (prefix, target) in &transition.to {
            let node = rebuilt.assign(*prefix, *target).expect("reapply");
            rebuilt.collapse_equal_leaves_upwards(node);
        }
    }
    assert_eq!(rebuilt.leaves(), after.leaves());
}
