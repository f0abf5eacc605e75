use std::collections::BTreeMap;

// Weight partitioning: turns configured floating-point target weights into
// a multiset of CIDR block sizes that the assignment engine can place.

/// Fraction of the block budget actually handed out; the remaining 1/8 of
/// the space stays slack so small weight changes do not force
/// maximum-depth subdivision.
pub(crate) fn capacity_for(max_prefix_length: u8) -> u64 {
    (1u64 << max_prefix_length) / 8 * 7
}

/// Scales non-negative weights to integers summing to exactly `capacity`.
///
/// Rounding is applied to the *cumulative* weight sums and the results
/// de-cumulated, so no weight can be rounded below what its cumulative
/// share deserves and the capacity is conserved exactly. Rounding each
/// weight independently would do neither.
///
/// All-zero input yields all zeros; the caller decides on a fallback
/// (conventionally one unit per target) to avoid a degenerate partition.
pub(crate) fn normalize_weights(weights: &[f64], capacity: u64) -> Vec<u64> {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return vec![0; weights.len()];
    }
    let scale = capacity as f64 / total;

    let mut normalized = Vec::with_capacity(weights.len());
    let mut cumulative = 0.0;
    let mut handed_out = 0u64;
    for weight in weights {
        cumulative += weight;
        let rounded = (cumulative * scale).round() as u64;
        normalized.push(rounded - handed_out);
        handed_out = rounded;
    }
    normalized
}

/// Decomposes normalized integer weights into required block sizes.
///
/// Each weight is read as a bitmask over a `max_prefix_length`-bit budget:
/// the standard decomposition of an integer into distinct powers of two,
/// where every power of two becomes one aligned CIDR block of the matching
/// size. A target therefore receives its share in O(log capacity) blocks,
/// never more than a factor of two off its ideal share at any single
/// block boundary.
///
/// The result maps mask length to the target indices needing one block of
/// that size, iterating from the largest block (shortest mask) down.
pub(crate) fn plan_blocks(normalized: &[u64], max_prefix_length: u8) -> BTreeMap<u8, Vec<usize>> {
    let mut blocks: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
    for (index, &weight) in normalized.iter().enumerate() {
        debug_assert!(
            weight < 1u64 << max_prefix_length,
            "weight {} exceeds the {}-bit block budget",
            weight,
            max_prefix_length
        );
        for bit in 0..max_prefix_length {
            if weight >> bit & 1 == 1 {
                blocks
                    .entry(max_prefix_length - bit)
                    .or_default()
                    .push(index);
            }
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_preserves_exact_integer_weights() {
        assert_eq!(normalize_weights(&[1.0, 3.0, 4.0], 8), vec![1, 3, 4]);
    }

    #[test]
    fn normalize_conserves_capacity() {
        for weights in [
            vec![0.3, 0.3, 0.4],
            vec![1.0, 1.0, 1.0],
            vec![0.1, 2.7, 9.9, 0.01],
            vec![5.0],
        ] {
            for capacity in [7u64, 56, 896, 3584] {
                let normalized = normalize_weights(&weights, capacity);
                assert_eq!(normalized.len(), weights.len());
                assert_eq!(
                    normalized.iter().sum::<u64>(),
                    capacity,
                    "capacity not conserved for {:?} at {}",
                    weights,
                    capacity
                );
            }
        }
    }

    #[test]
    fn normalize_does_not_starve_small_weights() {
        // Independent rounding would hand the two small weights 0 each and
        // overshoot on the rest; cumulative rounding keeps them alive.
        let normalized = normalize_weights(&[0.4, 0.4, 99.2], 56);
        assert_eq!(normalized.iter().sum::<u64>(), 56);
        assert!(normalized[0] + normalized[1] >= 1);
    }

    #[test]
    fn normalize_all_zero_weights_yields_zeros() {
        assert_eq!(normalize_weights(&[0.0, 0.0], 56), vec![0, 0]);
        assert_eq!(normalize_weights(&[], 56), Vec::<u64>::new());
    }

    #[test]
    fn capacity_reserves_an_eighth_of_the_space() {
        assert_eq!(capacity_for(3), 7);
        assert_eq!(capacity_for(6), 56);
        assert_eq!(capacity_for(10), 896);
    }

    #[test]
    fn plan_assigns_largest_blocks_to_heaviest_weights() {
        let blocks = plan_blocks(&[1, 3, 4], 3);
        // Weight 4 (index 2) gets the /1, weight 3 (index 1) a /2 plus a
        // /3, weight 1 (index 0) a /3.
        assert_eq!(
            blocks.keys().copied().collect::<Vec<_>>(),
            vec![1, 2, 3],
            "largest block first"
        );
        assert_eq!(blocks[&1], vec![2]);
        assert_eq!(blocks[&2], vec![1]);
        assert_eq!(blocks[&3], vec![0, 1]);
    }

    #[test]
    fn plan_covers_every_unit_of_weight() {
        let normalized = normalize_weights(&[2.0, 5.0, 1.0], 56);
        let blocks = plan_blocks(&normalized, 6);
        let mut covered = vec![0u64; normalized.len()];
        for (mask_len, indices) in &blocks {
            for &index in indices {
                covered[index] += 1u64 << (6 - mask_len);
            }
        }
        assert_eq!(covered, normalized);
    }
}
