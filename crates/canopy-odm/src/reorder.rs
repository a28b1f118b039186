//! Child-order diffing: derive the insert-before sequence that transforms
//! one key order into another.
//!
//! The algorithm is a greedy left-to-right scan over the target order,
//! simulating each emitted operation against a working copy. It handles
//! every permutation uniformly (the two-element swap naturally costs a
//! single pair) and emits nothing for keys already in place.

use crate::changeset::ReorderPair;

/// Compute insert-before pairs transforming `original` into `target`.
///
/// Both slices must contain the same keys (callers diff out insertions
/// and removals first); keys present on only one side are ignored.
pub fn insert_before_pairs(original: &[String], target: &[String]) -> Vec<ReorderPair> {
    let mut current: Vec<&String> = original
        .iter()
        .filter(|k| target.contains(*k))
        .collect();
    let target: Vec<&String> = target
        .iter()
        .filter(|k| original.contains(*k))
        .collect();

    let mut pairs = Vec::new();
    for position in 0..target.len() {
        let wanted = target[position];
        if current[position] == wanted {
            continue;
        }
        let displaced = current[position];
        pairs.push(ReorderPair::new(wanted.clone(), displaced.clone()));
        let from = current
            .iter()
            .position(|k| *k == wanted)
            .expect("target keys are filtered to the original set");
        current.remove(from);
        current.insert(position, wanted);
    }
    pairs
}

/// Replay insert-before pairs against an order. Drives the same child
/// ordering the backing store produces from `order_before` calls.
pub fn replay(original: &[String], pairs: &[ReorderPair]) -> Vec<String> {
    let mut order: Vec<String> = original.to_vec();
    for pair in pairs {
        let Some(from) = order.iter().position(|k| *k == pair.key) else {
            continue;
        };
        order.remove(from);
        let Some(to) = order.iter().position(|k| *k == pair.before) else {
            order.insert(from, pair.key.clone());
            continue;
        };
        order.insert(to, pair.key.clone());
    }
    order
}
