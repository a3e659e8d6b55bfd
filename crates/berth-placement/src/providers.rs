//! Capacity provider strategy.
//!
//! Each provider's `base` is satisfied first, in strategy order. Tasks
//! beyond the bases go to the provider whose share above its base is
//! smallest relative to its `weight`. Weight-zero providers only receive
//! their base.

use std::collections::BTreeMap;

use berth_state::CapacityProviderStrategyItem;

/// Assign `count` new tasks to capacity providers.
///
/// `current` holds the live task count per provider. An empty strategy
/// yields `None` (any host) for every task. When every weight is zero and
/// all bases are met, extra tasks go to the first provider.
pub fn distribute_providers(
    strategy: &[CapacityProviderStrategyItem],
    current: &BTreeMap<String, u32>,
    count: u32,
) -> Vec<Option<String>> {
    if strategy.is_empty() {
        return vec![None; count as usize];
    }

    let mut counts: Vec<u32> = strategy
        .iter()
        .map(|item| current.get(&item.capacity_provider).copied().unwrap_or(0))
        .collect();
    let mut assigned = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let index = strategy
            .iter()
            .enumerate()
            .position(|(i, item)| counts[i] < item.base)
            .or_else(|| {
                strategy
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| item.weight > 0)
                    .min_by(|(i, a), (j, b)| {
                        let above_i = u64::from(counts[*i].saturating_sub(a.base));
                        let above_j = u64::from(counts[*j].saturating_sub(b.base));
                        // above_i / weight_i vs above_j / weight_j
                        (above_i * u64::from(b.weight))
                            .cmp(&(above_j * u64::from(a.weight)))
                            .then(i.cmp(j))
                    })
                    .map(|(i, _)| i)
            })
            .unwrap_or(0);
        counts[index] += 1;
        assigned.push(Some(strategy[index].capacity_provider.clone()));
    }
    assigned
}
