use super::entities::{Plan, PlanId};

/// Expand a group mask into its member plans.
///
/// Bits are visited from 0 to 63; the plan at bit `i` is looked up by the
/// identifier `2^i`. Plans the lookup cannot find are skipped.
pub fn resolve<F>(mask: u64, mut lookup: F) -> Vec<Plan>
where
    F: FnMut(&PlanId) -> Option<Plan>,
{
    (0..u64::BITS)
        .filter(|bit| mask & (1u64 << bit) != 0)
        .filter_map(|bit| lookup(&PlanId::for_group_bit(bit)))
        .collect()
}
