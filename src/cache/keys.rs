//! Cache keyspace names.
//!
//! These names are shared with the other services that read the catalog and
//! maintain user memberships, so they must not change.

use crate::domain::entities::UserId;

/// Hash: plan id to packed full plan.
pub const PLAN_ENTITIES: &str = "plan-entities";
/// Hash: plan id to packed slim plan.
pub const PLAN_SLIM_ENTITIES: &str = "plan-slim-entities";
/// Hash: group id to packed plan group.
pub const PLAN_GROUP_ENTITIES: &str = "plan-group-entities";
/// Set: every plan id written by the last refresh.
pub const PLANS: &str = "plans";
/// Hash: plan id to joined counter.
pub const PLAN_JOINED_COUNT: &str = "plan-joined-count";

/// String: token of the refresh cycle currently allowed to write.
pub const REFRESH_LOCK: &str = "plan-refresh-lock";

const USER_PLANS_PREFIX: &str = "plans-of-user:";

/// Set of plan ids a user has joined. Maintained elsewhere; read-only here.
pub fn user_plans_key(user: &UserId) -> String {
    format!("{USER_PLANS_PREFIX}{user}")
}
