//! Wire types shared by the plancache HTTP API and its clients.
//!
//! Every endpoint answers with an [`ApiResponse`] envelope: `{code, data}` on
//! success, `{code, msg}` on failure. `code` mirrors the HTTP status.

use serde::{Deserialize, Serialize};

/// Response envelope used by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: 200,
            data: Some(data),
            msg: None,
        }
    }

    pub fn failure(code: u16, msg: impl Into<String>) -> Self {
        Self {
            code,
            data: None,
            msg: Some(msg.into()),
        }
    }
}

/// Which projection of a plan a read should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanVariant {
    /// Plan with its rules and items.
    #[default]
    Full,
    /// Plan without nested rules and items.
    Slim,
}

/// Query string accepted by the plan read endpoints.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VariantQuery {
    #[serde(default)]
    pub variant: Option<PlanVariant>,
}

/// One absolute joined-count write, serialized as a `[plan_id, count]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedCountEntry(pub String, pub i64);

/// Outcome of a completed refresh cycle as reported to the admin caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub tracking_id: String,
    pub plans: usize,
    pub rules: usize,
    pub items: usize,
    pub groups: usize,
    pub pruned: usize,
    pub elapsed_ms: u64,
    pub completed_at: String,
}
