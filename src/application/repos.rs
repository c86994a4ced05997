//! Relational source of truth for the plan catalog.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// One row of `plans LEFT JOIN plan_rules`; rule columns are null for plans
/// without rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanRuleRow {
    pub plan_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub thumbnail: Option<String>,
    pub period: Option<i32>,
    pub show_in_index: Option<bool>,
    pub rule_id: Option<String>,
    pub rule_name: Option<String>,
    pub rule_title: Option<String>,
    pub rule_description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemRow {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanGroupRow {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Stored as a signed BIGINT; reinterpret the bits as `u64`.
    pub mask: i64,
}

#[async_trait]
pub trait PlanSource: Send + Sync {
    /// Plans joined with their rules, ordered by plan id and then rule id.
    /// Every row of a plan must be contiguous.
    async fn plans_with_rules(&self) -> Result<Vec<PlanRuleRow>, RepoError>;

    /// Items of one plan, ordered by item id.
    async fn items_for_plan(&self, plan_id: &str) -> Result<Vec<ItemRow>, RepoError>;

    async fn plan_groups(&self) -> Result<Vec<PlanGroupRow>, RepoError>;
}
