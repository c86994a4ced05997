//! Rebuilds the cached catalog from the relational source.
//!
//! One cycle reads every plan with its rules, fetches items per plan, resolves
//! plan groups against the freshly assembled plans and commits everything in a
//! single [`CacheBatch`]. Any failure before the commit leaves the previously
//! committed catalog in place.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{StreamExt, TryStreamExt, stream};
use metrics::{counter, histogram};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::repos::{ItemRow, PlanGroupRow, PlanRuleRow, PlanSource, RepoError};
use crate::cache::keys::{
    PLAN_ENTITIES, PLAN_GROUP_ENTITIES, PLAN_SLIM_ENTITIES, PLANS, REFRESH_LOCK,
};
use crate::cache::{CacheBatch, CacheStore, StoreError};
use crate::domain::codec::{self, CodecError};
use crate::domain::entities::{Item, Plan, PlanGroup, PlanId, Rule};
use crate::domain::groups;

const DEFAULT_ITEM_FAN_OUT: usize = 8;
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStage {
    Lease,
    QueryPlans,
    QueryItems,
    QueryGroups,
    Encode,
    ReadCache,
    Commit,
}

impl RefreshStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshStage::Lease => "lease",
            RefreshStage::QueryPlans => "query_plans",
            RefreshStage::QueryItems => "query_items",
            RefreshStage::QueryGroups => "query_groups",
            RefreshStage::Encode => "encode",
            RefreshStage::ReadCache => "read_cache",
            RefreshStage::Commit => "commit",
        }
    }
}

impl fmt::Display for RefreshStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("another refresh cycle holds the cache write lease")]
    LeaseHeld,
    #[error("refresh failed at {stage}: {source}")]
    Source {
        stage: RefreshStage,
        #[source]
        source: RepoError,
    },
    #[error("failed to encode {entity} `{id}`: {source}")]
    Codec {
        entity: &'static str,
        id: String,
        #[source]
        source: CodecError,
    },
    #[error("refresh failed at {stage}: {source}")]
    Store {
        stage: RefreshStage,
        #[source]
        source: StoreError,
    },
}

impl RefreshError {
    pub fn stage(&self) -> RefreshStage {
        match self {
            RefreshError::Source { stage, .. } | RefreshError::Store { stage, .. } => *stage,
            RefreshError::Codec { .. } => RefreshStage::Encode,
            RefreshError::LeaseHeld => RefreshStage::Lease,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshOptions {
    /// Maximum number of concurrent per-plan item queries.
    pub item_fan_out: usize,
    /// Remove cached plans and groups that no longer exist in the source.
    pub prune_stale: bool,
    /// Lifetime of the cache write lease; must outlast a refresh cycle.
    pub lease_ttl: Duration,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            item_fan_out: DEFAULT_ITEM_FAN_OUT,
            prune_stale: true,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub plans: usize,
    pub rules: usize,
    pub items: usize,
    pub groups: usize,
    pub pruned: usize,
    pub elapsed: Duration,
    pub completed_at: OffsetDateTime,
}

/// Trim a text column; a null column becomes the empty string.
pub fn normalize_text(value: Option<String>) -> String {
    match value {
        Some(text) => text.trim().to_string(),
        None => String::new(),
    }
}

/// Folds `plans LEFT JOIN plan_rules` rows into plans.
///
/// Rows are expected sorted by plan id so that every plan's rows are
/// contiguous: a new plan starts exactly when the plan id differs from the
/// previous row. A plan that reappears after another plan is merged into its
/// first occurrence and logged, since that means the source broke the
/// ordering contract.
#[derive(Debug, Default)]
pub struct PlanGrouper {
    plans: Vec<Plan>,
    positions: HashMap<String, usize>,
}

impl PlanGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: PlanRuleRow) {
        let continues_last = self
            .plans
            .last()
            .is_some_and(|plan| plan.id.as_str() == row.plan_id);

        let index = if continues_last {
            self.plans.len() - 1
        } else if let Some(&index) = self.positions.get(&row.plan_id) {
            warn!(
                target = "plancache::refresh",
                plan_id = %row.plan_id,
                "plan rows are not contiguous; merging into first occurrence"
            );
            index
        } else {
            self.start_plan(&row)
        };

        if let Some(rule_id) = row.rule_id {
            self.plans[index].rules.push(Rule {
                id: rule_id,
                name: normalize_text(row.rule_name),
                title: normalize_text(row.rule_title),
                description: row.rule_description,
            });
        }
    }

    fn start_plan(&mut self, row: &PlanRuleRow) -> usize {
        let index = self.plans.len();
        self.plans.push(Plan {
            id: PlanId::from(row.plan_id.clone()),
            title: normalize_text(row.title.clone()),
            description: row.description.clone(),
            image: normalize_text(row.image.clone()),
            thumbnail: normalize_text(row.thumbnail.clone()),
            period: row.period,
            show_in_index: row.show_in_index.unwrap_or(false),
            rules: Vec::new(),
            items: Vec::new(),
            joined_count: None,
        });
        self.positions.insert(row.plan_id.clone(), index);
        index
    }

    pub fn finish(self) -> Vec<Plan> {
        self.plans
    }
}

fn item_from_row(row: ItemRow) -> Item {
    Item {
        id: row.id,
        title: normalize_text(row.title),
        description: row.description,
    }
}

/// Single-writer refresh of the cached catalog.
pub struct RefreshPipeline {
    source: Arc<dyn PlanSource>,
    store: Arc<dyn CacheStore>,
    options: RefreshOptions,
    writer: Mutex<()>,
}

impl RefreshPipeline {
    pub fn new(
        source: Arc<dyn PlanSource>,
        store: Arc<dyn CacheStore>,
        options: RefreshOptions,
    ) -> Self {
        Self {
            source,
            store,
            options,
            writer: Mutex::new(()),
        }
    }

    /// Run one full cycle.
    ///
    /// Callers sharing this pipeline queue behind the writer lock. Writers in
    /// other pipelines or processes are excluded by a lease held in the cache
    /// itself; when another writer holds it the cycle fails with
    /// [`RefreshError::LeaseHeld`] without touching the cache.
    pub async fn refresh(&self) -> Result<RefreshReport, RefreshError> {
        let _writer = self.writer.lock().await;
        let started = Instant::now();

        let result = self.run_leased(started).await;

        histogram!("plancache_refresh_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        match &result {
            Ok(report) => {
                counter!("plancache_refresh_total", "outcome" => "success").increment(1);
                info!(
                    target = "plancache::refresh",
                    plans = report.plans,
                    rules = report.rules,
                    items = report.items,
                    groups = report.groups,
                    pruned = report.pruned,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "catalog refreshed"
                );
            }
            Err(RefreshError::LeaseHeld) => {
                counter!("plancache_refresh_total", "outcome" => "lease_held").increment(1);
                info!(
                    target = "plancache::refresh",
                    "refresh skipped; another writer holds the cache lease"
                );
            }
            Err(err) => {
                counter!("plancache_refresh_total", "outcome" => "failure").increment(1);
                error!(
                    target = "plancache::refresh",
                    stage = %err.stage(),
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "catalog refresh failed; previous cache content kept"
                );
            }
        }

        result
    }

    async fn run_leased(&self, started: Instant) -> Result<RefreshReport, RefreshError> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .store
            .try_acquire_lease(REFRESH_LOCK, &token, self.options.lease_ttl)
            .await
            .map_err(|source| RefreshError::Store {
                stage: RefreshStage::Lease,
                source,
            })?;
        if !acquired {
            return Err(RefreshError::LeaseHeld);
        }

        let result = self.run_cycle(started).await;

        if let Err(err) = self.store.release_lease(REFRESH_LOCK, &token).await {
            warn!(
                target = "plancache::refresh",
                error = %err,
                "failed to release the cache write lease; it expires on its own"
            );
        }
        result
    }

    async fn run_cycle(&self, started: Instant) -> Result<RefreshReport, RefreshError> {
        let rows = self
            .source
            .plans_with_rules()
            .await
            .map_err(|source| RefreshError::Source {
                stage: RefreshStage::QueryPlans,
                source,
            })?;
        let row_count = rows.len();

        let mut grouper = PlanGrouper::new();
        for row in rows {
            grouper.push(row);
        }
        let mut plans = grouper.finish();
        debug!(
            target = "plancache::refresh",
            rows = row_count,
            plans = plans.len(),
            "plan rows grouped"
        );

        self.attach_items(&mut plans).await?;

        let group_rows = self
            .source
            .plan_groups()
            .await
            .map_err(|source| RefreshError::Source {
                stage: RefreshStage::QueryGroups,
                source,
            })?;
        let groups = resolve_groups(&plans, group_rows);

        let mut batch = CacheBatch::new();
        for plan in &plans {
            let full = encode_entity("plan", plan.id.as_str(), plan)?;
            let slim = encode_entity("slim plan", plan.id.as_str(), &plan.slim())?;
            batch.hset(PLAN_ENTITIES, plan.id.as_str(), full);
            batch.hset(PLAN_SLIM_ENTITIES, plan.id.as_str(), slim);
            batch.sadd(PLANS, plan.id.as_str());
        }
        for group in &groups {
            let bytes = encode_entity("plan group", &group.id, group)?;
            batch.hset(PLAN_GROUP_ENTITIES, group.id.clone(), bytes);
        }

        let pruned = if self.options.prune_stale {
            self.stage_pruning(&mut batch, &plans, &groups).await?
        } else {
            0
        };

        let ops = batch.len();
        self.store
            .exec(batch)
            .await
            .map_err(|source| RefreshError::Store {
                stage: RefreshStage::Commit,
                source,
            })?;
        debug!(target = "plancache::refresh", ops, "cache batch committed");

        Ok(RefreshReport {
            plans: plans.len(),
            rules: plans.iter().map(|plan| plan.rules.len()).sum(),
            items: plans.iter().map(|plan| plan.items.len()).sum(),
            groups: groups.len(),
            pruned,
            elapsed: started.elapsed(),
            completed_at: OffsetDateTime::now_utc(),
        })
    }

    async fn attach_items(&self, plans: &mut [Plan]) -> Result<(), RefreshError> {
        let fan_out = self.options.item_fan_out.max(1);
        let ids: Vec<String> = plans
            .iter()
            .map(|plan| plan.id.as_str().to_string())
            .collect();

        let item_lists: Vec<Vec<ItemRow>> = stream::iter(ids)
            .map(|plan_id| {
                let source = Arc::clone(&self.source);
                async move { source.items_for_plan(&plan_id).await }
            })
            .buffered(fan_out)
            .try_collect()
            .await
            .map_err(|source| RefreshError::Source {
                stage: RefreshStage::QueryItems,
                source,
            })?;

        for (plan, items) in plans.iter_mut().zip(item_lists) {
            plan.items = items.into_iter().map(item_from_row).collect();
        }
        Ok(())
    }

    /// Queue deletions for cached entries this cycle did not produce.
    async fn stage_pruning(
        &self,
        batch: &mut CacheBatch,
        plans: &[Plan],
        groups: &[PlanGroup],
    ) -> Result<usize, RefreshError> {
        let read_error = |source: StoreError| RefreshError::Store {
            stage: RefreshStage::ReadCache,
            source,
        };

        let fresh_plans: BTreeSet<&str> = plans.iter().map(|plan| plan.id.as_str()).collect();
        let mut cached_plans: BTreeSet<String> =
            self.store.smembers(PLANS).await.map_err(read_error)?.into_iter().collect();
        cached_plans.extend(self.store.hkeys(PLAN_ENTITIES).await.map_err(read_error)?);
        cached_plans.extend(self.store.hkeys(PLAN_SLIM_ENTITIES).await.map_err(read_error)?);
        let stale_plans: Vec<String> = cached_plans
            .into_iter()
            .filter(|id| !fresh_plans.contains(id.as_str()))
            .collect();

        let fresh_groups: BTreeSet<&str> = groups.iter().map(|group| group.id.as_str()).collect();
        let stale_groups: Vec<String> = self
            .store
            .hkeys(PLAN_GROUP_ENTITIES)
            .await
            .map_err(read_error)?
            .into_iter()
            .filter(|id| !fresh_groups.contains(id.as_str()))
            .collect();

        let pruned = stale_plans.len() + stale_groups.len();
        if pruned > 0 {
            debug!(
                target = "plancache::refresh",
                plans = ?stale_plans,
                groups = ?stale_groups,
                "pruning stale cache entries"
            );
        }

        batch.hdel(PLAN_ENTITIES, stale_plans.clone());
        batch.hdel(PLAN_SLIM_ENTITIES, stale_plans.clone());
        batch.srem(PLANS, stale_plans);
        batch.hdel(PLAN_GROUP_ENTITIES, stale_groups);

        Ok(pruned)
    }
}

fn resolve_groups(plans: &[Plan], rows: Vec<PlanGroupRow>) -> Vec<PlanGroup> {
    let snapshot: HashMap<&PlanId, &Plan> = plans.iter().map(|plan| (&plan.id, plan)).collect();

    rows.into_iter()
        .map(|row| {
            let mask = row.mask as u64;
            PlanGroup {
                plans: groups::resolve(mask, |id| snapshot.get(id).map(|plan| (*plan).clone())),
                id: row.id,
                title: normalize_text(row.title),
                description: row.description,
                mask,
            }
        })
        .collect()
}

fn encode_entity<T: serde::Serialize>(
    entity: &'static str,
    id: &str,
    value: &T,
) -> Result<Vec<u8>, RefreshError> {
    codec::encode(value).map_err(|source| RefreshError::Codec {
        entity,
        id: id.to_string(),
        source,
    })
}
