//! Read path over the cached catalog plus joined-count mutation.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::keys::{
    PLAN_ENTITIES, PLAN_GROUP_ENTITIES, PLAN_JOINED_COUNT, PLAN_SLIM_ENTITIES, PLANS,
    user_plans_key,
};
use crate::cache::{CacheBatch, CacheStore, StoreError};
use crate::domain::codec::{self, CodecError};
use crate::domain::entities::{PlanGroup, PlanId, PlanVariant, PlanView, UserId};
use crate::domain::error::DomainError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl FieldError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    fn from_domain(field: impl Into<String>, err: &DomainError) -> Self {
        Self::new(field, err.reason())
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("plan not found")]
    NotFound,
    #[error("invalid request: {}", describe_fields(.0))]
    Validation(Vec<FieldError>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    fn field(field: &str, err: DomainError) -> Self {
        Self::Validation(vec![FieldError::from_domain(field, &err)])
    }
}

fn describe_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinedCountDelta {
    Increase,
    Decrease,
}

impl JoinedCountDelta {
    pub fn value(self) -> i64 {
        match self {
            JoinedCountDelta::Increase => 1,
            JoinedCountDelta::Decrease => -1,
        }
    }
}

fn entity_key(variant: PlanVariant) -> &'static str {
    match variant {
        PlanVariant::Full => PLAN_ENTITIES,
        PlanVariant::Slim => PLAN_SLIM_ENTITIES,
    }
}

fn decode_view(variant: PlanVariant, bytes: &[u8]) -> Result<PlanView, CodecError> {
    match variant {
        PlanVariant::Full => codec::decode(bytes).map(PlanView::Full),
        PlanVariant::Slim => codec::decode(bytes).map(PlanView::Slim),
    }
}

fn record_skip(keyspace: &'static str, field: &str, err: &CodecError) {
    counter!("plancache_codec_skipped_total", "keyspace" => keyspace).increment(1);
    warn!(
        target = "plancache::plans",
        keyspace,
        field,
        error = %err,
        "skipping undecodable cache entry"
    );
}

pub struct PlanQueryService {
    store: Arc<dyn CacheStore>,
}

impl PlanQueryService {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub async fn get_plan(&self, id: &str, variant: PlanVariant) -> Result<PlanView, QueryError> {
        let id = PlanId::parse(id).map_err(|err| QueryError::field("id", err))?;
        let keyspace = entity_key(variant);

        let bytes = self
            .store
            .hget(keyspace, id.as_str())
            .await?
            .ok_or(QueryError::NotFound)?;

        let mut view = decode_view(variant, &bytes).map_err(|err| {
            record_skip(keyspace, id.as_str(), &err);
            QueryError::NotFound
        })?;

        let joined = self
            .store
            .counter_get(PLAN_JOINED_COUNT, id.as_str())
            .await?
            .unwrap_or(0);
        view.set_joined_count(joined);
        Ok(view)
    }

    /// Plans the user has not joined yet.
    pub async fn list_available_plans(
        &self,
        user_id: &str,
        variant: PlanVariant,
    ) -> Result<Vec<PlanView>, QueryError> {
        let user = UserId::parse(user_id).map_err(|err| QueryError::field("user_id", err))?;
        let ids = self.store.sdiff(PLANS, &user_plans_key(&user)).await?;
        self.resolve_views(ids, variant).await
    }

    pub async fn list_joined_plans(
        &self,
        user_id: &str,
        variant: PlanVariant,
    ) -> Result<Vec<PlanView>, QueryError> {
        let user = UserId::parse(user_id).map_err(|err| QueryError::field("user_id", err))?;
        let ids = self.store.smembers(&user_plans_key(&user)).await?;
        self.resolve_views(ids, variant).await
    }

    pub async fn list_all_plans(&self, variant: PlanVariant) -> Result<Vec<PlanView>, QueryError> {
        let keyspace = entity_key(variant);
        let entries = self.store.hget_all(keyspace).await?;

        let mut views: Vec<PlanView> = entries
            .into_iter()
            .filter_map(|(field, bytes)| match decode_view(variant, &bytes) {
                Ok(view) => Some(view),
                Err(err) => {
                    record_skip(keyspace, &field, &err);
                    None
                }
            })
            .collect();

        self.augment(&mut views).await?;
        Ok(views)
    }

    pub async fn list_all_plan_groups(&self) -> Result<Vec<PlanGroup>, QueryError> {
        let entries = self.store.hget_all(PLAN_GROUP_ENTITIES).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(field, bytes)| match codec::decode::<PlanGroup>(&bytes) {
                Ok(group) => Some(group),
                Err(err) => {
                    record_skip(PLAN_GROUP_ENTITIES, &field, &err);
                    None
                }
            })
            .collect())
    }

    /// Atomically move a joined counter by one and return the new value.
    pub async fn adjust_joined_count(
        &self,
        id: &str,
        delta: JoinedCountDelta,
    ) -> Result<i64, QueryError> {
        let id = PlanId::parse(id).map_err(|err| QueryError::field("id", err))?;
        let value = self
            .store
            .counter_incr(PLAN_JOINED_COUNT, id.as_str(), delta.value())
            .await?;
        if value < 0 {
            warn!(
                target = "plancache::plans",
                plan_id = %id,
                value,
                "joined count dropped below zero"
            );
        }
        Ok(value)
    }

    /// Overwrite several joined counters in one atomic batch.
    pub async fn set_joined_counts(&self, counts: &[(String, i64)]) -> Result<usize, QueryError> {
        let mut errors = Vec::new();
        let mut batch = CacheBatch::new();

        for (index, (id, count)) in counts.iter().enumerate() {
            match PlanId::parse(id) {
                Ok(id) => batch.counter_set(PLAN_JOINED_COUNT, id.into_inner(), *count),
                Err(err) => errors.push(FieldError::from_domain(format!("counts[{index}].id"), &err)),
            }
            if *count < 0 {
                errors.push(FieldError::new(
                    format!("counts[{index}].count"),
                    "must not be negative",
                ));
            }
        }

        if !errors.is_empty() {
            return Err(QueryError::Validation(errors));
        }

        let written = batch.len();
        if written > 0 {
            self.store.exec(batch).await?;
        }
        debug!(target = "plancache::plans", written, "joined counts overwritten");
        Ok(written)
    }

    async fn resolve_views(
        &self,
        ids: Vec<String>,
        variant: PlanVariant,
    ) -> Result<Vec<PlanView>, QueryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keyspace = entity_key(variant);
        let payloads = self.store.hget_many(keyspace, &ids).await?;
        let counts = self.store.counter_get_many(PLAN_JOINED_COUNT, &ids).await?;

        let views = ids
            .iter()
            .zip(payloads)
            .zip(counts)
            .filter_map(|((id, payload), count)| {
                let bytes: Bytes = match payload {
                    Some(bytes) => bytes,
                    None => {
                        debug!(
                            target = "plancache::plans",
                            keyspace,
                            plan_id = %id,
                            "plan listed in a set has no cached entity"
                        );
                        return None;
                    }
                };
                match decode_view(variant, &bytes) {
                    Ok(mut view) => {
                        view.set_joined_count(count.unwrap_or(0));
                        Some(view)
                    }
                    Err(err) => {
                        record_skip(keyspace, id, &err);
                        None
                    }
                }
            })
            .collect();
        Ok(views)
    }

    async fn augment(&self, views: &mut [PlanView]) -> Result<(), QueryError> {
        if views.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = views
            .iter()
            .map(|view| view.id().as_str().to_string())
            .collect();
        let counts = self.store.counter_get_many(PLAN_JOINED_COUNT, &ids).await?;
        for (view, count) in views.iter_mut().zip(counts) {
            view.set_joined_count(count.unwrap_or(0));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::domain::entities::{Plan, PlanSlim};

    fn plan(id: &str) -> Plan {
        Plan {
            id: PlanId::from(id),
            title: format!("Plan {id}"),
            description: None,
            image: String::new(),
            thumbnail: String::new(),
            period: None,
            show_in_index: true,
            rules: Vec::new(),
            items: Vec::new(),
            joined_count: None,
        }
    }

    async fn seeded() -> (Arc<MemoryCacheStore>, PlanQueryService) {
        let store = Arc::new(MemoryCacheStore::new());
        let mut batch = CacheBatch::new();
        for id in ["1", "2"] {
            let plan = plan(id);
            batch.hset(PLAN_ENTITIES, id, codec::encode(&plan).expect("encode"));
            batch.hset(PLAN_SLIM_ENTITIES, id, codec::encode(&plan.slim()).expect("encode"));
            batch.sadd(PLANS, id);
        }
        store.exec(batch).await.expect("seed");
        let service = PlanQueryService::new(store.clone());
        (store, service)
    }

    #[tokio::test]
    async fn get_plan_defaults_joined_count_to_zero() {
        let (_store, service) = seeded().await;
        let view = service.get_plan("1", PlanVariant::Full).await.expect("plan");
        assert_eq!(view.joined_count(), Some(0));
        assert!(matches!(view, PlanView::Full(_)));
    }

    #[tokio::test]
    async fn get_plan_reports_missing_and_malformed() {
        let (_store, service) = seeded().await;
        assert!(matches!(
            service.get_plan("9", PlanVariant::Slim).await,
            Err(QueryError::NotFound)
        ));
        assert!(matches!(
            service.get_plan("not valid", PlanVariant::Slim).await,
            Err(QueryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn undecodable_single_entity_is_not_found() {
        let (store, service) = seeded().await;
        store
            .hset(PLAN_SLIM_ENTITIES, "3", Bytes::from_static(&[0x78, 0x9c, 0x01]))
            .await
            .expect("hset");
        assert!(matches!(
            service.get_plan("3", PlanVariant::Slim).await,
            Err(QueryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn listing_skips_corrupt_and_missing_entries() {
        let (store, service) = seeded().await;
        store
            .hset(PLAN_SLIM_ENTITIES, "0", Bytes::from_static(b"\xc1"))
            .await
            .expect("hset");
        store
            .sadd(PLANS, &["0".to_string(), "5".to_string()])
            .await
            .expect("sadd");

        let views = service
            .list_available_plans("u1", PlanVariant::Slim)
            .await
            .expect("list");
        let ids: Vec<&str> = views.iter().map(|v| v.id().as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);

        let all = service.list_all_plans(PlanVariant::Slim).await.expect("all");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn compressed_entries_are_read_transparently() {
        let (store, service) = seeded().await;
        let legacy: PlanSlim = plan("4").slim();
        store
            .hset(
                PLAN_SLIM_ENTITIES,
                "4",
                Bytes::from(codec::encode_compressed(&legacy).expect("encode")),
            )
            .await
            .expect("hset");

        let view = service.get_plan("4", PlanVariant::Slim).await.expect("plan");
        assert_eq!(view.id().as_str(), "4");
    }

    #[tokio::test]
    async fn entries_with_nil_index_flag_are_served() {
        #[derive(serde::Serialize)]
        struct Legacy<'a> {
            id: &'a str,
            title: &'a str,
            image: &'a str,
            thumbnail: &'a str,
            show_in_index: Option<bool>,
            rules: Vec<()>,
            items: Vec<()>,
        }

        let (store, service) = seeded().await;
        let payload = rmp_serde::to_vec_named(&Legacy {
            id: "1",
            title: "Legacy",
            image: "",
            thumbnail: "",
            show_in_index: None,
            rules: Vec::new(),
            items: Vec::new(),
        })
        .expect("encode");
        store
            .hset(PLAN_ENTITIES, "1", Bytes::from(payload))
            .await
            .expect("hset");

        let PlanView::Full(plan) = service.get_plan("1", PlanVariant::Full).await.expect("plan")
        else {
            panic!("expected full projection");
        };
        assert_eq!(plan.title, "Legacy");
        assert!(!plan.show_in_index);
    }

    #[tokio::test]
    async fn set_joined_counts_validates_every_entry() {
        let (_store, service) = seeded().await;
        let err = service
            .set_joined_counts(&[
                ("1".to_string(), 3),
                ("bad id".to_string(), 1),
                ("2".to_string(), -1),
            ])
            .await
            .expect_err("must fail");
        let QueryError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        let names: Vec<&str> = fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(names, vec!["counts[1].id", "counts[2].count"]);

        let view = service.get_plan("1", PlanVariant::Slim).await.expect("plan");
        assert_eq!(view.joined_count(), Some(0));
    }

    #[tokio::test]
    async fn set_joined_counts_writes_all_values() {
        let (_store, service) = seeded().await;
        let written = service
            .set_joined_counts(&[("1".to_string(), 7), ("2".to_string(), 0)])
            .await
            .expect("set");
        assert_eq!(written, 2);

        let all = service.list_all_plans(PlanVariant::Full).await.expect("all");
        let counts: Vec<Option<i64>> = all.iter().map(PlanView::joined_count).collect();
        assert_eq!(counts, vec![Some(7), Some(0)]);
    }
}
