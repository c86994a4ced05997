//! Postgres-backed plan source.

mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    query_as,
};

use crate::application::repos::{ItemRow, PlanGroupRow, PlanRuleRow, PlanSource, RepoError};

const PLANS_WITH_RULES_SQL: &str = "SELECT \
        p.id::text AS plan_id, p.title, p.description, p.image, p.thumbnail, \
        p.period, p.show_in_index, \
        pr.id::text AS rule_id, pr.name AS rule_name, pr.title AS rule_title, \
        pr.description AS rule_description \
    FROM plans AS p \
    LEFT JOIN plan_rules AS pr ON pr.pid = p.id \
    ORDER BY p.id, pr.id";

const ITEMS_FOR_PLAN_SQL: &str = "SELECT id::text AS id, title, description \
    FROM plan_items WHERE pid::text = $1 ORDER BY id";

const PLAN_GROUPS_SQL: &str = "SELECT id::text AS id, title, description, mask \
    FROM plan_groups ORDER BY id";

#[derive(Clone)]
pub struct PostgresPlanSource {
    pool: Arc<PgPool>,
}

impl PostgresPlanSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }
}

#[derive(sqlx::FromRow)]
struct PlanRuleDbRow {
    plan_id: String,
    title: Option<String>,
    description: Option<String>,
    image: Option<String>,
    thumbnail: Option<String>,
    period: Option<i32>,
    show_in_index: Option<bool>,
    rule_id: Option<String>,
    rule_name: Option<String>,
    rule_title: Option<String>,
    rule_description: Option<String>,
}

impl From<PlanRuleDbRow> for PlanRuleRow {
    fn from(row: PlanRuleDbRow) -> Self {
        Self {
            plan_id: row.plan_id,
            title: row.title,
            description: row.description,
            image: row.image,
            thumbnail: row.thumbnail,
            period: row.period,
            show_in_index: row.show_in_index,
            rule_id: row.rule_id,
            rule_name: row.rule_name,
            rule_title: row.rule_title,
            rule_description: row.rule_description,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ItemDbRow {
    id: String,
    title: Option<String>,
    description: Option<String>,
}

impl From<ItemDbRow> for ItemRow {
    fn from(row: ItemDbRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            description: row.description,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PlanGroupDbRow {
    id: String,
    title: Option<String>,
    description: Option<String>,
    mask: i64,
}

impl From<PlanGroupDbRow> for PlanGroupRow {
    fn from(row: PlanGroupDbRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            description: row.description,
            mask: row.mask,
        }
    }
}

#[async_trait]
impl PlanSource for PostgresPlanSource {
    async fn plans_with_rules(&self) -> Result<Vec<PlanRuleRow>, RepoError> {
        let rows = query_as::<_, PlanRuleDbRow>(PLANS_WITH_RULES_SQL)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(PlanRuleRow::from).collect())
    }

    async fn items_for_plan(&self, plan_id: &str) -> Result<Vec<ItemRow>, RepoError> {
        let rows = query_as::<_, ItemDbRow>(ITEMS_FOR_PLAN_SQL)
            .bind(plan_id)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(ItemRow::from).collect())
    }

    async fn plan_groups(&self) -> Result<Vec<PlanGroupRow>, RepoError> {
        let rows = query_as::<_, PlanGroupDbRow>(PLAN_GROUPS_SQL)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(PlanGroupRow::from).collect())
    }
}
