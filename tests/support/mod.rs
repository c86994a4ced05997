#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use plancache::application::context::{AppContext, ContextOptions};
use plancache::application::repos::{ItemRow, PlanGroupRow, PlanRuleRow, PlanSource, RepoError};
use plancache::cache::{CacheStore, MemoryCacheStore};
use plancache::infra::bus::local_channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Plans,
    Items,
    Groups,
}

#[derive(Default)]
struct Catalog {
    rows: Vec<PlanRuleRow>,
    items: HashMap<String, Vec<ItemRow>>,
    groups: Vec<PlanGroupRow>,
    fail: Option<FailAt>,
}

/// In-memory relational source with switchable failures.
#[derive(Default)]
pub struct FixtureSource {
    catalog: Mutex<Catalog>,
}

impl FixtureSource {
    /// Plan `1` with one rule and one item, plan `2` without either, and a
    /// group whose mask covers both.
    pub fn sample() -> Self {
        let source = Self::default();
        source.add_plan(plan_row("1", "Plan One", Some(("r1", "daily", "Daily check-in"))));
        source.add_plan(plan_row("2", "Plan Two", None));
        source.set_items("1", vec![item_row("i1", "Morning run")]);
        source.add_group(group_row("g1", "Starter", 3));
        source
    }

    pub fn add_plan(&self, row: PlanRuleRow) {
        self.lock().rows.push(row);
    }

    pub fn remove_plan(&self, plan_id: &str) {
        let mut catalog = self.lock();
        catalog.rows.retain(|row| row.plan_id != plan_id);
        catalog.items.remove(plan_id);
    }

    pub fn set_title(&self, plan_id: &str, title: &str) {
        for row in self.lock().rows.iter_mut().filter(|row| row.plan_id == plan_id) {
            row.title = Some(title.to_string());
        }
    }

    pub fn set_items(&self, plan_id: &str, items: Vec<ItemRow>) {
        self.lock().items.insert(plan_id.to_string(), items);
    }

    pub fn add_group(&self, row: PlanGroupRow) {
        self.lock().groups.push(row);
    }

    pub fn clear_groups(&self) {
        self.lock().groups.clear();
    }

    pub fn fail_at(&self, stage: Option<FailAt>) {
        self.lock().fail = stage;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Catalog> {
        self.catalog.lock().expect("fixture lock")
    }

    fn check(&self, stage: FailAt) -> Result<(), RepoError> {
        if self.lock().fail == Some(stage) {
            return Err(RepoError::Persistence(format!("injected {stage:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl PlanSource for FixtureSource {
    async fn plans_with_rules(&self) -> Result<Vec<PlanRuleRow>, RepoError> {
        self.check(FailAt::Plans)?;
        let mut rows = self.lock().rows.clone();
        rows.sort_by(|a, b| {
            a.plan_id
                .cmp(&b.plan_id)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        Ok(rows)
    }

    async fn items_for_plan(&self, plan_id: &str) -> Result<Vec<ItemRow>, RepoError> {
        self.check(FailAt::Items)?;
        Ok(self.lock().items.get(plan_id).cloned().unwrap_or_default())
    }

    async fn plan_groups(&self) -> Result<Vec<PlanGroupRow>, RepoError> {
        self.check(FailAt::Groups)?;
        Ok(self.lock().groups.clone())
    }
}

pub fn plan_row(id: &str, title: &str, rule: Option<(&str, &str, &str)>) -> PlanRuleRow {
    let mut row = PlanRuleRow {
        plan_id: id.to_string(),
        title: Some(title.to_string()),
        description: Some(format!("{title} description")),
        image: Some(format!("https://cdn.example.com/{id}.png")),
        thumbnail: None,
        period: Some(7),
        show_in_index: Some(true),
        ..Default::default()
    };
    if let Some((rule_id, name, rule_title)) = rule {
        row.rule_id = Some(rule_id.to_string());
        row.rule_name = Some(name.to_string());
        row.rule_title = Some(rule_title.to_string());
        row.rule_description = None;
    }
    row
}

pub fn item_row(id: &str, title: &str) -> ItemRow {
    ItemRow {
        id: id.to_string(),
        title: Some(title.to_string()),
        description: None,
    }
}

pub fn group_row(id: &str, title: &str, mask: i64) -> PlanGroupRow {
    PlanGroupRow {
        id: id.to_string(),
        title: Some(title.to_string()),
        description: None,
        mask,
    }
}

pub struct Harness {
    pub source: Arc<FixtureSource>,
    pub store: Arc<MemoryCacheStore>,
    pub context: AppContext,
}

/// Full in-process wiring with a running worker.
pub fn spawn_harness(source: FixtureSource) -> Harness {
    let source = Arc::new(source);
    let store = Arc::new(MemoryCacheStore::new());
    let (bus, receiver) = local_channel(4);

    let context = AppContext::build(
        source.clone() as Arc<dyn PlanSource>,
        store.clone() as Arc<dyn CacheStore>,
        Arc::new(bus),
        ContextOptions::default(),
    );
    tokio::spawn(context.worker().run(receiver));

    Harness {
        source,
        store,
        context,
    }
}
