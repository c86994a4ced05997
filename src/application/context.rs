use std::{sync::Arc, time::Duration};

use crate::{
    application::{
        commands::CommandBus,
        coordinator::RefreshCoordinator,
        mailbox::RefreshMailbox,
        plans::PlanQueryService,
        refresh::{RefreshOptions, RefreshPipeline},
        repos::PlanSource,
        worker::RefreshWorker,
    },
    cache::CacheStore,
};

pub const DEFAULT_REFRESH_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct ContextOptions {
    pub refresh: RefreshOptions,
    /// How long a caller waits for a published refresh to report back.
    pub wait_timeout: Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            refresh: RefreshOptions::default(),
            wait_timeout: DEFAULT_REFRESH_WAIT_TIMEOUT,
        }
    }
}

/// Everything the HTTP layer, the worker and the CLI share. Built once at
/// startup and passed down explicitly.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn CacheStore>,
    pub pipeline: Arc<RefreshPipeline>,
    pub coordinator: Arc<RefreshCoordinator>,
    pub plans: Arc<PlanQueryService>,
    pub mailbox: RefreshMailbox,
}

impl AppContext {
    pub fn build(
        source: Arc<dyn PlanSource>,
        store: Arc<dyn CacheStore>,
        bus: Arc<dyn CommandBus>,
        options: ContextOptions,
    ) -> Self {
        let mailbox = RefreshMailbox::new();
        let pipeline = Arc::new(RefreshPipeline::new(
            source,
            Arc::clone(&store),
            options.refresh,
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(
            bus,
            mailbox.clone(),
            options.wait_timeout,
        ));
        let plans = Arc::new(PlanQueryService::new(Arc::clone(&store)));

        Self {
            store,
            pipeline,
            coordinator,
            plans,
            mailbox,
        }
    }

    /// Worker that answers the commands published by this context's coordinator.
    pub fn worker(&self) -> RefreshWorker {
        RefreshWorker::new(Arc::clone(&self.pipeline), self.mailbox.clone())
    }
}
