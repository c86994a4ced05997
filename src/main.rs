use std::{future::IntoFuture, process, sync::Arc};

use plancache::{
    application::{
        commands::CommandBus,
        context::{AppContext, ContextOptions},
        error::AppError,
        refresh::{RefreshOptions, RefreshPipeline},
        repos::PlanSource,
        worker::{run_schedule, trigger_refresh},
    },
    cache::{CacheStore, MemoryCacheStore, RedisCacheStore},
    config::{self, CacheBackend},
    infra::{
        bus::local_channel,
        db::PostgresPlanSource,
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};
use time::format_description::well_known::Rfc3339;
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Refresh(_) => run_refresh(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let source = init_source(&settings).await?;
    let store = init_store(&settings).await?;

    let (bus, receiver) = local_channel(settings.refresh.channel_capacity.get() as usize);
    let bus: Arc<dyn CommandBus> = Arc::new(bus);
    let context = AppContext::build(
        source,
        store,
        bus,
        ContextOptions {
            refresh: refresh_options(&settings),
            wait_timeout: settings.refresh.wait_timeout,
        },
    );

    let worker_handle = tokio::spawn(context.worker().run(receiver));

    let warmup_coordinator = Arc::clone(&context.coordinator);
    let warmup_handle = tokio::spawn(async move {
        trigger_refresh(&warmup_coordinator, "startup").await;
    });

    let schedule_handle = settings.refresh.interval.map(|period| {
        info!(
            target = "plancache::worker",
            period_secs = period.as_secs(),
            "scheduled refresh enabled"
        );
        tokio::spawn(run_schedule(Arc::clone(&context.coordinator), period))
    });

    let http_state = HttpState::new(&context, settings.admin.token.clone());
    if http_state.admin_token.is_none() {
        warn!(
            target = "plancache::http",
            "admin token is not configured; admin routes will refuse every call"
        );
    }

    let result = serve_http(&settings, http_state).await;

    if let Some(handle) = schedule_handle {
        handle.abort();
        let _ = handle.await;
    }
    warmup_handle.abort();
    let _ = warmup_handle.await;
    worker_handle.abort();
    let _ = worker_handle.await;

    result
}

async fn run_refresh(settings: config::Settings) -> Result<(), AppError> {
    let source = init_source(&settings).await?;
    let store = init_store(&settings).await?;
    let pipeline = RefreshPipeline::new(source, store, refresh_options(&settings));

    let report = pipeline.refresh().await?;
    let completed_at = report
        .completed_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| report.completed_at.unix_timestamp().to_string());

    println!(
        "refreshed {} plans ({} rules, {} items), {} groups, pruned {} in {} ms at {}",
        report.plans,
        report.rules,
        report.items,
        report.groups,
        report.pruned,
        report.elapsed.as_millis(),
        completed_at
    );
    Ok(())
}

fn refresh_options(settings: &config::Settings) -> RefreshOptions {
    RefreshOptions {
        item_fan_out: settings.refresh.item_fan_out.get() as usize,
        prune_stale: settings.refresh.prune_stale,
        lease_ttl: settings.refresh.lease_ttl,
    }
}

async fn init_source(settings: &config::Settings) -> Result<Arc<dyn PlanSource>, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PostgresPlanSource::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresPlanSource::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(Arc::new(PostgresPlanSource::new(pool)))
}

async fn init_store(settings: &config::Settings) -> Result<Arc<dyn CacheStore>, AppError> {
    match &settings.cache.backend {
        CacheBackend::Memory => {
            info!(target = "plancache::cache", "using in-memory cache store");
            Ok(Arc::new(MemoryCacheStore::new()))
        }
        CacheBackend::Redis { url } => {
            let store = RedisCacheStore::connect(url)
                .await
                .map_err(|err| AppError::from(InfraError::cache(err.to_string())))?;
            info!(target = "plancache::cache", "connected to redis cache store");
            Ok(Arc::new(store))
        }
    }
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "plancache::http",
        addr = %settings.server.addr,
        "listening"
    );

    let grace = settings.server.graceful_shutdown;
    let signalled = Arc::new(Notify::new());
    let notifier = Arc::clone(&signalled);
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            notifier.notify_one();
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            return result.map_err(|err| AppError::unexpected(format!("server error: {err}")));
        }
        _ = signalled.notified() => {}
    }

    match tokio::time::timeout(grace, &mut server).await {
        Ok(result) => result.map_err(|err| AppError::unexpected(format!("server error: {err}"))),
        Err(_) => {
            warn!(
                target = "plancache::http",
                grace_secs = grace.as_secs(),
                "graceful shutdown did not finish in time"
            );
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(target = "plancache::http", "shutdown signal received");
}
