//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "plancache";
const ENV_PREFIX: &str = "PLANCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_REFRESH_WAIT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;
const DEFAULT_REFRESH_ITEM_FAN_OUT: u32 = 8;
const DEFAULT_REFRESH_CHANNEL_CAPACITY: u32 = 16;
const DEFAULT_REFRESH_LEASE_TTL_SECS: u64 = 300;

/// Command-line arguments for the plancache binary.
#[derive(Debug, Parser)]
#[command(name = "plancache", version, about = "Plan catalog cache service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PLANCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve the HTTP API and run the refresh worker.
    Serve(Box<ServeArgs>),
    /// Run one refresh cycle against the configured stores and exit.
    Refresh(RefreshArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RefreshArgs {
    #[command(flatten)]
    pub overrides: StoreOverrides,
}

/// Overrides shared by every command that touches the source and the cache.
#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the cache backend (memory|redis).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<String>,

    /// Override the Redis connection URL.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the number of concurrent per-plan item queries.
    #[arg(long = "refresh-item-fan-out", value_name = "COUNT")]
    pub refresh_item_fan_out: Option<u32>,

    /// Toggle removal of cached plans that disappeared from the source.
    #[arg(
        long = "refresh-prune-stale",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub refresh_prune_stale: Option<bool>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub stores: StoreOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override how long an admin refresh call waits for the worker.
    #[arg(long = "refresh-wait-timeout-seconds", value_name = "SECONDS")]
    pub refresh_wait_timeout_seconds: Option<u64>,

    /// Override the scheduled refresh period; 0 disables the schedule.
    #[arg(long = "refresh-interval-seconds", value_name = "SECONDS")]
    pub refresh_interval_seconds: Option<u64>,

    /// Override the bearer token required by admin routes.
    #[arg(long = "admin-token", value_name = "TOKEN")]
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub refresh: RefreshSettings,
    pub admin: AdminSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: CacheBackend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis { url: String },
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub wait_timeout: Duration,
    /// `None` disables the scheduled refresh.
    pub interval: Option<Duration>,
    pub item_fan_out: NonZeroU32,
    pub prune_stale: bool,
    pub channel_capacity: NonZeroU32,
    /// Lifetime of the cache write lease taken by each refresh cycle.
    pub lease_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct AdminSettings {
    pub token: Option<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Refresh(args)) => raw.apply_store_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    let settings = Settings::from_raw(raw)?;
    if matches!(cli.command, Some(Command::Refresh(_))) {
        check_refresh_command(&settings)?;
    }
    Ok(settings)
}

/// A one-shot refresh only has an effect on a cache other processes read.
fn check_refresh_command(settings: &Settings) -> Result<(), LoadError> {
    match settings.cache.backend {
        CacheBackend::Memory => Err(LoadError::invalid(
            "cache.backend",
            "the `refresh` command needs a shared cache; an in-memory cache is discarded on exit",
        )),
        CacheBackend::Redis { .. } => Ok(()),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    refresh: RawRefreshSettings,
    admin: RawAdminSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_store_overrides(&overrides.stores);

        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(seconds) = overrides.refresh_wait_timeout_seconds {
            self.refresh.wait_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.refresh_interval_seconds {
            self.refresh.interval_seconds = Some(seconds);
        }
        if let Some(token) = overrides.admin_token.as_ref() {
            self.admin.token = Some(token.clone());
        }
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
        if let Some(fan_out) = overrides.refresh_item_fan_out {
            self.refresh.item_fan_out = Some(fan_out);
        }
        if let Some(prune) = overrides.refresh_prune_stale {
            self.refresh.prune_stale = Some(prune);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            cache,
            refresh,
            admin,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            cache: build_cache_settings(cache)?,
            refresh: build_refresh_settings(refresh)?,
            admin: build_admin_settings(admin),
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backend = cache
        .backend
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "memory".to_string());

    let backend = match backend.as_str() {
        "memory" => CacheBackend::Memory,
        "redis" => {
            let url = non_blank(cache.redis_url).ok_or_else(|| {
                LoadError::invalid("cache.redis_url", "required when cache.backend is `redis`")
            })?;
            CacheBackend::Redis { url }
        }
        other => {
            return Err(LoadError::invalid(
                "cache.backend",
                format!("unknown backend `{other}`; expected `memory` or `redis`"),
            ));
        }
    };

    Ok(CacheSettings { backend })
}

fn build_refresh_settings(refresh: RawRefreshSettings) -> Result<RefreshSettings, LoadError> {
    let wait_secs = refresh
        .wait_timeout_seconds
        .unwrap_or(DEFAULT_REFRESH_WAIT_TIMEOUT_SECS);
    if wait_secs == 0 {
        return Err(LoadError::invalid(
            "refresh.wait_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let interval = match refresh
        .interval_seconds
        .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS)
    {
        0 => None,
        seconds => Some(Duration::from_secs(seconds)),
    };

    let lease_secs = refresh
        .lease_ttl_seconds
        .unwrap_or(DEFAULT_REFRESH_LEASE_TTL_SECS);
    if lease_secs == 0 {
        return Err(LoadError::invalid(
            "refresh.lease_ttl_seconds",
            "must be greater than zero",
        ));
    }

    Ok(RefreshSettings {
        wait_timeout: Duration::from_secs(wait_secs),
        lease_ttl: Duration::from_secs(lease_secs),
        interval,
        item_fan_out: non_zero_u32(
            refresh
                .item_fan_out
                .unwrap_or(DEFAULT_REFRESH_ITEM_FAN_OUT)
                .into(),
            "refresh.item_fan_out",
        )?,
        prune_stale: refresh.prune_stale.unwrap_or(true),
        channel_capacity: non_zero_u32(
            refresh
                .channel_capacity
                .unwrap_or(DEFAULT_REFRESH_CHANNEL_CAPACITY)
                .into(),
            "refresh.channel_capacity",
        )?,
    })
}

fn build_admin_settings(admin: RawAdminSettings) -> AdminSettings {
    AdminSettings {
        token: non_blank(admin.token),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<String>,
    redis_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRefreshSettings {
    wait_timeout_seconds: Option<u64>,
    interval_seconds: Option<u64>,
    item_fan_out: Option<u32>,
    prune_stale: Option<bool>,
    channel_capacity: Option<u32>,
    lease_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAdminSettings {
    token: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
