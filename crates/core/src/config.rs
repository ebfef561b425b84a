use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheDirectives, StaleTolerance};
use crate::ingestion::cold_storage::ColdStorageSettings;
use crate::ingestion::RunnerSettings;
use crate::retry::RetryPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub ingestion: IngestionConfig,
    pub cold_storage: ColdStorageConfig,
    pub kafka: KafkaConfig,
    pub routing: RoutingConfig,
    pub actions: ActionsConfig,
    pub signing: SigningConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct IngestionConfig {
    pub item_topic: String,
    pub consumer_group: String,
    pub partition_concurrency: usize,
    pub heartbeat_interval_secs: u64,
    pub batch_max_retries: u32,
    pub batch_retry_base_delay_ms: u64,
    pub max_batch_messages: usize,
}

#[derive(Clone, Debug)]
pub struct ColdStorageConfig {
    pub topic: String,
    pub consumer_group: String,
    pub batch_size: usize,
    pub partition_concurrency: usize,
    pub output_dir: PathBuf,
    pub path_prefix: String,
    pub compression_level: i32,
}

#[derive(Clone, Debug)]
pub struct KafkaConfig {
    pub brokers: String,
    pub session_timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct RoutingConfig {
    pub fresh_until_secs: u64,
    /// Serve-stale windows: without revalidation, while revalidating, if the store is down.
    pub max_stale_secs: [u64; 3],
}

#[derive(Clone, Debug)]
pub struct ActionsConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub webhook_timeout_secs: u64,
    pub signature_header: String,
}

#[derive(Clone, Debug)]
pub struct SigningConfig {
    /// Per-org webhook keys are derived from this. Empty means webhooks go out unsigned.
    pub master_key: SecretString,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub item_topic: Option<String>,
    pub cold_storage_output_dir: Option<PathBuf>,
    pub health_check_port: Option<u16>,
    pub signing_master_key: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["triage.toml", "config/triage.toml"];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://triage.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            ingestion: IngestionConfig {
                item_topic: "ITEM_SUBMISSION_EVENTS".to_string(),
                consumer_group: "item-submission-worker".to_string(),
                partition_concurrency: 30,
                heartbeat_interval_secs: 5,
                batch_max_retries: 5,
                batch_retry_base_delay_ms: 500,
                max_batch_messages: 500,
            },
            cold_storage: ColdStorageConfig {
                topic: "DATA_WAREHOUSE_INGEST_EVENTS".to_string(),
                consumer_group: "cold-storage-ingest-worker".to_string(),
                batch_size: 30_000,
                partition_concurrency: 4,
                output_dir: PathBuf::from("data/cold-storage"),
                path_prefix: "api/INGESTED_JSON".to_string(),
                compression_level: 6,
            },
            kafka: KafkaConfig {
                brokers: "localhost:9092".to_string(),
                session_timeout_ms: 30_000,
            },
            routing: RoutingConfig { fresh_until_secs: 15, max_stale_secs: [0, 2, 2] },
            actions: ActionsConfig {
                max_attempts: 5,
                initial_backoff_ms: 5,
                max_backoff_ms: 500,
                webhook_timeout_secs: 10,
                signature_header: "x-triage-signature".to_string(),
            },
            signing: SigningConfig { master_key: String::new().into() },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl IngestionConfig {
    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings::new(
            self.partition_concurrency,
            Duration::from_secs(self.heartbeat_interval_secs),
            self.batch_max_retries,
            Duration::from_millis(self.batch_retry_base_delay_ms),
        )
    }
}

impl ColdStorageConfig {
    /// Heartbeat and batch retry behaviour are shared with the item consumer.
    pub fn runner_settings(&self, ingestion: &IngestionConfig) -> RunnerSettings {
        RunnerSettings::new(
            self.partition_concurrency,
            Duration::from_secs(ingestion.heartbeat_interval_secs),
            ingestion.batch_max_retries,
            Duration::from_millis(ingestion.batch_retry_base_delay_ms),
        )
    }

    pub fn batcher_settings(&self) -> ColdStorageSettings {
        ColdStorageSettings {
            batch_size: self.batch_size,
            path_prefix: self.path_prefix.clone(),
            compression_level: self.compression_level,
        }
    }
}

impl RoutingConfig {
    pub fn cache_directives(&self) -> CacheDirectives {
        CacheDirectives {
            fresh_until: Duration::from_secs(self.fresh_until_secs),
            max_stale: StaleTolerance::from_secs(self.max_stale_secs),
        }
    }
}

impl ActionsConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis(self.max_attempts, self.initial_backoff_ms, self.max_backoff_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

/// One effective setting, rendered for operators. Secrets are never rendered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: &'static str,
    pub env_key: String,
    pub value: String,
}

/// `database.max_connections` is overridden by `TRIAGE_DATABASE_MAX_CONNECTIONS`.
pub fn env_key_for(key: &str) -> String {
    format!("TRIAGE_{}", key.replace('.', "_").to_ascii_uppercase())
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATHS[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Every setting in file order, with secrets redacted.
    pub fn entries(&self) -> Vec<ConfigEntry> {
        let master_key =
            if self.signing.master_key.expose_secret().is_empty() { "<unset>" } else { "<redacted>" };
        let [without, revalidating, unreachable] = self.routing.max_stale_secs;

        let values: Vec<(&'static str, String)> = vec![
            ("database.url", self.database.url.clone()),
            ("database.max_connections", self.database.max_connections.to_string()),
            ("database.timeout_secs", self.database.timeout_secs.to_string()),
            ("ingestion.item_topic", self.ingestion.item_topic.clone()),
            ("ingestion.consumer_group", self.ingestion.consumer_group.clone()),
            ("ingestion.partition_concurrency", self.ingestion.partition_concurrency.to_string()),
            (
                "ingestion.heartbeat_interval_secs",
                self.ingestion.heartbeat_interval_secs.to_string(),
            ),
            ("ingestion.batch_max_retries", self.ingestion.batch_max_retries.to_string()),
            (
                "ingestion.batch_retry_base_delay_ms",
                self.ingestion.batch_retry_base_delay_ms.to_string(),
            ),
            ("ingestion.max_batch_messages", self.ingestion.max_batch_messages.to_string()),
            ("cold_storage.topic", self.cold_storage.topic.clone()),
            ("cold_storage.consumer_group", self.cold_storage.consumer_group.clone()),
            ("cold_storage.batch_size", self.cold_storage.batch_size.to_string()),
            (
                "cold_storage.partition_concurrency",
                self.cold_storage.partition_concurrency.to_string(),
            ),
            ("cold_storage.output_dir", self.cold_storage.output_dir.display().to_string()),
            ("cold_storage.path_prefix", self.cold_storage.path_prefix.clone()),
            ("cold_storage.compression_level", self.cold_storage.compression_level.to_string()),
            ("kafka.brokers", self.kafka.brokers.clone()),
            ("kafka.session_timeout_ms", self.kafka.session_timeout_ms.to_string()),
            ("routing.fresh_until_secs", self.routing.fresh_until_secs.to_string()),
            ("routing.max_stale_secs", format!("{without},{revalidating},{unreachable}")),
            ("actions.max_attempts", self.actions.max_attempts.to_string()),
            ("actions.initial_backoff_ms", self.actions.initial_backoff_ms.to_string()),
            ("actions.max_backoff_ms", self.actions.max_backoff_ms.to_string()),
            ("actions.webhook_timeout_secs", self.actions.webhook_timeout_secs.to_string()),
            ("actions.signature_header", self.actions.signature_header.clone()),
            ("signing.master_key", master_key.to_string()),
            ("server.bind_address", self.server.bind_address.clone()),
            ("server.health_check_port", self.server.health_check_port.to_string()),
            ("server.graceful_shutdown_secs", self.server.graceful_shutdown_secs.to_string()),
            ("logging.level", self.logging.level.clone()),
            ("logging.format", self.logging.format.as_str().to_string()),
        ];

        values
            .into_iter()
            .map(|(key, value)| ConfigEntry { key, env_key: env_key_for(key), value })
            .collect()
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(ingestion) = patch.ingestion {
            if let Some(item_topic) = ingestion.item_topic {
                self.ingestion.item_topic = item_topic;
            }
            if let Some(consumer_group) = ingestion.consumer_group {
                self.ingestion.consumer_group = consumer_group;
            }
            if let Some(partition_concurrency) = ingestion.partition_concurrency {
                self.ingestion.partition_concurrency = partition_concurrency;
            }
            if let Some(heartbeat_interval_secs) = ingestion.heartbeat_interval_secs {
                self.ingestion.heartbeat_interval_secs = heartbeat_interval_secs;
            }
            if let Some(batch_max_retries) = ingestion.batch_max_retries {
                self.ingestion.batch_max_retries = batch_max_retries;
            }
            if let Some(delay) = ingestion.batch_retry_base_delay_ms {
                self.ingestion.batch_retry_base_delay_ms = delay;
            }
            if let Some(max_batch_messages) = ingestion.max_batch_messages {
                self.ingestion.max_batch_messages = max_batch_messages;
            }
        }

        if let Some(cold_storage) = patch.cold_storage {
            if let Some(topic) = cold_storage.topic {
                self.cold_storage.topic = topic;
            }
            if let Some(consumer_group) = cold_storage.consumer_group {
                self.cold_storage.consumer_group = consumer_group;
            }
            if let Some(batch_size) = cold_storage.batch_size {
                self.cold_storage.batch_size = batch_size;
            }
            if let Some(partition_concurrency) = cold_storage.partition_concurrency {
                self.cold_storage.partition_concurrency = partition_concurrency;
            }
            if let Some(output_dir) = cold_storage.output_dir {
                self.cold_storage.output_dir = output_dir;
            }
            if let Some(path_prefix) = cold_storage.path_prefix {
                self.cold_storage.path_prefix = path_prefix;
            }
            if let Some(compression_level) = cold_storage.compression_level {
                self.cold_storage.compression_level = compression_level;
            }
        }

        if let Some(kafka) = patch.kafka {
            if let Some(brokers) = kafka.brokers {
                self.kafka.brokers = brokers;
            }
            if let Some(session_timeout_ms) = kafka.session_timeout_ms {
                self.kafka.session_timeout_ms = session_timeout_ms;
            }
        }

        if let Some(routing) = patch.routing {
            if let Some(fresh_until_secs) = routing.fresh_until_secs {
                self.routing.fresh_until_secs = fresh_until_secs;
            }
            if let Some(max_stale_secs) = routing.max_stale_secs {
                self.routing.max_stale_secs = max_stale_secs;
            }
        }

        if let Some(actions) = patch.actions {
            if let Some(max_attempts) = actions.max_attempts {
                self.actions.max_attempts = max_attempts;
            }
            if let Some(initial_backoff_ms) = actions.initial_backoff_ms {
                self.actions.initial_backoff_ms = initial_backoff_ms;
            }
            if let Some(max_backoff_ms) = actions.max_backoff_ms {
                self.actions.max_backoff_ms = max_backoff_ms;
            }
            if let Some(webhook_timeout_secs) = actions.webhook_timeout_secs {
                self.actions.webhook_timeout_secs = webhook_timeout_secs;
            }
            if let Some(signature_header) = actions.signature_header {
                self.actions.signature_header = signature_header;
            }
        }

        if let Some(signing) = patch.signing {
            if let Some(master_key) = signing.master_key {
                self.signing.master_key = secret_value(master_key);
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TRIAGE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TRIAGE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("TRIAGE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TRIAGE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TRIAGE_INGESTION_ITEM_TOPIC") {
            self.ingestion.item_topic = value;
        }
        if let Some(value) = read_env("TRIAGE_INGESTION_CONSUMER_GROUP") {
            self.ingestion.consumer_group = value;
        }
        if let Some(value) = read_env("TRIAGE_INGESTION_PARTITION_CONCURRENCY") {
            self.ingestion.partition_concurrency =
                parse_usize("TRIAGE_INGESTION_PARTITION_CONCURRENCY", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_INGESTION_HEARTBEAT_INTERVAL_SECS") {
            self.ingestion.heartbeat_interval_secs =
                parse_u64("TRIAGE_INGESTION_HEARTBEAT_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_INGESTION_BATCH_MAX_RETRIES") {
            self.ingestion.batch_max_retries =
                parse_u32("TRIAGE_INGESTION_BATCH_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_INGESTION_BATCH_RETRY_BASE_DELAY_MS") {
            self.ingestion.batch_retry_base_delay_ms =
                parse_u64("TRIAGE_INGESTION_BATCH_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_INGESTION_MAX_BATCH_MESSAGES") {
            self.ingestion.max_batch_messages =
                parse_usize("TRIAGE_INGESTION_MAX_BATCH_MESSAGES", &value)?;
        }

        if let Some(value) = read_env("TRIAGE_COLD_STORAGE_TOPIC") {
            self.cold_storage.topic = value;
        }
        if let Some(value) = read_env("TRIAGE_COLD_STORAGE_CONSUMER_GROUP") {
            self.cold_storage.consumer_group = value;
        }
        if let Some(value) = read_env("TRIAGE_COLD_STORAGE_BATCH_SIZE") {
            self.cold_storage.batch_size = parse_usize("TRIAGE_COLD_STORAGE_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_COLD_STORAGE_PARTITION_CONCURRENCY") {
            self.cold_storage.partition_concurrency =
                parse_usize("TRIAGE_COLD_STORAGE_PARTITION_CONCURRENCY", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_COLD_STORAGE_OUTPUT_DIR") {
            self.cold_storage.output_dir = PathBuf::from(value);
        }
        if let Some(value) = read_env("TRIAGE_COLD_STORAGE_PATH_PREFIX") {
            self.cold_storage.path_prefix = value;
        }
        if let Some(value) = read_env("TRIAGE_COLD_STORAGE_COMPRESSION_LEVEL") {
            self.cold_storage.compression_level =
                parse_i32("TRIAGE_COLD_STORAGE_COMPRESSION_LEVEL", &value)?;
        }

        if let Some(value) = read_env("TRIAGE_KAFKA_BROKERS") {
            self.kafka.brokers = value;
        }
        if let Some(value) = read_env("TRIAGE_KAFKA_SESSION_TIMEOUT_MS") {
            self.kafka.session_timeout_ms = parse_u64("TRIAGE_KAFKA_SESSION_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("TRIAGE_ROUTING_FRESH_UNTIL_SECS") {
            self.routing.fresh_until_secs = parse_u64("TRIAGE_ROUTING_FRESH_UNTIL_SECS", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_ROUTING_MAX_STALE_SECS") {
            self.routing.max_stale_secs = parse_windows("TRIAGE_ROUTING_MAX_STALE_SECS", &value)?;
        }

        if let Some(value) = read_env("TRIAGE_ACTIONS_MAX_ATTEMPTS") {
            self.actions.max_attempts = parse_u32("TRIAGE_ACTIONS_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_ACTIONS_INITIAL_BACKOFF_MS") {
            self.actions.initial_backoff_ms =
                parse_u64("TRIAGE_ACTIONS_INITIAL_BACKOFF_MS", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_ACTIONS_MAX_BACKOFF_MS") {
            self.actions.max_backoff_ms = parse_u64("TRIAGE_ACTIONS_MAX_BACKOFF_MS", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_ACTIONS_WEBHOOK_TIMEOUT_SECS") {
            self.actions.webhook_timeout_secs =
                parse_u64("TRIAGE_ACTIONS_WEBHOOK_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_ACTIONS_SIGNATURE_HEADER") {
            self.actions.signature_header = value;
        }

        if let Some(value) = read_env("TRIAGE_SIGNING_MASTER_KEY") {
            self.signing.master_key = secret_value(value);
        }

        if let Some(value) = read_env("TRIAGE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("TRIAGE_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port = parse_u16("TRIAGE_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("TRIAGE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("TRIAGE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("TRIAGE_LOGGING_LEVEL").or_else(|| read_env("TRIAGE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TRIAGE_LOGGING_FORMAT").or_else(|| read_env("TRIAGE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(item_topic) = overrides.item_topic {
            self.ingestion.item_topic = item_topic;
        }
        if let Some(output_dir) = overrides.cold_storage_output_dir {
            self.cold_storage.output_dir = output_dir;
        }
        if let Some(port) = overrides.health_check_port {
            self.server.health_check_port = port;
        }
        if let Some(master_key) = overrides.signing_master_key {
            self.signing.master_key = secret_value(master_key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_ingestion(&self.ingestion)?;
        validate_cold_storage(&self.cold_storage)?;
        validate_kafka(&self.kafka)?;
        validate_routing(&self.routing)?;
        validate_actions(&self.actions)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from).find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_ingestion(ingestion: &IngestionConfig) -> Result<(), ConfigError> {
    if ingestion.item_topic.trim().is_empty() || ingestion.consumer_group.trim().is_empty() {
        return Err(ConfigError::Validation(
            "ingestion.item_topic and ingestion.consumer_group are required".to_string(),
        ));
    }
    if ingestion.partition_concurrency == 0 {
        return Err(ConfigError::Validation(
            "ingestion.partition_concurrency must be greater than zero".to_string(),
        ));
    }
    if ingestion.heartbeat_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "ingestion.heartbeat_interval_secs must be greater than zero".to_string(),
        ));
    }
    if ingestion.max_batch_messages == 0 {
        return Err(ConfigError::Validation(
            "ingestion.max_batch_messages must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_cold_storage(cold_storage: &ColdStorageConfig) -> Result<(), ConfigError> {
    if cold_storage.topic.trim().is_empty() || cold_storage.consumer_group.trim().is_empty() {
        return Err(ConfigError::Validation(
            "cold_storage.topic and cold_storage.consumer_group are required".to_string(),
        ));
    }
    if cold_storage.batch_size == 0 {
        return Err(ConfigError::Validation(
            "cold_storage.batch_size must be greater than zero".to_string(),
        ));
    }
    if cold_storage.partition_concurrency == 0 {
        return Err(ConfigError::Validation(
            "cold_storage.partition_concurrency must be greater than zero".to_string(),
        ));
    }
    if !(1..=22).contains(&cold_storage.compression_level) {
        return Err(ConfigError::Validation(
            "cold_storage.compression_level must be in range 1..=22".to_string(),
        ));
    }
    let prefix = cold_storage.path_prefix.trim();
    if prefix.is_empty() || prefix.starts_with('/') || prefix.split('/').any(|part| part == "..") {
        return Err(ConfigError::Validation(
            "cold_storage.path_prefix must be a relative path without `..` segments".to_string(),
        ));
    }
    Ok(())
}

fn validate_kafka(kafka: &KafkaConfig) -> Result<(), ConfigError> {
    if kafka.brokers.trim().is_empty() {
        return Err(ConfigError::Validation("kafka.brokers is required".to_string()));
    }
    if kafka.session_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "kafka.session_timeout_ms must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_routing(routing: &RoutingConfig) -> Result<(), ConfigError> {
    let [without, revalidating, unreachable] = routing.max_stale_secs;
    if without > revalidating || revalidating > unreachable {
        return Err(ConfigError::Validation(
            "routing.max_stale_secs windows must be non-decreasing".to_string(),
        ));
    }
    Ok(())
}

fn validate_actions(actions: &ActionsConfig) -> Result<(), ConfigError> {
    if actions.max_attempts == 0 {
        return Err(ConfigError::Validation(
            "actions.max_attempts must be greater than zero".to_string(),
        ));
    }
    if actions.initial_backoff_ms > actions.max_backoff_ms {
        return Err(ConfigError::Validation(
            "actions.initial_backoff_ms must not exceed actions.max_backoff_ms".to_string(),
        ));
    }
    if actions.webhook_timeout_secs == 0 || actions.webhook_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "actions.webhook_timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    let header = actions.signature_header.as_str();
    let valid_header = !header.is_empty()
        && header.bytes().all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_');
    if !valid_header {
        return Err(ConfigError::Validation(
            "actions.signature_header must be a non-empty HTTP header name".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_i32(key: &str, value: &str) -> Result<i32, ConfigError> {
    value.trim().parse::<i32>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| invalid_override(key, value))
}

/// Accepts `0,2,2`.
fn parse_windows(key: &str, value: &str) -> Result<[u64; 3], ConfigError> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid_override(key, value))?;
    match parts.as_slice() {
        [first, second, third] => Ok([*first, *second, *third]),
        _ => Err(invalid_override(key, value)),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    ingestion: Option<IngestionPatch>,
    cold_storage: Option<ColdStoragePatch>,
    kafka: Option<KafkaPatch>,
    routing: Option<RoutingPatch>,
    actions: Option<ActionsPatch>,
    signing: Option<SigningPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct IngestionPatch {
    item_topic: Option<String>,
    consumer_group: Option<String>,
    partition_concurrency: Option<usize>,
    heartbeat_interval_secs: Option<u64>,
    batch_max_retries: Option<u32>,
    batch_retry_base_delay_ms: Option<u64>,
    max_batch_messages: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ColdStoragePatch {
    topic: Option<String>,
    consumer_group: Option<String>,
    batch_size: Option<usize>,
    partition_concurrency: Option<usize>,
    output_dir: Option<PathBuf>,
    path_prefix: Option<String>,
    compression_level: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct KafkaPatch {
    brokers: Option<String>,
    session_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RoutingPatch {
    fresh_until_secs: Option<u64>,
    max_stale_secs: Option<[u64; 3]>,
}

#[derive(Debug, Default, Deserialize)]
struct ActionsPatch {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    webhook_timeout_secs: Option<u64>,
    signature_header: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SigningPatch {
    master_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{env_key_for, AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_load_without_a_file() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.ingestion.consumer_group == "item-submission-worker", "item group")?;
        ensure(config.cold_storage.consumer_group == "cold-storage-ingest-worker", "cold group")?;
        ensure(config.cold_storage.batch_size == 30_000, "cold storage batch size")?;
        ensure(config.routing.max_stale_secs == [0, 2, 2], "stale windows")?;
        ensure(config.actions.signature_header == "x-triage-signature", "signature header")?;
        ensure(config.signing.master_key.expose_secret().is_empty(), "no signing key by default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_TRIAGE_MASTER_KEY", "master-from-env");
        env::set_var("TEST_TRIAGE_TOPIC", "ITEMS_FROM_ENV");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("triage.toml");
            fs::write(
                &path,
                r#"
[ingestion]
item_topic = "${TEST_TRIAGE_TOPIC}"

[signing]
master_key = "${TEST_TRIAGE_MASTER_KEY}"

[routing]
max_stale_secs = [1, 5, 30]
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.signing.master_key.expose_secret() == "master-from-env",
                "master key should be interpolated from the environment",
            )?;
            ensure(config.ingestion.item_topic == "ITEMS_FROM_ENV", "topic should be interpolated")?;
            ensure(config.routing.max_stale_secs == [1, 5, 30], "windows should come from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_TRIAGE_MASTER_KEY", "TEST_TRIAGE_TOPIC"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("triage.toml");
        fs::write(&path, "[signing]\nmaster_key = \"${TEST_TRIAGE_NEVER_SET}\"\n")
            .map_err(|err| err.to_string())?;

        match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() }) {
            Err(ConfigError::MissingEnvInterpolation { var }) => {
                ensure(var == "TEST_TRIAGE_NEVER_SET", "error should name the variable")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("expected interpolation failure".to_string()),
        }
    }

    #[test]
    fn required_file_must_exist() -> Result<(), String> {
        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("absent.toml");

        let result = AppConfig::load(LoadOptions {
            config_path: Some(path),
            require_file: true,
            ..LoadOptions::default()
        });
        ensure(
            matches!(result, Err(ConfigError::MissingConfigFile(_))),
            "a required but absent file should fail",
        )
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TRIAGE_LOG_LEVEL", "warn");
        env::set_var("TRIAGE_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["TRIAGE_LOG_LEVEL", "TRIAGE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TRIAGE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("TRIAGE_INGESTION_PARTITION_CONCURRENCY", "12");
        env::set_var("TRIAGE_ROUTING_MAX_STALE_SECS", "0, 4, 60");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("triage.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[ingestion]
partition_concurrency = 8
batch_max_retries = 2

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.ingestion.partition_concurrency == 12,
                "env concurrency should win over file",
            )?;
            ensure(config.ingestion.batch_max_retries == 2, "file value should beat default")?;
            ensure(config.routing.max_stale_secs == [0, 4, 60], "env windows should parse")?;
            Ok(())
        })();

        clear_vars(&[
            "TRIAGE_DATABASE_URL",
            "TRIAGE_INGESTION_PARTITION_CONCURRENCY",
            "TRIAGE_ROUTING_MAX_STALE_SECS",
        ]);
        result
    }

    #[test]
    fn malformed_env_override_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TRIAGE_ROUTING_MAX_STALE_SECS", "0,2");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "TRIAGE_ROUTING_MAX_STALE_SECS", "error should name the env key")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("two stale windows should not parse".to_string()),
        };

        clear_vars(&["TRIAGE_ROUTING_MAX_STALE_SECS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TRIAGE_COLD_STORAGE_COMPRESSION_LEVEL", "40");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("cold_storage.compression_level")
            );
            ensure(has_message, "validation failure should mention the compression level")
        })();

        clear_vars(&["TRIAGE_COLD_STORAGE_COMPRESSION_LEVEL"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug_or_entries() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TRIAGE_SIGNING_MASTER_KEY", "master-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");
            let rendered = format!("{:?}", config.entries());

            ensure(!debug.contains("master-secret-value"), "debug output should hide the key")?;
            ensure(!rendered.contains("master-secret-value"), "entries should hide the key")?;
            ensure(rendered.contains("<redacted>"), "entries should mark the key as redacted")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["TRIAGE_SIGNING_MASTER_KEY"]);
        result
    }

    #[test]
    fn sections_convert_into_runtime_settings() -> Result<(), String> {
        let config = AppConfig::default();

        let runner = config.ingestion.runner_settings();
        ensure(runner.partition_concurrency == 30, "runner concurrency")?;
        ensure(runner.heartbeat_interval == Duration::from_secs(5), "heartbeat interval")?;
        ensure(runner.batch_retry.max_attempts == 6, "five retries means six attempts")?;

        let cold = config.cold_storage.runner_settings(&config.ingestion);
        ensure(cold.partition_concurrency == 4, "cold storage concurrency")?;

        let directives = config.routing.cache_directives();
        ensure(directives.fresh_until == Duration::from_secs(15), "fresh window")?;
        ensure(
            directives.max_stale.if_unreachable == Duration::from_secs(2),
            "unreachable window",
        )?;

        let retry = config.actions.retry_policy();
        ensure(retry.max_attempts == 5, "action attempts")?;
        ensure(retry.max_delay == Duration::from_millis(500), "action backoff cap")?;

        ensure(env_key_for("cold_storage.batch_size") == "TRIAGE_COLD_STORAGE_BATCH_SIZE", "env")
    }
}
