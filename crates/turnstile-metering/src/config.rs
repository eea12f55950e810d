use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use turnstile_common::ConfigurationError;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeteringConfig {
    pub service: ServiceConfig,
    pub log: EventLogConfig,
    pub batch: BatchConfig,
    pub store: StoreConfig,
    pub aggregation: AggregationConfig,
    pub materializer: MaterializerConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub environment: String,
    pub log_level: String,
    pub service_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    /// Parallel consumers; partitions are balanced across them by the log.
    pub consumers: u16,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush when the open batch reaches this count. Range [1, 10_000].
    pub max_size: usize,
    /// Flush when the oldest message in the open batch is older than this.
    pub max_interval_ms: u64,
    pub malformed_policy: MalformedPolicy,
}

/// What happens to a message that fails decoding or validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Write the payload to the dead-letter table; the offset advances.
    DeadLetter,
    /// Keep a zero-quantity processed row so the event shows up in counts.
    ZeroQuantity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Per bulk-insert deadline.
    pub write_timeout_ms: u64,
    pub query_deadline_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub source: ReadSource,
}

/// Which reader the aggregation query uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    /// No final deduplication; faster.
    Live,
    /// Forces the final merge so replacing-merge duplicates resolve to one
    /// row. Used when billing an invoice.
    InvoiceCreation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializerConfig {
    /// Look-back window for each materialization pass.
    pub window_ms: u64,
    /// Delay between passes.
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Raw events older than this are purged; 0 keeps them forever.
    pub raw_event_days: u32,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "turnstile-metering".to_string(),
                environment: "development".to_string(),
                log_level: "info".to_string(),
                service_id: Uuid::new_v4().to_string(),
            },
            log: EventLogConfig {
                brokers: "localhost:9092".to_string(),
                topic: "usage-events".to_string(),
                group_id: "turnstile-metering".to_string(),
                consumers: 1,
                auto_offset_reset: "earliest".to_string(),
                session_timeout_ms: 30_000,
            },
            batch: BatchConfig {
                max_size: 250,
                max_interval_ms: 5_000,
                malformed_policy: MalformedPolicy::DeadLetter,
            },
            store: StoreConfig {
                url: "http://localhost:8123".to_string(),
                database: "turnstile".to_string(),
                user: "default".to_string(),
                password: String::new(),
                write_timeout_ms: 10_000,
                query_deadline_ms: 30_000,
            },
            aggregation: AggregationConfig {
                source: ReadSource::Live,
            },
            materializer: MaterializerConfig {
                window_ms: 300_000,
                interval_ms: 60_000,
            },
            retention: RetentionConfig { raw_event_days: 0 },
        }
    }
}

impl MeteringConfig {
    pub fn load(path_override: Option<PathBuf>) -> Result<MeteringConfig, ConfigurationError> {
        let default_config = MeteringConfig::default();

        let mut figment = Figment::from(Serialized::defaults(default_config));

        if let Some(path) = path_override {
            if path.exists() {
                figment = figment.merge(Toml::file(&path));
            }
        } else {
            let default_path = PathBuf::from("metering.toml");
            if default_path.exists() {
                figment = figment.merge(Toml::file(default_path));
            }
        }

        figment = figment.merge(Env::prefixed("TURNSTILE_").split("__"));

        let config: MeteringConfig =
            figment
                .extract()
                .map_err(|e| ConfigurationError::ParseError {
                    details: e.to_string(),
                })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<MeteringConfig, ConfigurationError> {
        Self::load(Some(path.to_path_buf()))
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(1..=10_000).contains(&self.batch.max_size) {
            return Err(ConfigurationError::InvalidValue {
                key: "batch.max_size".to_string(),
                value: self.batch.max_size.to_string(),
                reason: "must be within [1, 10000]".to_string(),
            });
        }

        if self.batch.max_interval_ms == 0 {
            return Err(ConfigurationError::ValidationFailed {
                details: "batch.max_interval_ms must be non-zero".to_string(),
            });
        }

        if self.store.url.is_empty() {
            return Err(ConfigurationError::ValidationFailed {
                details: "store.url must not be empty".to_string(),
            });
        }

        if self.log.brokers.is_empty() || self.log.topic.is_empty() {
            return Err(ConfigurationError::ValidationFailed {
                details: "log.brokers and log.topic must not be empty".to_string(),
            });
        }

        if self.log.consumers == 0 {
            return Err(ConfigurationError::ValidationFailed {
                details: "log.consumers must be at least 1".to_string(),
            });
        }

        if self.materializer.window_ms == 0 || self.materializer.interval_ms == 0 {
            return Err(ConfigurationError::ValidationFailed {
                details: "materializer.window_ms and interval_ms must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.store.password.is_empty() && self.service.environment == "production" {
            warnings.push("Store password is empty in production environment".to_string());
        }

        if self.retention.raw_event_days == 0 {
            warnings.push("Raw event retention is unbounded (retention.raw_event_days=0)".to_string());
        }

        warnings
    }

    pub fn batch_max_interval(&self) -> Duration {
        Duration::from_millis(self.batch.max_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.store.write_timeout_ms)
    }

    pub fn query_deadline(&self) -> Duration {
        Duration::from_millis(self.store.query_deadline_ms)
    }

    pub fn materializer_window(&self) -> Duration {
        Duration::from_millis(self.materializer.window_ms)
    }

    pub fn materializer_interval(&self) -> Duration {
        Duration::from_millis(self.materializer.interval_ms)
    }
}
