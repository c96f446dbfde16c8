//! Configuration loading and representation.
//!
//! Everything is read once at startup from environment variables (the binary
//! loads `.env` first). Unset variables take the defaults below; malformed ones
//! are rejected with [`ConfigError::Invalid`] rather than silently defaulted.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;

use assetflow_lifecycle::{
    ConcurrencyGate, MigrationRetryPolicy, MigrationStateMachine, RetrySchedule, ThumbnailRetryPolicy,
    ThumbnailStateMachine, TierCeilings,
};

use crate::orchestrator::OrchestratorConfig;
use crate::reclaimer::ReclaimerConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Admission ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    pub tiers: TierCeilings,
    pub system_ceiling: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        let gate = ConcurrencyGate::default();
        Self {
            tiers: gate.tiers,
            system_ceiling: gate.system_ceiling,
        }
    }
}

impl GateConfig {
    pub fn gate(&self) -> ConcurrencyGate {
        ConcurrencyGate::new(self.tiers, self.system_ceiling)
    }
}

/// Migration retry behaviour and the migration worker's hard timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Exhaust the budget on permanent source errors. Off by default.
    pub short_circuit_permanent: bool,
    pub migration_worker_timeout: StdDuration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            short_circuit_permanent: false,
            migration_worker_timeout: StdDuration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Where worker calls go; `None` turns every dispatch into a
    /// configuration-error diagnostic.
    pub worker_base_url: Option<String>,
    /// Shared bearer token for worker and admin routes. `None` leaves them open.
    pub worker_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    /// Write endpoint, objects land at `{url}/{key}`.
    pub url: Option<String>,
    /// Read base for consumers; defaults to `url`.
    pub public_url: Option<String>,
    pub token: Option<String>,
}

impl ObjectStoreConfig {
    /// Prefix identifying assets that already live in durable storage.
    pub fn durable_base_url(&self) -> String {
        self.public_url
            .clone()
            .or_else(|| self.url.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailConfig {
    pub transform_url: Option<String>,
    pub retry_delays: Vec<StdDuration>,
    pub grace_window: StdDuration,
    pub settle_delay: StdDuration,
    pub worker_timeout: StdDuration,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        let policy = ThumbnailRetryPolicy::default();
        Self {
            transform_url: None,
            retry_delays: policy.schedule.offsets().to_vec(),
            grace_window: policy.grace_window,
            settle_delay: policy.settle_delay,
            worker_timeout: StdDuration::from_secs(150),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_url: Option<String>,
    pub use_persistent_stores: bool,
    pub gate: GateConfig,
    pub retry: RetryConfig,
    pub reclaimer: ReclaimerConfig,
    pub dispatch: DispatchConfig,
    pub object_store: ObjectStoreConfig,
    pub thumbnail: ThumbnailConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            use_persistent_stores: false,
            gate: GateConfig::default(),
            retry: RetryConfig::default(),
            reclaimer: ReclaimerConfig::default(),
            dispatch: DispatchConfig::default(),
            object_store: ObjectStoreConfig::default(),
            thumbnail: ThumbnailConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, or a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = AppConfig::default();

        let tiers = TierCeilings {
            free: env.parse("TIER_CEILING_FREE", defaults.gate.tiers.free)?,
            basic: env.parse("TIER_CEILING_BASIC", defaults.gate.tiers.basic)?,
            pro: env.parse("TIER_CEILING_PRO", defaults.gate.tiers.pro)?,
            premium: env.parse("TIER_CEILING_PREMIUM", defaults.gate.tiers.premium)?,
        };

        Ok(Self {
            bind_addr: env.string("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: env.string("DATABASE_URL"),
            use_persistent_stores: env.flag("USE_PERSISTENT_STORES", false)?,
            gate: GateConfig {
                tiers,
                system_ceiling: env.parse("SYSTEM_CEILING", defaults.gate.system_ceiling)?,
            },
            retry: RetryConfig {
                short_circuit_permanent: env.flag(
                    "MIGRATION_SHORT_CIRCUIT_PERMANENT",
                    defaults.retry.short_circuit_permanent,
                )?,
                migration_worker_timeout: env.secs(
                    "MIGRATION_WORKER_TIMEOUT_SECS",
                    defaults.retry.migration_worker_timeout,
                )?,
            },
            reclaimer: ReclaimerConfig {
                interval: env.secs("RECLAIM_INTERVAL_SECS", defaults.reclaimer.interval)?,
                migration_timeout: chrono_secs(env.secs(
                    "MIGRATION_TIMEOUT_SECS",
                    StdDuration::from_secs(defaults.reclaimer.migration_timeout.num_seconds() as u64),
                )?),
                thumbnail_timeout: chrono_secs(env.secs(
                    "THUMBNAIL_TIMEOUT_SECS",
                    StdDuration::from_secs(defaults.reclaimer.thumbnail_timeout.num_seconds() as u64),
                )?),
                batch_size: env.parse("RECLAIM_BATCH_SIZE", defaults.reclaimer.batch_size)?,
            },
            dispatch: DispatchConfig {
                worker_base_url: env.string("WORKER_BASE_URL"),
                worker_token: env.string("WORKER_TOKEN"),
            },
            object_store: ObjectStoreConfig {
                url: env.string("OBJECT_STORE_URL"),
                public_url: env.string("OBJECT_STORE_PUBLIC_URL"),
                token: env.string("OBJECT_STORE_TOKEN"),
            },
            thumbnail: ThumbnailConfig {
                transform_url: env.string("TRANSFORM_URL"),
                retry_delays: env.secs_list(
                    "THUMBNAIL_RETRY_DELAYS_SECS",
                    defaults.thumbnail.retry_delays,
                )?,
                grace_window: env.secs("THUMBNAIL_GRACE_SECS", defaults.thumbnail.grace_window)?,
                settle_delay: env.secs("THUMBNAIL_SETTLE_SECS", defaults.thumbnail.settle_delay)?,
                worker_timeout: env.secs(
                    "THUMBNAIL_WORKER_TIMEOUT_SECS",
                    defaults.thumbnail.worker_timeout,
                )?,
            },
        })
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        let migration = MigrationStateMachine::new(MigrationRetryPolicy {
            short_circuit_permanent: self.retry.short_circuit_permanent,
            ..MigrationRetryPolicy::default()
        });
        let thumbnail = ThumbnailStateMachine::new(ThumbnailRetryPolicy {
            grace_window: self.thumbnail.grace_window,
            settle_delay: self.thumbnail.settle_delay,
            schedule: RetrySchedule::new(self.thumbnail.retry_delays.clone()),
            ..ThumbnailRetryPolicy::default()
        });
        OrchestratorConfig {
            gate: self.gate.gate(),
            migration,
            thumbnail,
            durable_base_url: self.object_store.durable_base_url(),
            ..OrchestratorConfig::default()
        }
    }
}

fn chrono_secs(d: StdDuration) -> Duration {
    Duration::seconds(d.as_secs() as i64)
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
        }
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid { key, value }),
            },
        }
    }

    fn secs(&self, key: &'static str, default: StdDuration) -> Result<StdDuration, ConfigError> {
        self.parse(key, default.as_secs()).map(StdDuration::from_secs)
    }

    /// Comma-separated seconds, e.g. `0,30,120`.
    fn secs_list(
        &self,
        key: &'static str,
        default: Vec<StdDuration>,
    ) -> Result<Vec<StdDuration>, ConfigError> {
        let Some(value) = self.string(key) else {
            return Ok(default);
        };
        value
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .map(StdDuration::from_secs)
                    .map_err(|_| ConfigError::Invalid {
                        key,
                        value: value.clone(),
                    })
            })
            .collect()
    }
}
