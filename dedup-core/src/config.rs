use std::env;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::Result;
use crate::forwarder::ForwarderConfig;
use crate::primary::PrimaryStoreConfig;
use crate::retention::GenerationSchedule;
use crate::shared::humantime_serde;
use crate::witness::backoff::RetryBackoff;
use crate::witness::{OverflowPolicy, WitnessConfig};

/// Path to a JSON settings file.
pub const ENV_CONFIG_PATH: &str = "DEDUP_CONFIG_PATH";
/// Base64 encoded JSON settings, used when [ENV_CONFIG_PATH] is not set.
pub const ENV_CONFIG: &str = "DEDUP_CONFIG";

const DEFAULT_RETENTION_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_KEY_PREFIX: &str = "dedup";

/// Where the secondary store lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SecondaryBackend {
    /// In the node's own memory. Single process deployments and tests only, it does not survive
    /// the node.
    #[default]
    Memory,
    #[serde(rename_all = "camelCase")]
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    #[serde(with = "humantime_serde")]
    pub retention_window: Duration,
    #[serde(with = "humantime_serde")]
    pub generation_overlap_margin: Duration,
    pub witness_retry_backoff: RetryBackoff,
    pub witness_dead_letter_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub clock_skew_tolerance: Duration,

    /// Business fields the dedup key is built from, in order.
    pub key_fields: Vec<String>,
    pub partition: String,
    #[serde(with = "humantime_serde")]
    pub primary_timeout: Duration,
    /// Defaults to a quarter of the retention window.
    #[serde(with = "humantime_serde::option")]
    pub primary_bucket_length: Option<Duration>,
    pub changelog_dir: PathBuf,
    /// fsync every changelog append.
    pub changelog_sync: bool,
    pub secondary: SecondaryBackend,
    pub secondary_generations: u32,
    #[serde(with = "humantime_serde")]
    pub secondary_timeout: Duration,
    pub witness_queue_capacity: usize,
    pub witness_overflow_policy: OverflowPolicy,
    #[serde(with = "humantime_serde")]
    pub witness_redrive_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub witness_propagation_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub retention_check_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retention_window: DEFAULT_RETENTION_WINDOW,
            generation_overlap_margin: Duration::from_secs(5 * 60),
            witness_retry_backoff: RetryBackoff::default(),
            witness_dead_letter_threshold: 5,
            clock_skew_tolerance: Duration::from_secs(30),
            key_fields: vec!["id".to_string()],
            partition: "0".to_string(),
            primary_timeout: Duration::from_secs(1),
            primary_bucket_length: None,
            changelog_dir: PathBuf::from("./changelog"),
            changelog_sync: true,
            secondary: SecondaryBackend::Memory,
            secondary_generations: 3,
            secondary_timeout: Duration::from_millis(500),
            witness_queue_capacity: 10_000,
            witness_overflow_policy: OverflowPolicy::Buffer,
            witness_redrive_interval: Duration::from_secs(30),
            witness_propagation_delay: Duration::from_secs(1),
            retention_check_interval: Duration::from_secs(60),
        }
    }
}

impl Settings {
    /// Loads settings from the file in `DEDUP_CONFIG_PATH`, else from the base64 JSON in
    /// `DEDUP_CONFIG`, else defaults. The result is validated.
    pub fn load() -> Result<Self> {
        Self::load_from(env::var(ENV_CONFIG_PATH).ok(), env::var(ENV_CONFIG).ok())
    }

    fn load_from(path: Option<String>, encoded: Option<String>) -> Result<Self> {
        let settings = if let Some(path) = path {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("reading {path}: {e}")))?;
            Self::from_json(&raw)?
        } else if let Some(encoded) = encoded {
            let decoded = BASE64_STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| Error::Config(format!("decoding {ENV_CONFIG}: {e}")))?;
            let raw = String::from_utf8(decoded)
                .map_err(|e| Error::Config(format!("decoding {ENV_CONFIG}: {e}")))?;
            Self::from_json(&raw)?
        } else {
            Self::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(format!("parsing settings: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_fields.is_empty() {
            return Err(Error::Config("keyFields must not be empty".to_string()));
        }
        // covers the window, generation count and overlap margin checks
        self.schedule()?;

        let jitter = self.witness_retry_backoff.jitter;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(Error::Config(format!(
                "witnessRetryBackoff.jitter must be within [0, 1], got {jitter}"
            )));
        }
        if self.witness_retry_backoff.factor < 1.0 {
            return Err(Error::Config(format!(
                "witnessRetryBackoff.factor must be at least 1, got {}",
                self.witness_retry_backoff.factor
            )));
        }
        if self.witness_dead_letter_threshold == 0 {
            return Err(Error::Config(
                "witnessDeadLetterThreshold must be at least 1".to_string(),
            ));
        }
        if self.witness_overflow_policy == OverflowPolicy::DropWithAlert
            && self.witness_queue_capacity == 0
        {
            return Err(Error::Config(
                "witnessQueueCapacity must be positive with the dropWithAlert policy".to_string(),
            ));
        }
        if self.bucket_length().is_zero() {
            return Err(Error::Config("primaryBucketLength must be positive".to_string()));
        }
        for (name, value) in [
            ("primaryTimeout", self.primary_timeout),
            ("secondaryTimeout", self.secondary_timeout),
            ("witnessRedriveInterval", self.witness_redrive_interval),
            ("retentionCheckInterval", self.retention_check_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if let SecondaryBackend::Redis { url, .. } = &self.secondary
            && url.is_empty()
        {
            return Err(Error::Config("secondary.url must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn bucket_length(&self) -> Duration {
        self.primary_bucket_length
            .unwrap_or(self.retention_window / 4)
    }

    pub fn schedule(&self) -> Result<GenerationSchedule> {
        GenerationSchedule::new(
            self.retention_window,
            self.secondary_generations,
            self.generation_overlap_margin,
        )
    }

    pub fn primary_config(&self) -> PrimaryStoreConfig {
        PrimaryStoreConfig {
            changelog_dir: self.changelog_dir.clone(),
            partition: self.partition.clone(),
            retention_window: self.retention_window,
            bucket_length: self.bucket_length(),
            changelog_sync: self.changelog_sync,
        }
    }

    pub fn witness_config(&self) -> WitnessConfig {
        WitnessConfig {
            retry: self.witness_retry_backoff,
            dead_letter_threshold: self.witness_dead_letter_threshold,
            queue_capacity: self.witness_queue_capacity,
            overflow_policy: self.witness_overflow_policy,
            redrive_interval: self.witness_redrive_interval,
        }
    }

    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            retention_window: self.retention_window,
            clock_skew_tolerance: self.clock_skew_tolerance,
            primary_timeout: self.primary_timeout,
            propagation_delay: self.witness_propagation_delay,
        }
    }
}
