//! Environment secrets plus optional YAML tuning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;
use trailsync_adapters::ExclusionList;
use trailsync_core::FeedKind;
use trailsync_storage::{BackoffPolicy, DEFAULT_PERSIST_BATCH_SIZE, MAX_PERSIST_BATCH_SIZE};

use crate::planner::BoardColumns;

pub const DEFAULT_CONFIG_PATH: &str = "./trailsync.yaml";
pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 3;
pub const DEFAULT_SCHEDULE_CRON: &str = "0 */30 * * * *";
pub const DEFAULT_MONDAY_API_URL: &str = "https://api.monday.com/v2";
pub const DEFAULT_SKYBITZ_BASE: &str = "https://xml.skybitz.com:9443";
pub const DEFAULT_SKYBITZ_VERSION: &str = "2.74";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BoardSettings {
    pub columns: BoardColumns,
}

/// Tuning knobs read from `trailsync.yaml`; every key is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub feed_order: Vec<FeedKind>,
    pub exclusions: ExclusionList,
    pub board: BoardSettings,
    pub batch_size: usize,
    pub dispatch_concurrency: usize,
    pub max_retries: usize,
    pub base_backoff_ms: u64,
    /// Optional ceiling on a single retry delay; unset keeps pure doubling.
    pub max_backoff_ms: Option<u64>,
    pub persist_batch_size: usize,
    pub schedule_cron: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            feed_order: FeedKind::DEFAULT_ORDER.to_vec(),
            exclusions: ExclusionList::default(),
            board: BoardSettings::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            max_retries: backoff.max_retries,
            base_backoff_ms: backoff.base_delay.as_millis() as u64,
            max_backoff_ms: None,
            persist_batch_size: DEFAULT_PERSIST_BATCH_SIZE,
            schedule_cron: DEFAULT_SCHEDULE_CRON.to_string(),
        }
    }
}

impl SyncSettings {
    /// A missing file means defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no tuning file; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let settings: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(self.dispatch_concurrency > 0, "dispatch_concurrency must be positive");
        anyhow::ensure!(self.persist_batch_size > 0, "persist_batch_size must be positive");
        anyhow::ensure!(
            self.persist_batch_size <= MAX_PERSIST_BATCH_SIZE,
            "persist_batch_size must be at most {MAX_PERSIST_BATCH_SIZE}"
        );
        anyhow::ensure!(!self.feed_order.is_empty(), "feed_order must name at least one feed");
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_backoff_ms),
            max_delay: self.max_backoff_ms.map(Duration::from_millis).unwrap_or(Duration::MAX),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkybitzCredentials {
    pub base_url: String,
    pub customer: String,
    pub password: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct SamsaraCredentials {
    pub url: String,
    pub api_token: String,
}

#[derive(Debug, Clone)]
pub struct InsightCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct BoardCredentials {
    pub api_url: String,
    pub api_token: String,
    pub board_id: String,
    pub group_id: String,
}

#[derive(Debug, Clone)]
pub struct TelegramCredentials {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub skybitz: SkybitzCredentials,
    pub samsara: SamsaraCredentials,
    pub insight: InsightCredentials,
    pub board: BoardCredentials,
    pub telegram: Option<TelegramCredentials>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub config_path: PathBuf,
    pub settings: SyncSettings,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var("TRAILSYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let settings = SyncSettings::load(&config_path)?;

        let telegram = match (optional("TELEGRAM_BOT_TOKEN"), optional("TELEGRAM_USER_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramCredentials { bot_token, chat_id }),
            _ => None,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            skybitz: SkybitzCredentials {
                base_url: optional("SKYBITZ_BASE").unwrap_or_else(|| DEFAULT_SKYBITZ_BASE.to_string()),
                customer: required("SKYBITZ_CUSTOMER")?,
                password: required("SKYBITZ_PASSWORD")?,
                version: optional("SKYBITZ_VERSION").unwrap_or_else(|| DEFAULT_SKYBITZ_VERSION.to_string()),
            },
            samsara: SamsaraCredentials {
                url: required("SAMSARA_BASE_URL")?,
                api_token: required("SAMSARA_API_TOKEN")?,
            },
            insight: InsightCredentials {
                username: required("SKYBITZ_USER")?,
                password: required("SKYBITZ_PASS")?,
            },
            board: BoardCredentials {
                api_url: optional("MONDAY_BASE_URL").unwrap_or_else(|| DEFAULT_MONDAY_API_URL.to_string()),
                api_token: required("MONDAY_API_TOKEN")?,
                board_id: required("TRAILER_BOARD_ID")?,
                group_id: required("TRAILER_BOARD_GROUP_ID")?,
            },
            telegram,
            user_agent: optional("TRAILSYNC_USER_AGENT").unwrap_or_else(|| "trailsync/0.1".to_string()),
            http_timeout_secs: optional("TRAILSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            config_path,
            settings,
        })
    }
}

/// Telegram credentials alone, for alerting before the full config is usable.
pub fn telegram_from_env() -> Option<TelegramCredentials> {
    Some(TelegramCredentials {
        bot_token: optional("TELEGRAM_BOT_TOKEN")?,
        chat_id: optional("TELEGRAM_USER_ID")?,
    })
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn required(key: &str) -> Result<String> {
    optional(key).with_context(|| format!("missing required environment variable {key}"))
}
