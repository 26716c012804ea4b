use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use grantscout_core::SourceConfig;
use grantscout_storage::{HttpClientConfig, DEFAULT_USER_AGENT};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::scheduler::ScheduleConfig;
use crate::PipelineError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.sources.is_empty() {
            return Err(PipelineError::Config("no sources configured".into()));
        }
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if source.source_id.trim().is_empty() {
                return Err(PipelineError::Config("source with empty source_id".into()));
            }
            if !seen.insert(source.source_id.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate source_id {}",
                    source.source_id
                )));
            }
            match Url::parse(&source.base_url) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                _ => {
                    return Err(PipelineError::Config(format!(
                        "source {} has invalid base_url {:?}",
                        source.source_id, source.base_url
                    )))
                }
            }
            if !source.rate_limit_seconds.is_finite() || source.rate_limit_seconds < 0.0 {
                return Err(PipelineError::Config(format!(
                    "source {} has invalid rate_limit_seconds {}",
                    source.source_id, source.rate_limit_seconds
                )));
            }
        }
        Ok(())
    }

    pub fn active(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.is_active)
    }

    /// True when `url` sits under a source's base URL or beside one of its seed URLs.
    pub fn is_approved_url(&self, url: &str) -> bool {
        let Ok(url) = Url::parse(url) else {
            return false;
        };
        self.sources.iter().any(|source| {
            is_under(&url, &source.base_url)
                || source.scrape_urls.iter().any(|seed| {
                    let parent = seed.rsplit_once('/').map_or(seed.as_str(), |(p, _)| p);
                    is_under(&url, parent)
                })
        })
    }
}

fn is_under(url: &Url, prefix: &str) -> bool {
    let Ok(prefix) = Url::parse(prefix) else {
        return false;
    };
    url.scheme() == prefix.scheme()
        && url.host_str() == prefix.host_str()
        && url.port_or_known_default() == prefix.port_or_known_default()
        && url.path().starts_with(prefix.path().trim_end_matches('/'))
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub default_delay_secs: u64,
    pub schedule: ScheduleConfig,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| -> u64 {
            lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        let defaults = ScheduleConfig::default();
        let schedule = ScheduleConfig {
            interval_days: number("GRANTSCOUT_INTERVAL_DAYS", u64::from(defaults.interval_days)) as u32,
            run_hour: number("GRANTSCOUT_RUN_HOUR", u64::from(defaults.run_hour)).min(23) as u32,
            run_minute: number("GRANTSCOUT_RUN_MINUTE", u64::from(defaults.run_minute)).min(59) as u32,
            max_workers: number("GRANTSCOUT_MAX_WORKERS", defaults.max_workers as u64).max(1) as usize,
            source_timeout: Duration::from_secs(number(
                "GRANTSCOUT_SOURCE_TIMEOUT_SECS",
                defaults.source_timeout.as_secs(),
            )),
            total_timeout: Duration::from_secs(number(
                "GRANTSCOUT_TOTAL_TIMEOUT_SECS",
                defaults.total_timeout.as_secs(),
            )),
            ..defaults
        };

        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            sources_path: lookup("GRANTSCOUT_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            user_agent: lookup("GRANTSCOUT_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: number("GRANTSCOUT_HTTP_TIMEOUT_SECS", 30),
            default_delay_secs: number("GRANTSCOUT_DEFAULT_DELAY_SECS", 2),
            schedule,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            default_delay: Duration::from_secs(self.default_delay_secs),
            ..Default::default()
        }
    }
}
