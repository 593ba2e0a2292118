use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::cache::default_namespace_ttls;
use crate::domain::SourceName;
use crate::error::IngestError;
use crate::http::{BreakerPolicy, HttpSettings, RetryPolicy};
use crate::processor::ProcessorConfig;
use crate::scoring::ScoringSettings;

pub const DEFAULT_CONFIG_FILE: &str = "genevidence.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub processor: ProcessorSection,
    #[serde(default)]
    pub scoring: ScoringSection,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HttpSection {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_secs: Option<u64>,
    #[serde(default)]
    pub retry_statuses: Option<Vec<u16>>,
    #[serde(default)]
    pub breaker_threshold: Option<u32>,
    #[serde(default)]
    pub breaker_window_secs: Option<u64>,
    #[serde(default)]
    pub breaker_cooldown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CacheSection {
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub tier1_capacity: Option<usize>,
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,
    /// Per-namespace overrides, in seconds.
    #[serde(default)]
    pub ttl_secs: BTreeMap<String, u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ProcessorSection {
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub max_buffer_bytes: Option<usize>,
    #[serde(default)]
    pub memory_ceiling_bytes: Option<u64>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub duplicate_run_threshold: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ScoringSection {
    #[serde(default)]
    pub min_recompute_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Shorthand(String),
    Detailed(SourceEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceEntryObject {
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub query: Option<Vec<String>>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

/// One enabled source with its query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub name: SourceName,
    pub base_url: Option<String>,
    pub query: Vec<String>,
    pub page_size: Option<u32>,
}

impl SourceSettings {
    pub fn with_defaults(name: SourceName) -> Self {
        let query = default_query(&name);
        Self {
            name,
            base_url: None,
            query,
            page_size: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: Option<Utf8PathBuf>,
    pub tier1_capacity: usize,
    pub default_ttl: Duration,
    pub namespace_ttls: BTreeMap<String, Duration>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub data_dir: Option<Utf8PathBuf>,
    pub http: HttpSettings,
    pub cache: CacheConfig,
    pub processor: ProcessorConfig,
    pub scoring: ScoringSettings,
    pub sources: Vec<SourceSettings>,
}

impl ResolvedConfig {
    pub fn source(&self, name: &SourceName) -> Result<&SourceSettings, IngestError> {
        self.sources
            .iter()
            .find(|source| &source.name == name)
            .ok_or_else(|| IngestError::UnknownSource(name.to_string()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(IngestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| IngestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    /// Like [`ConfigLoader::resolve`], but a missing default file yields the
    /// built-in configuration.
    pub fn resolve_or_default(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
        match Self::resolve(path) {
            Err(IngestError::MissingConfig) => Self::resolve_config(Config::default()),
            other => other,
        }
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, IngestError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let http_defaults = HttpSettings::default();
        let retry_defaults = RetryPolicy::default();
        let breaker_defaults = BreakerPolicy::default();
        let http = HttpSettings {
            timeout: config
                .http
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(http_defaults.timeout),
            user_agent: config.http.user_agent.unwrap_or(http_defaults.user_agent),
            retry: RetryPolicy {
                max_attempts: config
                    .http
                    .max_attempts
                    .unwrap_or(retry_defaults.max_attempts)
                    .max(1),
                base_delay: config
                    .http
                    .base_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry_defaults.base_delay),
                max_delay: config
                    .http
                    .max_delay_secs
                    .map(Duration::from_secs)
                    .unwrap_or(retry_defaults.max_delay),
                retry_statuses: config
                    .http
                    .retry_statuses
                    .unwrap_or(retry_defaults.retry_statuses),
            },
            breaker: BreakerPolicy {
                failure_threshold: config
                    .http
                    .breaker_threshold
                    .unwrap_or(breaker_defaults.failure_threshold)
                    .max(1),
                window: config
                    .http
                    .breaker_window_secs
                    .map(Duration::from_secs)
                    .unwrap_or(breaker_defaults.window),
                cooldown: config
                    .http
                    .breaker_cooldown_secs
                    .map(Duration::from_secs)
                    .unwrap_or(breaker_defaults.cooldown),
            },
        };

        let mut namespace_ttls = default_namespace_ttls();
        for (namespace, secs) in config.cache.ttl_secs {
            namespace_ttls.insert(namespace, Duration::from_secs(secs));
        }
        let cache = CacheConfig {
            root: config.cache.root.map(Utf8PathBuf::from),
            tier1_capacity: config.cache.tier1_capacity.unwrap_or(10_000).max(1),
            default_ttl: Duration::from_secs(config.cache.default_ttl_secs.unwrap_or(3600)),
            namespace_ttls,
        };

        let processor_defaults = ProcessorConfig::default();
        let processor = ProcessorConfig {
            chunk_size: config
                .processor
                .chunk_size
                .unwrap_or(processor_defaults.chunk_size)
                .max(1),
            max_buffer_bytes: config
                .processor
                .max_buffer_bytes
                .unwrap_or(processor_defaults.max_buffer_bytes),
            memory_ceiling_bytes: config
                .processor
                .memory_ceiling_bytes
                .or(processor_defaults.memory_ceiling_bytes),
            max_pages: config.processor.max_pages.or(processor_defaults.max_pages),
            duplicate_run_threshold: config
                .processor
                .duplicate_run_threshold
                .unwrap_or(processor_defaults.duplicate_run_threshold)
                .max(1),
        };

        let scoring = ScoringSettings {
            min_interval: config
                .scoring
                .min_recompute_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(ScoringSettings::default().min_interval),
        };

        let sources = if config.sources.is_empty() {
            default_sources()
        } else {
            config
                .sources
                .into_iter()
                .map(|entry| match entry {
                    SourceEntry::Shorthand(value) => Ok(SourceSettings::with_defaults(value.parse()?)),
                    SourceEntry::Detailed(obj) => {
                        let name: SourceName = obj.name.parse()?;
                        Ok(SourceSettings {
                            query: obj.query.unwrap_or_else(|| default_query(&name)),
                            name,
                            base_url: obj.base_url,
                            page_size: obj.page_size,
                        })
                    }
                })
                .collect::<Result<Vec<_>, IngestError>>()?
        };
        for source in &sources {
            if matches!(source.name, SourceName::Other(_)) && source.base_url.is_none() {
                return Err(IngestError::ConfigParse(format!(
                    "source {} needs a base_url",
                    source.name
                )));
            }
        }

        Ok(ResolvedConfig {
            schema_version,
            data_dir: config.data_dir.map(Utf8PathBuf::from),
            http,
            cache,
            processor,
            scoring,
            sources,
        })
    }
}

pub fn default_sources() -> Vec<SourceSettings> {
    [
        SourceName::PubTator,
        SourceName::Hpo,
        SourceName::PanelApp,
        SourceName::StringPpi,
    ]
    .into_iter()
    .map(SourceSettings::with_defaults)
    .collect()
}

pub fn default_query(name: &SourceName) -> Vec<String> {
    match name {
        SourceName::PubTator => vec!["@DISEASE_Kidney_Diseases".to_string()],
        SourceName::Hpo => vec!["HP:0010935".to_string()],
        SourceName::PanelApp => vec![
            "kidney".to_string(),
            "renal".to_string(),
            "nephro".to_string(),
        ],
        SourceName::StringPpi | SourceName::Other(_) => Vec::new(),
    }
}
