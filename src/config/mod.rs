use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{AppError, AppResult};

pub mod defaults;
pub mod duration_serde;

use defaults::*;

/// Top-level configuration passed explicitly to every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    /// Providers in registry order; this order drives header emission.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Channel cache snapshot path
    #[serde(default = "default_channel_file")]
    pub channel_file: PathBuf,
    /// Write the document to this file instead of stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml_file: Option<PathBuf>,
    /// Write the document to this unix domain socket instead of stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml_sock: Option<PathBuf>,
    /// Fetch providers concurrently
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Worker pool size for parallel mode (defaults to available parallelism)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Number of days of programs to fetch, starting today
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
    /// Template for XMLTV channel ids
    #[serde(default = "default_id_format")]
    pub id_format: String,
    #[serde(default = "default_add_rebroadcast_to_title")]
    pub add_rebroadcast_to_title: bool,
    #[serde(default = "default_add_epnum_to_title")]
    pub add_epnum_to_title: bool,
    #[serde(default = "default_add_description")]
    pub add_description: bool,
    #[serde(default = "default_add_xmltv_ns")]
    pub add_xmltv_ns: bool,
    /// `lang` attribute for text elements; empty disables it
    #[serde(default = "default_lang")]
    pub lang: String,
    /// Cached channel lists younger than this skip discovery
    #[serde(
        default = "default_channel_cache_max_age",
        with = "duration_serde::duration"
    )]
    pub channel_cache_max_age: Duration,
    /// Per-provider deadline for the program fetch phase; unset means none
    #[serde(
        default,
        with = "duration_serde::option_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub fetch_timeout: Option<Duration>,
    /// Timeout for individual upstream HTTP requests
    #[serde(default = "default_http_timeout", with = "duration_serde::duration")]
    pub http_timeout: Duration,
}

/// One `[[providers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider identifier, also the channel cache key (upper-cased)
    pub name: String,
    /// Registry tag of the implementation; defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub my_channels: MyChannels,
    /// Overrides `settings.fetch_limit` for this provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_limit: Option<u32>,
    /// Implementation specific options handed to the provider factory
    #[serde(default)]
    pub options: toml::Table,
}

/// Requested channels for a provider.
///
/// Accepts `"*"`, a comma separated list of service ids, or an array mixing
/// plain ids and override tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MyChannels {
    Text(String),
    List(Vec<ChannelSelector>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelSelector {
    Id(String),
    Detailed(SelectorOverride),
}

/// Explicit selector that can override discovered channel values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectorOverride {
    #[serde(rename = "ServiceId")]
    pub service_id: String,
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "No", default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(rename = "Icon_url", default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Resolved form of [`MyChannels`]
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSelection {
    All,
    Only(Vec<SelectorOverride>),
}

impl Default for MyChannels {
    fn default() -> Self {
        MyChannels::Text(String::new())
    }
}

impl MyChannels {
    pub fn resolve(&self) -> ChannelSelection {
        match self {
            MyChannels::Text(text) if text.trim() == "*" => ChannelSelection::All,
            MyChannels::Text(text) => ChannelSelection::Only(
                text.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(|id| SelectorOverride {
                        service_id: id.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            MyChannels::List(entries) => {
                if entries
                    .iter()
                    .any(|e| matches!(e, ChannelSelector::Id(id) if id.trim() == "*"))
                {
                    return ChannelSelection::All;
                }
                ChannelSelection::Only(
                    entries
                        .iter()
                        .map(|entry| match entry {
                            ChannelSelector::Id(id) => SelectorOverride {
                                service_id: id.trim().to_string(),
                                ..Default::default()
                            },
                            ChannelSelector::Detailed(detailed) => detailed.clone(),
                        })
                        .filter(|s| !s.service_id.is_empty())
                        .collect(),
                )
            }
        }
    }
}

impl ProviderConfig {
    /// Minimal enabled provider config
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            kind: None,
            enabled: true,
            my_channels: MyChannels::default(),
            fetch_limit: None,
            options: toml::Table::new(),
        }
    }

    /// Registry tag used to look up the factory
    pub fn kind(&self) -> String {
        self.kind.as_deref().unwrap_or(&self.name).to_uppercase()
    }

    /// Channel cache key
    pub fn cache_key(&self) -> String {
        self.name.to_uppercase()
    }

    pub fn effective_fetch_limit(&self, settings: &Settings) -> u32 {
        self.fetch_limit.unwrap_or(settings.fetch_limit)
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }
}

fn default_channel_file() -> PathBuf {
    PathBuf::from(DEFAULT_CHANNEL_FILE)
}

fn default_parallel() -> bool {
    DEFAULT_PARALLEL
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_fetch_limit() -> u32 {
    DEFAULT_FETCH_LIMIT
}

fn default_id_format() -> String {
    DEFAULT_ID_FORMAT.to_string()
}

fn default_add_rebroadcast_to_title() -> bool {
    DEFAULT_ADD_REBROADCAST_TO_TITLE
}

fn default_add_epnum_to_title() -> bool {
    DEFAULT_ADD_EPNUM_TO_TITLE
}

fn default_add_description() -> bool {
    DEFAULT_ADD_DESCRIPTION
}

fn default_add_xmltv_ns() -> bool {
    DEFAULT_ADD_XMLTV_NS
}

fn default_lang() -> String {
    DEFAULT_LANG.to_string()
}

fn default_channel_cache_max_age() -> Duration {
    humantime::parse_duration(DEFAULT_CHANNEL_CACHE_MAX_AGE)
        .unwrap_or(Duration::from_secs(4 * 24 * 3600))
}

fn default_http_timeout() -> Duration {
    humantime::parse_duration(DEFAULT_HTTP_TIMEOUT).unwrap_or(Duration::from_secs(30))
}

fn default_enabled() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channel_file: default_channel_file(),
            xml_file: None,
            xml_sock: None,
            parallel: default_parallel(),
            max_workers: None,
            log_level: default_log_level(),
            log_file: None,
            fetch_limit: default_fetch_limit(),
            id_format: default_id_format(),
            add_rebroadcast_to_title: default_add_rebroadcast_to_title(),
            add_epnum_to_title: default_add_epnum_to_title(),
            add_description: default_add_description(),
            add_xmltv_ns: default_add_xmltv_ns(),
            lang: default_lang(),
            channel_cache_max_age: default_channel_cache_max_age(),
            fetch_timeout: None,
            http_timeout: default_http_timeout(),
        }
    }
}

impl Config {
    /// Load configuration, writing a default file on first run.
    pub fn load_from_file<P: AsRef<Path>>(config_file: P) -> AppResult<Self> {
        let config_file = config_file.as_ref();
        let config = if config_file.exists() {
            let contents = std::fs::read_to_string(config_file).map_err(|e| {
                AppError::configuration(format!(
                    "Failed to read {}: {e}",
                    config_file.display()
                ))
            })?;
            Self::from_toml(&contents)?
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config).map_err(|e| {
                AppError::configuration(format!("Failed to serialize default config: {e}"))
            })?;
            std::fs::write(config_file, contents).map_err(|e| {
                AppError::configuration(format!(
                    "Failed to write default config {}: {e}",
                    config_file.display()
                ))
            })?;
            default_config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> AppResult<Self> {
        toml::from_str(contents).map_err(|e| AppError::configuration(e.to_string()))
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.settings.xml_file.is_some() && self.settings.xml_sock.is_some() {
            return Err(AppError::configuration(
                "xml_file and xml_sock are mutually exclusive",
            ));
        }
        if self.settings.max_workers == Some(0) {
            return Err(AppError::configuration("max_workers must be at least 1"));
        }
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.cache_key()) {
                return Err(AppError::configuration(format!(
                    "Duplicate provider name: {}",
                    provider.name
                )));
            }
        }
        Ok(())
    }
}
