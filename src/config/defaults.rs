//! Configuration default values
//!
//! This module contains all the default values for configuration options,
//! making them easily changeable in one central location.

// File defaults
pub const DEFAULT_CONFIG_FILE: &str = "epg2xml.toml";
pub const DEFAULT_CHANNEL_FILE: &str = "Channel.json";

// Logging defaults
pub const DEFAULT_LOG_LEVEL: &str = "info";

// Fetch defaults
pub const DEFAULT_FETCH_LIMIT: u32 = 2;
pub const DEFAULT_PARALLEL: bool = false;
pub const DEFAULT_CHANNEL_CACHE_MAX_AGE: &str = "4d";
pub const DEFAULT_HTTP_TIMEOUT: &str = "30s";

// Shutdown
/// How long an interrupted run may spend draining the output sink
pub const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

// Rendering defaults
pub const DEFAULT_ID_FORMAT: &str = "{ServiceId}.{source}";
pub const DEFAULT_LANG: &str = "ko";
pub const DEFAULT_ADD_REBROADCAST_TO_TITLE: bool = false;
pub const DEFAULT_ADD_EPNUM_TO_TITLE: bool = true;
pub const DEFAULT_ADD_DESCRIPTION: bool = true;
pub const DEFAULT_ADD_XMLTV_NS: bool = false;
