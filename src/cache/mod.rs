//! Channel cache snapshot
//!
//! A JSON snapshot of every provider's last known channel list, keyed by the
//! upper-cased provider name:
//!
//! ```json
//! {
//!   "KT": { "UPDATED": "2024-05-01T09:00:00", "TOTAL": 2, "CHANNELS": [ ... ] }
//! }
//! ```
//!
//! Loading never fails: a missing, empty or malformed snapshot is an empty
//! cache. Saving goes through a temporary file and a rename so a crash
//! mid-write leaves the previous snapshot intact.

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::{CacheError, CacheResult};
use crate::models::ChannelRecord;

/// One provider's cached channel list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedChannels {
    #[serde(rename = "UPDATED")]
    pub updated: NaiveDateTime,
    #[serde(rename = "TOTAL")]
    pub total: usize,
    #[serde(rename = "CHANNELS")]
    pub channels: Vec<ChannelRecord>,
}

impl CachedChannels {
    pub fn new(channels: Vec<ChannelRecord>, updated: NaiveDateTime) -> Self {
        Self {
            updated,
            total: channels.len(),
            channels,
        }
    }

    /// `TOTAL` agrees with the stored list
    pub fn is_consistent(&self) -> bool {
        self.total == self.channels.len()
    }

    /// Consistent and younger than `max_age` at `now`
    pub fn is_fresh(&self, max_age: Duration, now: NaiveDateTime) -> bool {
        if !self.is_consistent() {
            return false;
        }
        match (now - self.updated).to_std() {
            Ok(age) => age <= max_age,
            // Timestamp in the future: clock skew, treat as fresh
            Err(_) => true,
        }
    }
}

/// Provider name -> cached channel list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelCache {
    entries: BTreeMap<String, CachedChannels>,
}

impl ChannelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the snapshot at `path`, falling back to an empty cache.
    pub async fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        debug!("Trying to load cached channels from {}", path.display());
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_json_str(&content),
            Err(e) => {
                debug!("Failed to load cached channels from {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Parse snapshot content, falling back to an empty cache.
    pub fn from_json_str(content: &str) -> Self {
        if content.trim().is_empty() {
            debug!("Channel cache is empty");
            return Self::default();
        }
        match serde_json::from_str::<Self>(content) {
            Ok(mut cache) => {
                for (provider, entry) in cache.entries.iter_mut() {
                    for record in entry.channels.iter_mut() {
                        record.provider = provider.clone();
                    }
                }
                debug!("Loaded cached channels for {} providers", cache.entries.len());
                cache
            }
            Err(e) => {
                debug!("Failed to parse cached channels: {}", e);
                Self::default()
            }
        }
    }

    pub fn to_json_string(&self) -> CacheResult<String> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Write the snapshot atomically (temp file + rename).
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> CacheResult<()> {
        let path = path.as_ref();
        let json = self.to_json_string()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::io(parent, e))?;
        }

        let temp_path = temp_path_for(path);
        tokio::fs::write(&temp_path, json.as_bytes())
            .await
            .map_err(|e| CacheError::io(&temp_path, e))?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| CacheError::io(path, e))?;

        info!(
            "Channel file was updated with {} providers: {}",
            self.entries.len(),
            path.display()
        );
        Ok(())
    }

    pub fn get(&self, provider: &str) -> Option<&CachedChannels> {
        self.entries.get(provider)
    }

    /// Replace a provider's entry, stamping it with the current local time.
    pub fn insert(&mut self, provider: &str, channels: Vec<ChannelRecord>) {
        self.insert_at(provider, channels, Local::now().naive_local());
    }

    pub fn insert_at(&mut self, provider: &str, channels: Vec<ChannelRecord>, updated: NaiveDateTime) {
        self.entries
            .insert(provider.to_string(), CachedChannels::new(channels, updated));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "channels".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use rstest::rstest;

    fn sample_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_micro_opt(9, 30, 0, 123456)
            .unwrap()
    }

    fn sample_cache() -> ChannelCache {
        let mut cache = ChannelCache::new();
        cache.insert_at(
            "KT",
            vec![
                ChannelRecord::new("KT", "1", "One").with_number("11"),
                ChannelRecord::new("KT", "2", "Two").with_attribute("Category", "News"),
            ],
            sample_time(),
        );
        cache.insert_at("LG", vec![ChannelRecord::new("LG", "9", "Nine")], sample_time());
        cache
    }

    #[rstest]
    #[case::empty("")]
    #[case::whitespace("  \n")]
    #[case::truncated("{\"KT\": {\"UPDATED\": ")]
    #[case::wrong_shape("[1, 2, 3]")]
    #[case::bad_entry("{\"KT\": {\"TOTAL\": 1}}")]
    fn test_malformed_content_is_empty(#[case] content: &str) {
        assert!(ChannelCache::from_json_str(content).is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChannelCache::load(dir.path().join("missing.json")).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("Channel.json");

        sample_cache().save(&path).await.unwrap();
        let first = std::fs::read(&path).unwrap();

        let loaded = ChannelCache::load(&path).await;
        assert_eq!(loaded, sample_cache());
        loaded.save(&path).await.unwrap();
        let second = std::fs::read(&path).unwrap();

        ChannelCache::load(&path).await.save(&path).await.unwrap();
        let third = std::fs::read(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(second, third);
        assert!(!dir.path().join("nested").join("Channel.json.tmp").exists());
    }

    #[test]
    fn test_loaded_records_know_their_provider() {
        let json = sample_cache().to_json_string().unwrap();
        let cache = ChannelCache::from_json_str(&json);
        let lg = cache.get("LG").unwrap();
        assert_eq!(lg.channels[0].provider, "LG");
        assert_eq!(cache.get("KT").unwrap().channels[0].provider, "KT");
    }

    #[test]
    fn test_freshness() {
        let entry = CachedChannels::new(vec![ChannelRecord::new("KT", "1", "One")], sample_time());
        let max_age = Duration::from_secs(4 * 24 * 3600);

        assert!(entry.is_fresh(max_age, sample_time() + chrono::Duration::days(1)));
        assert!(!entry.is_fresh(max_age, sample_time() + chrono::Duration::days(5)));

        let mut broken = entry.clone();
        broken.total = 7;
        assert!(!broken.is_consistent());
        assert!(!broken.is_fresh(max_age, sample_time()));
    }

    #[test]
    fn test_accepts_microsecond_timestamps() {
        let json = r#"{"SK": {"UPDATED": "2023-12-31T23:59:59.000001", "TOTAL": 1,
            "CHANNELS": [{"Name": "A", "ServiceId": "a", "Icon_url": "x"}]}}"#;
        let cache = ChannelCache::from_json_str(json);
        let sk = cache.get("SK").unwrap();
        assert_eq!(sk.channels[0].icon(), Some("x"));
        assert!(sk.is_consistent());
    }

    proptest! {
        #[test]
        fn prop_arbitrary_content_never_panics(content in ".*") {
            let _ = ChannelCache::from_json_str(&content);
        }
    }
}
