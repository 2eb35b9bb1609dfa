//! EPG providers
//!
//! A provider is one external listing source. The service specific part
//! (how channels and programs are scraped) lives behind the
//! [`ProviderBackend`] trait; [`Provider`] wraps a backend with the state the
//! pipeline needs:
//!
//! - the service channel list (cache or fresh discovery),
//! - the requested subset ("my channels") with rendered XMLTV ids,
//! - a buffer of rendered `<programme>` elements once fetched.
//!
//! Lifecycle: constructed by the [`registry`] → `load_svc_channels` →
//! `load_my_channels` → `write_channel_headers` → `fetch_programs` →
//! `write_program_buffer` → dropped.

pub mod registry;
pub mod xmltv;

use async_trait::async_trait;
use chrono::{DateTime, Days, FixedOffset, Local, NaiveDate};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ChannelCache;
use crate::config::{ChannelSelection, ProviderConfig, Settings};
use crate::errors::{AppError, AppResult, ProviderError, ProviderResult};
use crate::models::{ChannelRecord, EpgChannel, EpgProgram};
use crate::xmltv::render::{render_channel, render_channel_programs};
use crate::xmltv::{FragmentKind, RenderOptions, XmltvWriter};

pub use registry::{ProviderFactory, ProviderRegistry};

/// Service specific half of a provider
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    /// Registry tag of this implementation
    fn kind(&self) -> &str;

    /// Upstream only publishes start times
    fn no_end_time(&self) -> bool {
        false
    }

    /// Discover every channel the service offers
    async fn list_channels(&self) -> ProviderResult<Vec<ChannelRecord>>;

    /// Fetch the programs of one requested channel within `window`
    async fn fetch_programs(
        &self,
        channel: &EpgChannel,
        window: &FetchWindow,
    ) -> ProviderResult<Vec<EpgProgram>>;
}

/// Days to fetch, starting at `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub days: u32,
}

impl FetchWindow {
    pub fn from_today(days: u32) -> Self {
        Self {
            start: Local::now().date_naive(),
            days,
        }
    }

    pub fn end(&self) -> NaiveDate {
        self.start
            .checked_add_days(Days::new(self.days as u64))
            .unwrap_or(NaiveDate::MAX)
    }

    /// Whether a program starting at `start` falls in the window (by local date)
    pub fn contains(&self, start: &DateTime<FixedOffset>) -> bool {
        let date = start.date_naive();
        date >= self.start && date < self.end()
    }
}

/// Cancellation and deadline for the fetch phase
#[derive(Debug, Clone, Default)]
pub struct FetchControl {
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

impl FetchControl {
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self { cancel, timeout }
    }
}

pub struct Provider {
    config: ProviderConfig,
    settings: Arc<Settings>,
    backend: Arc<dyn ProviderBackend>,
    render: RenderOptions,
    svc_channels: Vec<ChannelRecord>,
    req_channels: Vec<EpgChannel>,
    program_buffer: Option<String>,
    programs_buffered: usize,
    channels_updated: bool,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.config.name)
            .field("kind", &self.backend.kind())
            .field("svc_channels", &self.svc_channels.len())
            .field("req_channels", &self.req_channels.len())
            .finish()
    }
}

impl Provider {
    pub fn new(
        config: ProviderConfig,
        settings: Arc<Settings>,
        backend: Arc<dyn ProviderBackend>,
    ) -> Self {
        let render = RenderOptions::from_settings(&settings);
        Self {
            config,
            settings,
            backend,
            render,
            svc_channels: Vec::new(),
            req_channels: Vec::new(),
            program_buffer: None,
            programs_buffered: 0,
            channels_updated: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn cache_key(&self) -> String {
        self.config.cache_key()
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn svc_channels(&self) -> &[ChannelRecord] {
        &self.svc_channels
    }

    pub fn req_channels(&self) -> &[EpgChannel] {
        &self.req_channels
    }

    pub fn has_requested_channels(&self) -> bool {
        !self.req_channels.is_empty()
    }

    /// Fresh channels were discovered during this run
    pub fn channels_updated(&self) -> bool {
        self.channels_updated
    }

    /// Number of programs sitting in the buffer, not yet flushed
    pub fn programs_buffered(&self) -> usize {
        self.programs_buffered
    }

    /// Live channel discovery through the backend
    pub async fn get_channels(&self) -> ProviderResult<Vec<ChannelRecord>> {
        let mut channels = self.backend.list_channels().await?;
        let mut seen = HashSet::new();
        channels.retain(|c| !c.id.is_empty() && seen.insert(c.id.clone()));
        for channel in channels.iter_mut() {
            channel.provider = self.cache_key();
        }
        Ok(channels)
    }

    /// Populate the service channel list.
    ///
    /// A consistent cache entry younger than `channel_cache_max_age` is used
    /// as is. Otherwise channels are discovered live; if discovery fails (or
    /// returns nothing) the cached entry, however old, is the fallback.
    /// Errors never leave this method.
    pub async fn load_svc_channels(&mut self, cache: &ChannelCache) {
        let key = self.cache_key();
        let cached = cache.get(&key);
        let now = Local::now().naive_local();

        match cached {
            Some(entry) if entry.is_fresh(self.settings.channel_cache_max_age, now) => {
                self.svc_channels = entry.channels.clone();
                info!(
                    "[{}] {:03} service channels loaded from cache",
                    self.name(),
                    self.svc_channels.len()
                );
                return;
            }
            Some(entry) if !entry.is_consistent() => {
                debug!("[{}] Updating service channels as cache is broken", self.name());
            }
            Some(_) => debug!("[{}] Updating service channels as outdated", self.name()),
            None => debug!("[{}] No cached service channels", self.name()),
        }

        match self.get_channels().await {
            Ok(channels) if !channels.is_empty() => {
                info!(
                    "[{}] {:03} service channels successfully fetched from server",
                    self.name(),
                    channels.len()
                );
                self.svc_channels = channels;
                self.channels_updated = true;
            }
            Ok(_) => {
                warn!("[{}] Channel discovery returned no channels", self.name());
                self.fall_back_to_cache(cached.map(|e| e.channels.as_slice()));
            }
            Err(e) => {
                error!("[{}] Failed to retrieve service channels: {}", self.name(), e);
                self.fall_back_to_cache(cached.map(|e| e.channels.as_slice()));
            }
        }
    }

    fn fall_back_to_cache(&mut self, cached: Option<&[ChannelRecord]>) {
        match cached {
            Some(channels) if !channels.is_empty() => {
                warn!(
                    "[{}] Using {} cached service channels",
                    self.name(),
                    channels.len()
                );
                self.svc_channels = channels.to_vec();
            }
            _ => {
                warn!("[{}] No service channels available", self.name());
                self.svc_channels.clear();
            }
        }
    }

    /// Resolve `my_channels` against the service channel list.
    ///
    /// Order follows the selectors (or the service list for `"*"`). Unknown
    /// ids are logged and skipped; duplicates are dropped.
    pub fn load_my_channels(&mut self) {
        let mut requested = Vec::new();
        match self.config.my_channels.resolve() {
            ChannelSelection::All => {
                requested.extend(
                    self.svc_channels
                        .iter()
                        .map(|record| EpgChannel::from_record(record, None, &self.settings)),
                );
            }
            ChannelSelection::Only(selectors) => {
                let mut seen = HashSet::new();
                for selector in selectors {
                    if !seen.insert(selector.service_id.clone()) {
                        continue;
                    }
                    match self.svc_channels.iter().find(|c| c.id == selector.service_id) {
                        Some(record) => requested.push(EpgChannel::from_record(
                            record,
                            Some(&selector),
                            &self.settings,
                        )),
                        None => warn!(
                            "[{}] Requested channel not found in service channels: {}",
                            self.name(),
                            selector.service_id
                        ),
                    }
                }
            }
        }
        info!("[{}] {:03} requested channels", self.name(), requested.len());
        self.req_channels = requested;
    }

    /// Emit one `<channel>` per requested channel as a single fragment
    pub async fn write_channel_headers(&self, writer: &XmltvWriter) -> AppResult<()> {
        if self.req_channels.is_empty() {
            return Ok(());
        }
        let headers: String = self.req_channels.iter().map(render_channel).collect();
        writer
            .write_fragment(FragmentKind::ChannelHeaders, &headers)
            .await
    }

    /// Fetch and render programs for every requested channel into the
    /// buffer. With `lazy == false` the buffer is flushed to `writer` as soon
    /// as the whole provider is fetched; otherwise the caller flushes it
    /// through [`Provider::write_program_buffer`].
    ///
    /// Any backend error discards the partial buffer, so a failed provider
    /// contributes no programs. Cancellation and the deadline are only
    /// observed while fetching, never while writing.
    pub async fn fetch_programs(
        &mut self,
        lazy: bool,
        writer: &XmltvWriter,
        control: &FetchControl,
    ) -> AppResult<()> {
        self.program_buffer = None;
        self.programs_buffered = 0;
        if self.req_channels.is_empty() {
            debug!("[{}] No requested channels, skipping fetch", self.name());
            return Ok(());
        }

        let fetch_limit = self.config.effective_fetch_limit(&self.settings);
        let window = FetchWindow::from_today(fetch_limit);
        let deadline = control.timeout.map(|t| Instant::now() + t);
        let started = Instant::now();
        let total = self.req_channels.len();

        let mut buffer = String::new();
        let mut count = 0usize;
        for (idx, channel) in self.req_channels.iter().enumerate() {
            debug!(
                "[{}] {:03}/{:03} {} ({})",
                self.name(),
                idx + 1,
                total,
                channel.name,
                channel.service_id
            );
            let fetch = with_deadline(
                deadline,
                self.name(),
                self.backend.fetch_programs(channel, &window),
            );
            let mut programs = tokio::select! {
                biased;
                _ = control.cancel.cancelled() => return Err(AppError::Interrupted),
                result = fetch => result?,
            };
            for program in programs.iter_mut() {
                program.channel_id = channel.xmltv_id.clone();
            }
            count += programs.len();
            buffer.push_str(&render_channel_programs(programs, &self.render));
        }

        info!(
            "[{}] Fetched {} programs for {} channels in {}",
            self.name(),
            count,
            total,
            humantime::format_duration(Duration::from_millis(started.elapsed().as_millis() as u64))
        );
        self.program_buffer = Some(buffer);
        self.programs_buffered = count;

        if !lazy {
            self.write_program_buffer(writer).await?;
        }
        Ok(())
    }

    /// Flush the buffered programs, at most once per fetch
    pub async fn write_program_buffer(&mut self, writer: &XmltvWriter) -> AppResult<()> {
        match self.program_buffer.take() {
            Some(buffer) => {
                writer.write_fragment(FragmentKind::Programs, &buffer).await?;
                debug!(
                    "[{}] Wrote {} programs ({} bytes)",
                    self.name(),
                    self.programs_buffered,
                    buffer.len()
                );
                self.programs_buffered = 0;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

async fn with_deadline<T, F>(deadline: Option<Instant>, provider: &str, fut: F) -> ProviderResult<T>
where
    F: Future<Output = ProviderResult<T>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.map_err(|_| {
            ProviderError::Timeout {
                provider: provider.to_string(),
                elapsed: "fetch deadline".to_string(),
            }
        })?,
        None => fut.await,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted backend shared by unit tests

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct ScriptedBackend {
        pub channels: Vec<(String, String)>,
        pub fail_discovery: bool,
        pub fail_fetch_on: Option<String>,
        pub panic_on_fetch: bool,
        pub delay: Option<Duration>,
        pub discovery_calls: AtomicUsize,
        pub fetch_calls: AtomicUsize,
    }

    impl ScriptedBackend {
        pub fn with_channels(ids: &[&str]) -> Self {
            Self {
                channels: ids.iter().map(|id| (id.to_string(), format!("Channel {id}"))).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ProviderBackend for ScriptedBackend {
        fn kind(&self) -> &str {
            "SCRIPTED"
        }

        async fn list_channels(&self) -> ProviderResult<Vec<ChannelRecord>> {
            self.discovery_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_discovery {
                return Err(ProviderError::discovery("SCRIPTED", "upstream down"));
            }
            Ok(self
                .channels
                .iter()
                .map(|(id, name)| ChannelRecord::new("", id.as_str(), name.as_str()))
                .collect())
        }

        async fn fetch_programs(
            &self,
            channel: &EpgChannel,
            window: &FetchWindow,
        ) -> ProviderResult<Vec<EpgProgram>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.panic_on_fetch {
                panic!("scripted backend crashed on {}", channel.service_id);
            }
            if self.fail_fetch_on.as_deref() == Some(channel.service_id.as_str()) {
                return Err(ProviderError::fetch("SCRIPTED", "bad response"));
            }
            let start = window
                .start
                .and_hms_opt(6, 0, 0)
                .unwrap()
                .and_local_timezone(FixedOffset::east_opt(9 * 3600).unwrap())
                .unwrap();
            Ok(vec![EpgProgram::new(
                "ignored",
                start,
                format!("Show on {}", channel.service_id),
            )])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedBackend;
    use super::*;
    use crate::config::MyChannels;
    use crate::xmltv::{MemoryBuffer, OutputSink};
    use std::sync::atomic::Ordering;

    fn provider_with(backend: Arc<ScriptedBackend>, my_channels: &str) -> Provider {
        let mut config = ProviderConfig::new("kt");
        config.my_channels = MyChannels::Text(my_channels.to_string());
        Provider::new(config, Arc::new(Settings::default()), backend)
    }

    fn writer() -> (XmltvWriter, MemoryBuffer) {
        let (sink, buffer) = OutputSink::memory();
        (XmltvWriter::new(sink, "test"), buffer)
    }

    #[tokio::test]
    async fn test_discovery_when_cache_empty() {
        let backend = Arc::new(ScriptedBackend::with_channels(&["1", "2", "2", ""]));
        let mut provider = provider_with(backend.clone(), "*");
        provider.load_svc_channels(&ChannelCache::new()).await;

        assert!(provider.channels_updated());
        let ids: Vec<_> = provider.svc_channels().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert!(provider.svc_channels().iter().all(|c| c.provider == "KT"));
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_discovery() {
        let backend = Arc::new(ScriptedBackend::with_channels(&["1"]));
        let mut cache = ChannelCache::new();
        cache.insert("KT", vec![ChannelRecord::new("KT", "9", "Cached")]);

        let mut provider = provider_with(backend.clone(), "*");
        provider.load_svc_channels(&cache).await;

        assert_eq!(backend.discovery_calls.load(Ordering::SeqCst), 0);
        assert!(!provider.channels_updated());
        assert_eq!(provider.svc_channels()[0].id, "9");
    }

    #[tokio::test]
    async fn test_discovery_failure_falls_back_to_stale_cache() {
        let backend = Arc::new(ScriptedBackend {
            fail_discovery: true,
            ..ScriptedBackend::with_channels(&["1"])
        });
        let mut cache = ChannelCache::new();
        let stale = Local::now().naive_local() - chrono::Duration::days(30);
        cache.insert_at("KT", vec![ChannelRecord::new("KT", "9", "Cached")], stale);

        let mut provider = provider_with(backend.clone(), "*");
        provider.load_svc_channels(&cache).await;

        assert_eq!(backend.discovery_calls.load(Ordering::SeqCst), 1);
        assert!(!provider.channels_updated());
        assert_eq!(provider.svc_channels()[0].name, "Cached");
    }

    #[tokio::test]
    async fn test_my_channels_follow_selector_order() {
        let backend = Arc::new(ScriptedBackend::with_channels(&["1", "2", "3"]));
        let mut provider = provider_with(backend, "3,1,missing,3");
        provider.load_svc_channels(&ChannelCache::new()).await;
        provider.load_my_channels();

        let ids: Vec<_> = provider.req_channels().iter().map(|c| c.xmltv_id.as_str()).collect();
        assert_eq!(ids, vec!["3.kt", "1.kt"]);
    }

    #[tokio::test]
    async fn test_lazy_fetch_buffers_until_flushed() {
        let backend = Arc::new(ScriptedBackend::with_channels(&["1", "2"]));
        let mut provider = provider_with(backend, "*");
        provider.load_svc_channels(&ChannelCache::new()).await;
        provider.load_my_channels();

        let (writer, buffer) = writer();
        writer.write_prologue().await.unwrap();
        provider
            .fetch_programs(true, &writer, &FetchControl::default())
            .await
            .unwrap();
        assert_eq!(provider.programs_buffered(), 2);
        assert!(!buffer.to_string_lossy().contains("<programme"));

        provider.write_program_buffer(&writer).await.unwrap();
        provider.write_program_buffer(&writer).await.unwrap();
        let doc = buffer.to_string_lossy();
        assert_eq!(doc.matches("<programme").count(), 2);
        assert!(doc.contains("channel=\"1.kt\""));
        assert!(doc.contains("channel=\"2.kt\""));
    }

    #[tokio::test]
    async fn test_failed_fetch_contributes_nothing() {
        let backend = Arc::new(ScriptedBackend {
            fail_fetch_on: Some("2".into()),
            ..ScriptedBackend::with_channels(&["1", "2"])
        });
        let mut provider = provider_with(backend, "*");
        provider.load_svc_channels(&ChannelCache::new()).await;
        provider.load_my_channels();

        let (writer, buffer) = writer();
        writer.write_prologue().await.unwrap();
        let err = provider
            .fetch_programs(false, &writer, &FetchControl::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Provider(_)));
        assert!(!buffer.to_string_lossy().contains("<programme"));
        assert_eq!(provider.programs_buffered(), 0);
    }

    #[tokio::test]
    async fn test_fetch_observes_cancellation() {
        let backend = Arc::new(ScriptedBackend {
            delay: Some(Duration::from_secs(30)),
            ..ScriptedBackend::with_channels(&["1"])
        });
        let mut provider = provider_with(backend, "*");
        provider.load_svc_channels(&ChannelCache::new()).await;
        provider.load_my_channels();

        let control = FetchControl::default();
        control.cancel.cancel();
        let (writer, _) = writer();
        let err = provider.fetch_programs(true, &writer, &control).await.unwrap_err();
        assert!(matches!(err, AppError::Interrupted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_deadline() {
        let backend = Arc::new(ScriptedBackend {
            delay: Some(Duration::from_secs(30)),
            ..ScriptedBackend::with_channels(&["1"])
        });
        let mut provider = provider_with(backend, "*");
        provider.load_svc_channels(&ChannelCache::new()).await;
        provider.load_my_channels();

        let control = FetchControl::new(CancellationToken::new(), Some(Duration::from_secs(5)));
        let (writer, _) = writer();
        let err = provider.fetch_programs(true, &writer, &control).await.unwrap_err();
        assert!(matches!(err, AppError::Provider(ProviderError::Timeout { .. })));
    }

    #[test]
    fn test_fetch_window() {
        let window = FetchWindow {
            start: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
            days: 2,
        };
        assert_eq!(window.end(), NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
        let inside = DateTime::parse_from_rfc3339("2025-01-01T23:00:00+09:00").unwrap();
        let outside = DateTime::parse_from_rfc3339("2025-01-02T00:00:00+09:00").unwrap();
        assert!(window.contains(&inside));
        assert!(!window.contains(&outside));
    }
}
