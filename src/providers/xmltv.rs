//! XMLTV feed provider
//!
//! Aggregates an existing XMLTV document, read from an http(s) URL or a local
//! file named by the `source` option:
//!
//! ```toml
//! [[providers]]
//! name = "FEED"
//! kind = "xmltv"
//! my_channels = "*"
//! options = { source = "https://example.com/guide.xml" }
//! ```
//!
//! The document is read once per run and parsed with a streaming reader;
//! every later discovery or fetch call is served from the parsed copy.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use quick_xml::Reader;
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use super::{FetchWindow, ProviderBackend};
use crate::config::{ProviderConfig, Settings};
use crate::errors::{ProviderError, ProviderResult};
use crate::models::{ChannelRecord, Credit, CreditRole, EpgChannel, EpgProgram};

/// Registry tag
pub const KIND: &str = "XMLTV";

#[derive(Debug, Clone, PartialEq)]
enum FeedSource {
    Remote(Url),
    Local(PathBuf),
}

impl FeedSource {
    fn parse(source: &str) -> Self {
        match Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => FeedSource::Remote(url),
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(FeedSource::Local)
                .unwrap_or_else(|_| FeedSource::Local(PathBuf::from(source))),
            _ => FeedSource::Local(PathBuf::from(source)),
        }
    }
}

/// Parsed feed content
#[derive(Debug, Default)]
struct FeedDocument {
    channels: Vec<ChannelRecord>,
    programs: HashMap<String, Vec<EpgProgram>>,
}

pub struct XmltvBackend {
    provider: String,
    source: FeedSource,
    client: reqwest::Client,
    document: OnceCell<Arc<FeedDocument>>,
}

impl XmltvBackend {
    pub fn new(provider: &str, source: &str, settings: &Settings) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::http(provider, format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            provider: provider.to_string(),
            source: FeedSource::parse(source),
            client,
            document: OnceCell::new(),
        })
    }

    /// Registry factory; requires the `source` option
    pub fn factory(
        config: &ProviderConfig,
        settings: &Settings,
    ) -> ProviderResult<Arc<dyn ProviderBackend>> {
        let source = config
            .option_str("source")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::invalid_config(&config.name, "options.source", "missing feed URL or path")
            })?;
        Ok(Arc::new(Self::new(&config.cache_key(), source.trim(), settings)?))
    }

    async fn document(&self) -> ProviderResult<Arc<FeedDocument>> {
        self.document
            .get_or_try_init(|| async {
                let content = self.read_source().await?;
                let document = parse_feed(&self.provider, &content)?;
                info!(
                    "[{}] Parsed XMLTV feed: {} channels, {} programs",
                    self.provider,
                    document.channels.len(),
                    document.programs.values().map(Vec::len).sum::<usize>()
                );
                Ok::<_, ProviderError>(Arc::new(document))
            })
            .await
            .cloned()
    }

    async fn read_source(&self) -> ProviderResult<String> {
        match &self.source {
            FeedSource::Remote(url) => {
                debug!("[{}] Fetching XMLTV feed from {}", self.provider, url);
                let response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| ProviderError::http(&self.provider, e.to_string()))?;
                response
                    .text()
                    .await
                    .map_err(|e| ProviderError::http(&self.provider, e.to_string()))
            }
            FeedSource::Local(path) => {
                debug!("[{}] Reading XMLTV feed from {}", self.provider, path.display());
                tokio::fs::read_to_string(path).await.map_err(|e| {
                    ProviderError::fetch(&self.provider, format!("{}: {e}", path.display()))
                })
            }
        }
    }
}

#[async_trait]
impl ProviderBackend for XmltvBackend {
    fn kind(&self) -> &str {
        KIND
    }

    async fn list_channels(&self) -> ProviderResult<Vec<ChannelRecord>> {
        let document = self
            .document()
            .await
            .map_err(|e| ProviderError::discovery(&self.provider, e.to_string()))?;
        Ok(document.channels.clone())
    }

    async fn fetch_programs(
        &self,
        channel: &EpgChannel,
        window: &FetchWindow,
    ) -> ProviderResult<Vec<EpgProgram>> {
        let document = self.document().await?;
        Ok(document
            .programs
            .get(&channel.service_id)
            .map(|programs| {
                programs
                    .iter()
                    .filter(|p| window.contains(&p.start))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Parse XMLTV content into channel records and per-channel programs
fn parse_feed(provider: &str, content: &str) -> ProviderResult<FeedDocument> {
    let mut reader = Reader::from_str(content);
    // text is trimmed per element; trimming events would eat the spaces
    // around entity references
    reader.config_mut().trim_text(false);

    let mut document = FeedDocument::default();
    let mut channel: Option<ChannelRecord> = None;
    let mut program: Option<(String, EpgProgram)> = None;
    let mut episode_system: Option<String> = None;
    let mut in_rating = false;
    let mut text = String::new();
    let mut skipped = 0usize;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| ProviderError::parse(provider, format!("XML parsing error: {e}")))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                match e.local_name().as_ref() {
                    b"channel" => {
                        let id = attribute(e, "id").unwrap_or_default();
                        let record = ChannelRecord::new(provider, id, "");
                        if is_empty {
                            if !record.id.is_empty() {
                                document.channels.push(record);
                            }
                        } else {
                            channel = Some(record);
                        }
                    }
                    b"programme" if !is_empty => {
                        let channel_id = attribute(e, "channel").unwrap_or_default();
                        match attribute(e, "start").as_deref().and_then(parse_time) {
                            Some(start) => {
                                let mut p = EpgProgram::new(channel_id.as_str(), start, "");
                                p.stop = attribute(e, "stop").as_deref().and_then(parse_time);
                                program = Some((channel_id, p));
                            }
                            None => skipped += 1,
                        }
                    }
                    b"icon" => {
                        if let Some(src) = attribute(e, "src") {
                            if let Some((_, p)) = program.as_mut() {
                                p.poster_url.get_or_insert(src);
                            } else if let Some(c) = channel.as_mut() {
                                if c.icon().is_none() {
                                    c.attributes.insert("Icon_url".into(), src.into());
                                }
                            }
                        }
                    }
                    b"previously-shown" => {
                        if let Some((_, p)) = program.as_mut() {
                            p.rebroadcast = true;
                        }
                    }
                    b"episode-num" => episode_system = attribute(e, "system"),
                    b"rating" => in_rating = !is_empty,
                    _ => {}
                }
                text.clear();
            }

            Event::Text(e) => text.push_str(&String::from_utf8_lossy(&e)),
            Event::CData(e) => text.push_str(&String::from_utf8_lossy(&e)),
            Event::GeneralRef(e) => {
                let name = String::from_utf8_lossy(&e).into_owned();
                match e.resolve_char_ref() {
                    Ok(Some(ch)) => text.push(ch),
                    _ => {
                        if let Some(value) = resolve_predefined_entity(&name) {
                            text.push_str(value);
                        }
                    }
                }
            }

            Event::End(ref e) => {
                let value = text.trim().to_string();
                text.clear();
                match e.local_name().as_ref() {
                    b"channel" => {
                        if let Some(c) = channel.take().filter(|c| !c.id.is_empty()) {
                            document.channels.push(c);
                        }
                    }
                    b"display-name" => {
                        if let Some(c) = channel.as_mut().filter(|_| !value.is_empty()) {
                            if value.chars().all(|ch| ch.is_ascii_digit()) {
                                c.number.get_or_insert(value);
                            } else if c.name.is_empty() {
                                c.name = value;
                            }
                        }
                    }
                    b"programme" => {
                        if let Some((channel_id, p)) = program.take() {
                            document.programs.entry(channel_id).or_default().push(p);
                        }
                    }
                    b"rating" => in_rating = false,
                    tag => {
                        if let Some((_, p)) = program.as_mut().filter(|_| !value.is_empty()) {
                            apply_program_field(p, tag, value, episode_system.as_deref(), in_rating);
                        }
                    }
                }
            }

            Event::Eof => break,
            _ => {}
        }
    }

    for c in document.channels.iter_mut().filter(|c| c.name.is_empty()) {
        c.name = c.number.clone().unwrap_or_else(|| c.id.clone());
    }
    if skipped > 0 {
        warn!("[{}] Skipped {} programmes with unreadable start times", provider, skipped);
    }
    Ok(document)
}

fn apply_program_field(
    program: &mut EpgProgram,
    tag: &[u8],
    value: String,
    episode_system: Option<&str>,
    in_rating: bool,
) {
    match tag {
        b"title" if program.title.is_empty() => program.title = value,
        b"sub-title" => {
            program.sub_title.get_or_insert(value);
        }
        b"desc" => {
            program.description.get_or_insert(value);
        }
        b"category" => program.categories.push(value),
        b"keyword" => program.keywords.push(value),
        b"episode-num" if episode_system == Some("onscreen") => program.episode_num = Some(value),
        b"value" if in_rating => {
            let digits: String = value.chars().filter(char::is_ascii_digit).collect();
            program.rating = Some(digits.parse().unwrap_or(0));
        }
        b"actor" => program.cast.push(Credit { name: value, role: CreditRole::Actor }),
        b"guest" => program.cast.push(Credit { name: value, role: CreditRole::Guest }),
        b"presenter" => program.cast.push(Credit { name: value, role: CreditRole::Presenter }),
        b"director" => program.crew.push(Credit { name: value, role: CreditRole::Director }),
        b"writer" => program.crew.push(Credit { name: value, role: CreditRole::Writer }),
        b"producer" => program.crew.push(Credit { name: value, role: CreditRole::Producer }),
        _ => {}
    }
}

fn attribute(element: &BytesStart, name: &str) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name.as_bytes())
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

/// XMLTV timestamps, with or without an offset (UTC assumed)
fn parse_time(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    DateTime::parse_from_str(value, "%Y%m%d%H%M%S %z")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S")
                .ok()
                .map(|dt| dt.and_utc().fixed_offset())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE tv SYSTEM "xmltv.dtd">
<tv generator-info-name="upstream">
  <channel id="news.1">
    <display-name>News &amp; Weather</display-name>
    <display-name>7</display-name>
    <icon src="http://img/news.png" />
  </channel>
  <channel id="movies.2">
    <display-name>Movies</display-name>
  </channel>
  <programme start="20250301060000 +0900" stop="20250301070000 +0900" channel="news.1">
    <title lang="ko">Morning &#x26; Noon</title>
    <sub-title>Part one</sub-title>
    <desc>Daily &lt;live&gt; news</desc>
    <credits>
      <director>Kim</director>
      <presenter>Lee</presenter>
    </credits>
    <category>News</category>
    <episode-num system="onscreen">12</episode-num>
    <previously-shown />
    <rating system="KMRB"><value>15</value></rating>
  </programme>
  <programme start="20250302060000 +0900" channel="news.1">
    <title>Next Day</title>
  </programme>
  <programme start="20250305060000" channel="movies.2">
    <title>Late</title>
  </programme>
  <programme start="not a time" channel="movies.2">
    <title>Broken</title>
  </programme>
</tv>
"#;

    fn window(days: u32) -> FetchWindow {
        FetchWindow {
            start: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            days,
        }
    }

    #[test]
    fn test_parse_channels() {
        let document = parse_feed("FEED", FEED).unwrap();
        assert_eq!(document.channels.len(), 2);

        let news = &document.channels[0];
        assert_eq!(news.id, "news.1");
        assert_eq!(news.name, "News & Weather");
        assert_eq!(news.number.as_deref(), Some("7"));
        assert_eq!(news.icon(), Some("http://img/news.png"));
        assert_eq!(news.provider, "FEED");
    }

    #[test]
    fn test_parse_programs() {
        let document = parse_feed("FEED", FEED).unwrap();
        let news = &document.programs["news.1"];
        assert_eq!(news.len(), 2);

        let first = &news[0];
        assert_eq!(first.title, "Morning & Noon");
        assert_eq!(first.sub_title.as_deref(), Some("Part one"));
        assert_eq!(first.description.as_deref(), Some("Daily <live> news"));
        assert_eq!(first.categories, vec!["News"]);
        assert_eq!(first.episode_num.as_deref(), Some("12"));
        assert!(first.rebroadcast);
        assert_eq!(first.rating, Some(15));
        assert_eq!(first.crew[0].role, CreditRole::Director);
        assert_eq!(first.cast[0].name, "Lee");
        assert!(first.stop.is_some());
        assert!(news[1].stop.is_none());

        // unreadable start time dropped, naive time read as UTC
        let movies = &document.programs["movies.2"];
        assert_eq!(movies.len(), 1);
        assert_eq!(movies[0].start.offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_malformed_feed_is_parse_error() {
        let err = parse_feed("FEED", "<tv><channel id=\"a\"></tv>").unwrap_err();
        assert!(matches!(err, ProviderError::Parse { .. }));
    }

    #[test]
    fn test_source_kinds() {
        assert!(matches!(
            FeedSource::parse("https://example.com/guide.xml"),
            FeedSource::Remote(_)
        ));
        assert_eq!(
            FeedSource::parse("/var/lib/guide.xml"),
            FeedSource::Local(PathBuf::from("/var/lib/guide.xml"))
        );
        assert_eq!(
            FeedSource::parse("guide.xml"),
            FeedSource::Local(PathBuf::from("guide.xml"))
        );
    }

    #[test]
    fn test_factory_requires_source() {
        let config = ProviderConfig::new("feed");
        let err = XmltvBackend::factory(&config, &Settings::default()).err().unwrap();
        assert!(matches!(err, ProviderError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_local_feed_filtered_to_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guide.xml");
        std::fs::write(&path, FEED).unwrap();

        let mut config = ProviderConfig::new("feed");
        config
            .options
            .insert("source".into(), path.display().to_string().into());
        let backend = XmltvBackend::factory(&config, &Settings::default()).unwrap();

        let channels = backend.list_channels().await.unwrap();
        assert_eq!(channels.len(), 2);

        let news = EpgChannel::from_record(&channels[0], None, &Settings::default());
        assert_eq!(backend.fetch_programs(&news, &window(1)).await.unwrap().len(), 1);
        assert_eq!(backend.fetch_programs(&news, &window(2)).await.unwrap().len(), 2);

        let movies = EpgChannel::from_record(&channels[1], None, &Settings::default());
        assert!(backend.fetch_programs(&movies, &window(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_local_feed() {
        let backend = XmltvBackend::new("FEED", "/nonexistent/guide.xml", &Settings::default()).unwrap();
        let err = backend.list_channels().await.unwrap_err();
        assert!(matches!(err, ProviderError::Discovery { .. }));
    }
}
