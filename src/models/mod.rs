//! Channel and program records shared by the cache, providers and writer.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::config::{SelectorOverride, Settings};

/// A channel as discovered by a provider or loaded from the channel cache.
///
/// Field names follow the snapshot format. Keys the model does not know
/// about are kept in `attributes` so a load/save cycle is lossless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Owning provider; the cache stores it as the map key
    #[serde(skip)]
    pub provider: String,
    #[serde(rename = "ServiceId")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(
        rename = "No",
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub number: Option<String>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl ChannelRecord {
    pub fn new<P: Into<String>, I: Into<String>, N: Into<String>>(
        provider: P,
        id: I,
        name: N,
    ) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
            name: name.into(),
            number: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_number<S: Into<String>>(mut self, number: S) -> Self {
        self.number = Some(number.into());
        self
    }

    pub fn with_attribute<K: Into<String>, V: Into<serde_json::Value>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn icon(&self) -> Option<&str> {
        self.attribute_str("Icon_url")
    }

    pub fn category(&self) -> Option<&str> {
        self.attribute_str("Category")
    }

    fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// A requested channel: the subset of discovered channels that ends up in
/// the document, with its rendered XMLTV id.
#[derive(Debug, Clone, PartialEq)]
pub struct EpgChannel {
    pub provider: String,
    pub service_id: String,
    pub xmltv_id: String,
    pub name: String,
    pub number: Option<String>,
    pub icon: Option<String>,
    pub category: Option<String>,
}

impl EpgChannel {
    /// Build a requested channel from a discovered record, applying any
    /// selector overrides and the configured id template.
    pub fn from_record(
        record: &ChannelRecord,
        selector: Option<&SelectorOverride>,
        settings: &Settings,
    ) -> Self {
        let name = selector
            .and_then(|s| s.name.clone())
            .unwrap_or_else(|| record.name.clone());
        let number = selector
            .and_then(|s| s.number.clone())
            .or_else(|| record.number.clone());
        let icon = selector
            .and_then(|s| s.icon.clone())
            .or_else(|| record.icon().map(str::to_string));

        let xmltv_id = format_channel_id(
            &settings.id_format,
            &record.id,
            &record.provider,
            number.as_deref(),
            &name,
        );

        Self {
            provider: record.provider.clone(),
            service_id: record.id.clone(),
            xmltv_id,
            name,
            number,
            icon,
            category: record.category().map(str::to_string),
        }
    }
}

/// Render an XMLTV channel id from a template.
///
/// Placeholders: `{ServiceId}`, `{Source}`, `{source}` (lower-cased
/// provider), `{No}` and `{Name}`.
pub fn format_channel_id(
    template: &str,
    service_id: &str,
    provider: &str,
    number: Option<&str>,
    name: &str,
) -> String {
    template
        .replace("{ServiceId}", service_id)
        .replace("{Source}", provider)
        .replace("{source}", &provider.to_lowercase())
        .replace("{No}", number.unwrap_or_default())
        .replace("{Name}", name)
}

/// A single scheduled program.
#[derive(Debug, Clone, PartialEq)]
pub struct EpgProgram {
    /// XMLTV id of the channel this program belongs to
    pub channel_id: String,
    pub start: DateTime<FixedOffset>,
    pub stop: Option<DateTime<FixedOffset>>,
    pub title: String,
    pub sub_title: Option<String>,
    pub description: Option<String>,
    pub categories: Vec<String>,
    pub episode_num: Option<String>,
    pub part_num: Option<String>,
    pub rebroadcast: bool,
    /// Minimum viewer age; 0 means all ages
    pub rating: Option<u32>,
    pub poster_url: Option<String>,
    pub cast: Vec<Credit>,
    pub crew: Vec<Credit>,
    pub extras: Vec<String>,
    pub keywords: Vec<String>,
}

impl EpgProgram {
    pub fn new<C: Into<String>, T: Into<String>>(
        channel_id: C,
        start: DateTime<FixedOffset>,
        title: T,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            start,
            stop: None,
            title: title.into(),
            sub_title: None,
            description: None,
            categories: Vec::new(),
            episode_num: None,
            part_num: None,
            rebroadcast: false,
            rating: None,
            poster_url: None,
            cast: Vec::new(),
            crew: Vec::new(),
            extras: Vec::new(),
            keywords: Vec::new(),
        }
    }

    pub fn with_stop(mut self, stop: DateTime<FixedOffset>) -> Self {
        self.stop = Some(stop);
        self
    }
}

/// Cast or crew member
#[derive(Debug, Clone, PartialEq)]
pub struct Credit {
    pub name: String,
    /// XMLTV credit role (`actor`, `director`, `presenter`, ...)
    pub role: CreditRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditRole {
    Actor,
    Director,
    Writer,
    Producer,
    Presenter,
    Guest,
}

impl CreditRole {
    /// Element name inside `<credits>`
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditRole::Actor => "actor",
            CreditRole::Director => "director",
            CreditRole::Writer => "writer",
            CreditRole::Producer => "producer",
            CreditRole::Presenter => "presenter",
            CreditRole::Guest => "guest",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_record_keeps_unknown_keys() {
        let json = r#"{"ServiceId":"7","Name":"Seven","No":11,"Category":"News","Icon_url":"http://x/7.png","Extra":true}"#;
        let record: ChannelRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.number.as_deref(), Some("11"));
        assert_eq!(record.category(), Some("News"));
        assert_eq!(record.icon(), Some("http://x/7.png"));
        assert_eq!(record.attributes.get("Extra"), Some(&serde_json::Value::Bool(true)));

        let out = serde_json::to_value(&record).unwrap();
        assert_eq!(out["No"], "11");
        assert_eq!(out["Extra"], true);
        assert!(out.get("provider").is_none());
    }

    #[test]
    fn test_format_channel_id() {
        assert_eq!(
            format_channel_id("{ServiceId}.{source}", "123", "KT", None, "A"),
            "123.kt"
        );
        assert_eq!(
            format_channel_id("{Source}-{No}-{Name}", "1", "SK", Some("7"), "News"),
            "SK-7-News"
        );
    }

    #[test]
    fn test_epg_channel_applies_overrides() {
        let record = ChannelRecord::new("KT", "42", "Original")
            .with_number("5")
            .with_attribute("Icon_url", "http://icon");
        let selector = SelectorOverride {
            service_id: "42".into(),
            name: Some("Renamed".into()),
            number: None,
            icon: None,
        };
        let channel = EpgChannel::from_record(&record, Some(&selector), &Settings::default());
        assert_eq!(channel.name, "Renamed");
        assert_eq!(channel.number.as_deref(), Some("5"));
        assert_eq!(channel.icon.as_deref(), Some("http://icon"));
        assert_eq!(channel.xmltv_id, "42.kt");
    }
}
