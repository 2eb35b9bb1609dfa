//! XMLTV fragment rendering
//!
//! Fragments are rendered to strings ahead of time so the shared writer is
//! only held for a single `write_all` per fragment.

use quick_xml::escape::escape;
use std::fmt::Write as _;

use crate::config::Settings;
use crate::models::{CreditRole, EpgChannel, EpgProgram};

const XMLTV_TIME_FORMAT: &str = "%Y%m%d%H%M%S %z";

/// Rendering switches taken from [`Settings`]
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub lang: Option<String>,
    pub add_description: bool,
    pub add_xmltv_ns: bool,
    pub add_epnum_to_title: bool,
    pub add_rebroadcast_to_title: bool,
}

impl RenderOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let lang = settings.lang.trim();
        Self {
            lang: (!lang.is_empty()).then(|| lang.to_string()),
            add_description: settings.add_description,
            add_xmltv_ns: settings.add_xmltv_ns,
            add_epnum_to_title: settings.add_epnum_to_title,
            add_rebroadcast_to_title: settings.add_rebroadcast_to_title,
        }
    }

    fn lang_attr(&self) -> String {
        match &self.lang {
            Some(lang) => format!(" lang=\"{}\"", escape(lang.as_str())),
            None => String::new(),
        }
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// XML declaration, doctype and the `<tv>` open tag
pub fn render_prologue(generator: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE tv SYSTEM \"xmltv.dtd\">\n\n<tv generator-info-name=\"{}\">\n",
        escape(generator)
    )
}

pub fn render_epilogue() -> &'static str {
    "</tv>\n"
}

/// `<channel>` element with the display-name variants players match on
pub fn render_channel(channel: &EpgChannel) -> String {
    let mut xml = String::new();
    let _ = writeln!(xml, "  <channel id=\"{}\">", escape(channel.xmltv_id.as_str()));
    let _ = writeln!(xml, "    <display-name>{}</display-name>", escape(channel.name.as_str()));
    let _ = writeln!(
        xml,
        "    <display-name>{}</display-name>",
        escape(channel.provider.as_str())
    );
    if let Some(number) = channel.number.as_deref().filter(|n| !n.is_empty()) {
        let _ = writeln!(xml, "    <display-name>{}</display-name>", escape(number));
        let _ = writeln!(
            xml,
            "    <display-name>{} {}</display-name>",
            escape(number),
            escape(channel.name.as_str())
        );
        let _ = writeln!(
            xml,
            "    <display-name>{} {}</display-name>",
            escape(number),
            escape(channel.provider.as_str())
        );
    }
    if let Some(icon) = channel.icon.as_deref().filter(|i| !i.is_empty()) {
        let _ = writeln!(xml, "    <icon src=\"{}\" />", escape(icon));
    }
    xml.push_str("  </channel>\n");
    xml
}

/// Render all programs of one channel.
///
/// Programs are ordered by start time. A missing stop time is taken from the
/// next program's start; if there is none the `stop` attribute is omitted.
pub fn render_channel_programs(mut programs: Vec<EpgProgram>, options: &RenderOptions) -> String {
    programs.sort_by_key(|p| p.start);
    programs.dedup_by(|b, a| a.start == b.start && a.title == b.title);

    let next_starts: Vec<_> = programs.iter().skip(1).map(|p| p.start).collect();
    for (program, next_start) in programs.iter_mut().zip(next_starts) {
        if program.stop.is_none() {
            program.stop = Some(next_start);
        }
    }

    let mut xml = String::new();
    for program in &programs {
        xml.push_str(&render_programme(program, options));
    }
    xml
}

/// `<programme>` element, children in XMLTV DTD order
pub fn render_programme(program: &EpgProgram, options: &RenderOptions) -> String {
    let lang = options.lang_attr();
    let mut xml = String::new();

    let _ = write!(
        xml,
        "  <programme start=\"{}\"",
        program.start.format(XMLTV_TIME_FORMAT)
    );
    if let Some(stop) = program.stop {
        let _ = write!(xml, " stop=\"{}\"", stop.format(XMLTV_TIME_FORMAT));
    }
    let _ = writeln!(xml, " channel=\"{}\">", escape(program.channel_id.as_str()));

    let _ = writeln!(
        xml,
        "    <title{lang}>{}</title>",
        escape(decorated_title(program, options).as_str())
    );

    if let Some(sub_title) = program.sub_title.as_deref().filter(|s| !s.is_empty()) {
        let _ = writeln!(xml, "    <sub-title{lang}>{}</sub-title>", escape(sub_title));
    }

    if options.add_description {
        if let Some(desc) = description(program) {
            let _ = writeln!(xml, "    <desc{lang}>{}</desc>", escape(desc.as_str()));
        }
    }

    if !program.cast.is_empty() || !program.crew.is_empty() {
        xml.push_str("    <credits>\n");
        // XMLTV requires credits grouped by role in DTD order
        for role in [
            CreditRole::Director,
            CreditRole::Actor,
            CreditRole::Writer,
            CreditRole::Producer,
            CreditRole::Presenter,
            CreditRole::Guest,
        ] {
            for credit in program
                .crew
                .iter()
                .chain(program.cast.iter())
                .filter(|c| c.role == role)
            {
                let _ = writeln!(
                    xml,
                    "      <{0}>{1}</{0}>",
                    role.as_str(),
                    escape(credit.name.as_str())
                );
            }
        }
        xml.push_str("    </credits>\n");
    }

    for category in program.categories.iter().filter(|c| !c.is_empty()) {
        let _ = writeln!(xml, "    <category{lang}>{}</category>", escape(category.as_str()));
    }

    for keyword in program.keywords.iter().filter(|k| !k.is_empty()) {
        let _ = writeln!(xml, "    <keyword{lang}>{}</keyword>", escape(keyword.as_str()));
    }

    if let Some(poster) = program.poster_url.as_deref().filter(|p| !p.is_empty()) {
        let _ = writeln!(xml, "    <icon src=\"{}\" />", escape(poster));
    }

    if let Some(episode) = program.episode_num.as_deref().filter(|e| !e.is_empty()) {
        if options.add_xmltv_ns {
            if let Some(ns) = xmltv_ns(episode, program.part_num.as_deref()) {
                let _ = writeln!(xml, "    <episode-num system=\"xmltv_ns\">{ns}</episode-num>");
            }
        }
        let _ = writeln!(
            xml,
            "    <episode-num system=\"onscreen\">{}</episode-num>",
            escape(episode)
        );
    }

    if program.rebroadcast {
        xml.push_str("    <previously-shown />\n");
    }

    if let Some(rating) = program.rating {
        let value = if rating == 0 {
            "All".to_string()
        } else {
            format!("{rating}+")
        };
        let _ = writeln!(xml, "    <rating>\n      <value>{value}</value>\n    </rating>");
    }

    xml.push_str("  </programme>\n");
    xml
}

fn decorated_title(program: &EpgProgram, options: &RenderOptions) -> String {
    let mut title = program.title.trim().to_string();
    if options.add_epnum_to_title {
        if let Some(episode) = program.episode_num.as_deref().filter(|e| !e.is_empty()) {
            let _ = write!(title, " (Ep.{episode})");
        }
    }
    if options.add_rebroadcast_to_title && program.rebroadcast {
        title.push_str(" (R)");
    }
    title
}

fn description(program: &EpgProgram) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();
    if let Some(desc) = program.description.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        lines.push(desc.to_string());
    }
    let extras: Vec<_> = program.extras.iter().filter(|e| !e.is_empty()).cloned().collect();
    if !extras.is_empty() {
        lines.push(extras.join(", "));
    }
    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Zero-based `season.episode.part` form; only episode and part are known
fn xmltv_ns(episode: &str, part: Option<&str>) -> Option<String> {
    let episode: u32 = episode.trim().parse().ok()?;
    let episode = episode.checked_sub(1)?;
    let part = part
        .and_then(|p| p.trim().parse::<u32>().ok())
        .and_then(|p| p.checked_sub(1))
        .map(|p| p.to_string())
        .unwrap_or_default();
    Some(format!(".{episode}.{part}"))
}
