//! Pipeline orchestration
//!
//! Ties the components together for the two run modes:
//!
//! - [`run`]: cache → providers → channel load → headers → programs → close
//! - [`update_channels`]: cache → providers → channel load → save
//!
//! Configuration, registry, sink and cancellation token are all passed in;
//! nothing here touches process-wide state.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::ChannelCache;
use crate::config::defaults::SHUTDOWN_GRACE;
use crate::config::{Config, Settings};
use crate::errors::{AppError, AppResult};
use crate::providers::registry::load_channels;
use crate::providers::{FetchControl, Provider, ProviderRegistry};
use crate::scheduler::{FetchMode, FetchScheduler, ScheduleReport};
use crate::xmltv::{OutputSink, WriterStats, XmltvWriter, with_document};

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Interrupted,
}

impl RunOutcome {
    /// Process exit status. Aborted runs (errors) exit with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Interrupted => 130,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Providers instantiated from the configuration
    pub providers: usize,
    /// The channel snapshot was rewritten
    pub cache_saved: bool,
    pub schedule: ScheduleReport,
    /// Set when a document was written
    pub writer: Option<WriterStats>,
}

impl RunReport {
    fn new(providers: usize) -> Self {
        Self {
            outcome: RunOutcome::Completed,
            providers,
            cache_saved: false,
            schedule: ScheduleReport::default(),
            writer: None,
        }
    }
}

/// Full run: refresh channels and emit the XMLTV document to `sink`.
///
/// The document is closed on every exit path, including errors and
/// interruption. Once interrupted, a sink that does not drain within
/// [`SHUTDOWN_GRACE`] aborts the run with a sink error.
pub async fn run(
    config: &Config,
    registry: &ProviderRegistry,
    sink: OutputSink,
    cancel: CancellationToken,
) -> AppResult<RunReport> {
    let settings = Arc::new(config.settings.clone());
    let mut cache = ChannelCache::load(&settings.channel_file).await;
    let mut providers = registry.load_providers(&config.providers, &settings);
    let mut report = RunReport::new(providers.len());

    let writer = Arc::new(XmltvWriter::new(sink, XmltvWriter::default_generator()));
    let interrupt = cancel.clone();
    let document = with_document(writer.clone(), |writer| async move {
        match refresh_channels(&mut providers, &mut cache, &settings, &cancel).await {
            Some(saved) => report.cache_saved = saved,
            None => {
                report.outcome = RunOutcome::Interrupted;
                return Ok(report);
            }
        }

        for provider in providers.iter_mut() {
            provider.load_my_channels();
        }

        writer.write_prologue().await?;
        for provider in &providers {
            provider.write_channel_headers(&writer).await?;
        }

        let control = FetchControl::new(cancel.clone(), settings.fetch_timeout);
        let scheduler = FetchScheduler::new(FetchMode::from_settings(&settings), control);
        report.schedule = scheduler.run(providers, writer).await?;
        if report.schedule.interrupted {
            report.outcome = RunOutcome::Interrupted;
        }
        Ok(report)
    });

    let mut report = tokio::select! {
        result = document => result?,
        _ = grace_expired(&interrupt, SHUTDOWN_GRACE) => {
            error!(
                "Output sink still blocked {} after the interrupt, abandoning the document",
                humantime::format_duration(SHUTDOWN_GRACE)
            );
            return Err(AppError::Sink(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "output sink stalled after interrupt",
            )));
        }
    };

    let stats = writer.stats().await;
    info!(
        "XMLTV document closed: {} bytes, {} channel blocks, {} program blocks",
        stats.bytes_written, stats.header_fragments, stats.program_fragments
    );
    report.writer = Some(stats);
    Ok(report)
}

/// Resolves `grace` after `cancel` fires; pending forever otherwise.
async fn grace_expired(cancel: &CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}

/// Channel update only: refresh and persist the channel snapshot.
pub async fn update_channels(
    config: &Config,
    registry: &ProviderRegistry,
    cancel: CancellationToken,
) -> AppResult<RunReport> {
    let settings = Arc::new(config.settings.clone());
    let mut cache = ChannelCache::load(&settings.channel_file).await;
    let mut providers = registry.load_providers(&config.providers, &settings);
    let mut report = RunReport::new(providers.len());

    let workers = FetchMode::from_settings(&settings).workers();
    let updated = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!("Channel update interrupted, snapshot left untouched");
            report.outcome = RunOutcome::Interrupted;
            return Ok(report);
        }
        updated = load_channels(&mut providers, &mut cache, workers) => updated,
    };

    if updated {
        cache.save(&settings.channel_file).await?;
        report.cache_saved = true;
    } else {
        info!("Channel snapshot already up to date");
    }
    Ok(report)
}

/// Load service channels for every provider and save the snapshot if it
/// changed. `None` when interrupted. A failed save is logged, not fatal.
async fn refresh_channels(
    providers: &mut [Provider],
    cache: &mut ChannelCache,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Option<bool> {
    let workers = FetchMode::from_settings(settings).workers();
    let updated = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!("Interrupted while loading channels");
            return None;
        }
        updated = load_channels(providers, cache, workers) => updated,
    };
    if !updated {
        return Some(false);
    }
    match cache.save(&settings.channel_file).await {
        Ok(()) => Some(true),
        Err(e) => {
            error!("Failed to save channel snapshot: {}", e);
            Some(false)
        }
    }
}
