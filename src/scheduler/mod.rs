//! Concurrent fetch scheduler
//!
//! Runs every provider's program fetch and hands each finished buffer to the
//! shared writer. Two modes:
//!
//! - **Sequential**: providers are fetched one after another and each one
//!   flushes its own buffer as soon as it is done.
//! - **Parallel**: providers are fetched on a bounded pool of tasks. Buffers
//!   are flushed from the collecting loop in completion order, so only
//!   already-rendered output ever touches the writer.
//!
//! A provider error is logged and isolated: the provider contributes no
//! programs and its siblings carry on. Sink errors abort the schedule.
//! Cancellation stops the schedule between flushes, never in the middle of
//! one.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::Settings;
use crate::errors::{AppError, AppResult};
use crate::providers::{FetchControl, Provider};
use crate::xmltv::XmltvWriter;

/// How providers are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Sequential,
    Parallel { workers: usize },
}

impl FetchMode {
    pub fn from_settings(settings: &Settings) -> Self {
        if !settings.parallel {
            return FetchMode::Sequential;
        }
        let workers = settings.max_workers.unwrap_or_else(default_workers).max(1);
        FetchMode::Parallel { workers }
    }

    /// Concurrency bound for this mode
    pub fn workers(&self) -> usize {
        match self {
            FetchMode::Sequential => 1,
            FetchMode::Parallel { workers } => *workers,
        }
    }
}

/// Worker pool size when none is configured
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Outcome of one schedule, by provider name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub fetched: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub interrupted: bool,
}

pub struct FetchScheduler {
    mode: FetchMode,
    control: FetchControl,
}

impl FetchScheduler {
    pub fn new(mode: FetchMode, control: FetchControl) -> Self {
        Self { mode, control }
    }

    /// Fetch every provider with requested channels and flush its programs.
    ///
    /// Only fatal errors (the sink) are returned; an interrupt is reported
    /// through [`ScheduleReport::interrupted`].
    pub async fn run(
        &self,
        providers: Vec<Provider>,
        writer: Arc<XmltvWriter>,
    ) -> AppResult<ScheduleReport> {
        let mut report = ScheduleReport::default();
        let mut pending = Vec::with_capacity(providers.len());
        for provider in providers {
            if provider.has_requested_channels() {
                pending.push(provider);
            } else {
                debug!("[{}] No requested channels, not fetching", provider.name());
                report.skipped.push(provider.name().to_string());
            }
        }

        info!(
            "Fetching programs for {} providers ({:?})",
            pending.len(),
            self.mode
        );
        match self.mode {
            FetchMode::Sequential => self.run_sequential(pending, &writer, &mut report).await?,
            FetchMode::Parallel { workers } => {
                self.run_parallel(pending, writer, workers, &mut report)
                    .await?
            }
        }

        if report.interrupted {
            warn!(
                "Fetch interrupted: {} providers written, {} failed",
                report.fetched.len(),
                report.failed.len()
            );
        } else {
            info!(
                "Fetch finished: {} providers written, {} failed, {} skipped",
                report.fetched.len(),
                report.failed.len(),
                report.skipped.len()
            );
        }
        Ok(report)
    }

    async fn run_sequential(
        &self,
        providers: Vec<Provider>,
        writer: &XmltvWriter,
        report: &mut ScheduleReport,
    ) -> AppResult<()> {
        for mut provider in providers {
            if self.control.cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let span = info_span!("provider", name = %provider.name());
            let result = provider
                .fetch_programs(false, writer, &self.control)
                .instrument(span)
                .await;
            if record_result(&provider, result, report)? {
                break;
            }
        }
        Ok(())
    }

    async fn run_parallel(
        &self,
        providers: Vec<Provider>,
        writer: Arc<XmltvWriter>,
        workers: usize,
        report: &mut ScheduleReport,
    ) -> AppResult<()> {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();
        // a panicked task loses its provider, so names are kept here
        let mut names = HashMap::new();

        for mut provider in providers {
            let permits = permits.clone();
            let writer = writer.clone();
            let control = self.control.clone();
            let name = provider.name().to_string();
            let span = info_span!("provider", name = %name);
            let handle = tasks.spawn(
                async move {
                    let result = match permits.acquire_owned().await {
                        Ok(_permit) => provider.fetch_programs(true, &writer, &control).await,
                        Err(_) => Err(AppError::internal("Worker pool closed")),
                    };
                    (provider, result)
                }
                .instrument(span),
            );
            names.insert(handle.id(), name);
        }

        loop {
            tokio::select! {
                biased;

                _ = self.control.cancel.cancelled() => {
                    debug!("Cancellation requested, aborting {} pending fetches", tasks.len());
                    tasks.abort_all();
                    report.interrupted = true;
                    break;
                }

                joined = tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((id, (mut provider, result))) => {
                            names.remove(&id);
                            let result = match result {
                                Ok(()) => provider.write_program_buffer(&writer).await,
                                Err(e) => Err(e),
                            };
                            // on interrupt the cancel branch ends the loop
                            if let Err(e) = record_result(&provider, result, report) {
                                tasks.abort_all();
                                return Err(e);
                            }
                        }
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => {
                            let name = names.remove(&e.id()).unwrap_or_default();
                            error!("[{}] Fetch task failed: {}", name, e);
                            report.failed.push(name);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Classify a provider's fetch result. Returns `Ok(true)` when the schedule
/// was interrupted, `Err` for fatal errors.
fn record_result(
    provider: &Provider,
    result: AppResult<()>,
    report: &mut ScheduleReport,
) -> AppResult<bool> {
    let name = provider.name().to_string();
    match result {
        Ok(()) => {
            report.fetched.push(name);
            Ok(false)
        }
        Err(AppError::Interrupted) => {
            debug!("[{}] Fetch interrupted", name);
            report.interrupted = true;
            Ok(true)
        }
        Err(e) if e.is_fatal() => {
            error!("[{}] Aborting: {}", name, e);
            Err(e)
        }
        Err(e) => {
            error!("[{}] Failed to fetch programs: {}", name, e);
            report.failed.push(name);
            Ok(false)
        }
    }
}
