//! Dispatch of received messages into gated pipeline runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, ServiceError, SourceError};
use crate::message::{Delivery, Message};
use crate::pipeline::{AuditPipeline, JobOutcome, ProcessConfig};

use super::gate::ConcurrencyGate;

/// What happened to a delivery the dispatcher received.
#[derive(Debug)]
pub enum Completion {
    /// The pipeline ran to a terminal outcome; the message is done.
    Finished {
        delivery: Delivery,
        outcome: JobOutcome,
    },
    /// The message was never admitted because shutdown began.
    Released { delivery: Delivery },
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages admitted through the gate.
    pub admitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Messages handed back unprocessed at shutdown.
    pub released: u64,
    /// Highest number of pipelines observed running at once.
    pub peak_in_flight: u64,
    /// Set when a job outcome forced the service to stop.
    pub critical: Option<String>,
}

impl DispatchStats {
    pub fn total_finished(&self) -> u64 {
        self.succeeded + self.failed
    }
}

#[derive(Default)]
struct SharedDispatchStats {
    admitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    released: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
    total_duration_ms: AtomicU64,
    critical: OnceLock<String>,
}

impl SharedDispatchStats {
    fn record_start(&self) {
        self.admitted.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn record_finish(&self, outcome: &JobOutcome) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(outcome.duration_ms, Ordering::SeqCst);
        if outcome.is_success() {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn average_duration(&self) -> Duration {
        let finished = self.succeeded.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst);
        if finished == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / finished)
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            admitted: self.admitted.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            critical: self.critical.get().cloned(),
        }
    }
}

/// Validates a process configuration and binds a dispatcher to `source`.
///
/// The configuration is checked first, so a missing field is reported even
/// when the source is also missing.
///
/// # Errors
///
/// - `ServiceError::Config` if a required field is missing or
///   `max_concurrent` is zero
/// - `ServiceError::Source` if no source channel is supplied
pub fn init_processes(
    source: Option<mpsc::Receiver<Delivery>>,
    config: ProcessConfig,
    max_concurrent: usize,
) -> Result<Dispatcher, ServiceError> {
    config.validate()?;
    let source = source.ok_or(SourceError)?;
    if max_concurrent == 0 {
        return Err(ConfigError::InvalidValue {
            key: "max concurrent audits".to_string(),
            message: "must be at least 1".to_string(),
        }
        .into());
    }

    let pipeline = AuditPipeline::new(config)?;
    Ok(Dispatcher {
        source,
        pipeline: Arc::new(pipeline),
        gate: ConcurrencyGate::new(max_concurrent),
        completions: None,
        stats: Arc::new(SharedDispatchStats::default()),
    })
}

/// Receives deliveries and runs each through the pipeline under a gate token.
pub struct Dispatcher {
    source: mpsc::Receiver<Delivery>,
    pipeline: Arc<AuditPipeline>,
    gate: ConcurrencyGate,
    completions: Option<mpsc::UnboundedSender<Completion>>,
    stats: Arc<SharedDispatchStats>,
}

impl Dispatcher {
    /// Publishes a [`Completion`] for every delivery received.
    pub fn with_completions(mut self, tx: mpsc::UnboundedSender<Completion>) -> Self {
        self.completions = Some(tx);
        self
    }

    /// Runs the dispatcher on its own task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<DispatchStats> {
        tokio::spawn(self.run(cancel))
    }

    /// Dispatches until `cancel` fires or the source closes, then waits for
    /// every admitted pipeline to finish.
    ///
    /// Deliveries still queued in the source at cancellation are published
    /// as [`Completion::Released`].
    pub async fn run(mut self, cancel: CancellationToken) -> DispatchStats {
        info!(
            max_concurrent = self.gate.capacity(),
            targets = ?self.pipeline.targets(),
            "Dispatcher started"
        );
        let mut tasks = JoinSet::new();

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(joined);
                    continue;
                }
                received = self.source.recv() => match received {
                    Some(delivery) => delivery,
                    None => {
                        debug!("Message source closed");
                        break;
                    }
                },
            };

            let token = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.release(delivery);
                    break;
                }
                token = self.gate.acquire() => match token {
                    Ok(token) => token,
                    Err(_) => {
                        self.release(delivery);
                        break;
                    }
                },
            };

            self.stats.record_start();
            let pipeline = self.pipeline.clone();
            let stats = self.stats.clone();
            let completions = self.completions.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let mut delivery = delivery;
                let outcome = run_isolated(pipeline, &delivery.message).await;
                stats.record_finish(&outcome);
                drop(token);
                delivery.release_slot();

                if let Some(cause) = outcome.cause.as_ref().filter(|c| c.is_critical()) {
                    error!(
                        job_id = %outcome.job_id,
                        cause = cause.cause(),
                        "Reporting credential lost, stopping service"
                    );
                    let _ = stats.critical.set(cause.to_string());
                    cancel.cancel();
                }

                if let Some(tx) = completions {
                    let _ = tx.send(Completion::Finished { delivery, outcome });
                }
            });
        }

        // Hand back anything received but never admitted.
        self.source.close();
        while let Some(delivery) = self.source.recv().await {
            self.release(delivery);
        }

        let running = tasks.len();
        if running > 0 {
            info!(running, "Waiting for in-flight audits to finish");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }

        let stats = self.stats.snapshot();
        info!(
            admitted = stats.admitted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            released = stats.released,
            average_duration_ms = self.stats.average_duration().as_millis() as u64,
            "Dispatcher stopped"
        );
        stats
    }

    fn release(&self, delivery: Delivery) {
        debug!(source = %delivery.message.source_url, "Releasing unadmitted message");
        self.stats.record_release();
        if let Some(tx) = &self.completions {
            let _ = tx.send(Completion::Released { delivery });
        }
    }
}

/// Runs the pipeline on its own task so a panicking collaborator still
/// yields a terminal outcome for the message.
async fn run_isolated(pipeline: Arc<AuditPipeline>, message: &Message) -> JobOutcome {
    let started = Instant::now();
    let owned = message.clone();
    match tokio::spawn(async move { pipeline.run(&owned).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let reason = if e.is_panic() {
                "audit task panicked"
            } else {
                "audit task was cancelled"
            };
            error!(source = %message.source_url, error = %e, "{}", reason);
            JobOutcome::aborted(message, reason, started.elapsed())
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "Audit task did not complete");
    }
}
