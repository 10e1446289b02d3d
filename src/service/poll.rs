//! The poll loop: pulls messages from the provider into the message channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PollSettings;
use crate::message::{classify, Delivery, Message, MessageProvider, PollErrorClass, RawMessage};

/// Why the poll loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollExit {
    /// The termination signal was observed.
    Cancelled,
    /// The dispatcher stopped receiving.
    ChannelClosed,
    /// The provider returned an unrecoverable error.
    Critical(String),
}

/// Pulls batches from a [`MessageProvider`] and forwards them as deliveries.
///
/// The loop holds a bounded set of in-flight slots. Every forwarded
/// delivery carries one and gives it back once its pipeline finishes, so
/// the loop stops polling while enough work is already queued.
pub struct PollLoop {
    provider: Arc<dyn MessageProvider>,
    tx: mpsc::Sender<Delivery>,
    in_flight: Arc<Semaphore>,
    settings: PollSettings,
}

impl PollLoop {
    pub fn new(
        provider: Arc<dyn MessageProvider>,
        tx: mpsc::Sender<Delivery>,
        in_flight: usize,
        settings: PollSettings,
    ) -> Self {
        Self {
            provider,
            tx,
            in_flight: Arc::new(Semaphore::new(in_flight.max(1))),
            settings,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<PollExit> {
        tokio::spawn(self.run(cancel))
    }

    /// Polls until cancelled.
    ///
    /// Any exit other than cancellation also cancels `cancel`, so the rest
    /// of the service shuts down with it.
    pub async fn run(self, cancel: CancellationToken) -> PollExit {
        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            quota_backoff_ms = self.settings.quota_backoff.as_millis() as u64,
            "Poll loop started"
        );

        let exit = self.poll_until_stopped(&cancel).await;
        if exit != PollExit::Cancelled {
            cancel.cancel();
        }

        info!(exit = ?exit, "Poll loop stopped");
        exit
    }

    async fn poll_until_stopped(&self, cancel: &CancellationToken) -> PollExit {
        loop {
            // Don't poll unless at least one slot is free.
            let Some(slot) = self.acquire_slot(cancel).await else {
                return PollExit::Cancelled;
            };

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollExit::Cancelled,
                polled = self.provider.poll() => polled,
            };

            let batch = match polled {
                Ok(batch) => batch,
                Err(err) => {
                    drop(slot);
                    let class = classify(&err);
                    let delay = match class {
                        PollErrorClass::Transient => {
                            warn!(class = %class, error = %err, "Poll failed, retrying");
                            self.settings.interval
                        }
                        PollErrorClass::QuotaExceeded => {
                            warn!(
                                class = %class,
                                error = %err,
                                backoff_ms = self.settings.quota_backoff.as_millis() as u64,
                                "Provider quota exceeded, backing off"
                            );
                            self.settings.quota_backoff
                        }
                        PollErrorClass::MalformedMessage => {
                            warn!(class = %class, error = %err, "Dropped malformed message");
                            Duration::ZERO
                        }
                        PollErrorClass::Critical => {
                            error!(class = %class, error = %err, "Unrecoverable poll error, stopping");
                            return PollExit::Critical(err.to_string());
                        }
                    };
                    if !pause(delay, cancel).await {
                        return PollExit::Cancelled;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                drop(slot);
                if !pause(self.settings.interval, cancel).await {
                    return PollExit::Cancelled;
                }
                continue;
            }

            debug!(count = batch.len(), "Received messages");
            if let Some(exit) = self.forward(batch, slot, cancel).await {
                return exit;
            }
        }
    }

    /// Forwards one batch, taking a slot per message.
    ///
    /// On shutdown, messages not yet forwarded are released back to the
    /// provider.
    async fn forward(
        &self,
        batch: Vec<RawMessage>,
        first_slot: OwnedSemaphorePermit,
        cancel: &CancellationToken,
    ) -> Option<PollExit> {
        let mut spare = Some(first_slot);
        let mut pending = batch.into_iter();

        while let Some(raw) = pending.next() {
            let message = match Message::decode(&raw.body) {
                Ok(message) => message,
                Err(err) => {
                    warn!(
                        class = %PollErrorClass::MalformedMessage,
                        error = %err,
                        "Dropping malformed message"
                    );
                    if let Err(e) = self.provider.ack(&raw.receipt).await {
                        warn!(error = %e, "Failed to drop malformed message");
                    }
                    continue;
                }
            };

            let slot = match spare.take() {
                Some(slot) => slot,
                None => match self.acquire_slot(cancel).await {
                    Some(slot) => slot,
                    None => {
                        self.release_all(std::iter::once(raw).chain(pending)).await;
                        return Some(PollExit::Cancelled);
                    }
                },
            };

            let delivery = Delivery::new(message)
                .with_receipt(raw.receipt)
                .with_slot(slot);
            if let Err(mpsc::error::SendError(mut delivery)) = self.tx.send(delivery).await {
                delivery.release_slot();
                if let Some(receipt) = delivery.receipt.take() {
                    self.release(&receipt).await;
                }
                self.release_all(pending).await;
                return Some(if cancel.is_cancelled() {
                    PollExit::Cancelled
                } else {
                    PollExit::ChannelClosed
                });
            }
        }
        None
    }

    async fn acquire_slot(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            slot = self.in_flight.clone().acquire_owned() => slot.ok(),
        }
    }

    async fn release_all(&self, messages: impl Iterator<Item = RawMessage>) {
        for raw in messages {
            self.release(&raw.receipt).await;
        }
    }

    async fn release(&self, receipt: &str) {
        if let Err(e) = self.provider.release(receipt).await {
            warn!(error = %e, "Failed to release message");
        }
    }
}

/// Sleeps for `delay`; returns `false` if cancelled first.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
