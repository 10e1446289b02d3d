//! Service lifecycle: startup, serving, graceful shutdown.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::{AuthClient, CredentialStore};
use crate::config::PollSettings;
use crate::error::{ConfigError, ServiceError, SourceError};
use crate::message::{Message, MessageProvider, ProviderConnector};
use crate::pipeline::{AuditPipeline, JobOutcome, ProcessConfig};

use super::dispatcher::{init_processes, Completion, DispatchStats};
use super::poll::{PollExit, PollLoop};

/// Default number of concurrent audits.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Default number of messages per poll.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Where the service is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Serving => write!(f, "serving"),
            LifecycleState::Draining => write!(f, "draining"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// How the service runs.
#[derive(Debug, Clone)]
pub enum RunMode {
    /// Poll the queue until the termination signal.
    Service,
    /// Process exactly one message outside the queue machinery.
    Single(Message),
}

/// What a completed run produced.
#[derive(Debug)]
pub enum RunOutput {
    Single(JobOutcome),
    Service(DispatchStats),
}

/// Where the service gets its message provider.
enum ProviderSource {
    Ready(Arc<dyn MessageProvider>),
    Connect(Arc<dyn ProviderConnector>),
}

/// The audit worker.
pub struct Service {
    process: ProcessConfig,
    auth: Arc<dyn AuthClient>,
    credentials: CredentialStore,
    provider: Option<ProviderSource>,
    max_concurrent: usize,
    batch_size: usize,
    poll: PollSettings,
    state: watch::Sender<LifecycleState>,
}

impl Service {
    /// Creates a service. `credentials` should be the same store the
    /// configured payloaders read from.
    pub fn new(
        process: ProcessConfig,
        auth: Arc<dyn AuthClient>,
        credentials: CredentialStore,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            process,
            auth,
            credentials,
            provider: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            batch_size: DEFAULT_BATCH_SIZE,
            poll: PollSettings::default(),
            state,
        }
    }

    /// Uses an already open provider.
    pub fn with_provider(mut self, provider: Arc<dyn MessageProvider>) -> Self {
        self.provider = Some(ProviderSource::Ready(provider));
        self
    }

    /// Opens the provider through `connector` once startup checks pass.
    pub fn with_connector(mut self, connector: Arc<dyn ProviderConnector>) -> Self {
        self.provider = Some(ProviderSource::Connect(connector));
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Subscribes to lifecycle changes.
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Runs the service to completion.
    ///
    /// Validates configuration and obtains the first credential before
    /// anything else; either failing aborts the run before any poll. In
    /// service mode the run lasts until `shutdown` is cancelled or a
    /// critical failure occurs, and returns only after admitted audits have
    /// finished.
    pub async fn run(&self, mode: RunMode, shutdown: CancellationToken) -> Result<RunOutput, ServiceError> {
        let result = self.run_inner(mode, shutdown).await;
        self.set_state(LifecycleState::Stopped);
        result
    }

    async fn run_inner(
        &self,
        mode: RunMode,
        shutdown: CancellationToken,
    ) -> Result<RunOutput, ServiceError> {
        self.set_state(LifecycleState::Starting);
        self.process.validate()?;
        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max concurrent audits".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }

        if let Err(e) = self.credentials.refresh(self.auth.as_ref()).await {
            error!(error = %e, "Failed to obtain reporting API credential");
            return Err(e.into());
        }

        match mode {
            RunMode::Single(message) => self.run_single(message).await,
            RunMode::Service => self.run_service(shutdown).await,
        }
    }

    async fn run_single(&self, message: Message) -> Result<RunOutput, ServiceError> {
        let pipeline = AuditPipeline::new(self.process.clone())?;
        self.set_state(LifecycleState::Serving);
        info!(source = %message.source_url, target = %message.response_target, "Running single audit");

        let outcome = pipeline.run(&message).await;
        Ok(RunOutput::Single(outcome))
    }

    async fn run_service(&self, shutdown: CancellationToken) -> Result<RunOutput, ServiceError> {
        let provider = match self.provider.as_ref().ok_or(SourceError)? {
            ProviderSource::Ready(provider) => provider.clone(),
            ProviderSource::Connect(connector) => connector.connect().await.map_err(|e| {
                error!(error = %e, "Failed to connect to the message provider");
                ServiceError::Provider(e)
            })?,
        };

        // Service-internal stop signal: fires on shutdown or on a critical failure.
        let cancel = shutdown.child_token();

        let in_flight = self.max_concurrent + self.batch_size.max(1);
        let (tx, rx) = mpsc::channel(in_flight);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let dispatcher = init_processes(Some(rx), self.process.clone(), self.max_concurrent)?
            .with_completions(completion_tx);

        let acker = spawn_acker(provider.clone(), completion_rx);
        let dispatch = dispatcher.spawn(cancel.clone());
        let poller = PollLoop::new(provider, tx, in_flight, self.poll).spawn(cancel.clone());

        self.set_state(LifecycleState::Serving);
        info!(max_concurrent = self.max_concurrent, "Service started");

        cancel.cancelled().await;
        self.set_state(LifecycleState::Draining);
        info!("Shutdown requested, draining in-flight audits");

        let poll_exit = poller.await?;
        let stats = dispatch.await?;
        acker.await?;

        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            released = stats.released,
            "Service stopped"
        );

        if let PollExit::Critical(reason) = poll_exit {
            return Err(ServiceError::Critical(reason));
        }
        if let Some(reason) = &stats.critical {
            return Err(ServiceError::Critical(reason.clone()));
        }
        Ok(RunOutput::Service(stats))
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.send_replace(state);
    }
}

/// Turns completion events into provider acknowledgements.
///
/// Finished messages are acked whatever their outcome; released messages go
/// back to the queue. Ends once every completion sender is gone.
fn spawn_acker(
    provider: Arc<dyn MessageProvider>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(completion) = completions.recv().await {
            match completion {
                Completion::Finished { delivery, outcome } => {
                    let Some(receipt) = delivery.receipt.as_deref() else {
                        continue;
                    };
                    if let Err(e) = provider.ack(receipt).await {
                        warn!(job_id = %outcome.job_id, error = %e, "Failed to acknowledge message");
                    }
                }
                Completion::Released { delivery } => {
                    let Some(receipt) = delivery.receipt.as_deref() else {
                        continue;
                    };
                    if let Err(e) = provider.release(receipt).await {
                        warn!(
                            source = %delivery.message.source_url,
                            error = %e,
                            "Failed to release message"
                        );
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_state_display() {
        assert_eq!(LifecycleState::Serving.to_string(), "serving");
        assert_eq!(LifecycleState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_state_starts_at_starting() {
        struct NoAuth;

        #[async_trait::async_trait]
        impl AuthClient for NoAuth {
            async fn authenticate(&self) -> Result<crate::auth::Credential, crate::auth::AuthError> {
                Err(crate::auth::AuthError::Unreachable("offline".to_string()))
            }
        }

        let service = Service::new(ProcessConfig::new(), Arc::new(NoAuth), CredentialStore::new());
        assert_eq!(*service.state().borrow(), LifecycleState::Starting);
    }
}
