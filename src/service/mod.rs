//! The worker service.
//!
//! Three kinds of task cooperate, connected only by channels and the
//! [`ConcurrencyGate`]:
//!
//! - one [`PollLoop`] pulling messages from the provider into the message channel
//! - one [`Dispatcher`] admitting each message through the gate and spawning
//!   a pipeline run per message (at most N at once)
//! - the [`Service`] itself, which owns startup, waits for the termination
//!   signal, and drains in-flight work before returning
//!
//! A [`CancellationToken`](tokio_util::sync::CancellationToken) is the
//! termination signal. Every loop checks it at each suspension point.

pub mod dispatcher;
pub mod gate;
pub mod lifecycle;
pub mod poll;

pub use dispatcher::{init_processes, Completion, DispatchStats, Dispatcher};
pub use gate::{ConcurrencyGate, GateToken};
pub use lifecycle::{
    LifecycleState, RunMode, RunOutput, Service, DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONCURRENT,
};
pub use poll::{PollExit, PollLoop};
