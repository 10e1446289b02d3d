//! Audit request messages and the providers that deliver them.
//!
//! - **Message**: one immutable audit request
//! - **MessageProvider**: capability for polling, acknowledging and releasing
//!   messages from an external queue
//! - **classify**: maps provider errors onto the poll loop's reactions
//! - **RedisMessageProvider**: the production provider, backed by Redis lists

pub mod provider;
pub mod redis_queue;
pub mod types;

pub use provider::{classify, MessageProvider, PollErrorClass, ProviderConnector, ProviderError};
pub use redis_queue::{RedisConnector, RedisMessageProvider};
pub use types::{Delivery, Message, MessageError, RawMessage, Visibility, MAX_MESSAGE_BYTES};
