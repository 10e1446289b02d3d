//! Audit request messages and their queue envelopes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;

/// Largest accepted message body, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Errors produced when a received payload fails its size or shape check.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Message is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Message field '{0}' is empty")]
    EmptyField(&'static str),
}

/// Requested visibility of an audit's results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(format!("expected 'public' or 'private', got '{}'", other)),
        }
    }
}

/// One audit request.
///
/// Never mutated after it is decoded; everything derived from processing it
/// lives in the pipeline's job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Human readable name of the package.
    #[serde(default)]
    pub title: String,
    /// Package slug, if the requester knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    /// URL or local path of the source archive.
    pub source_url: String,
    #[serde(default)]
    pub visibility: Visibility,
    /// Selects the payloader that reports the outcome.
    #[serde(alias = "payload_type")]
    pub response_target: String,
    /// Identifier of the client that requested the audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_client: Option<String>,
}

impl Message {
    pub fn new(
        source_url: impl Into<String>,
        visibility: Visibility,
        response_target: impl Into<String>,
    ) -> Self {
        Self {
            title: String::new(),
            slug: None,
            source_url: source_url.into(),
            visibility,
            response_target: response_target.into(),
            request_client: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn with_request_client(mut self, client: impl Into<String>) -> Self {
        self.request_client = Some(client.into());
        self
    }

    /// Decodes a queue payload, enforcing the size limit and required fields.
    pub fn decode(body: &str) -> Result<Self, MessageError> {
        if body.len() > MAX_MESSAGE_BYTES {
            return Err(MessageError::TooLarge {
                size: body.len(),
                limit: MAX_MESSAGE_BYTES,
            });
        }

        let message: Message = serde_json::from_str(body)?;
        if message.source_url.trim().is_empty() {
            return Err(MessageError::EmptyField("source_url"));
        }
        if message.response_target.trim().is_empty() {
            return Err(MessageError::EmptyField("response_target"));
        }

        Ok(message)
    }

    /// Encodes the message as a queue payload.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Name used in logs: the title when present, otherwise the source.
    pub fn display_name(&self) -> &str {
        if self.title.is_empty() {
            &self.source_url
        } else {
            &self.title
        }
    }
}

/// A payload exactly as the provider returned it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub body: String,
    /// Provider handle used to acknowledge or release the message.
    pub receipt: String,
}

impl RawMessage {
    pub fn new(body: impl Into<String>, receipt: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            receipt: receipt.into(),
        }
    }
}

/// A decoded message travelling from the poll loop to the dispatcher.
///
/// Holds one of the poll loop's in-flight slots, if any; the slot is freed
/// when the delivery is dropped, which happens after its pipeline finishes.
#[derive(Debug)]
pub struct Delivery {
    pub message: Message,
    /// Provider receipt; `None` for messages that did not come from a queue.
    pub receipt: Option<String>,
    slot: Option<OwnedSemaphorePermit>,
}

impl Delivery {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            receipt: None,
            slot: None,
        }
    }

    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }

    pub(crate) fn with_slot(mut self, slot: OwnedSemaphorePermit) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Frees the in-flight slot early, keeping the message and receipt.
    pub(crate) fn release_slot(&mut self) {
        self.slot = None;
    }
}
