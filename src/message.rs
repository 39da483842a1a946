//! A single chat message and its two serialized views.
//!
//! The reduced view (`role` and `content`) is what goes on the wire; the full
//! view carries everything needed to reload a conversation without recounting
//! tokens.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::provider::Provider;
use crate::tokenizer::count_tokens;

static NEXT_INDEX: AtomicU64 = AtomicU64::new(0);

fn next_index() -> u64 {
    NEXT_INDEX.fetch_add(1, Ordering::Relaxed)
}

fn now_epoch_seconds() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

/// One unit of a conversation, written by the user or by the model.
///
/// Messages are never mutated; a changed message is a new message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    created: f64,
    uuid: Uuid,
    role: String,
    content: String,
    model: String,
    provider: Provider,
    is_reply: bool,
    tokens: u32,
    index: u64,
}

/// The wire form of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WireMessage<'a> {
    /// The message role.
    pub role: &'a str,
    /// The message text.
    pub content: &'a str,
}

#[derive(Deserialize)]
struct StoredMessage {
    created: f64,
    uuid: Uuid,
    role: String,
    content: String,
    model: String,
    provider: Provider,
    is_reply: bool,
    tokens: u32,
}

impl Message {
    /// Creates a message typed by the user (or injected as context).
    ///
    /// # Errors
    ///
    /// Fails if `role` is not in the provider's role set, or if the tokenizer
    /// rejects `model`.
    pub fn user(
        provider: Provider,
        role: impl Into<String>,
        content: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        Self::build(provider, role.into(), content.into(), model.into(), false)
    }

    /// Creates a message holding a model reply.
    pub fn reply(
        provider: Provider,
        content: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let role = provider.assistant_role().to_string();
        Self::build(provider, role, content.into(), model.into(), true)
    }

    fn build(
        provider: Provider,
        role: String,
        content: String,
        model: String,
        is_reply: bool,
    ) -> Result<Self> {
        if !provider.accepts_role(&role) {
            return Err(Error::validation(
                format!("{provider} does not accept role {role:?}"),
                Some("role".to_string()),
            ));
        }
        let tokens = count_tokens(provider, &model, &role, &content, is_reply)?;
        Ok(Self {
            created: now_epoch_seconds(),
            uuid: Uuid::new_v4(),
            role,
            content,
            model,
            provider,
            is_reply,
            tokens,
            index: next_index(),
        })
    }

    /// Rebuilds a message from its full view.
    ///
    /// The stored token count is trusted. The sequence index is process-local,
    /// so the rebuilt message gets a fresh one.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `value` is not a JSON object and a
    /// serialization error when required fields are missing or mistyped.
    pub fn from_value(value: &Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::validation(
                format!("stored message must be a JSON object, got {}", json_kind(value)),
                None,
            ));
        }
        let stored = StoredMessage::deserialize(value).map_err(|e| {
            Error::serialization(format!("invalid stored message: {e}"), Some(Box::new(e)))
        })?;
        Ok(Self {
            created: stored.created,
            uuid: stored.uuid,
            role: stored.role,
            content: stored.content,
            model: stored.model,
            provider: stored.provider,
            is_reply: stored.is_reply,
            tokens: stored.tokens,
            index: next_index(),
        })
    }

    /// The reduced view sent to the provider.
    pub fn reduced_view(&self) -> WireMessage<'_> {
        WireMessage {
            role: &self.role,
            content: &self.content,
        }
    }

    /// The full view written to storage.
    pub fn full_view(&self) -> Value {
        json!({
            "created": self.created,
            "uuid": self.uuid,
            "role": self.role,
            "content": self.content,
            "model": self.model,
            "provider": self.provider,
            "is_reply": self.is_reply,
            "tokens": self.tokens,
            "index": self.index,
        })
    }

    /// Creation time in epoch seconds.
    pub fn created(&self) -> f64 {
        self.created
    }

    /// Unique identifier.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The message role.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// The message text.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// The model this message was written for or by.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The provider this message belongs to.
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// True when the model wrote this message.
    pub fn is_reply(&self) -> bool {
        self.is_reply
    }

    /// Token count, computed when the message was created.
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    /// Process-local sequence number.
    pub fn index(&self) -> u64 {
        self.index
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
