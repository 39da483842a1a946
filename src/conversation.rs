//! The ordered message history of a chat session.

use std::slice;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::{Message, WireMessage};

/// Token and message totals for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Sum of the token counts of every message.
    pub tokens: u64,
    /// Number of messages.
    pub count: usize,
}

/// An append-only transcript with a running token total.
///
/// The running total always equals the sum of the contained messages' token
/// counts; [`Conversation::flush`] empties both.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: Uuid,
    messages: Vec<Message>,
    tokens: u64,
}

impl Conversation {
    /// Creates an empty conversation with a fresh session id.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            messages: Vec::new(),
            tokens: 0,
        }
    }

    /// Creates a conversation pre-populated with `messages`.
    pub fn from_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let mut conversation = Self::new();
        for message in messages {
            conversation.add(message);
        }
        conversation
    }

    /// Appends a message. Adding `None` is a logged no-op.
    pub fn add(&mut self, message: impl Into<Option<Message>>) {
        let Some(message) = message.into() else {
            debug!(conversation = %self.id, "no message to add");
            return;
        };
        self.tokens += u64::from(message.tokens());
        self.messages.push(message);
    }

    /// Drops every message and resets the token total.
    ///
    /// Used after each exchange when context retention is off, so each request
    /// carries only the newest user message.
    pub fn flush(&mut self) {
        debug!(
            conversation = %self.id,
            count = self.messages.len(),
            tokens = self.tokens,
            "flushing conversation"
        );
        self.messages.clear();
        self.tokens = 0;
    }

    /// The session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if there are no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Running token total.
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Iterates over the messages in insertion order.
    pub fn iter(&self) -> slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Reduced views of every message, in wire order.
    pub fn wire_messages(&self) -> Vec<WireMessage<'_>> {
        self.messages.iter().map(Message::reduced_view).collect()
    }

    /// Token and message totals.
    pub fn summary(&self) -> Summary {
        Summary {
            tokens: self.tokens,
            count: self.messages.len(),
        }
    }

    /// Serializes the conversation as `{"messages": [...], "summary": {...}}`.
    ///
    /// `indent` selects pretty printing with that many spaces; `None` emits a
    /// single line. Non-ASCII text is written verbatim.
    pub fn to_json(&self, indent: Option<usize>) -> Result<String> {
        let value = json!({
            "messages": self.messages.iter().map(Message::full_view).collect::<Vec<_>>(),
            "summary": self.summary(),
        });
        match indent {
            None => Ok(serde_json::to_string(&value)?),
            Some(width) => {
                let indent = vec![b' '; width];
                let mut out = Vec::new();
                let formatter = serde_json::ser::PrettyFormatter::with_indent(&indent);
                let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
                value.serialize(&mut serializer)?;
                String::from_utf8(out).map_err(|e| {
                    Error::encoding("serialized conversation is not UTF-8", Some(Box::new(e)))
                })
            }
        }
    }

    /// Parses the output of [`Conversation::to_json`].
    ///
    /// Token totals are re-derived from the messages; a stored summary that
    /// disagrees is logged and ignored.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Some(messages) = value.get("messages").and_then(Value::as_array) else {
            return Err(Error::serialization(
                "conversation JSON has no \"messages\" array",
                None,
            ));
        };
        let messages = messages
            .iter()
            .map(Message::from_value)
            .collect::<Result<Vec<_>>>()?;
        let conversation = Self::from_messages(messages);
        if let Some(stored) = value
            .get("summary")
            .and_then(|s| s.get("tokens"))
            .and_then(Value::as_u64)
            && stored != conversation.tokens
        {
            warn!(
                stored,
                derived = conversation.tokens,
                "stored token summary disagrees with messages"
            );
        }
        Ok(conversation)
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> IntoIterator for &'a Conversation {
    type Item = &'a Message;
    type IntoIter = slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
