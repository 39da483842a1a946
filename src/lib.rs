//! parley: a terminal chat client for the Mistral and OpenAI chat-completions
//! APIs.
//!
//! The library decodes streamed replies into text deltas as they arrive,
//! counts tokens per message with provider-specific rules, and keeps an
//! append-only conversation with an exact running token total.
//!
//! ```no_run
//! # async fn run() -> parley::Result<()> {
//! use std::sync::atomic::AtomicBool;
//! use parley::{Client, Conversation, Credentials, KeyStore, Message, PlainTextRenderer, Provider};
//!
//! let provider = Provider::Mistral;
//! let credentials = Credentials::new(provider, None, KeyStore::new("/home/me/.parley/keys"));
//! let client = Client::new(provider, credentials)?;
//!
//! let mut conversation = Conversation::new();
//! conversation.add(Message::user(provider, "user", "Hello!", "mistral-small-latest")?);
//!
//! let mut renderer = PlainTextRenderer::new();
//! let interrupted = AtomicBool::new(false);
//! let outcome = client
//!     .exchange("mistral-small-latest", &conversation, true, &mut renderer, &interrupted)
//!     .await?;
//! conversation.add(outcome.into_reply());
//! # Ok(())
//! # }
//! ```

// Public modules
pub mod chat;
pub mod client;
pub mod conversation;
pub mod error;
pub mod keys;
pub mod message;
pub mod provider;
pub mod render;
pub mod spinner;
pub mod sse;
pub mod storage;
pub mod tokenizer;

mod observability;

// Re-exports
pub use client::{Client, Exchange, StatusClass, check_status, extract_content};
pub use conversation::{Conversation, Summary};
pub use error::{Error, Result};
pub use keys::{Credentials, KeyStore};
pub use message::{Message, WireMessage};
pub use observability::register_biometrics;
pub use provider::{ErrorEnvelope, Provider};
pub use render::{PlainTextRenderer, Renderer};
pub use spinner::Spinner;
pub use sse::{StreamLine, decode_line, process_sse};
pub use storage::Storage;
pub use tokenizer::{TokenCounter, count_tokens};
