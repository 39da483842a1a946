//! Core chat session management.
//!
//! This module provides the `ChatSession` struct which owns the conversation
//! and runs exchanges through the client.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use tracing::{debug, info};

use crate::chat::config::ChatConfig;
use crate::client::{Client, Exchange};
use crate::conversation::Conversation;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::provider::Provider;
use crate::render::Renderer;
use crate::storage::{self, Storage};
use crate::tokenizer;

/// `--load` value that resumes the newest stored conversation.
pub const LOAD_LATEST: &str = "latest";

/// A chat session that owns the conversation and the client.
pub struct ChatSession {
    client: Client,
    config: ChatConfig,
    storage: Storage,
    conversation: Conversation,
    requests: u64,
    replies: u64,
    failures: u64,
    cancelled: u64,
}

/// Aggregated stats for a chat session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    /// The provider every request goes to.
    pub provider: Provider,
    /// The model used for the session.
    pub model: String,
    /// The number of messages in the conversation.
    pub message_count: usize,
    /// Running token total of the conversation.
    pub tokens: u64,
    /// Exchanges attempted.
    pub requests: u64,
    /// Exchanges that produced a reply.
    pub replies: u64,
    /// Exchanges that ended in an error.
    pub failures: u64,
    /// Exchanges the user interrupted.
    pub cancelled: u64,
    /// Whether replies are streamed.
    pub stream: bool,
    /// Whether context is retained between messages.
    pub keep_context: bool,
}

impl ChatSession {
    /// Creates a new chat session.
    ///
    /// # Errors
    ///
    /// Fails when the configured role or model cannot be used with the
    /// configured provider, before anything is sent.
    pub fn new(client: Client, config: ChatConfig, storage: Storage) -> Result<Self> {
        if client.provider() != config.provider {
            return Err(Error::validation(
                format!(
                    "client talks to {} but the session is configured for {}",
                    client.provider(),
                    config.provider
                ),
                Some("provider".to_string()),
            ));
        }
        if !config.provider.accepts_role(&config.role) {
            return Err(Error::validation(
                format!("{} does not accept role {:?}", config.provider, config.role),
                Some("role".to_string()),
            ));
        }
        tokenizer::count_tokens(config.provider, &config.model, &config.role, "", false)?;
        let mut session = Self {
            client,
            config,
            storage,
            conversation: Conversation::new(),
            requests: 0,
            replies: 0,
            failures: 0,
            cancelled: 0,
        };
        session.seed()?;
        Ok(session)
    }

    /// Applies the configured `--load` and `--file` options.
    ///
    /// `--load latest` resumes the most recently persisted conversation.
    pub fn prepare(&mut self) -> Result<()> {
        if let Some(path) = self.config.load.clone() {
            let path = if path.as_os_str() == LOAD_LATEST {
                self.storage.latest()?.ok_or_else(|| {
                    Error::validation(
                        format!("no stored conversations in {}", self.storage.dir().display()),
                        Some("load".to_string()),
                    )
                })?
            } else {
                path
            };
            self.load(&path)?;
        }
        if let Some(path) = self.config.file.clone() {
            self.ingest_file(&path)?;
        }
        Ok(())
    }

    fn seed(&mut self) -> Result<()> {
        if let Some(prompt) = &self.config.system_prompt {
            let message =
                Message::user(self.config.provider, "system", prompt.as_str(), &self.config.model)?;
            self.conversation.add(message);
        }
        Ok(())
    }

    /// Sends `input` and adds the reply, if any, to the conversation.
    ///
    /// With context retention off the conversation is reset afterwards, after
    /// being persisted if storing is on.
    ///
    /// # Errors
    ///
    /// Configuration, decode, and contract errors. Network and provider
    /// failures come back as [`Exchange::Failed`].
    pub async fn send(
        &mut self,
        input: &str,
        renderer: &mut dyn Renderer,
        interrupted: &AtomicBool,
    ) -> Result<Exchange> {
        let message = Message::user(
            self.config.provider,
            self.config.role.as_str(),
            input,
            &self.config.model,
        )?;
        self.conversation.add(message);
        self.requests += 1;

        let result = self
            .client
            .exchange(
                &self.config.model,
                &self.conversation,
                self.config.stream,
                renderer,
                interrupted,
            )
            .await;
        match &result {
            Ok(Exchange::Reply(reply)) => {
                self.replies += 1;
                self.conversation.add(reply.clone());
            }
            Ok(Exchange::Cancelled) => {
                self.cancelled += 1;
                self.conversation.add(None);
            }
            Ok(Exchange::Failed(_)) | Err(_) => {
                self.failures += 1;
                self.conversation.add(None);
            }
        }
        debug!(
            conversation = %self.conversation.id(),
            messages = self.conversation.len(),
            tokens = self.conversation.tokens(),
            "exchange finished"
        );

        // Flush on every outcome, errors included.
        if !self.config.keep_context {
            if self.config.store {
                self.persist()?;
            }
            self.reset()?;
        }
        result
    }

    /// Forgets the conversation, keeping only the system prompt.
    pub fn reset(&mut self) -> Result<()> {
        self.conversation.flush();
        self.seed()
    }

    /// Adds the contents of a UTF-8 text file as one user message.
    pub fn ingest_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)
            .map_err(|err| Error::io(format!("failed to read {}", path.display()), err))?;
        let message = Message::user(
            self.config.provider,
            self.config.provider.user_role(),
            content,
            &self.config.model,
        )?;
        info!(
            path = %path.display(),
            tokens = message.tokens(),
            "added file to conversation"
        );
        self.conversation.add(message);
        Ok(())
    }

    /// Replaces the conversation with one loaded from disk.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.conversation = storage::load(path)?;
        info!(
            path = %path.display(),
            messages = self.conversation.len(),
            "resumed conversation"
        );
        Ok(())
    }

    /// Writes the conversation to a new file in storage.
    pub fn persist(&self) -> Result<PathBuf> {
        self.storage.persist(&self.conversation)
    }

    /// Persists the conversation at the end of a session if storing is on and
    /// there is something worth keeping.
    pub fn finish(&self) -> Result<Option<PathBuf>> {
        if !self.config.store || !self.config.keep_context || self.replies == 0 {
            return Ok(None);
        }
        self.persist().map(Some)
    }

    /// The conversation so far.
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// The session configuration.
    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Returns the current model.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Returns the current session statistics snapshot.
    pub fn stats(&self) -> SessionStats {
        let summary = self.conversation.summary();
        SessionStats {
            provider: self.config.provider,
            model: self.config.model.clone(),
            message_count: summary.count,
            tokens: summary.tokens,
            requests: self.requests,
            replies: self.replies,
            failures: self.failures,
            cancelled: self.cancelled,
            stream: self.config.stream,
            keep_context: self.config.keep_context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{Credentials, KeyStore};

    fn open_session(config: ChatConfig, home: &Path) -> Result<ChatSession> {
        let credentials =
            Credentials::new(config.provider, Some("test-key".to_string()), KeyStore::new(home));
        let client = Client::new(config.provider, credentials)?;
        ChatSession::new(client, config, Storage::new(home.join("conversations")))
    }

    #[test]
    fn new_session_empty() {
        let dir = tempfile::tempdir().unwrap();
        let session = open_session(ChatConfig::new(Provider::OpenAI), dir.path()).unwrap();
        assert!(session.conversation().is_empty());
        assert_eq!(session.model(), Provider::OpenAI.default_model());
        assert_eq!(session.stats().requests, 0);
    }

    #[test]
    fn system_prompt_survives_reset() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatConfig::new(Provider::OpenAI).with_system_prompt("Be brief.");
        let mut session = open_session(config, dir.path()).unwrap();
        assert_eq!(session.conversation().len(), 1);
        let tokens = session.conversation().tokens();

        session.ingest_file(&write_file(dir.path(), "notes.txt", "some notes")).unwrap();
        assert_eq!(session.conversation().len(), 2);

        session.reset().unwrap();
        assert_eq!(session.conversation().len(), 1);
        assert_eq!(session.conversation().tokens(), tokens);
        assert_eq!(session.conversation().iter().next().unwrap().role(), "system");
    }

    #[test]
    fn rejects_unknown_model_and_role() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatConfig::new(Provider::OpenAI).with_model("not-a-model");
        assert!(open_session(config, dir.path()).err().unwrap().is_configuration());

        let config = ChatConfig::new(Provider::Mistral).with_role("developer");
        assert!(open_session(config, dir.path()).err().unwrap().is_validation());
    }

    #[test]
    fn ingest_file_adds_user_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = open_session(ChatConfig::new(Provider::Mistral), dir.path()).unwrap();
        let path = write_file(dir.path(), "context.txt", "Ünïcödé context");
        session.ingest_file(&path).unwrap();
        let message = session.conversation().iter().last().unwrap();
        assert_eq!(message.role(), "user");
        assert_eq!(message.content(), "Ünïcödé context");
        assert!(!message.is_reply());
        assert!(session.ingest_file(&dir.path().join("absent.txt")).is_err());
    }

    #[test]
    fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatConfig::new(Provider::OpenAI).with_system_prompt("Be brief.");
        let mut session = open_session(config, dir.path()).unwrap();
        session.ingest_file(&write_file(dir.path(), "a.txt", "alpha")).unwrap();
        let path = session.persist().unwrap();

        let mut resumed = open_session(ChatConfig::new(Provider::OpenAI), dir.path())
            .unwrap();
        resumed.load(&path).unwrap();
        assert_eq!(resumed.stats().message_count, 2);
        assert_eq!(resumed.stats().tokens, session.stats().tokens);
    }

    #[test]
    fn load_latest_resumes_newest_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("conversations"));
        let older = Conversation::from_messages([Message::user(
            Provider::OpenAI,
            "user",
            "older",
            "gpt-4o",
        )
        .unwrap()]);
        let newer = Conversation::from_messages([
            Message::user(Provider::OpenAI, "user", "newer", "gpt-4o").unwrap(),
            Message::reply(Provider::OpenAI, "reply", "gpt-4o").unwrap(),
        ]);
        storage
            .persist_at(&older, time::macros::datetime!(2024-01-01 00:00:00 UTC))
            .unwrap();
        storage
            .persist_at(&newer, time::macros::datetime!(2024-02-01 00:00:00 UTC))
            .unwrap();

        let mut config = ChatConfig::new(Provider::OpenAI);
        config.load = Some(PathBuf::from(LOAD_LATEST));
        let mut session = open_session(config, dir.path()).unwrap();
        session.prepare().unwrap();
        assert_eq!(session.conversation().len(), 2);
        assert_eq!(session.conversation().iter().next().unwrap().content(), "newer");
    }

    #[test]
    fn load_latest_without_history_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ChatConfig::new(Provider::Mistral);
        config.load = Some(PathBuf::from(LOAD_LATEST));
        let mut session = open_session(config, dir.path()).unwrap();
        assert!(session.prepare().unwrap_err().is_validation());
    }

    #[test]
    fn finish_skips_empty_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatConfig::new(Provider::OpenAI).with_store();
        let session = open_session(config, dir.path()).unwrap();
        assert_eq!(session.finish().unwrap(), None);
    }

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }
}
