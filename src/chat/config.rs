//! Configuration types for the chat application.
//!
//! This module provides CLI argument parsing via `arrrg`, the resolved
//! per-session configuration, and the on-disk layout under the parley home.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use arrrg_derive::CommandLine;

use crate::error::{Error, Result};
use crate::keys::KeyStore;
use crate::provider::Provider;
use crate::storage::Storage;

/// Environment variable overriding the parley home directory.
pub const HOME_ENV: &str = "PARLEY_HOME";

/// Home directory name used under the user's home when `PARLEY_HOME` is unset.
pub const DEFAULT_HOME_DIR: &str = ".parley";

/// Command-line options for the parley tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    /// Model to use.
    #[arrrg(optional, "Model to use (default depends on the provider)", "MODEL")]
    pub model: Option<String>,

    /// Role attached to typed messages.
    #[arrrg(optional, "Role for your messages (default: user)", "ROLE")]
    pub role: Option<String>,

    /// System prompt sent before the first message.
    #[arrrg(optional, "System prompt for the conversation", "PROMPT")]
    pub system: Option<String>,

    /// Wait for whole replies instead of streaming them.
    #[arrrg(flag, "Print replies only once complete")]
    pub no_stream: bool,

    /// Send each message without earlier ones.
    #[arrrg(flag, "Do not retain conversation context between messages")]
    pub no_context: bool,

    /// Persist the conversation when the session ends.
    #[arrrg(flag, "Save the conversation under the parley home")]
    pub store: bool,

    /// Text file added to the conversation before the first message.
    #[arrrg(optional, "Add a UTF-8 text file as context", "PATH")]
    pub file: Option<String>,

    /// Stored conversation to resume, or `latest` for the newest one.
    #[arrrg(optional, "Resume a saved conversation file (or \"latest\")", "PATH")]
    pub load: Option<String>,

    /// Disable ANSI colors and the thinking spinner.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,

    /// Debug logging to stderr.
    #[arrrg(flag, "Enable debug logging")]
    pub verbose: bool,
}

/// What the binary was asked to do.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// One prompt, one reply.
    Ask,
    /// Interactive session.
    Chat,
    /// Install an API key.
    Key,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ask" => Ok(Mode::Ask),
            "chat" => Ok(Mode::Chat),
            "key" => Ok(Mode::Key),
            _ => Err(Error::validation(
                format!("unknown mode {s:?} (expected ask, chat, or key)"),
                Some("mode".to_string()),
            )),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Ask => "ask",
            Mode::Chat => "chat",
            Mode::Key => "key",
        })
    }
}

/// The positional part of the command line: `<provider> <mode> [PROMPT...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// The provider to talk to.
    pub provider: Provider,
    /// The requested mode.
    pub mode: Mode,
    /// Remaining words, joined by single spaces.
    pub text: Option<String>,
}

impl Invocation {
    /// Parses the free arguments left over after option parsing.
    pub fn parse(free: &[String]) -> Result<Self> {
        let [provider, mode, rest @ ..] = free else {
            return Err(Error::validation(
                "expected <mistral|openai> <ask|chat|key> [PROMPT...]",
                None,
            ));
        };
        let text = (!rest.is_empty()).then(|| rest.join(" "));
        Ok(Self {
            provider: provider.parse()?,
            mode: mode.parse()?,
            text,
        })
    }
}

/// Locations under the parley home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    /// Uses `home` as the parley home.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// `$PARLEY_HOME`, or `.parley` under the user's home directory.
    pub fn discover() -> Result<Self> {
        if let Some(home) = env::var_os(HOME_ENV).filter(|h| !h.is_empty()) {
            return Ok(Self::new(home));
        }
        let Some(user_home) = dirs::home_dir() else {
            return Err(Error::validation(
                format!("cannot locate a home directory; set {HOME_ENV}"),
                Some(HOME_ENV.to_string()),
            ));
        };
        Ok(Self::new(user_home.join(DEFAULT_HOME_DIR)))
    }

    /// The parley home directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Directory of API key files.
    pub fn keys_dir(&self) -> PathBuf {
        self.home.join("keys")
    }

    /// Directory of persisted conversations.
    pub fn conversations_dir(&self) -> PathBuf {
        self.home.join("conversations")
    }

    /// A key store over [`Paths::keys_dir`].
    pub fn key_store(&self) -> KeyStore {
        KeyStore::new(self.keys_dir())
    }

    /// Conversation storage over [`Paths::conversations_dir`].
    pub fn storage(&self) -> Storage {
        Storage::new(self.conversations_dir())
    }
}

/// Configuration for a chat session.
///
/// This struct holds the resolved configuration values after processing
/// command-line arguments with appropriate defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// The provider every request goes to.
    pub provider: Provider,

    /// The model to use for generating responses.
    pub model: String,

    /// Role attached to typed messages.
    pub role: String,

    /// Optional system prompt to set conversation context.
    pub system_prompt: Option<String>,

    /// Whether replies are streamed.
    pub stream: bool,

    /// Whether earlier messages are sent with each request.
    pub keep_context: bool,

    /// Whether the conversation is persisted.
    pub store: bool,

    /// File added to the conversation before the first message.
    pub file: Option<PathBuf>,

    /// Stored conversation to resume.
    pub load: Option<PathBuf>,

    /// Whether to use ANSI colors and styles in output.
    pub use_color: bool,
}

impl ChatConfig {
    /// Creates a new ChatConfig with default values for `provider`.
    ///
    /// Defaults: the provider's default model, the `user` role, streaming
    /// on, context retained, nothing stored, color enabled.
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            model: provider.default_model().to_string(),
            role: provider.user_role().to_string(),
            system_prompt: None,
            stream: true,
            keep_context: true,
            store: false,
            file: None,
            load: None,
            use_color: true,
        }
    }

    /// Resolves command-line options against the defaults for `provider`.
    pub fn from_args(provider: Provider, args: ChatArgs) -> Self {
        let defaults = Self::new(provider);
        Self {
            model: args.model.unwrap_or(defaults.model),
            role: args.role.unwrap_or(defaults.role),
            system_prompt: args.system,
            stream: !args.no_stream,
            keep_context: !args.no_context,
            store: args.store,
            file: args.file.map(PathBuf::from),
            load: args.load.map(PathBuf::from),
            use_color: !args.no_color,
            provider,
        }
    }

    /// Sets the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the role for typed messages.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Sets the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Waits for whole replies.
    pub fn without_stream(mut self) -> Self {
        self.stream = false;
        self
    }

    /// Sends each message on its own.
    pub fn without_context(mut self) -> Self {
        self.keep_context = false;
        self
    }

    /// Persists the conversation.
    pub fn with_store(mut self) -> Self {
        self.store = true;
        self
    }

    /// Disables ANSI color output.
    pub fn without_color(mut self) -> Self {
        self.use_color = false;
        self
    }
}
