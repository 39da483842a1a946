//! Interactive and single-shot chat on top of the client library.
//!
//! - [`config`]: CLI argument parsing, session configuration, home layout
//! - [`session`]: conversation ownership and exchanges
//! - [`commands`]: command and multiline parsing

mod commands;
mod config;
mod session;

pub use crate::render::{PlainTextRenderer, Renderer};
pub use commands::{ChatCommand, MULTILINE_DELIMITER, MultilineCapture, help_text, parse_command};
pub use config::{ChatArgs, ChatConfig, DEFAULT_HOME_DIR, HOME_ENV, Invocation, Mode, Paths};
pub use session::{ChatSession, LOAD_LATEST, SessionStats};
