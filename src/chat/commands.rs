//! Command parsing for the chat application.
//!
//! Lines starting with `/` control the session and are never sent to the
//! provider. A line holding only `"""` starts (and later ends) a multiline
//! message.

/// Line that opens and closes a multiline message.
pub const MULTILINE_DELIMITER: &str = "\"\"\"";

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Exit the chat application.
    Quit,

    /// Clear the terminal.
    Clear,

    /// Display help information.
    Help,

    /// Forget the conversation so far.
    Reset,

    /// Display the running token total and message count.
    Stats,

    /// Persist the conversation now.
    Save,

    /// Begin a multiline message.
    Multiline,

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for commands.
///
/// Returns `Some(ChatCommand)` if the input is a command, or `None` if it
/// should be sent as a regular message.
///
/// # Examples
///
/// ```
/// # use parley::chat::{ChatCommand, parse_command};
/// assert_eq!(parse_command("/quit"), Some(ChatCommand::Quit));
/// assert_eq!(parse_command("exit"), Some(ChatCommand::Quit));
/// assert!(parse_command("Hello there!").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();

    if input == MULTILINE_DELIMITER {
        return Some(ChatCommand::Multiline);
    }
    if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
        return Some(ChatCommand::Quit);
    }
    let command = input.strip_prefix('/')?;
    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default().to_lowercase();
    if parts.next().is_some() {
        return Some(ChatCommand::Invalid(format!("/{name} takes no arguments")));
    }

    let result = match name.as_str() {
        "quit" | "exit" | "q" => ChatCommand::Quit,
        "clear" => ChatCommand::Clear,
        "help" | "?" => ChatCommand::Help,
        "reset" => ChatCommand::Reset,
        "stats" | "status" => ChatCommand::Stats,
        "save" => ChatCommand::Save,
        "" => ChatCommand::Invalid("Empty command; try /help".to_string()),
        _ => ChatCommand::Invalid(format!("Unknown command: /{name}")),
    };
    Some(result)
}

/// Collects the lines of a multiline message.
#[derive(Debug, Default)]
pub struct MultilineCapture {
    lines: Vec<String>,
}

impl MultilineCapture {
    /// Starts an empty capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line. Returns the whole message, joined with `\n`, once the
    /// closing delimiter arrives.
    pub fn push(&mut self, line: &str) -> Option<String> {
        if line.trim() == MULTILINE_DELIMITER {
            return Some(std::mem::take(&mut self.lines).join("\n"));
        }
        self.lines.push(line.to_string());
        None
    }

    /// Number of lines captured so far.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns true if no lines have been captured.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Returns help text describing available commands.
pub fn help_text() -> &'static str {
    r#"Available commands:
  /clear                 Clear the screen
  /reset                 Forget the conversation so far
  /stats                 Show token total and message count
  /save                  Save the conversation now
  """                    Start a multiline message; end it with """ on its own line
  /help                  Show this help message
  /quit                  Exit the chat (also /exit, /q, exit, quit)"#
}
