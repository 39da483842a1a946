//! Output rendering for chat replies.
//!
//! Replies are printed fragment by fragment as they stream in, so the renderer
//! flushes after every write.

use std::io::{self, Stdout, Write};

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for dim text (used for informational lines).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code for red text (used for errors).
const ANSI_RED: &str = "\x1b[31m";

/// ANSI escape code for yellow text (used for interruptions).
const ANSI_YELLOW: &str = "\x1b[33m";

/// ANSI sequence that clears the screen and homes the cursor.
const ANSI_CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Trait for rendering chat output.
pub trait Renderer: Send {
    /// Print a chunk of reply text without a trailing newline.
    ///
    /// Streaming replies call this once per fragment; non-streaming replies
    /// call it once with the whole reply.
    fn print_text(&mut self, text: &str);

    /// Print an error message.
    fn print_error(&mut self, error: &str);

    /// Print an informational message.
    fn print_info(&mut self, info: &str);

    /// Called when a reply is complete. Ends the reply line.
    fn finish_response(&mut self);

    /// Called when the user interrupts a streaming reply.
    fn print_interrupted(&mut self);

    /// Clears the terminal.
    fn clear_screen(&mut self);

    /// Whether a thinking spinner may draw alongside this renderer.
    fn animate(&self) -> bool {
        false
    }
}

/// Plain text renderer with optional ANSI styling.
pub struct PlainTextRenderer {
    stdout: Stdout,
    use_color: bool,
}

impl PlainTextRenderer {
    /// Creates a new PlainTextRenderer with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self {
            stdout: io::stdout(),
            use_color,
        }
    }

    /// Flushes stdout to ensure immediate display of streamed content.
    fn flush(&mut self) {
        let _ = self.stdout.flush();
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for PlainTextRenderer {
    fn print_text(&mut self, text: &str) {
        print!("{text}");
        self.flush();
    }

    fn print_error(&mut self, error: &str) {
        if self.use_color {
            eprintln!("{ANSI_RED}Error: {error}{ANSI_RESET}");
        } else {
            eprintln!("Error: {error}");
        }
    }

    fn print_info(&mut self, info: &str) {
        if self.use_color {
            println!("{ANSI_DIM}{info}{ANSI_RESET}");
        } else {
            println!("{info}");
        }
    }

    fn finish_response(&mut self) {
        println!();
        self.flush();
    }

    fn print_interrupted(&mut self) {
        if self.use_color {
            println!("\n{ANSI_YELLOW}[interrupted]{ANSI_RESET}");
        } else {
            println!("\n[interrupted]");
        }
        self.flush();
    }

    fn clear_screen(&mut self) {
        if self.use_color {
            print!("{ANSI_CLEAR_SCREEN}");
        } else {
            println!();
        }
        self.flush();
    }

    fn animate(&self) -> bool {
        self.use_color
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renderer_default_has_color() {
        let renderer = PlainTextRenderer::new();
        assert!(renderer.use_color);
        assert!(renderer.animate());
    }

    #[test]
    fn renderer_without_color() {
        let renderer = PlainTextRenderer::with_color(false);
        assert!(!renderer.use_color);
        assert!(!renderer.animate());
    }
}
