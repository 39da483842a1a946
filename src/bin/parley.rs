//! Terminal chat with Mistral and OpenAI models.
//!
//! # Usage
//!
//! ```bash
//! # Save an API key under the parley home (~/.parley or $PARLEY_HOME)
//! parley mistral key <KEY>
//!
//! # One question, one streamed answer
//! parley openai ask "What is a borrow checker?"
//!
//! # Interactive session without streaming, saved on exit
//! parley --no-stream --store mistral chat
//! ```
//!
//! While chatting, type `/help` for commands. Ctrl-C during a reply cancels
//! that reply; Ctrl-C or Ctrl-D at the prompt ends the session.

use std::io::{self, BufRead, IsTerminal, Read};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley::chat::{
    ChatArgs, ChatCommand, ChatConfig, ChatSession, Invocation, Mode, MultilineCapture, Paths,
    PlainTextRenderer, Renderer, help_text, parse_command,
};
use parley::{Client, Credentials, Exchange, Provider};

const USAGE: &str = "parley [OPTIONS] <mistral|openai> <ask|chat|key> [PROMPT...]";

/// Exit status after an interrupt at the prompt.
const INTERRUPT_EXIT_CODE: i32 = 130;

/// Exit status when an exchange produced no reply.
const FAILURE_EXIT_CODE: i32 = 1;

/// Exit status for a malformed command line.
const USAGE_EXIT_CODE: i32 = 2;

/// Environment variable holding the log filter; `RUST_LOG` is the fallback.
const LOG_ENV: &str = "PARLEY_LOG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (args, free) = ChatArgs::from_command_line_relaxed(USAGE);
    init_tracing(args.verbose);

    let invocation = match Invocation::parse(&free) {
        Ok(invocation) => invocation,
        Err(err) => {
            eprintln!("Error: {err}");
            eprintln!("usage: {USAGE}");
            process::exit(USAGE_EXIT_CODE);
        }
    };
    let paths = Paths::discover()?;
    info!(
        provider = %invocation.provider,
        mode = %invocation.mode,
        home = %paths.home().display(),
        "starting"
    );

    match invocation.mode {
        Mode::Key => install_key(&paths, invocation.provider, invocation.text),
        Mode::Ask => {
            let code = ask(&paths, invocation.provider, args, invocation.text).await?;
            process::exit(code)
        }
        Mode::Chat => chat(&paths, invocation.provider, args).await,
    }
}

fn init_tracing(verbose: bool) {
    let mut env_filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    if verbose && let Ok(directive) = "parley=debug".parse() {
        env_filter = env_filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();
}

fn install_key(
    paths: &Paths,
    provider: Provider,
    key: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let key = match key {
        Some(key) => key,
        None => {
            if io::stdin().is_terminal() {
                eprint!("{} API key: ", provider);
            }
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line
        }
    };
    let path = paths.key_store().install(provider, &key)?;
    println!("Saved {provider} key to {}", path.display());
    Ok(())
}

fn open_session(
    paths: &Paths,
    provider: Provider,
    args: ChatArgs,
) -> Result<(ChatSession, PlainTextRenderer), Box<dyn std::error::Error>> {
    let config = ChatConfig::from_args(provider, args);
    let renderer = PlainTextRenderer::with_color(config.use_color && io::stdout().is_terminal());
    let credentials = Credentials::new(provider, None, paths.key_store());
    let client = Client::new(provider, credentials)?;
    let mut session = ChatSession::new(client, config, paths.storage())?;
    session.prepare()?;
    Ok((session, renderer))
}

fn interrupt_flag() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_clone = interrupted.clone();
    ctrlc::set_handler(move || {
        interrupted_clone.store(true, Ordering::Relaxed);
    })?;
    Ok(interrupted)
}

async fn ask(
    paths: &Paths,
    provider: Provider,
    args: ChatArgs,
    prompt: Option<String>,
) -> Result<i32, Box<dyn std::error::Error>> {
    let prompt = match prompt {
        Some(prompt) => prompt,
        None => {
            let mut prompt = String::new();
            io::stdin().read_to_string(&mut prompt)?;
            prompt
        }
    };
    if prompt.trim().is_empty() {
        eprintln!("Error: nothing to ask");
        return Ok(USAGE_EXIT_CODE);
    }

    let (mut session, mut renderer) = open_session(paths, provider, args)?;
    let interrupted = interrupt_flag()?;
    let outcome = session.send(&prompt, &mut renderer, &interrupted).await?;
    if let Some(path) = session.finish()? {
        renderer.print_info(&format!("Conversation saved to {}", path.display()));
    }
    Ok(match outcome {
        Exchange::Reply(_) => 0,
        Exchange::Cancelled => INTERRUPT_EXIT_CODE,
        Exchange::Failed(_) => FAILURE_EXIT_CODE,
    })
}

async fn chat(
    paths: &Paths,
    provider: Provider,
    args: ChatArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mut session, mut renderer) = open_session(paths, provider, args)?;
    let mut rl = DefaultEditor::new()?;

    // Flag for interrupt handling during replies
    let interrupted = interrupt_flag()?;

    println!("parley ({provider}, model: {})", session.model());
    println!("Type /help for commands, /quit to exit\n");

    let mut multiline: Option<MultilineCapture> = None;
    loop {
        // Reset interrupt flag before each input
        interrupted.store(false, Ordering::Relaxed);

        let prompt = if multiline.is_some() { "... " } else { "You: " };
        let line = match rl.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                info!("session ended at the prompt");
                println!();
                process::exit(INTERRUPT_EXIT_CODE);
            }
            Err(err) => {
                renderer.print_error(&format!("Input error: {err}"));
                break;
            }
        };

        if let Some(capture) = multiline.as_mut() {
            if let Some(text) = capture.push(&line) {
                multiline = None;
                if !text.trim().is_empty() {
                    let _ = rl.add_history_entry(text.as_str());
                    converse(&mut session, &text, &mut renderer, &interrupted).await;
                }
            }
            continue;
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(line);

        if let Some(cmd) = parse_command(line) {
            match cmd {
                ChatCommand::Quit => break,
                ChatCommand::Clear => renderer.clear_screen(),
                ChatCommand::Help => {
                    for line in help_text().lines() {
                        println!("    {line}");
                    }
                }
                ChatCommand::Reset => match session.reset() {
                    Ok(()) => renderer.print_info("Conversation reset."),
                    Err(err) => renderer.print_error(&err.to_string()),
                },
                ChatCommand::Stats => print_stats(&session),
                ChatCommand::Save => match session.persist() {
                    Ok(path) => {
                        renderer.print_info(&format!("Conversation saved to {}", path.display()))
                    }
                    Err(err) => {
                        renderer.print_error(&format!("Failed to save conversation: {err}"))
                    }
                },
                ChatCommand::Multiline => {
                    renderer.print_info("Multiline message; end with \"\"\" on its own line.");
                    multiline = Some(MultilineCapture::new());
                }
                ChatCommand::Invalid(message) => renderer.print_error(&message),
            }
            continue;
        }

        converse(&mut session, line, &mut renderer, &interrupted).await;
    }

    if let Some(path) = session.finish()? {
        renderer.print_info(&format!("Conversation saved to {}", path.display()));
    }
    println!("Goodbye!");
    Ok(())
}

async fn converse(
    session: &mut ChatSession,
    text: &str,
    renderer: &mut PlainTextRenderer,
    interrupted: &AtomicBool,
) {
    println!("{}:", session.model());
    if let Err(err) = session.send(text, renderer, interrupted).await {
        warn!(error = %err, "exchange aborted");
        renderer.print_error(&err.to_string());
    }
}

fn print_stats(session: &ChatSession) {
    let stats = session.stats();
    println!("    Session Statistics:");
    println!("      Provider: {}", stats.provider);
    println!("      Model: {}", stats.model);
    println!("      Messages: {}", stats.message_count);
    println!("      Context tokens: {}", stats.tokens);
    println!(
        "      Exchanges: {} ({} replies, {} failed, {} cancelled)",
        stats.requests, stats.replies, stats.failures, stats.cancelled
    );
    println!(
        "      Streaming: {}",
        if stats.stream { "on" } else { "off" }
    );
    println!(
        "      Context retention: {}",
        if stats.keep_context { "on" } else { "off" }
    );
}
