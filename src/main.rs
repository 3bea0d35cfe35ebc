//! MCP Chat Server
//!
//! Entry point: `serve` (default) runs the web server, `chat` talks to the
//! model from the terminal.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::io::Write;

use clap::Parser;
use dotenvy::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mcp_chat::AppState;
use mcp_chat::config::{AppConfig, Cli, Command};
use mcp_chat::protocol::{FrameSink, StreamFrame};
use mcp_chat::server::{build_state, start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present) before anything reads the environment
    let _ = dotenv();

    // Initialize tracing (M-LOG-STRUCTURED)
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match AppConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let state = build_state(config).await?;

    match cli.command.unwrap_or_default() {
        Command::Serve => start_server(state).await,
        Command::Chat => run_terminal_chat(state).await,
    }
}

/// Read lines from stdin and run each as a turn on the active session.
async fn run_terminal_chat(state: AppState) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Type a message, 'clear' to reset the history, 'exit' to leave.");

    loop {
        print!("\nYou: ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();

        match input.to_lowercase().as_str() {
            "" => continue,
            "exit" | "quit" => break,
            "clear" => {
                state.service.clear(None).await?;
                println!("History cleared.");
                continue;
            }
            _ => {}
        }

        let (sink, mut frames) = FrameSink::channel(64);
        let service = std::sync::Arc::clone(&state.service);
        let message = input.to_string();
        let turn = tokio::spawn(async move { service.send_message(None, &message, &sink).await });

        print!("Assistant: ");
        while let Some(frame) = frames.recv().await {
            match frame {
                StreamFrame::Text(text) => {
                    print!("{text}");
                    std::io::stdout().flush()?;
                }
                StreamFrame::Error(message) => eprintln!("\nError: {message}"),
                StreamFrame::Done => println!(),
            }
        }

        if let Err(e) = turn.await? {
            tracing::debug!(error = %e, "Turn ended with an error");
        }
    }

    Ok(())
}
