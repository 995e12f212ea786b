//! bifrost: run prompts through the standard middleware chain.
//!
//! Builds the chain from configuration and either sends a prompt (optionally
//! streaming the reply) or prints the collected middleware state.

use std::io::{self, IsTerminal, Read, Write};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use bifrost::{
    ChainBuilder, Collaborators, GatewayConfig, GenerateParams, MemoryChatStore, MemoryQueue,
    ModelChain, ModelHandle, ModelRegistry, ModelRequest, StreamPart,
};

/// Bifrost LLM gateway CLI
#[derive(Parser)]
#[command(name = "bifrost")]
#[command(version)]
#[command(about = "Composable middleware gateway for LLM requests")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "BIFROST_CONFIG")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a prompt through the chain
    Prompt {
        /// Prompt text (or omit to read from stdin)
        text: Option<String>,
        /// Provider or alias of the requested model
        #[arg(short, long, default_value = "azure")]
        provider: String,
        /// Requested model
        #[arg(short, long, default_value = "gpt-4.1")]
        model: String,
        /// Model class used for failover
        #[arg(long, default_value = "hifi")]
        class: String,
        /// Print parts as they arrive
        #[arg(short, long)]
        stream: bool,
    },

    /// Print the state collected from every state-aware middleware
    State,
}

fn read_input(text: Option<String>) -> io::Result<String> {
    if let Some(text) = text {
        return Ok(text);
    }
    let mut stdin = io::stdin();
    if stdin.is_terminal() {
        eprintln!("reading prompt from stdin, end with ctrl-d");
    }
    let mut buffer = String::new();
    stdin.read_to_string(&mut buffer)?;
    Ok(buffer.trim().to_string())
}

async fn run_prompt(
    chain: &ModelChain,
    handle: &ModelHandle,
    text: String,
    stream: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = ModelRequest::from_prompt(GenerateParams::from_prompt(text), None);
    if !stream {
        let result = chain.generate(handle, request).await?;
        println!("{}", result.text);
        return Ok(());
    }

    let mut parts = chain.stream(handle, request).await?;
    let mut stdout = io::stdout();
    while let Some(part) = parts.next().await {
        match part? {
            StreamPart::TextDelta { delta, .. } => {
                write!(stdout, "{delta}")?;
                stdout.flush()?;
            }
            StreamPart::Error { message } => eprintln!("\nerror: {message}"),
            _ => {}
        }
    }
    writeln!(stdout)?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Default: warn for CLI; override with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = GatewayConfig::load_or_default(args.config.as_deref())?;
    let chain = ChainBuilder::from_config(
        &config,
        Collaborators {
            registry: Arc::new(ModelRegistry::with_embedded_seed()),
            queue: Arc::new(MemoryQueue::new()),
            chat_store: Arc::new(MemoryChatStore::new()),
            network_cache: None,
        },
    )?
    .build()?;

    match args.command {
        Command::Prompt {
            text,
            provider,
            model,
            class,
            stream,
        } => {
            let handle = ModelHandle::new(provider, model, class);
            run_prompt(&chain, &handle, read_input(text)?, stream).await?;
        }
        Command::State => {
            let handle = ModelHandle::new(&config.rate_limit.primary_provider, "control", "control");
            let result = chain.generate(&handle, ModelRequest::CollectState).await?;
            println!("{}", result.text);
        }
    }
    Ok(())
}
