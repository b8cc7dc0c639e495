//! `colloquy chat`: single-message or interactive chat.

use crate::runtime::Runtime;
use anyhow::Context;
use clap::Args;
use colloquy_config::AppConfig;
use colloquy_core::pipeline::{PipelineChunk, PipelineRequest, PipelineResponse};
use colloquy_providers::OpenAiChatModel;
use colloquy_tools::helpdesk::USERNAME_KEY;
use colloquy_tools::time::TIMEZONE_KEY;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Args)]
pub struct ChatArgs {
    /// Send a single message instead of entering interactive mode
    #[arg(short, long)]
    pub message: Option<String>,

    /// Conversation to continue
    #[arg(short, long, default_value = "default")]
    pub conversation: String,

    /// Username handed to tools (e.g. ticket ownership)
    #[arg(short, long, env = "USER")]
    pub user: Option<String>,

    /// Time zone handed to tools, IANA name or UTC offset
    #[arg(long)]
    pub timezone: Option<String>,

    /// Print the reply as it is generated
    #[arg(long)]
    pub stream: bool,

    /// Print the full response (usage, tool trace) as JSON
    #[arg(long, conflicts_with = "stream")]
    pub json: bool,
}

impl ChatArgs {
    fn request(&self, message: &str, cancel: CancellationToken) -> PipelineRequest {
        let mut request = PipelineRequest::new(self.conversation.as_str(), message).with_cancellation(cancel);
        if let Some(user) = &self.user {
            request = request.with_context(USERNAME_KEY, user.as_str());
        }
        if let Some(zone) = &self.timezone {
            request = request.with_context(TIMEZONE_KEY, zone.as_str());
        }
        request
    }
}

pub async fn run(config_path: &Path, args: ChatArgs) -> anyhow::Result<()> {
    let config = AppConfig::load_at(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set COLLOQUY_API_KEY or OPENAI_API_KEY, or add `api_key` under [model] in:");
        eprintln!("    {}", config_path.display());
        eprintln!();
        anyhow::bail!("No API key found. See above for setup instructions.");
    }

    let model = Arc::new(OpenAiChatModel::from_config(&config.model)?);
    let runtime = Runtime::build(&config, model).await?;
    if args.stream && runtime.validating.is_some() {
        tracing::warn!("Streamed replies are not validated");
    }

    match &args.message {
        Some(message) => turn(&runtime, &args, message).await?,
        None => interactive(&runtime, &args, &config).await?,
    }

    Ok(())
}

async fn interactive(runtime: &Runtime, args: &ChatArgs, config: &AppConfig) -> anyhow::Result<()> {
    println!();
    println!("  Colloquy, interactive mode");
    println!();
    println!("  Model:         {}", config.model.model);
    println!("  Advisors:      {}", runtime.pipeline.advisor_names().join(" → "));
    println!("  Memory:        {} (window {})", runtime.backend, config.memory.window);
    println!("  Conversation:  {}", args.conversation);
    println!();
    println!("  Type 'exit' or press Ctrl+D to quit. Ctrl+C cancels the current reply.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        if let Err(e) = turn(runtime, args, line).await {
            eprintln!("  [Error] {e}");
        }
        println!();
    }

    tokio::task::yield_now().await;
    let usage = runtime.telemetry.conversation_usage(&args.conversation);
    println!();
    println!(
        "  Session: {} requests, {} model rounds, {} tokens",
        usage.requests_completed, usage.model_rounds, usage.total_tokens
    );
    println!();
    Ok(())
}

/// Run one message, cancelling on Ctrl+C.
async fn turn(runtime: &Runtime, args: &ChatArgs, message: &str) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let request = args.request(message, cancel);
    let result = if args.stream {
        stream_turn(runtime, request).await
    } else {
        match runtime.call(request).await {
            Ok(response) => print_response(&response, args.json),
            Err(e) => Err(e.into()),
        }
    };
    interrupt.abort();
    result
}

async fn stream_turn(runtime: &Runtime, request: PipelineRequest) -> anyhow::Result<()> {
    let mut rx = runtime.pipeline.stream(request).await?;
    let mut stdout = std::io::stdout();
    while let Some(chunk) = rx.recv().await {
        match chunk? {
            PipelineChunk::Delta { content } => {
                write!(stdout, "{content}")?;
                stdout.flush()?;
            }
            PipelineChunk::Done { response } => {
                writeln!(stdout)?;
                print_usage(&response);
            }
        }
    }
    Ok(())
}

fn print_response(response: &PipelineResponse, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }
    println!("{}", response.content);
    print_usage(response);
    Ok(())
}

fn print_usage(response: &PipelineResponse) {
    let tools: Vec<&str> = response.tool_trace.iter().map(|t| t.tool_name.as_str()).collect();
    if tools.is_empty() {
        eprintln!(
            "  [{} tokens, {} model rounds]",
            response.usage.total_tokens, response.model_rounds
        );
    } else {
        eprintln!(
            "  [{} tokens, {} model rounds, tools: {}]",
            response.usage.total_tokens,
            response.model_rounds,
            tools.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        chat: ChatArgs,
    }

    #[test]
    fn request_carries_context() {
        let harness = Harness::parse_from([
            "chat",
            "--message",
            "Open a ticket: VPN down",
            "--user",
            "alice",
            "--timezone",
            "Asia/Kolkata",
            "--conversation",
            "c42",
        ]);
        let request = harness.chat.request("VPN down", CancellationToken::new());
        assert_eq!(request.conversation_id.as_str(), "c42");
        assert_eq!(request.context.get_str(USERNAME_KEY), Some("alice"));
        assert_eq!(request.context.get_str(TIMEZONE_KEY), Some("Asia/Kolkata"));
    }

    #[test]
    fn stream_and_json_conflict() {
        assert!(Harness::try_parse_from(["chat", "--stream", "--json"]).is_err());
    }
}
