//! CLI binary for driving the Switchboard gateway from a terminal.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use switchboard_llm::splitter::TextSplitter;
use switchboard_llm::tokens::TokenCounter;
use switchboard_llm::{
    CompletionOptions, Gateway, LoggingMiddleware, Message, PlatformKey, SpeechOptions,
    SystemConfig, UsageTrackingMiddleware,
};

#[derive(Parser)]
#[command(name = "sb", version, about = "One streaming interface over OpenAI, Qwen and Wenxin")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file; provider environment variables override its credentials
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the models of every configured platform
    Models,

    /// Stream a completion to stdout
    Complete {
        /// The user message
        prompt: String,

        /// Platform to use (default: the config's `platform`)
        #[arg(short, long)]
        platform: Option<PlatformKey>,

        /// Model name; unknown models fall back to the platform default
        #[arg(short, long)]
        model: Option<String>,

        /// System prompt placed before the conversation
        #[arg(short, long)]
        system: Option<String>,

        /// JSON file holding earlier messages of the conversation
        #[arg(long)]
        history: Option<PathBuf>,

        #[arg(short, long)]
        temperature: Option<f64>,

        /// Stop the stream once this many characters have been printed
        #[arg(long)]
        max_chars: Option<usize>,
    },

    /// Embed texts and print a summary (or the vectors with --json)
    Embed {
        #[arg(required_unless_present = "file")]
        texts: Vec<String>,

        /// Split this file into overlapping chunks and embed those too
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Platform to use (default: the config's `embedding`)
        #[arg(short, long)]
        platform: Option<PlatformKey>,

        /// Print the full embedding result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Estimate the token cost of a text (no network access)
    Tokens {
        text: String,

        /// Only this platform's estimate
        #[arg(short, long)]
        platform: Option<PlatformKey>,
    },

    /// Synthesize speech and write the audio to a file
    Speech {
        text: String,

        /// Output audio file
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        voice: Option<String>,

        #[arg(long)]
        speed: Option<f32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so streamed output stays clean.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Models => cmd_models(&config)?,
        Commands::Complete {
            prompt,
            platform,
            model,
            system,
            history,
            temperature,
            max_chars,
        } => {
            let request = CompleteRequest {
                prompt,
                platform: platform.unwrap_or(config.platform),
                model: model.unwrap_or_else(|| config.model.clone()),
                system,
                history,
                temperature,
                max_chars,
            };
            cmd_complete(&config, request).await?;
        }
        Commands::Embed {
            mut texts,
            file,
            platform,
            json,
        } => {
            let platform = platform.unwrap_or(config.embedding);
            if let Some(path) = &file {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                texts.extend(TextSplitter::from_config(config.platform_config(platform)).split(&data));
            }
            cmd_embed(&config, platform, &texts, json).await?;
        }
        Commands::Tokens { text, platform } => cmd_tokens(&text, platform),
        Commands::Speech {
            text,
            output,
            model,
            voice,
            speed,
        } => {
            let options = SpeechOptions { model, voice, speed };
            cmd_speech(&config, &text, &output, &options).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SystemConfig> {
    let mut config = match path {
        Some(p) => SystemConfig::load(p)
            .with_context(|| format!("failed to load config from {}", p.display()))?,
        None => SystemConfig::default(),
    };
    config.overlay_env();
    Ok(config)
}

fn cmd_models(config: &SystemConfig) -> anyhow::Result<()> {
    let gateway = Gateway::from_config(config)?;
    for platform in gateway.platforms() {
        println!("{} ({})", platform.label(), platform.key());
        for (i, model) in platform.models().iter().enumerate() {
            let marker = if i == 0 { " (default)" } else { "" };
            println!("  {model}{marker}");
        }
    }
    Ok(())
}

struct CompleteRequest {
    prompt: String,
    platform: PlatformKey,
    model: String,
    system: Option<String>,
    history: Option<PathBuf>,
    temperature: Option<f64>,
    max_chars: Option<usize>,
}

async fn cmd_complete(config: &SystemConfig, request: CompleteRequest) -> anyhow::Result<()> {
    let usage = UsageTrackingMiddleware::new();
    let gateway = Gateway::from_config(config)?
        .with_middleware(LoggingMiddleware)
        .with_middleware(usage.clone());
    let platform = gateway.platform(request.platform)?;

    let mut messages = Vec::new();
    if let Some(path) = &request.history {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read history {}", path.display()))?;
        let earlier: Vec<Message> = serde_json::from_str(&data)
            .with_context(|| format!("history {} is not a message list", path.display()))?;
        let skip = earlier.len().saturating_sub(config.max_related_message_num);
        messages.extend(earlier.into_iter().skip(skip));
    }
    messages.push(Message::user(request.prompt));

    let budget = config.platform_config(request.platform).round_max_tokens;
    let mut messages = gateway.fit_history(request.platform, &messages, budget)?;

    let system = request
        .system
        .unwrap_or_else(|| platform.system_prompt().to_string());
    if !system.is_empty() {
        messages.insert(0, Message::system(system));
    }

    let options = CompletionOptions {
        model: request.model,
        temperature: request.temperature,
        ..CompletionOptions::default()
    };

    let max_chars = request.max_chars;
    let mut printed = 0usize;
    let mut on_chunk = |delta: &str| {
        let len = delta.chars().count();
        if max_chars.is_some_and(|max| printed + len > max) {
            return false;
        }
        printed += len;
        let mut out = std::io::stdout().lock();
        // A closed stdout ends the stream like a cancellation.
        out.write_all(delta.as_bytes()).and_then(|_| out.flush()).is_ok()
    };

    let result = gateway
        .completion(request.platform, &messages, &options, Some(&mut on_chunk))
        .await?;
    println!();
    tracing::debug!(
        total_tokens = result.total_tokens,
        session_tokens = usage.completion_tokens(),
        "completion done"
    );
    Ok(())
}

async fn cmd_embed(
    config: &SystemConfig,
    platform: PlatformKey,
    texts: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let gateway = Gateway::from_config(config)?.with_middleware(LoggingMiddleware);
    let result = gateway.embed_texts(platform, texts).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    let dimension = result.embeddings.first().map(Vec::len).unwrap_or(0);
    println!("Vectors: {}", result.embeddings.len());
    println!("Dimension: {dimension}");
    println!("Tokens: {}", result.total_tokens);
    Ok(())
}

fn cmd_tokens(text: &str, platform: Option<PlatformKey>) {
    let keys = match platform {
        Some(key) => vec![key],
        None => PlatformKey::ALL.to_vec(),
    };
    for key in keys {
        println!("{key}: {}", TokenCounter::for_platform(key).count(text));
    }
}

async fn cmd_speech(
    config: &SystemConfig,
    text: &str,
    output: &Path,
    options: &SpeechOptions,
) -> anyhow::Result<()> {
    let gateway = Gateway::from_config(config)?;
    let audio = gateway.speech(PlatformKey::OpenAi, text, options).await?;
    std::fs::write(output, &audio)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote {} bytes to {}", audio.len(), output.display());
    Ok(())
}
