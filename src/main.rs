use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voiceclaw::api::{ApiServer, ApiState};
use voiceclaw::{Config, PipelineEvent, Providers, Synthesizer, TurnController};

/// Voiceclaw - Streaming voice conversation pipeline for AI assistants
#[derive(Parser)]
#[command(name = "voiceclaw", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket server (default)
    Serve {
        /// Address to bind
        #[arg(long, env = "WEBSOCKET_HOST")]
        host: Option<String>,
        /// Port to listen on
        #[arg(long, env = "WEBSOCKET_PORT")]
        port: Option<u16>,
    },
    /// Synthesize one piece of text to a file
    Say {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
        /// Output file (defaults to `say.<format>`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run one text turn through the full pipeline
    Turn {
        /// User message
        text: String,
        /// Directory receiving one audio file per sentence
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Print the effective configuration (secrets redacted)
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,voiceclaw=info",
        1 => "info,voiceclaw=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Serve { host, port } => serve(config, host, port).await,
        Command::Say { text, output } => say(&config, &text, output).await,
        Command::Turn { text, output_dir } => turn(&config, &text, &output_dir).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(())
        }
    }
}

async fn serve(config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let providers = Providers::from_config(&config)?;
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    tracing::info!(
        host = %host,
        port,
        max_concurrent_synthesis = config.pipeline.max_concurrent_synthesis,
        "starting voiceclaw"
    );

    let state = ApiState::new(&config, providers);
    ApiServer::new(state, host, port).run().await?;
    Ok(())
}

async fn say(config: &Config, text: &str, output: Option<PathBuf>) -> anyhow::Result<()> {
    let tts = voiceclaw::providers::TextToSpeech::from_config(&config.tts)?;
    let audio = tts.synthesize(text).await?;
    let path = output.unwrap_or_else(|| PathBuf::from(format!("say.{}", tts.format())));

    tokio::fs::write(&path, &audio).await?;
    println!("Wrote {} bytes to {}", audio.len(), path.display());
    Ok(())
}

async fn turn(config: &Config, text: &str, output_dir: &Path) -> anyhow::Result<()> {
    let providers = Providers::from_config(config)?;
    let format = providers.synthesizer.format().to_string();
    let controller = TurnController::new(providers, config.pipeline.clone());

    tokio::fs::create_dir_all(output_dir).await?;

    let Some(mut events) = controller.take_events() else {
        anyhow::bail!("event queue already taken");
    };
    let turn_id = controller.start_turn(text).await?;
    println!("Turn {turn_id} started");

    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::AudioChunkReady(chunk) => {
                let sequence = chunk.sequence;
                if chunk.is_silence() {
                    println!("  [{sequence}] (silence)");
                    continue;
                }
                let path = output_dir.join(format!("{}-{sequence}.{format}", chunk.turn_id));
                tokio::fs::write(&path, &chunk.payload).await?;
                println!("  [{sequence}] {} bytes -> {}", chunk.payload.len(), path.display());
            }
            PipelineEvent::ResponseText { text, no_reply, .. } => {
                if no_reply {
                    println!("Assistant chose not to reply");
                } else {
                    println!("Assistant: {text}");
                }
            }
            PipelineEvent::SynthesisFailed { sequence, .. } => {
                println!("  [{sequence}] synthesis failed");
            }
            PipelineEvent::GenerationFailed { reason, .. } => {
                println!("Generation stopped early: {reason}");
            }
            PipelineEvent::TurnCompleted { .. } => {
                println!("Turn {turn_id} complete");
                return Ok(());
            }
            PipelineEvent::TurnCancelled { .. } => {
                anyhow::bail!("turn {turn_id} was cancelled");
            }
            PipelineEvent::TurnFailed { reason, .. } => {
                anyhow::bail!("turn {turn_id} failed: {reason}");
            }
            PipelineEvent::TurnStarted { .. }
            | PipelineEvent::TranscriptReady { .. }
            | PipelineEvent::TranscriptionFailed { .. } => {}
        }
    }

    anyhow::bail!("event stream ended before turn {turn_id} finished")
}
