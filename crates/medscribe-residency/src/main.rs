//! MedScribe residency probe.
//!
//! Bootstraps the residency manager against the configured engines and runs
//! one request, printing the result and the final residency status as JSON.
//! Ctrl-C cancels the request in flight.
//!
//! # Environment variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `MEDSCRIBE_CONFIG` | Config file used when `--config` is not given |
//! | `MEDSCRIBE__<SECTION>__<KEY>` | Override one config key |
//! | `RUST_LOG` | Log filter (default `medscribe_residency=info`) |

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use medscribe_residency::{
    AudioInput, GenerateRequest, ImageInput, ResidencyConfig, bootstrap_from_config,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// MedScribe residency probe - exercise the GPU residency manager
#[derive(Parser)]
#[command(name = "medscribe-residency")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short = 'c', long, env = "MEDSCRIBE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Run on software stand-ins only
    #[arg(long, global = true)]
    simulated: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the residency status after bootstrap
    Status,

    /// Generate text with the reasoning or routing model
    Generate {
        #[arg(short, long, value_enum, default_value = "reasoning")]
        model: GenerateModel,

        #[arg(short, long)]
        prompt: String,

        /// Image attached to a reasoning request
        #[arg(long)]
        image: Option<PathBuf>,

        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// Transcribe a WAV file or raw PCM16 mono audio
    Transcribe {
        #[arg(short, long)]
        file: PathBuf,

        /// Sample rate of raw PCM input; ignored for WAV
        #[arg(long, default_value_t = 16_000)]
        sample_rate: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum GenerateModel {
    Reasoning,
    Routing,
}

fn load_config(cli: &Cli) -> anyhow::Result<ResidencyConfig> {
    let mut config = match &cli.config {
        Some(path) => ResidencyConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ResidencyConfig::from_env().context("failed to load config from environment")?,
    };
    if cli.simulated {
        config.simulated = true;
    }
    Ok(config)
}

fn image_input(path: &Path) -> anyhow::Result<ImageInput> {
    let mime = match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        other => bail!("unsupported image type: {other:?}"),
    };
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(ImageInput::new(bytes, mime))
}

fn audio_input(path: &Path, sample_rate: u32) -> anyhow::Result<AudioInput> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
    if is_wav {
        return Ok(AudioInput::from_wav_bytes(&bytes)?);
    }
    Ok(AudioInput::pcm16(bytes, sample_rate))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("medscribe_residency=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(simulated = config.simulated, "configuration loaded");

    let manager = Arc::new(bootstrap_from_config(&config).await?);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling request");
            on_interrupt.cancel();
        }
    });

    let output = match cli.command {
        Command::Status => None,
        Command::Generate {
            model,
            prompt,
            image,
            max_tokens,
        } => {
            let request = match model {
                GenerateModel::Reasoning => GenerateRequest::reasoning(prompt),
                GenerateModel::Routing => GenerateRequest::routing(prompt),
            };
            let request = match max_tokens {
                Some(n) => {
                    let options = request.options.clone().with_max_tokens(n);
                    request.with_options(options)
                }
                None => request,
            };

            let text = match (model, image) {
                (GenerateModel::Reasoning, Some(path)) => {
                    let request = request.with_image(image_input(&path)?);
                    manager.infer_reasoning(request, Some(&cancel)).await?
                }
                (GenerateModel::Reasoning, None) => {
                    manager.infer_reasoning(request, Some(&cancel)).await?
                }
                (GenerateModel::Routing, Some(_)) => bail!("images are only accepted by the reasoning model"),
                (GenerateModel::Routing, None) => {
                    manager.infer_routing(request, Some(&cancel)).await?
                }
            };
            Some(text)
        }
        Command::Transcribe { file, sample_rate } => {
            let audio = audio_input(&file, sample_rate)?;
            Some(manager.transcribe(audio, Some(&cancel)).await?)
        }
    };

    let status = manager.status().await;
    let report = json!({
        "output": output,
        "status": status.to_json(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
