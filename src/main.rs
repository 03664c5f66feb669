//! # speech-align - Command Line Entry Point
//!
//! Aligns a Whisper JSON or SRT transcript against an audio file and prints
//! the refined segment timings.
//!
//! ## Usage:
//! ```text
//! speech-align talk.wav talk.json --language english --output aligned.json
//! ```
//!
//! ## Process Layout:
//! By default the alignment itself runs in a child process: this binary
//! re-executes itself with the hidden `worker` subcommand and talks to it
//! over stdin/stdout. Logs from both processes go to stderr so the worker's
//! stdout stays a clean protocol channel. `--no-daemon` aligns in-process.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use speech_align::config::AppConfig;
use speech_align::types::{AlignOptions, InterpolateMethod, Segment};
use speech_align::worker::serve;
use speech_align::{
    languages, transcript, AlignBackend, AlignmentContainer, AudioInput, CharRateBackend,
    DevicePreference, ExecuteJob, ModelCache,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "speech-align", version)]
#[command(about = "Align Whisper JSON or SRT transcripts to audio")]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    align: AlignArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve alignment jobs on stdin/stdout (started by the parent process)
    #[command(hide = true)]
    Worker,
}

#[derive(Debug, Args)]
struct AlignArgs {
    /// Input audio file
    #[arg(required = true)]
    audio_file: Option<PathBuf>,

    /// Input Whisper JSON/SRT file
    #[arg(required = true)]
    whisper_file: Option<PathBuf>,

    /// Language spoken in the audio (name or code); detected when omitted
    #[arg(long, value_parser = parse_language)]
    language: Option<String>,

    /// Name of the phoneme-level model to align with
    #[arg(long)]
    align_model: Option<String>,

    /// How to time words the model could not align
    #[arg(long, default_value_t = InterpolateMethod::Nearest)]
    interpolate_method: InterpolateMethod,

    /// Include character-level alignments in the output
    #[arg(long)]
    char_alignments: bool,

    /// Directory alignment models are loaded from
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// auto, cpu, cuda or metal
    #[arg(long)]
    device: Option<DevicePreference>,

    /// Align in this process instead of a worker process
    #[arg(long)]
    no_daemon: bool,

    /// Seconds an idle worker is kept alive
    #[arg(long)]
    cleanup_timeout: Option<u64>,

    /// Log alignment progress
    #[arg(long)]
    print_progress: bool,

    /// Configuration file (defaults to ./speech-align.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the aligned result to this .json or .srt file
    #[arg(long, short)]
    output: Option<PathBuf>,
}

fn parse_language(value: &str) -> Result<String, String> {
    languages::code_for(value)
        .map(str::to_string)
        .ok_or_else(|| format!("unknown language '{}'", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Worker) => run_worker().await,
        None => run_align(cli.align).await,
    }
}

/// Logs go to stderr; a worker's stdout belongs to the protocol.
///
/// `RUST_LOG` overrides the default `speech_align=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_align=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}

async fn run_worker() -> Result<()> {
    let backend: Arc<dyn AlignBackend> = Arc::new(CharRateBackend::new());

    let handled = tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        serve(stdin.lock(), stdout.lock(), |job: ExecuteJob| {
            job.run(backend.clone())
        })
    })
    .await
    .context("worker loop panicked")??;

    info!(handled, "Worker finished");
    Ok(())
}

async fn run_align(args: AlignArgs) -> Result<()> {
    let (Some(audio_file), Some(whisper_file)) = (args.audio_file, args.whisper_file) else {
        bail!("audio_file and whisper_file are required");
    };

    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    if args.no_daemon {
        config.alignment.enable_daemon_process = false;
    }
    if let Some(timeout) = args.cleanup_timeout {
        config.alignment.auto_cleanup_timeout_seconds = timeout;
    }
    if let Some(device) = args.device {
        config.alignment.device = device.to_string();
    }
    if let Some(dir) = args.model_dir {
        config.alignment.model_dir = Some(dir);
    }
    config.validate()?;

    info!("Starting speech-align v{}", env!("CARGO_PKG_VERSION"));
    info!("Reading transcript from {}", whisper_file.display());
    let prior = transcript::load(&whisper_file)?;

    let options = AlignOptions {
        language_code: args.language,
        device: Some(config.device_preference()?),
        model_name: args.align_model,
        model_dir: config.alignment.model_dir.clone(),
        interpolate_method: args.interpolate_method,
        return_char_alignments: args.char_alignments,
        print_progress: args.print_progress,
        combined_progress: false,
    };

    let container = AlignmentContainer::new(
        config.container_state(),
        Arc::new(CharRateBackend::new()),
        Some(&ModelCache::global()),
    )
    .with_apply_timeout(config.apply_timeout());

    let outcome = container
        .run(AudioInput::file(audio_file), prior, options)
        .await;
    container.cleanup().await;
    let result = outcome?;

    println!("Alignment result:");
    for segment in &result.segments {
        println!("  {}", format_segment(segment));
    }

    if let Some(path) = args.output {
        transcript::write(&path, &result)?;
        info!("Wrote aligned transcript to {}", path.display());
    }

    Ok(())
}

fn format_segment(segment: &Segment) -> String {
    format!(
        "start={:.1}s stop={:.1}s speaker_{}",
        segment.start,
        segment.end,
        segment.speaker.as_deref().unwrap_or("unknown")
    )
}
