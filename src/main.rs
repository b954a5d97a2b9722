use anyhow::Result;
use chapter2voice::core::config::Config;
use chapter2voice::core::io::{NativeStorage, Storage};
use chapter2voice::services::llm::create_llm;
use chapter2voice::services::pipeline::ChapterPipeline;
use chapter2voice::services::tts::create_tts_client;
use chapter2voice::services::workflow::WorkflowManager;
use clap::{Parser, Subcommand};
use log::warn;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "chapter2voice", about = "Turn novel chapters into multi-voice audio")]
struct Cli {
    /// Path to the YAML config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every chapter in the input folder (default)
    Run,
    /// Show the persisted state of a chapter
    Status { chapter: String },
    /// Retry one failed segment, then finish the chapter
    Retry { chapter: String, segment: usize },
    /// Discard one segment's cached audio and synthesize it again
    Regenerate { chapter: String, segment: usize },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM and audio settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current stage");
                cancel.cancel();
            }
        });
    }

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let llm = Arc::from(create_llm(&config.llm)?);
    let tts = create_tts_client(&config)?;
    let pipeline = ChapterPipeline::from_config(&config, llm, tts, storage.clone())?
        .with_cancellation(cancel);
    let mut manager = WorkflowManager::new(config, Arc::new(pipeline), storage).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let summary = manager.run().await?;
            if summary.failed.is_empty() {
                println!("All chapters processed!");
            } else {
                println!(
                    "{} chapter(s) processed, {} failed: {}",
                    summary.completed.len(),
                    summary.failed.len(),
                    summary.failed.join(", ")
                );
            }
        }
        Command::Status { chapter } => match manager.pipeline().status(&chapter).await? {
            Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
            None => println!("Chapter {} has not been started", chapter),
        },
        Command::Retry { chapter, segment } => {
            let chapter = manager.load_chapter(&chapter).await?;
            let audio = manager.pipeline().retry_segment(&chapter, segment).await?;
            println!("Chapter complete: {}", audio.merged.path);
        }
        Command::Regenerate { chapter, segment } => {
            let chapter = manager.load_chapter(&chapter).await?;
            let result = manager.pipeline().regenerate_segment(&chapter, segment).await?;
            println!("Segment {} regenerated: {}", segment, result.entry.audio_path);
            if let Some(merged) = result.merged {
                println!("Chapter re-merged: {}", merged.path);
            }
        }
    }
    Ok(())
}
