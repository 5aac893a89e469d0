//! vidheat - run the detection pipeline and query its artifacts locally

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vidheat::{build_pipeline, Catalog, PipelineConfig, PipelineError};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "VIDHEAT_CONFIG")]
    config: Option<PathBuf>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline for one video in the foreground.
    Process {
        /// File name of the source video, e.g. `clip.mp4`.
        video: String,
    },
    /// Print the pipeline status of one video as JSON.
    Status { video: String },
    /// List the videos named in the list file that exist on disk.
    Videos,
    /// Search every metadata artifact for a label.
    Search { label: String },
    /// Distinct objects detected in one video.
    Objects { video: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let config = {
        let _stage = ui.stage("Load configuration");
        PipelineConfig::load_from(args.config.as_deref())?
    };
    let catalog = Catalog::new(config.layout(), &config.list_file);

    match args.command {
        Command::Process { video } => {
            let pipeline = {
                let _stage = ui.stage("Open pipeline");
                build_pipeline(&config)?
            };
            let state = process(&ui, pipeline.clone(), &video)?;
            print_json(&state)?;
            print_json(&pipeline.status(&video))?;
        }
        Command::Status { video } => {
            let pipeline = build_pipeline(&config)?;
            print_json(&pipeline.status(&video))?;
        }
        Command::Videos => {
            print_json(&catalog.available_videos()?)?;
        }
        Command::Search { label } => {
            let results = catalog.search_label(&label)?;
            if results.is_empty() {
                return Err(anyhow!("no objects found with label '{}'", label));
            }
            print_json(&results)?;
        }
        Command::Objects { video } => match catalog.unique_objects(&video)? {
            Some(objects) => print_json(&objects)?,
            None => return Err(anyhow!("metadata for {} not found", video)),
        },
    }
    Ok(())
}

/// Run the pipeline on a worker thread while the stage guard follows the
/// tracker.
fn process(
    ui: &ui::Ui,
    pipeline: Arc<vidheat::Pipeline>,
    video: &str,
) -> Result<vidheat::PipelineState> {
    let stage = ui.stage(&format!("Process {}", video));
    let worker = {
        let pipeline = pipeline.clone();
        let video = video.to_string();
        std::thread::spawn(move || pipeline.run_exclusive(&video))
    };
    while !worker.is_finished() {
        let state = pipeline.tracker().get_progress(video);
        stage.progress(state.progress_percent, &state.current_step);
        std::thread::sleep(Duration::from_millis(200));
    }
    let result = worker
        .join()
        .map_err(|_| anyhow!("pipeline thread panicked"))?;
    match result {
        Ok(state) => {
            stage.progress(state.progress_percent, &state.current_step);
            Ok(state)
        }
        Err(err @ PipelineError::AlreadyRunning(_)) => {
            stage.fail();
            Err(err.into())
        }
        Err(err) => {
            stage.fail();
            Err(anyhow!("pipeline failed ({}): {}", err.kind(), err))
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
