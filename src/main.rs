//! Main entry point for the ytstream CLI

use anyhow::{bail, Context};
use clap::Parser;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ytstream::cli::args::{is_playlist_source, parse_segment_list, Args, Command, VerbosityLevel};
use ytstream::cli::output::OutputFormatter;
use ytstream::core::engine::Engine;
use ytstream::download::merge::MergeEvent;
use ytstream::platform::formats::{select_format, FormatSelector, QualitySelector};
use ytstream::platform::observation::PageObservation;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbosity_level())?;
    debug!("Starting ytstream with args: {:?}", args);

    let mut formatter = OutputFormatter::new(args.verbosity_level());
    let engine = Engine::new(args.engine_config()?).context("failed to initialise engine")?;

    let result = match &args.command {
        Command::Formats {
            input,
            format,
            observation,
            json,
        } => {
            run_formats(
                &engine,
                &formatter,
                input,
                format.as_deref(),
                observation.as_deref(),
                *json,
            )
            .await
        }
        Command::Fetch {
            source,
            output,
            job_id,
            no_progress,
            ..
        } => run_fetch(&engine, &mut formatter, source, output, job_id, *no_progress).await,
    };

    if let Err(e) = result {
        formatter.error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}

async fn run_formats(
    engine: &Engine,
    formatter: &OutputFormatter,
    input: &str,
    format: Option<&str>,
    observation: Option<&Path>,
    json: bool,
) -> anyhow::Result<()> {
    let resolution = match observation {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let observation = PageObservation::from_json(&content)?;
            engine.resolve_observation(&observation).await?
        }
        None => engine.resolve(input).await?,
    };

    match format {
        Some(selector) => {
            let quality: QualitySelector = selector.parse()?;
            let chosen = select_format(&resolution.formats, &FormatSelector::new(quality))?;
            if json {
                formatter.print_format_json(chosen)?;
            } else {
                formatter.print_formats(std::slice::from_ref(chosen));
            }
        }
        None if json => formatter.print_resolution_json(&resolution)?,
        None => formatter.print_resolution(&resolution),
    }
    Ok(())
}

async fn run_fetch(
    engine: &Engine,
    formatter: &mut OutputFormatter,
    source: &str,
    output: &Path,
    job_id: &str,
    no_progress: bool,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let segments = if is_playlist_source(source) {
        engine.playlist_segments(source).await?
    } else {
        let content = tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("failed to read segment list {}", source))?;
        parse_segment_list(&content)
    };
    if segments.is_empty() {
        bail!("no segments to fetch in {}", source);
    }
    info!("Fetching {} segments into {}", segments.len(), output.display());

    if !no_progress {
        formatter.create_progress_bar(segments.len() as u64);
    }

    let mut handle = engine.start_merge(job_id, segments)?;
    while let Some(event) = handle.next_event().await {
        match event {
            MergeEvent::Progress(progress) => formatter.update_progress(&progress),
            MergeEvent::Completed { .. } => formatter.finish_progress("complete"),
            MergeEvent::Failed { .. } => formatter.abandon_progress("failed"),
            MergeEvent::Cancelled { .. } => formatter.abandon_progress("cancelled"),
            MergeEvent::Started { total, .. } => debug!("Job {} started: {} segments", job_id, total),
        }
    }

    let merged = handle.wait().await?;
    let count = merged.segments.len();
    let bytes = merged.into_bytes();
    tokio::fs::write(output, &bytes)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;

    formatter.print_fetch_complete(
        &output.display().to_string(),
        bytes.len() as u64,
        count,
        started.elapsed(),
    );
    Ok(())
}

/// Initialize logging system
fn init_logging(verbosity: VerbosityLevel) -> anyhow::Result<()> {
    let default_level = match verbosity {
        VerbosityLevel::Quiet => "error",
        VerbosityLevel::Normal => "info",
        VerbosityLevel::Verbose => "debug",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}
