//! Output formatting and progress display

use crate::cli::args::VerbosityLevel;
use crate::core::progress::{format_bytes, format_duration, SegmentProgress};
use crate::platform::formats::ResolvedFormat;
use crate::platform::resolver::{FormatResolution, PersonaState};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::time::Duration;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} segments ({eta}) {msg}";

/// Output formatter for ytstream
pub struct OutputFormatter {
    verbosity: VerbosityLevel,
    progress_bar: Option<ProgressBar>,
}

#[derive(Serialize)]
struct ResolutionReport<'a> {
    persona: &'a str,
    cached: bool,
    failures: Vec<String>,
    formats: &'a [ResolvedFormat],
}

impl OutputFormatter {
    pub fn new(verbosity: VerbosityLevel) -> Self {
        Self {
            verbosity,
            progress_bar: None,
        }
    }

    /// Create a progress bar counting segments
    pub fn create_progress_bar(&mut self, total_segments: u64) -> Option<ProgressBar> {
        if self.verbosity == VerbosityLevel::Quiet {
            return None;
        }

        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");

        let progress_bar = ProgressBar::new(total_segments);
        progress_bar.set_style(style);
        progress_bar.set_message("Fetching...");

        self.progress_bar = Some(progress_bar.clone());
        Some(progress_bar)
    }

    pub fn update_progress(&self, progress: &SegmentProgress) {
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.set_length(progress.total as u64);
            progress_bar.set_position(progress.completed as u64);
            progress_bar.set_message(format!(
                "{} @ {}",
                format_bytes(progress.bytes),
                progress.speed_string()
            ));
        }
    }

    pub fn finish_progress(&self, message: &str) {
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.finish_with_message(message.to_string());
        }
    }

    pub fn abandon_progress(&self, message: &str) {
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.abandon_with_message(message.to_string());
        }
    }

    pub fn info(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            println!("{} {}", "info:".blue().bold(), message);
        }
    }

    pub fn success(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            println!("{} {}", "done:".green().bold(), message);
        }
    }

    pub fn warning(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            eprintln!("{} {}", "warning:".yellow().bold(), message);
        }
    }

    /// Errors print in every mode
    pub fn error(&self, message: &str) {
        eprintln!("{} {}", "error:".red().bold(), message);
    }

    /// Print how the persona chain went, then the format table
    pub fn print_resolution(&self, resolution: &FormatResolution) {
        if self.verbosity == VerbosityLevel::Quiet {
            return;
        }

        let source = if resolution.cached { " (cached)" } else { "" };
        println!(
            "{} {}{}",
            "persona:".bold(),
            resolution.persona.green(),
            source
        );
        if self.verbosity == VerbosityLevel::Verbose {
            for (persona, state) in &resolution.states {
                println!("  {:<14} {}", persona, state_label(*state));
            }
        }
        for failure in &resolution.failures {
            println!("  {} {}", "skipped".yellow(), failure);
        }
        println!();
        self.print_formats(&resolution.formats);
    }

    pub fn print_formats(&self, formats: &[ResolvedFormat]) {
        println!("{}", format_header().bold());
        for format in formats {
            println!("{}", format_row(format));
        }
    }

    pub fn print_resolution_json(&self, resolution: &FormatResolution) -> serde_json::Result<()> {
        let report = ResolutionReport {
            persona: &resolution.persona,
            cached: resolution.cached,
            failures: resolution.failures.iter().map(|f| f.to_string()).collect(),
            formats: &resolution.formats,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }

    pub fn print_format_json(&self, format: &ResolvedFormat) -> serde_json::Result<()> {
        println!("{}", serde_json::to_string_pretty(format)?);
        Ok(())
    }

    pub fn print_fetch_complete(&self, output: &str, bytes: u64, segments: usize, elapsed: Duration) {
        self.success(&format!(
            "{} segments, {} written to {} in {}",
            segments,
            format_bytes(bytes),
            output,
            format_duration(elapsed)
        ));
    }
}

fn state_label(state: PersonaState) -> String {
    match state {
        PersonaState::NotTried => "not tried".dimmed().to_string(),
        PersonaState::TriedOk => "ok".green().to_string(),
        PersonaState::TriedUnplayable => "unplayable".yellow().to_string(),
        PersonaState::TriedError => "error".red().to_string(),
    }
}

fn format_header() -> String {
    format!(
        "{:>5}  {:<5} {:<12} {:>9} {:>10}  {}",
        "itag", "ext", "quality", "kbps", "size", "codecs"
    )
}

fn format_row(format: &ResolvedFormat) -> String {
    let size = format
        .content_length
        .map(format_bytes)
        .unwrap_or_else(|| "-".to_string());
    let codecs: Vec<&str> = [&format.video_codec, &format.audio_codec]
        .into_iter()
        .filter_map(|c| c.as_deref())
        .collect();
    let codecs = if codecs.is_empty() {
        "-".to_string()
    } else {
        codecs.join(", ")
    };
    format!(
        "{:>5}  {:<5} {:<12} {:>9} {:>10}  {}",
        format.itag,
        format.extension(),
        format.quality_string(),
        format.bitrate / 1000,
        size,
        codecs
    )
}
