//! Command line argument parsing

use crate::core::engine::EngineConfig;
use crate::download::merge::MergeConfig;
use crate::download::pool::PoolConfig;
use crate::error::StreamError;
use crate::platform::client::HttpClientConfig;
use crate::platform::persona::PersonaRegistry;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// ytstream - stream format resolution and resilient segment retrieval
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// HTTP timeout (e.g., 30s, 1m)
    #[arg(long, global = true, value_name = "DURATION", default_value = "30s")]
    pub timeout: humantime::Duration,

    /// Retries per segment for transient errors
    #[arg(long, global = true, default_value = "3")]
    pub retries: u32,

    /// Segments fetched in parallel
    #[arg(long, global = true, default_value = "4")]
    pub concurrency: usize,

    /// JSON file with the client persona registry
    #[arg(long, global = true, value_name = "PATH")]
    pub personas: Option<PathBuf>,

    /// Only try these personas, in this order (comma separated)
    #[arg(long, global = true, value_delimiter = ',', value_name = "ID")]
    pub persona: Vec<String>,

    /// Override User-Agent header
    #[arg(long, global = true, value_name = "USER_AGENT")]
    pub user_agent: Option<String>,

    /// Proxy URL (http/https/socks)
    #[arg(long, global = true, value_name = "URL")]
    pub proxy: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet output (only errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Resolve the formats of a video through the persona chain
    Formats {
        /// Video URL or id
        input: String,

        /// Print only the format picked by this selector (e.g., 'best', 'itag=22', 'height<=480')
        #[arg(short, long, value_name = "FORMAT")]
        format: Option<String>,

        /// Page observation JSON captured from a watch page
        #[arg(long, value_name = "PATH")]
        observation: Option<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Fetch a segment list or HLS playlist into one file
    Fetch {
        /// Playlist URL, or a file with one segment URL per line
        source: String,

        /// Output file
        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,

        /// Maximum segment requests per second
        #[arg(long, value_name = "N")]
        rate_limit: Option<u32>,

        /// Delay before the first retry (doubles per retry)
        #[arg(long, value_name = "DURATION", default_value = "500ms")]
        retry_delay: humantime::Duration,

        /// Job identifier shown in progress output
        #[arg(long, default_value = "fetch")]
        job_id: String,

        /// Disable progress output
        #[arg(long)]
        no_progress: bool,
    },
}

/// Output verbosity level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbosityLevel {
    /// Quiet (only errors)
    Quiet,
    Normal,
    /// Verbose (debug info)
    Verbose,
}

impl Args {
    /// Get HTTP timeout as Duration
    pub fn timeout_duration(&self) -> Duration {
        self.timeout.into()
    }

    /// Get output verbosity level
    pub fn verbosity_level(&self) -> VerbosityLevel {
        if self.quiet {
            VerbosityLevel::Quiet
        } else if self.verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        let mut config = HttpClientConfig::default().with_timeout(self.timeout_duration());
        if let Some(user_agent) = &self.user_agent {
            config = config.with_user_agent(user_agent.as_str());
        }
        if let Some(proxy) = &self.proxy {
            config = config.with_proxy(proxy.as_str());
        }
        config
    }

    pub fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::default()
            .with_concurrency(self.concurrency)
            .with_max_retries(self.retries)
            .with_request_timeout(self.timeout_duration());
        if let Command::Fetch {
            rate_limit,
            retry_delay,
            ..
        } = &self.command
        {
            config = config.with_base_delay((*retry_delay).into());
            if let Some(rps) = rate_limit {
                config = config.with_rate_limit(*rps);
            }
        }
        config
    }

    /// Persona registry from `--personas`, narrowed by `--persona`
    pub fn registry(&self) -> Result<PersonaRegistry, StreamError> {
        let registry = match &self.personas {
            Some(path) => PersonaRegistry::from_file(path)?,
            None => PersonaRegistry::builtin(),
        };
        if self.persona.is_empty() {
            Ok(registry)
        } else {
            registry.restricted_to(&self.persona)
        }
    }

    pub fn engine_config(&self) -> Result<EngineConfig, StreamError> {
        Ok(EngineConfig::default()
            .with_http(self.http_config())
            .with_personas(self.registry()?)
            .with_merge(MergeConfig::default().with_pool(self.pool_config())))
    }
}

/// Whether a fetch source names a remote playlist rather than a local list
pub fn is_playlist_source(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Segment URLs from a list file: one per line, blanks and `#` comments skipped
pub fn parse_segment_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
