//! Error types for ytstream

use thiserror::Error;

/// Main error type for ytstream operations
#[derive(Debug, Error)]
pub enum StreamError {
    /// A transform function could not be located in a player bundle
    #[error("Transform extraction failed for bundle {fingerprint}: {reason}")]
    TransformExtraction { fingerprint: String, reason: String },

    /// A single sandbox input failed to transform
    #[error("Sandbox evaluation failed at input {index}: {message}")]
    SandboxEval { index: usize, message: String },

    /// Sandboxed code was rejected or could not be compiled
    #[error("Sandbox rejected code: {0}")]
    SandboxCompile(String),

    /// A persona explicitly refused to serve the content
    #[error("Persona {persona} refused content: {reason}")]
    PersonaUnplayable { persona: String, reason: String },

    /// Every persona failed
    #[error("Content is unplayable: {}", render_attempts(.attempts))]
    Unplayable { attempts: Vec<PersonaFailure> },

    /// Terminal segment failure after retries
    #[error("Segment {index} failed after {attempts} attempt(s): {reason}")]
    SegmentFetch {
        index: usize,
        attempts: u32,
        reason: String,
    },

    /// HTTP status received while fetching
    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// A merge job is already running
    #[error("Merge coordinator busy with job {active_job}")]
    PoolBusy { active_job: String },

    /// The fetch pool was cancelled
    #[error("Pool cancelled")]
    PoolCancelled,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("No suitable format found")]
    NoFormatFound,

    #[error("Persona registry error: {0}")]
    Registry(String),

    #[error("Playlist error: {0}")]
    PlaylistError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Generic error: {0}")]
    Generic(String),
}

/// One persona's failed attempt, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaFailure {
    pub persona: String,
    pub kind: FailureKind,
    pub reason: String,
}

/// How a persona attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unplayable,
    Error,
}

impl std::fmt::Display for PersonaFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            FailureKind::Unplayable => "unplayable",
            FailureKind::Error => "error",
        };
        write!(f, "{} ({}): {}", self.persona, kind, self.reason)
    }
}

fn render_attempts(attempts: &[PersonaFailure]) -> String {
    if attempts.is_empty() {
        return "no personas configured".to_string();
    }
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl StreamError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::HttpStatus { status, .. } => *status >= 500,
            StreamError::RequestFailed(e) => !e.is_status() && !e.is_builder(),
            StreamError::TimeoutError(_) => true,
            _ => false,
        }
    }

    /// Record this error as a failed attempt by `persona`
    pub fn persona_failure(&self, persona: &str) -> PersonaFailure {
        let (kind, reason) = match self {
            StreamError::PersonaUnplayable { reason, .. } => {
                (FailureKind::Unplayable, reason.clone())
            }
            other => (FailureKind::Error, other.to_string()),
        };
        PersonaFailure {
            persona: persona.to_string(),
            kind,
            reason,
        }
    }
}
