//! Engine wiring resolution and segment retrieval together

use crate::download::merge::{MergeConfig, MergeCoordinator, MergeHandle, MergeState};
use crate::download::playlist::expand_playlist;
use crate::download::pool::HttpSegmentSource;
use crate::error::StreamError;
use crate::platform::cipher::{HttpBundleSource, SignatureResolver};
use crate::platform::client::{HttpClientConfig, VideoClient};
use crate::platform::formats::{select_format, FormatSelector, ResolvedFormat};
use crate::platform::innertube::InnerTubeClient;
use crate::platform::observation::PageObservation;
use crate::platform::persona::PersonaRegistry;
use crate::platform::resolver::{ClientPersonaResolver, FormatResolution, IframeApiLocator};
use crate::platform::sandbox::{CodeSandbox, SandboxConfig};
use crate::utils::cache::{FormatCache, FormatCacheConfig};
use crate::utils::url::extract_video_id;
use std::sync::Arc;
use tracing::{debug, info};

/// Engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub http: HttpClientConfig,
    pub sandbox: SandboxConfig,
    pub cache: FormatCacheConfig,
    pub merge: MergeConfig,
    /// Personas tried in order when resolving formats
    pub personas: PersonaRegistry,
    /// Host serving the player endpoint and embed script
    pub api_base_url: Option<String>,
}

impl EngineConfig {
    pub fn with_http(mut self, http: HttpClientConfig) -> Self {
        self.http = http;
        self
    }

    pub fn with_merge(mut self, merge: MergeConfig) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_personas(mut self, personas: PersonaRegistry) -> Self {
        self.personas = personas;
        self
    }

    pub fn with_api_base_url(mut self, base_url: &str) -> Self {
        self.api_base_url = Some(base_url.to_string());
        self
    }
}

/// Format resolution plus single-flight segment assembly
pub struct Engine {
    client: VideoClient,
    resolver: ClientPersonaResolver,
    merger: MergeCoordinator,
}

impl Engine {
    /// Build an engine backed by the embedded script sandbox
    pub fn new(config: EngineConfig) -> Result<Self, StreamError> {
        let sandbox = CodeSandbox::embedded(config.sandbox.clone())?;
        Self::with_sandbox(config, Arc::new(sandbox))
    }

    /// Build an engine around an existing sandbox
    pub fn with_sandbox(config: EngineConfig, sandbox: Arc<CodeSandbox>) -> Result<Self, StreamError> {
        let client = VideoClient::with_config(config.http.clone())?;

        let mut players = InnerTubeClient::new(client.clone());
        let mut locator = IframeApiLocator::new(client.clone());
        if let Some(base_url) = &config.api_base_url {
            players = players.with_base_url(base_url);
            locator = locator.with_base_url(base_url);
        }

        let signatures = Arc::new(SignatureResolver::new(
            Arc::new(HttpBundleSource::new(client.clone())),
            sandbox,
        ));
        let resolver = ClientPersonaResolver::new(
            config.personas,
            Arc::new(players),
            signatures,
            FormatCache::with_config(config.cache),
        )
        .with_locator(Arc::new(locator));

        let merger = MergeCoordinator::new(
            Arc::new(HttpSegmentSource::new(client.clone())),
            config.merge,
        );

        debug!(
            "Engine ready with {} personas",
            resolver.registry().len()
        );
        Ok(Self {
            client,
            resolver,
            merger,
        })
    }

    pub fn client(&self) -> &VideoClient {
        &self.client
    }

    pub fn resolver(&self) -> &ClientPersonaResolver {
        &self.resolver
    }

    /// Resolve a URL or bare content id
    pub async fn resolve(&self, input: &str) -> Result<FormatResolution, StreamError> {
        let video_id = extract_video_id(input)?;
        self.resolver
            .resolve_observation(&PageObservation::new(&video_id))
            .await
    }

    pub async fn resolve_observation(
        &self,
        observation: &PageObservation,
    ) -> Result<FormatResolution, StreamError> {
        self.resolver.resolve_observation(observation).await
    }

    /// Resolve and pick one format
    pub async fn resolve_best(
        &self,
        input: &str,
        selector: &FormatSelector,
    ) -> Result<ResolvedFormat, StreamError> {
        let resolution = self.resolve(input).await?;
        let format = select_format(&resolution.formats, selector)?;
        info!(
            "Selected itag {} ({}) from persona {}",
            format.itag,
            format.quality_string(),
            resolution.persona
        );
        Ok(format.clone())
    }

    /// Segment URLs behind an HLS playlist
    pub async fn playlist_segments(&self, playlist_url: &str) -> Result<Vec<String>, StreamError> {
        expand_playlist(&self.client, playlist_url).await
    }

    pub fn start_merge(
        &self,
        job_id: &str,
        segment_urls: Vec<String>,
    ) -> Result<MergeHandle, StreamError> {
        self.merger.start_merge(job_id, segment_urls)
    }

    pub fn merge_state(&self) -> MergeState {
        self.merger.state()
    }

    pub fn cancel_merge(&self) -> bool {
        self.merger.cancel_active()
    }
}
