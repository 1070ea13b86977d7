//! Format resolution across client personas
//!
//! Personas are tried one at a time in registry order. A persona that is
//! refused, only offers DRM streams, or whose streams cannot be descrambled
//! hands over to the next one; the first persona that yields formats wins.

use crate::error::{FailureKind, PersonaFailure, StreamError};
use crate::platform::cipher::{BundleRef, SignatureResolver};
use crate::platform::client::VideoClient;
use crate::platform::formats::ResolvedFormat;
use crate::platform::innertube::{PlayerRequest, PlayerResponse, PlayerSource};
use crate::platform::observation::PageObservation;
use crate::platform::persona::{ClientPersona, PersonaRegistry};
use crate::utils::cache::{new_async_cache_with_capacity, AsyncCache, FormatCache};
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where each persona ended up during one resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonaState {
    NotTried,
    TriedOk,
    TriedUnplayable,
    TriedError,
}

/// Finds the current player bundle when no observation supplied one
#[async_trait]
pub trait BundleLocator: Send + Sync {
    async fn locate(&self) -> Result<BundleRef, StreamError>;
}

/// Reads the bundle hash out of the embed API script
pub struct IframeApiLocator {
    client: VideoClient,
    base_url: String,
}

impl IframeApiLocator {
    pub fn new(client: VideoClient) -> Self {
        Self {
            client,
            base_url: "https://www.youtube.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl BundleLocator for IframeApiLocator {
    async fn locate(&self) -> Result<BundleRef, StreamError> {
        let script = self
            .client
            .get_text(&format!("{}/iframe_api", self.base_url))
            .await?;
        let hash = bundle_hash_from_iframe_api(&script)?.ok_or_else(|| {
            StreamError::TransformExtraction {
                fingerprint: "unknown".to_string(),
                reason: "player hash not found in iframe_api".to_string(),
            }
        })?;
        Ok(BundleRef::new(&format!(
            "https://www.youtube.com/s/player/{}/player_ias.vflset/en_US/base.js",
            hash
        )))
    }
}

/// Player hash from the embed API script, which escapes its slashes
pub fn bundle_hash_from_iframe_api(script: &str) -> Result<Option<String>, StreamError> {
    let re = Regex::new(r"player\\?/([0-9a-zA-Z_-]{8})\\?/")?;
    Ok(re.captures(script).map(|c| c[1].to_string()))
}

/// Outcome of a successful resolution
#[derive(Debug, Clone)]
pub struct FormatResolution {
    pub formats: Vec<ResolvedFormat>,
    /// Persona that produced the formats. An observed player response is
    /// credited to the first page-client persona in the registry, and when
    /// the registry has none the observed response is not used.
    pub persona: String,
    /// Final state of every persona, in registry order
    pub states: Vec<(String, PersonaState)>,
    /// Failures of personas tried before the winner
    pub failures: Vec<PersonaFailure>,
    /// Came straight from the format cache
    pub cached: bool,
}

/// Resolves content ids into fetchable formats
pub struct ClientPersonaResolver {
    registry: PersonaRegistry,
    players: Arc<dyn PlayerSource>,
    signatures: Arc<SignatureResolver>,
    cache: FormatCache,
    locator: Option<Arc<dyn BundleLocator>>,
    located: AsyncCache<(), BundleRef>,
}

impl ClientPersonaResolver {
    pub fn new(
        registry: PersonaRegistry,
        players: Arc<dyn PlayerSource>,
        signatures: Arc<SignatureResolver>,
        cache: FormatCache,
    ) -> Self {
        Self {
            registry,
            players,
            signatures,
            cache,
            locator: None,
            located: new_async_cache_with_capacity(Duration::from_secs(3600), 1),
        }
    }

    pub fn with_locator(mut self, locator: Arc<dyn BundleLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn registry(&self) -> &PersonaRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &FormatCache {
        &self.cache
    }

    /// Resolve formats for a content id
    pub async fn resolve_formats(&self, video_id: &str) -> Result<Vec<ResolvedFormat>, StreamError> {
        Ok(self
            .resolve_observation(&PageObservation::new(video_id))
            .await?
            .formats)
    }

    /// Resolve formats using whatever the observer already captured
    pub async fn resolve_observation(
        &self,
        observation: &PageObservation,
    ) -> Result<FormatResolution, StreamError> {
        let video_id = observation.video_id.as_str();
        if let Some(resolution) = self.cached_resolution(video_id).await {
            return Ok(resolution);
        }

        let personas = self.registry.personas();
        let mut states = untried(personas);
        let mut failures = Vec::new();
        let mut bundle = observation.bundle_ref();

        // The observed player response came from the page client
        let mut observed = observation.parsed_player_response();

        for (position, persona) in personas.iter().enumerate() {
            let prefetched = if PageObservation::is_page_client(persona) {
                observed.take()
            } else {
                None
            };
            let attempt = self
                .attempt(persona, observation, prefetched, &mut bundle)
                .await;

            match attempt {
                Ok(formats) => {
                    info!(
                        "Resolved {} formats for {} via persona {}",
                        formats.len(),
                        video_id,
                        persona.id
                    );
                    states[position].1 = PersonaState::TriedOk;
                    self.cache.insert(video_id, &persona.id, formats.clone()).await;
                    return Ok(FormatResolution {
                        formats,
                        persona: persona.id.clone(),
                        states,
                        failures,
                        cached: false,
                    });
                }
                Err(e) => {
                    let failure = e.persona_failure(&persona.id);
                    states[position].1 = match failure.kind {
                        FailureKind::Unplayable => PersonaState::TriedUnplayable,
                        FailureKind::Error => PersonaState::TriedError,
                    };
                    warn!(
                        "Persona {} failed for {}: {}",
                        persona.id, video_id, failure.reason
                    );
                    failures.push(failure);
                }
            }
        }

        Err(StreamError::Unplayable { attempts: failures })
    }

    /// Highest-priority persona with live cached formats, checked before any
    /// persona is asked again
    async fn cached_resolution(&self, video_id: &str) -> Option<FormatResolution> {
        let personas = self.registry.personas();
        for (position, persona) in personas.iter().enumerate() {
            if let Some(formats) = self.cache.get(video_id, &persona.id).await {
                debug!("Format cache hit for {}/{}", video_id, persona.id);
                let mut states = untried(personas);
                states[position].1 = PersonaState::TriedOk;
                return Some(FormatResolution {
                    formats: (*formats).clone(),
                    persona: persona.id.clone(),
                    states,
                    failures: Vec::new(),
                    cached: true,
                });
            }
        }
        None
    }

    async fn attempt(
        &self,
        persona: &ClientPersona,
        observation: &PageObservation,
        prefetched: Option<Result<PlayerResponse, StreamError>>,
        bundle: &mut Option<BundleRef>,
    ) -> Result<Vec<ResolvedFormat>, StreamError> {
        let response = match prefetched {
            Some(response) => {
                debug!("Using observed player response for {}", persona.id);
                response?
            }
            None => {
                let signature_timestamp = if persona.requires_cipher_solving {
                    self.signature_timestamp(bundle).await
                } else {
                    None
                };
                let request = PlayerRequest {
                    persona: observation.page_persona(persona),
                    video_id: observation.video_id.clone(),
                    signature_timestamp,
                    visitor_data: observation.visitor_data.clone(),
                    session_token: observation.session_token_for(persona),
                };
                self.players.fetch_player(&request).await?
            }
        };

        response.check_playability(&persona.id)?;

        let descriptors = response.descriptors();
        if descriptors.is_empty() {
            return Err(StreamError::NoFormatFound);
        }

        let (drm, clear): (Vec<_>, Vec<_>) = descriptors.into_iter().partition(|d| d.drm);
        if clear.is_empty() {
            return Err(StreamError::PersonaUnplayable {
                persona: persona.id.clone(),
                reason: format!("all {} streams are DRM protected", drm.len()),
            });
        }

        if clear.iter().any(|d| d.is_scrambled()) && bundle.is_none() {
            *bundle = self.locate_bundle().await;
        }

        let resolution = self
            .signatures
            .resolve(bundle.as_ref(), &clear, &persona.id)
            .await;

        if resolution.formats.is_empty() {
            let reason = resolution
                .errors
                .first()
                .map(|e| e.error.to_string())
                .unwrap_or_else(|| "no fetchable streams".to_string());
            return Err(StreamError::Generic(format!(
                "{} of {} streams unresolved: {}",
                resolution.errors.len(),
                clear.len(),
                reason
            )));
        }
        if !resolution.errors.is_empty() {
            debug!(
                "Persona {} dropped {} unresolved streams",
                persona.id,
                resolution.errors.len()
            );
        }
        Ok(resolution.formats)
    }

    async fn signature_timestamp(&self, bundle: &mut Option<BundleRef>) -> Option<u32> {
        if bundle.is_none() {
            *bundle = self.locate_bundle().await;
        }
        let found = bundle.as_ref()?;
        match self.signatures.signature_timestamp(found).await {
            Ok(sts) => sts,
            Err(e) => {
                debug!("No signature timestamp from {}: {}", found.fingerprint, e);
                None
            }
        }
    }

    async fn locate_bundle(&self) -> Option<BundleRef> {
        let locator = self.locator.clone()?;
        match self
            .located
            .try_get_with((), async move { locator.locate().await })
            .await
        {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!("Could not locate player bundle: {}", e);
                None
            }
        }
    }
}

fn untried(personas: &[ClientPersona]) -> Vec<(String, PersonaState)> {
    personas
        .iter()
        .map(|p| (p.id.clone(), PersonaState::NotTried))
        .collect()
}
