//! Player endpoint client and response types

use crate::error::StreamError;
use crate::platform::client::VideoClient;
use crate::platform::formats::StreamDescriptor;
use crate::platform::persona::ClientPersona;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://www.youtube.com";

/// Parameters of one player request
#[derive(Debug, Clone)]
pub struct PlayerRequest {
    pub persona: ClientPersona,
    pub video_id: String,
    /// Sent in the playback context of cipher-requiring personas
    pub signature_timestamp: Option<u32>,
    pub visitor_data: Option<String>,
    /// Identity token observed on the watch page
    pub session_token: Option<String>,
}

impl PlayerRequest {
    /// JSON body for the player endpoint
    pub fn body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "context": {
                "client": self.persona.client_context(self.visitor_data.as_deref()),
            },
            "videoId": self.video_id,
            "contentCheckOk": true,
            "racyCheckOk": true,
        });
        if let Some(sts) = self.signature_timestamp {
            body["playbackContext"] = serde_json::json!({
                "contentPlaybackContext": { "signatureTimestamp": sts }
            });
        }
        body
    }
}

/// Anything that can produce a player response for a persona
#[async_trait]
pub trait PlayerSource: Send + Sync {
    async fn fetch_player(&self, request: &PlayerRequest) -> Result<PlayerResponse, StreamError>;
}

/// Player endpoint client
pub struct InnerTubeClient {
    http_client: VideoClient,
    base_url: String,
}

impl InnerTubeClient {
    pub fn new(http_client: VideoClient) -> Self {
        Self {
            http_client,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the client at another host
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn player_url(&self) -> String {
        format!("{}/youtubei/v1/player?prettyPrint=false", self.base_url)
    }
}

#[async_trait]
impl PlayerSource for InnerTubeClient {
    async fn fetch_player(&self, request: &PlayerRequest) -> Result<PlayerResponse, StreamError> {
        let url = self.player_url();
        debug!(
            "Requesting player response for {} as {}",
            request.video_id, request.persona.id
        );

        let mut http = self
            .http_client
            .create_innertube_request(&url, &request.persona)
            .json(&request.body());
        if let Some(visitor) = &request.visitor_data {
            http = http.header("X-Goog-Visitor-Id", visitor.as_str());
        }
        if let Some(token) = &request.session_token {
            http = http.header("X-Youtube-Identity-Token", token.as_str());
        }

        let response = http.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(
                "Player request as {} failed with status {}",
                request.persona.id, status
            );
            return Err(StreamError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        Ok(response.json().await?)
    }
}

/// Player response from the metadata endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerResponse {
    #[serde(rename = "responseContext")]
    pub response_context: Option<ResponseContext>,
    #[serde(rename = "playabilityStatus")]
    pub playability_status: Option<PlayabilityStatus>,
    #[serde(rename = "videoDetails")]
    pub video_details: Option<VideoDetails>,
    #[serde(rename = "streamingData")]
    pub streaming_data: Option<StreamingData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseContext {
    #[serde(rename = "visitorData")]
    pub visitor_data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayabilityStatus {
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoDetails {
    #[serde(rename = "videoId")]
    pub video_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(rename = "lengthSeconds", default)]
    pub length_seconds: Option<String>,
    #[serde(rename = "isLive", default)]
    pub is_live: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingData {
    pub formats: Option<Vec<FormatData>>,
    #[serde(rename = "adaptiveFormats")]
    pub adaptive_formats: Option<Vec<FormatData>>,
    #[serde(rename = "expiresInSeconds")]
    pub expires_in_seconds: Option<String>,
    #[serde(rename = "hlsManifestUrl")]
    pub hls_manifest_url: Option<String>,
}

/// One raw format entry
#[derive(Debug, Clone, Deserialize)]
pub struct FormatData {
    pub itag: u32,
    pub url: Option<String>,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(default, deserialize_with = "number_or_string")]
    pub bitrate: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    #[serde(rename = "qualityLabel")]
    pub quality_label: Option<String>,
    #[serde(rename = "contentLength")]
    pub content_length: Option<String>,
    #[serde(rename = "signatureCipher")]
    pub signature_cipher: Option<String>,
    pub cipher: Option<String>,
    #[serde(rename = "audioSampleRate")]
    pub audio_sample_rate: Option<String>,
    #[serde(rename = "audioChannels")]
    pub audio_channels: Option<u32>,
    #[serde(rename = "drmFamilies")]
    pub drm_families: Option<Vec<String>>,
}

fn number_or_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }))
}

impl PlayerResponse {
    /// Parse a raw player-response blob
    pub fn from_value(value: serde_json::Value) -> Result<Self, StreamError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Map a refusal in `playabilityStatus` to [`StreamError::PersonaUnplayable`]
    pub fn check_playability(&self, persona: &str) -> Result<(), StreamError> {
        let Some(status) = &self.playability_status else {
            return Ok(());
        };
        match status.status.as_str() {
            "OK" => Ok(()),
            "ERROR" | "LOGIN_REQUIRED" | "UNPLAYABLE" | "CONTENT_CHECK_REQUIRED"
            | "AGE_CHECK_REQUIRED" | "LIVE_STREAM_OFFLINE" => {
                let reason = status
                    .reason
                    .clone()
                    .unwrap_or_else(|| "no reason given".to_string());
                warn!("Persona {} refused content: {} ({})", persona, status.status, reason);
                Err(StreamError::PersonaUnplayable {
                    persona: persona.to_string(),
                    reason: format!("{}: {}", status.status, reason),
                })
            }
            other => {
                debug!("Unrecognized playability status {}", other);
                Ok(())
            }
        }
    }

    /// All progressive and adaptive entries as descriptors.
    ///
    /// Entries that carry neither a URL nor a cipher are dropped.
    pub fn descriptors(&self) -> Vec<StreamDescriptor> {
        let Some(data) = &self.streaming_data else {
            return Vec::new();
        };
        data.formats
            .iter()
            .flatten()
            .chain(data.adaptive_formats.iter().flatten())
            .filter_map(|raw| match StreamDescriptor::from_format_data(raw) {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    debug!("Skipping format {}: {}", raw.itag, e);
                    None
                }
            })
            .collect()
    }

    pub fn hls_manifest_url(&self) -> Option<&str> {
        self.streaming_data
            .as_ref()
            .and_then(|d| d.hls_manifest_url.as_deref())
    }

    pub fn visitor_data(&self) -> Option<&str> {
        self.response_context
            .as_ref()
            .and_then(|c| c.visitor_data.as_deref())
    }

    pub fn title(&self) -> Option<&str> {
        self.video_details.as_ref().map(|d| d.title.as_str())
    }
}
