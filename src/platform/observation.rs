//! Structured page metadata handed over by an external observer

use crate::error::StreamError;
use crate::platform::cipher::BundleRef;
use crate::platform::innertube::PlayerResponse;
use crate::platform::persona::ClientPersona;
use crate::utils::url::{absolute_bundle_url, is_video_id};
use serde::{Deserialize, Serialize};

/// Client name of the watch page an observer reads from
pub const PAGE_CLIENT_NAME: &str = "WEB";

/// What an observer saw on a watch page. Every field but the id is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageObservation {
    pub video_id: String,
    #[serde(default)]
    pub player_response: Option<serde_json::Value>,
    #[serde(default)]
    pub player_bundle_url: Option<String>,
    #[serde(default)]
    pub visitor_data: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
}

impl PageObservation {
    pub fn new(video_id: &str) -> Self {
        Self {
            video_id: video_id.to_string(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, StreamError> {
        let observation: Self = serde_json::from_str(json)?;
        if !is_video_id(&observation.video_id) {
            return Err(StreamError::InvalidUrl(format!(
                "Malformed video ID in observation: {}",
                observation.video_id
            )));
        }
        Ok(observation)
    }

    pub fn with_player_response(mut self, player_response: serde_json::Value) -> Self {
        self.player_response = Some(player_response);
        self
    }

    pub fn with_bundle_url(mut self, url: &str) -> Self {
        self.player_bundle_url = Some(url.to_string());
        self
    }

    pub fn with_visitor_data(mut self, visitor_data: &str) -> Self {
        self.visitor_data = Some(visitor_data.to_string());
        self
    }

    pub fn with_session_token(mut self, token: &str) -> Self {
        self.session_token = Some(token.to_string());
        self
    }

    pub fn with_client_version(mut self, version: &str) -> Self {
        self.client_version = Some(version.to_string());
        self
    }

    /// Parsed player response, when one was observed
    pub fn parsed_player_response(&self) -> Option<Result<PlayerResponse, StreamError>> {
        self.player_response
            .as_ref()
            .map(|value| PlayerResponse::from_value(value.clone()))
    }

    /// The observed player response, session token and client version all
    /// come from the page's own client, so only that persona may use them.
    pub fn is_page_client(persona: &ClientPersona) -> bool {
        persona.client_name == PAGE_CLIENT_NAME
    }

    /// `persona` with the observed client version, if it is the page client
    pub fn page_persona(&self, persona: &ClientPersona) -> ClientPersona {
        let mut persona = persona.clone();
        if Self::is_page_client(&persona) {
            if let Some(version) = &self.client_version {
                persona.client_version = version.clone();
            }
        }
        persona
    }

    /// Session token to send along with `persona`'s player request
    pub fn session_token_for(&self, persona: &ClientPersona) -> Option<String> {
        if Self::is_page_client(persona) {
            self.session_token.clone()
        } else {
            None
        }
    }

    /// Bundle reference from the observed bundle path
    pub fn bundle_ref(&self) -> Option<BundleRef> {
        self.player_bundle_url
            .as_deref()
            .map(|path| BundleRef::new(&absolute_bundle_url(path)))
    }
}
