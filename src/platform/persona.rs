//! Client personas: the simulated client identities used for metadata requests

use crate::error::StreamError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// One simulated client identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientPersona {
    /// Stable identifier, e.g. `web` or `android_vr`
    pub id: String,
    pub display_name: String,
    /// Value of `context.client.clientName`
    pub client_name: String,
    pub client_version: String,
    /// Numeric id sent as `X-YouTube-Client-Name`
    pub client_id: u32,
    #[serde(default)]
    pub device_make: Option<String>,
    #[serde(default)]
    pub device_model: Option<String>,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub form_factor: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Streams from this persona carry a signature cipher or `n` parameter
    pub requires_cipher_solving: bool,
    /// Extra fields merged into `context.client`
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra_client_fields: serde_json::Map<String, serde_json::Value>,
}

impl ClientPersona {
    /// `context.client` object for a player request
    pub fn client_context(&self, visitor_data: Option<&str>) -> serde_json::Value {
        let mut client = serde_json::Map::new();
        client.insert("clientName".into(), self.client_name.clone().into());
        client.insert("clientVersion".into(), self.client_version.clone().into());
        client.insert("hl".into(), "en".into());
        client.insert("gl".into(), "US".into());

        let optional = [
            ("deviceMake", &self.device_make),
            ("deviceModel", &self.device_model),
            ("osName", &self.os_name),
            ("osVersion", &self.os_version),
            ("platform", &self.platform),
            ("clientFormFactor", &self.form_factor),
            ("userAgent", &self.user_agent),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                client.insert(key.into(), value.clone().into());
            }
        }
        if let Some(visitor) = visitor_data {
            client.insert("visitorData".into(), visitor.into());
        }
        for (key, value) in &self.extra_client_fields {
            client.insert(key.clone(), value.clone());
        }
        serde_json::Value::Object(client)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryDocument {
    List(Vec<ClientPersona>),
    Wrapped { personas: Vec<ClientPersona> },
}

/// Ordered persona list; order is the fallback sequence
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    personas: Vec<ClientPersona>,
}

impl PersonaRegistry {
    /// Build a registry, rejecting lists with no cipher-free persona
    pub fn new(personas: Vec<ClientPersona>) -> Result<Self, StreamError> {
        if personas.is_empty() {
            return Err(StreamError::Registry("persona list is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for persona in &personas {
            if persona.id.trim().is_empty() {
                return Err(StreamError::Registry("persona with empty id".to_string()));
            }
            if !seen.insert(persona.id.as_str()) {
                return Err(StreamError::Registry(format!(
                    "duplicate persona id `{}`",
                    persona.id
                )));
            }
        }

        if personas.iter().all(|p| p.requires_cipher_solving) {
            return Err(StreamError::Registry(
                "at least one persona must not require cipher solving".to_string(),
            ));
        }

        Ok(Self { personas })
    }

    /// Built-in persona table
    pub fn builtin() -> Self {
        Self {
            personas: builtin_personas(),
        }
    }

    /// Parse a JSON array of personas, or `{"personas": [...]}`
    pub fn from_json(json: &str) -> Result<Self, StreamError> {
        let personas = match serde_json::from_str::<RegistryDocument>(json)? {
            RegistryDocument::List(personas) => personas,
            RegistryDocument::Wrapped { personas } => personas,
        };
        Self::new(personas)
    }

    pub fn from_file(path: &Path) -> Result<Self, StreamError> {
        let content = std::fs::read_to_string(path)?;
        let registry = Self::from_json(&content)?;
        debug!(
            "Loaded {} personas from {}",
            registry.personas.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Keep only `ids`, in the given order
    pub fn restricted_to(&self, ids: &[String]) -> Result<Self, StreamError> {
        let personas = ids
            .iter()
            .map(|id| {
                self.get(id)
                    .cloned()
                    .ok_or_else(|| StreamError::Registry(format!("unknown persona `{}`", id)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(personas)
    }

    pub fn personas(&self) -> &[ClientPersona] {
        &self.personas
    }

    pub fn get(&self, id: &str) -> Option<&ClientPersona> {
        self.personas.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

impl Default for PersonaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn persona(
    id: &str,
    display_name: &str,
    client_name: &str,
    client_version: &str,
    client_id: u32,
    requires_cipher_solving: bool,
) -> ClientPersona {
    ClientPersona {
        id: id.to_string(),
        display_name: display_name.to_string(),
        client_name: client_name.to_string(),
        client_version: client_version.to_string(),
        client_id,
        device_make: None,
        device_model: None,
        os_name: None,
        os_version: None,
        platform: None,
        form_factor: None,
        user_agent: None,
        requires_cipher_solving,
        extra_client_fields: serde_json::Map::new(),
    }
}

fn builtin_personas() -> Vec<ClientPersona> {
    let mut web = persona("web", "Web", "WEB", "2.20250925.01.00", 1, true);
    web.platform = Some("DESKTOP".to_string());
    web.os_name = Some("Windows".to_string());
    web.os_version = Some("10.0".to_string());
    web.user_agent = Some(
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36"
            .to_string(),
    );

    let mut android_vr = persona("android_vr", "Android VR", "ANDROID_VR", "1.65.10", 28, false);
    android_vr.device_make = Some("Oculus".to_string());
    android_vr.device_model = Some("Quest 3".to_string());
    android_vr.os_name = Some("Android".to_string());
    android_vr.os_version = Some("12L".to_string());
    android_vr.platform = Some("MOBILE".to_string());
    android_vr.user_agent = Some(
        "com.google.android.apps.youtube.vr.oculus/1.65.10 (Linux; U; Android 12L; eureka-user Build/SQ3A.220605.009.A1) gzip"
            .to_string(),
    );
    android_vr
        .extra_client_fields
        .insert("androidSdkVersion".into(), 32.into());

    let mut ios = persona("ios", "iOS", "IOS", "20.10.4", 5, false);
    ios.device_make = Some("Apple".to_string());
    ios.device_model = Some("iPhone16,2".to_string());
    ios.os_name = Some("iPhone".to_string());
    ios.os_version = Some("18.3.2.22D82".to_string());
    ios.platform = Some("MOBILE".to_string());
    ios.user_agent = Some(
        "com.google.ios.youtube/20.10.4 (iPhone16,2; U; CPU iOS 18_3_2 like Mac OS X;)".to_string(),
    );

    let mut mweb = persona("mweb", "Mobile Web", "MWEB", "2.20250925.01.00", 2, true);
    mweb.platform = Some("MOBILE".to_string());
    mweb.form_factor = Some("SMALL_FORM_FACTOR".to_string());
    mweb.user_agent = Some(
        "Mozilla/5.0 (iPad; CPU OS 16_7_10 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Mobile/15E148 Safari/604.1,gzip(gfe)"
            .to_string(),
    );

    let mut tv = persona("tv", "TV", "TVHTML5", "7.20250923.13.00", 7, true);
    tv.platform = Some("TV".to_string());
    tv.user_agent = Some("Mozilla/5.0 (ChromiumStylePlatform) Cobalt/Version".to_string());

    let mut tv_embedded = persona(
        "tv_embedded",
        "TV Embedded",
        "TVHTML5_SIMPLY_EMBEDDED_PLAYER",
        "2.0",
        85,
        true,
    );
    tv_embedded.platform = Some("TV".to_string());

    vec![web, android_vr, ios, mweb, tv, tv_embedded]
}
