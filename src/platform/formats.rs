//! Stream descriptors, resolved formats and format selection

use crate::error::StreamError;
use crate::platform::innertube::FormatData;
use crate::utils::url::{parse_expiry, query_param};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Parsed `signatureCipher` field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureCipher {
    /// Scrambled signature
    pub s: String,
    /// Query parameter the descrambled signature goes into
    pub sp: String,
    /// Base stream URL
    pub url: String,
}

impl SignatureCipher {
    /// Parse the urlencoded `s=...&sp=...&url=...` form
    pub fn parse(raw: &str) -> Result<Self, StreamError> {
        let mut s = None;
        let mut sp = None;
        let mut url = None;
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            match key.as_ref() {
                "s" => s = Some(value.into_owned()),
                "sp" => sp = Some(value.into_owned()),
                "url" => url = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(Self {
            s: s.ok_or_else(|| StreamError::Generic("signature cipher without `s`".to_string()))?,
            sp: sp.unwrap_or_else(|| "signature".to_string()),
            url: url
                .ok_or_else(|| StreamError::Generic("signature cipher without `url`".to_string()))?,
        })
    }
}

/// One stream as described by a player response, possibly still scrambled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub itag: u32,
    pub mime_type: String,
    pub bitrate: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub quality_label: Option<String>,
    /// Direct URL, absent when the stream is behind a signature cipher
    pub url: Option<String>,
    pub signature_cipher: Option<SignatureCipher>,
    pub content_length: Option<u64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub audio_sample_rate: Option<u32>,
    pub audio_channels: Option<u32>,
    pub drm: bool,
}

impl StreamDescriptor {
    /// Normalize one raw format entry
    pub fn from_format_data(data: &FormatData) -> Result<Self, StreamError> {
        let signature_cipher = data
            .signature_cipher
            .as_deref()
            .or(data.cipher.as_deref())
            .map(SignatureCipher::parse)
            .transpose()?;

        if data.url.is_none() && signature_cipher.is_none() {
            return Err(StreamError::Generic(format!(
                "format {} has neither url nor signature cipher",
                data.itag
            )));
        }

        let (video_codec, audio_codec) = split_codecs(&data.mime_type);

        Ok(Self {
            itag: data.itag,
            mime_type: data.mime_type.clone(),
            bitrate: data.bitrate.unwrap_or(0),
            width: data.width,
            height: data.height,
            fps: data.fps,
            quality_label: data.quality_label.clone(),
            url: data.url.clone(),
            signature_cipher,
            content_length: data.content_length.as_ref().and_then(|s| s.parse().ok()),
            video_codec,
            audio_codec,
            audio_sample_rate: data.audio_sample_rate.as_ref().and_then(|s| s.parse().ok()),
            audio_channels: data.audio_channels,
            drm: data.drm_families.as_ref().map_or(false, |f| !f.is_empty()),
        })
    }

    /// URL the resolved values get written into
    pub fn base_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .or(self.signature_cipher.as_ref().map(|c| c.url.as_str()))
    }

    /// Throttling parameter carried by the base URL
    pub fn n_param(&self) -> Option<String> {
        self.base_url().and_then(|u| query_param(u, "n"))
    }

    pub fn needs_cipher(&self) -> bool {
        self.signature_cipher.is_some()
    }

    pub fn needs_n(&self) -> bool {
        self.n_param().is_some()
    }

    /// Whether any field needs the signature resolver
    pub fn is_scrambled(&self) -> bool {
        self.needs_cipher() || self.needs_n()
    }
}

/// A descriptor whose URL is directly fetchable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFormat {
    pub itag: u32,
    pub url: String,
    pub mime_type: String,
    pub bitrate: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub quality_label: Option<String>,
    pub content_length: Option<u64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub audio_sample_rate: Option<u32>,
    pub audio_channels: Option<u32>,
    /// Persona that produced this format
    pub persona: String,
    /// Parsed from the URL `expire` parameter
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResolvedFormat {
    pub fn from_descriptor(descriptor: &StreamDescriptor, url: String, persona: &str) -> Self {
        Self {
            itag: descriptor.itag,
            expires_at: parse_expiry(&url),
            url,
            mime_type: descriptor.mime_type.clone(),
            bitrate: descriptor.bitrate,
            width: descriptor.width,
            height: descriptor.height,
            fps: descriptor.fps,
            quality_label: descriptor.quality_label.clone(),
            content_length: descriptor.content_length,
            video_codec: descriptor.video_codec.clone(),
            audio_codec: descriptor.audio_codec.clone(),
            audio_sample_rate: descriptor.audio_sample_rate,
            audio_channels: descriptor.audio_channels,
            persona: persona.to_string(),
        }
    }

    /// Video and audio in one stream
    pub fn is_progressive(&self) -> bool {
        self.mime_type.starts_with("video/") && self.audio_codec.is_some()
    }

    pub fn is_video_only(&self) -> bool {
        self.mime_type.starts_with("video/") && self.audio_codec.is_none()
    }

    pub fn is_audio_only(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    /// Container from the MIME essence
    pub fn container(&self) -> &'static str {
        match mime_essence(&self.mime_type) {
            "video/mp4" | "audio/mp4" => "mp4",
            "video/webm" | "audio/webm" => "webm",
            "video/3gpp" => "3gp",
            "video/mp2t" => "ts",
            _ => "unknown",
        }
    }

    /// File extension for saving this stream
    pub fn extension(&self) -> &'static str {
        match mime_essence(&self.mime_type) {
            "audio/mp4" => "m4a",
            "audio/webm" => "weba",
            _ => match self.container() {
                "unknown" => "bin",
                other => other,
            },
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    pub fn quality_string(&self) -> String {
        if let Some(label) = &self.quality_label {
            label.clone()
        } else if let (Some(width), Some(height)) = (self.width, self.height) {
            format!("{}x{}", width, height)
        } else if self.is_audio_only() {
            "audio".to_string()
        } else {
            "unknown".to_string()
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(itag: u32, mime_type: &str) -> Self {
        Self {
            itag,
            url: format!("https://cdn.example/videoplayback?itag={}", itag),
            mime_type: mime_type.to_string(),
            bitrate: 0,
            width: None,
            height: None,
            fps: None,
            quality_label: None,
            content_length: None,
            video_codec: None,
            audio_codec: None,
            audio_sample_rate: None,
            audio_channels: None,
            persona: "test".to_string(),
            expires_at: None,
        }
    }
}

fn mime_essence(mime_type: &str) -> &str {
    mime_type.split(';').next().unwrap_or_default().trim()
}

/// Split `codecs="avc1.4d401f, mp4a.40.2"` into (video, audio)
fn split_codecs(mime_type: &str) -> (Option<String>, Option<String>) {
    let codecs: Vec<String> = mime_type
        .split_once("codecs=")
        .map(|(_, rest)| {
            rest.trim_matches(|c| c == '"' || c == ' ')
                .split(',')
                .map(|c| c.trim().trim_matches('"').to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if mime_type.starts_with("audio/") {
        return (None, codecs.into_iter().next());
    }
    let mut iter = codecs.into_iter();
    (iter.next(), iter.next())
}

/// Quality selection criteria
#[derive(Debug, Clone, PartialEq)]
pub enum QualitySelector {
    /// Best progressive stream, else highest bitrate
    Best,
    Worst,
    BestAudio,
    BestVideo,
    Itag(u32),
    Height(u32),
    HeightLessOrEqual(u32),
}

impl FromStr for QualitySelector {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let invalid = || StreamError::Generic(format!("invalid quality selector: {}", s));
        match s.as_str() {
            "best" => Ok(QualitySelector::Best),
            "worst" => Ok(QualitySelector::Worst),
            "bestaudio" | "audio" => Ok(QualitySelector::BestAudio),
            "bestvideo" | "video" => Ok(QualitySelector::BestVideo),
            _ => {
                if let Some(v) = s.strip_prefix("itag=") {
                    v.parse().map(QualitySelector::Itag).map_err(|_| invalid())
                } else if let Some(v) = s.strip_prefix("height<=") {
                    v.parse().map(QualitySelector::HeightLessOrEqual).map_err(|_| invalid())
                } else if let Some(v) = s.strip_prefix("height=") {
                    v.parse().map(QualitySelector::Height).map_err(|_| invalid())
                } else if let Some(v) = s.strip_suffix('p') {
                    v.parse().map(QualitySelector::Height).map_err(|_| invalid())
                } else {
                    Err(invalid())
                }
            }
        }
    }
}

/// Format selector for choosing among resolved formats
#[derive(Debug, Clone)]
pub struct FormatSelector {
    pub quality: QualitySelector,
    /// Required container, e.g. `mp4`
    pub container: Option<String>,
}

impl FormatSelector {
    pub fn new(quality: QualitySelector) -> Self {
        Self {
            quality,
            container: None,
        }
    }

    pub fn with_container(mut self, container: &str) -> Self {
        self.container = Some(container.to_string());
        self
    }
}

/// Pick one format according to `selector`
pub fn select_format<'a>(
    formats: &'a [ResolvedFormat],
    selector: &FormatSelector,
) -> Result<&'a ResolvedFormat, StreamError> {
    let candidates: Vec<&ResolvedFormat> = formats
        .iter()
        .filter(|f| {
            selector
                .container
                .as_deref()
                .map_or(true, |c| f.container() == c)
        })
        .collect();

    let chosen = match &selector.quality {
        QualitySelector::Best => best_progressive(&candidates)
            .or_else(|| candidates.iter().copied().max_by_key(|f| f.bitrate)),
        QualitySelector::Worst => candidates.iter().copied().min_by_key(|f| f.bitrate),
        QualitySelector::BestAudio => candidates
            .iter()
            .copied()
            .filter(|f| f.is_audio_only())
            .max_by_key(|f| f.bitrate),
        QualitySelector::BestVideo => candidates
            .iter()
            .copied()
            .filter(|f| f.is_video_only())
            .max_by_key(|f| (f.height.unwrap_or(0), f.bitrate)),
        QualitySelector::Itag(itag) => candidates.iter().copied().find(|f| f.itag == *itag),
        QualitySelector::Height(height) => candidates
            .iter()
            .copied()
            .filter(|f| f.height == Some(*height))
            .max_by_key(|f| (f.audio_codec.is_some(), f.bitrate)),
        QualitySelector::HeightLessOrEqual(height) => candidates
            .iter()
            .copied()
            .filter(|f| f.height.map_or(false, |h| h <= *height))
            .max_by_key(|f| (f.height, f.bitrate)),
    };

    chosen.ok_or(StreamError::NoFormatFound)
}

fn best_progressive<'a>(candidates: &[&'a ResolvedFormat]) -> Option<&'a ResolvedFormat> {
    candidates
        .iter()
        .copied()
        .filter(|f| f.is_progressive())
        .max_by_key(|f| (f.height.unwrap_or(0), f.bitrate))
}

/// Best progressive (video+audio) format
pub fn get_best_progressive_format(formats: &[ResolvedFormat]) -> Option<&ResolvedFormat> {
    let all: Vec<&ResolvedFormat> = formats.iter().collect();
    best_progressive(&all)
}

/// Best audio-only format
pub fn get_best_audio_format(formats: &[ResolvedFormat]) -> Option<&ResolvedFormat> {
    formats
        .iter()
        .filter(|f| f.is_audio_only())
        .max_by_key(|f| f.bitrate)
}

/// Best video-only format
pub fn get_best_video_format(formats: &[ResolvedFormat]) -> Option<&ResolvedFormat> {
    formats
        .iter()
        .filter(|f| f.is_video_only())
        .max_by_key(|f| (f.height.unwrap_or(0), f.bitrate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> FormatData {
        serde_json::from_str(json).unwrap()
    }

    fn resolved(itag: u32, mime: &str, height: Option<u32>, bitrate: u64) -> ResolvedFormat {
        let mut f = ResolvedFormat::for_tests(itag, mime);
        let (video, audio) = split_codecs(mime);
        f.video_codec = video;
        f.audio_codec = audio;
        f.height = height;
        f.bitrate = bitrate;
        f
    }

    #[test]
    fn test_signature_cipher_parsing() {
        let cipher = SignatureCipher::parse(
            "s=AOq0QJ8wRAIg%3D%3D&sp=sig&url=https%3A%2F%2Fr1.example.com%2Fvideoplayback%3Fitag%3D18%26n%3DabcD",
        )
        .unwrap();
        assert_eq!(cipher.s, "AOq0QJ8wRAIg==");
        assert_eq!(cipher.sp, "sig");
        assert_eq!(cipher.url, "https://r1.example.com/videoplayback?itag=18&n=abcD");

        let default_sp = SignatureCipher::parse("s=abc&url=https%3A%2F%2Fcdn.example%2Fv").unwrap();
        assert_eq!(default_sp.sp, "signature");

        assert!(SignatureCipher::parse("sp=sig").is_err());
    }

    #[test]
    fn test_descriptor_from_ciphered_format() {
        let data = raw(
            r#"{
                "itag": 18,
                "mimeType": "video/mp4; codecs=\"avc1.42001E, mp4a.40.2\"",
                "bitrate": 503000,
                "width": 640,
                "height": 360,
                "qualityLabel": "360p",
                "contentLength": "1048576",
                "signatureCipher": "s=xyz&sp=sig&url=https%3A%2F%2Fcdn.example%2Fv%3Fn%3Dnnn"
            }"#,
        );
        let descriptor = StreamDescriptor::from_format_data(&data).unwrap();

        assert!(descriptor.needs_cipher());
        assert_eq!(descriptor.n_param().as_deref(), Some("nnn"));
        assert_eq!(descriptor.content_length, Some(1_048_576));
        assert_eq!(descriptor.video_codec.as_deref(), Some("avc1.42001E"));
        assert_eq!(descriptor.audio_codec.as_deref(), Some("mp4a.40.2"));
        assert!(!descriptor.drm);
    }

    #[test]
    fn test_plain_descriptor_is_not_scrambled() {
        let data = raw(
            r#"{"itag": 140, "mimeType": "audio/mp4; codecs=\"mp4a.40.2\"", "url": "https://cdn.example/v?itag=140"}"#,
        );
        let descriptor = StreamDescriptor::from_format_data(&data).unwrap();
        assert!(!descriptor.is_scrambled());
        assert_eq!(descriptor.audio_codec.as_deref(), Some("mp4a.40.2"));
        assert!(descriptor.video_codec.is_none());
    }

    #[test]
    fn test_drm_flag_and_missing_url() {
        let drm = raw(
            r#"{"itag": 137, "mimeType": "video/mp4", "url": "https://cdn.example/v", "drmFamilies": ["WIDEVINE"]}"#,
        );
        assert!(StreamDescriptor::from_format_data(&drm).unwrap().drm);

        let empty = raw(r#"{"itag": 137, "mimeType": "video/mp4"}"#);
        assert!(StreamDescriptor::from_format_data(&empty).is_err());
    }

    #[test]
    fn test_quality_selector_parsing() {
        assert_eq!("best".parse::<QualitySelector>().unwrap(), QualitySelector::Best);
        assert_eq!("itag=22".parse::<QualitySelector>().unwrap(), QualitySelector::Itag(22));
        assert_eq!("720p".parse::<QualitySelector>().unwrap(), QualitySelector::Height(720));
        assert_eq!(
            "height<=480".parse::<QualitySelector>().unwrap(),
            QualitySelector::HeightLessOrEqual(480)
        );
        assert!("sharpest".parse::<QualitySelector>().is_err());
    }

    #[test]
    fn test_select_format() {
        let formats = vec![
            resolved(18, "video/mp4; codecs=\"avc1, mp4a\"", Some(360), 500_000),
            resolved(137, "video/mp4; codecs=\"avc1\"", Some(1080), 4_000_000),
            resolved(248, "video/webm; codecs=\"vp9\"", Some(1080), 3_000_000),
            resolved(140, "audio/mp4; codecs=\"mp4a\"", None, 128_000),
            resolved(251, "audio/webm; codecs=\"opus\"", None, 160_000),
        ];

        let best = select_format(&formats, &FormatSelector::new(QualitySelector::Best)).unwrap();
        assert_eq!(best.itag, 18);

        let audio = select_format(&formats, &FormatSelector::new(QualitySelector::BestAudio)).unwrap();
        assert_eq!(audio.itag, 251);

        let mp4_audio = select_format(
            &formats,
            &FormatSelector::new(QualitySelector::BestAudio).with_container("mp4"),
        )
        .unwrap();
        assert_eq!(mp4_audio.itag, 140);

        let video = select_format(&formats, &FormatSelector::new(QualitySelector::BestVideo)).unwrap();
        assert_eq!(video.itag, 137);

        let capped = select_format(
            &formats,
            &FormatSelector::new(QualitySelector::HeightLessOrEqual(720)),
        )
        .unwrap();
        assert_eq!(capped.itag, 18);

        assert!(matches!(
            select_format(&formats, &FormatSelector::new(QualitySelector::Itag(999))),
            Err(StreamError::NoFormatFound)
        ));
    }

    #[test]
    fn test_extension_and_expiry() {
        let mut audio = resolved(140, "audio/mp4; codecs=\"mp4a\"", None, 0);
        assert_eq!(audio.extension(), "m4a");
        audio.url = "https://cdn.example/v?expire=100".to_string();
        let descriptor = StreamDescriptor {
            itag: 140,
            mime_type: audio.mime_type.clone(),
            bitrate: 0,
            width: None,
            height: None,
            fps: None,
            quality_label: None,
            url: Some(audio.url.clone()),
            signature_cipher: None,
            content_length: None,
            video_codec: None,
            audio_codec: Some("mp4a".to_string()),
            audio_sample_rate: None,
            audio_channels: None,
            drm: false,
        };
        let resolved = ResolvedFormat::from_descriptor(&descriptor, audio.url.clone(), "ios");
        assert_eq!(resolved.expires_at.map(|t| t.timestamp()), Some(100));
        assert!(resolved.is_expired(Utc::now()));
        assert_eq!(resolved.persona, "ios");
    }
}
