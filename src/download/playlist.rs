//! HLS playlist expansion into ordered segment URL lists

use crate::error::StreamError;
use crate::platform::client::VideoClient;
use crate::utils::url::resolve_url;
use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist};
use tracing::{debug, info};

/// A variant stream listed by a master playlist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistVariant {
    pub url: String,
    pub bandwidth: u64,
    pub resolution: Option<(u64, u64)>,
}

/// Parsed playlist with every URI made absolute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPlaylist {
    /// Segment URLs in playback order, init segment first when present
    Media(Vec<String>),
    Master(Vec<PlaylistVariant>),
}

/// Parse playlist text fetched from `base_url`
pub fn parse_playlist(base_url: &str, content: &[u8]) -> Result<ParsedPlaylist, StreamError> {
    match m3u8_rs::parse_playlist_res(content) {
        Ok(Playlist::MediaPlaylist(playlist)) => {
            media_segments(base_url, &playlist).map(ParsedPlaylist::Media)
        }
        Ok(Playlist::MasterPlaylist(playlist)) => {
            variants(base_url, &playlist).map(ParsedPlaylist::Master)
        }
        Err(e) => Err(StreamError::PlaylistError(format!(
            "Failed to parse playlist: {:?}",
            e
        ))),
    }
}

fn media_segments(base_url: &str, playlist: &MediaPlaylist) -> Result<Vec<String>, StreamError> {
    if playlist.segments.is_empty() {
        return Err(StreamError::PlaylistError(
            "Media playlist has no segments".to_string(),
        ));
    }

    let mut urls = Vec::with_capacity(playlist.segments.len() + 1);
    let mut current_map: Option<&str> = None;
    for segment in &playlist.segments {
        // EXT-X-MAP applies until the next one; emit each init segment once
        if let Some(map) = &segment.map {
            if current_map != Some(map.uri.as_str()) {
                urls.push(resolve_url(base_url, &map.uri)?);
                current_map = Some(map.uri.as_str());
            }
        }
        urls.push(resolve_url(base_url, &segment.uri)?);
    }
    Ok(urls)
}

fn variants(base_url: &str, playlist: &MasterPlaylist) -> Result<Vec<PlaylistVariant>, StreamError> {
    playlist
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .map(|v| {
            Ok(PlaylistVariant {
                url: resolve_url(base_url, &v.uri)?,
                bandwidth: v.bandwidth,
                resolution: v.resolution.as_ref().map(|r| (r.width, r.height)),
            })
        })
        .collect()
}

/// Highest-bandwidth variant
pub fn best_variant(variants: &[PlaylistVariant]) -> Option<&PlaylistVariant> {
    variants.iter().max_by_key(|v| v.bandwidth)
}

/// Fetch `url` and expand it into segment URLs. A master playlist is
/// followed one level down through its best variant.
pub async fn expand_playlist(client: &VideoClient, url: &str) -> Result<Vec<String>, StreamError> {
    let content = client.get_text(url).await?;
    match parse_playlist(url, content.as_bytes())? {
        ParsedPlaylist::Media(segments) => {
            info!("Playlist expanded to {} segments", segments.len());
            Ok(segments)
        }
        ParsedPlaylist::Master(variants) => {
            let variant = best_variant(&variants).ok_or_else(|| {
                StreamError::PlaylistError("Master playlist has no variants".to_string())
            })?;
            debug!(
                "Following variant {} ({} bps)",
                variant.url, variant.bandwidth
            );
            let content = client.get_text(&variant.url).await?;
            match parse_playlist(&variant.url, content.as_bytes())? {
                ParsedPlaylist::Media(segments) => {
                    info!("Playlist expanded to {} segments", segments.len());
                    Ok(segments)
                }
                ParsedPlaylist::Master(_) => Err(StreamError::PlaylistError(
                    "Nested master playlists are not supported".to_string(),
                )),
            }
        }
    }
}
