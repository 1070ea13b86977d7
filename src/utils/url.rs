//! URL utilities: content ids, query rewriting, expiry and bundle fingerprints

use crate::error::StreamError;
use chrono::{DateTime, TimeZone, Utc};
use url::Url;

/// Extract a content id from a watch URL, short link, shorts/embed path or a bare id
pub fn extract_video_id(input: &str) -> Result<String, StreamError> {
    let input = input.trim();
    if is_video_id(input) {
        return Ok(input.to_string());
    }

    let parsed = Url::parse(input)?;

    let id = match parsed.host_str() {
        Some("youtu.be") => parsed
            .path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| StreamError::InvalidUrl("Missing video ID".to_string()))?,
        Some("youtube.com")
        | Some("www.youtube.com")
        | Some("m.youtube.com")
        | Some("music.youtube.com") => {
            let path = parsed.path();
            if path.starts_with("/watch") {
                parsed
                    .query_pairs()
                    .find(|(key, _)| key == "v")
                    .map(|(_, value)| value.to_string())
                    .ok_or_else(|| StreamError::InvalidUrl("Missing v parameter".to_string()))?
            } else if let Some(rest) = ["/shorts/", "/embed/", "/live/", "/v/"]
                .iter()
                .find_map(|prefix| path.strip_prefix(prefix))
            {
                rest.split('/').next().unwrap_or_default().to_string()
            } else {
                return Err(StreamError::InvalidUrl(format!(
                    "Unsupported video URL path: {}",
                    path
                )));
            }
        }
        _ => {
            return Err(StreamError::InvalidUrl(
                "Not a supported video platform URL".to_string(),
            ))
        }
    };

    if !is_video_id(&id) {
        return Err(StreamError::InvalidUrl(format!("Malformed video ID: {}", id)));
    }
    Ok(id)
}

/// Check whether `s` has the shape of a content id
pub fn is_video_id(s: &str) -> bool {
    s.len() == 11
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Read a single query parameter
pub fn query_param(url: &str, key: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Replace (or append) a query parameter, keeping every other pair in order
pub fn set_query_param(url: &str, key: &str, value: &str) -> Result<String, StreamError> {
    let mut parsed = Url::parse(url)?;
    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    match pairs.iter_mut().find(|(k, _)| k == key) {
        Some(pair) => pair.1 = value.to_string(),
        None => pairs.push((key.to_string(), value.to_string())),
    }

    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    Ok(parsed.to_string())
}

/// Parse the `expire` query parameter (unix seconds) of a stream URL
pub fn parse_expiry(url: &str) -> Option<DateTime<Utc>> {
    let seconds: i64 = query_param(url, "expire")?.parse().ok()?;
    Utc.timestamp_opt(seconds, 0).single()
}

/// Resolve a possibly relative reference against a base URL
pub fn resolve_url(base: &str, reference: &str) -> Result<String, StreamError> {
    if let Ok(absolute) = Url::parse(reference) {
        return Ok(absolute.to_string());
    }
    let base = Url::parse(base)?;
    Ok(base.join(reference)?.to_string())
}

/// Version fingerprint from a player bundle URL (`/s/player/<hash>/...`)
pub fn bundle_fingerprint(bundle_url: &str) -> Option<String> {
    let marker = "/s/player/";
    let start = bundle_url.find(marker)? + marker.len();
    let rest = &bundle_url[start..];
    let hash = rest.split('/').next()?;
    if hash.is_empty() {
        None
    } else {
        Some(hash.to_string())
    }
}

/// Make a root-relative bundle path absolute on the watch host
pub fn absolute_bundle_url(path: &str) -> String {
    if path.starts_with("//") {
        format!("https:{}", path)
    } else if path.starts_with('/') {
        format!("https://www.youtube.com{}", path)
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_video_id() {
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap(),
            "dQw4w9WgXcQ"
        );
        assert_eq!(
            extract_video_id("https://youtu.be/dQw4w9WgXcQ?t=10").unwrap(),
            "dQw4w9WgXcQ"
        );
        assert_eq!(
            extract_video_id("https://www.youtube.com/shorts/brZCOVlyPPo").unwrap(),
            "brZCOVlyPPo"
        );
        assert_eq!(
            extract_video_id("https://www.youtube.com/embed/dQw4w9WgXcQ").unwrap(),
            "dQw4w9WgXcQ"
        );
        assert_eq!(extract_video_id("dQw4w9WgXcQ").unwrap(), "dQw4w9WgXcQ");

        assert!(extract_video_id("https://www.youtube.com/watch").is_err());
        assert!(extract_video_id("https://example.com/watch?v=dQw4w9WgXcQ").is_err());
        assert!(extract_video_id("https://www.youtube.com/watch?v=short").is_err());
    }

    #[test]
    fn test_set_query_param_replaces_in_place() {
        let url = "https://r1.example.com/videoplayback?expire=1700000000&n=abc&itag=22";
        let updated = set_query_param(url, "n", "xyz").unwrap();
        assert_eq!(
            updated,
            "https://r1.example.com/videoplayback?expire=1700000000&n=xyz&itag=22"
        );

        let appended = set_query_param(url, "sig", "a/b=").unwrap();
        assert_eq!(query_param(&appended, "sig").as_deref(), Some("a/b="));
        assert_eq!(query_param(&appended, "itag").as_deref(), Some("22"));
    }

    #[test]
    fn test_parse_expiry() {
        let expiry = parse_expiry("https://cdn.example/v?expire=1700000000&x=1").unwrap();
        assert_eq!(expiry.timestamp(), 1_700_000_000);
        assert!(parse_expiry("https://cdn.example/v?x=1").is_none());
        assert!(parse_expiry("https://cdn.example/v?expire=soon").is_none());
    }

    #[test]
    fn test_resolve_url() {
        assert_eq!(
            resolve_url("https://cdn.example/hls/list.m3u8", "seg-1.ts").unwrap(),
            "https://cdn.example/hls/seg-1.ts"
        );
        assert_eq!(
            resolve_url("https://cdn.example/hls/list.m3u8", "https://other.example/s.ts").unwrap(),
            "https://other.example/s.ts"
        );
    }

    #[test]
    fn test_bundle_fingerprint() {
        assert_eq!(
            bundle_fingerprint("https://www.youtube.com/s/player/3bb1f723/player_ias.vflset/en_US/base.js")
                .as_deref(),
            Some("3bb1f723")
        );
        assert!(bundle_fingerprint("https://cdn.example/base.js").is_none());
        assert_eq!(
            absolute_bundle_url("/s/player/abc/base.js"),
            "https://www.youtube.com/s/player/abc/base.js"
        );
    }
}
