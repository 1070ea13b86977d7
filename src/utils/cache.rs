//! Caching utilities: moka constructors and the expiry-aware format cache

use crate::platform::formats::ResolvedFormat;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// High-performance async cache using moka
pub type AsyncCache<K, V> = Cache<K, V>;

/// Create a new async cache with TTL and max capacity
pub fn new_async_cache_with_capacity<K, V>(ttl: Duration, max_capacity: u64) -> AsyncCache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .time_to_live(ttl)
        .max_capacity(max_capacity)
        .build()
}

/// Format cache configuration
#[derive(Debug, Clone)]
pub struct FormatCacheConfig {
    /// Maximum number of (content, persona) entries
    pub max_entries: u64,
    /// Lifetime used when no stream URL carries an `expire` parameter
    pub default_ttl: Duration,
    /// Entries are treated as expired this long before their URLs actually expire
    pub safety_margin: Duration,
}

impl Default for FormatCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            default_ttl: Duration::from_secs(5 * 3600),
            safety_margin: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
struct CachedFormats {
    formats: Arc<Vec<ResolvedFormat>>,
    expires_at: DateTime<Utc>,
}

/// Resolved formats keyed by (content id, persona id).
///
/// An entry expires at the earliest `expire` of its stream URLs and is never
/// served after that point.
#[derive(Clone)]
pub struct FormatCache {
    entries: Cache<(String, String), CachedFormats>,
    config: FormatCacheConfig,
}

impl FormatCache {
    pub fn new() -> Self {
        Self::with_config(FormatCacheConfig::default())
    }

    pub fn with_config(config: FormatCacheConfig) -> Self {
        // moka TTL is only a ceiling; URL expiry is checked on read
        let entries = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.default_ttl)
            .build();
        Self { entries, config }
    }

    /// Cached formats, if present and not expired
    pub async fn get(&self, video_id: &str, persona: &str) -> Option<Arc<Vec<ResolvedFormat>>> {
        self.get_at(video_id, persona, Utc::now()).await
    }

    /// Same as [`FormatCache::get`] with an explicit clock
    pub async fn get_at(
        &self,
        video_id: &str,
        persona: &str,
        now: DateTime<Utc>,
    ) -> Option<Arc<Vec<ResolvedFormat>>> {
        let key = (video_id.to_string(), persona.to_string());
        let cached = self.entries.get(&key).await?;
        if cached.expires_at <= now {
            debug!("Format cache entry for {}/{} expired", video_id, persona);
            self.entries.invalidate(&key).await;
            return None;
        }
        Some(cached.formats)
    }

    /// Store formats, returning the computed expiry
    pub async fn insert(
        &self,
        video_id: &str,
        persona: &str,
        formats: Vec<ResolvedFormat>,
    ) -> DateTime<Utc> {
        self.insert_at(video_id, persona, formats, Utc::now()).await
    }

    pub async fn insert_at(
        &self,
        video_id: &str,
        persona: &str,
        formats: Vec<ResolvedFormat>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let expires_at = self.expiry_for(&formats, now);
        self.entries
            .insert(
                (video_id.to_string(), persona.to_string()),
                CachedFormats {
                    formats: Arc::new(formats),
                    expires_at,
                },
            )
            .await;
        expires_at
    }

    /// Drop every entry for `video_id`
    pub async fn invalidate_video(&self, video_id: &str) {
        let stale: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|(key, _)| key.0 == video_id)
            .map(|(key, _)| (*key).clone())
            .collect();
        for key in stale {
            self.entries.invalidate(&key).await;
        }
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    fn expiry_for(&self, formats: &[ResolvedFormat], now: DateTime<Utc>) -> DateTime<Utc> {
        let margin = ChronoDuration::from_std(self.config.safety_margin).unwrap_or_default();
        let ceiling = now + ChronoDuration::from_std(self.config.default_ttl).unwrap_or_default();
        formats
            .iter()
            .filter_map(|f| f.expires_at)
            .min()
            .map(|earliest| (earliest - margin).min(ceiling))
            .unwrap_or(ceiling)
    }
}

impl Default for FormatCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn format_expiring(itag: u32, expire: i64) -> ResolvedFormat {
        let mut format = ResolvedFormat::for_tests(itag, "video/mp4");
        format.url = format!("https://cdn.example/v?itag={}&expire={}", itag, expire);
        format.expires_at = Utc.timestamp_opt(expire, 0).single();
        format
    }

    #[tokio::test]
    async fn test_entry_expires_at_earliest_url() {
        let cache = FormatCache::with_config(FormatCacheConfig {
            safety_margin: Duration::from_secs(0),
            ..FormatCacheConfig::default()
        });
        let now = Utc.timestamp_opt(1_000, 0).unwrap();

        let expiry = cache
            .insert_at(
                "dQw4w9WgXcQ",
                "web",
                vec![format_expiring(18, 3_000), format_expiring(137, 2_000)],
                now,
            )
            .await;
        assert_eq!(expiry.timestamp(), 2_000);

        let before = Utc.timestamp_opt(1_999, 0).unwrap();
        assert_eq!(cache.get_at("dQw4w9WgXcQ", "web", before).await.unwrap().len(), 2);

        let after = Utc.timestamp_opt(2_000, 0).unwrap();
        assert!(cache.get_at("dQw4w9WgXcQ", "web", after).await.is_none());
        // Expired entries are dropped, not resurrected
        assert!(cache.get_at("dQw4w9WgXcQ", "web", before).await.is_none());
    }

    #[tokio::test]
    async fn test_entries_keyed_by_persona() {
        let cache = FormatCache::new();
        cache
            .insert("dQw4w9WgXcQ", "android_vr", vec![ResolvedFormat::for_tests(18, "video/mp4")])
            .await;

        assert!(cache.get("dQw4w9WgXcQ", "android_vr").await.is_some());
        assert!(cache.get("dQw4w9WgXcQ", "web").await.is_none());

        cache.invalidate_video("dQw4w9WgXcQ").await;
        assert!(cache.get("dQw4w9WgXcQ", "android_vr").await.is_none());
    }

    #[tokio::test]
    async fn test_default_ttl_without_expire_param() {
        let cache = FormatCache::with_config(FormatCacheConfig {
            default_ttl: Duration::from_secs(60),
            ..FormatCacheConfig::default()
        });
        let now = Utc.timestamp_opt(10_000, 0).unwrap();
        let expiry = cache
            .insert_at("dQw4w9WgXcQ", "ios", vec![ResolvedFormat::for_tests(22, "video/mp4")], now)
            .await;
        assert_eq!(expiry.timestamp(), 10_060);
    }
}
