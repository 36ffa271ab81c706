use std::path::PathBuf;
use std::time::Duration;

use grb_storage::{ArtifactLimits, BackoffPolicy, HttpClientConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionMode {
    WebhookPlusHistory,
    WebhookOnly,
}

impl IngestionMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "webhook_plus_history" => Some(Self::WebhookPlusHistory),
            "webhook_only" => Some(Self::WebhookOnly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebhookPlusHistory => "webhook_plus_history",
            Self::WebhookOnly => "webhook_only",
        }
    }
}

/// One download-manager deployment whose history is polled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryApp {
    pub name: String,
    pub url: String,
    pub api_key: String,
    pub kind: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RawHistoryApp {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct HistorySettings {
    pub interval: Duration,
    pub lookback_days: i64,
    pub page_size: u32,
    pub max_pages: u32,
    pub event_type: String,
    pub min_score: i32,
    pub strict_hash: bool,
    pub download_from_history: bool,
    pub ingestion_mode: IngestionMode,
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub min_score: i32,
    pub strict: bool,
    pub download: bool,
}

/// Immutable configuration snapshot, built once and passed by reference.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub data_dir: PathBuf,
    pub torrent_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub prowlarr_url: Option<String>,
    pub prowlarr_api_key: Option<String>,
    pub history_apps: Vec<HistoryApp>,
    pub history: HistorySettings,
    pub webhook: WebhookSettings,
    pub network_retries: usize,
    pub network_backoff: Duration,
    pub network_timeout: Duration,
    pub torrents_max_size_mb: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub indexer_cache_ttl: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str, default: i64| {
            var(key)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(default)
        };
        let flag = |key: &str, default: bool| var(key).map(|v| parse_bool(&v)).unwrap_or(default);

        let data_dir = var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let torrent_dir = var("TORRENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("torrents"));

        let ingestion_mode = match var("HISTORY_INGESTION_MODE") {
            Some(raw) => IngestionMode::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown HISTORY_INGESTION_MODE; using webhook_plus_history");
                IngestionMode::WebhookPlusHistory
            }),
            None => IngestionMode::WebhookPlusHistory,
        };

        let backoff_secs = var("NETWORK_BACKOFF_SECONDS")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(1.0);

        Self {
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://./data/grabs.db".to_string()),
            data_dir,
            torrent_dir,
            reports_dir: var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            prowlarr_url: var("PROWLARR_URL").map(|u| u.trim_end_matches('/').to_string()),
            prowlarr_api_key: var("PROWLARR_API_KEY"),
            history_apps: var("HISTORY_APPS")
                .map(|raw| parse_history_apps(&raw))
                .unwrap_or_default(),
            history: HistorySettings {
                interval: Duration::from_secs(number("HISTORY_SYNC_INTERVAL_SECONDS", 3600).max(1) as u64),
                lookback_days: number("HISTORY_LOOKBACK_DAYS", 7).max(1),
                page_size: number("HISTORY_PAGE_SIZE", 200).clamp(1, 1000) as u32,
                max_pages: number("HISTORY_MAX_PAGES", 10).max(1) as u32,
                event_type: "grabbed".to_string(),
                min_score: number("HISTORY_MIN_SCORE", 3) as i32,
                strict_hash: flag("HISTORY_STRICT_HASH", false),
                download_from_history: flag("HISTORY_DOWNLOAD_FROM_HISTORY", true),
                ingestion_mode,
            },
            webhook: WebhookSettings {
                min_score: number("WEBHOOK_MIN_SCORE", 3) as i32,
                strict: flag("WEBHOOK_STRICT", true),
                download: flag("WEBHOOK_DOWNLOAD", true),
            },
            network_retries: number("NETWORK_RETRIES", 3).max(1) as usize,
            network_backoff: Duration::from_secs_f64(backoff_secs),
            network_timeout: Duration::from_secs(number("NETWORK_TIMEOUT_SECONDS", 10).max(1) as u64),
            torrents_max_size_mb: number("TORRENTS_MAX_SIZE_MB", 50).max(1) as u64,
            user_agent: var("GRB_USER_AGENT").unwrap_or_else(|| "grb/0.1".to_string()),
            scheduler_enabled: flag("GRB_SCHEDULER_ENABLED", true),
            indexer_cache_ttl: Duration::from_secs(number("INDEXER_CACHE_TTL_SECONDS", 3600).max(0) as u64),
        }
    }

    /// Search index credentials, when both are set.
    pub fn search_index(&self) -> Option<(&str, &str)> {
        Some((self.prowlarr_url.as_deref()?, self.prowlarr_api_key.as_deref()?))
    }

    pub fn enabled_history_apps(&self) -> impl Iterator<Item = &HistoryApp> {
        self.history_apps.iter().filter(|app| app.enabled)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.network_timeout,
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::from_attempts(self.network_retries, self.network_backoff),
            ..Default::default()
        }
    }

    pub fn artifact_limits(&self) -> ArtifactLimits {
        ArtifactLimits::with_max_megabytes(self.torrents_max_size_mb)
    }
}

pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Entries missing a name, URL or API key are dropped.
pub fn parse_history_apps(raw: &str) -> Vec<HistoryApp> {
    let parsed: Vec<RawHistoryApp> = match serde_json::from_str(raw) {
        Ok(apps) => apps,
        Err(err) => {
            warn!(error = %err, "HISTORY_APPS is not a JSON array of apps; ignoring");
            return Vec::new();
        }
    };
    let present = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    parsed
        .into_iter()
        .filter_map(|app| {
            Some(HistoryApp {
                name: present(app.name)?.to_lowercase(),
                url: present(app.url)?.trim_end_matches('/').to_string(),
                api_key: present(app.api_key)?,
                kind: present(app.kind),
                enabled: app.enabled.unwrap_or(true),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> SyncConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = config_from(&[]);
        assert_eq!(config.database_url, "sqlite://./data/grabs.db");
        assert_eq!(config.torrent_dir, PathBuf::from("./data/torrents"));
        assert_eq!(config.history.lookback_days, 7);
        assert_eq!(config.history.page_size, 200);
        assert_eq!(config.history.max_pages, 10);
        assert_eq!(config.history.ingestion_mode, IngestionMode::WebhookPlusHistory);
        assert!(!config.history.strict_hash);
        assert!(config.webhook.strict);
        assert_eq!(config.network_retries, 3);
        assert!(config.search_index().is_none());
        assert!(config.history_apps.is_empty());
    }

    #[test]
    fn values_are_clamped_and_flags_parsed() {
        let config = config_from(&[
            ("HISTORY_LOOKBACK_DAYS", "0"),
            ("TORRENTS_MAX_SIZE_MB", "-4"),
            ("HISTORY_STRICT_HASH", "Yes"),
            ("WEBHOOK_DOWNLOAD", "off"),
            ("HISTORY_INGESTION_MODE", "webhook_only"),
            ("DATA_DIR", "/srv/grb"),
            ("PROWLARR_URL", "http://prowlarr:9696/"),
            ("PROWLARR_API_KEY", "k"),
        ]);
        assert_eq!(config.history.lookback_days, 1);
        assert_eq!(config.torrents_max_size_mb, 1);
        assert!(config.history.strict_hash);
        assert!(!config.webhook.download);
        assert_eq!(config.history.ingestion_mode, IngestionMode::WebhookOnly);
        assert_eq!(config.torrent_dir, PathBuf::from("/srv/grb/torrents"));
        assert_eq!(config.search_index(), Some(("http://prowlarr:9696", "k")));
    }

    #[test]
    fn history_apps_drop_incomplete_entries() {
        let apps = parse_history_apps(
            r#"[
                {"name": "Radarr", "url": "http://radarr:7878/", "api_key": "a", "type": "radarr"},
                {"name": "Sonarr", "url": "http://sonarr:8989", "api_key": "b", "enabled": false},
                {"name": "", "url": "http://x", "api_key": "c"},
                {"name": "nokey", "url": "http://y"}
            ]"#,
        );
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].name, "radarr");
        assert_eq!(apps[0].url, "http://radarr:7878");
        assert_eq!(apps[0].kind.as_deref(), Some("radarr"));
        assert!(!apps[1].enabled);
        assert!(parse_history_apps("not json").is_empty());
    }
}
