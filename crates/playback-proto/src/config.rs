use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub variants: VariantsConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

/// TCP server detached observer windows connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sync_port")]
    pub port: u16,
}

/// Connection to the browse/transport bridge of the remote playback system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_address")]
    pub address: String,
    #[serde(default = "default_bridge_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Upper bound on a single request/response exchange.  Kept at least as
    /// long as a whole resolution attempt so it never fires mid-descent.
    #[serde(default = "default_bridge_request_timeout")]
    pub request_timeout_secs: u64,
}

/// How a match is triggered once the browse descent finds a catalog entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Select the first (default) action of the album's action list.
    DefaultAction,
    /// Select the action whose title is `play_action_title`.
    NamedAction,
    /// Unmodified names only, searching by the album title alone.
    ExactOnly,
    /// Play the artist entry without album specificity.
    ArtistOnly,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::DefaultAction => "default_action",
            StrategyKind::NamedAction => "named_action",
            StrategyKind::ExactOnly => "exact_only",
            StrategyKind::ArtistOnly => "artist_only",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    /// Tried in order; least side-effecting first.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyKind>,
    #[serde(default = "default_play_action_title")]
    pub play_action_title: String,
    /// Top-level browse entry searched under (e.g. "Library").
    #[serde(default = "default_source_title")]
    pub source_title: String,
    /// Items requested per `load` call while descending.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// A textual rewrite applied by the variant generator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VariantTransform {
    /// "The X" <-> "X"
    LeadingArticle,
    /// "and" <-> "&"
    Conjunction,
    /// Drop a trailing "(...)" / "[...]" group containing a suffix keyword.
    StripSuffix,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantsConfig {
    /// Ordered transforms for artist names.
    #[serde(default = "default_artist_transforms")]
    pub artist_transforms: Vec<VariantTransform>,
    /// Ordered transforms for album titles.
    #[serde(default = "default_album_transforms")]
    pub album_transforms: Vec<VariantTransform>,
    /// Keywords that mark a bracketed suffix as strippable.  Only the first
    /// `MAX_SUFFIX_KEYWORDS` are honoured.
    #[serde(default = "default_suffix_keywords")]
    pub suffix_keywords: Vec<String>,
}

pub const MAX_SUFFIX_KEYWORDS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Extra attempts after the first one on a transient failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_control_timeout")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// The collection service that maps album ids to names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    #[serde(default = "default_collection_url")]
    pub base_url: String,
    #[serde(default = "default_collection_timeout")]
    pub timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_sync_port(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: default_bridge_address(),
            connect_timeout_secs: default_bridge_connect_timeout(),
            request_timeout_secs: default_bridge_request_timeout(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: default_attempt_timeout(),
            strategies: default_strategies(),
            play_action_title: default_play_action_title(),
            source_title: default_source_title(),
            page_size: default_page_size(),
        }
    }
}

impl Default for VariantsConfig {
    fn default() -> Self {
        Self {
            artist_transforms: default_artist_transforms(),
            album_transforms: default_album_transforms(),
            suffix_keywords: default_suffix_keywords(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            attempt_timeout_secs: default_control_timeout(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            base_url: default_collection_url(),
            timeout_secs: default_collection_timeout(),
        }
    }
}

impl BridgeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ResolverConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

impl ControlConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl BroadcastConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

impl CollectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8940
}

fn default_sync_port() -> u16 {
    platform::SYNC_TCP_PORT
}

fn default_bridge_address() -> String {
    "127.0.0.1:9330".to_string()
}

fn default_bridge_connect_timeout() -> u64 {
    5
}

fn default_bridge_request_timeout() -> u64 {
    17
}

fn default_attempt_timeout() -> u64 {
    15
}

fn default_strategies() -> Vec<StrategyKind> {
    vec![
        StrategyKind::DefaultAction,
        StrategyKind::NamedAction,
        StrategyKind::ExactOnly,
        StrategyKind::ArtistOnly,
    ]
}

fn default_play_action_title() -> String {
    "Play Now".to_string()
}

fn default_source_title() -> String {
    "Library".to_string()
}

fn default_page_size() -> usize {
    100
}

fn default_artist_transforms() -> Vec<VariantTransform> {
    vec![VariantTransform::LeadingArticle, VariantTransform::Conjunction]
}

fn default_album_transforms() -> Vec<VariantTransform> {
    vec![
        VariantTransform::LeadingArticle,
        VariantTransform::Conjunction,
        VariantTransform::StripSuffix,
    ]
}

fn default_suffix_keywords() -> Vec<String> {
    vec!["soundtrack".into(), "remaster".into(), "edition".into()]
}

fn default_max_retries() -> u32 {
    2
}

fn default_control_timeout() -> u64 {
    5
}

fn default_retry_delay() -> u64 {
    250
}

fn default_poll_interval() -> u64 {
    3
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_channel_capacity() -> usize {
    64
}

fn default_collection_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_collection_timeout() -> u64 {
    5
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8940);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.resolver.attempt_timeout(), Duration::from_secs(15));
        assert_eq!(config.bridge.request_timeout(), Duration::from_secs(17));
        assert_eq!(config.control.max_retries, 2);
        assert_eq!(config.resolver.strategies[0], StrategyKind::DefaultAction);
        assert_eq!(
            config.resolver.strategies.last(),
            Some(&StrategyKind::ArtistOnly)
        );
        assert!(config.daemon.state_file.ends_with("playback/state.json"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [resolver]
            strategies = ["named_action", "artist_only"]

            [control]
            max_retries = 0
            "#,
        )
        .unwrap();
        assert_eq!(
            config.resolver.strategies,
            vec![StrategyKind::NamedAction, StrategyKind::ArtistOnly]
        );
        assert_eq!(config.resolver.play_action_title, "Play Now");
        assert_eq!(config.control.max_retries, 0);
        assert_eq!(config.control.attempt_timeout_secs, 5);
        assert_eq!(config.broadcast.poll_interval_secs, 3);
        assert_eq!(config.variants.suffix_keywords.len(), 3);
    }

    #[test]
    fn test_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.sync.port, 9877);
        assert_eq!(
            parsed.variants.album_transforms,
            default_album_transforms()
        );
    }
}
