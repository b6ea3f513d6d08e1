use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// One authenticated Telegram session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    pub api_id: i32,
    pub api_hash: String,
    pub session_name: String,
    #[serde(default)]
    pub phone: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks5,
    Socks4,
    Http,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ForwardingConfig {
    pub forward_with_attribution: bool,
    pub enable_deduplication: bool,
    pub default_destination_id: Option<String>,
    pub secondary_unique_destination: Option<String>,
    pub forward_to_all_saved_messages: bool,
    /// When false, text-only messages are dropped from forward runs.
    pub forward_text_messages: bool,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            forward_with_attribution: false,
            enable_deduplication: true,
            default_destination_id: None,
            secondary_unique_destination: None,
            forward_to_all_saved_messages: false,
            forward_text_messages: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GroupingConfig {
    /// `none`, `time` or `filename`. Unknown names fall back to `none` with a
    /// warning at grouper construction, matching operator expectations for
    /// hand-edited config files.
    pub strategy: String,
    pub time_window_seconds: u64,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            strategy: "none".to_string(),
            time_window_seconds: 300,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AttributionConfig {
    /// Template with `{source_channel_name}`, `{source_channel_id}`,
    /// `{sender_name}`, `{sender_id}`, `{timestamp}`, `{message_id}`.
    pub template: String,
    /// strftime-style format applied to `{timestamp}`.
    pub timestamp_format: String,
    /// Destination ids for which attribution is suppressed entirely.
    pub disable_attribution_for_groups: Vec<i64>,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            template: "[Forwarded from {source_channel_name} (ID: {source_channel_id})]\n\
                       Sender: {sender_name} ({sender_id}) | {timestamp} | msg {message_id}"
                .to_string(),
            timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
            disable_attribution_for_groups: Vec::new(),
        }
    }
}

/// Whether the engine may create topics, use only existing ones, or both.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationMode {
    Disabled,
    AutoCreate,
    ExistingOnly,
    Hybrid,
}

impl OrganizationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::AutoCreate => "auto_create",
            Self::ExistingOnly => "existing_only",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "disabled" => Some(Self::Disabled),
            "auto_create" => Some(Self::AutoCreate),
            "existing_only" => Some(Self::ExistingOnly),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

/// Strategy used to derive topic candidates from classified content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicStrategy {
    ContentType,
    DateBased,
    FileExtension,
    SourceChannel,
    CustomRules,
    Hybrid,
}

impl TopicStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContentType => "content_type",
            Self::DateBased => "date_based",
            Self::FileExtension => "file_extension",
            Self::SourceChannel => "source_channel",
            Self::CustomRules => "custom_rules",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "content_type" => Some(Self::ContentType),
            "date_based" => Some(Self::DateBased),
            "file_extension" => Some(Self::FileExtension),
            "source_channel" => Some(Self::SourceChannel),
            "custom_rules" => Some(Self::CustomRules),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

/// Behaviour when no suitable topic is found or can be created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    GeneralTopic,
    NoTopic,
    RetryOnce,
    QueueForRetry,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeneralTopic => "general_topic",
            Self::NoTopic => "no_topic",
            Self::RetryOnce => "retry_once",
            Self::QueueForRetry => "queue_for_retry",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "general_topic" => Some(Self::GeneralTopic),
            "no_topic" => Some(Self::NoTopic),
            "retry_once" => Some(Self::RetryOnce),
            "queue_for_retry" => Some(Self::QueueForRetry),
            _ => None,
        }
    }
}

/// Per-channel topic organization settings. The config file carries the
/// defaults; the state store can override them per destination channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrganizationSettings {
    pub mode: OrganizationMode,
    pub topic_strategy: TopicStrategy,
    pub fallback_strategy: FallbackStrategy,
    pub max_topics_per_channel: u32,
    pub topic_creation_cooldown_seconds: u64,
    pub enable_content_analysis: bool,
    pub classification_confidence_threshold: f64,
    pub general_topic_title: String,
    pub auto_cleanup_empty_topics: bool,
    pub enable_statistics: bool,
    pub debug_mode: bool,
}

impl Default for OrganizationSettings {
    fn default() -> Self {
        Self {
            mode: OrganizationMode::AutoCreate,
            topic_strategy: TopicStrategy::ContentType,
            fallback_strategy: FallbackStrategy::GeneralTopic,
            max_topics_per_channel: 100,
            topic_creation_cooldown_seconds: 30,
            enable_content_analysis: true,
            classification_confidence_threshold: 0.7,
            general_topic_title: "General Discussion".to_string(),
            auto_cleanup_empty_topics: false,
            enable_statistics: true,
            debug_mode: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    pub state_file: PathBuf,
    /// 0 disables bandwidth throttling in the queue worker.
    pub bandwidth_limit_kbps: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("spectra_scheduler.json"),
            bandwidth_limit_kbps: 0,
        }
    }
}

/// Engine configuration, loaded from a single JSON document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub accounts: Vec<AccountConfig>,
    pub db_path: PathBuf,
    pub media_dir: PathBuf,
    pub proxy: Option<ProxyConfig>,
    pub forwarding: ForwardingConfig,
    pub grouping: GroupingConfig,
    pub attribution: AttributionConfig,
    pub topic_organization: OrganizationSettings,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            db_path: PathBuf::from("spectra.db"),
            media_dir: PathBuf::from("media"),
            proxy: None,
            forwarding: ForwardingConfig::default(),
            grouping: GroupingConfig::default(),
            attribution: AttributionConfig::default(),
            topic_organization: OrganizationSettings::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate a configuration document.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Locate the configuration document: `SPECTRA_CONFIG`, then
    /// `./spectra_config.json`, then the platform config directory.
    pub fn discover() -> Result<Self> {
        dotenvy::dotenv().ok();

        if let Ok(path) = std::env::var("SPECTRA_CONFIG") {
            let expanded = PathBuf::from(shellexpand::tilde(&path).into_owned());
            return Self::load(&expanded);
        }

        let local = PathBuf::from("spectra_config.json");
        if local.exists() {
            return Self::load(&local);
        }

        if let Some(dir) = dirs::config_dir() {
            let candidate = dir.join("spectra").join("config.json");
            if candidate.exists() {
                return Self::load(&candidate);
            }
        }

        Err(anyhow!(
            "no configuration found: set SPECTRA_CONFIG or create spectra_config.json"
        ))
    }

    fn expand_paths(&mut self) {
        self.db_path = expand_path(&self.db_path);
        self.media_dir = expand_path(&self.media_dir);
        self.scheduler.state_file = expand_path(&self.scheduler.state_file);
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.session_name.trim().is_empty() {
                return Err(anyhow!("account with empty session_name"));
            }
            if account.api_hash.trim().is_empty() {
                return Err(anyhow!(
                    "account '{}' has an empty api_hash",
                    account.session_name
                ));
            }
            if !seen.insert(account.session_name.clone()) {
                return Err(anyhow!(
                    "duplicate account session_name '{}'",
                    account.session_name
                ));
            }
        }

        if let Some(proxy) = &self.proxy {
            if proxy.enabled {
                if proxy.host.trim().is_empty() {
                    return Err(anyhow!("proxy is enabled but host is empty"));
                }
                if proxy.port == 0 {
                    return Err(anyhow!("proxy is enabled but port is 0"));
                }
            }
        }

        if self.grouping.time_window_seconds == 0 {
            return Err(anyhow!("grouping.time_window_seconds must be positive"));
        }

        let threshold = self.topic_organization.classification_confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "topic_organization.classification_confidence_threshold must be within [0, 1], got {threshold}"
            ));
        }

        Ok(())
    }

    /// Find an account by session name or phone number.
    pub fn find_account(&self, identifier: &str) -> Option<&AccountConfig> {
        self.accounts
            .iter()
            .find(|a| a.session_name == identifier || (!a.phone.is_empty() && a.phone == identifier))
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Config {{ accounts: {} (credentials masked), db_path: {:?}, media_dir: {:?}, proxy: {}, grouping: {}/{}s, dedup: {}, attribution: {}, org mode: {} }}",
            self.accounts.len(),
            self.db_path,
            self.media_dir,
            self.proxy.as_ref().map(|p| p.enabled).unwrap_or(false),
            self.grouping.strategy,
            self.grouping.time_window_seconds,
            self.forwarding.enable_deduplication,
            self.forwarding.forward_with_attribution,
            self.topic_organization.mode.as_str(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("spectra_config.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_defaults_applied_for_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "{}");

        let config = Config::load(&path).unwrap();

        assert!(config.accounts.is_empty());
        assert_eq!(config.db_path, PathBuf::from("spectra.db"));
        assert!(config.forwarding.enable_deduplication);
        assert!(!config.forwarding.forward_with_attribution);
        assert_eq!(config.grouping.strategy, "none");
        assert_eq!(config.grouping.time_window_seconds, 300);
        assert_eq!(config.topic_organization.mode, OrganizationMode::AutoCreate);
        assert_eq!(
            config.topic_organization.general_topic_title,
            "General Discussion"
        );
        assert_eq!(config.scheduler.bandwidth_limit_kbps, 0);
    }

    #[test]
    fn test_full_document_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"{
                "accounts": [
                    {"api_id": 12345, "api_hash": "abcdef", "session_name": "main", "phone": "+15550001111"},
                    {"api_id": 54321, "api_hash": "fedcba", "session_name": "backup", "phone": "+15550002222"}
                ],
                "db_path": "state/spectra.db",
                "media_dir": "state/media",
                "proxy": {"enabled": true, "type": "socks5", "host": "127.0.0.1", "port": 9050},
                "forwarding": {
                    "forward_with_attribution": true,
                    "enable_deduplication": true,
                    "default_destination_id": "-1001112223334",
                    "secondary_unique_destination": "@mirror",
                    "forward_to_all_saved_messages": true,
                    "forward_text_messages": false
                },
                "grouping": {"strategy": "filename", "time_window_seconds": 120},
                "attribution": {
                    "template": "{source_channel_name} / {sender_name} @ {timestamp}",
                    "timestamp_format": "%Y-%m-%d",
                    "disable_attribution_for_groups": [-100999]
                },
                "topic_organization": {
                    "mode": "hybrid",
                    "topic_strategy": "date_based",
                    "fallback_strategy": "no_topic",
                    "classification_confidence_threshold": 0.5
                },
                "scheduler": {"state_file": "state/scheduler.json", "bandwidth_limit_kbps": 512}
            }"#,
        );

        let config = Config::load(&path).unwrap();

        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].session_name, "main");
        assert!(config.proxy.as_ref().unwrap().enabled);
        assert_eq!(config.proxy.as_ref().unwrap().kind, ProxyKind::Socks5);
        assert_eq!(
            config.forwarding.default_destination_id.as_deref(),
            Some("-1001112223334")
        );
        assert_eq!(config.grouping.strategy, "filename");
        assert_eq!(config.topic_organization.mode, OrganizationMode::Hybrid);
        assert_eq!(
            config.topic_organization.topic_strategy,
            TopicStrategy::DateBased
        );
        assert_eq!(
            config.topic_organization.fallback_strategy,
            FallbackStrategy::NoTopic
        );
        assert_eq!(config.scheduler.bandwidth_limit_kbps, 512);
        assert_eq!(config.attribution.disable_attribution_for_groups, vec![-100999]);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, r#"{"db_pathh": "oops.db"}"#);
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_duplicate_session_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"{"accounts": [
                {"api_id": 1, "api_hash": "a", "session_name": "same"},
                {"api_id": 2, "api_hash": "b", "session_name": "same"}
            ]}"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate account session_name"));
    }

    #[test]
    fn test_enabled_proxy_requires_host_and_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"{"proxy": {"enabled": true, "type": "http", "host": "", "port": 8080}}"#,
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_confidence_threshold_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"{"topic_organization": {"classification_confidence_threshold": 1.5}}"#,
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_zero_time_window_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, r#"{"grouping": {"time_window_seconds": 0}}"#);
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_find_account_by_session_or_phone() {
        let config = Config {
            accounts: vec![AccountConfig {
                api_id: 1,
                api_hash: "h".into(),
                session_name: "main".into(),
                phone: "+15550001111".into(),
            }],
            ..Config::default()
        };

        assert!(config.find_account("main").is_some());
        assert!(config.find_account("+15550001111").is_some());
        assert!(config.find_account("unknown").is_none());
    }

    #[test]
    #[serial_test::serial]
    fn test_discover_honors_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, r#"{"db_path": "from_env.db"}"#);

        std::env::set_var("SPECTRA_CONFIG", &path);
        let config = Config::discover().unwrap();
        std::env::remove_var("SPECTRA_CONFIG");

        assert_eq!(config.db_path, PathBuf::from("from_env.db"));
    }

    #[test]
    fn test_display_masks_credentials() {
        let config = Config {
            accounts: vec![AccountConfig {
                api_id: 7,
                api_hash: "super-secret-hash".into(),
                session_name: "main".into(),
                phone: "+15550001111".into(),
            }],
            ..Config::default()
        };

        let rendered = config.to_string();
        assert!(!rendered.contains("super-secret-hash"));
        assert!(!rendered.contains("+15550001111"));
    }
}
