use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to parse QWEN_TOKENS: {0}")]
    Tokens(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One independently usable set of upstream authentication material.
///
/// Any key besides `token` is an auxiliary header; `bx_ua` is sent as `bx-ua`.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CredentialGroup {
    pub token: String,
    #[serde(flatten)]
    pub headers: BTreeMap<String, String>,
}

impl CredentialGroup {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header_pairs(&self) -> impl Iterator<Item = (String, &str)> {
        self.headers
            .iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(k, v)| (k.replace('_', "-").to_ascii_lowercase(), v.as_str()))
    }

    /// Short prefix of the token, safe for logs.
    pub fn fingerprint(&self) -> String {
        let prefix: String = self.token.chars().take(8).collect();
        format!("{prefix}…")
    }
}

impl std::fmt::Debug for CredentialGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialGroup")
            .field("token", &self.fingerprint())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
    #[serde(default = "default_auth_cooldown_secs")]
    pub auth_cooldown_secs: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,
    #[serde(default = "default_malformed_event_tolerance")]
    pub malformed_event_tolerance: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            auth_cooldown_secs: default_auth_cooldown_secs(),
            request_timeout_ms: default_request_timeout_ms(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
            malformed_event_tolerance: default_malformed_event_tolerance(),
        }
    }
}

impl RetryConfig {
    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    pub fn auth_cooldown(&self) -> Duration {
        Duration::from_secs(self.auth_cooldown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub credential_groups: Vec<CredentialGroup>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_bx_v")]
    pub bx_v: String,
    #[serde(default = "default_thinking_models")]
    pub thinking_models: Vec<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            credential_groups: Vec::new(),
            base_url: default_base_url(),
            source: default_source(),
            timezone: default_timezone(),
            bx_v: default_bx_v(),
            thinking_models: default_thinking_models(),
            retry: RetryConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Reads the TOML file if it exists, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            tracing::info!(path = %path.display(), "loaded config file");
            Self::from_toml_str(&text)?
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        if config.credential_groups.is_empty() {
            tracing::warn!("no credential groups configured, upstream calls will fail");
        }
        tracing::info!(
            credential_groups = config.credential_groups.len(),
            base_url = %config.base_url,
            "gateway config ready"
        );
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("QWEN_API_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = get("QWEN_SOURCE") {
            self.source = v;
        }
        if let Some(v) = get("QWEN_TIMEZONE") {
            self.timezone = v;
        }
        if let Some(v) = get("QWEN_BX_V") {
            self.bx_v = v;
        }
        if self.credential_groups.is_empty() {
            if let Some(raw) = get("QWEN_TOKENS") {
                self.credential_groups = parse_token_list(&raw)?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (idx, group) in self.credential_groups.iter().enumerate() {
            if group.token.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "credential group {} is missing a token",
                    idx + 1
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must not be below retry.base_delay_ms".to_string(),
            ));
        }
        let base = self.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "base_url must be an http(s) url: {base}"
            )));
        }
        Ok(())
    }
}

/// Parses `QWEN_TOKENS`: a JSON array of groups, or comma separated entries of
/// the form `token|bx_ua|bx_umidtoken` where the trailing fields are optional.
pub fn parse_token_list(raw: &str) -> Result<Vec<CredentialGroup>, ConfigError> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        return serde_json::from_str(raw).map_err(|err| ConfigError::Tokens(err.to_string()));
    }
    let mut groups = Vec::new();
    for entry in raw.split(',') {
        let mut fields = entry.split('|').map(str::trim);
        let Some(token) = fields.next().filter(|t| !t.is_empty()) else {
            continue;
        };
        let mut group = CredentialGroup::new(token);
        for (name, value) in ["bx_ua", "bx_umidtoken"].into_iter().zip(fields) {
            if !value.is_empty() {
                group = group.with_header(name, value);
            }
        }
        groups.push(group);
    }
    if groups.is_empty() {
        return Err(ConfigError::Tokens("no tokens found".to_string()));
    }
    Ok(groups)
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_jitter_ms() -> u64 {
    250
}

fn default_rate_limit_cooldown_secs() -> u64 {
    60
}

fn default_auth_cooldown_secs() -> u64 {
    1_800
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_stream_idle_timeout_ms() -> u64 {
    60_000
}

fn default_malformed_event_tolerance() -> u32 {
    3
}

fn default_base_url() -> String {
    "https://chat.qwen.ai/api/v2".to_string()
}

fn default_source() -> String {
    "web".to_string()
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

fn default_bx_v() -> String {
    "2.5.31".to_string()
}

fn default_thinking_models() -> Vec<String> {
    vec![
        "qwen3-coder-plus".to_string(),
        "qwen3-coder-30b-a3b-instruct".to_string(),
        "qwen3-235b-a22b".to_string(),
    ]
}
