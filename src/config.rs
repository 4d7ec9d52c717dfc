//! Startup configuration for the proxy.
//!
//! Every field has a default; command-line flags override file values.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Main configuration for the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Path to the OpenAPI contract document
    #[serde(default = "default_contract")]
    pub contract: PathBuf,

    /// Path to the selection rule file (none = no rules)
    #[serde(default)]
    pub rules: Option<PathBuf>,

    /// Address the proxy listens on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Base URL of the upstream mock engine
    #[serde(default = "default_upstream")]
    pub upstream: String,

    /// Per-request timeout in milliseconds, applied uniformly to all operations.
    /// One deadline covers reading the client body and the upstream exchange.
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Largest request body the proxy will read
    #[serde(default = "default_max_body_bytes")]
    pub max_request_body_bytes: usize,

    /// Path prefix of the proxy's own endpoints
    #[serde(default = "default_admin_prefix")]
    pub admin_prefix: String,

    /// Reject requests missing parameters the contract marks required
    #[serde(default = "default_true")]
    pub enforce_required_parameters: bool,

    /// How the selected example is announced to the upstream
    #[serde(default)]
    pub selection_token: SelectionTokenConfig,

    /// Diagnostics ring buffer
    #[serde(default)]
    pub diagnostics: DiagnosticsSettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            contract: default_contract(),
            rules: None,
            listen: default_listen(),
            upstream: default_upstream(),
            request_timeout_ms: default_timeout_ms(),
            max_request_body_bytes: default_max_body_bytes(),
            admin_prefix: default_admin_prefix(),
            enforce_required_parameters: true,
            selection_token: SelectionTokenConfig::default(),
            diagnostics: DiagnosticsSettings::default(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be greater than zero");
        }
        self.upstream_url()?;
        if !self.admin_prefix.starts_with('/') || self.admin_prefix.len() < 2 {
            anyhow::bail!(
                "admin_prefix must start with '/' and name a path: {}",
                self.admin_prefix
            );
        }
        if self.admin_prefix.ends_with('/') {
            anyhow::bail!("admin_prefix must not end with '/': {}", self.admin_prefix);
        }
        if self.selection_token.name.trim().is_empty() {
            anyhow::bail!("selection_token.name cannot be empty");
        }
        Ok(())
    }

    /// Parsed upstream base URL.
    pub fn upstream_url(&self) -> anyhow::Result<Url> {
        let url = Url::parse(&self.upstream)
            .map_err(|e| anyhow::anyhow!("Invalid upstream URL {}: {}", self.upstream, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Upstream URL must be http or https: {}", self.upstream);
        }
        Ok(url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Where the selection token is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenLocation {
    #[default]
    Header,
    Query,
}

/// Selection token naming scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionTokenConfig {
    #[serde(default)]
    pub location: TokenLocation,

    /// Header or query parameter name
    #[serde(default = "default_token_name")]
    pub name: String,

    /// Handlebars template for the value
    #[serde(default = "default_token_value")]
    pub value: String,
}

impl Default for SelectionTokenConfig {
    fn default() -> Self {
        Self {
            location: TokenLocation::Header,
            name: default_token_name(),
            value: default_token_value(),
        }
    }
}

/// Diagnostics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiagnosticsSettings {
    /// Number of entries retained (0 disables recording)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Include the selection token in recorded entries
    #[serde(default)]
    pub include_selection_token: bool,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            include_selection_token: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_contract() -> PathBuf {
    PathBuf::from("openapi.yaml")
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4011))
}

fn default_upstream() -> String {
    "http://127.0.0.1:4010".to_string()
}

/// Per-request budget used when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

fn default_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_admin_prefix() -> String {
    "/__proxy".to_string()
}

fn default_token_name() -> String {
    "Prefer".to_string()
}

fn default_token_value() -> String {
    "example={{example}}".to_string()
}

fn default_capacity() -> usize {
    100
}
