use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for env var {0}: {1}")]
    InvalidEnv(String, String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub shop: ShopConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShopConfig {
    /// GraphQL endpoint serving the `LivestreamShop` operation
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Items requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Pause between consecutive page fetches, in milliseconds
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    /// Session cookie forwarded as-is - loaded from env SHOP_SESSION_COOKIE
    #[serde(default)]
    pub session_cookie: String,
}

/// Fee model applied per sold item. Rates are fractions of the item price,
/// `processing_fixed` is in major currency units.
#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "default_processing_rate")]
    pub processing_rate: Decimal,
    #[serde(default = "default_processing_fixed")]
    pub processing_fixed: Decimal,
    #[serde(default = "default_platform_rate")]
    pub platform_rate: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Fixed-rate interval between sales checks.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub persist_policy: PersistPolicy,
}

/// Whether an unchanged total is still written and broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    /// Skip persistence and broadcast when the total did not move.
    #[default]
    OnChange,
    /// Persist and broadcast after every successful check.
    Always,
}

impl FromStr for PersistPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on_change" => Ok(PersistPolicy::OnChange),
            "always" => Ok(PersistPolicy::Always),
            other => Err(format!("unknown persist policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub strategy: ResolverStrategy,
    /// Regex matched against the active tab's URL path. Capture group 1 is the id.
    #[serde(default = "default_live_path_pattern")]
    pub live_path_pattern: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverStrategy {
    /// Sniff outbound `LivestreamShop` requests.
    #[default]
    Request,
    /// Inspect the active tab URL.
    Tab,
}

impl FromStr for ResolverStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "request" => Ok(ResolverStrategy::Request),
            "tab" => Ok(ResolverStrategy::Tab),
            other => Err(format!("unknown resolver strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    /// Fallback poll interval for display surfaces.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_valkey_url")]
    pub url: String,
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Valkey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_endpoint() -> String {
    "https://www.whatnot.com/services/graphql/?operationName=LivestreamShop".to_string()
}
fn default_page_size() -> u32 {
    50
}
fn default_page_delay_ms() -> u64 {
    500
}
fn default_processing_rate() -> Decimal {
    Decimal::new(29, 3)
}
fn default_processing_fixed() -> Decimal {
    Decimal::new(30, 2)
}
fn default_platform_rate() -> Decimal {
    Decimal::new(8, 2)
}
fn default_check_interval_secs() -> u64 {
    10
}
fn default_live_path_pattern() -> String {
    r"^/live/([^/?#]+)/?$".to_string()
}
fn default_poll_interval_secs() -> u64 {
    10
}
fn default_valkey_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_store_prefix() -> String {
    "sales-tracker".to_string()
}
fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ShopConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            page_size: default_page_size(),
            page_delay_ms: default_page_delay_ms(),
            session_cookie: String::new(),
        }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            processing_rate: default_processing_rate(),
            processing_fixed: default_processing_fixed(),
            platform_rate: default_platform_rate(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            persist_policy: PersistPolicy::default(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            strategy: ResolverStrategy::default(),
            live_path_pattern: default_live_path_pattern(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_valkey_url(),
            prefix: default_store_prefix(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ShopConfig {
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}

impl TrackerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

impl DisplayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults plus environment overrides (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Never store the cookie in the config file
        if let Ok(cookie) = std::env::var("SHOP_SESSION_COOKIE") {
            self.shop.session_cookie = cookie;
        }
        if let Ok(endpoint) = std::env::var("SHOP_ENDPOINT") {
            self.shop.endpoint = endpoint;
        }
        if let Some(size) = parse_env("SHOP_PAGE_SIZE")? {
            self.shop.page_size = size;
        }
        if let Some(delay) = parse_env("SHOP_PAGE_DELAY_MS")? {
            self.shop.page_delay_ms = delay;
        }
        if let Some(secs) = parse_env("TRACKER_CHECK_INTERVAL_SECS")? {
            self.tracker.check_interval_secs = secs;
        }
        if let Some(policy) = parse_env("TRACKER_PERSIST_POLICY")? {
            self.tracker.persist_policy = policy;
        }
        if let Some(strategy) = parse_env("RESOLVER_STRATEGY")? {
            self.resolver.strategy = strategy;
        }
        if let Ok(url) = std::env::var("VALKEY_URL") {
            self.store.backend = StoreBackend::Valkey;
            self.store.url = url;
        }
        if let Ok(bind) = std::env::var("DASHBOARD_BIND") {
            self.dashboard.bind = bind;
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnv(name.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}
