use serde::{Deserialize, Serialize};

/// Main configuration for paygate.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PaygateConfig {
    pub gateway: GatewayConfig,
    pub webhook: WebhookConfig,
    pub gate: GateConfig,
    pub trial: TrialConfig,
    pub offers: OfferConfig,
    pub dev: DevConfig,
}

/// Payment provider gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Request timeout in seconds. No inline retry storm beyond `max_retries`.
    #[serde(default = "default_gateway_timeout")]
    pub timeout_seconds: u64,
    /// Maximum retry attempts for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Page size when listing a customer's subscriptions.
    #[serde(default = "default_page_size")]
    pub page_size: u8,
}

/// Webhook ingress settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Maximum accepted signature timestamp skew in seconds.
    #[serde(default = "default_signature_tolerance")]
    pub signature_tolerance_seconds: i64,
    /// How long processed event ids are retained for dedup, in days.
    /// Must cover the provider's redelivery window.
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: u32,
}

/// Access gate settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GateConfig {
    /// TTL for cached positive access decisions, in seconds.
    #[serde(default = "default_decision_ttl")]
    pub decision_ttl_seconds: u64,
    /// Maximum cached decisions.
    #[serde(default = "default_decision_cache_entries")]
    pub decision_cache_entries: u64,
    /// Per-identity check cap per rolling minute. Over the cap, the last
    /// computed decision is served instead of an error.
    #[serde(default = "default_checks_per_minute")]
    pub checks_per_minute: u32,
    /// Global check volume per minute before the circuit opens.
    #[serde(default = "default_global_checks_per_minute")]
    pub global_checks_per_minute: u64,
    /// Cool-down in seconds while the circuit is open.
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_seconds: u64,
}

/// Trial and checkout-fallback settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrialConfig {
    /// One-time trial length in days.
    #[serde(default = "default_trial_days")]
    pub trial_days: u32,
    /// Access window granted for a completed one-time checkout with no
    /// recurring subscription, in days.
    #[serde(default = "default_checkout_fallback_days")]
    pub checkout_fallback_days: u32,
    /// A completed checkout only grants the fallback window if it completed
    /// within this many hours. Bounds the replayed-session abuse vector.
    #[serde(default = "default_checkout_recency_hours")]
    pub checkout_recency_hours: u32,
}

/// Retention discount offer settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OfferConfig {
    /// How long a stored rejected offer remains acceptable, in hours.
    #[serde(default = "default_offer_window_hours")]
    pub window_hours: u32,
}

/// Development settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DevConfig {
    /// Expose internal error detail in responses. Never enable in production.
    #[serde(default)]
    pub expose_error_detail: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_gateway_timeout(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            page_size: default_page_size(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            signature_tolerance_seconds: default_signature_tolerance(),
            event_retention_days: default_event_retention_days(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            decision_ttl_seconds: default_decision_ttl(),
            decision_cache_entries: default_decision_cache_entries(),
            checks_per_minute: default_checks_per_minute(),
            global_checks_per_minute: default_global_checks_per_minute(),
            circuit_cooldown_seconds: default_circuit_cooldown(),
        }
    }
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            trial_days: default_trial_days(),
            checkout_fallback_days: default_checkout_fallback_days(),
            checkout_recency_hours: default_checkout_recency_hours(),
        }
    }
}

impl Default for OfferConfig {
    fn default() -> Self {
        Self {
            window_hours: default_offer_window_hours(),
        }
    }
}

fn default_gateway_timeout() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_page_size() -> u8 {
    10
}

fn default_signature_tolerance() -> i64 {
    300
}

fn default_event_retention_days() -> u32 {
    30
}

fn default_decision_ttl() -> u64 {
    20 * 60
}

fn default_decision_cache_entries() -> u64 {
    100_000
}

fn default_checks_per_minute() -> u32 {
    30
}

fn default_global_checks_per_minute() -> u64 {
    10_000
}

fn default_circuit_cooldown() -> u64 {
    60
}

fn default_trial_days() -> u32 {
    14
}

fn default_checkout_fallback_days() -> u32 {
    30
}

fn default_checkout_recency_hours() -> u32 {
    24
}

fn default_offer_window_hours() -> u32 {
    48
}

/// Builder for [`PaygateConfig`] with environment variable support.
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: PaygateConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PaygateConfig::default(),
        }
    }

    pub fn gateway_timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.gateway.timeout_seconds = seconds;
        self
    }

    pub fn decision_ttl_seconds(mut self, seconds: u64) -> Self {
        self.config.gate.decision_ttl_seconds = seconds;
        self
    }

    pub fn checks_per_minute(mut self, cap: u32) -> Self {
        self.config.gate.checks_per_minute = cap;
        self
    }

    pub fn trial_days(mut self, days: u32) -> Self {
        self.config.trial.trial_days = days;
        self
    }

    pub fn offer_window_hours(mut self, hours: u32) -> Self {
        self.config.offers.window_hours = hours;
        self
    }

    pub fn expose_error_detail(mut self, expose: bool) -> Self {
        self.config.dev.expose_error_detail = expose;
        self
    }

    /// Overlay `PAYGATE_*` environment variables onto the current config.
    pub fn from_env(mut self) -> Self {
        if let Some(v) = env_parse::<u64>("PAYGATE_GATEWAY_TIMEOUT_SECONDS") {
            self.config.gateway.timeout_seconds = v;
        }
        if let Some(v) = env_parse::<u32>("PAYGATE_GATEWAY_MAX_RETRIES") {
            self.config.gateway.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("PAYGATE_DECISION_TTL_SECONDS") {
            self.config.gate.decision_ttl_seconds = v;
        }
        if let Some(v) = env_parse::<u32>("PAYGATE_CHECKS_PER_MINUTE") {
            self.config.gate.checks_per_minute = v;
        }
        if let Some(v) = env_parse::<u64>("PAYGATE_GLOBAL_CHECKS_PER_MINUTE") {
            self.config.gate.global_checks_per_minute = v;
        }
        if let Some(v) = env_parse::<u32>("PAYGATE_TRIAL_DAYS") {
            self.config.trial.trial_days = v;
        }
        if let Some(v) = env_parse::<u32>("PAYGATE_OFFER_WINDOW_HOURS") {
            self.config.offers.window_hours = v;
        }
        if let Some(v) = env_parse::<bool>("PAYGATE_EXPOSE_ERROR_DETAIL") {
            self.config.dev.expose_error_detail = v;
        }
        self
    }

    pub fn build(self) -> PaygateConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
