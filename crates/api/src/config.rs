//! Application configuration loaded from environment variables.

use std::time::Duration;

use thiserror::Error;
use workflow::{ReconcilerSettings, WorkflowSettings};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {name}")]
    Invalid { name: &'static str, value: String },
}

/// Server configuration with defaults for everything but secrets.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (`0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (`info`)
/// - `LOG_FORMAT`: `text` or `json`
/// - `DATABASE_URL`: PostgreSQL; unset runs on in-memory stores
/// - `DATABASE_MAX_CONNECTIONS` (10)
/// - `STRIPE_WEBHOOK_SECRET`, `PAYPAL_WEBHOOK_SECRET`
/// - `STRIPE_API_KEY`: enables line-item lookups against Stripe
/// - `WEBHOOK_TOLERANCE_SECS` (300)
/// - `COLLABORATOR_TIMEOUT_MS` (5000)
/// - `IDEMPOTENCY_LEASE_SECS` (300): age at which an unfinished request's
///   key can be taken over by a retry
/// - `ORDER_MODIFICATION_WINDOW_DAYS` (4)
/// - `CARD_CURRENCY` (USD), `LOCAL_CURRENCY` (NGN)
/// - `ADMIN_TOKEN`: bearer token registered as an admin session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub stripe_webhook_secret: Option<String>,
    pub paypal_webhook_secret: Option<String>,
    pub stripe_api_key: Option<String>,
    pub webhook_tolerance_secs: i64,
    pub collaborator_timeout_ms: u64,
    pub idempotency_lease_secs: u64,
    pub modification_window_days: i64,
    pub card_currency: String,
    pub local_currency: String,
    pub admin_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            database_url: None,
            database_max_connections: 10,
            stripe_webhook_secret: None,
            paypal_webhook_secret: None,
            stripe_api_key: None,
            webhook_tolerance_secs: 300,
            collaborator_timeout_ms: 5000,
            idempotency_lease_secs: store::DEFAULT_IDEMPOTENCY_LEASE.as_secs(),
            modification_window_days: domain::MODIFICATION_WINDOW_DAYS,
            card_currency: "USD".to_string(),
            local_currency: "NGN".to_string(),
            admin_token: None,
        }
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults.
    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let log_json = match lookup("LOG_FORMAT").as_deref() {
            None | Some("text") => false,
            Some("json") => true,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "LOG_FORMAT",
                    value: other.to_string(),
                });
            }
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "PORT", defaults.port)?,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_json,
            database_url: lookup("DATABASE_URL"),
            database_max_connections: parsed(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            stripe_webhook_secret: lookup("STRIPE_WEBHOOK_SECRET"),
            paypal_webhook_secret: lookup("PAYPAL_WEBHOOK_SECRET"),
            stripe_api_key: lookup("STRIPE_API_KEY"),
            webhook_tolerance_secs: parsed(
                &lookup,
                "WEBHOOK_TOLERANCE_SECS",
                defaults.webhook_tolerance_secs,
            )?,
            collaborator_timeout_ms: parsed(
                &lookup,
                "COLLABORATOR_TIMEOUT_MS",
                defaults.collaborator_timeout_ms,
            )?,
            idempotency_lease_secs: parsed(
                &lookup,
                "IDEMPOTENCY_LEASE_SECS",
                defaults.idempotency_lease_secs,
            )?,
            modification_window_days: parsed(
                &lookup,
                "ORDER_MODIFICATION_WINDOW_DAYS",
                defaults.modification_window_days,
            )?,
            card_currency: lookup("CARD_CURRENCY")
                .map(|c| c.to_uppercase())
                .unwrap_or(defaults.card_currency),
            local_currency: lookup("LOCAL_CURRENCY")
                .map(|c| c.to_uppercase())
                .unwrap_or(defaults.local_currency),
            admin_token: lookup("ADMIN_TOKEN"),
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    pub fn idempotency_lease(&self) -> Duration {
        Duration::from_secs(self.idempotency_lease_secs)
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            modification_window: chrono::Duration::days(self.modification_window_days),
            card_currency: self.card_currency.clone(),
            local_currency: self.local_currency.clone(),
            collaborator_timeout: self.collaborator_timeout(),
            idempotency_lease: self.idempotency_lease(),
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            stripe_webhook_secret: self.stripe_webhook_secret.clone(),
            paypal_webhook_secret: self.paypal_webhook_secret.clone(),
            signature_tolerance: chrono::Duration::seconds(self.webhook_tolerance_secs),
            collaborator_timeout: self.collaborator_timeout(),
            idempotency_lease: self.idempotency_lease(),
        }
    }
}
