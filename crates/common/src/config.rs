//! Environment-driven configuration.
//!
//! The deployment surface is env-only: secrets (wallet mnemonic, gateway
//! key, webhook secret, auth HMAC), service URLs (ledger REST, indexer,
//! marketplace), feature flags and state paths all arrive as `VERDANT_*`
//! variables. Parsing goes through a lookup closure so tests can feed a
//! plain map instead of mutating process environment.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(String),
    #[error("invalid value for {name}: {reason}")]
    InvalidVar { name: String, reason: String },
}

/// How retirement purchases are paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMode {
    /// Pay from the signing wallet's on-chain balance.
    Crypto,
    /// Hold/capture fiat through the card gateway.
    Stripe,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Base URL for ledger REST reads.
    pub rest_url: String,
    /// GraphQL indexer endpoint for retirement records.
    pub indexer_url: String,
    /// Broadcast endpoint; defaults to `rest_url`.
    pub broadcast_url: String,
    /// Public marketplace used for fallback links.
    pub marketplace_url: String,
    /// Bank denom of the native staking token, the default payment denom.
    pub native_denom: String,
    /// BIP-39 mnemonic of the signing wallet. Absent means no wallet is
    /// configured and every retirement falls back to the marketplace.
    pub wallet_mnemonic: Option<String>,
    /// Hardened derivation path for the wallet key.
    pub derivation_path: String,
    /// Per-request deadline for ledger and indexer calls.
    pub request_timeout: Duration,
    /// Hard deadline for post-broadcast retirement polling.
    pub retirement_poll_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_base: String,
    /// Bearer secret for the gateway. Absent disables the fiat provider.
    pub secret_key: Option<String>,
    /// Webhook signing secret; verification is mandatory when set.
    pub webhook_secret: Option<String>,
    /// Billing customer the orchestrator charges for batch purchases.
    pub customer_id: Option<String>,
    /// Stored payment method confirmed on each intent.
    pub payment_method: Option<String>,
    /// On-chain denoms the fiat provider may settle (USDC equivalents).
    pub usdc_denoms: Vec<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret mixed into code/token hashes and oauth state HMACs.
    pub secret: String,
    pub session_ttl: Duration,
    pub recovery_ttl: Duration,
    pub max_verification_attempts: u32,
    /// Allowed oauth providers, lowercase.
    pub oauth_providers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StatePaths {
    pub pool_state: String,
    pub batch_state: String,
    pub auth_state: String,
    pub balance_db: String,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Operations fee retained from each monthly pool, in basis points.
    pub fee_bps: u32,
    /// Denom bias for order selection; `None` lets the selector choose.
    pub preferred_denom: Option<String>,
    /// Maximum age of the dry run that gates a live batch.
    pub preflight_max_age_hours: u32,
    /// Retirement jurisdiction stamped on batch purchases.
    pub jurisdiction: String,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ledger: LedgerConfig,
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub state: StatePaths,
    pub batch: BatchConfig,
    pub api: ApiConfig,
    pub payment_mode: PaymentMode,
    /// Cross-chain top-ups advertised to clients; no in-process behavior.
    pub cross_chain_enabled: bool,
}

impl Config {
    /// Load from process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    /// Load through an arbitrary lookup (tests pass a map).
    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &str| -> Result<String, ConfigError> {
            get(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
        };
        let or_default =
            |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());
        let opt = |name: &str| get(name).filter(|v| !v.trim().is_empty());
        let parse_u64 = |name: &str, default: u64| -> Result<u64, ConfigError> {
            match get(name) {
                None => Ok(default),
                Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
                    name: name.to_string(),
                    reason: format!("expected integer, got {:?}", raw),
                }),
            }
        };
        let parse_u32 = |name: &str, default: u32| -> Result<u32, ConfigError> {
            parse_u64(name, u64::from(default)).and_then(|v| {
                u32::try_from(v).map_err(|_| ConfigError::InvalidVar {
                    name: name.to_string(),
                    reason: "value out of range".to_string(),
                })
            })
        };

        let rest_url = required("VERDANT_LEDGER_REST_URL")?;
        let broadcast_url = or_default("VERDANT_LEDGER_BROADCAST_URL", &rest_url);

        let payment_mode = match or_default("VERDANT_PAYMENT_MODE", "crypto").as_str() {
            "crypto" => PaymentMode::Crypto,
            "stripe" => PaymentMode::Stripe,
            other => {
                return Err(ConfigError::InvalidVar {
                    name: "VERDANT_PAYMENT_MODE".to_string(),
                    reason: format!("expected crypto|stripe, got {:?}", other),
                })
            }
        };

        let oauth_providers = or_default("VERDANT_OAUTH_PROVIDERS", "google,github")
            .split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        Ok(Config {
            ledger: LedgerConfig {
                rest_url,
                indexer_url: required("VERDANT_LEDGER_INDEXER_URL")?,
                broadcast_url,
                marketplace_url: or_default(
                    "VERDANT_MARKETPLACE_URL",
                    "https://marketplace.verdant.eco",
                ),
                native_denom: or_default("VERDANT_NATIVE_DENOM", "uverd"),
                wallet_mnemonic: opt("VERDANT_WALLET_MNEMONIC"),
                derivation_path: or_default("VERDANT_WALLET_DERIVATION_PATH", "m/44'/118'/0'/0/0"),
                request_timeout: Duration::from_millis(parse_u64(
                    "VERDANT_LEDGER_TIMEOUT_MS",
                    10_000,
                )?),
                retirement_poll_timeout: Duration::from_millis(parse_u64(
                    "VERDANT_RETIREMENT_POLL_TIMEOUT_MS",
                    30_000,
                )?),
            },
            gateway: GatewayConfig {
                api_base: or_default("VERDANT_GATEWAY_API_BASE", "https://api.stripe.com/v1"),
                secret_key: opt("VERDANT_GATEWAY_SECRET_KEY"),
                webhook_secret: opt("VERDANT_GATEWAY_WEBHOOK_SECRET"),
                customer_id: opt("VERDANT_GATEWAY_CUSTOMER_ID"),
                payment_method: opt("VERDANT_GATEWAY_PAYMENT_METHOD"),
                usdc_denoms: or_default("VERDANT_USDC_DENOMS", "uusdc")
                    .split(',')
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .collect(),
                request_timeout: Duration::from_millis(parse_u64(
                    "VERDANT_GATEWAY_TIMEOUT_MS",
                    15_000,
                )?),
            },
            auth: AuthConfig {
                secret: required("VERDANT_AUTH_SECRET")?,
                session_ttl: Duration::from_secs(parse_u64("VERDANT_AUTH_SESSION_TTL_SECS", 900)?),
                recovery_ttl: Duration::from_secs(parse_u64(
                    "VERDANT_AUTH_RECOVERY_TTL_SECS",
                    86_400,
                )?),
                max_verification_attempts: parse_u32("VERDANT_AUTH_MAX_ATTEMPTS", 5)?,
                oauth_providers,
            },
            state: StatePaths {
                pool_state: or_default("VERDANT_POOL_STATE_PATH", "./state/pool.json"),
                batch_state: or_default("VERDANT_BATCH_STATE_PATH", "./state/batch.json"),
                auth_state: or_default("VERDANT_AUTH_STATE_PATH", "./state/auth.json"),
                balance_db: or_default("VERDANT_BALANCE_DB_PATH", "./state/balance.sqlite"),
            },
            batch: BatchConfig {
                fee_bps: parse_u32("VERDANT_BATCH_FEE_BPS", 250)?,
                preferred_denom: opt("VERDANT_BATCH_PREFERRED_DENOM"),
                preflight_max_age_hours: parse_u32("VERDANT_PREFLIGHT_MAX_AGE_HOURS", 24)?,
                jurisdiction: or_default("VERDANT_RETIREMENT_JURISDICTION", "US"),
            },
            api: ApiConfig {
                bind_addr: or_default("VERDANT_API_BIND_ADDR", "0.0.0.0:8080"),
                rate_limit_per_minute: parse_u32("VERDANT_RATE_LIMIT_PER_MINUTE", 60)?,
            },
            payment_mode,
            cross_chain_enabled: or_default("VERDANT_CROSS_CHAIN_ENABLED", "false") == "true",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<String, String> {
        [
            ("VERDANT_LEDGER_REST_URL", "http://ledger.local:1317"),
            ("VERDANT_LEDGER_INDEXER_URL", "http://indexer.local/graphql"),
            ("VERDANT_AUTH_SECRET", "test-secret"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn load(env: &HashMap<String, String>) -> Result<Config, ConfigError> {
        Config::from_lookup(&|name| env.get(name).cloned())
    }

    #[test]
    fn minimal_env_gets_defaults() {
        let cfg = load(&base_env()).expect("config");
        assert_eq!(cfg.payment_mode, PaymentMode::Crypto);
        assert_eq!(cfg.ledger.broadcast_url, cfg.ledger.rest_url);
        assert_eq!(cfg.ledger.native_denom, "uverd");
        assert_eq!(cfg.batch.fee_bps, 250);
        assert_eq!(cfg.api.rate_limit_per_minute, 60);
        assert!(cfg.ledger.wallet_mnemonic.is_none());
        assert_eq!(cfg.auth.oauth_providers, vec!["google", "github"]);
        assert_eq!(cfg.gateway.usdc_denoms, vec!["uusdc"]);
    }

    #[test]
    fn missing_required_var_is_an_error() {
        let mut env = base_env();
        env.remove("VERDANT_AUTH_SECRET");
        assert!(matches!(load(&env), Err(ConfigError::MissingVar(name)) if name == "VERDANT_AUTH_SECRET"));
    }

    #[test]
    fn bad_integer_is_reported_with_name() {
        let mut env = base_env();
        env.insert("VERDANT_BATCH_FEE_BPS".to_string(), "lots".to_string());
        match load(&env) {
            Err(ConfigError::InvalidVar { name, .. }) => {
                assert_eq!(name, "VERDANT_BATCH_FEE_BPS")
            }
            other => panic!("expected InvalidVar, got {:?}", other),
        }
    }

    #[test]
    fn stripe_mode_parses() {
        let mut env = base_env();
        env.insert("VERDANT_PAYMENT_MODE".to_string(), "stripe".to_string());
        assert_eq!(load(&env).unwrap().payment_mode, PaymentMode::Stripe);

        env.insert("VERDANT_PAYMENT_MODE".to_string(), "barter".to_string());
        assert!(load(&env).is_err());
    }
}
