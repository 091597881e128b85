//! Configuration for the relayer process.
//!
//! Loaded entirely from environment variables, following the same
//! literal-or-env-var secret resolution the reference facilitator config
//! uses for signer keys, but without the JSON-chain-map indirection: this
//! relayer's chain set is fixed to `{Sepolia, PolygonAmoy}`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::B256;
use clap::Parser;
use url::Url;

use crate::model::ChainId;

/// CLI flags. Every flag also accepts its value via the matching env var
/// (`clap`'s `env` feature), mirroring the reference facilitator's
/// `CliArgs`.
#[derive(Parser, Debug)]
#[command(name = "aleo-evm-relayer")]
#[command(about = "Settles Aleo transfer intents as native transfers on EVM chains")]
struct CliArgs {
    /// Override DB_PATH from the command line.
    #[arg(long, env = "DB_PATH")]
    db_path: Option<PathBuf>,
}

/// A validated EVM private key (32 bytes), analogous to the reference
/// facilitator's `EvmPrivateKey`.
#[derive(Clone, Copy)]
pub struct EvmPrivateKey(pub B256);

impl FromStr for EvmPrivateKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(EvmPrivateKey)
            .map_err(|e| ConfigError::InvalidPrivateKey(format!("{e}")))
    }
}

impl std::fmt::Debug for EvmPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EvmPrivateKey(<redacted>)")
    }
}

/// Resolves `$VAR` / `${VAR}` syntax in an env-var-provided string, otherwise
/// returns the literal. Mirrors the reference facilitator's `LiteralOrEnv`.
fn resolve_literal_or_env(raw: &str) -> Result<String, ConfigError> {
    let var_name = if let Some(stripped) = raw.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        Some(stripped.to_string())
    } else if let Some(stripped) = raw.strip_prefix('$') {
        if stripped.chars().all(|c| c.is_alphanumeric() || c == '_') && !stripped.is_empty() {
            Some(stripped.to_string())
        } else {
            None
        }
    } else {
        None
    };
    match var_name {
        Some(name) => std::env::var(&name)
            .map_err(|_| ConfigError::MissingEnv(format!("{name} (referenced as {raw})"))),
        None => Ok(raw.to_string()),
    }
}

/// Aleo-side polling configuration.
#[derive(Debug, Clone)]
pub struct AleoConfig {
    /// Ordered fallback list of base URLs; the configured value is tried
    /// first, then the known v1/v2 explorer variants.
    pub base_urls: Vec<Url>,
    pub program_id: String,
    pub poll_interval: Duration,
    pub rate_limit_rps: u32,
    pub rate_limit_rpm: u32,
}

/// Per-chain EVM RPC configuration.
#[derive(Debug, Clone)]
pub struct EvmChainConfig {
    pub chain_id: ChainId,
    pub rpc_url: Url,
}

/// Full process configuration, assembled by [`Config::load`].
#[derive(Debug, Clone)]
pub struct Config {
    pub aleo: AleoConfig,
    pub evm_chains: Vec<EvmChainConfig>,
    pub signer_keys: Vec<B256>,
    pub max_batch_size: usize,
    pub max_batch_wait: Duration,
    pub gas_price_multiplier: f64,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub health_port: u16,
    pub health_host: IpAddr,
    pub db_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("invalid value for {name}: {value} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("at least 2 signer keys are required (found {0}); set RELAYER_PKS or RELAYER_PK + RELAYER_PK_2")]
    InsufficientSigners(usize),
    #[error("invalid URL for {name}: {value}")]
    InvalidUrl { name: &'static str, value: String },
}

fn env_or_default(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or_default<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            name,
            value: raw,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_url(name: &'static str, default: &str) -> Result<Url, ConfigError> {
    let raw = env_or_default(name, default);
    Url::parse(&raw).map_err(|_| ConfigError::InvalidUrl { name, value: raw })
}

fn env_required_url(name: &'static str) -> Result<Url, ConfigError> {
    let raw = std::env::var(name).map_err(|_| ConfigError::MissingEnv(name.to_string()))?;
    Url::parse(&raw).map_err(|_| ConfigError::InvalidUrl { name, value: raw })
}

/// Parses `RELAYER_PKS` (comma-separated) or `RELAYER_PK` + `RELAYER_PK_2`
/// (+ any further `RELAYER_PK_N`), resolving each entry through
/// [`resolve_literal_or_env`] exactly as the reference `Eip155SignersConfig`
/// resolves each array entry.
fn load_signer_keys() -> Result<Vec<B256>, ConfigError> {
    let mut raw_entries: Vec<String> = Vec::new();

    if let Ok(pks) = std::env::var("RELAYER_PKS") {
        raw_entries.extend(pks.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()));
    } else {
        if let Ok(pk) = std::env::var("RELAYER_PK") {
            raw_entries.push(pk);
        }
        if let Ok(pk2) = std::env::var("RELAYER_PK_2") {
            raw_entries.push(pk2);
        }
        let mut n = 3;
        while let Ok(pk) = std::env::var(format!("RELAYER_PK_{n}")) {
            raw_entries.push(pk);
            n += 1;
        }
    }

    let mut keys = Vec::with_capacity(raw_entries.len());
    for raw in raw_entries {
        let resolved = resolve_literal_or_env(&raw)?;
        let key: EvmPrivateKey = resolved.parse()?;
        keys.push(key.0);
    }

    if keys.len() < 2 {
        return Err(ConfigError::InsufficientSigners(keys.len()));
    }
    Ok(keys)
}

impl Config {
    /// Loads and validates configuration from the environment, allowing
    /// `--db-path` to override `DB_PATH` from the command line.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();

        let base_url = env_url("ALEO_RPC", "https://api.explorer.provable.com/v2/testnet")?;
        let mut base_urls = vec![base_url];
        for fallback in [
            "https://api.explorer.provable.com/v1/testnet",
            "https://testnet.aleorpc.com",
        ] {
            if let Ok(url) = Url::parse(fallback) {
                if !base_urls.contains(&url) {
                    base_urls.push(url);
                }
            }
        }

        let aleo = AleoConfig {
            base_urls,
            program_id: env_or_default("ALEO_PROGRAM_ID", "privacy_box_mvp.aleo"),
            poll_interval: Duration::from_millis(env_parse_or_default("ALEO_POLL_INTERVAL", 10_000)?),
            rate_limit_rps: env_parse_or_default("ALEO_RATE_LIMIT_RPS", 5)?,
            rate_limit_rpm: env_parse_or_default("ALEO_RATE_LIMIT_RPM", 100)?,
        };

        let evm_chains = vec![
            EvmChainConfig {
                chain_id: ChainId::Sepolia,
                rpc_url: env_required_url("SEPOLIA_RPC")?,
            },
            EvmChainConfig {
                chain_id: ChainId::Amoy,
                rpc_url: env_required_url("POLYGON_AMOY_RPC")?,
            },
        ];

        let signer_keys = load_signer_keys()?;

        let db_path = cli_args
            .db_path
            .or_else(|| std::env::var("DB_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./data/transactions.db"));

        Ok(Config {
            aleo,
            evm_chains,
            signer_keys,
            max_batch_size: env_parse_or_default("MAX_BATCH_SIZE", 5usize)?,
            max_batch_wait: Duration::from_millis(env_parse_or_default("MAX_BATCH_WAIT_TIME", 10_000)?),
            gas_price_multiplier: env_parse_or_default("GAS_PRICE_MULTIPLIER", 1.10f64)?,
            max_retries: env_parse_or_default("MAX_RETRIES", 3)?,
            retry_delay: Duration::from_millis(env_parse_or_default("RETRY_DELAY", 60_000)?),
            health_port: env_parse_or_default("HEALTH_PORT", 3001)?,
            health_host: IpAddr::from_str("0.0.0.0").unwrap(),
            db_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests that mutate process env vars must not interleave with each
    // other; guarded the same way the reference `provider_cache.rs` tests
    // guard theirs.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn resolves_literal_private_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        let literal = "0x0000000000000000000000000000000000000000000000000000000000000001";
        let resolved = resolve_literal_or_env(literal).unwrap();
        assert_eq!(resolved, literal);
    }

    #[test]
    fn resolves_env_var_private_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var(
                "TEST_RELAYER_PK",
                "0x0000000000000000000000000000000000000000000000000000000000000002",
            );
        }
        let resolved = resolve_literal_or_env("$TEST_RELAYER_PK").unwrap();
        assert_eq!(
            resolved,
            "0x0000000000000000000000000000000000000000000000000000000000000002"
        );
        let resolved_braced = resolve_literal_or_env("${TEST_RELAYER_PK}").unwrap();
        assert_eq!(resolved_braced, resolved);
        unsafe {
            std::env::remove_var("TEST_RELAYER_PK");
        }
    }

    #[test]
    fn load_signer_keys_supports_comma_separated_list() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var("RELAYER_PK");
            std::env::remove_var("RELAYER_PK_2");
            std::env::set_var(
                "RELAYER_PKS",
                "0x0000000000000000000000000000000000000000000000000000000000000001,\
                 0x0000000000000000000000000000000000000000000000000000000000000002",
            );
        }
        let keys = load_signer_keys().unwrap();
        assert_eq!(keys.len(), 2);
        unsafe {
            std::env::remove_var("RELAYER_PKS");
        }
    }

    #[test]
    fn load_signer_keys_requires_at_least_two() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var("RELAYER_PKS");
            std::env::remove_var("RELAYER_PK_2");
            std::env::set_var(
                "RELAYER_PK",
                "0x0000000000000000000000000000000000000000000000000000000000000001",
            );
        }
        let result = load_signer_keys();
        assert!(matches!(result, Err(ConfigError::InsufficientSigners(1))));
        unsafe {
            std::env::remove_var("RELAYER_PK");
        }
    }
}
