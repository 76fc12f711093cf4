//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`. Every numeric threshold the
//! engine uses (dust cutoff, deviation bounds, retry ceilings, TTLs) lives
//! here with a default, so operators can tune the mechanism without a
//! rebuild.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;

use crate::types::Chain;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub chains: ChainsConfig,
    pub oracle: OracleConfig,
    pub aggregators: AggregatorsConfig,
    pub queue: QueueConfig,
    pub gate: GateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    /// Interval of the background scheduler loop (tracking re-drive, prune).
    pub tick_interval_secs: u64,
    /// Balances below this USD value count as dust.
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold_usd: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite connection string; the store and the job queue share it.
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainsConfig {
    /// Account-model chains scanned via an indexing provider.
    pub evm: Vec<EvmChainConfig>,
    pub solana: SolanaChainConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvmChainConfig {
    pub chain: Chain,
    pub enabled: bool,
    /// Token-balance indexer endpoint (Alchemy-style enhanced API).
    pub indexer_url: String,
    /// JSON-RPC endpoint for native balance and receipts.
    pub rpc_url: String,
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SolanaChainConfig {
    pub enabled: bool,
    pub rpc_url: String,
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    /// Price cache TTL. Short enough to bound staleness for a
    /// money-moving decision.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Per-source fetch timeout.
    #[serde(default = "default_source_timeout")]
    pub source_timeout_ms: u64,
    /// Max pairwise deviation for HIGH confidence (percent).
    #[serde(default = "default_high_deviation")]
    pub high_max_deviation_pct: Decimal,
    /// Max pairwise deviation for MEDIUM confidence (percent).
    #[serde(default = "default_medium_deviation")]
    pub medium_max_deviation_pct: Decimal,
    /// Liquidity below this floor caps confidence below HIGH.
    #[serde(default = "default_liquidity_floor")]
    pub liquidity_floor_usd: Decimal,
    /// 24h volume required for HIGH confidence.
    #[serde(default = "default_volume_floor")]
    pub volume_floor_usd: Decimal,
    pub coingecko: PriceSourceConfig,
    pub dexscreener: PriceSourceConfig,
    pub jupiter: PriceSourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PriceSourceConfig {
    pub enabled: bool,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregatorsConfig {
    /// Quote lifetime assigned when a provider doesn't supply a deadline.
    #[serde(default = "default_quote_ttl")]
    pub quote_ttl_secs: u64,
    /// Default slippage tolerance (percent) when the caller doesn't choose.
    #[serde(default = "default_slippage")]
    pub default_slippage_pct: Decimal,
    pub zerox: AggregatorConfig,
    pub jupiter: AggregatorConfig,
    pub lifi: AggregatorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregatorConfig {
    pub enabled: bool,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Worker poll interval.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Attempt ceiling for money-moving execution jobs.
    #[serde(default = "default_execution_attempts")]
    pub execution_attempts: u32,
    /// Attempt ceiling for background price-refresh jobs.
    #[serde(default = "default_price_attempts")]
    pub price_attempts: u32,
    /// Terminal jobs older than this are pruned.
    #[serde(default = "default_retention")]
    pub retention_hours: u64,
    /// Initial tracking delay for same-chain swap legs.
    #[serde(default = "default_swap_track_delay")]
    pub swap_track_delay_secs: u64,
    /// Initial tracking delay for bridge legs (bridge finality is slower).
    #[serde(default = "default_bridge_track_delay")]
    pub bridge_track_delay_secs: u64,
    /// A leg still unconfirmed after this many tracking polls is failed.
    #[serde(default = "default_max_track_polls")]
    pub max_track_polls: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GateConfig {
    pub enabled: bool,
}

fn default_dust_threshold() -> Decimal {
    dec!(1.00)
}
fn default_cache_ttl() -> u64 {
    45
}
fn default_source_timeout() -> u64 {
    1_500
}
fn default_high_deviation() -> Decimal {
    dec!(1.5)
}
fn default_medium_deviation() -> Decimal {
    dec!(5.0)
}
fn default_liquidity_floor() -> Decimal {
    dec!(10_000)
}
fn default_volume_floor() -> Decimal {
    dec!(50_000)
}
fn default_quote_ttl() -> u64 {
    60
}
fn default_slippage() -> Decimal {
    dec!(0.5)
}
fn default_poll_interval() -> u64 {
    500
}
fn default_execution_attempts() -> u32 {
    5
}
fn default_price_attempts() -> u32 {
    3
}
fn default_retention() -> u64 {
    72
}
fn default_swap_track_delay() -> u64 {
    5
}
fn default_bridge_track_delay() -> u64 {
    30
}
fn default_max_track_polls() -> u32 {
    40
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Enabled EVM chain entries.
    pub fn enabled_evm_chains(&self) -> impl Iterator<Item = &EvmChainConfig> {
        self.chains.evm.iter().filter(|c| c.enabled)
    }
}
