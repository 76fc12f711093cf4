//! Shared types for the DUSTER engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that scanner, oracle, aggregator,
//! and orchestrator modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

/// A supported blockchain network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Polygon,
    Arbitrum,
    Base,
    Solana,
}

/// How a chain models token ownership. Determines which scanner
/// implementation and which aggregator adapters apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainFamily {
    /// Account-model chains (EVM): balances live on the token contract.
    Account,
    /// Token-account chains (Solana): balances live in per-owner accounts.
    TokenAccount,
}

impl Chain {
    /// All supported chains (useful for iteration).
    pub const ALL: &'static [Chain] = &[
        Chain::Ethereum,
        Chain::Polygon,
        Chain::Arbitrum,
        Chain::Base,
        Chain::Solana,
    ];

    pub fn family(&self) -> ChainFamily {
        match self {
            Chain::Ethereum | Chain::Polygon | Chain::Arbitrum | Chain::Base => {
                ChainFamily::Account
            }
            Chain::Solana => ChainFamily::TokenAccount,
        }
    }

    /// Symbol of the chain's native gas asset.
    pub fn native_symbol(&self) -> &'static str {
        match self {
            Chain::Ethereum | Chain::Arbitrum | Chain::Base => "ETH",
            Chain::Polygon => "POL",
            Chain::Solana => "SOL",
        }
    }

    /// Precision of the native asset's base unit.
    pub fn native_decimals(&self) -> u8 {
        match self {
            Chain::Solana => 9,
            _ => 18,
        }
    }

    /// Canonical wrapped-native token, used to price the gas asset through
    /// the same oracle path as any other token.
    pub fn wrapped_native_token(&self) -> &'static str {
        match self {
            Chain::Ethereum => "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
            Chain::Polygon => "0x0d500B1d8E8eF31E21C99d1Db9A6444d3ADf1270",
            Chain::Arbitrum => "0x82aF49447D8a07e3bd95BD0d56f35241523fBab1",
            Chain::Base => "0x4200000000000000000000000000000000000006",
            Chain::Solana => "So11111111111111111111111111111111111111112",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Ethereum => write!(f, "ethereum"),
            Chain::Polygon => write!(f, "polygon"),
            Chain::Arbitrum => write!(f, "arbitrum"),
            Chain::Base => write!(f, "base"),
            Chain::Solana => write!(f, "solana"),
        }
    }
}

impl std::str::FromStr for Chain {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" => Ok(Chain::Ethereum),
            "polygon" | "matic" => Ok(Chain::Polygon),
            "arbitrum" | "arb" => Ok(Chain::Arbitrum),
            "base" => Ok(Chain::Base),
            "solana" | "sol" => Ok(Chain::Solana),
            _ => Err(anyhow::anyhow!("Unknown chain: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Wallet balances
// ---------------------------------------------------------------------------

/// Largest integer a `Decimal` mantissa can hold (96 bits).
const MAX_DECIMAL_MANTISSA: u128 = 79_228_162_514_264_337_593_543_950_335;

/// A single fungible token balance observed during a scan.
///
/// Produced fresh on every scan and never mutated afterwards; the next
/// scan of the same (wallet, chain) supersedes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletToken {
    pub chain: Chain,
    /// Contract address (EVM) or mint address (Solana).
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
    /// Balance in base units.
    pub raw_balance: u128,
    /// Balance converted via the token's declared decimals.
    pub formatted_balance: Decimal,
    /// USD valuation; zero when no price could be resolved.
    pub value_usd: Decimal,
    /// True iff `0 < value_usd < dust_threshold_usd`.
    pub is_dust: bool,
}

impl WalletToken {
    /// Convert a raw base-unit amount to a decimal value.
    ///
    /// Balances beyond the 96-bit `Decimal` mantissa shed low-order digits
    /// (and, past that, saturate) rather than panic — such balances are far
    /// above any dust threshold anyway.
    pub fn format_units(raw: u128, decimals: u8) -> Decimal {
        let mut value = raw;
        let mut scale = decimals as u32;
        while value > MAX_DECIMAL_MANTISSA && scale > 0 {
            value /= 10;
            scale -= 1;
        }
        if value > MAX_DECIMAL_MANTISSA {
            return Decimal::MAX;
        }
        Decimal::from_i128_with_scale(value as i128, scale)
    }
}

impl fmt::Display for WalletToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} (${:.2}{})",
            self.chain,
            self.formatted_balance,
            self.symbol,
            self.value_usd,
            if self.is_dust { ", dust" } else { "" },
        )
    }
}

/// Everything a single chain scan produced for one wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainBalance {
    pub chain: Chain,
    pub tokens: Vec<WalletToken>,
    pub native_balance: Decimal,
    pub native_value_usd: Decimal,
    pub total_value_usd: Decimal,
    pub dust_value_usd: Decimal,
    pub dust_token_count: usize,
    pub scanned_at: DateTime<Utc>,
}

impl ChainBalance {
    /// Build a balance report from classified tokens, computing aggregates.
    pub fn from_tokens(
        chain: Chain,
        tokens: Vec<WalletToken>,
        native_balance: Decimal,
        native_value_usd: Decimal,
    ) -> Self {
        let token_value: Decimal = tokens.iter().map(|t| t.value_usd).sum();
        let dust_value_usd: Decimal = tokens
            .iter()
            .filter(|t| t.is_dust)
            .map(|t| t.value_usd)
            .sum();
        let dust_token_count = tokens.iter().filter(|t| t.is_dust).count();

        Self {
            chain,
            tokens,
            native_balance,
            native_value_usd,
            total_value_usd: token_value + native_value_usd,
            dust_value_usd,
            dust_token_count,
            scanned_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

/// Trust tier attached to a resolved price, derived from source agreement
/// and liquidity depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriceConfidence {
    Untrusted,
    Low,
    Medium,
    High,
}

impl fmt::Display for PriceConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceConfidence::High => write!(f, "HIGH"),
            PriceConfidence::Medium => write!(f, "MEDIUM"),
            PriceConfidence::Low => write!(f, "LOW"),
            PriceConfidence::Untrusted => write!(f, "UNTRUSTED"),
        }
    }
}

/// What a single upstream source reported for a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePrice {
    pub price_usd: Decimal,
    pub liquidity_usd: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
}

/// One source's contribution to a validated price, retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceObservation {
    pub source: String,
    pub price_usd: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// A multi-source, trust-scored price for one (token, chain).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedPrice {
    pub token: String,
    pub chain: Chain,
    pub price_usd: Decimal,
    pub confidence: PriceConfidence,
    pub sources: Vec<PriceObservation>,
    pub liquidity_usd: Decimal,
    pub volume_24h: Decimal,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

/// Whether a quote settles on its own chain or moves value across chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteKind {
    Swap,
    Bridge { dest_chain: Chain },
}

/// A normalized quote from one aggregator adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexQuote {
    pub aggregator: String,
    pub chain: Chain,
    pub kind: QuoteKind,
    pub input_token: String,
    pub output_token: String,
    pub input_amount: u128,
    pub output_amount: u128,
    /// USD value of `output_amount`; decorated by the selector when the
    /// adapter cannot value it directly.
    pub output_value_usd: Decimal,
    pub price_impact_pct: Decimal,
    pub estimated_gas_usd: Decimal,
    pub slippage_tolerance: Decimal,
    /// Epoch seconds. Always in the future at creation time.
    pub expires_at: i64,
    pub route: String,
    /// Display symbols, decorated best-effort from the metadata cache;
    /// their absence never blocks selection.
    pub input_symbol: Option<String>,
    pub output_symbol: Option<String>,
    /// Executable payload bound to the quoted route. Quotes without it can
    /// be previewed but never executed.
    pub calldata: Option<String>,
}

impl DexQuote {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.expires_at
    }

    /// Output value net of estimated gas, the selector's ranking metric.
    pub fn net_output_usd(&self) -> Decimal {
        self.output_value_usd - self.estimated_gas_usd
    }

    pub fn has_execution_data(&self) -> bool {
        self.calldata.is_some()
    }
}

impl fmt::Display for DexQuote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} -> {} on {} (out: {}, ${:.2} net, impact {:.2}%)",
            self.aggregator,
            self.input_token,
            self.output_token,
            self.chain,
            self.output_amount,
            self.net_output_usd(),
            self.price_impact_pct,
        )
    }
}

/// What the selector asks each adapter for.
#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub chain: Chain,
    /// Set when the output lands on a different chain (bridge leg).
    /// Swap adapters return no quote for such requests.
    pub dest_chain: Option<Chain>,
    pub input_token: String,
    pub output_token: String,
    pub input_amount: u128,
    /// Declared decimals of the output token, when the caller knows them;
    /// used to value the output for quote ranking.
    pub output_decimals: Option<u8>,
    pub slippage_tolerance: Decimal,
    pub user_address: String,
    pub include_execution_data: bool,
}

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

/// Lifecycle of a sweep. Transitions are owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepStatus {
    Pending,
    Quoting,
    Signing,
    Submitted,
    Confirmed,
    Failed,
    Cancelled,
}

impl SweepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SweepStatus::Confirmed | SweepStatus::Failed | SweepStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal state-machine edge.
    pub fn allows_transition_to(&self, next: SweepStatus) -> bool {
        use SweepStatus::*;
        matches!(
            (self, next),
            (Pending, Quoting)
                | (Quoting, Signing)
                | (Signing, Submitted)
                | (Submitted, Confirmed)
                | (Submitted, Failed)
                | (Pending, Cancelled)
                | (Quoting, Cancelled)
                | (Signing, Cancelled)
        )
    }
}

impl fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SweepStatus::Pending => "pending",
            SweepStatus::Quoting => "quoting",
            SweepStatus::Signing => "signing",
            SweepStatus::Submitted => "submitted",
            SweepStatus::Confirmed => "confirmed",
            SweepStatus::Failed => "failed",
            SweepStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SweepStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SweepStatus::Pending),
            "quoting" => Ok(SweepStatus::Quoting),
            "signing" => Ok(SweepStatus::Signing),
            "submitted" => Ok(SweepStatus::Submitted),
            "confirmed" => Ok(SweepStatus::Confirmed),
            "failed" => Ok(SweepStatus::Failed),
            "cancelled" => Ok(SweepStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Unknown sweep status: {s}")),
        }
    }
}

/// Per-chain sub-status of one leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

impl fmt::Display for LegStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LegStatus::Pending => "pending",
            LegStatus::Submitted => "submitted",
            LegStatus::Confirmed => "confirmed",
            LegStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One chain-scoped sub-operation (swap or bridge transfer) of a sweep.
///
/// Carries the exact quote snapshot the user approved; execution never
/// re-fetches a live quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepLeg {
    pub chain: Chain,
    pub quote: DexQuote,
    pub status: LegStatus,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    /// Index of a prerequisite leg (bridge) that must confirm before this
    /// leg may be enqueued.
    pub depends_on: Option<usize>,
}

impl SweepLeg {
    pub fn new(quote: DexQuote) -> Self {
        Self {
            chain: quote.chain,
            quote,
            status: LegStatus::Pending,
            tx_hash: None,
            error: None,
            depends_on: None,
        }
    }
}

/// One dust balance selected as input to a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepInput {
    pub chain: Chain,
    pub token: String,
    pub symbol: String,
    pub amount: u128,
    pub value_usd: Decimal,
}

/// The aggregate root of one consolidation. Created on quote acceptance,
/// mutated only through orchestrator transitions, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sweep {
    pub id: String,
    pub wallet: String,
    pub status: SweepStatus,
    pub inputs: Vec<SweepInput>,
    pub legs: Vec<SweepLeg>,
    pub output_token: String,
    pub output_chain: Chain,
    /// Declared decimals of the output token, when known at creation.
    #[serde(default)]
    pub output_decimals: Option<u8>,
    pub output_amount: Option<u128>,
    pub fee_paid_usd: Decimal,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Sweep {
    pub fn new(wallet: &str, output_token: &str, output_chain: Chain) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            wallet: wallet.to_string(),
            status: SweepStatus::Pending,
            inputs: Vec::new(),
            legs: Vec::new(),
            output_token: output_token.to_string(),
            output_chain,
            output_decimals: None,
            output_amount: None,
            fee_paid_usd: Decimal::ZERO,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Total USD value of the selected inputs.
    pub fn input_value_usd(&self) -> Decimal {
        self.inputs.iter().map(|i| i.value_usd).sum()
    }

    /// Whether any persisted leg quote has passed its deadline.
    pub fn any_quote_expired(&self, now: DateTime<Utc>) -> bool {
        self.legs.iter().any(|l| l.quote.is_expired(now))
    }

    /// Count of (confirmed, failed) legs, for partial-failure reporting
    /// ("3 of 4 confirmed").
    pub fn leg_tally(&self) -> (usize, usize) {
        let confirmed = self
            .legs
            .iter()
            .filter(|l| l.status == LegStatus::Confirmed)
            .count();
        let failed = self
            .legs
            .iter()
            .filter(|l| l.status == LegStatus::Failed)
            .count();
        (confirmed, failed)
    }
}

// ---------------------------------------------------------------------------
// Settlement boundary
// ---------------------------------------------------------------------------

/// Chain-side status of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Pending,
    Confirmed,
    Reverted,
}

/// Receipt returned by the settlement target for one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxReceipt {
    pub status: ReceiptStatus,
    pub details: Option<String>,
}

// ---------------------------------------------------------------------------
// Payment gate boundary
// ---------------------------------------------------------------------------

/// A payment authorization presented to the gate. Signature verification
/// itself is a black box; the core checks nonce replay and the validity
/// window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAuthorization {
    pub wallet: String,
    pub nonce: String,
    /// Epoch seconds.
    pub valid_after: i64,
    /// Epoch seconds.
    pub valid_before: i64,
    pub signature: String,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for DUSTER.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("No price available for {token} on {chain}")]
    PriceUnavailable { token: String, chain: Chain },

    #[error("No route for {input} -> {output} on {chain}")]
    NoRoute {
        chain: Chain,
        input: String,
        output: String,
    },

    #[error("Quote from {aggregator} expired at {expires_at}")]
    QuoteExpired { aggregator: String, expires_at: i64 },

    #[error("Quote is missing execution data")]
    MissingExecutionData,

    #[error("Illegal sweep transition {from} -> {to}")]
    InvalidTransition { from: SweepStatus, to: SweepStatus },

    #[error("Timed out waiting for job {job_id}")]
    Timeout { job_id: String },

    #[error("Payment nonce already used: {0}")]
    NonceAlreadyUsed(String),

    #[error("Payment authorization outside its validity window")]
    AuthorizationExpired,

    #[error("Payment authorization rejected")]
    AuthorizationInvalid,

    #[error("Sweep not found: {0}")]
    SweepNotFound(String),

    #[error("Sweep has no selected inputs")]
    EmptySweep,

    #[error("Aggregator error: {0}")]
    Aggregator(String),

    #[error("Scanner error ({chain}): {message}")]
    Scanner { chain: Chain, message: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
