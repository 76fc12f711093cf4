//! Settlement boundary.
//!
//! The on-chain execution target is opaque to the engine: submit a signed
//! calldata blob, poll a receipt. Contract semantics live behind this
//! trait; the orchestrator only sees pending / confirmed / reverted.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::types::{Chain, ChainFamily, ReceiptStatus, TxReceipt};

/// Abstraction over transaction broadcast and confirmation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettlementTarget: Send + Sync {
    /// Broadcast signed execution data; returns the transaction hash.
    async fn submit(&self, chain: Chain, calldata: &str, signer_context: &str) -> Result<String>;

    /// Poll the chain-side status of a submitted transaction.
    async fn receipt(&self, chain: Chain, tx_hash: &str) -> Result<TxReceipt>;
}

// ---------------------------------------------------------------------------
// JSON-RPC implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct EvmReceipt {
    status: Option<String>,
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SolanaStatuses {
    value: Vec<Option<SolanaStatus>>,
}

#[derive(Debug, Deserialize)]
struct SolanaStatus {
    #[serde(default)]
    err: Option<serde_json::Value>,
    #[serde(default, rename = "confirmationStatus")]
    confirmation_status: Option<String>,
}

/// Settlement over plain JSON-RPC per chain family.
pub struct RpcSettlement {
    http: Client,
    rpc_urls: HashMap<Chain, String>,
}

impl RpcSettlement {
    pub fn new(rpc_urls: HashMap<Chain, String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build settlement HTTP client")?;
        Ok(Self { http, rpc_urls })
    }

    /// Raw call; a null `result` is returned as `None` (e.g. a receipt
    /// for a transaction not yet mined).
    async fn rpc_opt<T: serde::de::DeserializeOwned>(
        &self,
        chain: Chain,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        let url = self
            .rpc_urls
            .get(&chain)
            .ok_or_else(|| anyhow::anyhow!("No RPC endpoint configured for {chain}"))?;

        let resp = self
            .http
            .post(url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .with_context(|| format!("RPC {method} request failed on {chain}"))?;

        if !resp.status().is_success() {
            anyhow::bail!("RPC error {} for {method} on {chain}", resp.status());
        }

        let envelope: RpcEnvelope<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse RPC {method} response"))?;

        if let Some(err) = envelope.error {
            anyhow::bail!("RPC {method} rejected on {chain}: {}", err.message);
        }
        Ok(envelope.result)
    }

    async fn rpc<T: serde::de::DeserializeOwned>(
        &self,
        chain: Chain,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        self.rpc_opt(chain, method, params)
            .await?
            .ok_or_else(|| anyhow::anyhow!("RPC {method} returned no result"))
    }
}

/// Map an EVM receipt (or its absence) onto the boundary status.
fn evm_receipt_status(receipt: Option<EvmReceipt>) -> TxReceipt {
    match receipt {
        None => TxReceipt {
            status: ReceiptStatus::Pending,
            details: None,
        },
        Some(r) => match r.status.as_deref() {
            Some("0x1") => TxReceipt {
                status: ReceiptStatus::Confirmed,
                details: r.block_number.map(|b| format!("block {b}")),
            },
            Some("0x0") => TxReceipt {
                status: ReceiptStatus::Reverted,
                details: Some("execution reverted".into()),
            },
            _ => TxReceipt {
                status: ReceiptStatus::Pending,
                details: None,
            },
        },
    }
}

/// Map a Solana signature status onto the boundary status.
fn solana_signature_status(status: Option<SolanaStatus>) -> TxReceipt {
    match status {
        None => TxReceipt {
            status: ReceiptStatus::Pending,
            details: None,
        },
        Some(s) if s.err.is_some() => TxReceipt {
            status: ReceiptStatus::Reverted,
            details: s.err.map(|e| e.to_string()),
        },
        Some(s) => match s.confirmation_status.as_deref() {
            Some("confirmed") | Some("finalized") => TxReceipt {
                status: ReceiptStatus::Confirmed,
                details: s.confirmation_status,
            },
            _ => TxReceipt {
                status: ReceiptStatus::Pending,
                details: None,
            },
        },
    }
}

#[async_trait]
impl SettlementTarget for RpcSettlement {
    async fn submit(&self, chain: Chain, calldata: &str, signer_context: &str) -> Result<String> {
        let tx_hash: String = match chain.family() {
            ChainFamily::Account => {
                self.rpc(chain, "eth_sendRawTransaction", json!([calldata]))
                    .await?
            }
            ChainFamily::TokenAccount => {
                self.rpc(
                    chain,
                    "sendTransaction",
                    json!([calldata, { "encoding": "base64" }]),
                )
                .await?
            }
        };

        info!(%chain, signer = signer_context, tx_hash = %tx_hash, "Transaction broadcast");
        Ok(tx_hash)
    }

    async fn receipt(&self, chain: Chain, tx_hash: &str) -> Result<TxReceipt> {
        let receipt = match chain.family() {
            ChainFamily::Account => {
                let raw: Option<EvmReceipt> = self
                    .rpc_opt(chain, "eth_getTransactionReceipt", json!([tx_hash]))
                    .await?;
                evm_receipt_status(raw)
            }
            ChainFamily::TokenAccount => {
                let statuses: SolanaStatuses = self
                    .rpc(chain, "getSignatureStatuses", json!([[tx_hash]]))
                    .await?;
                solana_signature_status(statuses.value.into_iter().next().flatten())
            }
        };

        debug!(%chain, tx_hash, status = ?receipt.status, "Receipt polled");
        Ok(receipt)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evm_receipt_missing_is_pending() {
        let r = evm_receipt_status(None);
        assert_eq!(r.status, ReceiptStatus::Pending);
    }

    #[test]
    fn test_evm_receipt_success() {
        let r = evm_receipt_status(Some(EvmReceipt {
            status: Some("0x1".into()),
            block_number: Some("0x10d4f".into()),
        }));
        assert_eq!(r.status, ReceiptStatus::Confirmed);
        assert!(r.details.unwrap().contains("0x10d4f"));
    }

    #[test]
    fn test_evm_receipt_revert() {
        let r = evm_receipt_status(Some(EvmReceipt {
            status: Some("0x0".into()),
            block_number: None,
        }));
        assert_eq!(r.status, ReceiptStatus::Reverted);
    }

    #[test]
    fn test_solana_status_missing_is_pending() {
        let r = solana_signature_status(None);
        assert_eq!(r.status, ReceiptStatus::Pending);
    }

    #[test]
    fn test_solana_status_finalized() {
        let r = solana_signature_status(Some(SolanaStatus {
            err: None,
            confirmation_status: Some("finalized".into()),
        }));
        assert_eq!(r.status, ReceiptStatus::Confirmed);
    }

    #[test]
    fn test_solana_status_processed_still_pending() {
        let r = solana_signature_status(Some(SolanaStatus {
            err: None,
            confirmation_status: Some("processed".into()),
        }));
        assert_eq!(r.status, ReceiptStatus::Pending);
    }

    #[test]
    fn test_solana_status_error_is_reverted() {
        let r = solana_signature_status(Some(SolanaStatus {
            err: Some(serde_json::json!({"InstructionError": [0, "Custom"]})),
            confirmation_status: Some("confirmed".into()),
        }));
        assert_eq!(r.status, ReceiptStatus::Reverted);
        assert!(r.details.unwrap().contains("InstructionError"));
    }
}
