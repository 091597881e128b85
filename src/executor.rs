//! Sends a single native-token transfer and waits for inclusion, following
//! the nonce-reserve / broadcast / await-receipt-with-timeout / reset-on-
//! failure shape of the reference `Eip155ChainProvider::send_transaction`,
//! generalized from an ERC-3009 contract call to a plain value transfer.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, TxKind};
use alloy_provider::Provider;
use alloy_rpc_types_eth::TransactionRequest;
use alloy_transport::{RpcError, TransportErrorKind};

use crate::errors::RelayerError;
use crate::metrics::MetricsRegistry;
use crate::model::{ChainId, TransferIntent};
use crate::wallet::{amount_to_wei, WalletPool};

const NATIVE_TRANSFER_GAS_LIMIT: u64 = 21_000;
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(2);

/// Outcome of one [`EvmExecutor::send`] call (successes and failures are
/// both reported; a single failure never cancels sibling sends).
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub request_id: String,
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Confirmed { tx_hash: String, block_number: u64 },
    Failed { error: String, permanent: bool },
}

/// One executor per chain, holding a handle to that chain's wallet pool.
/// Polymorphism over chains is realized as one instance per `ChainId`
/// variant rather than a trait object, since the capability set is
/// identical for both supported chains.
pub struct EvmExecutor {
    pub chain_id: ChainId,
    pub wallet_pool: Arc<WalletPool>,
    pub metrics: Arc<MetricsRegistry>,
}

impl EvmExecutor {
    pub fn new(chain_id: ChainId, wallet_pool: Arc<WalletPool>, metrics: Arc<MetricsRegistry>) -> Self {
        EvmExecutor {
            chain_id,
            wallet_pool,
            metrics,
        }
    }

    /// Sends `intent` from `wallet_address`, retrying transient failures up
    /// to `MAX_ATTEMPTS` with exponential backoff starting at `BASE_BACKOFF`.
    /// A retry obtains a fresh nonce.
    pub async fn send(&self, intent: &TransferIntent, wallet_address: Address) -> ExecutionResult {
        let mut last_error = String::new();
        let mut permanent = false;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.send_once(intent, wallet_address).await {
                Ok((tx_hash, block_number)) => {
                    self.metrics.record_confirmed(self.chain_id);
                    return ExecutionResult {
                        request_id: intent.request_id.clone(),
                        outcome: ExecutionOutcome::Confirmed { tx_hash, block_number },
                    };
                }
                Err(err) => {
                    self.metrics.record_failed(self.chain_id);
                    permanent = !err.is_transient();
                    last_error = err.to_string();
                    tracing::warn!(
                        request_id = %intent.request_id,
                        chain_id = %self.chain_id,
                        attempt,
                        permanent,
                        error = %last_error,
                        "evm send attempt failed"
                    );
                    if permanent || attempt == MAX_ATTEMPTS {
                        break;
                    }
                    let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        ExecutionResult {
            request_id: intent.request_id.clone(),
            outcome: ExecutionOutcome::Failed {
                error: last_error,
                permanent,
            },
        }
    }

    async fn send_once(&self, intent: &TransferIntent, wallet_address: Address) -> Result<(String, u64), RelayerError> {
        let recipient = Address::from_str(&intent.recipient)
            .map_err(|e| RelayerError::validation(format!("invalid recipient: {e}")))?;
        let value = amount_to_wei(intent.amount)?;

        let gas = self.wallet_pool.gas_fields(wallet_address).await?;

        let mut tx = TransactionRequest::default()
            .with_from(wallet_address)
            .to(TxKind::Call(recipient))
            .with_value(value)
            .with_gas_limit(NATIVE_TRANSFER_GAS_LIMIT);

        if let (Some(max_fee), Some(max_priority_fee)) = (gas.max_fee_per_gas, gas.max_priority_fee_per_gas) {
            tx = tx.max_fee_per_gas(max_fee).max_priority_fee_per_gas(max_priority_fee);
        } else if let Some(gas_price) = gas.gas_price {
            tx = tx.gas_price(gas_price);
        }

        self.metrics.record_sent(self.chain_id);

        let pending_tx = match self.wallet_pool.provider.send_transaction(tx).await {
            Ok(pending) => pending,
            Err(e) => {
                self.wallet_pool.nonce_manager.reset_nonce(wallet_address).await;
                return Err(classify_send_error(&e));
            }
        };

        let receipt = match tokio::time::timeout(RECEIPT_TIMEOUT, pending_tx.get_receipt()).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => {
                self.wallet_pool.nonce_manager.reset_nonce(wallet_address).await;
                return Err(RelayerError::chain_transient(format!("receipt wait failed: {e}")));
            }
            Err(_) => {
                self.wallet_pool.nonce_manager.reset_nonce(wallet_address).await;
                return Err(RelayerError::chain_transient("receipt wait timed out"));
            }
        };

        if !receipt.status() {
            self.wallet_pool.nonce_manager.mark_confirmed(wallet_address).await;
            return Err(RelayerError::chain_permanent("execution reverted"));
        }

        self.wallet_pool.nonce_manager.mark_confirmed(wallet_address).await;
        let tx_hash = format!("{:#x}", receipt.transaction_hash);
        let block_number = receipt.block_number.unwrap_or_default();
        Ok((tx_hash, block_number))
    }

    /// Reconciles nonce and balance drift across all slots after a batch.
    pub async fn refresh_nonces(&self) -> Result<(), RelayerError> {
        self.wallet_pool.refresh_all().await
    }
}

/// Classifies a broadcast-time transport error into transient vs. permanent
/// by matching on `RpcError`'s own variants, not by parsing the error's
/// flattened display text: a transport-level failure (timeout, backend
/// gone, dropped connection) is always worth retrying on a fresh nonce,
/// while a JSON-RPC error response from the node is worth inspecting
/// itself since the chain never returns a node rejection through
/// `TransportErrorKind`.
fn classify_send_error(e: &RpcError<TransportErrorKind>) -> RelayerError {
    match e {
        RpcError::ErrorResp(payload) => {
            let message = payload.message.to_string();
            let lowered = message.to_ascii_lowercase();
            if lowered.contains("insufficient funds") || lowered.contains("invalid sender") {
                RelayerError::chain_permanent(message)
            } else {
                // nonce too low/high, underpriced, replacement underpriced: transient.
                RelayerError::chain_transient(message)
            }
        }
        RpcError::NullResp => RelayerError::chain_transient("rpc returned an empty response"),
        RpcError::Transport(kind) => RelayerError::chain_transient(kind.to_string()),
        other => RelayerError::chain_transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let backoffs: Vec<Duration> = (1..=MAX_ATTEMPTS).map(|a| BASE_BACKOFF * 2u32.pow(a - 1)).collect();
        assert_eq!(backoffs, vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)]);
    }
}
