//! Per-chain pool of `k` signing keys, each with its own nonce lane, gas
//! cache, and balance view. Modeled closely on the reference
//! `Eip155ChainProvider`: one `alloy_provider` filler stack per chain, with
//! `k` signer addresses registered on a single `EthereumWallet`.

use std::str::FromStr;
use std::sync::Arc;

use alloy_network::{Ethereum, EthereumWallet};
use alloy_primitives::{Address, U256};
use alloy_provider::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, NonceManager,
    WalletFiller,
};
use alloy_provider::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::errors::RelayerError;
use crate::model::ChainId;

/// Adapted from the reference `PendingNonceManager`, extended to expose
/// `pending_count` per address (the reference only tracked the next nonce).
#[derive(Clone, Debug, Default)]
pub struct PendingNonceManager {
    nonces: Arc<DashMap<Address, Arc<Mutex<u64>>>>,
    pending_counts: Arc<DashMap<Address, Arc<Mutex<u64>>>>,
}

#[async_trait]
impl NonceManager for PendingNonceManager {
    async fn get_next_nonce<P, N>(&self, provider: &P, address: Address) -> alloy_transport::TransportResult<u64>
    where
        P: Provider<N>,
        N: alloy_network::Network,
    {
        const NONE: u64 = u64::MAX;
        let nonce_lock = {
            let entry = self.nonces.entry(address).or_insert_with(|| Arc::new(Mutex::new(NONE)));
            Arc::clone(entry.value())
        };
        let mut nonce = nonce_lock.lock().await;
        let new_nonce = if *nonce == NONE {
            provider.get_transaction_count(address).pending().await?
        } else {
            *nonce + 1
        };
        *nonce = new_nonce;
        self.bump_pending(address, 1).await;
        Ok(new_nonce)
    }
}

impl PendingNonceManager {
    /// Releases a reserved nonce after a broadcast failure, so the next
    /// issuer re-uses it.
    pub async fn reset_nonce(&self, address: Address) {
        if let Some(nonce_lock) = self.nonces.get(&address) {
            let mut nonce = nonce_lock.lock().await;
            *nonce = u64::MAX;
        }
        self.bump_pending(address, -1).await;
    }

    /// Called after a nonce successfully lands (broadcast accepted), to
    /// decrement the outstanding count.
    pub async fn mark_confirmed(&self, address: Address) {
        self.bump_pending(address, -1).await;
    }

    pub async fn pending_count(&self, address: Address) -> u64 {
        match self.pending_counts.get(&address) {
            Some(counter) => *counter.lock().await,
            None => 0,
        }
    }

    /// Reconciles the local nonce cache with the chain, repairing drift
    /// from out-of-band transactions. Resets to the `NONE` sentinel, same
    /// as `reset_nonce`, so the next `get_next_nonce` call re-queries
    /// `.pending()` rather than trusting a value computed here: a slot
    /// that has never sent has a chain-reported pending count of `0`,
    /// and caching that directly (even after subtracting one) produces a
    /// nonce that skips the slot's true first nonce.
    pub async fn refresh<P: Provider<Ethereum>>(&self, _provider: &P, address: Address) -> Result<(), RelayerError> {
        if let Some(nonce_lock) = self.nonces.get(&address) {
            let mut nonce = nonce_lock.lock().await;
            *nonce = u64::MAX;
        }
        Ok(())
    }

    async fn bump_pending(&self, address: Address, delta: i64) {
        let counter = {
            let entry = self
                .pending_counts
                .entry(address)
                .or_insert_with(|| Arc::new(Mutex::new(0)));
            Arc::clone(entry.value())
        };
        let mut count = counter.lock().await;
        if delta >= 0 {
            *count += delta as u64;
        } else {
            *count = count.saturating_sub((-delta) as u64);
        }
    }
}

type InnerFiller =
    JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller<PendingNonceManager>, ChainIdFiller>>>;
pub type InnerProvider = FillProvider<JoinFill<JoinFill<Identity, InnerFiller>, WalletFiller<EthereumWallet>>, RootProvider>;

/// Gas fields cached per wallet slot, refreshed at most once per
/// `gasUpdateInterval`.
#[derive(Debug, Clone, Copy)]
pub struct GasCache {
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub gas_price: Option<u128>,
}

/// In-memory bookkeeping for one signing key. Nonce
/// state lives in the shared [`PendingNonceManager`]; this struct tracks the
/// application-level view used by the selection policy.
pub struct WalletSlot {
    pub address: Address,
    pub chain_id: ChainId,
    pub balance: Mutex<U256>,
    pub gas_cache: Mutex<Option<GasCache>>,
    pub last_refreshed_at: Mutex<Instant>,
}

#[derive(Debug, thiserror::Error)]
pub enum WalletPoolError {
    #[error("chain {0} requires at least 2 signer keys, found {1}")]
    InsufficientSigners(ChainId, usize),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("no wallet slot available with sufficient balance for amount {0}")]
    NoEligibleWallet(Decimal),
}

impl From<WalletPoolError> for RelayerError {
    fn from(e: WalletPoolError) -> Self {
        RelayerError::chain_transient(e.to_string())
    }
}

/// Per-chain pool of `k` signing keys.
pub struct WalletPool {
    pub chain_id: ChainId,
    pub provider: InnerProvider,
    pub nonce_manager: PendingNonceManager,
    pub slots: Vec<WalletSlot>,
    pub gas_update_interval: std::time::Duration,
    pub gas_price_multiplier: f64,
    pub max_outstanding: Mutex<usize>,
}

impl WalletPool {
    pub async fn connect(
        chain_id: ChainId,
        rpc_url: url::Url,
        signer_keys: &[alloy_primitives::B256],
        gas_update_interval: std::time::Duration,
        gas_price_multiplier: f64,
    ) -> Result<Self, WalletPoolError> {
        if signer_keys.len() < 2 {
            return Err(WalletPoolError::InsufficientSigners(chain_id, signer_keys.len()));
        }

        let mut wallet: Option<EthereumWallet> = None;
        let mut addresses = Vec::with_capacity(signer_keys.len());
        for key in signer_keys {
            let signer = PrivateKeySigner::from_bytes(key)
                .map_err(|e| WalletPoolError::Rpc(format!("invalid signer key: {e}")))?
                .with_chain_id(Some(chain_id.evm_chain_id()));
            addresses.push(signer.address());
            match wallet.as_mut() {
                Some(w) => w.register_signer(signer),
                None => wallet = Some(EthereumWallet::from(signer)),
            }
        }
        let wallet = wallet.expect("at least 2 signers validated above");

        let nonce_manager = PendingNonceManager::default();
        let filler: InnerFiller = JoinFill::new(
            GasFiller,
            JoinFill::new(
                BlobGasFiller::default(),
                JoinFill::new(NonceFiller::new(nonce_manager.clone()), ChainIdFiller::default()),
            ),
        );
        let provider = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_http(rpc_url);

        let mut slots = Vec::with_capacity(addresses.len());
        for address in addresses {
            let balance = provider
                .get_balance(address)
                .await
                .map_err(|e| WalletPoolError::Rpc(e.to_string()))?;
            slots.push(WalletSlot {
                address,
                chain_id,
                balance: Mutex::new(balance),
                gas_cache: Mutex::new(None),
                last_refreshed_at: Mutex::new(Instant::now()),
            });
        }

        let max_outstanding = slots.len();
        Ok(WalletPool {
            chain_id,
            provider,
            nonce_manager,
            slots,
            gas_update_interval,
            gas_price_multiplier,
            max_outstanding: Mutex::new(max_outstanding),
        })
    }

    /// Number of signing lanes, `k`.
    pub fn k(&self) -> usize {
        self.slots.len()
    }

    /// Sets the maximum outstanding pending transactions per slot for the
    /// next selection round (default equals batch size).
    pub async fn set_max_outstanding(&self, max_outstanding: usize) {
        *self.max_outstanding.lock().await = max_outstanding.max(1);
    }

    /// Uniform-random selection among slots whose `pendingCount <
    /// maxOutstanding` and whose `balance >= amount + estimatedFee`.
    /// Returns the chosen address, or `None` if no slot qualifies.
    pub async fn select_wallet(&self, amount_wei: U256, estimated_fee_wei: U256, excluded: &[Address]) -> Option<Address> {
        use rand::seq::IteratorRandom;

        let max_outstanding = *self.max_outstanding.lock().await;
        let mut eligible = Vec::new();
        for slot in &self.slots {
            if excluded.contains(&slot.address) {
                continue;
            }
            let pending = self.nonce_manager.pending_count(slot.address).await;
            if pending as usize >= max_outstanding {
                continue;
            }
            let balance = *slot.balance.lock().await;
            if balance >= amount_wei.saturating_add(estimated_fee_wei) {
                eligible.push(slot.address);
            }
        }
        let mut rng = rand::rng();
        eligible.into_iter().choose(&mut rng)
    }

    /// Refreshes fee data at most once per `gasUpdateInterval`, preferring
    /// EIP-1559 fields over legacy `gasPrice`.
    pub async fn gas_fields(&self, address: Address) -> Result<GasCache, WalletPoolError> {
        let slot = self
            .slots
            .iter()
            .find(|s| s.address == address)
            .ok_or_else(|| WalletPoolError::Rpc(format!("unknown wallet slot {address}")))?;

        {
            let cache = slot.gas_cache.lock().await;
            let last_refreshed = *slot.last_refreshed_at.lock().await;
            if let Some(cached) = *cache {
                if last_refreshed.elapsed() < self.gas_update_interval {
                    return Ok(cached);
                }
            }
        }

        let fresh = match self.provider.estimate_eip1559_fees().await {
            Ok(estimation) => GasCache {
                max_fee_per_gas: Some(apply_multiplier(estimation.max_fee_per_gas, self.gas_price_multiplier)),
                max_priority_fee_per_gas: Some(apply_multiplier(
                    estimation.max_priority_fee_per_gas,
                    self.gas_price_multiplier,
                )),
                gas_price: None,
            },
            Err(_) => {
                let gas_price = self
                    .provider
                    .get_gas_price()
                    .await
                    .map_err(|e| WalletPoolError::Rpc(e.to_string()))?;
                GasCache {
                    max_fee_per_gas: None,
                    max_priority_fee_per_gas: None,
                    gas_price: Some(apply_multiplier(gas_price, self.gas_price_multiplier)),
                }
            }
        };

        *slot.gas_cache.lock().await = Some(fresh);
        *slot.last_refreshed_at.lock().await = Instant::now();
        Ok(fresh)
    }

    /// Lowest cached balance across all slots, used by the `/health` balance
    /// floor check.
    pub async fn min_balance(&self) -> U256 {
        let mut min = U256::MAX;
        for slot in &self.slots {
            let balance = *slot.balance.lock().await;
            if balance < min {
                min = balance;
            }
        }
        min
    }

    /// Per-slot balances, used by the `/metrics` endpoint's wallet balances
    /// field.
    pub async fn balances_wei(&self) -> Vec<(Address, U256)> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            out.push((slot.address, *slot.balance.lock().await));
        }
        out
    }

    /// Reconciles every slot's local nonce with `getTransactionCount(...,
    /// pending)`, and refreshes balances. Called after each batch.
    pub async fn refresh_all(&self) -> Result<(), RelayerError> {
        for slot in &self.slots {
            self.nonce_manager.refresh(&self.provider, slot.address).await?;
            let balance = self
                .provider
                .get_balance(slot.address)
                .await
                .map_err(|e| RelayerError::chain_transient(e.to_string()))?;
            *slot.balance.lock().await = balance;
            *slot.last_refreshed_at.lock().await = Instant::now();
        }
        Ok(())
    }
}

fn apply_multiplier(value: u128, multiplier: f64) -> u128 {
    ((value as f64) * multiplier).round() as u128
}

/// Parses a decimal, human-denominated native-token amount into wei.
pub fn amount_to_wei(amount: Decimal) -> Result<U256, RelayerError> {
    let wei_decimal = amount * Decimal::from_str("1000000000000000000").unwrap();
    let wei_str = wei_decimal
        .round()
        .to_string();
    U256::from_str(&wei_str).map_err(|e| RelayerError::validation(format!("amount out of range: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_to_wei_converts_human_decimal() {
        let amount = Decimal::from_str("0.01").unwrap();
        let wei = amount_to_wei(amount).unwrap();
        assert_eq!(wei, U256::from(10_000_000_000_000_000u128));
    }

    #[tokio::test]
    async fn pending_nonce_manager_tracks_pending_count_via_reset() {
        let manager = PendingNonceManager::default();
        let address = Address::ZERO;
        manager.bump_pending(address, 2).await;
        assert_eq!(manager.pending_count(address).await, 2);
        manager.reset_nonce(address).await;
        assert_eq!(manager.pending_count(address).await, 1);
        manager.mark_confirmed(address).await;
        assert_eq!(manager.pending_count(address).await, 0);
    }
}
