//! Core data types shared across components: [`ChainId`], [`TransferIntent`],
//! [`IntentRecord`], [`IntentStatus`] and [`Batch`].

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A supported EVM settlement chain, identified by its canonical chain id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Sepolia,
    Amoy,
}

impl ChainId {
    pub const ALL: [ChainId; 2] = [ChainId::Sepolia, ChainId::Amoy];

    /// The canonical EIP-155 chain id.
    pub const fn evm_chain_id(self) -> u64 {
        match self {
            ChainId::Sepolia => 11_155_111,
            ChainId::Amoy => 80_002,
        }
    }

    /// Maps an Aleo-side chain code to an EVM chain via the fixed table
    /// `{1 -> Sepolia, 2 -> Amoy}`.
    pub fn from_aleo_chain_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ChainId::Sepolia),
            2 => Some(ChainId::Amoy),
            _ => None,
        }
    }

    pub fn from_evm_chain_id(chain_id: u64) -> Option<Self> {
        ChainId::ALL.into_iter().find(|c| c.evm_chain_id() == chain_id)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainId::Sepolia => write!(f, "sepolia"),
            ChainId::Amoy => write!(f, "amoy"),
        }
    }
}

impl FromStr for ChainId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sepolia" | "11155111" => Ok(ChainId::Sepolia),
            "amoy" | "polygon-amoy" | "80002" => Ok(ChainId::Amoy),
            other => Err(format!("unknown chain id: {other}")),
        }
    }
}

/// The unit of work flowing from the Aleo listener (or the HTTP registration
/// endpoint) into a chain's batch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferIntent {
    pub request_id: String,
    pub source_tx_id: String,
    pub chain_id: ChainId,
    /// Human-denominated decimal amount, e.g. `"0.01"`.
    pub amount: Decimal,
    /// 20-byte recipient address, `0x`-prefixed, lowercase-normalized.
    pub recipient: String,
    pub created_at: i64,
    pub retry_count: u32,
}

/// Settlement status of a [`TransferIntent`] as it moves through the relayer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    InFlight,
    Confirmed,
    Failed,
    PermanentlyFailed,
}

impl IntentStatus {
    /// Whether `self -> next` is a legal transition in the status state machine.
    pub fn can_transition_to(self, next: IntentStatus) -> bool {
        use IntentStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (InFlight, Confirmed)
                | (InFlight, Failed)
                | (Failed, InFlight)
                | (Failed, PermanentlyFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IntentStatus::Confirmed | IntentStatus::PermanentlyFailed)
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntentStatus::Pending => "pending",
            IntentStatus::InFlight => "in_flight",
            IntentStatus::Confirmed => "confirmed",
            IntentStatus::Failed => "failed",
            IntentStatus::PermanentlyFailed => "permanently_failed",
        };
        write!(f, "{s}")
    }
}

/// Persisted record backing [`crate::store::PersistentStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentRecord {
    pub request_id: String,
    pub status: IntentStatus,
    pub aleo_tx_id: String,
    pub evm_tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub error_message: Option<String>,
    pub first_seen_at: i64,
    pub last_updated_at: i64,
}

impl IntentRecord {
    pub fn new_pending(intent: &TransferIntent, now: i64) -> Self {
        IntentRecord {
            request_id: intent.request_id.clone(),
            status: IntentStatus::Pending,
            aleo_tx_id: intent.source_tx_id.clone(),
            evm_tx_hash: None,
            block_number: None,
            error_message: None,
            first_seen_at: now,
            last_updated_at: now,
        }
    }
}

/// A closed, immutable group of intents destined for one chain's executor.
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: u64,
    pub chain_id: ChainId,
    pub intents: Vec<TransferIntent>,
    pub opened_at: i64,
}

impl Batch {
    /// Invariant: all intents in a batch share `chain_id`.
    pub fn invariant_holds(&self) -> bool {
        self.intents.iter().all(|i| i.chain_id == self.chain_id)
    }
}

/// Validates a raw intent at ingress (HTTP registration or listener
/// extraction). On success returns a [`TransferIntent`] ready to enqueue.
pub fn validate_intent(
    request_id: String,
    source_tx_id: String,
    chain_id_raw: &str,
    amount_raw: &str,
    recipient_raw: &str,
    now: i64,
) -> Result<TransferIntent, crate::errors::RelayerError> {
    use crate::errors::RelayerError;

    if request_id.trim().is_empty() {
        return Err(RelayerError::validation("missing requestId"));
    }
    let chain_id = chain_id_raw
        .parse::<ChainId>()
        .map_err(|_| RelayerError::validation(format!("unknown chainId: {chain_id_raw}")))?;

    if amount_raw.trim().is_empty() {
        return Err(RelayerError::validation("missing amount"));
    }
    let amount: Decimal = amount_raw
        .parse()
        .map_err(|_| RelayerError::validation(format!("amount is not numeric: {amount_raw}")))?;
    if amount <= Decimal::ZERO {
        return Err(RelayerError::validation("amount must be positive"));
    }

    let recipient = validate_recipient(recipient_raw)?;

    Ok(TransferIntent {
        request_id,
        source_tx_id,
        chain_id,
        amount,
        recipient,
        created_at: now,
        retry_count: 0,
    })
}

/// Validates a `0x`-prefixed 40-hex-digit EVM address, returning it
/// lowercase-normalized.
pub fn validate_recipient(raw: &str) -> Result<String, crate::errors::RelayerError> {
    use crate::errors::RelayerError;

    if !raw.starts_with("0x") || raw.len() != 42 {
        return Err(RelayerError::validation(format!(
            "recipient must be a 0x-prefixed 20-byte address: {raw}"
        )));
    }
    if !raw[2..].chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(RelayerError::validation(format!(
            "recipient is not valid hex: {raw}"
        )));
    }
    Ok(raw.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_code_mapping() {
        assert_eq!(ChainId::from_aleo_chain_code(1), Some(ChainId::Sepolia));
        assert_eq!(ChainId::from_aleo_chain_code(2), Some(ChainId::Amoy));
        assert_eq!(ChainId::from_aleo_chain_code(3), None);
    }

    #[test]
    fn evm_chain_ids_match_spec() {
        assert_eq!(ChainId::Sepolia.evm_chain_id(), 11_155_111);
        assert_eq!(ChainId::Amoy.evm_chain_id(), 80_002);
    }

    #[test]
    fn status_transition_table() {
        use IntentStatus::*;
        assert!(Pending.can_transition_to(InFlight));
        assert!(InFlight.can_transition_to(Confirmed));
        assert!(InFlight.can_transition_to(Failed));
        assert!(Failed.can_transition_to(InFlight));
        assert!(Failed.can_transition_to(PermanentlyFailed));
        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(InFlight));
        assert!(!PermanentlyFailed.can_transition_to(InFlight));
    }

    #[test]
    fn validate_intent_rejects_bad_inputs() {
        assert!(validate_intent("".into(), "tx1".into(), "sepolia", "0.01", "0xabcdef0123456789abcdef0123456789abcdef01", 0).is_err());
        assert!(validate_intent("r1".into(), "tx1".into(), "bogus", "0.01", "0xabcdef0123456789abcdef0123456789abcdef01", 0).is_err());
        assert!(validate_intent("r1".into(), "tx1".into(), "sepolia", "", "0xabcdef0123456789abcdef0123456789abcdef01", 0).is_err());
        assert!(validate_intent("r1".into(), "tx1".into(), "sepolia", "0", "0xabcdef0123456789abcdef0123456789abcdef01", 0).is_err());
        assert!(validate_intent("r1".into(), "tx1".into(), "sepolia", "-1", "0xabcdef0123456789abcdef0123456789abcdef01", 0).is_err());
        assert!(validate_intent("r1".into(), "tx1".into(), "sepolia", "notanumber", "0xabcdef0123456789abcdef0123456789abcdef01", 0).is_err());
        assert!(validate_intent("r1".into(), "tx1".into(), "sepolia", "0.01", "0xshort", 0).is_err());
        assert!(validate_intent("r1".into(), "tx1".into(), "sepolia", "0.01", "deadbeef0123456789abcdef0123456789abcdef01", 0).is_err());
    }

    #[test]
    fn validate_intent_accepts_happy_path() {
        let intent = validate_intent(
            "r1".into(),
            "tx1".into(),
            "sepolia",
            "0.01",
            "0xABCDEF0123456789abcdef0123456789ABCDEF01",
            42,
        )
        .unwrap();
        assert_eq!(intent.chain_id, ChainId::Sepolia);
        assert_eq!(intent.recipient, "0xabcdef0123456789abcdef0123456789abcdef01");
    }
}
