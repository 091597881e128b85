//! Polls the Aleo chain for transfer-intent transitions, dedups them, and
//! emits validated [`TransferIntent`]s onto the matching chain's batch
//! queue. `AleoClient` mirrors the relayer's EVM-side endpoint-fallback
//! transport shape (`FallbackLayer` over multiple RPC transports in
//! `x402-chain-eip155/src/chain/provider.rs::rpc_client`), hand-rolled here
//! since Aleo's REST API is plain JSON/HTTP rather than JSON-RPC.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::batch::BatchQueueHandle;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::AleoConfig;
use crate::errors::RelayerError;
use crate::metrics::MetricsRegistry;
use crate::model::{ChainId, IntentRecord, TransferIntent, validate_intent};
use crate::rate_limiter::RateLimiter;
use crate::store::PersistentStore;

/// Function name on `ALEO_PROGRAM_ID` that creates a transfer intent. Not
/// pinned down by any surviving source file; chosen to match the shape of
/// the program's public interface (see DESIGN.md's Open-Questions note).
const INTENT_FUNCTION_NAME: &str = "create_transfer_intent";
const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const RECENT_ID_CACHE_SIZE: usize = 4096;
/// Amounts above this are treated as wei-denominated.
const WEI_THRESHOLD: u128 = 1_000_000_000_000_000;

static U64_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)u64$").unwrap());
static U8_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)u8$").unwrap());
static ADDRESS_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum AleoClientError {
    #[error("all aleo endpoints failed: {0}")]
    AllEndpointsFailed(String),
    #[error("unexpected response shape for {0}")]
    UnexpectedShape(String),
}

impl From<AleoClientError> for RelayerError {
    fn from(e: AleoClientError) -> Self {
        RelayerError::UpstreamUnavailable(e.to_string())
    }
}

/// Thin REST client over an ordered list of base URLs, falling over to the
/// next one on error. On any single-call error the next base URL is tried;
/// failure of all of them surfaces as one [`AleoClientError`], so the caller
/// (wrapped in [`CircuitBreaker::execute`]) counts it as a single failure.
pub struct AleoClient {
    http: Client,
    base_urls: Vec<Url>,
}

impl AleoClient {
    pub fn new(base_urls: Vec<Url>) -> Self {
        let http = Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .expect("reqwest client builds with a fixed timeout");
        AleoClient { http, base_urls }
    }

    async fn get_json(&self, path: &str) -> Result<Value, AleoClientError> {
        let mut last_err = String::from("no base URLs configured");
        for base in &self.base_urls {
            let url = match base.join(path) {
                Ok(u) => u,
                Err(e) => {
                    last_err = e.to_string();
                    continue;
                }
            };
            match self.http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                    Ok(body) => return Ok(body),
                    Err(e) => last_err = e.to_string(),
                },
                Ok(resp) => last_err = format!("http {}", resp.status()),
                Err(e) => last_err = e.to_string(),
            }
        }
        Err(AleoClientError::AllEndpointsFailed(last_err))
    }

    /// `GET /block/height/latest` — tolerates both a bare integer and
    /// `{"height": N}`.
    pub async fn latest_block_height(&self) -> Result<u64, AleoClientError> {
        let body = self.get_json("block/height/latest").await?;
        parse_height(&body).ok_or_else(|| AleoClientError::UnexpectedShape("block/height/latest".into()))
    }

    /// `GET /block/{height}/transactions` — tolerates `{"transactions": [...]}`
    /// and a bare array.
    pub async fn block_transactions(&self, height: u64) -> Result<Vec<Value>, AleoClientError> {
        let body = self.get_json(&format!("block/{height}/transactions")).await?;
        extract_transaction_list(&body).ok_or_else(|| {
            AleoClientError::UnexpectedShape(format!("block/{height}/transactions"))
        })
    }

    /// `GET /transaction/{id}` — used by the startup recovery sweep to
    /// re-derive an orphaned intent's details from the chain rather than the
    /// persistent store, which only retains `IntentRecord`'s terse fields.
    pub async fn get_transaction(&self, id: &str) -> Result<Value, AleoClientError> {
        self.get_json(&format!("transaction/{id}")).await
    }
}

fn parse_height(body: &Value) -> Option<u64> {
    match body {
        Value::Number(n) => n.as_u64(),
        Value::Object(map) => map.get("height").and_then(Value::as_u64),
        _ => None,
    }
}

fn extract_transaction_list(body: &Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(items) => Some(items.clone()),
        Value::Object(map) => match map.get("transactions") {
            Some(Value::Array(items)) => Some(items.clone()),
            _ => None,
        },
        _ => None,
    }
}

/// Recursively locates every object in `value` that looks like a transition
/// (carries a program + function name pair) matching `program_id` and
/// [`INTENT_FUNCTION_NAME`]. Tolerant of the v1/v2 key-naming differences
/// between explorer API versions.
fn find_matching_transitions<'a>(value: &'a Value, program_id: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    walk_for_transitions(value, program_id, &mut out);
    out
}

fn walk_for_transitions<'a>(value: &'a Value, program_id: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            let program_matches = map
                .get("program_id")
                .or_else(|| map.get("program"))
                .and_then(Value::as_str)
                .map(|p| p == program_id)
                .unwrap_or(false);
            let function_matches = map
                .get("function_name")
                .or_else(|| map.get("function"))
                .and_then(Value::as_str)
                .map(|f| f == INTENT_FUNCTION_NAME)
                .unwrap_or(false);
            if program_matches && function_matches {
                out.push(value);
            }
            for v in map.values() {
                walk_for_transitions(v, program_id, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                walk_for_transitions(v, program_id, out);
            }
        }
        _ => {}
    }
}

/// Flattens every string leaf under a transition's `inputs`/`outputs` into a
/// flat list, from which the three typed literals are picked out by regex.
fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// The three typed literals scanned out of a transition's inputs/outputs:
/// `(amount_smallest_units, chain_code, evm_address)`.
fn extract_literals(transition: &Value) -> Option<(u128, u8, String)> {
    let mut strings = Vec::new();
    if let Some(inputs) = transition.get("inputs") {
        collect_strings(inputs, &mut strings);
    }
    if let Some(outputs) = transition.get("outputs") {
        collect_strings(outputs, &mut strings);
    }

    let mut amount = None;
    let mut chain_code = None;
    let mut address = None;
    for s in &strings {
        if amount.is_none() {
            if let Some(caps) = U64_LITERAL.captures(s) {
                amount = caps[1].parse::<u128>().ok();
                continue;
            }
        }
        if chain_code.is_none() {
            if let Some(caps) = U8_LITERAL.captures(s) {
                chain_code = caps[1].parse::<u8>().ok();
                continue;
            }
        }
        if address.is_none() && ADDRESS_LITERAL.is_match(s) {
            address = Some(s.clone());
        }
    }
    match (amount, chain_code, address) {
        (Some(a), Some(c), Some(addr)) => Some((a, c, addr)),
        _ => None,
    }
}

/// Integers above [`WEI_THRESHOLD`] are treated as wei-denominated and
/// divided down to an 18-decimal human amount; smaller ones are treated as
/// already human-denominated.
fn normalize_amount(raw: u128) -> Decimal {
    if raw > WEI_THRESHOLD {
        Decimal::from_i128_with_scale(raw as i128, 18)
    } else {
        Decimal::from(raw)
    }
}

/// Scans `tx` for a transition matching `expected_program_id` +
/// [`INTENT_FUNCTION_NAME`], and validates the resulting
/// [`TransferIntent`] through the same [`validate_intent`] gate the HTTP
/// registration endpoint uses. `request_id` is the caller-supplied
/// `sourceTxId` (or a `blockHeight:index` fallback). Returns `None`
/// (logging a warning) on any malformed or unrecognized transition —
/// extraction is never fatal to the polling loop.
pub fn extract_intent_from_transaction(
    tx: &Value,
    expected_program_id: &str,
    request_id: &str,
    now: i64,
) -> Option<TransferIntent> {
    for transition in find_matching_transitions(tx, expected_program_id) {
        let Some((raw_amount, chain_code, address)) = extract_literals(transition) else {
            continue;
        };
        let Some(chain_id) = ChainId::from_aleo_chain_code(chain_code) else {
            tracing::warn!(chain_code, request_id, "dropping intent: unknown aleo chain code");
            continue;
        };
        let amount = normalize_amount(raw_amount);
        match validate_intent(
            request_id.to_string(),
            request_id.to_string(),
            &chain_id.to_string(),
            &amount.to_string(),
            &address,
            now,
        ) {
            Ok(intent) => return Some(intent),
            Err(e) => {
                tracing::warn!(request_id, error = %e, "dropping malformed aleo intent");
                continue;
            }
        }
    }
    None
}

/// Long-running poller that turns Aleo blocks into deduplicated
/// [`TransferIntent`]s. One instance per process; the Aleo chain has no
/// per-target-chain split, unlike the EVM side.
pub struct AleoListener {
    client: AleoClient,
    config: AleoConfig,
    rate_limiter: RateLimiter,
    breaker: Arc<CircuitBreaker>,
    store: Arc<PersistentStore>,
    metrics: Arc<MetricsRegistry>,
    queues: HashMap<ChainId, BatchQueueHandle>,
    recent_ids: Mutex<LruCache<String, ()>>,
    cancellation: CancellationToken,
}

impl AleoListener {
    /// `breaker` is constructed and owned by the orchestrator so
    /// [`crate::handlers`] can read its state for the `/health` and
    /// `/status` endpoints without reaching into the listener.
    pub fn new(
        config: AleoConfig,
        breaker: Arc<CircuitBreaker>,
        store: Arc<PersistentStore>,
        metrics: Arc<MetricsRegistry>,
        queues: HashMap<ChainId, BatchQueueHandle>,
        cancellation: CancellationToken,
    ) -> Self {
        let client = AleoClient::new(config.base_urls.clone());
        let rate_limiter = RateLimiter::new(config.rate_limit_rps, config.rate_limit_rpm);
        AleoListener {
            client,
            config,
            rate_limiter,
            breaker,
            store,
            metrics,
            queues,
            recent_ids: Mutex::new(LruCache::new(
                NonZeroUsize::new(RECENT_ID_CACHE_SIZE).expect("nonzero cache size"),
            )),
            cancellation,
        }
    }

    /// `Start(sink)`: the long-running poll loop. `lastHeight` is
    /// initialized from `getLatestBlockHeight()` so historical blocks are
    /// not replayed — the startup recovery sweep handles orphaned
    /// `pending`/`in_flight` records separately. `Stop()` is cooperative:
    /// cancellation is checked between polls and between blocks.
    pub async fn run(&self) {
        let mut last_height = match self.get_latest_height_guarded().await {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(error = %e, "aleo listener: failed to determine starting block height");
                return;
            }
        };
        tracing::info!(last_height, "aleo listener starting");

        loop {
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if self.cancellation.is_cancelled() {
                break;
            }

            let height_now = match self.get_latest_height_guarded().await {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(error = %e, "aleo listener: failed to poll latest block height");
                    continue;
                }
            };
            if height_now <= last_height {
                continue;
            }

            for height in (last_height + 1)..=height_now {
                if self.cancellation.is_cancelled() {
                    break;
                }
                if let Err(e) = self.process_block(height).await {
                    tracing::warn!(height, error = %e, "aleo listener: failed processing block");
                }
            }
            last_height = height_now;
        }
        tracing::info!("aleo listener stopped");
    }

    async fn get_latest_height_guarded(&self) -> Result<u64, RelayerError> {
        self.rate_limiter.acquire(&self.cancellation).await?;
        let client = &self.client;
        self.breaker
            .execute(|| async move { client.latest_block_height().await.map_err(RelayerError::from) })
            .await
    }

    async fn get_block_transactions_guarded(&self, height: u64) -> Result<Vec<Value>, RelayerError> {
        self.rate_limiter.acquire(&self.cancellation).await?;
        let client = &self.client;
        self.breaker
            .execute(|| async move { client.block_transactions(height).await.map_err(RelayerError::from) })
            .await
    }

    async fn process_block(&self, height: u64) -> Result<(), RelayerError> {
        let transactions = self.get_block_transactions_guarded(height).await?;
        for (index, tx) in transactions.iter().enumerate() {
            let request_id = tx
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{height}:{index}"));
            if let Some(intent) =
                extract_intent_from_transaction(tx, &self.config.program_id, &request_id, now_millis())
            {
                self.handle_intent(intent).await;
            }
        }
        Ok(())
    }

    /// Dedup: checks the in-memory LRU first, then the persistent store;
    /// `markPending` commits before the intent is handed to its chain's
    /// `BatchQueue`, honoring the store's durability contract.
    async fn handle_intent(&self, intent: TransferIntent) {
        if self.recent_ids.lock().await.contains(&intent.request_id) {
            self.metrics.record_duplicate_skipped(intent.chain_id);
            return;
        }

        match self.store.is_processed(&intent.request_id) {
            Ok(true) => {
                self.metrics.record_duplicate_skipped(intent.chain_id);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = %e, "aleo listener: persistent store unreachable during dedup");
                return;
            }
        }

        let record = IntentRecord::new_pending(&intent, now_millis());
        match self.store.mark_pending(record) {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.record_duplicate_skipped(intent.chain_id);
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "aleo listener: failed to mark intent pending");
                return;
            }
        }

        self.recent_ids.lock().await.put(intent.request_id.clone(), ());

        match self.queues.get(&intent.chain_id) {
            Some(handle) => handle.add(intent),
            None => tracing::error!(chain_id = %intent.chain_id, "aleo listener: no batch queue for chain"),
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_amount_treats_large_integers_as_wei() {
        let amount = normalize_amount(10_000_000_000_000_000u128);
        assert_eq!(amount.to_string(), "0.01");
    }

    #[test]
    fn normalize_amount_treats_small_integers_as_human() {
        let amount = normalize_amount(42u128);
        assert_eq!(amount.to_string(), "42");
    }

    #[test]
    fn extract_literals_picks_typed_fields_regardless_of_order() {
        let transition = json!({
            "program_id": "privacy_box_mvp.aleo",
            "function_name": "create_transfer_intent",
            "inputs": [
                {"type": "public", "value": "1u8"},
                {"type": "public", "value": "0xABCDEF0123456789abcdef0123456789ABCDEF01"},
            ],
            "outputs": [
                {"type": "public", "value": "10000000000000000u64"},
            ],
        });
        let (amount, chain_code, address) = extract_literals(&transition).unwrap();
        assert_eq!(amount, 10_000_000_000_000_000u128);
        assert_eq!(chain_code, 1u8);
        assert_eq!(address, "0xABCDEF0123456789abcdef0123456789ABCDEF01");
    }

    #[test]
    fn find_matching_transitions_ignores_other_programs_and_functions() {
        let tx = json!({
            "id": "tx1",
            "execution": {
                "transitions": [
                    {"program_id": "other.aleo", "function_name": "create_transfer_intent", "inputs": []},
                    {"program_id": "privacy_box_mvp.aleo", "function_name": "noop", "inputs": []},
                    {"program_id": "privacy_box_mvp.aleo", "function_name": "create_transfer_intent", "inputs": []},
                ]
            }
        });
        let matches = find_matching_transitions(&tx, "privacy_box_mvp.aleo");
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn extract_intent_from_transaction_end_to_end() {
        let tx = json!({
            "id": "tx-happy",
            "execution": {
                "transitions": [
                    {
                        "program_id": "privacy_box_mvp.aleo",
                        "function_name": "create_transfer_intent",
                        "inputs": [
                            {"value": "10000000000000000u64"},
                            {"value": "1u8"},
                            {"value": "0xABCDEF0123456789abcdef0123456789ABCDEF01"},
                        ],
                        "outputs": [],
                    }
                ]
            }
        });
        let intent = extract_intent_from_transaction(&tx, "privacy_box_mvp.aleo", "tx-happy", 0).unwrap();
        assert_eq!(intent.chain_id, ChainId::Sepolia);
        assert_eq!(intent.amount.to_string(), "0.01");
        assert_eq!(intent.recipient, "0xabcdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn extract_intent_drops_unknown_chain_code() {
        let tx = json!({
            "id": "tx-bad-chain",
            "transitions": [
                {
                    "program_id": "privacy_box_mvp.aleo",
                    "function_name": "create_transfer_intent",
                    "inputs": [
                        {"value": "10000000000000000u64"},
                        {"value": "9u8"},
                        {"value": "0xABCDEF0123456789abcdef0123456789ABCDEF01"},
                    ],
                }
            ]
        });
        assert!(extract_intent_from_transaction(&tx, "privacy_box_mvp.aleo", "tx-bad-chain", 0).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_intent_deduplicates_against_store() {
        let store = Arc::new(
            PersistentStore::open(&std::env::temp_dir().join(format!("listener-test-{}", rand_suffix())))
                .unwrap(),
        );
        let metrics = Arc::new(MetricsRegistry::new());
        let cancellation = CancellationToken::new();
        let (queue, _receivers) =
            crate::batch::BatchQueue::spawn(5, Duration::from_secs(10), metrics.clone(), cancellation.clone());
        let mut queues = HashMap::new();
        queues.insert(ChainId::Sepolia, queue.handle(ChainId::Sepolia));

        let config = AleoConfig {
            base_urls: vec![Url::parse("https://example.invalid/").unwrap()],
            program_id: "privacy_box_mvp.aleo".to_string(),
            poll_interval: Duration::from_secs(10),
            rate_limit_rps: 5,
            rate_limit_rpm: 100,
        };
        let breaker = Arc::new(CircuitBreaker::with_defaults());
        let listener = AleoListener::new(config, breaker, store.clone(), metrics.clone(), queues, cancellation.clone());

        let intent = validate_intent(
            "dup-1".into(),
            "dup-1".into(),
            "sepolia",
            "0.01",
            "0xabcdef0123456789abcdef0123456789abcdef01",
            0,
        )
        .unwrap();

        listener.handle_intent(intent.clone()).await;
        assert!(store.is_processed("dup-1").unwrap());

        listener.handle_intent(intent).await;
        assert_eq!(metrics.snapshot(ChainId::Sepolia).duplicates_skipped, 1);
        cancellation.cancel();
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }
}
