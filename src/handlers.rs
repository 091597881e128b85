//! HTTP surface exposed by the relayer: health/metrics/status for operators,
//! plus the front-end-initiated intent registration ingress that
//! feeds the same [`crate::batch::BatchQueue`] the Aleo listener does.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::batch::BatchQueueHandle;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::metrics::MetricsRegistry;
use crate::model::{ChainId, IntentRecord, validate_intent};
use crate::store::PersistentStore;
use crate::wallet::WalletPool;

/// Wallet balance floor below which `/health` reports `degraded`. Not a
/// recognized environment variable, so this is a fixed constant rather
/// than configuration surface; see DESIGN.md.
pub const BALANCE_FLOOR_WEI: u128 = 50_000_000_000_000_000; // 0.05 native token

/// Everything a handler needs, constructed once by the orchestrator and
/// shared behind an `Arc`. Every component here is an explicitly
/// constructed handle, never a singleton.
pub struct AppState {
    pub store: Arc<PersistentStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub wallet_pools: HashMap<ChainId, Arc<WalletPool>>,
    pub queues: HashMap<ChainId, BatchQueueHandle>,
    pub started_at: std::time::Instant,
    pub balance_floor_wei: U256,
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/status", get(get_status))
        .route("/api/intent/register", post(post_register_intent))
        .route("/api/transaction/{request_id}", get(get_transaction))
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A store read unreachable makes `/health` 503 ("unhealthy"); any other
/// read failure is treated as reachable-but-empty for this probe.
async fn store_reachable(store: &PersistentStore) -> bool {
    store.is_processed("__healthcheck__").is_ok()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime: u64,
}

/// `GET /health`: liveness. Degraded if the Aleo circuit breaker is Open or
/// any wallet's balance is below [`BALANCE_FLOOR_WEI`]; unhealthy if the
/// persistent store is unreachable.
async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();

    if !store_reachable(&state.store).await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "unhealthy", uptime }),
        )
            .into_response();
    }

    let breaker_open = matches!(state.breaker.state().await, CircuitState::Open);
    let mut balance_low = false;
    for pool in state.wallet_pools.values() {
        if pool.min_balance().await < state.balance_floor_wei {
            balance_low = true;
            break;
        }
    }

    let status = if breaker_open || balance_low { "degraded" } else { "healthy" };
    (StatusCode::OK, Json(HealthResponse { status, uptime })).into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChainMetricsResponse {
    chain_id: ChainId,
    queue_depth: u64,
    sent: u64,
    confirmed: u64,
    failed: u64,
    duplicates_skipped: u64,
    execution_rate: f64,
    wallet_count: usize,
    /// `T = min(arrival rate λ, k·μ)`.
    throughput_estimate: f64,
    /// `λ < k·μ`.
    stable: bool,
    wallet_balances_wei: Vec<String>,
    dlq_size: u64,
}

/// `GET /metrics`: queue depth, execution rate, wallet count, throughput
/// estimate, stability flag, wallet balances and DLQ size, per chain.
async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut chains = Vec::with_capacity(ChainId::ALL.len());
    for chain_id in ChainId::ALL {
        let snapshot = state.metrics.snapshot(chain_id);
        let wallet_balances_wei = match state.wallet_pools.get(&chain_id) {
            Some(pool) => pool
                .balances_wei()
                .await
                .into_iter()
                .map(|(_, bal)| bal.to_string())
                .collect(),
            None => Vec::new(),
        };
        chains.push(ChainMetricsResponse {
            chain_id,
            queue_depth: snapshot.queue_depth,
            sent: snapshot.sent,
            confirmed: snapshot.confirmed,
            failed: snapshot.failed,
            duplicates_skipped: snapshot.duplicates_skipped,
            execution_rate: snapshot.execution_rate,
            wallet_count: snapshot.wallet_count,
            throughput_estimate: snapshot.throughput_estimate,
            stable: snapshot.stable,
            wallet_balances_wei,
            dlq_size: snapshot.dlq_size,
        });
    }
    Json(chains)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    circuit_breaker_state: CircuitState,
    store_connected: bool,
    chains: Vec<ChainStatusEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChainStatusEntry {
    chain_id: ChainId,
    wallet_count: usize,
    queue_depth: u64,
    dlq_size: u64,
    wallet_addresses: Vec<Address>,
}

/// `GET /status`: aggregated system view, including circuit breaker state
/// and persistent store connectivity.
async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let circuit_breaker_state = state.breaker.state().await;
    let store_connected = store_reachable(&state.store).await;

    let mut chains = Vec::with_capacity(ChainId::ALL.len());
    for chain_id in ChainId::ALL {
        let snapshot = state.metrics.snapshot(chain_id);
        let wallet_addresses = match state.wallet_pools.get(&chain_id) {
            Some(pool) => pool.balances_wei().await.into_iter().map(|(addr, _)| addr).collect(),
            None => Vec::new(),
        };
        chains.push(ChainStatusEntry {
            chain_id,
            wallet_count: snapshot.wallet_count,
            queue_depth: snapshot.queue_depth,
            dlq_size: snapshot.dlq_size,
            wallet_addresses,
        });
    }

    Json(StatusResponse {
        circuit_breaker_state,
        store_connected,
        chains,
    })
}

/// Body of `POST /api/intent/register`, using the relayer's camelCase
/// convention.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterIntentRequest {
    pub tx_id: String,
    pub chain_id: u64,
    pub amount: String,
    pub recipient: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterIntentResponse {
    request_id: String,
}

/// `POST /api/intent/register`: front-end-initiated ingress, subject to the
/// identical validation and dedup semantics as the Aleo-sourced path.
/// `requestId` is the submitted `txId` — the same identity space the Aleo
/// listener uses for its `sourceTxId`-derived `requestId`.
async fn post_register_intent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterIntentRequest>,
) -> impl IntoResponse {
    if matches!(state.breaker.state().await, CircuitState::Open) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "circuit breaker open".to_string(),
            }),
        )
            .into_response();
    }

    let intent = match validate_intent(
        body.tx_id.clone(),
        body.tx_id.clone(),
        &body.chain_id.to_string(),
        &body.amount,
        &body.recipient,
        now_millis(),
    ) {
        Ok(intent) => intent,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: e.to_string() })).into_response();
        }
    };

    match state.store.is_processed(&intent.request_id) {
        Ok(true) => {
            return (
                StatusCode::CONFLICT,
                Json(RegisterIntentResponse {
                    request_id: intent.request_id,
                }),
            )
                .into_response();
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(error = %e, "register: persistent store unreachable");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "storage unavailable".to_string(),
                }),
            )
                .into_response();
        }
    }

    let record = IntentRecord::new_pending(&intent, now_millis());
    match state.store.mark_pending(record) {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::CONFLICT,
                Json(RegisterIntentResponse {
                    request_id: intent.request_id,
                }),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "register: failed to mark intent pending");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "storage unavailable".to_string(),
                }),
            )
                .into_response();
        }
    }

    match state.queues.get(&intent.chain_id) {
        Some(handle) => handle.add(intent.clone()),
        None => tracing::error!(chain_id = %intent.chain_id, "register: no batch queue for chain"),
    }

    (
        StatusCode::ACCEPTED,
        Json(RegisterIntentResponse {
            request_id: intent.request_id,
        }),
    )
        .into_response()
}

/// `GET /api/transaction/{requestId}`: return the persisted [`IntentRecord`]
/// or 404.
async fn get_transaction(State(state): State<Arc<AppState>>, Path(request_id): Path<String>) -> Response {
    match state.store.get_record(&request_id) {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "unknown requestId".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "transaction lookup: store error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "storage unavailable".to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_floor_is_a_sane_fraction_of_a_native_token() {
        assert!(BALANCE_FLOOR_WEI < 1_000_000_000_000_000_000);
        assert!(BALANCE_FLOOR_WEI > 0);
    }
}
