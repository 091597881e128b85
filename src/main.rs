//! Aleo-to-EVM relayer entrypoint.
//!
//! This binary wires together the persistent store, per-chain wallet pools,
//! batch queues, executor/scheduler pairs, the Aleo listener, the dead-letter
//! queue, and the operator HTTP surface.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `ALEO_RPC`, `ALEO_PROGRAM_ID`, `SEPOLIA_RPC`, `POLYGON_AMOY_RPC`,
//!   `RELAYER_PK`/`RELAYER_PK_2`/..., `HEALTH_PORT` and the rest of the
//!   variable list control behavior; see `config.rs`.
//! - `OTEL_*` variables enable tracing export.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use aleo_evm_relayer::batch::BatchQueue;
use aleo_evm_relayer::circuit_breaker::CircuitBreaker;
use aleo_evm_relayer::config::Config;
use aleo_evm_relayer::dlq;
use aleo_evm_relayer::handlers::{self, AppState, BALANCE_FLOOR_WEI};
use aleo_evm_relayer::listener::{AleoClient, AleoListener, extract_intent_from_transaction};
use aleo_evm_relayer::metrics::MetricsRegistry;
use aleo_evm_relayer::model::{ChainId, IntentStatus};
use aleo_evm_relayer::sig_down::SigDown;
use aleo_evm_relayer::store::{PersistentStore, StatusUpdate};
use aleo_evm_relayer::telemetry::Telemetry;
use aleo_evm_relayer::wallet::WalletPool;

const RECOVERY_SWEEP_LIMIT: usize = 10_000;
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(30);
/// Overall grace period for the listener/scheduler/DLQ workers to drain
/// after cancellation.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// `/health`'s in-flight request drain window.
const HTTP_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Re-derives orphaned `pending`/`in_flight` intents from the Aleo chain and
/// re-enqueues them, since `IntentRecord` itself only retains terse fields
/// and cannot reconstruct a full `TransferIntent` on its own. Records that
/// can no longer be re-derived (e.g. the source
/// transaction has since been pruned from every configured endpoint) are
/// logged and left as-is for manual inspection, rather than silently
/// dropped or fabricated.
async fn recover_orphaned_intents(
    store: &PersistentStore,
    aleo_client: &AleoClient,
    program_id: &str,
    batch_queue: &BatchQueue,
    dlq: &dlq::DeadLetterQueueHandle,
) {
    let pending = store.list_by_status(IntentStatus::Pending, RECOVERY_SWEEP_LIMIT).unwrap_or_default();
    let in_flight = store.list_by_status(IntentStatus::InFlight, RECOVERY_SWEEP_LIMIT).unwrap_or_default();
    let total = pending.len() + in_flight.len();
    if total > 0 {
        tracing::info!(pending = pending.len(), in_flight = in_flight.len(), "recovering orphaned intents");
    }

    for record in pending {
        let tx = match aleo_client.get_transaction(&record.aleo_tx_id).await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(request_id = %record.request_id, error = %e, "recovery: could not re-fetch source transaction");
                continue;
            }
        };
        match extract_intent_from_transaction(&tx, program_id, &record.request_id, now_millis()) {
            Some(intent) => batch_queue.handle(intent.chain_id).add(intent),
            None => tracing::warn!(request_id = %record.request_id, "recovery: could not re-derive intent from chain"),
        }
    }

    for record in in_flight {
        let tx = match aleo_client.get_transaction(&record.aleo_tx_id).await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(request_id = %record.request_id, error = %e, "recovery: could not re-fetch source transaction");
                continue;
            }
        };
        let Some(intent) = extract_intent_from_transaction(&tx, program_id, &record.request_id, now_millis()) else {
            tracing::warn!(request_id = %record.request_id, "recovery: could not re-derive intent from chain");
            continue;
        };
        // The previous attempt's outcome is unknown; treat it as failed and
        // let the normal failed -> in_flight retry path (via the DLQ) pick
        // it back up, rather than re-broadcasting blind.
        let _ = store.update_status(
            &record.request_id,
            IntentStatus::Failed,
            StatusUpdate {
                error_message: Some("in flight at restart, requeued".to_string()),
                ..Default::default()
            },
            now_millis(),
        );
        dlq.enqueue(intent).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let telemetry = Telemetry::new();
    let config = Config::load()?;

    let sig_down = SigDown::try_new()?;
    let cancellation = sig_down.cancellation_token();

    // The listener gets its own cancellation child, mirroring how the HTTP
    // surface gets `http_shutdown` below: it needs to stop on its own
    // schedule (first) rather than in lockstep with the batch workers, DLQ,
    // and schedulers, which must stay alive until `flush_all()` has reached
    // them. `worker_cancel` is deliberately independent of `cancellation`
    // rather than a child of it, since it is cancelled explicitly after the
    // flush rather than the instant the shutdown signal arrives.
    let listener_cancel = cancellation.child_token();
    let worker_cancel = tokio_util::sync::CancellationToken::new();

    let store = Arc::new(PersistentStore::open(&config.db_path)?);
    let metrics = Arc::new(MetricsRegistry::new());

    let (batch_queue, mut batch_receivers) =
        BatchQueue::spawn(config.max_batch_size, config.max_batch_wait, metrics.clone(), worker_cancel.clone());

    let mut queues: HashMap<ChainId, aleo_evm_relayer::batch::BatchQueueHandle> = HashMap::new();
    for chain_id in ChainId::ALL {
        queues.insert(chain_id, batch_queue.handle(chain_id));
    }

    let breaker = Arc::new(CircuitBreaker::with_defaults());

    let dlq = dlq::spawn(store.clone(), config.retry_delay, config.max_retries, queues.clone(), worker_cancel.clone());

    let mut wallet_pools: HashMap<ChainId, Arc<WalletPool>> = HashMap::new();
    for evm_chain in &config.evm_chains {
        let pool = WalletPool::connect(
            evm_chain.chain_id,
            evm_chain.rpc_url.clone(),
            &config.signer_keys,
            Duration::from_secs(60),
            config.gas_price_multiplier,
        )
        .await?;
        metrics.set_wallet_count(evm_chain.chain_id, pool.k());
        wallet_pools.insert(evm_chain.chain_id, Arc::new(pool));
    }

    let recovery_client = AleoClient::new(config.aleo.base_urls.clone());
    recover_orphaned_intents(&store, &recovery_client, &config.aleo.program_id, &batch_queue, &dlq).await;

    let mut worker_handles = Vec::new();
    for evm_chain in &config.evm_chains {
        let chain_id = evm_chain.chain_id;
        let wallet_pool = wallet_pools[&chain_id].clone();
        let executor = Arc::new(aleo_evm_relayer::executor::EvmExecutor::new(chain_id, wallet_pool, metrics.clone()));
        let batch_rx = batch_receivers
            .remove(&chain_id)
            .expect("one batch receiver per supported chain");
        let requeue = batch_queue.handle(chain_id);
        let scheduler_handle = tokio::spawn(aleo_evm_relayer::scheduler::run_chain_scheduler(
            batch_rx,
            executor,
            store.clone(),
            dlq.clone(),
            requeue,
            worker_cancel.clone(),
        ));
        worker_handles.push(scheduler_handle);
    }

    let listener = AleoListener::new(
        config.aleo.clone(),
        breaker.clone(),
        store.clone(),
        metrics.clone(),
        queues.clone(),
        listener_cancel.clone(),
    );
    let listener_handle = tokio::spawn(async move { listener.run().await });

    {
        let metrics = metrics.clone();
        let dlq = dlq.clone();
        let cancellation = cancellation.clone();
        worker_handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => break,
                    _ = tokio::time::sleep(METRICS_LOG_INTERVAL) => {}
                }
                for chain_id in ChainId::ALL {
                    metrics.set_dlq_size(chain_id, dlq.len_for_chain(chain_id).await as u64);
                    let snapshot = metrics.snapshot(chain_id);
                    tracing::info!(
                        chain_id = %chain_id,
                        queue_depth = snapshot.queue_depth,
                        sent = snapshot.sent,
                        confirmed = snapshot.confirmed,
                        failed = snapshot.failed,
                        execution_rate = snapshot.execution_rate,
                        throughput_estimate = snapshot.throughput_estimate,
                        stable = snapshot.stable,
                        dlq_size = snapshot.dlq_size,
                        "relayer metrics"
                    );
                }
            }
        }));
    }

    let app_state = Arc::new(AppState {
        store: store.clone(),
        metrics: metrics.clone(),
        breaker: breaker.clone(),
        wallet_pools: wallet_pools.clone(),
        queues: queues.clone(),
        started_at: std::time::Instant::now(),
        balance_floor_wei: U256::from(BALANCE_FLOOR_WEI),
    });

    let http_endpoints = Router::new()
        .merge(handlers::routes(app_state))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.health_host, config.health_port);
    tracing::info!("starting health/metrics server at http://{}", addr);
    let tcp_listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        tracing::error!("failed to bind to {}: {}", addr, e);
        std::process::exit(1);
    });

    // The HTTP surface gets its own shutdown trigger, independent of
    // `cancellation`, so it can be stopped last in the ordered shutdown
    // sequence rather than tearing down alongside the listener and
    // schedulers.
    let http_shutdown = tokio_util::sync::CancellationToken::new();
    let http_shutdown_signal = http_shutdown.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(tcp_listener, http_endpoints)
            .with_graceful_shutdown(async move { http_shutdown_signal.cancelled().await })
            .await
    });

    // Step 1: stop the listener first, so no new intents are admitted while
    // the rest of the pipeline drains.
    cancellation.cancelled().await;
    tracing::info!("shutdown signal received, stopping listener");
    listener_cancel.cancel();
    if tokio::time::timeout(WORKER_SHUTDOWN_GRACE, listener_handle).await.is_err() {
        tracing::warn!("listener did not stop within the shutdown grace period");
    }

    // Step 2: flush all batch queues while the chain workers are still
    // alive to receive the flush, so nothing is left stranded mid-batch.
    batch_queue.flush_all();

    // Step 3: now stop the DLQ worker and per-chain schedulers, and wait
    // for them to drain within the grace window.
    worker_cancel.cancel();
    if tokio::time::timeout(WORKER_SHUTDOWN_GRACE, futures::future::join_all(worker_handles))
        .await
        .is_err()
    {
        tracing::warn!("workers did not finish within the shutdown grace period; remaining intents stay in_flight for next-start recovery");
    }

    // Step 4: stop the HTTP surface last, draining in-flight requests.
    http_shutdown.cancel();
    if tokio::time::timeout(HTTP_SHUTDOWN_GRACE, http_task).await.is_err() {
        tracing::warn!("health API did not shut down within its grace period");
    }

    // Step 5: close the persistent store.
    drop(store);
    drop(telemetry);
    Ok(())
}
