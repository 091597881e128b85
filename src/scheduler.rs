//! Assigns intents within a closed batch to wallets and drives their
//! concurrent execution.

use std::sync::Arc;

use alloy_primitives::Address;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchQueueHandle;
use crate::dlq::DeadLetterQueueHandle;
use crate::executor::{EvmExecutor, ExecutionOutcome};
use crate::model::Batch;
use crate::store::{PersistentStore, StatusUpdate};
use crate::wallet::amount_to_wei;

/// Drives one chain's scheduler loop: pulls closed batches off `batch_rx`
/// forever, applies the wallet-selection and fairness policy, and awaits
/// every execution concurrently via `join_all` so one failing send never
/// cancels its siblings.
pub async fn run_chain_scheduler(
    mut batch_rx: mpsc::UnboundedReceiver<Batch>,
    executor: Arc<EvmExecutor>,
    store: Arc<PersistentStore>,
    dlq: DeadLetterQueueHandle,
    requeue: BatchQueueHandle,
    cancellation: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            maybe_batch = batch_rx.recv() => match maybe_batch {
                Some(b) => b,
                None => break,
            },
        };

        // At-most-one-concurrent-batch-processing-per-chain: held for the
        // whole of this batch's processing.
        let _permit = requeue.processing.acquire().await.expect("semaphore not closed");

        process_batch(batch, &executor, &store, &dlq, &requeue).await;
    }
}

async fn process_batch(
    batch: Batch,
    executor: &EvmExecutor,
    store: &PersistentStore,
    dlq: &DeadLetterQueueHandle,
    requeue: &BatchQueueHandle,
) {
    let k = executor.wallet_pool.k();
    executor.wallet_pool.set_max_outstanding(batch.intents.len().max(1)).await;

    // Fairness: no wallet is assigned two intents within a batch; if the
    // batch exceeds k, the overflow is held and re-queued to the same
    // chain's tail, preserving its relative order.
    let (scheduled, overflow) = if batch.intents.len() > k {
        let split = batch.intents.split_at(k);
        (split.0.to_vec(), split.1.to_vec())
    } else {
        (batch.intents.clone(), Vec::new())
    };

    let mut assignments: Vec<(crate::model::TransferIntent, Address)> = Vec::with_capacity(scheduled.len());
    let mut chosen: Vec<Address> = Vec::new();
    let mut unassignable = Vec::new();

    for intent in scheduled {
        let amount_wei = match amount_to_wei(intent.amount) {
            Ok(v) => v,
            Err(_) => {
                unassignable.push(intent);
                continue;
            }
        };
        // A conservative worst-case fee bound for the balance check; the
        // actual fee is re-derived per-send from the wallet's gas cache.
        let estimated_fee = alloy_primitives::U256::from(21_000u64) * alloy_primitives::U256::from(200_000_000_000u64);
        match executor.wallet_pool.select_wallet(amount_wei, estimated_fee, &chosen).await {
            Some(address) => {
                chosen.push(address);
                // pending/failed -> in_flight; the executor owns every
                // transition from here on.
                let _ = store.update_status(
                    &intent.request_id,
                    crate::model::IntentStatus::InFlight,
                    StatusUpdate::default(),
                    now_millis(),
                );
                assignments.push((intent, address));
            }
            None => unassignable.push(intent),
        }
    }

    let sends = assignments
        .iter()
        .map(|(intent, address)| executor.send(intent, *address));
    let results = join_all(sends).await;

    let now = now_millis();
    for result in results {
        match result.outcome {
            ExecutionOutcome::Confirmed { tx_hash, block_number } => {
                let _ = store.update_status(
                    &result.request_id,
                    crate::model::IntentStatus::Confirmed,
                    StatusUpdate {
                        evm_tx_hash: Some(tx_hash),
                        block_number: Some(block_number),
                        ..Default::default()
                    },
                    now,
                );
            }
            ExecutionOutcome::Failed { error, permanent } => {
                let _ = store.update_status(
                    &result.request_id,
                    crate::model::IntentStatus::Failed,
                    StatusUpdate {
                        error_message: Some(error),
                        ..Default::default()
                    },
                    now,
                );
                if let Some(intent) = assignments
                    .iter()
                    .find(|(i, _)| i.request_id == result.request_id)
                    .map(|(i, _)| i.clone())
                {
                    if permanent {
                        let _ = store.update_status(
                            &result.request_id,
                            crate::model::IntentStatus::PermanentlyFailed,
                            StatusUpdate::default(),
                            now,
                        );
                    } else {
                        dlq.enqueue(intent).await;
                    }
                }
            }
        }
    }

    // Intents that never found an eligible wallet this round go straight to
    // the DLQ rather than spinning the batch loop. The transition table only
    // allows pending -> in_flight -> failed, never pending -> failed
    // directly, so both hops are recorded even though no broadcast was
    // attempted.
    for intent in unassignable {
        let _ = store.update_status(
            &intent.request_id,
            crate::model::IntentStatus::InFlight,
            StatusUpdate::default(),
            now,
        );
        let _ = store.update_status(
            &intent.request_id,
            crate::model::IntentStatus::Failed,
            StatusUpdate {
                error_message: Some("no eligible wallet available".to_string()),
                ..Default::default()
            },
            now,
        );
        dlq.enqueue(intent).await;
    }

    if let Err(e) = executor.refresh_nonces().await {
        tracing::warn!(chain_id = %executor.chain_id, error = %e, "post-batch nonce refresh failed");
    }

    for intent in overflow {
        requeue.add(intent);
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

    #[test]
    fn overflow_split_preserves_order() {
        let intents: Vec<u32> = (0..7).collect();
        let k = 3;
        let (scheduled, overflow) = if intents.len() > k {
            let split = intents.split_at(k);
            (split.0.to_vec(), split.1.to_vec())
        } else {
            (intents.clone(), Vec::new())
        };
        assert_eq!(scheduled, vec![0, 1, 2]);
        assert_eq!(overflow, vec![3, 4, 5, 6]);
    }
}
