//! Parks intents whose executor attempts exhausted all retries; retries
//! with exponential backoff up to `MAX_RETRIES`, then marks the intent
//! `permanently_failed`. A timer-priority set, not a FIFO: ordering across
//! retries is not preserved.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchQueueHandle;
use crate::model::{ChainId, IntentStatus, TransferIntent};
use crate::store::{PersistentStore, StatusUpdate};

struct DlqEntry {
    next_attempt_at: Instant,
    intent: TransferIntent,
}

impl PartialEq for DlqEntry {
    fn eq(&self, other: &Self) -> bool {
        self.next_attempt_at == other.next_attempt_at
    }
}
impl Eq for DlqEntry {}
impl PartialOrd for DlqEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DlqEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.next_attempt_at.cmp(&other.next_attempt_at)
    }
}

/// Shared handle used by the scheduler to park a permanently-exhausted
/// intent.
#[derive(Clone)]
pub struct DeadLetterQueueHandle {
    inner: Arc<Inner>,
}

struct Inner {
    heap: Mutex<BinaryHeap<Reverse<DlqEntry>>>,
    notify: tokio::sync::Notify,
    store: Arc<PersistentStore>,
    base_delay: Duration,
    max_retries: u32,
}

impl DeadLetterQueueHandle {
    /// On a final executor failure, bumps `retryCount` and either schedules
    /// a retry (`nextAttemptAt = now + base * 2^retryCount`) or, once
    /// `retryCount >= MAX_RETRIES`, marks the intent `permanently_failed`
    /// and drops it.
    pub async fn enqueue(&self, mut intent: TransferIntent) {
        intent.retry_count += 1;
        if intent.retry_count >= self.inner.max_retries {
            let _ = self.inner.store.update_status(
                &intent.request_id,
                IntentStatus::PermanentlyFailed,
                StatusUpdate::default(),
                now_millis(),
            );
            return;
        }
        let delay = self.inner.base_delay * 2u32.pow(intent.retry_count);
        let next_attempt_at = Instant::now() + delay;
        self.inner.heap.lock().await.push(Reverse(DlqEntry { next_attempt_at, intent }));
        self.inner.notify.notify_one();
    }

    pub async fn len(&self) -> usize {
        self.inner.heap.lock().await.len()
    }

    /// Per-chain size, used by [`crate::metrics::MetricsRegistry::set_dlq_size`]
    /// polling in the orchestrator.
    pub async fn len_for_chain(&self, chain_id: ChainId) -> usize {
        self.inner
            .heap
            .lock()
            .await
            .iter()
            .filter(|Reverse(entry)| entry.intent.chain_id == chain_id)
            .count()
    }
}

/// Spawns the DLQ background worker: wakes on the earliest `nextAttemptAt`
/// and re-submits the intent through the same chain's `BatchQueueHandle`
/// the listener uses.
pub fn spawn(
    store: Arc<PersistentStore>,
    base_delay: Duration,
    max_retries: u32,
    requeue_handles: HashMap<ChainId, BatchQueueHandle>,
    cancellation: CancellationToken,
) -> DeadLetterQueueHandle {
    let inner = Arc::new(Inner {
        heap: Mutex::new(BinaryHeap::new()),
        notify: tokio::sync::Notify::new(),
        store,
        base_delay,
        max_retries,
    });
    let handle = DeadLetterQueueHandle { inner: inner.clone() };

    tokio::spawn(async move {
        loop {
            let wait = {
                let heap = inner.heap.lock().await;
                heap.peek().map(|Reverse(entry)| entry.next_attempt_at)
            };

            let sleep_until_due = async {
                match wait {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,
                _ = inner.notify.notified() => continue,
                _ = sleep_until_due, if wait.is_some() => {
                    let due = {
                        let mut heap = inner.heap.lock().await;
                        match heap.peek() {
                            Some(Reverse(entry)) if entry.next_attempt_at <= Instant::now() => {
                                heap.pop().map(|Reverse(e)| e.intent)
                            }
                            _ => None,
                        }
                    };
                    if let Some(intent) = due {
                        if let Some(handle) = requeue_handles.get(&intent.chain_id) {
                            handle.add(intent);
                        } else {
                            tracing::warn!(chain_id = %intent.chain_id, "no batch queue handle for DLQ requeue");
                        }
                    }
                }
            }
        }
    });

    handle
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
    use crate::model::validate_intent;

    fn sample_intent(id: &str) -> TransferIntent {
        validate_intent(
            id.to_string(),
            format!("tx-{id}"),
            "sepolia",
            "0.01",
            "0xabcdef0123456789abcdef0123456789abcdef01",
            0,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_cap_then_permanently_fails() {
        let store = Arc::new(PersistentStore::open(&std::env::temp_dir().join(format!("dlq-test-{}", rand_suffix()))).unwrap());
        let intent = sample_intent("dlq-1");
        store
            .mark_pending(crate::model::IntentRecord::new_pending(&intent, 0))
            .unwrap();
        store
            .update_status(&intent.request_id, IntentStatus::InFlight, StatusUpdate::default(), 0)
            .unwrap();
        store
            .update_status(&intent.request_id, IntentStatus::Failed, StatusUpdate::default(), 0)
            .unwrap();

        let mut handles = HashMap::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let _ = tx; // placeholder sender unused by this assertion
        let cancellation = CancellationToken::new();
        let (queue, _receivers) = crate::batch::BatchQueue::spawn(
            5,
            Duration::from_secs(10),
            Arc::new(crate::metrics::MetricsRegistry::new()),
            cancellation.clone(),
        );
        handles.insert(ChainId::Sepolia, queue.handle(ChainId::Sepolia));

        let dlq = spawn(store.clone(), Duration::from_millis(1), 3, handles, cancellation.clone());

        let mut current = intent.clone();
        current.retry_count = 2; // one more failure reaches MAX_RETRIES=3
        dlq.enqueue(current).await;
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        let record = store.get_record("dlq-1").unwrap().unwrap();
        assert_eq!(record.status, IntentStatus::PermanentlyFailed);
        cancellation.cancel();
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }
}
