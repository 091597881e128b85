//! In-memory counters consumed by [`crate::handlers`] and for throughput
//! stability signalling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::time::Instant;

use crate::model::ChainId;

/// EWMA estimator for execution rate μ, smoothing factor fixed at 0.2.
struct Ewma {
    alpha: f64,
    value: f64,
    last_sample_at: Instant,
}

impl Ewma {
    fn new(alpha: f64) -> Self {
        Ewma {
            alpha,
            value: 0.0,
            last_sample_at: Instant::now(),
        }
    }

    /// Records one completed intent and updates the rate estimate (events
    /// per second).
    fn record_event(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_sample_at).as_secs_f64().max(1e-6);
        let instantaneous_rate = 1.0 / elapsed;
        self.value = self.alpha * instantaneous_rate + (1.0 - self.alpha) * self.value;
        self.last_sample_at = now;
    }

    fn rate(&self) -> f64 {
        self.value
    }
}

#[derive(Default)]
struct ChainCounters {
    sent: AtomicU64,
    confirmed: AtomicU64,
    failed: AtomicU64,
    duplicates_skipped: AtomicU64,
    queue_depth: AtomicU64,
}

/// Per-chain snapshot returned by [`MetricsRegistry::snapshot`].
#[derive(Debug, Clone)]
pub struct ChainMetricsSnapshot {
    pub chain_id: ChainId,
    pub sent: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub duplicates_skipped: u64,
    pub queue_depth: u64,
    /// EWMA execution rate μ, completed intents/sec.
    pub execution_rate: f64,
    pub wallet_count: usize,
    /// `T = min(arrival rate λ, k·μ)`.
    pub throughput_estimate: f64,
    /// `λ < k·μ`.
    pub stable: bool,
    pub dlq_size: u64,
}

/// Per-chain atomic counters plus an EWMA throughput estimator, keyed by
/// [`ChainId`].
pub struct MetricsRegistry {
    counters: HashMap<ChainId, ChainCounters>,
    execution_rate: Mutex<HashMap<ChainId, Ewma>>,
    arrival_rate: Mutex<HashMap<ChainId, Ewma>>,
    wallet_counts: Mutex<HashMap<ChainId, usize>>,
    dlq_size: HashMap<ChainId, AtomicU64>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut counters = HashMap::new();
        let mut execution_rate = HashMap::new();
        let mut arrival_rate = HashMap::new();
        let mut dlq_size = HashMap::new();
        for chain in ChainId::ALL {
            counters.insert(chain, ChainCounters::default());
            execution_rate.insert(chain, Ewma::new(0.2));
            arrival_rate.insert(chain, Ewma::new(0.2));
            dlq_size.insert(chain, AtomicU64::new(0));
        }
        MetricsRegistry {
            counters,
            execution_rate: Mutex::new(execution_rate),
            arrival_rate: Mutex::new(arrival_rate),
            wallet_counts: Mutex::new(HashMap::new()),
            dlq_size,
        }
    }

    pub fn set_wallet_count(&self, chain_id: ChainId, k: usize) {
        self.wallet_counts.lock().unwrap().insert(chain_id, k);
    }

    pub fn record_sent(&self, chain_id: ChainId) {
        self.counters[&chain_id].sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_confirmed(&self, chain_id: ChainId) {
        self.counters[&chain_id].confirmed.fetch_add(1, Ordering::Relaxed);
        if let Some(ewma) = self.execution_rate.lock().unwrap().get_mut(&chain_id) {
            ewma.record_event();
        }
    }

    pub fn record_failed(&self, chain_id: ChainId) {
        self.counters[&chain_id].failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_skipped(&self, chain_id: ChainId) {
        self.counters[&chain_id].duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_arrival(&self, chain_id: ChainId) {
        if let Some(ewma) = self.arrival_rate.lock().unwrap().get_mut(&chain_id) {
            ewma.record_event();
        }
    }

    pub fn set_queue_depth(&self, chain_id: ChainId, depth: u64) {
        self.counters[&chain_id].queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_dlq_size(&self, chain_id: ChainId, size: u64) {
        self.dlq_size[&chain_id].store(size, Ordering::Relaxed);
    }

    pub fn snapshot(&self, chain_id: ChainId) -> ChainMetricsSnapshot {
        let counters = &self.counters[&chain_id];
        let execution_rate = self
            .execution_rate
            .lock()
            .unwrap()
            .get(&chain_id)
            .map(|e| e.rate())
            .unwrap_or(0.0);
        let arrival_rate = self
            .arrival_rate
            .lock()
            .unwrap()
            .get(&chain_id)
            .map(|e| e.rate())
            .unwrap_or(0.0);
        let wallet_count = *self.wallet_counts.lock().unwrap().get(&chain_id).unwrap_or(&0);
        let k_mu = wallet_count as f64 * execution_rate;
        let throughput_estimate = arrival_rate.min(k_mu);

        ChainMetricsSnapshot {
            chain_id,
            sent: counters.sent.load(Ordering::Relaxed),
            confirmed: counters.confirmed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            duplicates_skipped: counters.duplicates_skipped.load(Ordering::Relaxed),
            queue_depth: counters.queue_depth.load(Ordering::Relaxed),
            execution_rate,
            wallet_count,
            throughput_estimate,
            stable: arrival_rate < k_mu,
            dlq_size: self.dlq_size[&chain_id].load(Ordering::Relaxed),
        }
    }

    pub fn snapshot_all(&self) -> Vec<ChainMetricsSnapshot> {
        ChainId::ALL.into_iter().map(|c| self.snapshot(c)).collect()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stability_flag_reflects_lambda_vs_k_mu() {
        let registry = MetricsRegistry::new();
        registry.set_wallet_count(ChainId::Sepolia, 2);
        // No events recorded yet: both rates are 0, 0 < 0 is false so the
        // system reports stable=false until the estimator warms up.
        let snapshot = registry.snapshot(ChainId::Sepolia);
        assert!(!snapshot.stable);
    }

    #[test]
    fn counters_increment_independently_per_chain() {
        let registry = MetricsRegistry::new();
        registry.record_sent(ChainId::Sepolia);
        registry.record_sent(ChainId::Sepolia);
        registry.record_sent(ChainId::Amoy);
        assert_eq!(registry.snapshot(ChainId::Sepolia).sent, 2);
        assert_eq!(registry.snapshot(ChainId::Amoy).sent, 1);
    }
}
