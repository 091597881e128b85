//! Relays privacy-preserving transfer intents observed on Aleo into native
//! token settlements on EVM testnets (Sepolia, Polygon Amoy).
//!
//! # Overview
//!
//! The relayer watches an Aleo program for `create_transfer_intent`
//! transitions, validates and deduplicates each one into a
//! [`model::TransferIntent`], batches them per destination chain, and settles
//! each batch as a plain value transfer from a pool of EVM wallets. A
//! [`store::PersistentStore`] makes the whole pipeline crash-safe: every
//! intent is durably marked `pending` before it is ever queued, so a restart
//! re-derives and re-enqueues anything left in flight rather than losing or
//! double-sending it.
//!
//! # Modules
//!
//! - [`model`] — core types: [`model::ChainId`], [`model::TransferIntent`],
//!   [`model::IntentRecord`], [`model::IntentStatus`] and ingress validation.
//! - [`store`] — durable `requestId -> IntentRecord` table with a status
//!   index, backed by `sled`.
//! - [`errors`] — the crate-wide [`errors::RelayerError`] taxonomy.
//! - [`listener`] — polls Aleo, extracts intents from block transactions, and
//!   feeds them into the batch queues.
//! - [`batch`] — per-chain queue with size- and time-triggered flush.
//! - [`scheduler`] — drains closed batches, assigns wallets, and dispatches
//!   concurrent sends.
//! - [`executor`] — sends one native transfer and waits for inclusion.
//! - [`wallet`] — the per-chain wallet pool: nonce management, gas pricing,
//!   wallet selection and balance tracking.
//! - [`circuit_breaker`] — three-state breaker guarding the Aleo API.
//! - [`rate_limiter`] — token-bucket limiting of Aleo API calls.
//! - [`dlq`] — dead-letter queue for exhausted executor retries.
//! - [`metrics`] — in-memory counters and throughput-stability estimation.
//! - [`config`] — environment-driven configuration loading.
//! - [`handlers`] — the operator/ingress HTTP surface (health, metrics,
//!   status, intent registration, transaction lookup).
//! - [`telemetry`] — OpenTelemetry tracing/metrics wiring.
//! - [`sig_down`] — graceful shutdown on SIGINT/SIGTERM.

pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod dlq;
pub mod errors;
pub mod executor;
pub mod handlers;
pub mod listener;
pub mod metrics;
pub mod model;
pub mod rate_limiter;
pub mod scheduler;
pub mod sig_down;
pub mod store;
pub mod telemetry;
pub mod wallet;
