//! Telemetry metric name constants.
//!
//! Centralised metric names for bifrost operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `bifrost_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `model_class`: routing tier (e.g. "hifi", "lofi", "embedding")
//! - `kind`: error classification: "no_models_available" or "other_error"
//! - `tier`: cache tier: "local" or "network"
//! - `operation`: "generate" or "stream"
//! - `provider`: canonical upstream provider (e.g. "azure", "openai")

/// Wall-clock duration of forwarded requests, in seconds.
///
/// Labels: `model_class`, `operation`.
pub const PROCESSING_DURATION_SECONDS: &str = "bifrost_processing_duration_seconds";

/// Requests dispatched to an upstream provider.
///
/// Labels: `provider`, `operation`, `status` ("ok" | "error").
pub const UPSTREAM_REQUESTS_TOTAL: &str = "bifrost_upstream_requests_total";

/// Errors recorded against a model class.
///
/// Labels: `kind`, `model_class`.
pub const ERRORS_TOTAL: &str = "bifrost_errors_total";

/// Requests placed on the out-of-band retry queue.
///
/// Labels: `model_class`.
pub const ENQUEUED_TOTAL: &str = "bifrost_enqueued_total";

/// Requests forwarded to a fallback model instead of the requested one.
///
/// Labels: `model_class`.
pub const FAILOVERS_TOTAL: &str = "bifrost_failovers_total";

/// Response cache hits.
///
/// Labels: `tier`, `operation`.
pub const CACHE_HITS_TOTAL: &str = "bifrost_cache_hits_total";

/// Response cache misses.
///
/// Labels: `operation`.
pub const CACHE_MISSES_TOTAL: &str = "bifrost_cache_misses_total";

/// Responses admitted to the cache after graduating from jail.
///
/// Labels: `operation`.
pub const CACHE_WRITES_TOTAL: &str = "bifrost_cache_writes_total";

/// Requests served live because their fingerprint is still jailed.
///
/// Labels: `operation`.
pub const JAILED_TOTAL: &str = "bifrost_jailed_total";

/// Time spent waiting for an upstream concurrency slot, in seconds.
pub const SEMAPHORE_WAIT_SECONDS: &str = "bifrost_semaphore_wait_seconds";

/// Chunks that failed assembly.
pub const ASSEMBLY_ERRORS_TOTAL: &str = "bifrost_assembly_errors_total";

/// Persistence flush steps that failed after retries.
///
/// Labels: `step`.
pub const FLUSH_FAILURES_TOTAL: &str = "bifrost_flush_failures_total";
