//! Metrics for the tagstore services.
//!
//! Counters are emitted through the `metrics` facade; installing a recorder
//! (Prometheus or otherwise) is left to the embedding application.

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    // Tagged cache
    pub const TAGGED_HITS_TOTAL: &str = "tagstore_tagged_hits_total";
    pub const TAGGED_MISSES_TOTAL: &str = "tagstore_tagged_misses_total";
    pub const TAG_BUMPS_TOTAL: &str = "tagstore_tag_bumps_total";

    // Pub/sub
    pub const PUBSUB_PUBLISHED_TOTAL: &str = "tagstore_pubsub_published_total";
    pub const PUBSUB_ROUTED_TOTAL: &str = "tagstore_pubsub_routed_total";
    pub const PUBSUB_UNROUTABLE_TOTAL: &str = "tagstore_pubsub_unroutable_total";
    pub const PUBSUB_HANDLER_FAILURES_TOTAL: &str = "tagstore_pubsub_handler_failures_total";

    // Mutex
    pub const LOCK_ACQUIRED_TOTAL: &str = "tagstore_lock_acquired_total";
    pub const LOCK_TIMEOUTS_TOTAL: &str = "tagstore_lock_timeouts_total";
}

// =============================================================================
// Tagged cache
// =============================================================================

/// Record a tag-aware read that returned data.
pub fn record_tagged_hit() {
    counter!(names::TAGGED_HITS_TOTAL).increment(1);
}

/// Record a tag-aware read that returned nothing.
///
/// `reason` is `"absent"` or `"invalidated"`.
pub fn record_tagged_miss(reason: &'static str) {
    counter!(names::TAGGED_MISSES_TOTAL, "reason" => reason).increment(1);
}

/// Record a bump of `count` tags.
pub fn record_tag_bump(count: usize) {
    counter!(names::TAG_BUMPS_TOTAL).increment(count as u64);
}

// =============================================================================
// Pub/sub
// =============================================================================

pub fn record_published() {
    counter!(names::PUBSUB_PUBLISHED_TOTAL).increment(1);
}

/// Record an inbound message routed to a handler of the given kind.
pub fn record_routed(kind: &'static str) {
    counter!(names::PUBSUB_ROUTED_TOTAL, "kind" => kind).increment(1);
}

pub fn record_unroutable() {
    counter!(names::PUBSUB_UNROUTABLE_TOTAL).increment(1);
}

/// Record a handler failure. `outcome` is `"error"`, `"panic"` or `"timeout"`.
pub fn record_handler_failure(outcome: &'static str) {
    counter!(names::PUBSUB_HANDLER_FAILURES_TOTAL, "outcome" => outcome).increment(1);
}

// =============================================================================
// Mutex
// =============================================================================

pub fn record_lock_acquired() {
    counter!(names::LOCK_ACQUIRED_TOTAL).increment(1);
}

pub fn record_lock_timeout() {
    counter!(names::LOCK_TIMEOUTS_TOTAL).increment(1);
}
