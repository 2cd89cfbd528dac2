//! Thin wrappers around the `metrics` facade so the rest of the crate never
//! has to know the exact series names. No recorder is installed here: if
//! the caller (the CLI, or whichever binary embeds this crate) never
//! installs one, these calls are harmless no-ops.
//!
//! Series names carry the `allocator_` namespace prefix SPEC_FULL §6 asks
//! for (`<namespace>_address_pool_size{pool}` and friends); `allocator` is
//! this crate's chosen namespace, hardcoded here rather than threaded
//! through every call site since nothing in the core ever needs to change
//! it at runtime.

use crate::pool::RejectReason;

pub fn report_pool_size(pool: &str, size: u64) {
    metrics::gauge!("allocator_address_pool_size", "pool" => pool.to_string()).set(size as f64);
}

pub fn report_pool_in_use(pool: &str, in_use: u64) {
    metrics::gauge!("allocator_address_pool_addresses_in_use", "pool" => pool.to_string())
        .set(in_use as f64);
}

pub fn record_rejection(pool: &str, reason: RejectReason) {
    metrics::counter!(
        "allocator_address_pool_allocation_rejected_total",
        "pool" => pool.to_string(),
        "reason" => reason.as_str(),
    )
    .increment(1);
}

/// There is no "unregister a gauge" operation in the `metrics` facade, so a
/// removed pool's series are zeroed instead of deleted. A scrape between
/// `SetPools` calls will briefly show a zeroed series for a pool that no
/// longer exists.
pub fn clear_pool_metrics(pool: &str) {
    report_pool_size(pool, 0);
    report_pool_in_use(pool, 0);
}
