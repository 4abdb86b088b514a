//! Counters exported through the `metrics` facade.
//!
//! Nothing is recorded unless the application installs a recorder.

/// Items returned by `read`
pub const ITEMS_READ: &str = "asyncseq_items_read_total";
/// Errors delivered to subscribers
pub const ERRORS: &str = "asyncseq_errors_total";
/// Iterators reaching a terminal state, labelled by `outcome`
pub const ITERATORS_TERMINATED: &str = "asyncseq_iterators_terminated_total";

pub(crate) fn record_read() {
    metrics::counter!(ITEMS_READ).increment(1);
}

pub(crate) fn record_error() {
    metrics::counter!(ERRORS).increment(1);
}

pub(crate) fn record_terminated(destroy: bool) {
    let outcome = if destroy { "destroyed" } else { "ended" };
    metrics::counter!(ITERATORS_TERMINATED, "outcome" => outcome).increment(1);
}
