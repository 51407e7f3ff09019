pub mod backoff;
pub mod cache;
pub mod diff;
pub mod listing;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
