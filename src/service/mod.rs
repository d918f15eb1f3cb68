//! Application services: order lifecycle, payment reconciliation and the
//! runtime seams they depend on.

pub mod idempotency;
pub mod lifecycle;
pub mod reconciler;
pub mod runtime;

pub use idempotency::IdempotencyGuard;
pub use lifecycle::OrderLifecycleService;
pub use reconciler::PaymentReconciler;
pub use runtime::{Clock, Scheduler, SystemClock, TokioScheduler};
