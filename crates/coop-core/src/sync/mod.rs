//! Reconciliation between the local store and the server

mod engine;
mod gate;
mod policy;
mod retry;


pub use engine::{FailureKind, SyncEngine, SyncFailure, SyncSummary};
pub use gate::SyncGate;
pub use policy::{resolve, Decision};
pub use retry::{RetryPolicy, RetryVerdict};
