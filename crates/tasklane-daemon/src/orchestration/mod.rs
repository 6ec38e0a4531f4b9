//! Task orchestration: the reconciliation loop that turns eligible tasks in
//! the task document into supervised agent runs and writes their outcomes
//! back.
//!
//! - [`Reconciler`]: owns the task file and the [`Supervisor`](crate::subprocess::Supervisor),
//!   runs one reconciliation pass per tick.

pub mod reconciler;

pub use reconciler::{ReconcileError, Reconciler, TickReport};
