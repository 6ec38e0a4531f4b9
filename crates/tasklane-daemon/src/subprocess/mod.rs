//! Agent process supervision: concurrency pool, direct and companion
//! launches, output sinks and process-group signalling.

pub mod command;
pub mod companion;
pub mod manager;
pub mod pool;
pub mod signal;
pub mod sink;
pub mod types;

pub use companion::{CompanionError, ControlCommand};
pub use manager::{Supervisor, SupervisorConfig};
pub use pool::{ConcurrencyPool, PoolError};
pub use types::{ExecutionMode, ExitOutcome, ProcessRef, SpawnOptions, SupervisorError};
