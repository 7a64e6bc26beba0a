//! Snakepit worker pool
//!
//! Keeps a fixed set of external worker processes alive and lends them out
//! one caller at a time. A checkout returns a [`WorkerHandle`] that owns the
//! worker's channel until it is checked in; callers carrying a session id are
//! routed back to the worker they last used while that worker is idle.
//!
//! Failed workers are evicted and replaced in their slot, idle workers are
//! probed in the background, and per-slot (optionally pool-wide) circuit
//! breakers stop traffic to workers that keep failing.
//!
//! ```no_run
//! # async fn run() -> Result<(), snakepit_pool::PoolError> {
//! use snakepit_config::SnakepitConfig;
//! use snakepit_pool::Pool;
//!
//! let pool = Pool::from_config(SnakepitConfig::default()).await?;
//! let reply = pool.execute("echo", serde_json::json!({"hello": "world"})).await?;
//! println!("{}", reply);
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod affinity;
pub mod channel;
pub mod coordinator;
pub mod error;
pub mod execute;
pub mod handle;
mod health;
pub mod stats;
pub mod telemetry;
pub mod worker;

pub use affinity::{AffinityLookup, AffinityTracker};
pub use channel::WorkerChannel;
pub use coordinator::{Escalation, Pool, PoolBuilder};
pub use error::{InitializationFailure, PoolError, PoolResult};
pub use execute::ExecuteOptions;
pub use handle::{CheckinOutcome, WorkerHandle};
pub use stats::{PoolStats, WorkerSnapshot};
pub use telemetry::{
    CheckinEvent, CheckoutEvent, EvictionEvent, EvictionReason, ProbeEvent, Telemetry,
    TracingTelemetry,
};
pub use worker::{WorkerId, WorkerState};
