//! # Cancellation-safe Task Orchestration for Rust
//!
//! This crate provides the building blocks for composing concurrent work:
//! worker pools, staged pipelines, fan-in and fan-out, all connected by
//! closable streams and stopped by a shared cancellation token.
//!
//! ## Core Concepts
//!
//! - **Stream**: A closable FIFO conduit, bounded, unbounded or rendezvous
//! - **CancelToken**: A one-shot stop signal with an optional deadline
//! - **Select**: Waits for the first ready stream, token or timeout
//! - **WorkerPool**: N workers draining one shared task stream
//! - **Pipeline**: Stages connected output to input, with backpressure
//! - **fan_in / fan_out**: Merge many streams into one, or split one across many
//!
//! Every component returns a handle with `wait()` and `cancel(reason)`, and
//! closes the streams it owns on every exit path.
//!
//! ## Example
//!
//! ```rust
//! use taskweld::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let token = CancelToken::new();
//!     let squares = Pipeline::from_iter(1..=5, StageConfig::default(), &token)
//!         .map(|n: i64| n * n)
//!         .build();
//!
//!     let inputs = vec![squares.output];
//!     let (merged, fan) = fan_in(inputs, &FanConfig::default(), &token).into_parts();
//!     let total: i64 = merged.collect_all().await.into_iter().sum();
//!
//!     squares.handle.wait().await?;
//!     fan.wait().await?;
//!     assert_eq!(total, 55);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod fan;
pub mod group;
pub mod pipeline;
pub mod pool;
pub mod select;
pub mod stream;
pub mod token;
pub mod transform;

// Re-export commonly used items
pub mod prelude {
    pub use crate::config::{FanConfig, PoolConfig, StageConfig};
    pub use crate::error::{Error, IntoError, Result};
    pub use crate::fan::{fan_in, fan_out};
    pub use crate::group::{Spawned, TaskGroup, UnitState};
    pub use crate::pipeline::{connect_stage, emit, Pipeline};
    pub use crate::pool::{Task, TaskId, TaskResult, TaskSubmitter, WorkerPool};
    pub use crate::select::{Select, Selected};
    pub use crate::stream::{channel, unbounded, Receiver, Sender, Stream};
    pub use crate::token::CancelToken;
    pub use crate::transform::{map_fn, transform_fn, Transform};
}

// Re-export main error type
pub use error::{Error, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
