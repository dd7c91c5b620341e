// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Background workers driven by a trigger.
//!
//! - [`Worker`]: `on_start`, `work`, `on_shutdown` hooks
//! - [`Trigger`]: Once, Notify, Interval, IntervalOrNotify
//! - [`Manager`]: spawns workers and shuts them down within a timeout
//! - [`WorkerHandle`]: pause, resume and notify a running worker
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use spool_common_worker::{Manager, Trigger, Worker, WorkerConfig, WorkerContext};
//!
//! struct Ticker;
//!
//! #[async_trait::async_trait]
//! impl Worker for Ticker {
//!     fn name() -> &'static str { "ticker" }
//!
//!     fn trigger(&self) -> Trigger { Trigger::Interval(Duration::from_secs(5)) }
//!
//!     async fn work(&mut self, ctx: &WorkerContext) -> spool_common_worker::Result<()> {
//!         tracing::info!(worker = ctx.name(), "tick");
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut manager = Manager::start(WorkerConfig::builder().build()).unwrap();
//! let handle = manager.register(Ticker);
//! handle.pause();
//! handle.resume();
//! manager.shutdown().await.unwrap();
//! # }
//! ```

mod config;
mod context;
mod err;
mod manager;
mod trigger;
mod worker;

pub use config::WorkerConfig;
pub use context::WorkerContext;
pub use err::{BoxedError, ErrorSeverity, Result, WorkError};
pub use manager::Manager;
pub use trigger::Trigger;
pub use worker::{Worker, WorkerHandle};
