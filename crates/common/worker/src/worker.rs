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

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

use crate::{context::WorkerContext, err::Result, trigger::Trigger};

/// Core worker trait for background tasks.
///
/// Implementors only define single-shot execution logic in `work()`. The
/// manager handles looping, triggering and lifecycle.
#[async_trait::async_trait]
pub trait Worker: Send + 'static {
    /// Worker name for logging.
    fn name() -> &'static str
    where
        Self: Sized;

    fn trigger(&self) -> Trigger;

    /// Whether the worker runs on the blocking thread pool. Blocking workers
    /// may call synchronous APIs from `work()`.
    fn is_blocking() -> bool
    where
        Self: Sized,
    {
        false
    }

    /// Called once before the first `work()`. An error stops the worker.
    async fn on_start(&mut self, _ctx: &WorkerContext) -> Result<()> { Ok(()) }

    /// Called each time the trigger fires. A transient error is logged and
    /// the worker waits for the next trigger; a fatal one stops it.
    async fn work(&mut self, ctx: &WorkerContext) -> Result<()>;

    /// Called once after the last `work()`, including after a fatal error.
    async fn on_shutdown(&mut self, _ctx: &WorkerContext) -> Result<()> { Ok(()) }
}

/// Handle to control a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    name:   &'static str,
    notify: Arc<Notify>,
    paused: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub(crate) const fn new(name: &'static str, notify: Arc<Notify>, paused: Arc<AtomicBool>) -> Self {
        Self {
            name,
            notify,
            paused,
        }
    }

    pub const fn name(&self) -> &'static str { self.name }

    /// Wakes a `Notify` or `IntervalOrNotify` worker. A notification sent
    /// while the worker is busy is kept for its next wait.
    pub fn notify(&self) { self.notify.notify_one(); }

    /// Skips `work()` until resumed. The trigger keeps firing.
    pub fn pause(&self) { self.paused.store(true, Ordering::Release); }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_paused(&self) -> bool { self.paused.load(Ordering::Acquire) }
}
