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

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use snafu::OptionExt;
use tokio::{
    runtime::Handle,
    sync::Notify,
    task::JoinSet,
    time::{Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::WorkerConfig,
    context::WorkerContext,
    err::{NoRuntimeSnafu, Result},
    trigger::Trigger,
    worker::{Worker, WorkerHandle},
};

/// Manages lifecycle of multiple background workers.
pub struct Manager {
    cancel_token:     CancellationToken,
    handle:           Handle,
    shutdown_timeout: Duration,
    joins:            JoinSet<Result<()>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("workers", &self.joins.len())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl Manager {
    /// Create a new worker manager.
    pub fn start(config: WorkerConfig) -> Result<Self> {
        let handle = config
            .handle()
            .or_else(|| Handle::try_current().ok())
            .context(NoRuntimeSnafu)?;
        Ok(Self {
            cancel_token: CancellationToken::new(),
            handle,
            shutdown_timeout: config.shutdown_timeout(),
            joins: JoinSet::new(),
        })
    }

    /// Register a new worker and return its handle.
    ///
    /// The worker starts immediately in a background task.
    pub fn register<W>(&mut self, mut worker: W) -> WorkerHandle
    where
        W: Worker,
    {
        let name = W::name();
        let trigger = worker.trigger();
        let notify = Arc::new(Notify::new());
        let paused = Arc::new(AtomicBool::new(false));
        let ctx = WorkerContext::new(name, self.cancel_token.child_token(), Arc::clone(&notify));

        let task_paused = Arc::clone(&paused);
        let task = async move {
            info!(worker = name, trigger = ?trigger, "Worker starting");

            if let Err(e) = worker.on_start(&ctx).await {
                error!(worker = name, error = %e, "Worker failed during on_start");
                return Err(e);
            }

            let result = Self::run_loop(&mut worker, &ctx, &task_paused, trigger).await;

            // Always call on_shutdown, even if work failed
            if let Err(e) = worker.on_shutdown(&ctx).await {
                error!(worker = name, error = %e, "Worker failed during on_shutdown");
            }

            match &result {
                Ok(()) => info!(worker = name, "Worker stopped gracefully"),
                Err(e) => error!(worker = name, error = %e, "Worker failed"),
            }
            result
        };

        if W::is_blocking() {
            let handle = self.handle.clone();
            self.joins
                .spawn_blocking_on(move || handle.block_on(task), &self.handle);
        } else {
            self.joins.spawn_on(task, &self.handle);
        }

        WorkerHandle::new(name, notify, paused)
    }

    async fn run_loop<W>(
        worker: &mut W,
        ctx: &WorkerContext,
        paused: &AtomicBool,
        trigger: Trigger,
    ) -> Result<()>
    where
        W: Worker,
    {
        if trigger == Trigger::Once {
            return Self::run_once(worker, ctx, paused).await;
        }

        let mut interval = trigger.period().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            tokio::select! {
                () = ctx.cancelled() => break,
                () = ctx.notified(), if trigger.listens() => {
                    if let Some(interval) = interval.as_mut() {
                        interval.reset();
                    }
                }
                () = tick(&mut interval) => {}
            }
            Self::run_once(worker, ctx, paused).await?;
        }
        Ok(())
    }

    /// Runs `work()` unless paused. Only fatal errors propagate.
    async fn run_once<W>(worker: &mut W, ctx: &WorkerContext, paused: &AtomicBool) -> Result<()>
    where
        W: Worker,
    {
        if paused.load(Ordering::Acquire) || ctx.is_cancelled() {
            return Ok(());
        }
        match worker.work(ctx).await {
            Err(e) if e.is_transient() => {
                warn!(worker = ctx.name(), error = %e, "Worker execution failed, will retry");
                Ok(())
            }
            result => result,
        }
    }

    /// Gracefully shutdown all workers.
    ///
    /// Cancels all workers and waits for them to finish within the configured
    /// timeout. Workers not responding in time will be aborted.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down worker manager");
        self.cancel_token.cancel();

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut aborted_count = 0;
        let mut total_count = 0;

        loop {
            tokio::select! {
                result = self.joins.join_next() => {
                    match result {
                        Some(Ok(Ok(()))) => total_count += 1,
                        Some(Ok(Err(e))) => {
                            total_count += 1;
                            error!(error = %e, "Worker error during shutdown");
                        }
                        Some(Err(e)) => {
                            total_count += 1;
                            if e.is_cancelled() {
                                aborted_count += 1;
                            } else {
                                error!(error = %e, "Join error during shutdown");
                            }
                        }
                        None => break,
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    error!(
                        timeout = ?self.shutdown_timeout,
                        "Shutdown timeout reached, aborting remaining workers"
                    );
                    self.joins.abort_all();

                    while let Some(result) = self.joins.join_next().await {
                        total_count += 1;
                        if let Err(e) = result && e.is_cancelled() {
                            aborted_count += 1;
                        }
                    }
                    break;
                }
            }
        }

        if aborted_count > 0 {
            error!(
                stopped = total_count - aborted_count,
                aborted = aborted_count,
                "Worker manager shutdown complete"
            );
        } else {
            info!(stopped = total_count, "Worker manager shutdown complete");
        }

        Ok(())
    }
}

/// Next tick of `interval`, or never for triggers without a period.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
