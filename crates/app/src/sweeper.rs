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

use std::time::Duration;

use chrono::Utc;
use spool_common_worker::{Trigger, Worker, WorkerContext};
use spool_queue::QueueCollection;
use tracing::debug;

/// Periodically expires items across every queue and drops queues idle past
/// their `max_queue_age`. Notifying it runs a sweep at once.
pub struct ExpirySweeper {
    collection: QueueCollection,
    interval:   Duration,
}

impl ExpirySweeper {
    pub const fn new(collection: QueueCollection, interval: Duration) -> Self {
        Self {
            collection,
            interval,
        }
    }
}

#[async_trait::async_trait]
impl Worker for ExpirySweeper {
    fn name() -> &'static str { "expiry-sweeper" }

    fn trigger(&self) -> Trigger { Trigger::IntervalOrNotify(self.interval) }

    // Queue calls block on each queue's worker thread.
    fn is_blocking() -> bool { true }

    async fn work(&mut self, ctx: &WorkerContext) -> spool_common_worker::Result<()> {
        let report = self.collection.expire_sweep(Utc::now());
        debug!(
            worker = ctx.name(),
            expired = report.expired,
            dropped = report.dropped.len(),
            "Sweep done"
        );
        Ok(())
    }

    async fn on_shutdown(&mut self, ctx: &WorkerContext) -> spool_common_worker::Result<()> {
        self.collection.flush_all().map_err(|e| {
            spool_common_worker::WorkError::fatal_with_source(
                format!("{} failed to flush journals", ctx.name()),
                e,
            )
        })
    }
}
