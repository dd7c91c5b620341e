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

//! A single named, journaled queue.
//!
//! [`PersistentQueue`] is a cheap handle to a [`QueueWorker`] thread that
//! owns the queue's state and journal. Every call is a request/reply over a
//! channel; calls from many threads are serialized by the worker.
//!
//! ## Usage
//!
//! ```ignore
//! let queue = PersistentQueue::open("jobs", dir, QueueConfig::default())?;
//! queue.add("hello", None)?;
//!
//! let reservation = queue.get(ClientId(1), Some(Duration::from_secs(1)))?;
//! if let Some(reservation) = reservation {
//!     process(&reservation.item.data);
//!     queue.confirm(reservation.xid)?;
//! }
//! queue.close()?;
//! ```

use std::{
    path::Path,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam::channel::{Sender, bounded, unbounded};
use parking_lot::{Mutex, RwLock};
use snafu::{OptionExt, ResultExt};
use tracing::{debug, info, warn};

use crate::{
    QueueConfig,
    error::{IoSnafu, QueueClosedSnafu, QueueError, Result},
    item::Item,
    queue_worker::{Command, Outcome, QueueWorker, ShutdownMode},
    reservation::{ClientId, Reservation},
    state::{QueueState, QueueStats},
};

/// Receives items that expired out of a queue configured with
/// `expire_to_queue`. Called on the thread that observed the expiry, after
/// the source queue has finished the operation.
pub trait ExpiryHandler: Send + Sync {
    fn on_expired(&self, source: &str, target: &str, items: Vec<Item>);
}

pub struct PersistentQueue {
    name:   String,
    config: RwLock<Arc<QueueConfig>>,
    tx:     Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    expiry: Option<Weak<dyn ExpiryHandler>>,
}

impl std::fmt::Debug for PersistentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PersistentQueue {
    /// Opens queue `name` with its journal at `dir/name`, replaying any
    /// existing journal. Expired items are dropped.
    pub fn open(name: impl Into<String>, dir: impl AsRef<Path>, config: QueueConfig) -> Result<Self> {
        Self::open_with(name, dir, config, None)
    }

    /// Like [`PersistentQueue::open`], routing expired items to `expiry`.
    pub fn open_with(
        name: impl Into<String>,
        dir: impl AsRef<Path>,
        config: QueueConfig,
        expiry: Option<Weak<dyn ExpiryHandler>>,
    ) -> Result<Self> {
        let name = name.into();
        let dir = dir.as_ref();
        let config = Arc::new(config);
        let state = QueueState::recover(name.clone(), dir, Arc::clone(&config))?;

        let (tx, rx) = unbounded();
        let worker = QueueWorker::new(state, rx);
        let thread = thread::Builder::new()
            .name(format!("spool-{name}"))
            .spawn(move || worker.run())
            .context(IoSnafu {
                path: dir.join(&name),
            })?;

        info!(queue = %name, path = ?dir.join(&name), "Queue opened");

        Ok(Self {
            name,
            config: RwLock::new(config),
            tx,
            thread: Mutex::new(Some(thread)),
            expiry,
        })
    }

    pub fn name(&self) -> &str { &self.name }

    /// The configuration snapshot currently in effect.
    pub fn config(&self) -> Arc<QueueConfig> { Arc::clone(&self.config.read()) }

    /// Appends an item and returns its id.
    pub fn add(&self, data: impl Into<Bytes>, expires_at: Option<DateTime<Utc>>) -> Result<u64> {
        let data = data.into();
        self.call(move |state, _| state.add(data, expires_at, Utc::now()))
    }

    /// Reserves the head item for `client`. With `wait`, blocks up to that
    /// long for an item to arrive; an expired wait returns `None`.
    pub fn get(&self, client: ClientId, wait: Option<Duration>) -> Result<Option<Reservation>> {
        let (reply, rx) = bounded(1);
        let deadline = wait.and_then(|wait| Instant::now().checked_add(wait));
        self.send(Command::Get {
            client,
            deadline,
            reply,
        })?;
        let outcome = rx.recv().ok().context(QueueClosedSnafu { queue: &self.name })?;
        self.finish(outcome)
    }

    /// Permanently removes reservation `xid`.
    pub fn confirm(&self, xid: u64) -> Result<()> { self.call(move |state, _| state.confirm(xid)) }

    /// Returns reservation `xid` to the queue ahead of newer items.
    pub fn abort(&self, xid: u64) -> Result<()> { self.call(move |state, _| state.abort(xid)) }

    /// Returns every reservation held by `client`.
    pub fn abort_client(&self, client: ClientId) -> Result<usize> {
        self.call(move |state, _| state.abort_client(client))
    }

    /// Removes expired items from the head, up to `max_expire_sweep`.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let limit = self.config().max_expire_sweep;
        self.call(move |state, expired| state.expire_sweep(now, limit, expired))
    }

    pub fn peek(&self) -> Result<QueueStats> {
        let mut stats = self.call(|state, _| state.stats(Utc::now()))?;
        let (reply, rx) = bounded(1);
        self.send(Command::Waiters(reply))?;
        stats.waiters = rx.recv().unwrap_or_default();
        Ok(stats)
    }

    /// The head item, without reserving it.
    pub fn peek_item(&self) -> Result<Option<Item>> {
        self.call(|state, expired| state.peek_item(Utc::now(), expired))
    }

    /// Discards every pending item. Returns how many were dropped.
    pub fn purge(&self) -> Result<u64> { self.call(|state, _| state.purge()) }

    /// Forces the journal to stable storage.
    pub fn flush(&self) -> Result<()> { self.call(|state, _| state.flush()) }

    /// Replaces the configuration. `keep_journal` keeps its current value.
    pub fn reload(&self, config: QueueConfig) -> Result<()> {
        let effective = self.call(move |state, _| Ok(state.reload(config)))?;
        *self.config.write() = effective;
        Ok(())
    }

    /// Syncs the journal and stops the worker.
    pub fn close(&self) -> Result<()> { self.shutdown(ShutdownMode::Close).map(drop) }

    /// Stops the worker and deletes the journal. Refused while reservations
    /// are open; the queue keeps running in that case.
    pub fn erase(&self) -> Result<()> { self.shutdown(ShutdownMode::Erase).map(drop) }

    /// Erases the queue only if it is empty, has no open reservations or
    /// waiting dequeues, and has seen no add for longer than `max_age`. The
    /// check and the erase happen in one step on the worker, so an add can
    /// never slip in between. Returns whether the queue was erased.
    pub fn erase_if_idle(&self, max_age: Duration) -> Result<bool> {
        self.shutdown(ShutdownMode::EraseIfIdle(max_age))
    }

    fn shutdown(&self, mode: ShutdownMode) -> Result<bool> {
        let (reply, rx) = bounded(1);
        self.send(Command::Shutdown { mode, reply })?;
        let result = rx.recv().ok().context(QueueClosedSnafu { queue: &self.name })?;
        // the worker keeps running after a refused erase
        if matches!(result, Ok(false) | Err(QueueError::QueueBusy { .. })) {
            return result;
        }
        if let Some(thread) = self.thread.lock().take()
            && thread.join().is_err()
        {
            warn!(queue = %self.name, "Queue worker panicked");
        }
        result
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .ok()
            .context(QueueClosedSnafu { queue: &self.name })
    }

    /// Runs `op` on the worker and waits for its result.
    fn call<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut QueueState, &mut Vec<Item>) -> Result<T> + Send + 'static,
    {
        let (reply, rx) = bounded(1);
        self.send(Command::Exec(Box::new(move |state| {
            let mut expired = Vec::new();
            let result = op(state, &mut expired);
            let _ = reply.send(Outcome { result, expired });
        })))?;
        let outcome = rx.recv().ok().context(QueueClosedSnafu { queue: &self.name })?;
        self.finish(outcome)
    }

    fn finish<T>(&self, outcome: Outcome<T>) -> Result<T> {
        if !outcome.expired.is_empty() {
            self.route_expired(outcome.expired);
        }
        outcome.result
    }

    fn route_expired(&self, items: Vec<Item>) {
        let target = self.config().expire_to_queue.clone();
        let handler = self.expiry.as_ref().and_then(Weak::upgrade);
        match (target, handler) {
            (Some(target), Some(handler)) if target != self.name => {
                handler.on_expired(&self.name, &target, items);
            }
            _ => debug!(queue = %self.name, count = items.len(), "Dropped expired items"),
        }
    }
}

impl Drop for PersistentQueue {
    fn drop(&mut self) {
        if self.thread.get_mut().is_some()
            && let Err(e) = self.close()
        {
            warn!(queue = %self.name, error = %e, "Failed to close queue on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::{SyncPolicy, error::ErrorKind};

    fn open(dir: &TempDir, config: QueueConfig) -> PersistentQueue {
        PersistentQueue::open("jobs", dir.path(), config).unwrap()
    }

    #[test]
    fn test_add_get_confirm() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, QueueConfig::default());
        assert_eq!(queue.add("a", None).unwrap(), 1);
        assert_eq!(queue.add("b", None).unwrap(), 2);

        let reservation = queue.get(ClientId(1), None).unwrap().unwrap();
        assert_eq!(reservation.item.data, "a");
        queue.confirm(reservation.xid).unwrap();
        assert_eq!(queue.confirm(reservation.xid).unwrap_err().kind(), ErrorKind::NotFound);

        let stats = queue.peek().unwrap();
        assert_eq!(stats.items, 1);
        assert_eq!(stats.open_reservations, 0);
        assert_eq!(stats.total_confirmed, 1);
        queue.close().unwrap();
    }

    #[test]
    fn test_wait_times_out_empty() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, QueueConfig::default());
        let started = Instant::now();
        let result = queue.get(ClientId(1), Some(Duration::from_millis(50))).unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(queue.peek().unwrap().open_reservations, 0);
    }

    #[test]
    fn test_waiter_is_woken_by_add() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(open(&dir, QueueConfig::default()));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get(ClientId(9), Some(Duration::from_secs(5))).unwrap())
        };
        while queue.peek().unwrap().waiters == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        queue.add("wake", None).unwrap();

        let reservation = consumer.join().unwrap().unwrap();
        assert_eq!(reservation.item.data, "wake");
        assert_eq!(queue.peek().unwrap().open_reservations, 1);
    }

    #[test]
    fn test_reopen_restores_items_and_returns_reservations() {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig {
            sync_journal: SyncPolicy::Always,
            ..Default::default()
        };
        {
            let queue = open(&dir, config.clone());
            for payload in ["1", "2", "3"] {
                queue.add(payload, None).unwrap();
            }
            queue.get(ClientId(1), None).unwrap().unwrap();
        }

        let queue = open(&dir, config);
        let stats = queue.peek().unwrap();
        assert_eq!(stats.items, 3);
        assert_eq!(stats.open_reservations, 0);
        assert_eq!(queue.get(ClientId(2), None).unwrap().unwrap().item.id, 1);
        assert_eq!(queue.add("4", None).unwrap(), 4);
    }

    #[test]
    fn test_erase_refused_with_open_reservations() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, QueueConfig::default());
        queue.add("a", None).unwrap();
        let reservation = queue.get(ClientId(1), None).unwrap().unwrap();

        assert_eq!(queue.erase().unwrap_err().kind(), ErrorKind::Validation);
        queue.confirm(reservation.xid).unwrap();
        queue.erase().unwrap();
        assert!(!dir.path().join("jobs").exists());
        assert_eq!(queue.add("b", None).unwrap_err().kind(), ErrorKind::Durability);
    }

    #[test]
    fn test_idle_erase_keeps_queue_with_items() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, QueueConfig::default());
        assert_eq!(queue.add("late", None).unwrap(), 1);

        assert!(!queue.erase_if_idle(Duration::ZERO).unwrap());
        assert!(dir.path().join("jobs").exists());
        let reservation = queue.get(ClientId(1), None).unwrap().unwrap();
        assert_eq!(reservation.item.data, "late");

        assert!(!queue.erase_if_idle(Duration::ZERO).unwrap());
        queue.confirm(reservation.xid).unwrap();
        thread::sleep(Duration::from_millis(5));
        assert!(queue.erase_if_idle(Duration::ZERO).unwrap());
        assert!(!dir.path().join("jobs").exists());
    }

    #[test]
    fn test_idle_erase_keeps_queue_with_waiter() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(open(&dir, QueueConfig::default()));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get(ClientId(3), Some(Duration::from_secs(5))).unwrap())
        };
        while queue.peek().unwrap().waiters == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(!queue.erase_if_idle(Duration::ZERO).unwrap());
        queue.add("for the waiter", None).unwrap();
        assert!(consumer.join().unwrap().is_some());
    }

    struct CountingHandler(AtomicUsize);

    impl ExpiryHandler for CountingHandler {
        fn on_expired(&self, source: &str, target: &str, items: Vec<Item>) {
            assert_eq!(source, "jobs");
            assert_eq!(target, "dead");
            self.0.fetch_add(items.len(), Ordering::SeqCst);
        }
    }

    #[test]
    fn test_expired_items_go_to_handler() {
        let dir = TempDir::new().unwrap();
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let weak: Weak<dyn ExpiryHandler> = Arc::downgrade(&handler) as Weak<dyn ExpiryHandler>;
        let queue = PersistentQueue::open_with(
            "jobs",
            dir.path(),
            QueueConfig {
                expire_to_queue: Some("dead".to_string()),
                ..Default::default()
            },
            Some(weak),
        )
        .unwrap();

        let past = Utc::now() - chrono::Duration::seconds(1);
        queue.add("a", Some(past)).unwrap();
        queue.add("b", Some(past)).unwrap();
        assert_eq!(queue.expire_sweep(Utc::now()).unwrap(), 2);
        assert_eq!(handler.0.load(Ordering::SeqCst), 2);
        assert_eq!(queue.peek().unwrap().total_expired, 2);
    }
}
