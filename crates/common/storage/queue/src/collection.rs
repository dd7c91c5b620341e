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

//! The registry of named queues under one directory.
//!
//! Queues are created on first use and recovered from their journals on
//! startup. A queue named `parent+suffix` is a fanout child of `parent`:
//! every item enqueued to the parent is copied to each child.
//!
//! The name map is locked only to look up, insert or remove a queue. Queue
//! operations themselves run against an `Arc` taken out of the map, so a slow
//! queue never holds up the others. Opening a queue replays its journal
//! outside the map lock; concurrent opens of one name wait on a per-name gate.

use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, info, warn};

use crate::{
    QueueConfig, QueueConfigTable,
    error::{
        InvalidNameSnafu, IoSnafu, QueueClosedSnafu, QueueError, Result, TooLargeSnafu,
        UnknownQueueSnafu,
    },
    item::Item,
    journal::COMPACT_SUFFIX,
    queue::{ExpiryHandler, PersistentQueue},
    reservation::{ClientId, Reservation},
    state::QueueStats,
};

/// Separates a fanout parent from its child suffix.
pub const FANOUT_DELIMITER: char = '+';

/// The parent of fanout child `name`, if it is one.
pub fn fanout_parent(name: &str) -> Option<&str> {
    name.split_once(FANOUT_DELIMITER)
        .map(|(parent, _)| parent)
        .filter(|parent| !parent.is_empty())
}

/// Checks that `name` can be used as a queue and journal file name.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &'static str| {
        InvalidNameSnafu {
            name: name.to_string(),
            reason,
        }
        .fail()
    };
    if name.is_empty() {
        return invalid("empty");
    }
    if name.len() > 255 {
        return invalid("longer than 255 bytes");
    }
    if name.starts_with('.') {
        return invalid("starts with '.'");
    }
    if name.ends_with(COMPACT_SUFFIX) {
        return invalid("reserved suffix");
    }
    if name.starts_with(FANOUT_DELIMITER) || name.ends_with(FANOUT_DELIMITER) {
        return invalid("empty fanout parent or suffix");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | FANOUT_DELIMITER))
    {
        return invalid("only ASCII letters, digits and _ - . : + are allowed");
    }
    Ok(())
}

/// Result of an enqueue. Fanout copies are best effort: a child that rejects
/// its copy is reported here and does not fail the enqueue.
#[derive(Debug)]
pub struct Enqueued {
    /// Id in the named queue, `None` for a fanout-only parent.
    pub id:              Option<u64>,
    pub fanout_failures: Vec<(String, QueueError)>,
}

/// What one expiration sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    /// Queues dropped for exceeding `max_queue_age` while empty.
    pub dropped: Vec<String>,
}

struct Inner {
    base_dir:      PathBuf,
    table:         RwLock<Arc<QueueConfigTable>>,
    queues:        RwLock<HashMap<String, Arc<PersistentQueue>>>,
    /// Parent name to child names. Derived from queue names, so it survives
    /// restarts without being stored.
    fanout:        RwLock<HashMap<String, BTreeSet<String>>>,
    /// One gate per name being opened. Only the holder of the registered
    /// gate may open the queue.
    opening:       Mutex<HashMap<String, Arc<Mutex<()>>>>,
    shutting_down: AtomicBool,
    /// Handed to every queue for expired-item routing.
    this:          Weak<Self>,
}

#[derive(Clone)]
pub struct QueueCollection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for QueueCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueCollection")
            .field("base_dir", &self.inner.base_dir)
            .field("queues", &self.inner.queues.read().len())
            .finish()
    }
}

impl QueueCollection {
    /// Opens every journal under `base_dir`, creating the directory if
    /// needed. Leftovers of interrupted rewrites are deleted.
    pub fn open(base_dir: impl AsRef<Path>, table: QueueConfigTable) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).context(IoSnafu {
            path: base_dir.clone(),
        })?;

        let inner = Arc::new_cyclic(|this| Inner {
            base_dir: base_dir.clone(),
            table: RwLock::new(Arc::new(table)),
            queues: RwLock::new(HashMap::new()),
            fanout: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            this: this.clone(),
        });
        let collection = Self { inner };

        for name in collection.scan()? {
            collection.inner.queue(&name)?;
        }
        info!(
            path = ?base_dir,
            queues = collection.inner.queues.read().len(),
            "Queue collection opened"
        );
        Ok(collection)
    }

    /// Journal names under the base directory, removing stale rewrite files.
    fn scan(&self) -> Result<Vec<String>> {
        let dir = &self.inner.base_dir;
        let entries = fs::read_dir(dir).context(IoSnafu { path: dir.clone() })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.context(IoSnafu { path: dir.clone() })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if name.ends_with(COMPACT_SUFFIX) {
                warn!(path = ?path, "Removing leftover journal rewrite");
                fs::remove_file(&path).context(IoSnafu { path: path.clone() })?;
                continue;
            }
            match validate_name(name) {
                Ok(()) => names.push(name.to_string()),
                Err(e) => warn!(path = ?path, error = %e, "Ignoring file in queue directory"),
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn base_dir(&self) -> &Path { &self.inner.base_dir }

    /// The queue called `name`, created on first use.
    pub fn queue(&self, name: &str) -> Result<Arc<PersistentQueue>> { self.inner.queue(name) }

    /// The queue called `name` if it already exists.
    pub fn existing(&self, name: &str) -> Result<Arc<PersistentQueue>> {
        self.inner
            .queues
            .read()
            .get(name)
            .cloned()
            .context(UnknownQueueSnafu { name })
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn fanout_children(&self, name: &str) -> Vec<String> {
        self.inner
            .fanout
            .read()
            .get(name)
            .map(|children| children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Adds an item to `name` and copies it to every fanout child.
    pub fn enqueue(
        &self,
        name: &str,
        data: impl Into<Bytes>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Enqueued> {
        let data = data.into();
        let queue = self.queue(name)?;
        let config = queue.config();
        ensure!(
            config.item_fits(data.len()),
            TooLargeSnafu {
                queue: name,
                size:  data.len(),
                limit: config.item_limit(),
            }
        );

        let id = if config.fanout_only {
            None
        } else {
            Some(queue.add(data.clone(), expires_at)?)
        };

        let mut fanout_failures = Vec::new();
        for child in self.fanout_children(name) {
            let result = self
                .queue(&child)
                .and_then(|child_queue| child_queue.add(data.clone(), expires_at));
            if let Err(e) = result {
                warn!(queue = %name, child = %child, error = %e, "Fanout copy failed");
                fanout_failures.push((child, e));
            }
        }
        Ok(Enqueued {
            id,
            fanout_failures,
        })
    }

    /// Reserves the head of `name`. Dequeuing from a queue that does not
    /// exist yet creates it, so a waiting client sees the first add.
    pub fn dequeue(
        &self,
        name: &str,
        client: ClientId,
        wait: Option<Duration>,
    ) -> Result<Option<Reservation>> {
        self.queue(name)?.get(client, wait)
    }

    pub fn confirm(&self, name: &str, xid: u64) -> Result<()> { self.existing(name)?.confirm(xid) }

    pub fn abort(&self, name: &str, xid: u64) -> Result<()> { self.existing(name)?.abort(xid) }

    pub fn peek(&self, name: &str) -> Result<QueueStats> { self.existing(name)?.peek() }

    pub fn peek_item(&self, name: &str) -> Result<Option<Item>> { self.existing(name)?.peek_item() }

    pub fn flush(&self, name: &str) -> Result<()> { self.existing(name)?.flush() }

    /// Forces every queue's journal to disk.
    pub fn flush_all(&self) -> Result<()> {
        for queue in self.snapshot() {
            queue.flush()?;
        }
        Ok(())
    }

    pub fn purge(&self, name: &str) -> Result<u64> { self.existing(name)?.purge() }

    /// Returns every reservation `client` holds, on every queue. Called when a
    /// client disconnects.
    pub fn release_client(&self, client: ClientId) -> usize {
        let mut released = 0;
        for queue in self.snapshot() {
            match queue.abort_client(client) {
                Ok(count) => released += count,
                Err(e) => {
                    warn!(queue = %queue.name(), %client, error = %e, "Failed to release client");
                }
            }
        }
        if released > 0 {
            debug!(%client, released, "Released client reservations");
        }
        released
    }

    /// Closes `name` and deletes its journal. Refused while it has open
    /// reservations.
    pub fn drop_queue(&self, name: &str) -> Result<()> {
        let queue = self.existing(name)?;
        queue.erase()?;
        self.forget(&queue);
        info!(queue = %name, "Dropped queue");
        Ok(())
    }

    /// Removes an erased queue from the registry and its fanout parent.
    fn forget(&self, queue: &Arc<PersistentQueue>) {
        let name = queue.name();
        {
            let mut queues = self.inner.queues.write();
            if queues.get(name).is_some_and(|current| Arc::ptr_eq(current, queue)) {
                queues.remove(name);
            }
        }
        if let Some(parent) = fanout_parent(name) {
            let mut fanout = self.inner.fanout.write();
            if let Some(children) = fanout.get_mut(parent) {
                children.remove(name);
                if children.is_empty() {
                    fanout.remove(parent);
                }
            }
        }
    }

    /// Installs a new configuration table and applies it to `name`, or to
    /// every open queue. Queues are never removed by a reload.
    pub fn reload(&self, name: Option<&str>, table: QueueConfigTable) -> Result<()> {
        let table = Arc::new(table);
        *self.inner.table.write() = Arc::clone(&table);
        match name {
            Some(name) => self.existing(name)?.reload(table.resolve(name))?,
            None => {
                for queue in self.snapshot() {
                    queue.reload(table.resolve(queue.name()))?;
                }
            }
        }
        info!(queue = ?name, "Reloaded queue configuration");
        Ok(())
    }

    /// Expires items across all queues, then drops queues that have sat
    /// empty and idle past their `max_queue_age`.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for queue in self.snapshot() {
            match queue.expire_sweep(now) {
                Ok(count) => report.expired += count,
                Err(e) => warn!(queue = %queue.name(), error = %e, "Expiration sweep failed"),
            }

            let Some(max_age) = queue.config().max_queue_age else {
                continue;
            };
            match queue.erase_if_idle(max_age) {
                Ok(true) => {
                    self.forget(&queue);
                    info!(queue = %queue.name(), "Dropped idle queue");
                    report.dropped.push(queue.name().to_string());
                }
                Ok(false) => {}
                Err(e) => debug!(queue = %queue.name(), error = %e, "Idle queue not dropped"),
            }
        }
        if report.expired > 0 || !report.dropped.is_empty() {
            info!(expired = report.expired, dropped = ?report.dropped, "Expiration sweep finished");
        }
        report
    }

    /// Closes every queue. Later lookups fail with `QueueClosed`.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let queues: Vec<Arc<PersistentQueue>> =
            self.inner.queues.write().drain().map(|(_, queue)| queue).collect();
        let mut first_error = None;
        for queue in queues {
            if let Err(e) = queue.close() {
                warn!(queue = %queue.name(), error = %e, "Failed to close queue");
                first_error.get_or_insert(e);
            }
        }
        self.inner.fanout.write().clear();
        info!("Queue collection shut down");
        first_error.map_or(Ok(()), Err)
    }

    fn snapshot(&self) -> Vec<Arc<PersistentQueue>> {
        self.inner.queues.read().values().cloned().collect()
    }
}

impl Inner {
    fn queue(&self, name: &str) -> Result<Arc<PersistentQueue>> {
        if let Some(queue) = self.queues.read().get(name) {
            return Ok(Arc::clone(queue));
        }
        validate_name(name)?;

        loop {
            let gate = Arc::clone(self.opening.lock().entry(name.to_string()).or_default());
            let _opening = gate.lock();
            // a gate retired while we waited on it no longer guards the name
            let current = self
                .opening
                .lock()
                .get(name)
                .is_some_and(|registered| Arc::ptr_eq(registered, &gate));
            if !current {
                continue;
            }
            let result = self.open_queue(name);
            self.opening.lock().remove(name);
            return result;
        }
    }

    /// Opens and registers `name`. Called with the name's gate held.
    fn open_queue(&self, name: &str) -> Result<Arc<PersistentQueue>> {
        if let Some(queue) = self.queues.read().get(name) {
            return Ok(Arc::clone(queue));
        }
        ensure!(
            !self.shutting_down.load(Ordering::SeqCst),
            QueueClosedSnafu { queue: name }
        );

        let config = self.config_for(name);
        let expiry: Weak<dyn ExpiryHandler> = self.this.clone();
        let queue = Arc::new(PersistentQueue::open_with(
            name,
            &self.base_dir,
            config,
            Some(expiry),
        )?);
        {
            let mut queues = self.queues.write();
            if self.shutting_down.load(Ordering::SeqCst) {
                drop(queues);
                if let Err(e) = queue.close() {
                    warn!(queue = %name, error = %e, "Failed to close queue opened during shutdown");
                }
                return QueueClosedSnafu { queue: name }.fail();
            }
            queues.insert(name.to_string(), Arc::clone(&queue));
        }

        if let Some(parent) = fanout_parent(name) {
            self.fanout
                .write()
                .entry(parent.to_string())
                .or_default()
                .insert(name.to_string());
            debug!(parent, child = %name, "Registered fanout child");
        }
        Ok(queue)
    }

    fn config_for(&self, name: &str) -> QueueConfig { self.table.read().resolve(name) }
}

impl ExpiryHandler for Inner {
    fn on_expired(&self, source: &str, target: &str, items: Vec<Item>) {
        let queue = match self.queue(target) {
            Ok(queue) => queue,
            Err(e) => {
                warn!(queue = %source, target, error = %e, count = items.len(), "Dropping expired items");
                return;
            }
        };
        let count = items.len();
        for item in items {
            if let Err(e) = queue.add(item.data, None) {
                warn!(queue = %source, target, id = item.id, error = %e, "Failed to move expired item");
            }
        }
        debug!(queue = %source, target, count, "Moved expired items");
    }
}
