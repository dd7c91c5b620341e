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

//! The state of one queue and every operation that mutates it.
//!
//! [`QueueState`] is only ever touched by its queue worker thread. Each
//! mutation appends its journal record first and changes memory only once
//! the append succeeded, so the journal never lags what clients observed.
//!
//! ## Read-behind
//!
//! Pending items live in the [`MemoryBuffer`] until resident bytes would pass
//! `max_memory_size`. From then on new items are journaled but not kept; a
//! [`JournalReader`] positioned at the first non-resident add refills the
//! buffer as the head is consumed, and is dropped once it reaches the end of
//! the journal. `items`/`bytes` always count every pending item, resident or
//! not.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use snafu::ensure;
use tracing::{debug, error, info, warn};

use crate::{
    QueueConfig,
    error::{
        JournalCorruptedSnafu, QueueBusySnafu, QueueClosedSnafu, QueueError, QueueFullSnafu,
        ReservationNotFoundSnafu, Result, TooLargeSnafu, TooManyOpenTransactionsSnafu,
    },
    item::{Item, clamp_expiry},
    journal::{Checkpoint, Journal, JournalReader, ReadOutcome},
    memory::MemoryBuffer,
    record::JournalRecord,
    reservation::{ClientId, Reservation, ReservationTable},
};

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Pending items, resident or not.
    pub items:             u64,
    /// Bytes of pending items.
    pub bytes:             u64,
    pub open_reservations: usize,
    /// Age of the pending head.
    pub oldest_age:        Option<Duration>,
    pub journal_size:      u64,
    pub memory_items:      usize,
    pub memory_bytes:      u64,
    pub read_behind:       bool,
    /// Dequeues parked waiting for an item.
    pub waiters:           usize,
    /// Time since the queue was opened or last received an item.
    pub idle_for:          Duration,
    pub total_added:       u64,
    pub total_expired:     u64,
    pub total_discarded:   u64,
    pub total_confirmed:   u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    added:     u64,
    expired:   u64,
    discarded: u64,
    confirmed: u64,
}

pub(crate) struct QueueState {
    name:          String,
    config:        Arc<QueueConfig>,
    memory:        MemoryBuffer,
    /// Set while some pending items are only in the journal.
    behind:        Option<JournalReader>,
    reservations:  ReservationTable,
    journal:       Option<Journal>,
    /// End of the record being replayed; bounds read-behind during replay.
    replay_cursor: Option<u64>,
    next_id:       u64,
    next_xid:      u64,
    items:         u64,
    bytes:         u64,
    closed:        bool,
    counters:      Counters,
    last_activity: DateTime<Utc>,
}

impl QueueState {
    pub(crate) fn new(name: String, config: Arc<QueueConfig>, journal: Option<Journal>) -> Self {
        Self {
            name,
            config,
            memory: MemoryBuffer::new(),
            behind: None,
            reservations: ReservationTable::new(),
            journal,
            replay_cursor: None,
            next_id: 1,
            next_xid: 1,
            items: 0,
            bytes: 0,
            closed: false,
            counters: Counters::default(),
            last_activity: Utc::now(),
        }
    }

    pub(crate) fn name(&self) -> &str { &self.name }

    pub(crate) const fn config(&self) -> &Arc<QueueConfig> { &self.config }

    pub(crate) const fn next_id(&self) -> u64 { self.next_id }

    pub(crate) const fn next_xid(&self) -> u64 { self.next_xid }

    pub(crate) const fn items(&self) -> u64 { self.items }

    pub(crate) const fn bytes(&self) -> u64 { self.bytes }

    pub(crate) fn open_reservations(&self) -> usize { self.reservations.len() }

    pub(crate) const fn has_pending(&self) -> bool { self.items > 0 }

    pub(crate) fn journal_mut(&mut self) -> Option<&mut Journal> { self.journal.as_mut() }

    pub(crate) fn take_journal(&mut self) -> Option<Journal> { self.journal.take() }

    pub(crate) fn set_replay_cursor(&mut self, cursor: Option<u64>) { self.replay_cursor = cursor; }

    /// Items pending in id order, resident ones only.
    pub(crate) fn resident(&self) -> impl Iterator<Item = &Item> { self.memory.iter() }

    fn read_behind_allowed(&self) -> bool { self.config.keep_journal && self.journal.is_some() }

    // ---------------------------------------------------------------------
    // Replay
    // ---------------------------------------------------------------------

    /// Applies one journal record whose frame starts at `frame_start`.
    pub(crate) fn apply(&mut self, record: JournalRecord, frame_start: u64) -> Result<()> {
        match record {
            JournalRecord::Add(item) => {
                self.next_id = self.next_id.max(item.id + 1);
                self.items += 1;
                self.bytes += item.size();
                self.last_activity = item.added_at;
                self.admit(item, frame_start)?;
            }
            JournalRecord::Remove => {
                if self.take_head()?.is_none() {
                    warn!(queue = %self.name, offset = frame_start, "Remove replayed on an empty queue");
                }
            }
            JournalRecord::RemoveTentative(xid) => {
                self.next_xid = self.next_xid.max(xid + 1);
                match self.take_head()? {
                    Some(item) => self.reservations.insert(xid, item, ClientId::RECOVERED),
                    None => {
                        warn!(queue = %self.name, xid, "Reservation replayed on an empty queue");
                    }
                }
            }
            JournalRecord::Confirm(xid) => {
                if self.reservations.remove(xid).is_none() {
                    warn!(queue = %self.name, xid, "Confirm replayed for an unknown reservation");
                }
            }
            JournalRecord::Unremove(xid) => match self.reservations.remove(xid) {
                Some(item) => self.restore(item),
                None => warn!(queue = %self.name, xid, "Unremove replayed for an unknown reservation"),
            },
            JournalRecord::SavedXid(xid) => self.next_xid = self.next_xid.max(xid),
            JournalRecord::Continue { next_id, next_xid } => {
                self.next_id = self.next_id.max(next_id);
                self.next_xid = self.next_xid.max(next_xid);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------

    pub(crate) fn add(
        &mut self,
        data: Bytes,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.ensure_open()?;
        let size = data.len();
        ensure!(
            self.config.item_fits(size),
            TooLargeSnafu {
                queue: &self.name,
                size,
                limit: self.config.item_limit(),
            }
        );
        let size = size as u64;

        if !self.config.fits(self.items + 1, self.bytes + size) {
            ensure!(
                self.config.discard_old_when_full && self.config.fits(1, size),
                QueueFullSnafu { queue: &self.name }
            );
            while !self.config.fits(self.items + 1, self.bytes + size) {
                self.journal(&JournalRecord::Remove)?;
                if self.take_head()?.is_none() {
                    break;
                }
                self.counters.discarded += 1;
            }
        }

        let item = Item {
            id: self.next_id,
            data,
            added_at: now,
            expires_at: clamp_expiry(expires_at, self.config.max_age, now),
        };
        let frame_start = self.journal_size();
        self.journal(&JournalRecord::Add(item.clone()))?;

        let id = item.id;
        self.next_id += 1;
        self.items += 1;
        self.bytes += size;
        self.counters.added += 1;
        self.last_activity = now;
        self.admit(item, frame_start)?;
        debug!(queue = %self.name, id, size, "Added item");
        Ok(id)
    }

    /// Reserves the pending head for `client`. Expired heads met on the way
    /// are removed and pushed onto `expired`.
    pub(crate) fn get(
        &mut self,
        client: ClientId,
        now: DateTime<Utc>,
        expired: &mut Vec<Item>,
    ) -> Result<Option<Reservation>> {
        self.ensure_open()?;
        let limit = self.config.max_open_transactions;
        ensure!(
            self.reservations.can_reserve(client, limit),
            TooManyOpenTransactionsSnafu {
                queue: &self.name,
                client,
                limit: limit.unwrap_or(usize::MAX),
            }
        );

        if !self.discard_expired_head(now, expired)? {
            return Ok(None);
        }

        let xid = self.next_xid;
        self.journal(&JournalRecord::RemoveTentative(xid))?;
        self.next_xid += 1;
        let Some(item) = self.take_head()? else {
            return Ok(None);
        };
        self.reservations.insert(xid, item.clone(), client);
        debug!(queue = %self.name, xid, id = item.id, %client, "Reserved item");
        Ok(Some(Reservation { xid, item }))
    }

    pub(crate) fn confirm(&mut self, xid: u64) -> Result<()> {
        self.ensure_open()?;
        self.ensure_reserved(xid)?;
        self.journal(&JournalRecord::Confirm(xid))?;
        self.reservations.remove(xid);
        self.counters.confirmed += 1;
        Ok(())
    }

    pub(crate) fn abort(&mut self, xid: u64) -> Result<()> {
        self.ensure_open()?;
        self.ensure_reserved(xid)?;
        self.journal(&JournalRecord::Unremove(xid))?;
        if let Some(item) = self.reservations.remove(xid) {
            self.restore(item);
        }
        Ok(())
    }

    /// Returns every reservation held by `client` to the queue.
    pub(crate) fn abort_client(&mut self, client: ClientId) -> Result<usize> {
        let xids = self.reservations.xids_for(client);
        for xid in &xids {
            self.abort(*xid)?;
        }
        if !xids.is_empty() {
            debug!(queue = %self.name, %client, count = xids.len(), "Returned client reservations");
        }
        Ok(xids.len())
    }

    /// Removes up to `limit` expired items from the head, stopping at the
    /// first live one.
    pub(crate) fn expire_sweep(
        &mut self,
        now: DateTime<Utc>,
        limit: Option<usize>,
        expired: &mut Vec<Item>,
    ) -> Result<usize> {
        self.ensure_open()?;
        let before = expired.len();
        for _ in 0..limit.unwrap_or(usize::MAX) {
            let head_expired = match self.head()? {
                Some(head) => head.is_expired(now),
                None => false,
            };
            if !head_expired {
                break;
            }
            self.expire_head(expired)?;
        }
        Ok(expired.len() - before)
    }

    pub(crate) fn peek_item(
        &mut self,
        now: DateTime<Utc>,
        expired: &mut Vec<Item>,
    ) -> Result<Option<Item>> {
        self.ensure_open()?;
        self.discard_expired_head(now, expired)?;
        Ok(self.head()?.cloned())
    }

    pub(crate) fn stats(&mut self, now: DateTime<Utc>) -> Result<QueueStats> {
        let oldest = self.head()?.map(|item| item.age(now));
        Ok(QueueStats {
            items:             self.items,
            bytes:             self.bytes,
            open_reservations: self.reservations.len(),
            oldest_age:        oldest,
            journal_size:      self.journal_size(),
            memory_items:      self.memory.len(),
            memory_bytes:      self.memory.bytes(),
            read_behind:       self.behind.is_some(),
            waiters:           0,
            idle_for:          (now - self.last_activity).to_std().unwrap_or_default(),
            total_added:       self.counters.added,
            total_expired:     self.counters.expired,
            total_discarded:   self.counters.discarded,
            total_confirmed:   self.counters.confirmed,
        })
    }

    /// Discards every pending item; open reservations are kept.
    pub(crate) fn purge(&mut self) -> Result<u64> {
        self.ensure_open()?;
        let dropped = self.items;
        self.memory.clear();
        self.behind = None;
        self.items = 0;
        self.bytes = 0;
        self.counters.discarded += dropped;
        self.rewrite()?;
        info!(queue = %self.name, dropped, "Purged queue");
        Ok(dropped)
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(journal) = self.journal.as_mut()
            && let Err(e) = journal.sync()
        {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Forces an interval sync that has fallen due.
    pub(crate) fn check_sync(&mut self) {
        if self.closed {
            return;
        }
        if let Some(journal) = self.journal.as_mut()
            && let Err(e) = journal.check_sync()
        {
            self.fail(e);
        }
    }

    pub(crate) fn sync_deadline(&self) -> Option<std::time::Instant> {
        if self.closed {
            return None;
        }
        self.journal.as_ref().and_then(Journal::sync_deadline)
    }

    /// Swaps in a new configuration and returns the one now in effect.
    /// `keep_journal` cannot change while the queue is open.
    pub(crate) fn reload(&mut self, config: QueueConfig) -> Arc<QueueConfig> {
        let mut config = config;
        if config.keep_journal != self.config.keep_journal {
            warn!(
                queue = %self.name,
                keep_journal = self.config.keep_journal,
                "keep_journal cannot change on an open queue, keeping the current value"
            );
            config.keep_journal = self.config.keep_journal;
        }
        if let Some(journal) = self.journal.as_mut() {
            journal.set_policy(config.sync_journal);
        }
        self.config = Arc::new(config);
        debug!(queue = %self.name, "Reloaded queue config");
        Arc::clone(&self.config)
    }

    /// Rewrites the journal when it has grown past what the live state needs.
    /// Never runs while reading behind: pending items must all be resident.
    pub(crate) fn maybe_rewrite(&mut self) -> Result<()> {
        if self.closed || self.behind.is_some() {
            return Ok(());
        }
        let Some(size) = self.journal.as_ref().map(Journal::size) else {
            return Ok(());
        };
        let live = self.bytes + self.reservations.bytes();
        let drained = self.items == 0 && size > self.config.default_journal_size;
        let oversized = size > self.config.max_journal_size && live < self.config.max_journal_size;
        if drained || oversized {
            self.rewrite()?;
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        self.closed = true;
        match self.journal.take() {
            Some(journal) => journal.close(),
            None => Ok(()),
        }
    }

    /// Empty, unreserved and without an add for longer than `max_age`.
    pub(crate) fn is_idle(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        let idle_for = (now - self.last_activity).to_std().unwrap_or_default();
        self.items == 0 && self.reservations.is_empty() && idle_for > max_age
    }

    /// Closes the queue and deletes its journal. Refused while reservations
    /// are open.
    pub(crate) fn erase(&mut self) -> Result<()> {
        ensure!(
            self.reservations.is_empty(),
            QueueBusySnafu {
                queue: &self.name,
                open:  self.reservations.len(),
            }
        );
        self.closed = true;
        match self.journal.take() {
            Some(journal) => journal.erase(),
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn ensure_open(&self) -> Result<()> {
        ensure!(!self.closed, QueueClosedSnafu { queue: &self.name });
        Ok(())
    }

    fn ensure_reserved(&self, xid: u64) -> Result<()> {
        ensure!(
            self.reservations.contains(xid),
            ReservationNotFoundSnafu {
                queue: &self.name,
                xid,
            }
        );
        Ok(())
    }

    fn journal_size(&self) -> u64 { self.journal.as_ref().map_or(0, Journal::size) }

    fn journal(&mut self, record: &JournalRecord) -> Result<()> {
        if let Some(journal) = self.journal.as_mut()
            && let Err(e) = journal.append(record)
        {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Closes the queue after a durability failure.
    fn fail(&mut self, err: QueueError) -> QueueError {
        if !self.closed {
            error!(queue = %self.name, error = %err, "Journal failure, closing queue");
            self.closed = true;
        }
        err
    }

    fn rewrite(&mut self) -> Result<()> {
        let checkpoint = Checkpoint {
            next_id:  self.next_id,
            next_xid: self.next_xid,
        };
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        let result = journal.rewrite(checkpoint, self.reservations.sorted(), self.memory.iter());
        result.map_err(|e| self.fail(e))
    }

    /// Places a newly counted pending item, either in memory or, past the
    /// memory budget, only in the journal.
    fn admit(&mut self, item: Item, frame_start: u64) -> Result<()> {
        if self.behind.is_some() {
            return Ok(());
        }
        let over_budget = !self.memory.is_empty()
            && self.memory.bytes() + item.size() > self.config.max_memory_size;
        if over_budget && self.read_behind_allowed() {
            if let Some(journal) = self.journal.as_ref() {
                self.behind = Some(journal.reader_at(frame_start)?);
                info!(
                    queue = %self.name,
                    resident = self.memory.bytes(),
                    offset = frame_start,
                    "Queue is over its memory budget, reading behind"
                );
            }
            return Ok(());
        }
        self.memory.push_back(item);
        Ok(())
    }

    /// Returns an item taken out of a reservation to pending.
    fn restore(&mut self, item: Item) {
        self.items += 1;
        self.bytes += item.size();
        self.memory.insert_by_id(item);
    }

    fn head(&mut self) -> Result<Option<&Item>> {
        self.refill()?;
        Ok(self.memory.front())
    }

    fn take_head(&mut self) -> Result<Option<Item>> {
        self.refill()?;
        let item = self.memory.pop_front();
        if let Some(item) = &item {
            self.items -= 1;
            self.bytes -= item.size();
        }
        Ok(item)
    }

    fn expire_head(&mut self, expired: &mut Vec<Item>) -> Result<()> {
        self.journal(&JournalRecord::Remove)?;
        if let Some(item) = self.take_head()? {
            debug!(queue = %self.name, id = item.id, "Expired item");
            self.counters.expired += 1;
            expired.push(item);
        }
        Ok(())
    }

    /// Drops expired items off the head. Returns whether a live head remains.
    fn discard_expired_head(&mut self, now: DateTime<Utc>, expired: &mut Vec<Item>) -> Result<bool> {
        loop {
            let head_expired = match self.head()? {
                None => return Ok(false),
                Some(head) => head.is_expired(now),
            };
            if !head_expired {
                return Ok(true);
            }
            self.expire_head(expired)?;
        }
    }

    /// Reads non-resident adds back into memory until the budget is used or
    /// the reader catches up with the applied end of the journal.
    fn refill(&mut self) -> Result<()> {
        if self.behind.is_none() {
            return Ok(());
        }
        let limit = self.replay_cursor.unwrap_or_else(|| self.journal_size());
        let budget = self.config.max_memory_size;
        let Some(reader) = self.behind.as_mut() else {
            return Ok(());
        };

        while reader.position() < limit
            && (self.memory.is_empty() || self.memory.bytes() < budget)
        {
            match reader.next_record()? {
                ReadOutcome::Record(JournalRecord::Add(item), _) => self.memory.push_back(item),
                ReadOutcome::Record(..) => {}
                ReadOutcome::End | ReadOutcome::Torn { .. } => {
                    return JournalCorruptedSnafu {
                        path:   self
                            .journal
                            .as_ref()
                            .map(|journal| journal.path().to_path_buf())
                            .unwrap_or_default(),
                        offset: reader.position(),
                        reason: "journal ended before read-behind caught up",
                    }
                    .fail();
                }
            }
        }

        if reader.position() >= limit {
            self.behind = None;
            info!(queue = %self.name, "Read-behind caught up with the journal");
        }
        Ok(())
    }
}
