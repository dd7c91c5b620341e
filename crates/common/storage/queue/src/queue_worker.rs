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

//! The single writer behind every [`PersistentQueue`](crate::PersistentQueue).
//!
//! ```text
//! ┌──────────────┐    crossbeam     ┌──────────────┐   append    ┌──────────┐
//! │   callers    │ ──── channel ──► │ QueueWorker  │ ──────────► │ journal  │
//! │ (any thread) │ ◄── reply(1) ─── │ (own thread) │             └──────────┘
//! └──────────────┘                  └──────────────┘
//! ```
//!
//! Commands are applied one at a time, so journal order is application
//! order. Dequeues that may wait are parked here rather than blocking the
//! worker; they are served when an item arrives and answered empty at their
//! deadline. The idle timeout also drives interval journal syncs.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use chrono::Utc;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::{
    error::{QueueClosedSnafu, QueueError, Result},
    item::Item,
    reservation::{ClientId, Reservation},
    state::QueueState,
};

/// A reply together with any items that expired while producing it. The
/// caller routes expired items, never the worker.
pub(crate) struct Outcome<T> {
    pub result:  Result<T>,
    pub expired: Vec<Item>,
}

pub(crate) type Op = Box<dyn FnOnce(&mut QueueState) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownMode {
    Close,
    Erase,
    /// Erase only if the queue is empty, unreserved, unwatched and has seen
    /// no add for longer than the given age.
    EraseIfIdle(Duration),
}

pub(crate) enum Command {
    /// Run against the state, then serve waiters and check for a rewrite.
    Exec(Op),
    Get {
        client:   ClientId,
        deadline: Option<Instant>,
        reply:    Sender<Outcome<Option<Reservation>>>,
    },
    /// Number of parked dequeues.
    Waiters(Sender<usize>),
    /// Replies `Ok(true)` once the worker has stopped, `Ok(false)` when an
    /// idle erase found the queue in use.
    Shutdown {
        mode:  ShutdownMode,
        reply: Sender<Result<bool>>,
    },
}

struct Waiter {
    client:   ClientId,
    deadline: Instant,
    reply:    Sender<Outcome<Option<Reservation>>>,
    /// Items that expired while this dequeue looked for a head, handed to
    /// the caller with whatever answer it finally gets.
    expired:  Vec<Item>,
}

pub(crate) struct QueueWorker {
    state:   QueueState,
    rx:      Receiver<Command>,
    waiters: VecDeque<Waiter>,
}

impl QueueWorker {
    pub(crate) const fn new(state: QueueState, rx: Receiver<Command>) -> Self {
        Self {
            state,
            rx,
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn run(mut self) {
        info!(queue = %self.state.name(), "Queue worker starting");

        loop {
            let received = match self.next_deadline() {
                Some(deadline) => self.rx.recv_deadline(deadline),
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(Command::Exec(op)) => {
                    op(&mut self.state);
                    self.serve_waiters();
                    self.maybe_rewrite();
                }
                Ok(Command::Get {
                    client,
                    deadline,
                    reply,
                }) => self.get(client, deadline, reply),
                Ok(Command::Waiters(reply)) => {
                    let _ = reply.send(self.waiters.len());
                }
                Ok(Command::Shutdown { mode, reply }) => {
                    let result = self.shutdown(mode);
                    if matches!(result, Ok(false) | Err(QueueError::QueueBusy { .. })) {
                        let _ = reply.send(result);
                        continue;
                    }
                    self.close_waiters();
                    let _ = reply.send(result);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!(queue = %self.state.name(), "Queue handle dropped");
                    if let Err(e) = self.state.close() {
                        error!(queue = %self.state.name(), error = %e, "Failed to close journal");
                    }
                    self.close_waiters();
                    break;
                }
            }
            self.on_tick();
        }

        info!(queue = %self.state.name(), "Queue worker stopped");
    }

    fn shutdown(&mut self, mode: ShutdownMode) -> Result<bool> {
        match mode {
            ShutdownMode::Close => self.state.close().map(|()| true),
            ShutdownMode::Erase => self.state.erase().map(|()| true),
            ShutdownMode::EraseIfIdle(max_age) => {
                if !self.waiters.is_empty() || !self.state.is_idle(max_age, Utc::now()) {
                    return Ok(false);
                }
                self.state.erase().map(|()| true)
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let waiter = self.waiters.iter().map(|waiter| waiter.deadline).min();
        match (waiter, self.state.sync_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Answers waiters whose deadline passed and performs due syncs.
    fn on_tick(&mut self) {
        let now = Instant::now();
        let mut index = 0;
        while index < self.waiters.len() {
            if self.waiters[index].deadline <= now {
                if let Some(waiter) = self.waiters.remove(index) {
                    debug!(queue = %self.state.name(), client = %waiter.client, "Dequeue wait timed out");
                    let _ = waiter.reply.send(Outcome {
                        result:  Ok(None),
                        expired: waiter.expired,
                    });
                }
            } else {
                index += 1;
            }
        }
        self.state.check_sync();
    }

    fn get(
        &mut self,
        client: ClientId,
        deadline: Option<Instant>,
        reply: Sender<Outcome<Option<Reservation>>>,
    ) {
        let mut expired = Vec::new();
        let result = self.state.get(client, Utc::now(), &mut expired);
        match (result, deadline) {
            (Ok(None), Some(deadline)) if deadline > Instant::now() => {
                self.waiters.push_back(Waiter {
                    client,
                    deadline,
                    reply,
                    expired,
                });
            }
            (result, _) => {
                let delivered = result.as_ref().ok().cloned().flatten();
                if reply.send(Outcome { result, expired }).is_err()
                    && let Some(reservation) = delivered
                {
                    self.hand_back(reservation.xid);
                }
            }
        }
        self.maybe_rewrite();
    }

    /// Hands pending items to parked dequeues in arrival order.
    fn serve_waiters(&mut self) {
        while self.state.has_pending() {
            let Some(mut waiter) = self.waiters.pop_front() else {
                break;
            };
            match self.state.get(waiter.client, Utc::now(), &mut waiter.expired) {
                Ok(None) => {
                    self.waiters.push_front(waiter);
                    break;
                }
                result => {
                    let delivered = result.as_ref().ok().cloned().flatten();
                    let outcome = Outcome {
                        result,
                        expired: std::mem::take(&mut waiter.expired),
                    };
                    if waiter.reply.send(outcome).is_err()
                        && let Some(reservation) = delivered
                    {
                        self.hand_back(reservation.xid);
                    }
                }
            }
        }
    }

    /// Returns a reservation whose caller went away before receiving it.
    fn hand_back(&mut self, xid: u64) {
        debug!(queue = %self.state.name(), xid, "Dequeue caller gone, returning item");
        if let Err(e) = self.state.abort(xid) {
            warn!(queue = %self.state.name(), xid, error = %e, "Failed to return undelivered item");
        }
    }

    fn maybe_rewrite(&mut self) {
        if let Err(e) = self.state.maybe_rewrite() {
            error!(queue = %self.state.name(), error = %e, "Journal rewrite failed");
        }
    }

    fn close_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.reply.send(Outcome {
                result:  QueueClosedSnafu {
                    queue: self.state.name(),
                }
                .fail(),
                expired: waiter.expired,
            });
        }
    }
}
