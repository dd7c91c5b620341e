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

//! Durable reliable-delivery queues.
//!
//! ```text
//! ┌─────────────────┐  enqueue / dequeue / confirm / abort
//! │ QueueCollection │ ──────────────────────────────┐
//! └─────────────────┘                               ▼
//!          │ fanout copies           ┌─────────────────────────┐
//!          └───────────────────────► │ PersistentQueue (named) │
//!                                    └────────────┬────────────┘
//!                                                 │ commands
//!                                    ┌────────────▼────────────┐
//!                                    │ QueueWorker (own thread)│
//!                                    │  MemoryBuffer           │
//!                                    │  ReservationTable       │
//!                                    │  Journal ─► <dir>/<name>│
//!                                    └─────────────────────────┘
//! ```
//!
//! Every state change is appended to the queue's journal before it is
//! acknowledged, and replaying the journal rebuilds the queue after a
//! restart. Items are handed out as reservations that must be confirmed;
//! aborted or abandoned reservations return to the head of the queue.

mod collection;
mod config;
mod crc;
mod error;
mod item;
mod journal;
mod memory;
mod queue;
mod queue_worker;
mod record;
mod replay;
mod reservation;
mod state;

pub use collection::{
    Enqueued, FANOUT_DELIMITER, QueueCollection, SweepReport, fanout_parent, validate_name,
};
pub use config::{QueueConfig, QueueConfigOverride, QueueConfigTable, SyncPolicy};
pub use error::{ErrorKind, QueueError, Result};
pub use item::Item;
pub use journal::{COMPACT_SUFFIX, Checkpoint, Journal, JournalReader, ReadOutcome, compact_path};
pub use memory::MemoryBuffer;
pub use queue::{ExpiryHandler, PersistentQueue};
pub use record::{HEADER_LEN, JournalRecord, MAX_ITEM_LEN};
pub use replay::{JournalSummary, ReplayReport, inspect};
pub use reservation::{ClientId, Reservation, ReservationTable};
pub use state::QueueStats;
