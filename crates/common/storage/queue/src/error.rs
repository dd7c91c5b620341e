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

use std::path::PathBuf;

use snafu::Snafu;

use crate::reservation::ClientId;

/// Coarse classification of [`QueueError`], used by callers to map errors
/// onto protocol responses without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is unacceptable. Nothing was changed.
    Validation,
    /// A configured limit would be exceeded. Nothing was changed.
    Capacity,
    /// The named queue or reservation does not exist.
    NotFound,
    /// The journal could not be written or read; the queue is closed.
    Durability,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    #[snafu(display("Item of {size} bytes exceeds the {limit} byte item limit of queue {queue}"))]
    TooLarge {
        queue: String,
        size:  usize,
        limit: u64,
        #[snafu(implicit)]
        loc:   snafu::Location,
    },

    #[snafu(display("Queue {queue} is full"))]
    QueueFull {
        queue: String,
        #[snafu(implicit)]
        loc:   snafu::Location,
    },

    #[snafu(display("Client {client} already holds {limit} open reservations on queue {queue}"))]
    TooManyOpenTransactions {
        queue:  String,
        client: ClientId,
        limit:  usize,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("No open reservation {xid} on queue {queue}"))]
    ReservationNotFound {
        queue: String,
        xid:   u64,
        #[snafu(implicit)]
        loc:   snafu::Location,
    },

    #[snafu(display("Unknown queue {name}"))]
    UnknownQueue {
        name: String,
        #[snafu(implicit)]
        loc:  snafu::Location,
    },

    #[snafu(display("Invalid queue name {name:?}: {reason}"))]
    InvalidName {
        name:   String,
        reason: &'static str,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Queue {queue} still has {open} open reservations"))]
    QueueBusy {
        queue: String,
        open:  usize,
        #[snafu(implicit)]
        loc:   snafu::Location,
    },

    #[snafu(display("Journal I/O failed at {}", path.display()))]
    Io {
        path:   PathBuf,
        #[snafu(source)]
        source: std::io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Journal {} is corrupted at offset {offset}: {reason}", path.display()))]
    JournalCorrupted {
        path:   PathBuf,
        offset: u64,
        reason: String,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    #[snafu(display("Queue {queue} is closed"))]
    QueueClosed {
        queue: String,
        #[snafu(implicit)]
        loc:   snafu::Location,
    },
}

impl QueueError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::TooLarge { .. } | Self::InvalidName { .. } | Self::QueueBusy { .. } => {
                ErrorKind::Validation
            }
            Self::QueueFull { .. } | Self::TooManyOpenTransactions { .. } => ErrorKind::Capacity,
            Self::ReservationNotFound { .. } | Self::UnknownQueue { .. } => ErrorKind::NotFound,
            Self::Io { .. } | Self::JournalCorrupted { .. } | Self::QueueClosed { .. } => {
                ErrorKind::Durability
            }
        }
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
