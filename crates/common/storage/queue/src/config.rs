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

//! Per-queue configuration.
//!
//! A [`QueueConfig`] is resolved once per queue from a [`QueueConfigTable`]
//! and handed to the queue as an immutable snapshot. Reloading replaces the
//! snapshot as a whole.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

use crate::{collection::fanout_parent, record::MAX_ITEM_LEN};

const MIB: u64 = 1024 * 1024;

/// When journal writes are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Leave syncing to the OS; the journal is synced on close and flush.
    #[default]
    Never,
    /// fsync every record before the operation returns.
    Always,
    /// fsync at most this long after a record is written.
    Interval(#[serde(with = "humantime_serde")] Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of pending items. `None` is unbounded.
    pub max_items:             Option<u64>,
    /// Maximum total bytes of pending items. `None` is unbounded.
    pub max_size:              Option<u64>,
    /// Maximum size of a single item. `None` is unbounded.
    pub max_item_size:         Option<u64>,
    /// Resident bytes kept in memory before the queue reads behind from the
    /// journal.
    #[default(128 * MIB)]
    pub max_memory_size:       u64,
    /// Journal size above which an empty queue rewrites its journal.
    #[default(16 * MIB)]
    pub default_journal_size:  u64,
    /// Journal size above which a memory-resident queue rewrites its journal.
    #[default(1024 * MIB)]
    pub max_journal_size:      u64,
    /// Upper bound on any item's lifetime.
    #[serde(with = "humantime_serde")]
    pub max_age:               Option<Duration>,
    #[default(true)]
    pub keep_journal:          bool,
    pub sync_journal:          SyncPolicy,
    /// Evict the oldest items instead of rejecting adds when full.
    pub discard_old_when_full: bool,
    /// Queue that receives expired items. Expired items are dropped if unset.
    pub expire_to_queue:       Option<String>,
    /// Items examined per queue by one expiration sweep. `None` is unbounded.
    pub max_expire_sweep:      Option<usize>,
    /// Only copy items to fanout children, never store them here.
    pub fanout_only:           bool,
    /// Open reservations a single client may hold. `None` is unbounded.
    pub max_open_transactions: Option<usize>,
    /// Drop the queue once it has been empty and idle this long.
    #[serde(with = "humantime_serde")]
    pub max_queue_age:         Option<Duration>,
}

impl QueueConfig {
    /// Largest item accepted. Never above what a journal frame can hold.
    pub(crate) fn item_limit(&self) -> u64 {
        self.max_item_size.map_or(MAX_ITEM_LEN, |limit| limit.min(MAX_ITEM_LEN))
    }

    pub(crate) fn item_fits(&self, size: usize) -> bool { size as u64 <= self.item_limit() }

    pub(crate) fn fits(&self, items: u64, bytes: u64) -> bool {
        self.max_items.is_none_or(|limit| items <= limit)
            && self.max_size.is_none_or(|limit| bytes <= limit)
    }
}

/// Per-queue overrides layered on top of the table default. Every field left
/// unset inherits the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfigOverride {
    pub max_items:             Option<u64>,
    pub max_size:              Option<u64>,
    pub max_item_size:         Option<u64>,
    pub max_memory_size:       Option<u64>,
    pub default_journal_size:  Option<u64>,
    pub max_journal_size:      Option<u64>,
    #[serde(with = "humantime_serde")]
    pub max_age:               Option<Duration>,
    pub keep_journal:          Option<bool>,
    pub sync_journal:          Option<SyncPolicy>,
    pub discard_old_when_full: Option<bool>,
    pub expire_to_queue:       Option<String>,
    pub max_expire_sweep:      Option<usize>,
    pub fanout_only:           Option<bool>,
    pub max_open_transactions: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub max_queue_age:         Option<Duration>,
}

impl QueueConfigOverride {
    pub fn apply(&self, base: &QueueConfig) -> QueueConfig {
        let mut config = base.clone();
        if self.max_items.is_some() {
            config.max_items = self.max_items;
        }
        if self.max_size.is_some() {
            config.max_size = self.max_size;
        }
        if self.max_item_size.is_some() {
            config.max_item_size = self.max_item_size;
        }
        if let Some(value) = self.max_memory_size {
            config.max_memory_size = value;
        }
        if let Some(value) = self.default_journal_size {
            config.default_journal_size = value;
        }
        if let Some(value) = self.max_journal_size {
            config.max_journal_size = value;
        }
        if self.max_age.is_some() {
            config.max_age = self.max_age;
        }
        if let Some(value) = self.keep_journal {
            config.keep_journal = value;
        }
        if let Some(value) = self.sync_journal {
            config.sync_journal = value;
        }
        if let Some(value) = self.discard_old_when_full {
            config.discard_old_when_full = value;
        }
        if self.expire_to_queue.is_some() {
            config.expire_to_queue.clone_from(&self.expire_to_queue);
        }
        if self.max_expire_sweep.is_some() {
            config.max_expire_sweep = self.max_expire_sweep;
        }
        if let Some(value) = self.fanout_only {
            config.fanout_only = value;
        }
        if self.max_open_transactions.is_some() {
            config.max_open_transactions = self.max_open_transactions;
        }
        if self.max_queue_age.is_some() {
            config.max_queue_age = self.max_queue_age;
        }
        config
    }
}

/// The default queue configuration plus overrides by queue name.
///
/// ```toml
/// [default]
/// max_items = 100000
///
/// [queues.jobs]
/// discard_old_when_full = true
/// sync_journal = { interval = "50ms" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfigTable {
    pub default: QueueConfig,
    pub queues:  HashMap<String, QueueConfigOverride>,
}

impl QueueConfigTable {
    /// Resolves the configuration for `name`. A fanout child without its own
    /// entry inherits its parent's overrides.
    pub fn resolve(&self, name: &str) -> QueueConfig {
        let overrides = self
            .queues
            .get(name)
            .or_else(|| fanout_parent(name).and_then(|parent| self.queues.get(parent)));
        match overrides {
            Some(overrides) => overrides.apply(&self.default),
            None => self.default.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn table() -> QueueConfigTable {
        let mut table = QueueConfigTable::default();
        table.default.max_items = Some(10);
        table.queues.insert(
            "jobs".to_string(),
            QueueConfigOverride {
                max_items: Some(3),
                discard_old_when_full: Some(true),
                ..Default::default()
            },
        );
        table
    }

    #[test_case("other", Some(10), false ; "unknown name uses the default")]
    #[test_case("jobs", Some(3), true ; "exact override")]
    #[test_case("jobs+audit", Some(3), true ; "fanout child inherits parent")]
    fn test_resolve(name: &str, max_items: Option<u64>, discard: bool) {
        let config = table().resolve(name);
        assert_eq!(config.max_items, max_items);
        assert_eq!(config.discard_old_when_full, discard);
        assert!(config.keep_journal);
    }

    #[test]
    fn test_fits() {
        let config = QueueConfig {
            max_items: Some(2),
            max_size: Some(10),
            max_item_size: Some(4),
            ..Default::default()
        };
        assert!(config.fits(2, 10));
        assert!(!config.fits(3, 10));
        assert!(!config.fits(2, 11));
        assert!(config.item_fits(4));
        assert!(!config.item_fits(5));
        assert!(QueueConfig::default().fits(u64::MAX, u64::MAX));
    }

    #[test]
    fn test_unbounded_item_size_is_capped_by_frame() {
        let unbounded = QueueConfig::default();
        assert_eq!(unbounded.item_limit(), MAX_ITEM_LEN);
        assert!(unbounded.item_fits(MAX_ITEM_LEN as usize));
        assert!(!unbounded.item_fits(MAX_ITEM_LEN as usize + 1));

        let huge = QueueConfig {
            max_item_size: Some(u64::MAX),
            ..Default::default()
        };
        assert_eq!(huge.item_limit(), MAX_ITEM_LEN);
    }

    #[test]
    fn test_parse_toml() {
        let table: QueueConfigTable = toml::from_str(
            r#"
            [default]
            max_age = "1h"
            sync_journal = { interval = "50ms" }

            [queues.jobs]
            expire_to_queue = "dead"
            max_queue_age = "30m"
            "#,
        )
        .unwrap();
        let config = table.resolve("jobs");
        assert_eq!(config.max_age, Some(Duration::from_secs(3600)));
        assert_eq!(
            config.sync_journal,
            SyncPolicy::Interval(Duration::from_millis(50))
        );
        assert_eq!(config.expire_to_queue.as_deref(), Some("dead"));
        assert_eq!(config.max_queue_age, Some(Duration::from_secs(1800)));
        assert_eq!(config.max_memory_size, 128 * MIB);
    }
}
