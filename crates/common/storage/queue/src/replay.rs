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

//! Crash recovery: rebuilding a queue from its journal.
//!
//! Recovery replays every record in order, cuts off a torn tail left by a
//! crash mid-write, and then returns reservations that were open at the
//! crash to the queue, since the clients holding them are gone.

use std::{path::Path, sync::Arc};

use tracing::{info, warn};

use crate::{
    QueueConfig,
    error::Result,
    journal::{Journal, JournalReader, ReadOutcome},
    record::HEADER_LEN,
    reservation::ClientId,
    state::QueueState,
};

/// What a replay found beyond the state itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub records: u64,
    /// Offset of a torn final record, if one was found.
    pub torn_at: Option<u64>,
}

impl QueueState {
    /// Feeds every record from `reader` through [`QueueState::apply`].
    pub(crate) fn replay(&mut self, mut reader: JournalReader) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        loop {
            let start = reader.position();
            self.set_replay_cursor(Some(start));
            match reader.next_record() {
                Ok(ReadOutcome::Record(record, _)) => {
                    if let Err(e) = self.apply(record, start) {
                        self.set_replay_cursor(None);
                        return Err(e);
                    }
                    report.records += 1;
                }
                Ok(ReadOutcome::End) => break,
                Ok(ReadOutcome::Torn { offset, reason }) => {
                    warn!(queue = %self.name(), offset, reason, "Torn record at end of journal");
                    report.torn_at = Some(offset);
                    break;
                }
                Err(e) => {
                    self.set_replay_cursor(None);
                    return Err(e);
                }
            }
        }
        self.set_replay_cursor(None);
        Ok(report)
    }

    /// Opens and replays the journal of queue `name` under `dir`.
    pub(crate) fn recover(name: String, dir: &Path, config: Arc<QueueConfig>) -> Result<Self> {
        let path = dir.join(&name);
        if !config.keep_journal && !path.exists() {
            return Ok(Self::new(name, config, None));
        }

        let journal = Journal::open(&path, config.sync_journal)?;
        let reader = journal.reader()?;
        let keep_journal = config.keep_journal;
        let mut state = Self::new(name, config, Some(journal));
        let report = state.replay(reader)?;

        if let Some(offset) = report.torn_at
            && let Some(journal) = state.journal_mut()
        {
            journal.truncate(offset)?;
        }
        let returned = state.abort_client(ClientId::RECOVERED)?;

        if keep_journal {
            state.maybe_rewrite()?;
        } else if let Some(journal) = state.take_journal() {
            journal.erase()?;
        }

        info!(
            queue = %state.name(),
            records = report.records,
            items = state.items(),
            bytes = state.bytes(),
            next_id = state.next_id(),
            returned,
            "Queue recovered"
        );
        Ok(state)
    }
}

/// Summary of a journal's contents, computed without modifying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalSummary {
    pub records:           u64,
    pub items:             u64,
    pub bytes:             u64,
    pub open_reservations: usize,
    pub next_id:           u64,
    pub next_xid:          u64,
    pub torn_at:           Option<u64>,
}

/// Replays the journal at `path` read-only.
pub fn inspect(path: impl AsRef<Path>) -> Result<JournalSummary> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let config = QueueConfig {
        max_memory_size: u64::MAX,
        ..Default::default()
    };
    let mut state = QueueState::new(name, Arc::new(config), None);
    let report = state.replay(JournalReader::open(path, HEADER_LEN)?)?;
    Ok(JournalSummary {
        records:           report.records,
        items:             state.items(),
        bytes:             state.bytes(),
        open_reservations: state.open_reservations(),
        next_id:           state.next_id(),
        next_xid:          state.next_xid(),
        torn_at:           report.torn_at,
    })
}

#[cfg(test)]
mod tests {
    use std::{fs::OpenOptions, io::Write};

    use bytes::{Bytes, BytesMut};
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::{SyncPolicy, item::Item, record::JournalRecord};

    fn config() -> Arc<QueueConfig> {
        Arc::new(QueueConfig {
            sync_journal: SyncPolicy::Always,
            ..Default::default()
        })
    }

    fn pending_ids(state: &QueueState) -> Vec<u64> { state.resident().map(|item| item.id).collect() }

    #[test]
    fn test_replay_matches_live_state() {
        let dir = TempDir::new().unwrap();
        let (ids, next_id) = {
            let mut live = QueueState::recover("jobs".into(), dir.path(), config()).unwrap();
            for i in 0..6 {
                live.add(Bytes::from(format!("m{i}")), None, Utc::now()).unwrap();
            }
            let first = live.get(ClientId(1), Utc::now(), &mut Vec::new()).unwrap().unwrap();
            let second = live.get(ClientId(1), Utc::now(), &mut Vec::new()).unwrap().unwrap();
            live.confirm(first.xid).unwrap();
            live.abort(second.xid).unwrap();
            live.get(ClientId(2), Utc::now(), &mut Vec::new()).unwrap();
            live.close().unwrap();
            // the open reservation from client 2 comes back on recovery
            let mut ids: Vec<u64> = live.resident().map(|item| item.id).collect();
            ids.insert(0, 2);
            (ids, live.next_id())
        };

        let summary = inspect(dir.path().join("jobs")).unwrap();
        assert_eq!(summary.items, 4);
        assert_eq!(summary.open_reservations, 1);
        assert_eq!(summary.next_id, next_id);

        let recovered = QueueState::recover("jobs".into(), dir.path(), config()).unwrap();
        assert_eq!(pending_ids(&recovered), ids);
        assert_eq!(recovered.next_id(), next_id);
        assert_eq!(recovered.open_reservations(), 0);
    }

    #[test]
    fn test_recover_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs");
        {
            let mut live = QueueState::recover("jobs".into(), dir.path(), config()).unwrap();
            live.add(Bytes::from_static(b"kept"), None, Utc::now()).unwrap();
            live.close().unwrap();
        }
        let good_len = std::fs::metadata(&path).unwrap().len();

        let mut frame = BytesMut::new();
        JournalRecord::Add(Item {
            id:         2,
            data:       Bytes::from_static(b"lost"),
            added_at:   Utc::now(),
            expires_at: None,
        })
        .encode_frame(&mut frame);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame[..frame.len() - 2]).unwrap();
        drop(file);

        assert_eq!(inspect(&path).unwrap().torn_at, Some(good_len));

        let mut recovered = QueueState::recover("jobs".into(), dir.path(), config()).unwrap();
        assert_eq!(pending_ids(&recovered), vec![1]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
        assert_eq!(
            recovered.add(Bytes::from_static(b"next"), None, Utc::now()).unwrap(),
            2
        );
    }

    #[test]
    fn test_recover_refuses_damaged_length_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs");
        {
            let mut live = QueueState::recover("jobs".into(), dir.path(), config()).unwrap();
            for i in 0..5 {
                live.add(Bytes::from(format!("m{i}")), None, Utc::now()).unwrap();
            }
            live.close().unwrap();
        }
        let second = match JournalReader::open(&path, HEADER_LEN).unwrap().next_record().unwrap() {
            ReadOutcome::Record(_, end) => end,
            other => panic!("expected a record, got {other:?}"),
        };

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[second as usize + 3] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();
        let len = bytes.len() as u64;

        let err = QueueState::recover("jobs".into(), dir.path(), config()).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Durability);
        assert!(inspect(&path).is_err());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
    }

    #[test]
    fn test_ids_survive_rewrite() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(QueueConfig {
            default_journal_size: 0,
            ..Default::default()
        });
        {
            let mut live = QueueState::recover("jobs".into(), dir.path(), config.clone()).unwrap();
            for _ in 0..3 {
                live.add(Bytes::from_static(b"x"), None, Utc::now()).unwrap();
                let reservation = live.get(ClientId(1), Utc::now(), &mut Vec::new()).unwrap().unwrap();
                live.confirm(reservation.xid).unwrap();
            }
            live.maybe_rewrite().unwrap();
            live.close().unwrap();
        }
        let summary = inspect(dir.path().join("jobs")).unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.items, 0);

        let mut recovered = QueueState::recover("jobs".into(), dir.path(), config).unwrap();
        assert_eq!(recovered.add(Bytes::from_static(b"y"), None, Utc::now()).unwrap(), 4);
    }

    #[test]
    fn test_replay_with_read_behind() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(QueueConfig {
            max_memory_size: 8,
            ..Default::default()
        });
        {
            let mut live = QueueState::recover("jobs".into(), dir.path(), config.clone()).unwrap();
            for i in 0..10 {
                live.add(Bytes::from(format!("item{i}")), None, Utc::now()).unwrap();
            }
            let reservation = live.get(ClientId(1), Utc::now(), &mut Vec::new()).unwrap().unwrap();
            live.confirm(reservation.xid).unwrap();
            live.close().unwrap();
        }

        let mut recovered = QueueState::recover("jobs".into(), dir.path(), config).unwrap();
        assert_eq!(recovered.items(), 9);
        let mut ids = Vec::new();
        while let Some(reservation) = recovered.get(ClientId(1), Utc::now(), &mut Vec::new()).unwrap() {
            recovered.confirm(reservation.xid).unwrap();
            ids.push(reservation.item.id);
        }
        assert_eq!(ids, (2..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_memory_only_queue_consumes_old_journal() {
        let dir = TempDir::new().unwrap();
        {
            let mut live = QueueState::recover("jobs".into(), dir.path(), config()).unwrap();
            live.add(Bytes::from_static(b"a"), None, Utc::now()).unwrap();
            live.close().unwrap();
        }
        let config = Arc::new(QueueConfig {
            keep_journal: false,
            ..Default::default()
        });
        let recovered = QueueState::recover("jobs".into(), dir.path(), config).unwrap();
        assert_eq!(pending_ids(&recovered), vec![1]);
        assert!(!dir.path().join("jobs").exists());
    }
}
