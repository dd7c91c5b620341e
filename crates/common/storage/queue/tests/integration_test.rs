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
    collections::{HashMap, HashSet},
    sync::Arc,
    thread,
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use spool_queue::{
    ClientId, ErrorKind, PersistentQueue, QueueCollection, QueueConfig, QueueConfigOverride,
    QueueConfigTable, QueueError, SyncPolicy, inspect,
};
use tempfile::TempDir;

fn durable() -> QueueConfig {
    QueueConfig {
        sync_journal: SyncPolicy::Always,
        ..Default::default()
    }
}

fn table_with(name: &str, overrides: QueueConfigOverride) -> QueueConfigTable {
    QueueConfigTable {
        default: durable(),
        queues:  HashMap::from([(name.to_string(), overrides)]),
    }
}

fn drain(queue: &PersistentQueue) -> Vec<Bytes> {
    let mut items = Vec::new();
    while let Some(reservation) = queue.get(ClientId(99), None).unwrap() {
        queue.confirm(reservation.xid).unwrap();
        items.push(reservation.item.data);
    }
    items
}

#[test]
fn test_queue_write_and_read() {
    let temp_dir = TempDir::new().unwrap();
    let queue = PersistentQueue::open("jobs", temp_dir.path(), durable()).unwrap();

    for i in 0..100 {
        let id = queue.add(format!("message-{i:04}"), None).unwrap();
        assert_eq!(id, i + 1);
    }

    let items = drain(&queue);
    assert_eq!(items.len(), 100);
    for (i, data) in items.iter().enumerate() {
        assert_eq!(std::str::from_utf8(data).unwrap(), format!("message-{i:04}"));
    }
    assert!(queue.get(ClientId(1), None).unwrap().is_none());

    queue.close().unwrap();
}

#[test]
fn test_queue_recovery() {
    let temp_dir = TempDir::new().unwrap();
    {
        let queue = PersistentQueue::open("jobs", temp_dir.path(), durable()).unwrap();
        for i in 1..=5 {
            queue.add(format!("m{i}"), None).unwrap();
        }
        let first = queue.get(ClientId(1), None).unwrap().unwrap();
        let second = queue.get(ClientId(1), None).unwrap().unwrap();
        queue.confirm(first.xid).unwrap();
        assert_eq!(second.item.id, 2);
        // second stays reserved across the restart
        queue.close().unwrap();
    }

    let summary = inspect(temp_dir.path().join("jobs")).unwrap();
    assert_eq!(summary.items, 3);
    assert_eq!(summary.open_reservations, 1);

    let queue = PersistentQueue::open("jobs", temp_dir.path(), durable()).unwrap();
    let stats = queue.peek().unwrap();
    assert_eq!(stats.items, 4);
    assert_eq!(stats.open_reservations, 0);
    assert_eq!(drain(&queue), vec!["m2", "m3", "m4", "m5"]);
    assert_eq!(queue.add("m6", None).unwrap(), 6);
}

#[test]
fn test_abort_redelivers_before_newer_items() {
    let temp_dir = TempDir::new().unwrap();
    let queue = PersistentQueue::open("jobs", temp_dir.path(), durable()).unwrap();
    queue.add("a", None).unwrap();
    queue.add("b", None).unwrap();

    let reservation = queue.get(ClientId(1), None).unwrap().unwrap();
    queue.abort(reservation.xid).unwrap();

    let again = queue.get(ClientId(2), None).unwrap().unwrap();
    assert_eq!(again.item.id, reservation.item.id);
    assert_ne!(again.xid, reservation.xid);
}

#[test]
fn test_double_confirm_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let queue = PersistentQueue::open("jobs", temp_dir.path(), durable()).unwrap();
    queue.add("a", None).unwrap();
    let reservation = queue.get(ClientId(1), None).unwrap().unwrap();

    queue.confirm(reservation.xid).unwrap();
    let err = queue.confirm(reservation.xid).unwrap_err();
    assert!(matches!(err, QueueError::ReservationNotFound { .. }));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(queue.abort(reservation.xid).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn test_capacity_limits() {
    let temp_dir = TempDir::new().unwrap();
    let strict = QueueConfig {
        max_items: Some(2),
        ..durable()
    };
    let queue = PersistentQueue::open("strict", temp_dir.path(), strict).unwrap();
    queue.add("a", None).unwrap();
    queue.add("b", None).unwrap();
    let err = queue.add("c", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert_eq!(queue.peek().unwrap().items, 2);

    let lossy = QueueConfig {
        max_items: Some(2),
        discard_old_when_full: true,
        ..durable()
    };
    let queue = PersistentQueue::open("lossy", temp_dir.path(), lossy).unwrap();
    for data in ["a", "b", "c"] {
        queue.add(data, None).unwrap();
    }
    assert_eq!(queue.peek().unwrap().total_discarded, 1);
    assert_eq!(drain(&queue), vec!["b", "c"]);
}

#[test]
fn test_concurrent_consumers_never_share_an_item() {
    let temp_dir = TempDir::new().unwrap();
    let queue = Arc::new(PersistentQueue::open("jobs", temp_dir.path(), QueueConfig::default()).unwrap());
    for i in 0..400 {
        queue.add(format!("{i}"), None).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|client| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut ids = Vec::new();
                while let Some(reservation) = queue.get(ClientId(client), None).unwrap() {
                    queue.confirm(reservation.xid).unwrap();
                    ids.push(reservation.item.id);
                }
                ids
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id), "item {id} delivered twice");
        }
    }
    assert_eq!(seen.len(), 400);
}

#[test]
fn test_waiting_dequeue_sees_later_enqueue() {
    let temp_dir = TempDir::new().unwrap();
    let collection = QueueCollection::open(temp_dir.path(), QueueConfigTable::default()).unwrap();

    let consumer = {
        let collection = collection.clone();
        thread::spawn(move || {
            collection
                .dequeue("jobs", ClientId(1), Some(Duration::from_secs(5)))
                .unwrap()
        })
    };
    thread::sleep(Duration::from_millis(50));
    collection.enqueue("jobs", "late", None).unwrap();

    let reservation = consumer.join().unwrap().unwrap();
    assert_eq!(reservation.item.data, "late");
}

#[test]
fn test_fanout_copies_to_children() {
    let temp_dir = TempDir::new().unwrap();
    let collection = QueueCollection::open(temp_dir.path(), QueueConfigTable::default()).unwrap();
    collection.queue("events+audit").unwrap();
    collection.queue("events+billing").unwrap();

    let enqueued = collection.enqueue("events", "hello", None).unwrap();
    assert_eq!(enqueued.id, Some(1));
    assert!(enqueued.fanout_failures.is_empty());

    for name in ["events", "events+audit", "events+billing"] {
        assert_eq!(collection.peek(name).unwrap().items, 1, "{name}");
    }
    let copy = collection.dequeue("events+audit", ClientId(1), None).unwrap().unwrap();
    assert_eq!(copy.item.data, "hello");
    // consuming one copy leaves the others alone
    assert_eq!(collection.peek("events+billing").unwrap().items, 1);
}

#[test]
fn test_fanout_only_parent_keeps_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let table = table_with("events", QueueConfigOverride {
        fanout_only: Some(true),
        ..Default::default()
    });
    let collection = QueueCollection::open(temp_dir.path(), table).unwrap();
    collection.queue("events+audit").unwrap();

    let enqueued = collection.enqueue("events", "hello", None).unwrap();
    assert_eq!(enqueued.id, None);
    assert_eq!(collection.peek("events").unwrap().items, 0);
    assert_eq!(collection.peek("events+audit").unwrap().items, 1);
}

#[test]
fn test_fanout_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    {
        let collection = QueueCollection::open(temp_dir.path(), QueueConfigTable::default()).unwrap();
        collection.queue("events+audit").unwrap();
        collection.shutdown().unwrap();
    }

    let collection = QueueCollection::open(temp_dir.path(), QueueConfigTable::default()).unwrap();
    assert_eq!(collection.fanout_children("events"), vec!["events+audit"]);
    collection.enqueue("events", "after restart", None).unwrap();
    assert_eq!(collection.peek("events+audit").unwrap().items, 1);
}

#[test]
fn test_expired_items_move_to_dead_letter_queue() {
    let temp_dir = TempDir::new().unwrap();
    let table = table_with("jobs", QueueConfigOverride {
        expire_to_queue: Some("dead".to_string()),
        ..Default::default()
    });
    let collection = QueueCollection::open(temp_dir.path(), table).unwrap();

    let past = Utc::now() - chrono::Duration::seconds(1);
    collection.enqueue("jobs", "stale", Some(past)).unwrap();
    collection.enqueue("jobs", "fresh", None).unwrap();

    let report = collection.expire_sweep(Utc::now());
    assert_eq!(report.expired, 1);
    assert_eq!(collection.peek("jobs").unwrap().items, 1);

    let dead = collection.dequeue("dead", ClientId(1), None).unwrap().unwrap();
    assert_eq!(dead.item.data, "stale");
    assert_eq!(dead.item.expires_at, None);
}

#[test]
fn test_dequeue_skips_and_routes_expired_head() {
    let temp_dir = TempDir::new().unwrap();
    let table = table_with("jobs", QueueConfigOverride {
        expire_to_queue: Some("dead".to_string()),
        ..Default::default()
    });
    let collection = QueueCollection::open(temp_dir.path(), table).unwrap();

    let past = Utc::now() - chrono::Duration::seconds(1);
    collection.enqueue("jobs", "stale", Some(past)).unwrap();
    collection.enqueue("jobs", "fresh", None).unwrap();

    let reservation = collection.dequeue("jobs", ClientId(1), None).unwrap().unwrap();
    assert_eq!(reservation.item.data, "fresh");
    assert_eq!(collection.peek("dead").unwrap().items, 1);
}

#[test]
fn test_drop_queue_refused_while_reserved() {
    let temp_dir = TempDir::new().unwrap();
    let collection = QueueCollection::open(temp_dir.path(), QueueConfigTable::default()).unwrap();
    collection.enqueue("jobs", "a", None).unwrap();
    let reservation = collection.dequeue("jobs", ClientId(1), None).unwrap().unwrap();

    let err = collection.drop_queue("jobs").unwrap_err();
    assert!(matches!(err, QueueError::QueueBusy { open: 1, .. }));
    assert_eq!(collection.queue_names(), vec!["jobs"]);

    collection.confirm("jobs", reservation.xid).unwrap();
    collection.drop_queue("jobs").unwrap();
    assert!(collection.queue_names().is_empty());
    assert!(!temp_dir.path().join("jobs").exists());
    assert_eq!(collection.peek("jobs").unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn test_release_client_returns_reservations() {
    let temp_dir = TempDir::new().unwrap();
    let collection = QueueCollection::open(temp_dir.path(), QueueConfigTable::default()).unwrap();
    collection.enqueue("a", "1", None).unwrap();
    collection.enqueue("b", "2", None).unwrap();
    collection.dequeue("a", ClientId(7), None).unwrap().unwrap();
    collection.dequeue("b", ClientId(7), None).unwrap().unwrap();

    assert_eq!(collection.release_client(ClientId(7)), 2);
    assert_eq!(collection.peek("a").unwrap().items, 1);
    assert_eq!(collection.peek("b").unwrap().open_reservations, 0);
}

#[test]
fn test_idle_queue_dropped_after_max_queue_age() {
    let temp_dir = TempDir::new().unwrap();
    let table = table_with("scratch", QueueConfigOverride {
        max_queue_age: Some(Duration::from_millis(1)),
        ..Default::default()
    });
    let collection = QueueCollection::open(temp_dir.path(), table).unwrap();
    collection.queue("scratch").unwrap();
    collection.enqueue("busy", "keep", None).unwrap();
    thread::sleep(Duration::from_millis(20));

    let report = collection.expire_sweep(Utc::now());
    assert_eq!(report.dropped, vec!["scratch"]);
    assert_eq!(collection.queue_names(), vec!["busy"]);
}

#[test]
fn test_sweep_never_drops_acknowledged_items() {
    let temp_dir = TempDir::new().unwrap();
    let table = table_with("hot", QueueConfigOverride {
        max_queue_age: Some(Duration::ZERO),
        sync_journal: Some(SyncPolicy::Never),
        ..Default::default()
    });
    let collection = QueueCollection::open(temp_dir.path(), table).unwrap();
    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let sweeper = {
        let collection = collection.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(std::sync::atomic::Ordering::SeqCst) {
                collection.expire_sweep(Utc::now());
            }
        })
    };

    let mut acked = 0;
    while acked < 200 {
        match collection.enqueue("hot", "payload", None) {
            Ok(_) => acked += 1,
            // the handle was taken just before an idle drop; a retry reopens
            Err(QueueError::QueueClosed { .. }) => {}
            Err(e) => panic!("unexpected enqueue error: {e}"),
        }
    }
    done.store(true, std::sync::atomic::Ordering::SeqCst);
    sweeper.join().unwrap();

    assert_eq!(collection.peek("hot").unwrap().items, acked);
}

#[test]
fn test_stale_rewrite_file_removed_on_open() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("jobs.compact"), b"partial").unwrap();

    let collection = QueueCollection::open(temp_dir.path(), QueueConfigTable::default()).unwrap();
    assert!(!temp_dir.path().join("jobs.compact").exists());
    assert!(collection.queue_names().is_empty());
}
