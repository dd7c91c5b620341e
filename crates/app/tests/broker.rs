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

use std::{collections::HashMap, time::Duration};

use chrono::Utc;
use spool_app::{Broker, BrokerConfig};
use spool_queue::{ClientId, QueueConfigOverride, QueueConfigTable};
use tempfile::TempDir;

fn config(dir: &TempDir) -> BrokerConfig {
    BrokerConfig::builder()
        .base_dir(dir.path())
        .sweep_interval(Duration::from_millis(50))
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweeper_moves_expired_items() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.queues.queues.insert("jobs".to_string(), QueueConfigOverride {
        expire_to_queue: Some("jobs_dead".to_string()),
        ..Default::default()
    });

    let mut broker = Broker::open(config).await.unwrap();
    broker.start().unwrap();

    let collection = broker.collection().clone();
    tokio::task::spawn_blocking(move || {
        let past = Utc::now() - chrono::Duration::seconds(1);
        collection.enqueue("jobs", "stale", Some(past)).unwrap();
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let collection = broker.collection().clone();
    let (jobs, dead) = tokio::task::spawn_blocking(move || {
        (
            collection.peek("jobs").unwrap().items,
            collection.peek("jobs_dead").unwrap().items,
        )
    })
    .await
    .unwrap();
    assert_eq!(jobs, 0);
    assert_eq!(dead, 1);

    broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_items_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let broker = Broker::open(config(&dir)).await.unwrap();
        let collection = broker.collection().clone();
        tokio::task::spawn_blocking(move || {
            collection.enqueue("jobs", "persisted", None).unwrap();
        })
        .await
        .unwrap();
        broker.shutdown().await.unwrap();
    }

    let broker = Broker::open(config(&dir)).await.unwrap();
    let collection = broker.collection().clone();
    let reservation = tokio::task::spawn_blocking(move || {
        collection.dequeue("jobs", ClientId(1), None).unwrap()
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reservation.item.data, "persisted");
    broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reload_applies_new_limits() {
    let dir = TempDir::new().unwrap();
    let mut broker = Broker::open(config(&dir)).await.unwrap();
    broker.start().unwrap();

    let collection = broker.collection().clone();
    tokio::task::spawn_blocking(move || collection.queue("jobs").unwrap())
        .await
        .unwrap();

    let mut reloaded = config(&dir);
    reloaded.queues = QueueConfigTable {
        default: reloaded.queues.default.clone(),
        queues:  HashMap::from([("jobs".to_string(), QueueConfigOverride {
            max_items: Some(1),
            ..Default::default()
        })]),
    };
    broker.reload(reloaded).await.unwrap();

    let collection = broker.collection().clone();
    let second = tokio::task::spawn_blocking(move || {
        collection.enqueue("jobs", "one", None).unwrap();
        collection.enqueue("jobs", "two", None)
    })
    .await
    .unwrap();
    assert!(second.is_err());

    broker.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_stops_on_token() {
    let dir = TempDir::new().unwrap();
    let broker = Broker::open(config(&dir)).await.unwrap();
    let token = broker.shutdown_token();

    let run = tokio::spawn(broker.run(None));
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_twice_rejected() {
    let dir = TempDir::new().unwrap();
    let mut broker = Broker::open(config(&dir)).await.unwrap();
    broker.start().unwrap();
    assert!(matches!(broker.start(), Err(spool_app::Error::AlreadyStarted { .. })));
    broker.shutdown().await.unwrap();
}
