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

//! Broker lifecycle: opens the queue collection, runs the background
//! sweeper, applies configuration reloads and shuts everything down in
//! order.

mod config;
mod error;
mod sweeper;

use std::path::PathBuf;

pub use config::BrokerConfig;
pub use error::{Error, Result};
use snafu::{ResultExt, ensure};
use spool_common_telemetry as telemetry;
use spool_common_worker::{Manager, WorkerConfig, WorkerHandle};
use spool_queue::QueueCollection;
pub use sweeper::ExpirySweeper;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{
    AlreadyStartedSnafu, JoinSnafu, LoggingSnafu, QueueSnafu, WorkerSnafu,
};

/// A running set of queues plus the workers that maintain them.
pub struct Broker {
    config:             BrokerConfig,
    collection:         QueueCollection,
    manager:            Option<Manager>,
    sweeper:            Option<WorkerHandle>,
    cancellation_token: CancellationToken,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("base_dir", &self.config.base_dir)
            .field("started", &self.manager.is_some())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Opens every queue under `config.base_dir`. Recovery reads journals, so
    /// it runs on the blocking pool.
    pub async fn open(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let base_dir = config.base_dir.clone();
        let table = config.queues.clone();
        let collection = tokio::task::spawn_blocking(move || QueueCollection::open(base_dir, table))
            .await
            .context(JoinSnafu)?
            .context(QueueSnafu)?;

        info!(path = ?config.base_dir, queues = collection.queue_names().len(), "Broker opened");
        Ok(Self {
            config,
            collection,
            manager: None,
            sweeper: None,
            cancellation_token: CancellationToken::new(),
        })
    }

    pub const fn config(&self) -> &BrokerConfig { &self.config }

    /// The queues. Cheap to clone and usable from any thread.
    pub const fn collection(&self) -> &QueueCollection { &self.collection }

    /// Cancelling this token makes [`Broker::run`] return.
    pub fn shutdown_token(&self) -> CancellationToken { self.cancellation_token.clone() }

    /// Starts the background workers.
    pub fn start(&mut self) -> Result<()> {
        ensure!(self.manager.is_none(), AlreadyStartedSnafu);
        let worker_config = WorkerConfig::builder()
            .shutdown_timeout(self.config.shutdown_timeout)
            .build();
        let mut manager = Manager::start(worker_config).context(WorkerSnafu)?;
        let sweeper = manager.register(ExpirySweeper::new(
            self.collection.clone(),
            self.config.sweep_interval,
        ));
        self.manager = Some(manager);
        self.sweeper = Some(sweeper);
        info!(sweep_interval = ?self.config.sweep_interval, "Broker started");
        Ok(())
    }

    /// Applies a new configuration to every open queue. The base directory
    /// and sweep interval only take effect on restart.
    pub async fn reload(&mut self, config: BrokerConfig) -> Result<()> {
        config.validate()?;
        if config.base_dir != self.config.base_dir {
            warn!(
                current = ?self.config.base_dir,
                requested = ?config.base_dir,
                "base_dir cannot change while running"
            );
        }
        if config.sweep_interval != self.config.sweep_interval {
            warn!("sweep_interval takes effect on restart");
        }
        if config.logging.level != self.config.logging.level
            && let Some(level) = &config.logging.level
        {
            telemetry::reload_level(level).context(LoggingSnafu)?;
        }

        let collection = self.collection.clone();
        let table = config.queues.clone();
        tokio::task::spawn_blocking(move || collection.reload(None, table))
            .await
            .context(JoinSnafu)?
            .context(QueueSnafu)?;

        self.config = BrokerConfig {
            base_dir: self.config.base_dir.clone(),
            sweep_interval: self.config.sweep_interval,
            ..config
        };
        // sweep right away in case limits tightened
        if let Some(sweeper) = &self.sweeper {
            sweeper.notify();
        }
        info!("Broker configuration reloaded");
        Ok(())
    }

    /// Stops the workers, then closes every queue.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down broker");
        self.cancellation_token.cancel();
        if let Some(manager) = self.manager.take() {
            manager.shutdown().await.context(WorkerSnafu)?;
        }
        let collection = self.collection.clone();
        tokio::task::spawn_blocking(move || collection.shutdown())
            .await
            .context(JoinSnafu)?
            .context(QueueSnafu)?;
        info!("Broker shutdown complete");
        Ok(())
    }

    /// Runs until Ctrl+C, SIGTERM or the shutdown token, then shuts down.
    /// With `config_path`, SIGHUP reloads the configuration from it.
    pub async fn run(mut self, config_path: Option<PathBuf>) -> Result<()> {
        if self.manager.is_none() {
            self.start()?;
        }
        loop {
            match wait_for_signal(&self.cancellation_token).await {
                Signal::Reload => {
                    let Some(path) = &config_path else {
                        info!("No config file to reload");
                        continue;
                    };
                    let reloaded = match BrokerConfig::load(path) {
                        Ok(config) => self.reload(config).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = reloaded {
                        error!(path = ?path, error = %e, "Config reload failed, keeping current config");
                    }
                }
                Signal::Shutdown => break,
            }
        }
        self.shutdown().await
    }
}

enum Signal {
    Shutdown,
    Reload,
}

async fn wait_for_signal(token: &CancellationToken) -> Signal {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let (terminate, hangup) = {
        use tokio::signal::unix::{SignalKind, signal};

        let wait = |kind: SignalKind| async move {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install signal handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        (wait(SignalKind::terminate()), wait(SignalKind::hangup()))
    };

    #[cfg(not(unix))]
    let (terminate, hangup) = (std::future::pending::<()>(), std::future::pending::<()>());

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C signal"); Signal::Shutdown }
        () = terminate => { info!("Received terminate signal"); Signal::Shutdown }
        () = token.cancelled() => { info!("Received shutdown signal"); Signal::Shutdown }
        () = hangup => { info!("Received hangup signal"); Signal::Reload }
    }
}
