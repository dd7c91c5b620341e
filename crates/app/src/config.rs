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
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use bon::Builder;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::{ResultExt, ensure};
use spool_common_telemetry::LoggingOptions;
use spool_queue::{QueueConfigTable, validate_name};

use crate::error::{InvalidConfigSnafu, ParseConfigSnafu, ReadConfigSnafu, Result};

/// Broker configuration, usually loaded from a TOML file.
///
/// ```toml
/// base_dir = "/var/spool/queues"
/// sweep_interval = "1s"
///
/// [logging]
/// level = "info,spool_queue=debug"
///
/// [queues.default]
/// max_items = 1000000
/// max_age = "7d"
///
/// [queues.queues.jobs]
/// expire_to_queue = "jobs_dead"
/// sync_journal = "always"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault, Builder)]
#[serde(default)]
pub struct BrokerConfig {
    /// Directory holding one journal per queue.
    #[default(_code = "PathBuf::from(\"data/queues\")")]
    #[builder(default = PathBuf::from("data/queues"), into)]
    pub base_dir: PathBuf,

    /// How often expired items are swept from every queue.
    #[serde(with = "humantime_serde")]
    #[default(Duration::from_secs(1))]
    #[builder(default = Duration::from_secs(1))]
    pub sweep_interval: Duration,

    /// How long background workers get to stop on shutdown.
    #[serde(with = "humantime_serde")]
    #[default(Duration::from_secs(10))]
    #[builder(default = Duration::from_secs(10))]
    pub shutdown_timeout: Duration,

    #[builder(default)]
    pub logging: LoggingOptions,

    #[builder(default)]
    pub queues: QueueConfigTable,
}

impl BrokerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).context(ReadConfigSnafu { path })?;
        let config: Self = toml::from_str(&text).context(ParseConfigSnafu { path })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings no queue could run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.sweep_interval.is_zero(),
            InvalidConfigSnafu {
                reason: "sweep_interval must be positive",
            }
        );
        for (name, overrides) in &self.queues.queues {
            validate_name(name).map_err(|e| {
                InvalidConfigSnafu {
                    reason: format!("queue {name:?}: {e}"),
                }
                .build()
            })?;
            if let Some(target) = &overrides.expire_to_queue {
                ensure!(
                    target != name && validate_name(target).is_ok(),
                    InvalidConfigSnafu {
                        reason: format!("queue {name:?}: bad expire_to_queue {target:?}"),
                    }
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use spool_queue::SyncPolicy;

    use super::*;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("spool.toml");
        fs::write(
            &path,
            r#"
            base_dir = "/tmp/spool"
            sweep_interval = "250ms"

            [logging]
            level = "debug"

            [queues.default]
            max_items = 10

            [queues.queues.jobs]
            expire_to_queue = "jobs_dead"
            sync_journal = { interval = "20ms" }
            "#,
        )
        .unwrap();

        let config = BrokerConfig::load(&path).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/tmp/spool"));
        assert_eq!(config.sweep_interval, Duration::from_millis(250));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.logging.level.as_deref(), Some("debug"));

        let jobs = config.queues.resolve("jobs");
        assert_eq!(jobs.max_items, Some(10));
        assert_eq!(jobs.expire_to_queue.as_deref(), Some("jobs_dead"));
        assert_eq!(jobs.sync_journal, SyncPolicy::Interval(Duration::from_millis(20)));
    }

    #[test]
    fn test_missing_file() {
        let err = BrokerConfig::load("/nonexistent/spool.toml").unwrap_err();
        assert!(matches!(err, crate::Error::ReadConfig { .. }));
    }

    #[test]
    fn test_expire_to_self_rejected() {
        let text = r#"
            [queues.queues.jobs]
            expire_to_queue = "jobs"
        "#;
        let config: BrokerConfig = toml::from_str(text).unwrap();
        assert!(matches!(config.validate(), Err(crate::Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_builder_defaults_match_default() {
        assert_eq!(BrokerConfig::builder().build(), BrokerConfig::default());
    }
}
