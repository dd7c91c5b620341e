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

use snafu::Snafu;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for worker operations.
pub type Result<T = (), E = WorkError> = std::result::Result<T, E>;

/// Whether a worker survives an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The worker logs the error and runs again on its next trigger.
    Transient,
    /// The worker stops after running `on_shutdown()`.
    Fatal,
}

/// Errors returned from worker hooks, and by the manager itself.
///
/// ```rust
/// use spool_common_worker::{Result, WorkError};
///
/// fn step(disk_full: bool) -> Result {
///     if disk_full {
///         return Err(WorkError::transient("disk full, retrying next tick"));
///     }
///     Ok(())
/// }
/// # assert!(step(true).unwrap_err().is_transient());
/// ```
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WorkError {
    #[snafu(display("[transient] {message}"))]
    Transient {
        message: String,
        #[snafu(source(false))]
        source:  Option<BoxedError>,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },

    #[snafu(display("[fatal] {message}"))]
    Fatal {
        message: String,
        #[snafu(source(false))]
        source:  Option<BoxedError>,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },

    #[snafu(display("No tokio runtime to spawn workers on"))]
    NoRuntime {
        #[snafu(implicit)]
        loc: snafu::Location,
    },
}

impl WorkError {
    #[track_caller]
    pub fn transient(message: impl Into<String>) -> Self {
        TransientSnafu {
            message: message.into(),
            source:  None::<BoxedError>,
        }
        .build()
    }

    #[track_caller]
    pub fn fatal(message: impl Into<String>) -> Self {
        FatalSnafu {
            message: message.into(),
            source:  None::<BoxedError>,
        }
        .build()
    }

    #[track_caller]
    pub fn transient_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TransientSnafu {
            message: message.into(),
            source:  Some(Box::new(source) as BoxedError),
        }
        .build()
    }

    #[track_caller]
    pub fn fatal_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        FatalSnafu {
            message: message.into(),
            source:  Some(Box::new(source) as BoxedError),
        }
        .build()
    }

    pub const fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Transient { .. } => ErrorSeverity::Transient,
            Self::Fatal { .. } | Self::NoRuntime { .. } => ErrorSeverity::Fatal,
        }
    }

    pub const fn is_fatal(&self) -> bool { matches!(self.severity(), ErrorSeverity::Fatal) }

    pub const fn is_transient(&self) -> bool {
        matches!(self.severity(), ErrorSeverity::Transient)
    }

    /// The underlying cause, if one was attached.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Transient { source, .. } | Self::Fatal { source, .. } => source.as_deref(),
            Self::NoRuntime { .. } => None,
        }
    }
}
