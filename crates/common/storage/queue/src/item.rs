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

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A queued payload. Items are immutable once added; ids increase strictly
/// within one queue and are never reused, including across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id:         u64,
    pub data:       Bytes,
    pub added_at:   DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Item {
    pub fn size(&self) -> u64 { self.data.len() as u64 }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.added_at).to_std().unwrap_or_default()
    }
}

/// Caps a requested expiry at `now + max_age`.
pub(crate) fn clamp_expiry(
    requested: Option<DateTime<Utc>>,
    max_age: Option<Duration>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let cap = max_age
        .and_then(|age| chrono::Duration::from_std(age).ok())
        .and_then(|age| now.checked_add_signed(age));
    match (requested, cap) {
        (Some(requested), Some(cap)) => Some(requested.min(cap)),
        (requested, cap) => requested.or(cap),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use test_case::test_case;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> { Utc.timestamp_opt(secs, 0).unwrap() }

    #[test_case(None, None, None ; "no expiry")]
    #[test_case(Some(50), None, Some(50) ; "requested only")]
    #[test_case(None, Some(10), Some(110) ; "max age only")]
    #[test_case(Some(500), Some(10), Some(110) ; "max age caps a later request")]
    #[test_case(Some(105), Some(10), Some(105) ; "earlier request wins")]
    fn test_clamp_expiry(requested: Option<i64>, max_age: Option<u64>, expected: Option<i64>) {
        let clamped = clamp_expiry(
            requested.map(at),
            max_age.map(Duration::from_secs),
            at(100),
        );
        assert_eq!(clamped, expected.map(at));
    }

    #[test]
    fn test_expiry() {
        let item = Item {
            id:         1,
            data:       Bytes::from_static(b"x"),
            added_at:   at(0),
            expires_at: Some(at(10)),
        };
        assert!(!item.is_expired(at(9)));
        assert!(item.is_expired(at(10)));
        assert_eq!(item.age(at(4)), Duration::from_secs(4));
        assert_eq!(item.age(at(-4)), Duration::ZERO);
    }
}
