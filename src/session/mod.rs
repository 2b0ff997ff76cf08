// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Persistent sessions.
//!
//! A session spans every connection of one authorized principal within one
//! flow. It is keyed by `(FlowName, SessionId)` and carries the opaque
//! authorization and environment tokens, the public keys trusted for it and
//! the access metadata the validity window is derived from.
//!
//! # Types
//!
//! - [`FsRepository`]: Filesystem backed repository and the only writer of records
//! - [`Session`]: Cheap, cloneable handle to one record
//! - [`Info`]: Point-in-time snapshot of a record
//! - [`Predicate`]/[`Predicates`]: Filters for repository lookups
//! - [`Interceptor`]: Per-connection deadline source and connection counter

mod fs;
mod interceptor;
mod predicates;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::FlowName;
use crate::shared::net::Remote;

pub use fs::{FindOpts, FsRepository, Session};
pub use interceptor::{DeadlineTag, Interceptor, MAX_CONNECTIONS_REACHED};
pub use predicates::{
    is_expired_with_threshold, is_flow, is_remote_name, is_still_valid, Predicate, Predicates,
};

/// Identifies a session within its flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a session record. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    New,
    Authorized,
    Disposed,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::New => "new",
            State::Authorized => "authorized",
            State::Disposed => "disposed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When and from where a record was touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub at: DateTime<Utc>,
    pub remote: Remote,
}

/// Snapshot of a session record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub flow: FlowName,
    pub id: SessionId,
    pub state: State,
    pub created: Access,
    pub last_accessed: Access,
    /// `None` if neither an idle nor a max lifetime applies.
    pub valid_until: Option<DateTime<Utc>>,
}

impl Info {
    /// Disposed, or past its validity window.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_expired_with_threshold_at(now, std::time::Duration::ZERO)
    }

    /// Expired for at least `threshold`. A disposed record keeps counting from
    /// its validity window so it is retained for the same grace period.
    pub fn is_expired_with_threshold_at(
        &self,
        now: DateTime<Utc>,
        threshold: std::time::Duration,
    ) -> bool {
        match (self.state, self.valid_until) {
            (State::Disposed, Some(valid_until)) if !threshold.is_zero() => {
                now >= valid_until + chrono_duration(threshold)
            }
            (State::Disposed, _) => true,
            (_, Some(valid_until)) => now >= valid_until + chrono_duration(threshold),
            (_, None) => false,
        }
    }
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flow, self.id)
    }
}

/// `min(created + max, last_accessed + idle)`; zero durations do not limit.
pub fn valid_until(
    created: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    idle_timeout: std::time::Duration,
    max_timeout: std::time::Duration,
) -> Option<DateTime<Utc>> {
    let by_max = (!max_timeout.is_zero()).then(|| created + chrono_duration(max_timeout));
    let by_idle = (!idle_timeout.is_zero()).then(|| last_accessed + chrono_duration(idle_timeout));
    match (by_max, by_idle) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

pub(crate) fn chrono_duration(value: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(value).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn info(state: State, valid_until: Option<DateTime<Utc>>) -> Info {
        let now = Utc::now();
        let access = Access {
            at: now,
            remote: Remote::new("alice", "10.0.0.5:4711".parse().unwrap()),
        };
        Info {
            flow: FlowName::new("a").unwrap(),
            id: SessionId::new(),
            state,
            created: access.clone(),
            last_accessed: access,
            valid_until,
        }
    }

    #[test]
    fn test_valid_until_takes_tighter_bound() {
        let created = Utc::now();
        let last = created + chrono::Duration::seconds(50);
        let vu = valid_until(created, last, Duration::from_secs(30), Duration::from_secs(60));
        assert_eq!(vu, Some(created + chrono::Duration::seconds(60)));

        let vu = valid_until(created, last, Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(vu, Some(last + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_valid_until_zero_means_unlimited() {
        let now = Utc::now();
        assert_eq!(valid_until(now, now, Duration::ZERO, Duration::ZERO), None);
        assert_eq!(
            valid_until(now, now, Duration::ZERO, Duration::from_secs(1)),
            Some(now + chrono::Duration::seconds(1))
        );
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        assert!(info(State::Disposed, None).is_expired_at(now));
        assert!(!info(State::Authorized, None).is_expired_at(now));

        let past = info(State::Authorized, Some(now - chrono::Duration::seconds(1)));
        assert!(past.is_expired_at(now));
        assert!(!past.is_expired_with_threshold_at(now, Duration::from_secs(10)));
        assert!(past.is_expired_with_threshold_at(
            now + chrono::Duration::seconds(10),
            Duration::from_secs(10)
        ));
    }

    #[test]
    fn test_state_order() {
        assert!(State::New < State::Authorized);
        assert!(State::Authorized < State::Disposed);
        assert_eq!(State::Authorized.to_string(), "authorized");
    }

    #[test]
    fn test_session_id_roundtrip() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
    }
}
