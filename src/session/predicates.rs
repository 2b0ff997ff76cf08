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

//! Filters for repository lookups; a [`Predicates`] list matches if all of its entries do.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::Info;
use crate::config::FlowName;

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Flow(FlowName),
    RemoteName(String),
    StillValid,
    ExpiredWithThreshold(Duration),
}

pub fn is_flow(flow: &FlowName) -> Predicate {
    Predicate::Flow(flow.clone())
}

/// Matches sessions created by the given requesting user name.
pub fn is_remote_name(name: impl Into<String>) -> Predicate {
    Predicate::RemoteName(name.into())
}

pub fn is_still_valid() -> Predicate {
    Predicate::StillValid
}

pub fn is_expired_with_threshold(threshold: Duration) -> Predicate {
    Predicate::ExpiredWithThreshold(threshold)
}

impl Predicate {
    pub fn matches(&self, info: &Info, now: DateTime<Utc>) -> bool {
        match self {
            Predicate::Flow(flow) => &info.flow == flow,
            Predicate::RemoteName(name) => info.created.remote.user() == name,
            Predicate::StillValid => !info.is_expired_at(now),
            Predicate::ExpiredWithThreshold(threshold) => {
                info.is_expired_with_threshold_at(now, *threshold)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicates(Vec<Predicate>);

impl Predicates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, predicate: Predicate) -> Self {
        self.0.push(predicate);
        self
    }

    /// The flow this list is restricted to, if any; lets lookups skip other flows.
    pub fn flow(&self) -> Option<&FlowName> {
        self.0.iter().find_map(|p| match p {
            Predicate::Flow(flow) => Some(flow),
            _ => None,
        })
    }

    pub fn matches(&self, info: &Info, now: DateTime<Utc>) -> bool {
        self.0.iter().all(|p| p.matches(info, now))
    }
}

impl<const N: usize> From<[Predicate; N]> for Predicates {
    fn from(value: [Predicate; N]) -> Self {
        Self(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Access, SessionId, State};
    use crate::shared::net::Remote;

    fn info(flow: &str, user: &str) -> Info {
        let access = Access {
            at: Utc::now(),
            remote: Remote::new(user, "127.0.0.1:22".parse().unwrap()),
        };
        Info {
            flow: FlowName::new(flow).unwrap(),
            id: SessionId::new(),
            state: State::Authorized,
            created: access.clone(),
            last_accessed: access,
            valid_until: None,
        }
    }

    #[test]
    fn test_all_must_match() {
        let flow = FlowName::new("a").unwrap();
        let predicates =
            Predicates::from([is_flow(&flow), is_remote_name("bob"), is_still_valid()]);
        let now = Utc::now();

        assert!(predicates.matches(&info("a", "bob"), now));
        assert!(!predicates.matches(&info("b", "bob"), now));
        assert!(!predicates.matches(&info("a", "alice"), now));
        assert_eq!(predicates.flow(), Some(&flow));
    }

    #[test]
    fn test_empty_matches_everything() {
        assert!(Predicates::new().matches(&info("x", "y"), Utc::now()));
        assert_eq!(Predicates::new().flow(), None);
    }

    #[test]
    fn test_disposed_is_expired() {
        let mut disposed = info("a", "bob");
        disposed.state = State::Disposed;
        let now = Utc::now();
        assert!(!is_still_valid().matches(&disposed, now));
        assert!(is_expired_with_threshold(Duration::from_secs(3600)).matches(&disposed, now));
    }
}
