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

//! Per-connection view on a session.
//!
//! Every connection bound to a session holds one [`Interceptor`]. All
//! interceptors of the same session share a counter (bounded by
//! `session.maxConnections`) and the time of the last activity, from which
//! the session deadlines are derived on every read and write.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;

use super::SessionId;
use crate::config::FlowName;
use crate::shared::error::{Error, Result};

/// Message of the error returned when a session has no connection slot left.
pub const MAX_CONNECTIONS_REACHED: &str = "maximum connections per session reached";

/// Which bound produced a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadlineTag {
    SessionIdle,
    SessionMax,
    ConnectionIdle,
    ConnectionMax,
}

impl DeadlineTag {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadlineTag::SessionIdle => "session-idle",
            DeadlineTag::SessionMax => "session-max",
            DeadlineTag::ConnectionIdle => "connection-idle",
            DeadlineTag::ConnectionMax => "connection-max",
        }
    }
}

impl fmt::Display for DeadlineTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(super) type StackKey = (FlowName, SessionId);

/// State shared by all connections of one session.
pub(super) struct Stack {
    created: DateTime<Utc>,
    last_activity: AtomicI64,
    active: AtomicU32,
    disposed: AtomicBool,
}

impl Stack {
    fn new(created: DateTime<Utc>) -> Self {
        Self {
            created,
            last_activity: AtomicI64::new(Utc::now().timestamp_millis()),
            active: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
        }
    }
}

/// Live interceptor stacks of a repository.
#[derive(Default)]
pub(super) struct Stacks {
    by_session: Arc<DashMap<StackKey, Arc<Stack>>>,
}

impl Stacks {
    pub(super) fn acquire(
        &self,
        key: StackKey,
        created: DateTime<Utc>,
        idle_timeout: Duration,
        max_timeout: Duration,
        max_connections: u16,
    ) -> Result<Interceptor> {
        let entry = self
            .by_session
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Stack::new(created)));
        let active = entry.active.fetch_add(1, Ordering::SeqCst) + 1;
        if max_connections > 0 && active > u32::from(max_connections) {
            entry.active.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::permission(MAX_CONNECTIONS_REACHED).user_facing());
        }
        let stack = Arc::clone(&entry);
        drop(entry);

        Ok(Interceptor {
            key: Some(key),
            stack,
            stacks: Arc::clone(&self.by_session),
            idle_timeout,
            max_timeout,
        })
    }

    /// Signal every live connection of the session that it is gone.
    pub(super) fn mark_disposed(&self, key: &StackKey) {
        if let Some(stack) = self.by_session.get(key) {
            stack.disposed.store(true, Ordering::SeqCst);
        }
    }

    pub(super) fn active(&self, key: &StackKey) -> u32 {
        self.by_session
            .get(key)
            .map(|s| s.active.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// Held for the lifetime of one connection; releases its slot on drop.
pub struct Interceptor {
    key: Option<StackKey>,
    stack: Arc<Stack>,
    stacks: Arc<DashMap<StackKey, Arc<Stack>>>,
    idle_timeout: Duration,
    max_timeout: Duration,
}

impl Interceptor {
    /// Record activity on the connection; pushes the session idle deadline.
    pub fn touch(&self) {
        self.stack
            .last_activity
            .fetch_max(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// The tighter of the session idle and max deadlines.
    ///
    /// Fails with [`ErrorKind::Expired`](crate::shared::ErrorKind::Expired) once the
    /// session was disposed or deleted.
    pub fn deadline(&self) -> Result<Option<(DateTime<Utc>, DeadlineTag)>> {
        if self.stack.disposed.load(Ordering::SeqCst) {
            return Err(Error::expired("session disposed"));
        }

        let mut result = None;
        if !self.idle_timeout.is_zero() {
            let last = self.stack.last_activity.load(Ordering::SeqCst);
            if let Some(last) = Utc.timestamp_millis_opt(last).single() {
                result = Some((
                    last + super::chrono_duration(self.idle_timeout),
                    DeadlineTag::SessionIdle,
                ));
            }
        }
        if !self.max_timeout.is_zero() {
            let max = self.stack.created + super::chrono_duration(self.max_timeout);
            if result.map_or(true, |(at, _)| at > max) {
                result = Some((max, DeadlineTag::SessionMax));
            }
        }
        Ok(result)
    }

    /// Number of connections currently bound to the same session.
    pub fn active_connections(&self) -> u32 {
        self.stack.active.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("active", &self.active_connections())
            .field("disposed", &self.stack.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        self.stack.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(key) = self.key.take() {
            self.stacks
                .remove_if(&key, |_, stack| stack.active.load(Ordering::SeqCst) == 0);
        }
    }
}
