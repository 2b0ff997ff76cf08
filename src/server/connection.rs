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

//! Transport stream wrapper enforcing connection and session deadlines.
//!
//! Every read and write consults the [`ConnectionTimer`] of the connection.
//! The earliest of the session bounds (supplied by the session's
//! [`Interceptor`] once the client is authorized) and the connection bounds
//! (`ssh.idleTimeout`, `ssh.maxTimeout`) wins. Once it passed, the stream
//! fails every further operation with [`io::ErrorKind::TimedOut`].

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::session::{DeadlineTag, Interceptor};
use crate::shared::net::ConnectionId;

const SESSION_DISPOSED: &str = "session-disposed";

/// Deadline bookkeeping of one connection.
pub struct ConnectionTimer {
    id: ConnectionId,
    started: Instant,
    /// Milliseconds since `started`.
    last_activity: AtomicU64,
    idle_timeout: Duration,
    max_timeout: Duration,
    interceptor: Mutex<Option<Interceptor>>,
}

impl ConnectionTimer {
    /// Zero durations disable the respective bound.
    pub fn new(id: ConnectionId, idle_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            id,
            started: Instant::now(),
            last_activity: AtomicU64::new(0),
            idle_timeout,
            max_timeout,
            interceptor: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Attach the interceptor of the session this connection got authorized for.
    ///
    /// Returns `false` and drops `interceptor` if one is already attached.
    pub fn bind(&self, interceptor: Interceptor) -> bool {
        let mut current = self.interceptor.lock();
        if current.is_some() {
            return false;
        }
        *current = Some(interceptor);
        true
    }

    pub fn is_bound(&self) -> bool {
        self.interceptor.lock().is_some()
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(elapsed, Ordering::SeqCst);
        if let Some(interceptor) = self.interceptor.lock().as_ref() {
            interceptor.touch();
        }
    }

    /// The earliest deadline currently applying, and which bound produced it.
    ///
    /// Fails with the reason once the bound session was disposed.
    pub fn deadline(&self) -> Result<Option<(Instant, DeadlineTag)>, &'static str> {
        let now = Instant::now();
        let mut result = None;

        if let Some(interceptor) = self.interceptor.lock().as_ref() {
            match interceptor.deadline() {
                Ok(Some((at, tag))) => {
                    let remaining = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    result = Some((now + remaining, tag));
                }
                Ok(None) => {}
                Err(_) => return Err(SESSION_DISPOSED),
            }
        }

        if !self.idle_timeout.is_zero() {
            let last = Duration::from_millis(self.last_activity.load(Ordering::SeqCst));
            let at = self.started + last + self.idle_timeout;
            if result.map_or(true, |(current, _)| current > at) {
                result = Some((at, DeadlineTag::ConnectionIdle));
            }
        }

        if !self.max_timeout.is_zero() {
            let at = self.started + self.max_timeout;
            if result.map_or(true, |(current, _)| current > at) {
                result = Some((at, DeadlineTag::ConnectionMax));
            }
        }

        Ok(result)
    }
}

/// Stream which fails once the deadline of its [`ConnectionTimer`] passed.
pub struct DeadlineStream<S> {
    inner: S,
    timer: Arc<ConnectionTimer>,
    sleep: Pin<Box<Sleep>>,
    expired: Option<&'static str>,
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S, timer: Arc<ConnectionTimer>) -> Self {
        Self {
            inner,
            timer,
            sleep: Box::pin(tokio::time::sleep(Duration::ZERO)),
            expired: None,
        }
    }

    /// Reason the deadline fired with, if it did.
    pub fn expired(&self) -> Option<&'static str> {
        self.expired
    }

    fn expire(&mut self, reason: &'static str) -> io::Error {
        if self.expired.is_none() {
            tracing::info!(
                connection = %self.timer.id(),
                reason = reason,
                "Connection will be forcibly closed"
            );
            self.expired = Some(reason);
        }
        deadline_exceeded(reason)
    }

    fn check(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if let Some(reason) = self.expired {
            return Err(deadline_exceeded(reason));
        }

        let (at, tag) = match self.timer.deadline() {
            Ok(Some(deadline)) => deadline,
            Ok(None) => return Ok(()),
            Err(reason) => return Err(self.expire(reason)),
        };

        if Instant::now() >= at {
            return Err(self.expire(tag.as_str()));
        }
        if self.sleep.deadline() != at {
            self.sleep.as_mut().reset(at);
        }
        if self.sleep.as_mut().poll(cx).is_ready() {
            return Err(self.expire(tag.as_str()));
        }
        Ok(())
    }
}

fn deadline_exceeded(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("deadline exceeded ({reason})"))
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check(cx)?;

        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            if buf.filled().len() > before {
                this.timer.touch();
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check(cx)?;
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
