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

//! Environments sessions are executed in.
//!
//! A [`Repository`] exists per flow and materialises an [`Environment`] for an
//! authorized session: a local user account, a container or a pod. The
//! environment runs shell, exec and SFTP [`Task`]s and opens connections for
//! port forwards from inside itself.
//!
//! Tasks are channel agnostic. The server feeds client input into
//! [`TaskIo::stdin`], drains [`TaskIo::stdout`]/[`TaskIo::stderr`] into the
//! SSH channel and forwards window changes and signals as [`TaskEvent`]s.

mod container;
mod docker;
mod dummy;
mod facade;
mod kubernetes;
mod local;
pub mod pty;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use docker::DockerRepository;
pub use dummy::DummyRepository;
pub use facade::EnvironmentFacade;
pub use kubernetes::KubernetesRepository;
pub use local::{LocalRepository, LocalToken};
pub use pty::PtyConfig;

use crate::authorization::Authorization;
use crate::config::FlowName;
use crate::session::{Session, SessionId};
use crate::shared::error::{Error, Result};

/// Buffered messages per task stream.
pub const TASK_CHANNEL_CAPACITY: usize = 256;

pub(crate) const IO_BUFFER_SIZE: usize = 8192;

/// Stream to a port forwarding destination.
pub trait DestinationStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DestinationStream for T {}

pub type BoxedStream = Box<dyn DestinationStream>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Interactive shell, or the given command line if present.
    Shell { command: Option<String> },
    Sftp,
}

impl TaskKind {
    pub fn command(&self) -> Option<&str> {
        match self {
            TaskKind::Shell { command } => command.as_deref(),
            TaskKind::Sftp => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Shell { command: None } => f.write_str("shell"),
            TaskKind::Shell { command: Some(_) } => f.write_str("exec"),
            TaskKind::Sftp => f.write_str("sftp"),
        }
    }
}

/// Out-of-band requests of the client while a task runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    WindowChange { cols: u32, rows: u32 },
    /// Signal name without the `SIG` prefix, as sent by SSH clients.
    Signal(String),
}

/// Streams of a running task, seen from the environment.
pub struct TaskIo {
    /// Closed once the client sent EOF.
    pub stdin: mpsc::Receiver<Vec<u8>>,
    pub stdout: mpsc::Sender<Vec<u8>>,
    pub stderr: mpsc::Sender<Vec<u8>>,
    pub events: mpsc::Receiver<TaskEvent>,
}

/// Streams of a running task, seen from the client side.
pub struct TaskPeer {
    pub stdin: mpsc::Sender<Vec<u8>>,
    pub stdout: mpsc::Receiver<Vec<u8>>,
    pub stderr: mpsc::Receiver<Vec<u8>>,
    pub events: mpsc::Sender<TaskEvent>,
}

impl TaskIo {
    pub fn pair() -> (TaskIo, TaskPeer) {
        let (stdin_tx, stdin_rx) = mpsc::channel(TASK_CHANNEL_CAPACITY);
        let (stdout_tx, stdout_rx) = mpsc::channel(TASK_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(TASK_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(16);
        (
            TaskIo {
                stdin: stdin_rx,
                stdout: stdout_tx,
                stderr: stderr_tx,
                events: events_rx,
            },
            TaskPeer {
                stdin: stdin_tx,
                stdout: stdout_rx,
                stderr: stderr_rx,
                events: events_tx,
            },
        )
    }
}

/// One unit of work on an SSH session channel.
pub struct Task {
    pub authorization: Authorization,
    pub kind: TaskKind,
    pub pty: Option<PtyConfig>,
    /// Variables the client sent with `env` requests.
    pub env: BTreeMap<String, String>,
    pub io: TaskIo,
    /// Fired when the connection goes away.
    pub cancel: CancellationToken,
}

impl Task {
    /// Variables every environment passes on: `TZ` of the service, the
    /// authorization's variables and the channel's variables, in that order.
    pub fn base_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Ok(tz) = std::env::var("TZ") {
            env.insert("TZ".to_string(), tz);
        }
        env.extend(self.authorization.env_vars().clone());
        env.extend(self.env.clone());
        env
    }
}

/// Options of [`Repository::find_by_session`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FindOpts {
    /// Environments whose resources vanished are removed from their session
    /// instead of being reported as expired.
    pub auto_clean_up_allowed: bool,
}

/// Options of [`Repository::cleanup`].
pub struct CleanupOpts<'a> {
    /// Whether a flow of this name is still configured.
    pub flow_exists: &'a (dyn Fn(&FlowName) -> bool + Send + Sync),
    /// Whether the session is still known to the session repository.
    pub session_exists: &'a (dyn Fn(&FlowName, &SessionId) -> bool + Send + Sync),
}

impl fmt::Debug for CleanupOpts<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupOpts").finish_non_exhaustive()
    }
}

/// A live resource bound to one session.
#[async_trait]
pub trait Environment: Send + Sync {
    fn session(&self) -> &Session;

    /// Text shown to the client before authentication completes.
    async fn banner(&self, authorization: &Authorization) -> Result<String>;

    /// Run `task` to completion and return its exit code.
    async fn run(&self, task: Task) -> Result<i32>;

    fn is_port_forwarding_allowed(&self) -> bool;

    /// Dial `host:port` from inside the environment.
    async fn new_destination_connection(&self, host: &str, port: u16) -> Result<BoxedStream>;

    /// Release the underlying resource.
    ///
    /// Returns `false` if there was nothing left to release.
    async fn dispose(&self) -> Result<bool>;
}

/// Creates and finds environments of one flow.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Evaluates the flow's `loginAllowed` against `authorization`.
    async fn will_be_accepted(&self, authorization: &Authorization) -> Result<bool>;

    fn does_support_pty(&self, pty: &PtyConfig) -> bool;

    /// Existing environment of the authorization's session, or a new one.
    async fn ensure(&self, authorization: &Authorization) -> Result<Arc<dyn Environment>>;

    /// Fails with [`crate::shared::error::ErrorKind::NotFound`] if the session has none.
    async fn find_by_session(
        &self,
        session: &Session,
        opts: FindOpts,
    ) -> Result<Arc<dyn Environment>>;

    /// Remove resources owned by this flow whose session vanished.
    async fn cleanup(&self, opts: &CleanupOpts<'_>) -> Result<()> {
        let _ = opts;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Copy everything `from` yields into `to` until either side closes.
pub(crate) async fn pump<R: AsyncRead + Unpin>(mut from: R, to: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if to.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Session of an authorization which is about to get an environment.
pub(crate) fn session_of(authorization: &Authorization) -> Result<&Session> {
    authorization
        .session()
        .ok_or_else(|| Error::system("authorization without session"))
}

pub(crate) fn not_acceptable() -> Error {
    Error::permission("environment not acceptable for this authorization")
}

pub(crate) fn no_such_environment(session: &Session) -> Error {
    Error::not_found(format!("no environment for session {session}"))
}
