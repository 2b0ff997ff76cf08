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
//! Bridges between SSH channels and environment tasks or forwarded sockets.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use russh::server::Handle;
use russh::{ChannelId, CryptoVec, Sig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Services;
use crate::authorization::Authorization;
use crate::environment::{PtyConfig, Task, TaskEvent, TaskIo, TaskKind};
use crate::shared::error::{exit_code_of, is_silent, Error, Result};

/// Per channel state collected until the client asks for a shell, exec or subsystem.
#[derive(Default)]
pub struct ChannelState {
    pub pty: Option<PtyConfig>,
    pub env: BTreeMap<String, String>,
    pub running: Option<RunningTask>,
    pub cancel: CancellationToken,
}

/// Client side of a task which was already started.
pub struct RunningTask {
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    events: mpsc::Sender<TaskEvent>,
}

impl RunningTask {
    /// Queue client input; never blocks the connection.
    pub fn write(&self, data: &[u8]) {
        if let Some(stdin) = &self.stdin {
            let _ = stdin.send(data.to_vec());
        }
    }

    /// The client sent EOF; the task sees its stdin closed once the queue drained.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    pub fn notify(&self, event: TaskEvent) {
        if let Err(err) = self.events.try_send(event) {
            tracing::debug!(error = %err, "Dropped task event");
        }
    }
}

/// Everything needed to run one task on behalf of a session channel.
pub struct SessionTask {
    pub services: Arc<Services>,
    pub authorization: Authorization,
    pub channel: ChannelId,
    pub handle: Handle,
    pub kind: TaskKind,
    pub pty: Option<PtyConfig>,
    pub env: BTreeMap<String, String>,
    pub cancel: CancellationToken,
    /// Shown before anything else, once per new session.
    pub remember_me: Option<String>,
}

impl SessionTask {
    /// Spawn the task and return the handle the connection feeds client input into.
    pub fn spawn(self) -> RunningTask {
        let (io, peer) = TaskIo::pair();

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let stdin = peer.stdin;
        tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if stdin.send(data).await.is_err() {
                    break;
                }
            }
        });

        let running = RunningTask {
            stdin: Some(stdin_tx),
            events: peer.events,
        };

        let output = tokio::spawn(forward_output(
            self.handle.clone(),
            self.channel,
            peer.stdout,
            peer.stderr,
        ));

        tokio::spawn(async move {
            let handle = self.handle.clone();
            let channel = self.channel;
            let cancel = self.cancel.clone();
            let kind = self.kind.clone();
            let remote = self.authorization.remote().clone();

            let (code, err) = match self.execute(io).await {
                Ok(code) => (code, None),
                Err(err) => (-1, Some(err)),
            };
            let _ = output.await;

            if let Some(err) = &err {
                if err.is_user_facing() {
                    let text = format!("{}\r\n", err.message());
                    let _ = handle
                        .extended_data(channel, 1, CryptoVec::from_slice(text.as_bytes()))
                        .await;
                }
                if is_silent(err) || cancel.is_cancelled() {
                    tracing::debug!(remote = %remote, task = %kind, error = %err, "Task ended");
                } else {
                    tracing::error!(remote = %remote, task = %kind, error = %err, "Task failed");
                }
            }

            let code = exit_code_of(code, err.as_ref(), cancel.is_cancelled());
            tracing::info!(remote = %remote, task = %kind, exit_code = code, "Task done");

            let _ = handle.exit_status_request(channel, code as u32).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });

        running
    }

    async fn execute(self, io: TaskIo) -> Result<i32> {
        let environment = self.services.environments.ensure(&self.authorization).await?;

        if let Some(text) = &self.remember_me {
            let _ = io.stdout.send(text.clone().into_bytes()).await;
        }
        if self.kind == (TaskKind::Shell { command: None }) {
            let banner = environment.banner(&self.authorization).await?;
            if !banner.is_empty() {
                let _ = io.stdout.send(banner.into_bytes()).await;
            }
        }

        environment
            .run(Task {
                authorization: self.authorization,
                kind: self.kind,
                pty: self.pty,
                env: self.env,
                io,
                cancel: self.cancel,
            })
            .await
    }
}

async fn forward_output(
    handle: Handle,
    channel: ChannelId,
    mut stdout: mpsc::Receiver<Vec<u8>>,
    mut stderr: mpsc::Receiver<Vec<u8>>,
) {
    let mut stdout_open = true;
    let mut stderr_open = true;
    while stdout_open || stderr_open {
        tokio::select! {
            data = stdout.recv(), if stdout_open => match data {
                Some(data) => {
                    if handle.data(channel, CryptoVec::from_slice(&data)).await.is_err() {
                        break;
                    }
                }
                None => stdout_open = false,
            },
            data = stderr.recv(), if stderr_open => match data {
                Some(data) => {
                    if handle
                        .extended_data(channel, 1, CryptoVec::from_slice(&data))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => stderr_open = false,
            },
        }
    }
}

/// Signal name as environments expect it: without `SIG` prefix.
pub fn signal_name(signal: &Sig) -> String {
    match signal {
        Sig::ABRT => "ABRT".to_string(),
        Sig::ALRM => "ALRM".to_string(),
        Sig::FPE => "FPE".to_string(),
        Sig::HUP => "HUP".to_string(),
        Sig::ILL => "ILL".to_string(),
        Sig::INT => "INT".to_string(),
        Sig::KILL => "KILL".to_string(),
        Sig::PIPE => "PIPE".to_string(),
        Sig::QUIT => "QUIT".to_string(),
        Sig::SEGV => "SEGV".to_string(),
        Sig::TERM => "TERM".to_string(),
        Sig::USR1 => "USR1".to_string(),
        Sig::Custom(name) => name.trim_start_matches("SIG").to_string(),
    }
}

/// Message presented for a port forward whose destination could not be reached.
pub fn dial_failure_message(host: &str, port: u16, err: &Error) -> String {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            let reason = match io_err.kind() {
                io::ErrorKind::ConnectionRefused => Some("connection refused"),
                io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                    Some("host unreachable")
                }
                io::ErrorKind::UnexpectedEof => Some("EOF"),
                _ => None,
            };
            if let Some(reason) = reason {
                return format!("cannot connect to {host}:{port}: {reason}");
            }
        }
        current = e.source();
    }
    if err.is_user_facing() {
        return format!("cannot connect to {host}:{port}: {}", err.message());
    }
    "internal error".to_string()
}

/// Socket address a `tcpip-forward` request of `address` binds to.
pub fn bind_address(address: &str, port: u32) -> String {
    match address {
        "" | "*" | "0.0.0.0" => format!("0.0.0.0:{port}"),
        "::" => format!("[::]:{port}"),
        "localhost" => format!("127.0.0.1:{port}"),
        a if a.contains(':') => format!("[{a}]:{port}"),
        a => format!("{a}:{port}"),
    }
}

/// Copy between a channel and a socket until either side closes or `cancel` fires.
pub async fn splice<A, B>(mut a: A, mut b: B, cancel: CancellationToken) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut a, &mut b) => result,
        _ = cancel.cancelled() => Ok((0, 0)),
    }
}

/// Accept connections of a remote forward and open a `forwarded-tcpip` channel for each.
pub async fn serve_forwarded(
    listener: TcpListener,
    handle: Handle,
    address: String,
    port: u32,
    cancel: CancellationToken,
) {
    loop {
        let (stream, origin) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(
                        address = %address,
                        port,
                        error = %err,
                        "Cannot accept forwarded connection"
                    );
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };

        let channel = match handle
            .channel_open_forwarded_tcpip(
                address.clone(),
                port,
                origin.ip().to_string(),
                u32::from(origin.port()),
            )
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                tracing::debug!(
                    address = %address,
                    port,
                    origin = %origin,
                    error = %err,
                    "Client refused forwarded connection"
                );
                continue;
            }
        };

        let cancel = cancel.child_token();
        let address = address.clone();
        tokio::spawn(async move {
            match splice(channel.into_stream(), stream, cancel).await {
                Ok((up, down)) => tracing::debug!(
                    address = %address,
                    port,
                    origin = %origin,
                    up,
                    down,
                    "Forwarded connection closed"
                ),
                Err(err) => tracing::debug!(
                    address = %address,
                    port,
                    origin = %origin,
                    error = %err,
                    "Forwarded connection failed"
                ),
            }
        });
    }
    tracing::debug!(address = %address, port, "Remote forward stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_name() {
        assert_eq!(signal_name(&Sig::INT), "INT");
        assert_eq!(signal_name(&Sig::Custom("SIGWINCH".to_string())), "WINCH");
        assert_eq!(signal_name(&Sig::Custom("USR2".to_string())), "USR2");
    }

    #[test]
    fn test_dial_failure_message() {
        let refused = Error::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(
            dial_failure_message("db", 5432, &refused),
            "cannot connect to db:5432: connection refused"
        );

        let wrapped = Error::wrap(
            crate::shared::error::ErrorKind::Network,
            "dial",
            io::Error::from(io::ErrorKind::UnexpectedEof),
        );
        assert_eq!(dial_failure_message("db", 1, &wrapped), "cannot connect to db:1: EOF");

        assert_eq!(
            dial_failure_message("db", 1, &Error::system("docker exec failed")),
            "internal error"
        );
    }

    #[test]
    fn test_bind_address() {
        assert_eq!(bind_address("", 80), "0.0.0.0:80");
        assert_eq!(bind_address("localhost", 8080), "127.0.0.1:8080");
        assert_eq!(bind_address("::1", 22), "[::1]:22");
        assert_eq!(bind_address("10.0.0.1", 0), "10.0.0.1:0");
    }

    #[tokio::test]
    async fn test_splice_copies_both_ways() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (left, mut left_peer) = tokio::io::duplex(64);
        let (right, mut right_peer) = tokio::io::duplex(64);
        let copying = tokio::spawn(splice(left, right, CancellationToken::new()));

        left_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right_peer.write_all(b"pong").await.unwrap();
        left_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(left_peer);
        drop(right_peer);
        let (up, down) = copying.await.unwrap().unwrap();
        assert_eq!((up, down), (4, 4));
    }
}
