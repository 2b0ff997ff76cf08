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
//! SSH server of bifroest.
//!
//! The server accepts TCP connections on every configured address, evaluates
//! an optional PROXY protocol header, wraps the stream so connection and
//! session deadlines close it forcibly and hands it to russh with one
//! [`ConnectionHandler`] per connection.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bifroest::config::load_config;
//! use bifroest::server::{Server, Services};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let configuration = load_config(None)?;
//! let services = Arc::new(Services::build(configuration).await?);
//! Server::new(services).run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod connection;
pub mod handler;
pub mod host_keys;
pub mod housekeeper;
pub mod interactive;
pub mod proxy;
pub mod sftp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::Disconnect;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::authorization::AuthorizerFacade;
use crate::config::Configuration;
use crate::environment::EnvironmentFacade;
use crate::session::FsRepository;
use crate::shared::error::is_silent_anyhow;
use crate::shared::net::{parse_listen_address, ConnectionId};

pub use self::connection::{ConnectionTimer, DeadlineStream};
pub use self::handler::ConnectionHandler;
pub use self::housekeeper::HouseKeeper;

/// Identification string sent to clients.
pub const SERVER_ID: &str = "SSH-2.0-Engity-Bifroest";

/// How long a client may take to send its PROXY header.
const PROXY_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection needs, shared by all of them.
pub struct Services {
    pub configuration: Arc<Configuration>,
    pub sessions: FsRepository,
    pub authorizers: AuthorizerFacade,
    pub environments: EnvironmentFacade,
}

impl Services {
    /// Close authorizers and environment repositories.
    pub async fn close(&self) {
        if let Err(err) = self.authorizers.close().await {
            tracing::warn!(error = %err, "Cannot close authorizers");
        }
        if let Err(err) = self.environments.close().await {
            tracing::warn!(error = %err, "Cannot close environments");
        }
    }
}

/// Releases its slot of the global connection limit when dropped.
struct ConnectionSlot(Arc<AtomicU32>);

impl ConnectionSlot {
    /// Take a slot unless `max` connections are active already.
    fn try_acquire(active: &Arc<AtomicU32>, max: u32) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Self(Arc::clone(active))),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The SSH server.
#[derive(Clone)]
pub struct Server {
    services: Arc<Services>,
    active: Arc<AtomicU32>,
}

impl Server {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            active: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Currently open client connections.
    pub fn active_connections(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    fn build_russh_config(&self) -> Result<russh::server::Config> {
        let ssh = &self.services.configuration.ssh;
        let keys = host_keys::load_all(&ssh.keys.host_keys)?;
        tracing::info!(key_count = keys.len(), "Loaded host keys");

        Ok(russh::server::Config {
            server_id: russh::SshId::Standard(SERVER_ID.to_string()),
            keys,
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            max_auth_attempts: usize::from(ssh.max_auth_tries),
            // Deadlines are enforced by the connection stream.
            inactivity_timeout: None,
            ..Default::default()
        })
    }

    /// Bind every configured address.
    pub async fn bind(&self) -> Result<Vec<TcpListener>> {
        let mut listeners = Vec::new();
        for address in &self.services.configuration.ssh.addresses {
            let addr = parse_listen_address(address)
                .with_context(|| format!("Invalid listen address: {address}"))?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind to {address}"))?;
            tracing::info!(local_addr = ?listener.local_addr(), "SSH server listening");
            listeners.push(listener);
        }
        Ok(listeners)
    }

    /// Bind, start the housekeeper and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listeners = self.bind().await?;
        self.serve(listeners, shutdown).await
    }

    /// Serve connections of already bound listeners until `shutdown` fires.
    pub async fn serve(
        &self,
        listeners: Vec<TcpListener>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let config = Arc::new(self.build_russh_config()?);

        let housekeeper = Arc::new(HouseKeeper::new(Arc::clone(&self.services)))
            .start(shutdown.child_token())
            .await
            .context("Failed to start housekeeping")?;

        let mut accepting = JoinSet::new();
        for listener in listeners {
            accepting.spawn(self.clone().accept_loop(
                listener,
                Arc::clone(&config),
                shutdown.clone(),
            ));
        }

        shutdown.cancelled().await;
        tracing::info!(active = self.active_connections(), "Shutting down SSH server");

        while accepting.join_next().await.is_some() {}
        let _ = housekeeper.await;
        self.services.close().await;
        Ok(())
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        config: Arc<russh::server::Config>,
        shutdown: CancellationToken,
    ) {
        let max = self.services.configuration.ssh.max_connections;
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "Cannot accept connection");
                        continue;
                    }
                },
                _ = shutdown.cancelled() => break,
            };

            let Some(slot) = ConnectionSlot::try_acquire(&self.active, max) else {
                tracing::info!(peer = %peer, max, "Max connections reached; closing forcibly");
                drop(stream);
                continue;
            };

            tokio::spawn(serve_connection(
                Arc::clone(&self.services),
                Arc::clone(&config),
                stream,
                peer,
                shutdown.clone(),
                slot,
            ));
        }
    }
}

async fn serve_connection(
    services: Arc<Services>,
    config: Arc<russh::server::Config>,
    mut stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
    _slot: ConnectionSlot,
) {
    let _ = stream.set_nodelay(true);
    let ssh = &services.configuration.ssh;

    let peer = if ssh.proxy_protocol {
        match tokio::time::timeout(PROXY_HEADER_TIMEOUT, proxy::read_header(&mut stream)).await {
            Ok(Ok(Some(source))) => source,
            Ok(Ok(None)) => peer,
            Ok(Err(err)) => {
                tracing::info!(peer = %peer, error = %err, "Invalid PROXY header; closing");
                return;
            }
            Err(_) => {
                tracing::info!(peer = %peer, "No PROXY header received in time; closing");
                return;
            }
        }
    } else {
        peer
    };

    let id = ConnectionId::new();
    let timer = Arc::new(ConnectionTimer::new(id, ssh.idle_timeout.get(), ssh.max_timeout.get()));
    let stream = DeadlineStream::new(stream, Arc::clone(&timer));
    let handler =
        ConnectionHandler::new(Arc::clone(&services), timer, peer, shutdown.child_token());
    tracing::info!(connection = %id, peer = %peer, "New client connection");

    let session = match russh::server::run_stream(config, stream, handler).await {
        Ok(session) => session,
        Err(err) => {
            tracing::debug!(connection = %id, error = %err, "Handshake failed");
            return;
        }
    };
    let handle = session.handle();

    tokio::select! {
        result = session => match result {
            Ok(()) => {}
            Err(err) if is_silent_anyhow(&err) => {
                tracing::debug!(connection = %id, error = %err, "Connection ended");
            }
            Err(err) => {
                tracing::warn!(connection = %id, error = %err, "Connection failed");
            }
        },
        _ = shutdown.cancelled() => {
            let _ = handle
                .disconnect(
                    Disconnect::ByApplication,
                    "server is shutting down".to_string(),
                    "en".to_string(),
                )
                .await;
        }
    }
}
