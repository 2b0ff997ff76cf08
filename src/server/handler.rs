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
//! SSH handler implementation for the russh server.
//!
//! One [`ConnectionHandler`] exists per client connection. It authorizes the
//! client against the configured flows, binds the connection to the session's
//! connection limits and bridges session channels, port forwards and remote
//! forwards to the session's environment.

use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use russh::keys::{HashAlg, PublicKey};
use russh::server::{Auth, Msg, Response, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty, Sig};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::channel::{
    bind_address, dial_failure_message, serve_forwarded, signal_name, splice, ChannelState,
    SessionTask,
};
use super::connection::ConnectionTimer;
use super::interactive::{Interactive, Step};
use super::Services;
use crate::authorization::{Authorization, RequestContext};
use crate::environment::{PtyConfig, TaskEvent, TaskKind};
use crate::session::State;
use crate::shared::error::{Error, ErrorKind, Result};
use crate::shared::net::Remote;
use crate::template::RenderContext;

/// Authorization of a channel together with what it did to its session.
struct Resolved {
    authorization: Authorization,
    /// Rendered remember-me notification if a key was captured for a new session.
    remember_me: Option<String>,
}

/// SSH handler for a single client connection.
pub struct ConnectionHandler {
    services: Arc<Services>,
    timer: Arc<ConnectionTimer>,

    /// Remote address of the connected client, after PROXY header evaluation.
    peer: SocketAddr,

    /// Cancelled once the connection is gone; parent of every channel task.
    cancel: CancellationToken,
    started: Instant,

    auth_attempts: u32,

    /// First verified public key of the handshake.
    ///
    /// Kept if the key itself did not authorize the client so it can be
    /// remembered for the session another method creates.
    handshake_key: Option<PublicKey>,
    authorization: Option<Authorization>,
    interactive: Option<Interactive>,

    channels: HashMap<ChannelId, ChannelState>,
    forwards: HashMap<(String, u32), CancellationToken>,
}

impl ConnectionHandler {
    pub fn new(
        services: Arc<Services>,
        timer: Arc<ConnectionTimer>,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            services,
            timer,
            peer,
            cancel,
            started: Instant::now(),
            auth_attempts: 0,
            handshake_key: None,
            authorization: None,
            interactive: None,
            channels: HashMap::new(),
            forwards: HashMap::new(),
        }
    }

    pub fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    fn allowed_methods() -> MethodSet {
        let mut methods = MethodSet::empty();
        methods.push(MethodKind::PublicKey);
        methods.push(MethodKind::Password);
        methods.push(MethodKind::KeyboardInteractive);
        methods
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(Self::allowed_methods()),
            partial_success: false,
        }
    }

    fn remote(&self, user: &str) -> Remote {
        Remote::new(user, self.peer)
    }

    /// Count an attempt; `true` once `ssh.maxAuthTries` is exceeded.
    fn attempts_exceeded(&mut self) -> bool {
        self.auth_attempts += 1;
        let max = u32::from(self.services.configuration.ssh.max_auth_tries);
        max > 0 && self.auth_attempts > max
    }

    /// Turn the outcome of an authorizer into the answer for the client.
    ///
    /// A successful authorization occupies one connection slot of its session;
    /// if there is none left the connection is closed.
    async fn conclude(
        &mut self,
        remote: &Remote,
        method: &'static str,
        result: Result<Authorization>,
    ) -> anyhow::Result<Auth> {
        let connection = self.timer.id();
        let authorization = match result {
            Ok(authorization) if authorization.is_authorized() => authorization,
            Ok(_) => {
                tracing::debug!(%connection, %remote, method, "Rejected");
                return Ok(Self::reject());
            }
            Err(err) if err.kind() == ErrorKind::User || err.is_user_facing() => {
                tracing::debug!(%connection, %remote, method, error = %err, "Rejected");
                return Ok(Self::reject());
            }
            Err(err) => {
                tracing::warn!(
                    %connection,
                    %remote,
                    method,
                    error = %err,
                    "Cannot authorize; treat as rejected"
                );
                return Ok(Self::reject());
            }
        };

        let Some(session) = authorization.session() else {
            tracing::warn!(
                %connection,
                %remote,
                method,
                "Authorization without session; treat as rejected"
            );
            return Ok(Self::reject());
        };

        match session.connection_interceptor().await {
            Ok(interceptor) => {
                self.timer.bind(interceptor);
            }
            Err(err) if err.kind() == ErrorKind::Permission => {
                tracing::info!(
                    %connection,
                    %remote,
                    session = %session,
                    "Max connections per session reached; closing forcibly"
                );
                return Err(err.into());
            }
            Err(err) => {
                tracing::warn!(
                    %connection,
                    %remote,
                    session = %session,
                    error = %err,
                    "Cannot bind connection to session; treat as rejected"
                );
                return Ok(Self::reject());
            }
        }

        tracing::info!(%connection, %remote, method, authorization = %authorization, "Authorized");
        self.authorization = Some(authorization);
        Ok(Auth::Accept)
    }

    /// Mark the session authorized and remember the handshake key for new sessions.
    async fn resolve_session(&mut self) -> Result<Resolved> {
        let authorization = self
            .authorization
            .clone()
            .ok_or_else(|| Error::permission("not authorized"))?;
        let session = authorization
            .session()
            .ok_or_else(|| Error::system("authorization without session"))?;

        let old_state = session
            .notify_last_access(authorization.remote(), Some(State::Authorized))
            .await?;
        if old_state != State::New {
            return Ok(Resolved {
                authorization,
                remember_me: None,
            });
        }

        let mut key = authorization.sessions_public_key().cloned();
        if let Some(handshake_key) = self.handshake_key.take() {
            if session.add_public_key(&handshake_key).await? {
                key = Some(handshake_key);
            }
        }

        let remember_me = match key {
            Some(key) => self.render_remember_me(&authorization, &key),
            None => None,
        };
        Ok(Resolved {
            authorization,
            remember_me,
        })
    }

    fn render_remember_me(&self, authorization: &Authorization, key: &PublicKey) -> Option<String> {
        let template = &self.services.configuration.ssh.keys.remember_me_notification;
        if template.is_empty() {
            return None;
        }
        let session_id = authorization.session().map(|s| s.id().to_string());
        let ctx = RenderContext::empty()
            .with("authorization", authorization.to_value())
            .with(
                "key",
                json!({
                    "type": key.algorithm().as_str(),
                    "fingerprint": key.fingerprint(HashAlg::Sha256).to_string(),
                }),
            )
            .with("session", json!({"id": session_id, "new": true}));
        match template.render(&ctx) {
            Ok(text) if !text.is_empty() => Some(text),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(
                    connection = %self.timer.id(),
                    error = %err,
                    "Cannot render remember me notification"
                );
                None
            }
        }
    }

    async fn start_task(
        &mut self,
        channel: ChannelId,
        kind: TaskKind,
        session: &mut Session,
    ) -> anyhow::Result<()> {
        let connection = self.timer.id();
        match self.channels.get(&channel) {
            Some(state) if state.running.is_none() => {}
            _ => {
                tracing::debug!(
                    %connection,
                    channel = ?channel,
                    task = %kind,
                    "Task request for unknown or busy channel"
                );
                session.channel_failure(channel)?;
                return Ok(());
            }
        }

        let resolved = match self.resolve_session().await {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::warn!(
                    %connection,
                    channel = ?channel,
                    task = %kind,
                    error = %err,
                    "Cannot resolve session of channel"
                );
                session.channel_failure(channel)?;
                return Ok(());
            }
        };

        let Some(state) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };

        let remember_me = match kind {
            TaskKind::Shell { command: None } => resolved.remember_me,
            _ => None,
        };

        tracing::debug!(
            %connection,
            channel = ?channel,
            task = %kind,
            pty = state.pty.is_some(),
            "Starting task"
        );
        let task = SessionTask {
            services: self.services.clone(),
            authorization: resolved.authorization,
            channel,
            handle: session.handle(),
            kind,
            pty: state.pty.clone(),
            env: std::mem::take(&mut state.env),
            cancel: state.cancel.clone(),
            remember_me,
        };
        session.channel_success(channel)?;
        state.running = Some(task.spawn());
        Ok(())
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = anyhow::Error;

    fn authentication_banner(
        &mut self,
    ) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send {
        let ctx = RenderContext::empty().with(
            "remote",
            json!({"host": self.peer.to_string(), "ip": self.peer.ip().to_string()}),
        );
        let banner = self.services.configuration.ssh.banner.render(&ctx);
        let connection = self.timer.id();
        async move {
            match banner {
                Ok(text) if !text.is_empty() => Ok(Some(text)),
                Ok(_) => Ok(None),
                Err(err) => {
                    tracing::warn!(%connection, error = %err, "Cannot render banner");
                    Ok(None)
                }
            }
        }
    }

    /// Always rejects and advertises the available authentication methods.
    fn auth_none(&mut self, user: &str) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        tracing::trace!(connection = %self.timer.id(), user = %user, "None authentication attempt");
        async { Ok(Self::reject()) }
    }

    /// Only filters by the configured key restrictions; the authorizers see the
    /// key once its signature was verified.
    fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        let allowed = self.services.configuration.ssh.keys.is_allowed(public_key);
        if !allowed {
            tracing::debug!(
                connection = %self.timer.id(),
                user = %user,
                key_type = %public_key.algorithm(),
                "Public key type not allowed"
            );
        }
        async move {
            if allowed {
                Ok(Auth::Accept)
            } else {
                Ok(Self::reject())
            }
        }
    }

    fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        let remote = self.remote(user);
        let key = public_key.clone();
        async move {
            if self.attempts_exceeded() {
                tracing::warn!(
                    connection = %self.timer.id(),
                    %remote,
                    "Max authentication attempts exceeded"
                );
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                });
            }
            if !self.services.configuration.ssh.keys.is_allowed(&key) {
                return Ok(Self::reject());
            }
            if self.handshake_key.is_none() {
                self.handshake_key = Some(key.clone());
            }

            let result = {
                let ctx = RequestContext {
                    remote: &remote,
                    sessions: &self.services.sessions,
                    validator: &self.services.environments,
                };
                self.services.authorizers.authorize_public_key(&ctx, &key).await
            };
            if matches!(&result, Ok(a) if a.is_authorized()) {
                self.handshake_key = None;
            }
            self.conclude(&remote, "publickey", result).await
        }
    }

    fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        let remote = self.remote(user);
        let password = zeroize::Zeroizing::new(password.to_string());
        async move {
            if self.attempts_exceeded() {
                tracing::warn!(
                    connection = %self.timer.id(),
                    %remote,
                    "Max authentication attempts exceeded"
                );
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                });
            }
            let result = {
                let ctx = RequestContext {
                    remote: &remote,
                    sessions: &self.services.sessions,
                    validator: &self.services.environments,
                };
                self.services.authorizers.authorize_password(&ctx, &password).await
            };
            self.conclude(&remote, "password", result).await
        }
    }

    fn auth_keyboard_interactive<'a>(
        &'a mut self,
        user: &str,
        _submethods: &str,
        response: Option<Response<'a>>,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        let remote = self.remote(user);
        let answer = response
            .and_then(|mut r| r.next())
            .map(|b| zeroize::Zeroizing::new(String::from_utf8_lossy(&b[..]).into_owned()));
        async move {
            match self.interactive.as_mut() {
                Some(interactive) => {
                    if let Some(answer) = answer {
                        interactive.answer(answer.to_string());
                    }
                }
                None => {
                    if self.attempts_exceeded() {
                        tracing::warn!(
                            connection = %self.timer.id(),
                            %remote,
                            "Max authentication attempts exceeded"
                        );
                        return Ok(Auth::Reject {
                            proceed_with_methods: None,
                            partial_success: false,
                        });
                    }
                    let interactive = Interactive::start(self.services.clone(), remote.clone());
                    self.interactive = Some(interactive);
                }
            }

            let step = match self.interactive.as_mut() {
                Some(interactive) => interactive.next().await,
                None => None,
            };
            match step {
                Some(Step::Prompt { message, echo }) => Ok(Auth::Partial {
                    name: Cow::Borrowed(""),
                    instructions: Cow::Borrowed(""),
                    prompts: Cow::Owned(vec![(Cow::Owned(message), echo)]),
                }),
                Some(Step::Info(message)) => Ok(Auth::Partial {
                    name: Cow::Borrowed(""),
                    instructions: Cow::Owned(message),
                    prompts: Cow::Owned(Vec::new()),
                }),
                Some(Step::Done(result)) => {
                    self.interactive = None;
                    self.conclude(&remote, "keyboard-interactive", result).await
                }
                None => {
                    self.interactive = None;
                    tracing::warn!(
                        connection = %self.timer.id(),
                        %remote,
                        "Keyboard-interactive authentication ended without outcome"
                    );
                    Ok(Self::reject())
                }
            }
        }
    }

    fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let channel_id = channel.id();
        let accepted = self.authorization.is_some();
        if accepted {
            tracing::debug!(
                connection = %self.timer.id(),
                channel = ?channel_id,
                "Session channel opened"
            );
            self.channels.insert(
                channel_id,
                ChannelState {
                    cancel: self.cancel.child_token(),
                    ..ChannelState::default()
                },
            );
        }
        async move { Ok(accepted) }
    }

    fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let host = host_to_connect.to_string();
        let origin = format!("{originator_address}:{originator_port}");
        async move {
            let connection = self.timer.id();
            let Ok(port) = u16::try_from(port_to_connect) else {
                tracing::debug!(
                    %connection,
                    host = %host,
                    port = port_to_connect,
                    "Invalid port forward destination"
                );
                return Ok(false);
            };

            let resolved = match self.resolve_session().await {
                Ok(resolved) => resolved,
                Err(err) => {
                    tracing::warn!(
                        %connection,
                        error = %err,
                        "Cannot resolve session of port forward"
                    );
                    return Ok(false);
                }
            };
            let ensured = self.services.environments.ensure(&resolved.authorization).await;
            let environment = match ensured {
                Ok(environment) => environment,
                Err(err) => {
                    tracing::warn!(
                        %connection,
                        error = %err,
                        "Cannot ensure environment of port forward"
                    );
                    return Ok(false);
                }
            };
            if !environment.is_port_forwarding_allowed() {
                tracing::info!(
                    %connection,
                    host = %host,
                    port,
                    "Port forward rejected: port forwarding is disabled"
                );
                return Ok(false);
            }

            let destination = match environment.new_destination_connection(&host, port).await {
                Ok(destination) => destination,
                Err(err) => {
                    let reason = dial_failure_message(&host, port, &err);
                    tracing::info!(
                        %connection,
                        origin = %origin,
                        reason = %reason,
                        "Port forward rejected"
                    );
                    tracing::debug!(%connection, error = %err, "Port forward dial failed");
                    return Ok(false);
                }
            };

            tracing::debug!(
                %connection,
                origin = %origin,
                host = %host,
                port,
                "Port forward opened"
            );
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                match splice(channel.into_stream(), destination, cancel).await {
                    Ok((up, down)) => tracing::debug!(
                        %connection,
                        host = %host,
                        port,
                        up,
                        down,
                        "Port forward closed"
                    ),
                    Err(err) => tracing::debug!(
                        %connection,
                        host = %host,
                        port,
                        error = %err,
                        "Port forward failed"
                    ),
                }
            });
            Ok(true)
        }
    }

    fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let address = address.to_string();
        async move {
            let connection = self.timer.id();
            let resolved = match self.resolve_session().await {
                Ok(resolved) => resolved,
                Err(err) => {
                    tracing::warn!(
                        %connection,
                        error = %err,
                        "Cannot resolve session of remote forward"
                    );
                    return Ok(false);
                }
            };
            let allowed = match self.services.environments.ensure(&resolved.authorization).await {
                Ok(environment) => environment.is_port_forwarding_allowed(),
                Err(err) => {
                    tracing::warn!(
                        %connection,
                        error = %err,
                        "Cannot ensure environment of remote forward"
                    );
                    return Ok(false);
                }
            };
            if !allowed {
                tracing::info!(
                    %connection,
                    address = %address,
                    port = *port,
                    "Remote forward rejected: port forwarding is disabled"
                );
                return Ok(false);
            }

            let listener = match TcpListener::bind(bind_address(&address, *port)).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::info!(
                        %connection,
                        address = %address,
                        port = *port,
                        error = %err,
                        "Remote forward rejected"
                    );
                    return Ok(false);
                }
            };
            if *port == 0 {
                if let Ok(local) = listener.local_addr() {
                    *port = u32::from(local.port());
                }
            }

            tracing::info!(%connection, address = %address, port = *port, "Remote forward started");
            let cancel = self.cancel.child_token();
            self.forwards.insert((address.clone(), *port), cancel.clone());
            tokio::spawn(serve_forwarded(listener, session.handle(), address, *port, cancel));
            Ok(true)
        }
    }

    fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let cancelled = match self.forwards.remove(&(address.to_string(), port)) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        };
        async move { Ok(cancelled) }
    }

    #[allow(clippy::too_many_arguments)]
    fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let pty = PtyConfig::new(term.to_string(), col_width, row_height, pix_width, pix_height);
        let supported = match &self.authorization {
            Some(authorization) => self
                .services
                .environments
                .does_support_pty(authorization, &pty)
                .unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "Cannot evaluate PTY support");
                    false
                }),
            None => false,
        };

        let result = match self.channels.get_mut(&channel_id) {
            Some(state) if supported && state.running.is_none() => {
                tracing::debug!(term = %term, cols = col_width, rows = row_height, "PTY allocated");
                state.pty = Some(pty);
                session.channel_success(channel_id)
            }
            _ => {
                tracing::debug!(term = %term, "PTY request rejected");
                session.channel_failure(channel_id)
            }
        };
        async move { Ok(result?) }
    }

    fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let result = match self.channels.get_mut(&channel_id) {
            Some(state) if state.running.is_none() => {
                state
                    .env
                    .insert(variable_name.to_string(), variable_value.to_string());
                session.channel_success(channel_id)
            }
            _ => session.channel_failure(channel_id),
        };
        async move { Ok(result?) }
    }

    fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move {
            self.start_task(channel_id, TaskKind::Shell { command: None }, session)
                .await
        }
    }

    fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let command = String::from_utf8_lossy(data).into_owned();
        async move {
            self.start_task(
                channel_id,
                TaskKind::Shell {
                    command: Some(command),
                },
                session,
            )
            .await
        }
    }

    fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let name = name.to_string();
        async move {
            if name != "sftp" {
                tracing::debug!(
                    connection = %self.timer.id(),
                    subsystem = %name,
                    "Unsupported subsystem"
                );
                session.channel_failure(channel_id)?;
                return Ok(());
            }
            self.start_task(channel_id, TaskKind::Sftp, session).await
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        if let Some(state) = self.channels.get_mut(&channel_id) {
            if let Some(pty) = &mut state.pty {
                pty.col_width = col_width;
                pty.row_height = row_height;
                pty.pix_width = pix_width;
                pty.pix_height = pix_height;
            }
            if let Some(running) = &state.running {
                running.notify(TaskEvent::WindowChange {
                    cols: col_width,
                    rows: row_height,
                });
            }
        }
        async { Ok(()) }
    }

    fn signal(
        &mut self,
        channel_id: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        if let Some(running) = self.channels.get(&channel_id).and_then(|s| s.running.as_ref()) {
            running.notify(TaskEvent::Signal(signal_name(&signal)));
        }
        async { Ok(()) }
    }

    fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        if let Some(running) = self.channels.get(&channel_id).and_then(|s| s.running.as_ref()) {
            running.write(data);
        }
        async { Ok(()) }
    }

    fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        if let Some(running) = self.channels.get_mut(&channel_id).and_then(|s| s.running.as_mut()) {
            running.close_stdin();
        }
        async { Ok(()) }
    }

    fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        if let Some(state) = self.channels.remove(&channel_id) {
            tracing::debug!(connection = %self.timer.id(), channel = ?channel_id, "Channel closed");
            state.cancel.cancel();
        }
        async { Ok(()) }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
        tracing::info!(
            connection = %self.timer.id(),
            peer = %self.peer,
            duration_secs = self.started.elapsed().as_secs(),
            authorized = self.authorization.is_some(),
            "Connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::authorization::{testing, Identity};
    use crate::config::Configuration;
    use crate::session::{FsRepository, MAX_CONNECTIONS_REACHED};
    use crate::shared::net::ConnectionId;

    async fn handler() -> (TempDir, ConnectionHandler) {
        handler_with(0).await
    }

    async fn handler_with(max_connections: u16) -> (TempDir, ConnectionHandler) {
        let dir = TempDir::new().unwrap();
        let mut configuration = Configuration::default();
        configuration.session.storage = dir.path().join("sessions");
        configuration.session.max_connections = max_connections;
        let sessions = FsRepository::new(&configuration.session).await.unwrap();
        let services = Arc::new(Services {
            configuration: Arc::new(configuration),
            sessions,
            authorizers: crate::authorization::AuthorizerFacade::new(),
            environments: crate::environment::EnvironmentFacade::new(),
        });
        let timer = Arc::new(ConnectionTimer::new(
            ConnectionId::new(),
            std::time::Duration::ZERO,
            std::time::Duration::ZERO,
        ));
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        (dir, ConnectionHandler::new(services, timer, peer, CancellationToken::new()))
    }

    /// Authorization of `alice` bound to a freshly created session.
    async fn authorized(handler: &ConnectionHandler) -> (Remote, Authorization) {
        let remote = handler.remote("alice");
        let flow = testing::flow("demo");
        let session = handler
            .services
            .sessions
            .create(&flow, &remote, None)
            .await
            .unwrap();
        let identity = Identity::Simple {
            name: "alice".into(),
        };
        let authorization = Authorization::new(identity, &flow, &remote).with_session(session);
        (remote, authorization)
    }

    #[test]
    fn test_allowed_methods() {
        let methods = ConnectionHandler::allowed_methods();
        assert!(methods.contains(&MethodKind::PublicKey));
        assert!(methods.contains(&MethodKind::Password));
        assert!(methods.contains(&MethodKind::KeyboardInteractive));
    }

    #[tokio::test]
    async fn test_attempts_exceeded() {
        let (_dir, mut handler) = handler().await;
        let max = u32::from(handler.services.configuration.ssh.max_auth_tries);
        for _ in 0..max {
            assert!(!handler.attempts_exceeded());
        }
        assert!(handler.attempts_exceeded());
    }

    #[tokio::test]
    async fn test_conclude_forbidden_is_rejected() {
        let (_dir, mut handler) = handler().await;
        let remote = testing::remote("alice");
        let auth = handler
            .conclude(&remote, "password", Ok(Authorization::forbidden(&remote)))
            .await
            .unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(handler.authorization().is_none());
    }

    #[tokio::test]
    async fn test_conclude_system_error_is_rejected() {
        let (_dir, mut handler) = handler().await;
        let remote = testing::remote("alice");
        let auth = handler
            .conclude(&remote, "password", Err(Error::system("backend down")))
            .await
            .unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(!handler.timer.is_bound());
    }

    #[tokio::test]
    async fn test_conclude_binds_connection_to_session() {
        let (_dir, mut handler) = handler_with(2).await;
        let (remote, authorization) = authorized(&handler).await;

        let auth = handler
            .conclude(&remote, "password", Ok(authorization))
            .await
            .unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert!(handler.timer.is_bound());
        assert!(handler.authorization().is_some());
    }

    #[tokio::test]
    async fn test_conclude_closes_if_max_connections_reached() {
        let (_dir, mut handler) = handler_with(1).await;
        let (remote, authorization) = authorized(&handler).await;
        let session = authorization.session().unwrap().clone();
        let _occupied = session.connection_interceptor().await.unwrap();

        let err = handler
            .conclude(&remote, "password", Ok(authorization))
            .await
            .unwrap_err();
        assert!(err.to_string().contains(MAX_CONNECTIONS_REACHED));
        assert!(!handler.timer.is_bound());
        assert!(handler.authorization().is_none());
    }

    #[tokio::test]
    async fn test_resolve_session_remembers_handshake_key_of_new_session() {
        let (_dir, mut handler) = handler_with(2).await;
        let (remote, authorization) = authorized(&handler).await;
        let session = authorization.session().unwrap().clone();
        let key = testing::key(testing::KEY_A);
        handler.handshake_key = Some(key.clone());
        handler
            .conclude(&remote, "password", Ok(authorization))
            .await
            .unwrap();

        let resolved = handler.resolve_session().await.unwrap();
        let notification = resolved.remember_me.unwrap();
        assert!(notification.contains(&key.fingerprint(HashAlg::Sha256).to_string()));
        assert_eq!(session.public_keys().await.unwrap(), vec![key.clone()]);
        assert!(handler.handshake_key.is_none());

        // Second channel of the same connection: the session is no longer new.
        handler.handshake_key = Some(testing::key(testing::KEY_B));
        let resolved = handler.resolve_session().await.unwrap();
        assert!(resolved.remember_me.is_none());
        assert_eq!(session.public_keys().await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn test_resolve_session_ignores_handshake_key_of_known_session() {
        let (_dir, mut handler) = handler_with(2).await;
        let (remote, authorization) = authorized(&handler).await;
        let session = authorization.session().unwrap().clone();
        session
            .notify_last_access(&remote, Some(State::Authorized))
            .await
            .unwrap();

        handler.handshake_key = Some(testing::key(testing::KEY_A));
        handler
            .conclude(&remote, "publickey", Ok(authorization))
            .await
            .unwrap();

        let resolved = handler.resolve_session().await.unwrap();
        assert!(resolved.remember_me.is_none());
        assert!(session.public_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_session_requires_authorization() {
        let (_dir, mut handler) = handler().await;
        let err = handler.resolve_session().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }
}
