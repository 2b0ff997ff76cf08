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

//! One container per session.
//!
//! The container runs the flow's `blockCommand` to stay alive; every shell,
//! exec, SFTP and port forward is a `docker exec` inside it. Flow, session
//! and origin are stored as container labels; everything else needed to run
//! tasks is stored as annotations of the host config. The containers
//! themselves are the state and survive restarts of the server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerSummary, EndpointSettings, HostConfig, Mount, MountBindOptions, MountTypeEnum,
};
use bollard::Docker;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use rand::RngCore;
use tokio::io::AsyncWriteExt;

use super::container::{
    bridge, ContainerToken, Settings, SettingsTemplates, BINARY_MOUNT_TARGET, ENV_SESSION_ID,
    LABEL_FLOW, LABEL_SESSION_ID, META_ACCESS_TOKEN,
};
use super::{
    no_such_environment, not_acceptable, session_of, BoxedStream, CleanupOpts, Environment,
    FindOpts, PtyConfig, Repository, Task, TaskEvent,
};
use crate::authorization::Authorization;
use crate::config::{EnvironmentDocker, FlowName, PullPolicy};
use crate::session::{FsRepository, Session, SessionId};
use crate::shared::error::{Error, ErrorKind, Result};
use crate::shared::sync::KeyedMutex;
use crate::template::RenderContext;

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// How often the exit code of a finished exec is polled before giving up.
const EXIT_CODE_POLLS: usize = 20;
const EXIT_CODE_POLL_INTERVAL: Duration = Duration::from_millis(100);

const ACCESS_TOKEN_LENGTH: usize = 12;

pub struct DockerRepository {
    inner: Arc<Inner>,
}

struct Inner {
    flow: FlowName,
    conf: EnvironmentDocker,
    client: Docker,
    sessions: FsRepository,
    instances: DashMap<SessionId, Arc<DockerEnvironment>>,
    locks: KeyedMutex<SessionId>,
}

impl DockerRepository {
    /// Connect to the daemon and re-attach the running containers of `flow`.
    pub async fn new(
        flow: &FlowName,
        conf: &EnvironmentDocker,
        sessions: &FsRepository,
    ) -> Result<Self> {
        let host = conf
            .host
            .render(&RenderContext::empty())
            .map_err(|e| Error::wrap(ErrorKind::Config, "cannot evaluate host", e))?;
        let client = connect(&host)?;

        let version = client
            .version()
            .await
            .map_err(|e| {
                Error::wrap(ErrorKind::System, "cannot retrieve docker host's version", e)
            })?;
        tracing::debug!(
            flow = %flow,
            os = version.os.as_deref().unwrap_or("unknown"),
            arch = version.arch.as_deref().unwrap_or("unknown"),
            version = version.version.as_deref().unwrap_or("unknown"),
            "Connected to docker host"
        );

        let result = Self {
            inner: Arc::new(Inner {
                flow: flow.clone(),
                conf: conf.clone(),
                client,
                sessions: sessions.clone(),
                instances: DashMap::new(),
                locks: KeyedMutex::new(),
            }),
        };
        result.recover_dangling().await?;
        Ok(result)
    }

    async fn recover_dangling(&self) -> Result<()> {
        let inner = &self.inner;
        let candidates = inner
            .list(&[
                ("label", format!("{LABEL_FLOW}={}", inner.flow)),
                ("status", "running".to_string()),
            ])
            .await
            .map_err(|e| {
                e.context(format!("cannot recover dangling containers of flow {}", inner.flow))
            })?;

        for candidate in candidates {
            let Some(id) = candidate.id.clone() else {
                continue;
            };
            let labels = candidate.labels.clone().unwrap_or_default();
            let settings = match inner.settings_of(&id, labels).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(
                        container = %id,
                        error = %e,
                        "Cannot recover container; ignoring"
                    );
                    continue;
                }
            };
            match inner.sessions.find_by_id(&inner.flow, &settings.session_id).await {
                Ok(session) => {
                    inner.instances.insert(
                        settings.session_id,
                        Arc::new(DockerEnvironment::new(inner, id.clone(), session, settings)),
                    );
                    tracing::info!(
                        container = %id,
                        flow = %inner.flow,
                        "Container of existing session recovered"
                    );
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    inner.remove_container(&id).await?;
                    tracing::info!(
                        container = %id,
                        flow = %inner.flow,
                        "Container without session removed"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        container = %id,
                        error = %e,
                        "Cannot resolve session of container; ignoring"
                    );
                }
            }
        }
        Ok(())
    }

    async fn create(
        &self,
        authorization: &Authorization,
        session: &Session,
    ) -> Result<Arc<DockerEnvironment>> {
        let inner = &self.inner;
        let conf = &inner.conf;
        let ctx = authorization.render_context();
        let config_err = |name: &str| {
            let name = name.to_string();
            move |e: Error| Error::wrap(ErrorKind::Config, format!("cannot evaluate {name}"), e)
        };

        let mut settings = Settings::resolve(
            &inner.flow,
            session,
            authorization,
            SettingsTemplates {
                shell_command: &conf.shell_command,
                exec_command: &conf.exec_command,
                sftp_command: &conf.sftp_command,
                direct_command: &conf.direct_command,
                user: &conf.user,
                group: None,
                directory: &conf.directory,
                port_forwarding_allowed: &conf.port_forwarding_allowed,
            },
        )?;
        settings.access_token = new_access_token();

        let image = conf.image.render(&ctx).map_err(config_err("image"))?;
        if image.is_empty() {
            return Err(Error::config("image is empty"));
        }
        inner.ensure_image(&image).await?;

        let (labels, annotations) = container_metadata(&settings)?;

        let mut mounts = Vec::new();
        if conf.mount_binary.render(&ctx).map_err(config_err("mountBinary"))? {
            let exe = std::env::current_exe()
                .map_err(|e| {
                    Error::wrap(ErrorKind::System, "cannot resolve location of the executable", e)
                })?;
            mounts.push(Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(exe.to_string_lossy().into_owned()),
                target: Some(BINARY_MOUNT_TARGET.to_string()),
                read_only: Some(true),
                bind_options: Some(MountBindOptions {
                    non_recursive: Some(true),
                    create_mountpoint: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        let network = conf.network.render(&ctx).map_err(config_err("network"))?;
        let networking_config =
            (!network.is_empty() && network != "default").then(|| NetworkingConfig {
                endpoints_config: HashMap::from([(network.clone(), EndpointSettings::default())]),
            });

        let host_config = HostConfig {
            auto_remove: Some(true),
            binds: non_empty(conf.volumes.render(&ctx).map_err(config_err("volumes"))?),
            cap_add: non_empty(conf.capabilities.render(&ctx).map_err(config_err("capabilities"))?),
            privileged: Some(conf.privileged.render(&ctx).map_err(config_err("privileged"))?),
            dns: non_empty(conf.dns_servers.render(&ctx).map_err(config_err("dnsServers"))?),
            dns_search: non_empty(conf.dns_search.render(&ctx).map_err(config_err("dnsSearch"))?),
            mounts: non_empty(mounts),
            network_mode: networking_config.as_ref().map(|_| network.clone()),
            annotations: Some(annotations),
            ..Default::default()
        };

        let block_command = conf.block_command.render(&ctx).map_err(config_err("blockCommand"))?;
        if block_command.is_empty() {
            return Err(Error::config("blockCommand is empty"));
        }

        let config = Config {
            image: Some(image),
            entrypoint: Some(Vec::new()),
            cmd: Some(block_command),
            env: Some(vec![format!("{ENV_SESSION_ID}={}", session.id())]),
            labels: Some(labels),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let name = container_name(&session.id());
        let created = inner
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot create container", e))?;
        let id = created.id;

        if let Err(e) = inner
            .client
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(re) = inner.remove_container(&id).await {
                tracing::warn!(
                    container = %id,
                    error = %re,
                    "Cannot remove orphan container within emergency cleanup; \
                     container could still be there"
                );
            }
            return Err(Error::wrap(ErrorKind::System, format!("cannot start container {name}"), e));
        }

        tracing::info!(
            container = %id,
            name = %name,
            flow = %inner.flow,
            session = %session,
            "Container created"
        );
        Ok(Arc::new(DockerEnvironment::new(inner, id, session.clone(), settings)))
    }
}

#[async_trait]
impl Repository for DockerRepository {
    async fn will_be_accepted(&self, authorization: &Authorization) -> Result<bool> {
        self.inner
            .conf
            .login_allowed
            .render(&authorization.render_context())
            .map_err(|e| e.context("cannot evaluate if user is allowed to login or not"))
    }

    fn does_support_pty(&self, _: &PtyConfig) -> bool {
        true
    }

    async fn ensure(&self, authorization: &Authorization) -> Result<Arc<dyn Environment>> {
        if !self.will_be_accepted(authorization).await? {
            return Err(not_acceptable());
        }
        let session = session_of(authorization)?;
        let _guard = self.inner.locks.lock(session.id()).await;

        match self.find_by_session(session, FindOpts::default()).await {
            Ok(existing) => return Ok(existing),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let environment = self.create(authorization, session).await?;
        let token = ContainerToken {
            port_forwarding_allowed: environment.settings.port_forwarding_allowed,
        };
        if let Err(e) = session.set_environment_token(&token.encode()?).await {
            let _ = self.inner.remove_container(&environment.container_id).await;
            return Err(e.context("cannot store environment token at session"));
        }
        self.inner
            .instances
            .insert(session.id(), Arc::clone(&environment));
        Ok(environment)
    }

    async fn find_by_session(
        &self,
        session: &Session,
        opts: FindOpts,
    ) -> Result<Arc<dyn Environment>> {
        let inner = &self.inner;
        if let Some(existing) = inner.instances.get(&session.id()) {
            return Ok(Arc::clone(existing.value()) as Arc<dyn Environment>);
        }

        let candidates = inner
            .list(&[
                ("label", format!("{LABEL_SESSION_ID}={}", session.id())),
                ("label", format!("{LABEL_FLOW}={}", inner.flow)),
                ("status", "running".to_string()),
            ])
            .await?;
        let Some((id, labels)) = candidates
            .into_iter()
            .find_map(|c| Some((c.id?, c.labels.unwrap_or_default())))
        else {
            if opts.auto_clean_up_allowed && !session.environment_token().await?.is_empty() {
                session.set_environment_token(&[]).await?;
                tracing::debug!(
                    session = %session,
                    "Container of session vanished; environment token removed"
                );
            }
            return Err(no_such_environment(session));
        };

        let settings = inner.settings_of(&id, labels).await?;
        let environment = inner
            .instances
            .entry(session.id())
            .or_insert_with(|| {
                Arc::new(DockerEnvironment::new(inner, id, session.clone(), settings))
            })
            .clone();
        Ok(environment)
    }

    async fn cleanup(&self, opts: &CleanupOpts<'_>) -> Result<()> {
        let inner = &self.inner;
        let clean_orphan = inner
            .conf
            .clean_orphan
            .render(&RenderContext::empty())
            .map_err(|e| e.context("cannot evaluate cleanOrphan"))?;

        let candidates = inner
            .list(&[("label", LABEL_FLOW.to_string())])
            .await?;
        for candidate in candidates {
            let (Some(id), Some(labels)) = (candidate.id.as_ref(), candidate.labels.as_ref()) else {
                continue;
            };
            let flow = labels.get(LABEL_FLOW).and_then(|v| FlowName::new(v.as_str()).ok());
            let Some(flow) = flow else {
                continue;
            };
            let session_id = labels.get(LABEL_SESSION_ID).and_then(|v| v.parse::<SessionId>().ok());

            let reason = if flow == inner.flow {
                match session_id {
                    Some(sid) if (opts.session_exists)(&flow, &sid) => continue,
                    Some(_) => "its session does not exist any longer",
                    None => "it has no session",
                }
            } else if clean_orphan && !(opts.flow_exists)(&flow) {
                "its flow does not exist any longer"
            } else {
                continue;
            };

            if inner.remove_container(id).await? {
                tracing::info!(container = %id, flow = %flow, reason, "Container removed");
            }
            if let Some(sid) = session_id {
                if flow == inner.flow {
                    inner.instances.remove(&sid);
                }
            }
        }
        Ok(())
    }
}

impl Inner {
    /// Labels come with the listing; annotations only with an inspect.
    async fn settings_of(&self, id: &str, labels: HashMap<String, String>) -> Result<Settings> {
        let inspected = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                Error::wrap(ErrorKind::System, format!("cannot inspect container {id}"), e)
            })?;
        let annotations = inspected
            .host_config
            .and_then(|h| h.annotations)
            .unwrap_or_default();
        settings_from(&self.flow, labels, annotations)
    }

    /// Repeated `label` filters must all match.
    async fn list(&self, filters: &[(&str, String)]) -> Result<Vec<ContainerSummary>> {
        let mut merged: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in filters {
            merged.entry(k.to_string()).or_default().push(v.clone());
        }
        self.client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: merged,
                ..Default::default()
            }))
            .await
            .map_err(|e| {
                Error::wrap(
                    ErrorKind::System,
                    format!("cannot list containers of flow {}", self.flow),
                    e,
                )
            })
    }

    /// Returns `false` if the container was already gone.
    async fn remove_container(&self, id: &str) -> Result<bool> {
        match self
            .client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(Error::wrap(
                ErrorKind::System,
                format!("cannot remove container {id}"),
                e,
            )),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let reference = normalize_image_reference(image);
        match self.conf.image_pull_policy {
            PullPolicy::Never => return Ok(()),
            PullPolicy::IfAbsent => match self.client.inspect_image(&reference).await {
                Ok(_) => return Ok(()),
                Err(e) if is_not_found(&e) => {}
                Err(e) => {
                    return Err(Error::wrap(
                        ErrorKind::System,
                        format!("cannot inspect image {reference}"),
                        e,
                    ));
                }
            },
            PullPolicy::Always => {}
        }

        tracing::info!(image = %reference, "Pulling image");
        let mut progress = self.client.create_image(
            Some(CreateImageOptions {
                from_image: reference.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(info) = progress
            .try_next()
            .await
            .map_err(|e| {
                Error::wrap(ErrorKind::System, format!("cannot pull image {reference}"), e)
            })?
        {
            if let Some(status) = info.status {
                tracing::trace!(
                    image = %reference,
                    status = %status,
                    progress = ?info.progress,
                    "Pulling image"
                );
            }
        }
        tracing::info!(image = %reference, "Image pulled");
        Ok(())
    }
}

struct DockerEnvironment {
    inner: Arc<Inner>,
    container_id: String,
    session: Session,
    settings: Settings,
}

impl DockerEnvironment {
    fn new(inner: &Arc<Inner>, container_id: String, session: Session, settings: Settings) -> Self {
        Self {
            inner: Arc::clone(inner),
            container_id,
            session,
            settings,
        }
    }

    async fn create_exec(&self, cmd: Vec<String>, env: Vec<String>, tty: bool) -> Result<String> {
        let opt = |v: &str| (!v.is_empty()).then(|| v.to_string());
        let exec = self
            .inner
            .client
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(tty),
                    env: Some(env),
                    cmd: Some(cmd),
                    user: opt(&self.settings.user),
                    working_dir: opt(&self.settings.directory),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot execute command", e))?;
        Ok(exec.id)
    }

    async fn exit_code(&self, exec_id: &str) -> Result<i32> {
        for _ in 0..EXIT_CODE_POLLS {
            let inspected = self
                .inner
                .client
                .inspect_exec(exec_id)
                .await
                .map_err(|e| {
                    Error::wrap(ErrorKind::System, format!("cannot inspect execution {exec_id}"), e)
                })?;
            if inspected.running != Some(true) {
                return Ok(inspected.exit_code.map(|c| c as i32).unwrap_or(-1));
            }
            tokio::time::sleep(EXIT_CODE_POLL_INTERVAL).await;
        }
        Ok(-1)
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn session(&self) -> &Session {
        &self.session
    }

    async fn banner(&self, authorization: &Authorization) -> Result<String> {
        self.inner
            .conf
            .banner
            .render(&authorization.render_context())
            .map_err(|e| e.context("cannot render banner"))
    }

    async fn run(&self, mut task: Task) -> Result<i32> {
        let cmd = self.settings.command_for(&task.kind)?;
        let tty = task.pty.is_some();

        let mut env = task.base_env();
        env.insert(ENV_SESSION_ID.to_string(), self.session.id().to_string());
        if let Some(pty) = &task.pty {
            env.insert("TERM".to_string(), pty.term.clone());
        }
        let env = env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();

        let exec_id = self.create_exec(cmd, env, tty).await?;
        let client = &self.inner.client;
        let StartExecResults::Attached { mut output, mut input } = client
            .start_exec(
                &exec_id,
                Some(StartExecOptions {
                    detach: false,
                    tty,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| {
                Error::wrap(ErrorKind::System, format!("cannot attach to execution {exec_id}"), e)
            })?
        else {
            return Err(Error::system(format!("execution {exec_id} started detached")));
        };

        if let Some(pty) = &task.pty {
            resize(client, &exec_id, pty.col_width, pty.row_height).await;
        }

        let stdout = task.io.stdout.clone();
        let stderr = task.io.stderr.clone();
        let mut pump = tokio::spawn(async move {
            while let Some(chunk) = output.next().await {
                let sent = match chunk {
                    Ok(LogOutput::StdErr { message }) => stderr.send(message.to_vec()).await,
                    Ok(other) => stdout.send(other.into_bytes().to_vec()).await,
                    Err(e) => {
                        tracing::debug!(error = %e, "Output of execution failed");
                        break;
                    }
                };
                if sent.is_err() {
                    break;
                }
            }
        });

        let mut stdin_open = true;
        loop {
            tokio::select! {
                _ = &mut pump => break,
                _ = task.cancel.cancelled() => {
                    pump.abort();
                    return Ok(-2);
                }
                data = task.io.stdin.recv(), if stdin_open => match data {
                    Some(data) => {
                        if let Err(e) = input.write_all(&data).await {
                            tracing::debug!(error = %e, "Cannot write input of execution");
                            stdin_open = false;
                        }
                    }
                    None => {
                        let _ = input.shutdown().await;
                        stdin_open = false;
                    }
                },
                Some(event) = task.io.events.recv() => match event {
                    TaskEvent::WindowChange { cols, rows } => {
                        resize(client, &exec_id, cols, rows).await
                    }
                    TaskEvent::Signal(name) => {
                        tracing::debug!(
                            signal = %name,
                            exec = %exec_id,
                            "Signals cannot be delivered to docker executions; ignoring"
                        );
                    }
                },
            }
        }

        self.exit_code(&exec_id).await
    }

    fn is_port_forwarding_allowed(&self) -> bool {
        self.settings.port_forwarding_allowed
    }

    async fn new_destination_connection(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let (cmd, env) = self.settings.direct_command_for(host, port)?;
        let exec_id = self.create_exec(cmd, env, false).await?;
        match self
            .inner
            .client
            .start_exec(
                &exec_id,
                Some(StartExecOptions {
                    detach: false,
                    tty: false,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| {
                Error::wrap(ErrorKind::Network, format!("cannot connect to {host}:{port}"), e)
            })?
        {
            StartExecResults::Attached { output, input } => {
                let output = output.filter_map(|chunk| async move {
                    match chunk {
                        Ok(LogOutput::StdErr { message }) => {
                            tracing::debug!(
                                output = %String::from_utf8_lossy(&message),
                                "Direct command reported"
                            );
                            None
                        }
                        Ok(other) => Some(Ok(other.into_bytes())),
                        Err(e) => Some(Err(Error::wrap(
                            ErrorKind::Network,
                            "destination connection failed",
                            e,
                        ))),
                    }
                });
                Ok(bridge(Box::pin(output), input))
            }
            StartExecResults::Detached => {
                Err(Error::system(format!("execution {exec_id} started detached")))
            }
        }
    }

    async fn dispose(&self) -> Result<bool> {
        let _guard = self.inner.locks.lock(self.session.id()).await;
        let removed = self
            .inner
            .remove_container(&self.container_id)
            .await
            .map_err(|e| e.context("cannot dispose environment"))?;
        self.inner.instances.remove(&self.session.id());
        self.session
            .set_environment_token(&[])
            .await
            .map_err(|e| e.context("cannot clear environment token"))?;
        Ok(removed)
    }
}

async fn resize(client: &Docker, exec_id: &str, cols: u32, rows: u32) {
    let options = ResizeExecOptions {
        width: cols.min(u16::MAX as u32) as u16,
        height: rows.min(u16::MAX as u32) as u16,
    };
    if let Err(e) = client.resize_exec(exec_id, options).await {
        tracing::warn!(exec = %exec_id, error = %e, "Cannot set window size; ignoring");
    }
}

fn connect(host: &str) -> Result<Docker> {
    let version = bollard::API_DEFAULT_VERSION;
    let result = if host.is_empty() {
        Docker::connect_with_local_defaults()
    } else if host.starts_with("unix://") {
        Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, version)
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, version)
    } else {
        return Err(Error::config(format!("unsupported docker host {host:?}")));
    };
    result.map_err(|e| {
        Error::wrap(ErrorKind::Config, format!("cannot connect to docker host {host:?}"), e)
    })
}

fn container_name(session_id: &SessionId) -> String {
    format!("bifroest-{session_id}")
}

fn non_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
    (!values.is_empty()).then_some(values)
}

/// Split into container labels and host config annotations.
fn container_metadata(
    settings: &Settings,
) -> Result<(HashMap<String, String>, HashMap<String, String>)> {
    let labels = settings.labels().into_iter().chain(settings.origin()).collect();
    let annotations = settings.metadata()?.into_iter().collect();
    Ok((labels, annotations))
}

fn settings_from(
    flow: &FlowName,
    mut labels: HashMap<String, String>,
    annotations: HashMap<String, String>,
) -> Result<Settings> {
    labels.extend(annotations);
    let settings = Settings::parse(flow, &labels)?;
    if settings.access_token.is_empty() {
        return Err(Error::system(format!(
            "resource contains problems: missing {META_ACCESS_TOKEN}"
        )));
    }
    Ok(settings)
}

fn new_access_token() -> Vec<u8> {
    let mut result = vec![0u8; ACCESS_TOKEN_LENGTH];
    rand::thread_rng().fill_bytes(&mut result);
    result
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code: 404, .. })
}

/// Pulling a reference without tag pulls every tag of the repository.
fn normalize_image_reference(image: &str) -> String {
    if image.contains('@') {
        return image.to_string();
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_image_reference() {
        assert_eq!(normalize_image_reference("alpine"), "alpine:latest");
        assert_eq!(normalize_image_reference("alpine:3.20"), "alpine:3.20");
        assert_eq!(
            normalize_image_reference("registry.example.org:5000/team/tool"),
            "registry.example.org:5000/team/tool:latest"
        );
        assert_eq!(normalize_image_reference("alpine@sha256:abc"), "alpine@sha256:abc");
    }

    #[test]
    fn test_not_found_detection() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert!(is_not_found(&not_found));
        let conflict = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "conflict".to_string(),
        };
        assert!(!is_not_found(&conflict));
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Vec::<String>::new()), None);
        assert_eq!(non_empty(vec!["a".to_string()]), Some(vec!["a".to_string()]));
        let mounts = vec![Mount {
            target: Some(BINARY_MOUNT_TARGET.to_string()),
            ..Default::default()
        }];
        assert_eq!(non_empty(mounts.clone()), Some(mounts));
        assert_eq!(non_empty(Vec::<Mount>::new()), None);
    }

    fn settings() -> Settings {
        Settings {
            flow: FlowName::new("demo").unwrap(),
            session_id: "0a3a1e7e-3b1c-4a8c-9a8f-0c1f8c1d2e3f".parse().unwrap(),
            created_remote_user: "bob".into(),
            created_remote_host: "10.0.0.5:40000".into(),
            shell_command: vec!["/bin/sh".into()],
            exec_command: vec!["/bin/sh".into(), "-c".into()],
            sftp_command: vec![BINARY_MOUNT_TARGET.into(), "sftp-server".into()],
            direct_command: Vec::new(),
            user: String::new(),
            group: String::new(),
            directory: "/work".into(),
            port_forwarding_allowed: true,
            access_token: new_access_token(),
        }
    }

    #[test]
    fn test_labels_and_annotations_are_split() {
        let settings = settings();
        let (labels, annotations) = container_metadata(&settings).unwrap();

        let mut label_keys: Vec<&str> = labels.keys().map(String::as_str).collect();
        label_keys.sort_unstable();
        assert_eq!(
            label_keys,
            vec![
                "org.engity.bifroest/created-remote-host",
                "org.engity.bifroest/created-remote-user",
                "org.engity.bifroest/flow",
                "org.engity.bifroest/session-id",
            ]
        );
        assert_eq!(labels["org.engity.bifroest/created-remote-host"], "10.0.0.5:40000");
        assert!(annotations.contains_key("org.engity.bifroest/shellCommand"));
        assert!(annotations.contains_key("org.engity.bifroest/portForwardingAllowed"));
        assert_eq!(annotations[META_ACCESS_TOKEN].len(), ACCESS_TOKEN_LENGTH * 2);

        let restored = settings_from(&settings.flow, labels.clone(), annotations.clone()).unwrap();
        assert_eq!(restored, settings);

        // Restoring from labels alone misses the annotations.
        assert!(settings_from(&settings.flow, labels.clone(), HashMap::new()).is_err());

        let mut without_token = annotations;
        without_token.remove(META_ACCESS_TOKEN);
        let err = settings_from(&settings.flow, labels, without_token).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::System);
    }

    #[test]
    fn test_container_name() {
        let id: SessionId = "0a3a1e7e-3b1c-4a8c-9a8f-0c1f8c1d2e3f".parse().unwrap();
        assert_eq!(container_name(&id), "bifroest-0a3a1e7e-3b1c-4a8c-9a8f-0c1f8c1d2e3f");
    }

    #[test]
    fn test_connect_rejects_unknown_scheme() {
        let err = connect("ssh://docker.example.org").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
