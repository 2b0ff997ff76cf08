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

//! One pod per session.
//!
//! Mirrors the docker environment: the pod runs the flow's `blockCommand`,
//! tasks are executed through the `exec` subresource of the API server and
//! the pod's labels and annotations carry everything needed to restore it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, Namespace, Pod, PodDNSConfig, PodSecurityContext, PodSpec,
    SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use kube::api::{AttachParams, DeleteParams, ListParams, PostParams, TerminalSize};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::container::{
    bridge, ContainerToken, Settings, SettingsTemplates, ENV_SESSION_ID, LABEL_FLOW,
    LABEL_SESSION_ID,
};
use super::{
    no_such_environment, not_acceptable, pump, session_of, BoxedStream, CleanupOpts, Environment,
    FindOpts, PtyConfig, Repository, Task, TaskEvent,
};
use crate::authorization::Authorization;
use crate::config::{EnvironmentKubernetes, FlowName, PullPolicy};
use crate::session::{FsRepository, Session, SessionId};
use crate::shared::error::{Error, ErrorKind, Result};
use crate::shared::sync::KeyedMutex;
use crate::template::RenderContext;

const CONTAINER_NAME: &str = "bifroest";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct KubernetesRepository {
    inner: Arc<Inner>,
}

struct Inner {
    flow: FlowName,
    conf: EnvironmentKubernetes,
    client: Client,
    sessions: FsRepository,
    instances: dashmap::DashMap<SessionId, Arc<KubernetesEnvironment>>,
    locks: KeyedMutex<SessionId>,
}

/// Everything rendered from the configuration that goes into a pod.
#[derive(Debug, Clone, Default)]
struct PodRequest {
    name: String,
    namespace: String,
    service_account: String,
    image: String,
    pull_policy: PullPolicy,
    block_command: Vec<String>,
    capabilities: Vec<String>,
    privileged: bool,
    dns_servers: Vec<String>,
    dns_search: Vec<String>,
    session_id: String,
}

impl KubernetesRepository {
    pub async fn new(
        flow: &FlowName,
        conf: &EnvironmentKubernetes,
        sessions: &FsRepository,
    ) -> Result<Self> {
        let client = connect(conf).await?;
        let result = Self {
            inner: Arc::new(Inner {
                flow: flow.clone(),
                conf: conf.clone(),
                client,
                sessions: sessions.clone(),
                instances: dashmap::DashMap::new(),
                locks: KeyedMutex::new(),
            }),
        };
        result.recover_dangling().await?;
        Ok(result)
    }

    async fn recover_dangling(&self) -> Result<()> {
        let inner = &self.inner;
        let pods = inner
            .list(&format!("{LABEL_FLOW}={}", inner.flow))
            .await
            .map_err(|e| {
                e.context(format!("cannot recover dangling pods of flow {}", inner.flow))
            })?;
        for pod in pods {
            let (namespace, name) = identity_of(&pod);
            let settings = match Settings::parse(&inner.flow, &metadata_of(&pod)) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(
                        namespace = %namespace,
                        pod = %name,
                        error = %e,
                        "Cannot recover pod; ignoring"
                    );
                    continue;
                }
            };
            match inner.sessions.find_by_id(&inner.flow, &settings.session_id).await {
                Ok(session) => {
                    let session_id = settings.session_id;
                    let environment = KubernetesEnvironment::new(
                        inner,
                        namespace.clone(),
                        name.clone(),
                        session,
                        settings,
                    );
                    inner.instances.insert(session_id, Arc::new(environment));
                    tracing::info!(
                        namespace = %namespace,
                        pod = %name,
                        "Pod of existing session recovered"
                    );
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    inner.remove_pod(&namespace, &name).await?;
                    tracing::info!(
                        namespace = %namespace,
                        pod = %name,
                        "Pod without session removed"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        namespace = %namespace,
                        pod = %name,
                        error = %e,
                        "Cannot resolve session of pod; ignoring"
                    );
                }
            }
        }
        Ok(())
    }

    fn pod_request(&self, authorization: &Authorization, session: &Session) -> Result<PodRequest> {
        let conf = &self.inner.conf;
        let ctx = authorization.render_context();
        let err = |name: &'static str| {
            move |e: Error| Error::wrap(ErrorKind::Config, format!("cannot evaluate {name}"), e)
        };

        let request = PodRequest {
            name: conf.name.render(&ctx).map_err(err("name"))?,
            namespace: conf.namespace.render(&ctx).map_err(err("namespace"))?,
            service_account: conf.service_account.render(&ctx).map_err(err("serviceAccount"))?,
            image: conf.image.render(&ctx).map_err(err("image"))?,
            pull_policy: conf.image_pull_policy,
            block_command: conf.block_command.render(&ctx).map_err(err("blockCommand"))?,
            capabilities: conf.capabilities.render(&ctx).map_err(err("capabilities"))?,
            privileged: conf.privileged.render(&ctx).map_err(err("privileged"))?,
            dns_servers: conf.dns_servers.render(&ctx).map_err(err("dnsServers"))?,
            dns_search: conf.dns_search.render(&ctx).map_err(err("dnsSearch"))?,
            session_id: session.id().to_string(),
        };
        if request.name.is_empty() {
            return Err(Error::config("name is empty"));
        }
        if request.image.is_empty() {
            return Err(Error::config("image is empty"));
        }
        if request.block_command.is_empty() {
            return Err(Error::config("blockCommand is empty"));
        }
        Ok(request)
    }

    async fn create(
        &self,
        authorization: &Authorization,
        session: &Session,
    ) -> Result<Arc<KubernetesEnvironment>> {
        let inner = &self.inner;
        let conf = &inner.conf;
        let settings = Settings::resolve(
            &inner.flow,
            session,
            authorization,
            SettingsTemplates {
                shell_command: &conf.shell_command,
                exec_command: &conf.exec_command,
                sftp_command: &conf.sftp_command,
                direct_command: &conf.direct_command,
                user: &conf.user,
                group: Some(&conf.group),
                directory: &conf.directory,
                port_forwarding_allowed: &conf.port_forwarding_allowed,
            },
        )?;
        let request = self.pod_request(authorization, session)?;
        let namespace = if request.namespace.is_empty() {
            "default".to_string()
        } else {
            request.namespace.clone()
        };

        inner.ensure_namespace(&namespace).await?;

        let pod = build_pod(&request, &settings)?;
        let pods: Api<Pod> = Api::namespaced(inner.client.clone(), &namespace);
        pods.create(&PostParams::default(), &pod)
            .await
            .map_err(|e| {
                Error::wrap(
                    ErrorKind::System,
                    format!("cannot create pod {namespace}/{}", request.name),
                    e,
                )
            })?;

        if let Err(e) = inner.wait_until_ready(&pods, &request.name).await {
            if let Err(re) = inner.remove_pod(&namespace, &request.name).await {
                tracing::warn!(
                    namespace = %namespace,
                    pod = %request.name,
                    error = %re,
                    "Cannot remove pod within emergency cleanup; pod could still be there"
                );
            }
            return Err(e);
        }

        tracing::info!(
            namespace = %namespace,
            pod = %request.name,
            flow = %inner.flow,
            session = %session,
            "Pod created"
        );
        Ok(Arc::new(KubernetesEnvironment::new(
            inner,
            namespace,
            request.name,
            session.clone(),
            settings,
        )))
    }
}

#[async_trait]
impl Repository for KubernetesRepository {
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
            let _ = self.inner.remove_pod(&environment.namespace, &environment.name).await;
            return Err(e.context("cannot store environment token at session"));
        }
        self.inner.instances.insert(session.id(), Arc::clone(&environment));
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

        let pods = inner
            .list(&format!("{LABEL_FLOW}={},{LABEL_SESSION_ID}={}", inner.flow, session.id()))
            .await?;
        let Some(pod) = pods.into_iter().find(is_running) else {
            if opts.auto_clean_up_allowed && !session.environment_token().await?.is_empty() {
                session.set_environment_token(&[]).await?;
                tracing::debug!(
                    session = %session,
                    "Pod of session vanished; environment token removed"
                );
            }
            return Err(no_such_environment(session));
        };

        let (namespace, name) = identity_of(&pod);
        let settings = Settings::parse(&inner.flow, &metadata_of(&pod))?;
        let environment = inner
            .instances
            .entry(session.id())
            .or_insert_with(|| {
                let environment =
                    KubernetesEnvironment::new(inner, namespace, name, session.clone(), settings);
                Arc::new(environment)
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

        for pod in inner.list(LABEL_FLOW).await? {
            let labels = pod.metadata.labels.clone().unwrap_or_default();
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

            let (namespace, name) = identity_of(&pod);
            if inner.remove_pod(&namespace, &name).await? {
                tracing::info!(
                    namespace = %namespace,
                    pod = %name,
                    flow = %flow,
                    reason,
                    "Pod removed"
                );
            }
            if let (Some(sid), true) = (session_id, flow == inner.flow) {
                inner.instances.remove(&sid);
            }
        }
        Ok(())
    }
}

impl Inner {
    async fn list(&self, selector: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        pods.list(&ListParams::default().labels(selector))
            .await
            .map(|l| l.items)
            .map_err(|e| {
                Error::wrap(ErrorKind::System, format!("cannot list pods of flow {}", self.flow), e)
            })
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let exists = namespaces
            .get_opt(namespace)
            .await
            .map_err(|e| {
                Error::wrap(ErrorKind::System, format!("cannot get namespace {namespace}"), e)
            })?
            .is_some();
        if exists {
            return Ok(());
        }
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                tracing::info!(namespace = %namespace, "Namespace created");
                Ok(())
            }
            Err(e) if api_code(&e) == Some(409) => Ok(()),
            Err(e) => Err(Error::wrap(
                ErrorKind::System,
                format!("cannot create namespace {namespace}"),
                e,
            )),
        }
    }

    async fn wait_until_ready(&self, pods: &Api<Pod>, name: &str) -> Result<()> {
        let timeout = self.conf.ready_timeout.get();
        let wait = async {
            loop {
                let pod = pods
                    .get(name)
                    .await
                    .map_err(|e| {
                        Error::wrap(ErrorKind::System, format!("cannot get pod {name}"), e)
                    })?;
                match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                    Some("Running") if is_running(&pod) => return Ok(()),
                    Some(phase @ ("Succeeded" | "Failed")) => {
                        return Err(Error::system(format!(
                            "pod {name} terminated in phase {phase} before it got ready"
                        )));
                    }
                    _ => tokio::time::sleep(POLL_INTERVAL).await,
                }
            }
        };
        if timeout.is_zero() {
            return wait.await;
        }
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::system(format!("pod {name} did not get ready within {timeout:?}")))?
    }

    /// Returns `false` if the pod was already gone.
    async fn remove_pod(&self, namespace: &str, name: &str) -> Result<bool> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match pods.delete(name, &DeleteParams::default().grace_period(0)).await {
            Ok(_) => {}
            Err(e) if api_code(&e) == Some(404) => return Ok(false),
            Err(e) => {
                return Err(Error::wrap(
                    ErrorKind::System,
                    format!("cannot remove pod {namespace}/{name}"),
                    e,
                ));
            }
        }

        let timeout = self.conf.remove_timeout.get();
        let gone = async {
            loop {
                match pods.get_opt(name).await {
                    Ok(None) => return Ok(()),
                    Ok(Some(_)) => tokio::time::sleep(POLL_INTERVAL).await,
                    Err(e) => {
                        return Err(Error::wrap(
                            ErrorKind::System,
                            format!("cannot get pod {namespace}/{name}"),
                            e,
                        ))
                    }
                }
            }
        };
        if !timeout.is_zero() {
            tokio::time::timeout(timeout, gone).await.map_err(|_| {
                Error::system(format!("pod {namespace}/{name} was not removed within {timeout:?}"))
            })??;
        }
        Ok(true)
    }
}

struct KubernetesEnvironment {
    inner: Arc<Inner>,
    namespace: String,
    name: String,
    session: Session,
    settings: Settings,
}

impl KubernetesEnvironment {
    fn new(
        inner: &Arc<Inner>,
        namespace: String,
        name: String,
        session: Session,
        settings: Settings,
    ) -> Self {
        Self {
            inner: Arc::clone(inner),
            namespace,
            name,
            session,
            settings,
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.inner.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl Environment for KubernetesEnvironment {
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
        let tty = task.pty.is_some();
        let mut env = task.base_env();
        env.insert(ENV_SESSION_ID.to_string(), self.session.id().to_string());
        if let Some(pty) = &task.pty {
            env.insert("TERM".to_string(), pty.term.clone());
        }
        let cmd = with_env(
            env.into_iter().map(|(k, v)| format!("{k}={v}")),
            self.settings.command_for(&task.kind)?,
        );

        let params = AttachParams::default()
            .container(CONTAINER_NAME)
            .stdin(true)
            .stdout(true)
            .stderr(!tty)
            .tty(tty);
        let mut attached = self
            .pods()
            .exec(&self.name, cmd, &params)
            .await
            .map_err(|e| {
                Error::wrap(
                    ErrorKind::System,
                    format!("cannot execute command in pod {}", self.name),
                    e,
                )
            })?;

        let mut resizer = if tty { attached.terminal_size() } else { None };
        if let (Some(resizer), Some(pty)) = (resizer.as_mut(), &task.pty) {
            let _ = resizer.send(terminal_size(pty.col_width, pty.row_height)).await;
        }

        let mut stdin = attached.stdin();
        let mut pumps = Vec::new();
        if let Some(stdout) = attached.stdout() {
            pumps.push(tokio::spawn(pump(stdout, task.io.stdout.clone())));
        }
        if let Some(stderr) = attached.stderr() {
            pumps.push(tokio::spawn(pump(stderr, task.io.stderr.clone())));
        }
        let status = attached.take_status();
        let mut outputs = Box::pin(futures::future::join_all(pumps));

        loop {
            tokio::select! {
                _ = &mut outputs => break,
                _ = task.cancel.cancelled() => {
                    attached.abort();
                    return Ok(-2);
                }
                data = task.io.stdin.recv(), if stdin.is_some() => match (data, stdin.as_mut()) {
                    (Some(data), Some(writer)) => {
                        if writer.write_all(&data).await.is_err() {
                            stdin = None;
                        }
                    }
                    (_, Some(writer)) => {
                        let _ = writer.shutdown().await;
                        stdin = None;
                    }
                    _ => stdin = None,
                },
                Some(event) = task.io.events.recv() => match event {
                    TaskEvent::WindowChange { cols, rows } => {
                        if let Some(resizer) = resizer.as_mut() {
                            if let Err(e) = resizer.send(terminal_size(cols, rows)).await {
                                tracing::warn!(error = %e, "Cannot set window size; ignoring");
                            }
                        }
                    }
                    TaskEvent::Signal(name) => {
                        tracing::debug!(
                            signal = %name,
                            pod = %self.name,
                            "Signals cannot be delivered to pod executions; ignoring"
                        );
                    }
                },
            }
        }

        match status {
            Some(status) => Ok(exit_code_of(status.await.as_ref())),
            None => Ok(-1),
        }
    }

    fn is_port_forwarding_allowed(&self) -> bool {
        self.settings.port_forwarding_allowed
    }

    async fn new_destination_connection(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let (cmd, env) = self.settings.direct_command_for(host, port)?;
        let params = AttachParams::default()
            .container(CONTAINER_NAME)
            .stdin(true)
            .stdout(true)
            .stderr(false);
        let mut attached = self
            .pods()
            .exec(&self.name, with_env(env, cmd), &params)
            .await
            .map_err(|e| {
                Error::wrap(ErrorKind::Network, format!("cannot connect to {host}:{port}"), e)
            })?;

        let (Some(stdin), Some(stdout)) = (attached.stdin(), attached.stdout()) else {
            return Err(Error::system("execution of direct command is not attached"));
        };
        tokio::spawn(async move {
            if let Err(e) = attached.join().await {
                tracing::debug!(error = %e, "Direct command ended");
            }
        });

        let output = ReaderStream::new(stdout).map(|chunk| {
            chunk.map_err(|e| Error::wrap(ErrorKind::Network, "destination connection failed", e))
        });
        Ok(bridge(output, stdin))
    }

    async fn dispose(&self) -> Result<bool> {
        let _guard = self.inner.locks.lock(self.session.id()).await;
        let removed = self
            .inner
            .remove_pod(&self.namespace, &self.name)
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

async fn connect(conf: &EnvironmentKubernetes) -> Result<Client> {
    let options = KubeConfigOptions {
        context: conf.context.clone(),
        ..Default::default()
    };
    let config_err = |e| Error::wrap(ErrorKind::Config, "cannot load kubernetes configuration", e);
    let config = match &conf.config {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                let message = format!("cannot read kubeconfig {}", path.display());
                Error::wrap(ErrorKind::Config, message, e)
            })?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(config_err)?
        }
        None if conf.context.is_some() => kube::Config::from_kubeconfig(&options)
            .await
            .map_err(config_err)?,
        None => kube::Config::infer()
            .await
            .map_err(|e| {
                Error::wrap(ErrorKind::Config, "cannot infer kubernetes configuration", e)
            })?,
    };

    Client::try_from(config)
        .map_err(|e| Error::wrap(ErrorKind::Config, "cannot create kubernetes client", e))
}

fn build_pod(request: &PodRequest, settings: &Settings) -> Result<Pod> {
    let numeric = |name: &str, v: &str| -> Result<Option<i64>> {
        if v.is_empty() {
            return Ok(None);
        }
        v.parse::<i64>()
            .map(Some)
            .map_err(|_| {
                Error::config(format!(
                    "{name} has to be numeric for kubernetes environments but is {v:?}"
                ))
            })
    };
    let run_as_user = numeric("user", &settings.user)?;
    let run_as_group = numeric("group", &settings.group)?;
    let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(request.image.clone()),
        image_pull_policy: Some(
            match request.pull_policy {
                PullPolicy::IfAbsent => "IfNotPresent",
                PullPolicy::Always => "Always",
                PullPolicy::Never => "Never",
            }
            .to_string(),
        ),
        command: Some(request.block_command.clone()),
        env: Some(vec![EnvVar {
            name: ENV_SESSION_ID.to_string(),
            value: Some(request.session_id.clone()),
            ..Default::default()
        }]),
        working_dir: (!settings.directory.is_empty()).then(|| settings.directory.clone()),
        security_context: Some(SecurityContext {
            privileged: Some(request.privileged),
            capabilities: non_empty(&request.capabilities).map(|add| Capabilities {
                add: Some(add),
                ..Default::default()
            }),
            run_as_user,
            run_as_group,
            ..Default::default()
        }),
        stdin: Some(true),
        ..Default::default()
    };

    let with_dns = !request.dns_servers.is_empty() || !request.dns_search.is_empty();
    let dns_config = with_dns.then(|| PodDNSConfig {
        nameservers: non_empty(&request.dns_servers),
        searches: non_empty(&request.dns_search),
        ..Default::default()
    });

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(request.name.clone()),
            namespace: (!request.namespace.is_empty()).then(|| request.namespace.clone()),
            labels: Some(settings.labels()),
            annotations: Some(settings.origin().into_iter().chain(settings.metadata()?).collect()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            service_account_name: (!request.service_account.is_empty())
                .then(|| request.service_account.clone()),
            dns_policy: (!request.dns_servers.is_empty()).then(|| "None".to_string()),
            dns_config,
            security_context: run_as_group.map(|gid| PodSecurityContext {
                fs_group: Some(gid),
                ..Default::default()
            }),
            termination_grace_period_seconds: Some(5),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Exec cannot set environment variables; prefix the command with `env`.
fn with_env(env: impl IntoIterator<Item = String>, command: Vec<String>) -> Vec<String> {
    let mut result = vec!["env".to_string()];
    result.extend(env);
    result.extend(command);
    result
}

fn terminal_size(cols: u32, rows: u32) -> TerminalSize {
    TerminalSize {
        width: cols.min(u16::MAX as u32) as u16,
        height: rows.min(u16::MAX as u32) as u16,
    }
}

fn exit_code_of(status: Option<&Status>) -> i32 {
    let Some(status) = status else {
        return -1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.parse::<i32>().ok())
        })
        .unwrap_or(-1)
}

fn is_running(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .container_statuses
            .as_ref()
            .is_some_and(|statuses| statuses.iter().all(|c| c.ready))
}

fn identity_of(pod: &Pod) -> (String, String) {
    (
        pod.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

fn metadata_of(pod: &Pod) -> HashMap<String, String> {
    let mut result: HashMap<String, String> = HashMap::new();
    let maps: [&Option<BTreeMap<String, String>>; 2] =
        [&pod.metadata.labels, &pod.metadata.annotations];
    for map in maps.into_iter().flatten() {
        result.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    result
}

fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    use super::*;
    use crate::config::FlowName;

    fn settings() -> Settings {
        Settings {
            flow: FlowName::new("pods").unwrap(),
            session_id: "0a3a1e7e-3b1c-4a8c-9a8f-0c1f8c1d2e3f".parse().unwrap(),
            created_remote_user: "bob".into(),
            created_remote_host: "10.0.0.5:40000".into(),
            shell_command: vec!["/bin/sh".into()],
            exec_command: vec!["/bin/sh".into(), "-c".into()],
            sftp_command: vec![],
            direct_command: vec!["nc".into()],
            user: "1000".into(),
            group: "2000".into(),
            directory: "/work".into(),
            port_forwarding_allowed: true,
            access_token: Vec::new(),
        }
    }

    fn request() -> PodRequest {
        PodRequest {
            name: "bifroest-0a3a1e7e".into(),
            namespace: "sessions".into(),
            image: "alpine".into(),
            block_command: vec!["sleep".into(), "infinity".into()],
            dns_servers: vec!["10.0.0.10".into()],
            session_id: "0a3a1e7e-3b1c-4a8c-9a8f-0c1f8c1d2e3f".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_pod() {
        let pod = build_pod(&request(), &settings()).unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("bifroest-0a3a1e7e"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("sessions"));

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.dns_policy.as_deref(), Some("None"));
        let container = &spec.containers[0];
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(container.working_dir.as_deref(), Some("/work"));
        let security = container.security_context.as_ref().unwrap();
        assert_eq!(security.run_as_user, Some(1000));
        assert_eq!(security.run_as_group, Some(2000));

        let annotations = pod.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations["org.engity.bifroest/created-remote-host"], "10.0.0.5:40000");
        let parsed = Settings::parse(&settings().flow, &metadata_of(&pod)).unwrap();
        assert_eq!(parsed, settings());
        assert_eq!(parsed.exec_command, settings().exec_command);
        assert!(parsed.port_forwarding_allowed);
    }

    #[test]
    fn test_build_pod_rejects_user_names() {
        let mut s = settings();
        s.user = "bob".into();
        let err = build_pod(&request(), &s).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_exit_code_of_status() {
        assert_eq!(exit_code_of(None), -1);
        let success = Status {
            status: Some("Success".into()),
            ..Default::default()
        };
        assert_eq!(exit_code_of(Some(&success)), 0);

        let failed = Status {
            status: Some("Failure".into()),
            reason: Some("NonZeroExitCode".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".into()),
                    message: Some("7".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code_of(Some(&failed)), 7);
    }

    #[test]
    fn test_with_env() {
        assert_eq!(
            with_env(["A=1".to_string()], vec!["id".into()]),
            vec!["env", "A=1", "id"]
        );
    }
}
