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

//! Sessions running as a user of the host.
//!
//! The environment token stores the resolved user and what has to happen to
//! it on dispose, so that the housekeeper can clean up managed users long
//! after the connection that created them went away.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::pty::PtyMaster;
use super::{
    not_acceptable, no_such_environment, pump, session_of, BoxedStream, Environment, FindOpts,
    PtyConfig, Repository, Task, TaskEvent, TaskKind,
};
use crate::authorization::Authorization;
use crate::config::{EnvironmentLocal, FlowName};
use crate::session::Session;
use crate::shared::error::{Error, ErrorKind, Result};
use crate::template::{RenderContext, TemplateString};
use crate::user::{self, EnsureOpts, User};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long a process may take to exit after `SIGTERM` before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How long remaining PTY output is drained after the process exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Environment token of the local environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalToken {
    pub user: LocalTokenUser,
    #[serde(default)]
    pub port_forwarding_allowed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTokenUser {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub managed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete_on_dispose: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete_home_dir_on_dispose: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub kill_processes_on_dispose: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Dispose flags as configured; they only apply to managed users.
#[derive(Debug, Clone, Copy, Default)]
struct DisposeFlags {
    delete_user: bool,
    delete_home_dir: bool,
    kill_processes: bool,
}

impl LocalToken {
    fn new(user: &User, managed: bool, flags: DisposeFlags, port_forwarding_allowed: bool) -> Self {
        let delete_on_dispose = flags.delete_user && managed;
        Self {
            user: LocalTokenUser {
                name: user.name.clone(),
                uid: Some(user.uid),
                managed,
                delete_on_dispose,
                delete_home_dir_on_dispose: flags.delete_home_dir && delete_on_dispose,
                kill_processes_on_dispose: flags.kill_processes && managed,
            },
            port_forwarding_allowed,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot marshal environment token", e))
    }

    pub fn decode(token: &[u8]) -> Result<Self> {
        serde_json::from_slice(token)
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot decode environment token", e))
    }
}

pub struct LocalRepository {
    flow: FlowName,
    conf: EnvironmentLocal,
    users: Arc<user::Repository>,
}

impl LocalRepository {
    pub fn new(flow: &FlowName, conf: &EnvironmentLocal) -> Self {
        Self::with_users(flow, conf, user::Repository::default())
    }

    pub fn with_users(flow: &FlowName, conf: &EnvironmentLocal, users: user::Repository) -> Self {
        Self {
            flow: flow.clone(),
            conf: conf.clone(),
            users: Arc::new(users),
        }
    }

    fn render_bool(
        &self,
        name: &str,
        template: &crate::template::TemplateBool,
        ctx: &RenderContext,
    ) -> Result<bool> {
        template.render(ctx).map_err(|e| e.context(format!("cannot render {name}")))
    }

    fn requirement_of(&self, ctx: &RenderContext) -> Result<user::Requirement> {
        let optional = |template: &Option<TemplateString>, name: &str| -> Result<Option<String>> {
            match template {
                None => Ok(None),
                Some(t) => {
                    let value = t.render(ctx)
                        .map_err(|e| e.context(format!("cannot render {name}")))?;
                    Ok((!value.is_empty()).then_some(value))
                }
            }
        };

        let name = self
            .conf
            .name
            .render(ctx)
            .map_err(|e| e.context("cannot render user name"))?;
        let uid = optional(&self.conf.uid, "uid")?
            .map(|v| {
                v.parse::<u32>()
                    .map_err(|_| Error::config(format!("rendered uid {v:?} is not a number")))
            })
            .transpose()?;

        Ok(user::Requirement {
            name,
            uid,
            group: optional(&self.conf.group, "group")?,
            shell: optional(&self.conf.shell, "shell")?,
            home_dir: optional(&self.conf.home_dir, "homeDir")?,
        })
    }

    async fn lookup_user(&self, req: &user::Requirement) -> Result<User> {
        let found = if !req.name.is_empty() {
            self.users.lookup(&req.name).await?
        } else if let Some(uid) = req.uid {
            self.users.lookup_uid(uid).await?
        } else {
            return Err(Error::config(
                "users may neither be created nor updated and there is neither a user name nor \
                 an uid configured",
            ));
        };
        found.ok_or_else(|| {
            Error::not_found(format!("user {} does not exist", display_requirement(req)))
        })
    }

    fn environment(
        &self,
        session: &Session,
        user: User,
        token: &LocalToken,
    ) -> Arc<dyn Environment> {
        Arc::new(Local {
            flow: self.flow.clone(),
            banner: self.conf.banner.clone(),
            users: Arc::clone(&self.users),
            session: session.clone(),
            user,
            port_forwarding_allowed: token.port_forwarding_allowed,
            delete_user_on_dispose: token.user.delete_on_dispose,
            delete_home_dir_on_dispose: token.user.delete_home_dir_on_dispose,
            kill_processes_on_dispose: token.user.kill_processes_on_dispose,
        })
    }

    async fn user_vanished(
        &self,
        session: &Session,
        user_ref: String,
        opts: FindOpts,
    ) -> Result<Arc<dyn Environment>> {
        if !opts.auto_clean_up_allowed {
            return Err(Error::expired(format!(
                "user {user_ref} of session cannot be found any longer; treat as expired"
            )));
        }
        session
            .set_environment_token(&[])
            .await
            .map_err(|e| {
                e.context("cannot clear environment token of session whose user vanished")
            })?;
        tracing::debug!(
            session = %session,
            user = %user_ref,
            "User of session does not exist any longer; environment token removed"
        );
        Err(no_such_environment(session))
    }
}

fn display_requirement(req: &user::Requirement) -> String {
    match (req.name.is_empty(), req.uid) {
        (false, _) => req.name.clone(),
        (true, Some(uid)) => uid.to_string(),
        (true, None) => "<unnamed>".to_string(),
    }
}

#[async_trait]
impl Repository for LocalRepository {
    async fn will_be_accepted(&self, authorization: &Authorization) -> Result<bool> {
        self.render_bool("loginAllowed", &self.conf.login_allowed, &authorization.render_context())
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

        match self.find_by_session(session, FindOpts::default()).await {
            Ok(existing) => return Ok(existing),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    session = %session,
                    error = %e,
                    "Cannot restore environment from existing session; will create a new one"
                );
            }
        }

        let ctx = authorization.render_context();
        let opts = EnsureOpts {
            create_if_absent: self.render_bool(
                "createIfAbsent",
                &self.conf.create_if_absent,
                &ctx,
            )?,
            update_if_different: self.render_bool(
                "updateIfDifferent",
                &self.conf.update_if_different,
                &ctx,
            )?,
        };
        let requirement = self.requirement_of(&ctx)?;

        let managed = opts.create_if_absent || opts.update_if_different;
        let user = if managed {
            self.users
                .ensure(&requirement, opts)
                .await
                .map_err(|e| e.context("cannot ensure user"))?
                .map(|ensured| ensured.user)
                .ok_or_else(|| {
                    Error::not_found(format!(
                        "user {} does not exist",
                        display_requirement(&requirement)
                    ))
                })?
        } else {
            self.lookup_user(&requirement).await?
        };

        let flags = DisposeFlags {
            delete_user: self.render_bool(
                "dispose.deleteManagedUser",
                &self.conf.dispose.delete_managed_user,
                &ctx,
            )?,
            delete_home_dir: self.render_bool(
                "dispose.deleteManagedUserHomeDir",
                &self.conf.dispose.delete_managed_user_home_dir,
                &ctx,
            )?,
            kill_processes: self.render_bool(
                "dispose.killManagedUserProcesses",
                &self.conf.dispose.kill_managed_user_processes,
                &ctx,
            )?,
        };
        let port_forwarding_allowed =
            self.render_bool("portForwardingAllowed", &self.conf.port_forwarding_allowed, &ctx)?;

        let token = LocalToken::new(&user, managed, flags, port_forwarding_allowed);
        session
            .set_environment_token(&token.encode()?)
            .await
            .map_err(|e| e.context("cannot store environment token at session"))?;

        tracing::debug!(
            flow = %self.flow,
            session = %session,
            user = %user,
            managed,
            "Local environment ensured"
        );
        Ok(self.environment(session, user, &token))
    }

    async fn find_by_session(
        &self,
        session: &Session,
        opts: FindOpts,
    ) -> Result<Arc<dyn Environment>> {
        let raw = session
            .environment_token()
            .await
            .map_err(|e| e.context("cannot get environment token"))?;
        if raw.is_empty() {
            return Err(no_such_environment(session));
        }
        let token = LocalToken::decode(&raw)?;

        let user = if !token.user.name.is_empty() {
            match self.users.lookup(&token.user.name).await? {
                Some(user) => user,
                None => return self.user_vanished(session, token.user.name.clone(), opts).await,
            }
        } else if let Some(uid) = token.user.uid {
            match self.users.lookup_uid(uid).await? {
                Some(user) => user,
                None => return self.user_vanished(session, uid.to_string(), opts).await,
            }
        } else {
            return Err(Error::system("environment token does not contain valid user information"));
        };

        Ok(self.environment(session, user, &token))
    }
}

struct Local {
    flow: FlowName,
    banner: TemplateString,
    users: Arc<user::Repository>,
    session: Session,
    user: User,
    port_forwarding_allowed: bool,
    delete_user_on_dispose: bool,
    delete_home_dir_on_dispose: bool,
    kill_processes_on_dispose: bool,
}

impl Local {
    fn command(&self, task: &Task) -> Result<Command> {
        let shell = if self.user.shell.is_empty() {
            "/bin/sh"
        } else {
            self.user.shell.as_str()
        };
        let shell_name = Path::new(shell)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("sh")
            .to_string();

        let mut cmd = match &task.kind {
            TaskKind::Shell { command: None } => {
                let mut cmd = Command::new(shell);
                cmd.arg0(format!("-{shell_name}"));
                cmd
            }
            TaskKind::Shell { command: Some(line) } => {
                let mut cmd = Command::new(shell);
                cmd.arg0(&shell_name).arg("-c").arg(line);
                cmd
            }
            TaskKind::Sftp => {
                let exe = std::env::current_exe().map_err(|e| {
                    Error::wrap(ErrorKind::System, "cannot resolve location of the executable", e)
                })?;
                let mut cmd = Command::new(exe);
                cmd.arg("sftp-server");
                cmd
            }
        };

        let mut env: BTreeMap<String, String> = task.base_env();
        env.insert("HOME".into(), self.user.home_dir.clone());
        env.insert("USER".into(), self.user.name.clone());
        env.insert("LOGNAME".into(), self.user.name.clone());
        env.insert("SHELL".into(), shell.to_string());
        env.insert(
            "PATH".into(),
            std::env::var("PATH")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_PATH.to_string()),
        );
        if let Some(pty) = &task.pty {
            env.insert("TERM".into(), pty.term.clone());
        }
        cmd.env_clear().envs(env);

        if !self.user.home_dir.is_empty() && Path::new(&self.user.home_dir).is_dir() {
            cmd.current_dir(&self.user.home_dir);
        }

        if nix::unistd::geteuid().as_raw() != self.user.uid {
            cmd.uid(self.user.uid).gid(self.user.group.gid);
        }
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    async fn run_with_pty(
        &self,
        task: &mut Task,
        mut cmd: Command,
        config: &PtyConfig,
    ) -> Result<i32> {
        let pty = Arc::new(PtyMaster::open(config)?);

        let slave = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(pty.slave_path())
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot open pty slave", e))?;
        let stdio = |f: &std::fs::File| -> Result<Stdio> {
            f.try_clone()
                .map(Stdio::from)
                .map_err(|e| Error::wrap(ErrorKind::System, "cannot duplicate pty slave", e))
        };
        cmd.stdin(stdio(&slave)?).stdout(stdio(&slave)?).stderr(stdio(&slave)?);
        drop(slave);

        // SAFETY: Only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as nix::libc::c_ulong, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = self.spawn(cmd)?;
        let pid = child.id();

        let output = {
            let pty = Arc::clone(&pty);
            let stdout = task.io.stdout.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; super::IO_BUFFER_SIZE];
                loop {
                    match pty.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if stdout.send(buf[..n].to_vec()).await.is_err() {
                                break;
                            }
                        }
                        // EIO once the slave side is closed.
                        Err(_) => break,
                    }
                }
            })
        };

        let mut stdin_open = true;
        let exit_code = loop {
            tokio::select! {
                status = child.wait() => {
                    break status
                        .map(exit_code_of_status)
                        .map_err(|e| Error::wrap(ErrorKind::System, "cannot wait for process", e))?;
                }
                _ = task.cancel.cancelled() => {
                    terminate(&mut child, true).await;
                    break -2;
                }
                data = task.io.stdin.recv(), if stdin_open => match data {
                    Some(data) => {
                        if let Err(e) = pty.write_all(&data).await {
                            tracing::debug!(error = %e, "Cannot write to pty");
                        }
                    }
                    None => stdin_open = false,
                },
                Some(event) = task.io.events.recv() => match event {
                    TaskEvent::WindowChange { cols, rows } => {
                        if let Err(e) = pty.resize(cols, rows) {
                            tracing::warn!(error = %e, "Cannot set window size; ignoring");
                        }
                    }
                    TaskEvent::Signal(name) => send_signal(pid, &name, true),
                },
            }
        };

        let _ = tokio::time::timeout(DRAIN_TIMEOUT, output).await;
        Ok(exit_code)
    }

    async fn run_with_pipes(&self, task: &mut Task, mut cmd: Command) -> Result<i32> {
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = self.spawn(cmd)?;
        let pid = child.id();

        let input = child.stdin.take().map(|mut stdin| {
            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(super::TASK_CHANNEL_CAPACITY);
            tokio::spawn(async move {
                while let Some(data) = rx.recv().await {
                    if stdin.write_all(&data).await.is_err() {
                        break;
                    }
                }
            });
            tx
        });
        let mut input = input;

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, task.io.stdout.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            if task.kind == TaskKind::Sftp {
                pumps.push(tokio::spawn(log_stderr(stderr)));
            } else {
                pumps.push(tokio::spawn(pump(stderr, task.io.stderr.clone())));
            }
        }

        let exit_code = loop {
            tokio::select! {
                status = child.wait() => {
                    break status
                        .map(exit_code_of_status)
                        .map_err(|e| Error::wrap(ErrorKind::System, "cannot wait for process", e))?;
                }
                _ = task.cancel.cancelled() => {
                    terminate(&mut child, false).await;
                    break -2;
                }
                data = task.io.stdin.recv(), if input.is_some() => match (data, &input) {
                    (Some(data), Some(tx)) => {
                        let _ = tx.send(data).await;
                    }
                    // Dropping the sender closes the child's stdin.
                    _ => input = None,
                },
                Some(event) = task.io.events.recv() => {
                    if let TaskEvent::Signal(name) = event {
                        send_signal(pid, &name, false);
                    }
                }
            }
        };

        for pump in pumps {
            let _ = pump.await;
        }
        Ok(exit_code)
    }

    fn spawn(&self, mut cmd: Command) -> Result<Child> {
        let child = cmd
            .spawn()
            .map_err(|e| {
                Error::wrap(
                    ErrorKind::System,
                    format!("cannot start process of user {}", self.user),
                    e,
                )
            })?;
        tracing::debug!(
            flow = %self.flow,
            session = %self.session,
            user = %self.user,
            pid = ?child.id(),
            "User's process started"
        );
        Ok(child)
    }
}

#[async_trait]
impl Environment for Local {
    fn session(&self) -> &Session {
        &self.session
    }

    async fn banner(&self, authorization: &Authorization) -> Result<String> {
        self.banner
            .render(&authorization.render_context())
            .map_err(|e| e.context("cannot render banner"))
    }

    async fn run(&self, mut task: Task) -> Result<i32> {
        let cmd = self.command(&task)?;
        match task.pty.clone() {
            Some(config) if task.kind != TaskKind::Sftp => {
                self.run_with_pty(&mut task, cmd, &config).await
            }
            _ => self.run_with_pipes(&mut task, cmd).await,
        }
    }

    fn is_port_forwarding_allowed(&self) -> bool {
        self.port_forwarding_allowed
    }

    async fn new_destination_connection(&self, host: &str, port: u16) -> Result<BoxedStream> {
        if !self.port_forwarding_allowed {
            return Err(Error::permission("port forwarding not allowed"));
        }
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::from(e).context(format!("cannot connect to {host}:{port}")))?;
        Ok(Box::new(stream))
    }

    async fn dispose(&self) -> Result<bool> {
        let mut disposed = false;
        if self.delete_user_on_dispose {
            if self.kill_processes_on_dispose && self.user.uid != 0 {
                let killed = user::kill_processes(self.user.uid)
                    .await
                    .map_err(|e| {
                        e.context(format!("cannot kill processes of user {}", self.user))
                    })?;
                tracing::debug!(user = %self.user, killed, "Processes of managed user killed");
            }
            if self.users.lookup_uid(self.user.uid).await?.is_some() {
                self.users
                    .delete(&self.user.name, self.delete_home_dir_on_dispose)
                    .await
                    .map_err(|e| e.context("cannot dispose environment"))?;
                disposed = true;
            }
        }

        self.session
            .set_environment_token(&[])
            .await
            .map_err(|e| e.context("cannot clear environment token"))?;
        Ok(disposed)
    }
}

async fn log_stderr<R: AsyncRead + Unpin>(from: R) {
    use tokio::io::AsyncBufReadExt;

    let mut lines = tokio::io::BufReader::new(from).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::error!(target: "bifroest::sftp", "{line}");
    }
}

fn exit_code_of_status(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

/// `SIGTERM`, then `SIGKILL` if the process does not exit in time.
async fn terminate(child: &mut Child, group: bool) {
    if let Some(pid) = child.id() {
        let pid = Pid::from_raw(pid as i32);
        let _ = if group {
            killpg(pid, Signal::SIGTERM)
        } else {
            kill(pid, Signal::SIGTERM)
        };
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

/// Unknown names are treated as `KILL`.
pub(crate) fn signal_of(name: &str) -> Signal {
    match name.trim_start_matches("SIG") {
        "ABRT" => Signal::SIGABRT,
        "ALRM" => Signal::SIGALRM,
        "FPE" => Signal::SIGFPE,
        "HUP" => Signal::SIGHUP,
        "ILL" => Signal::SIGILL,
        "INT" => Signal::SIGINT,
        "PIPE" => Signal::SIGPIPE,
        "QUIT" => Signal::SIGQUIT,
        "SEGV" => Signal::SIGSEGV,
        "TERM" => Signal::SIGTERM,
        "USR1" => Signal::SIGUSR1,
        "USR2" => Signal::SIGUSR2,
        _ => Signal::SIGKILL,
    }
}

fn send_signal(pid: Option<u32>, name: &str, group: bool) {
    let Some(pid) = pid else {
        return;
    };
    let signal = signal_of(name);
    let pid = Pid::from_raw(pid as i32);
    let result = if group { killpg(pid, signal) } else { kill(pid, signal) };
    if let Err(e) = result {
        tracing::warn!(pid = %pid, signal = %signal, error = %e, "Cannot send signal to process");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::authorization::testing::{flow, remote, repository};
    use crate::authorization::Identity;
    use crate::environment::TaskIo;
    use crate::template::{TemplateBool, TemplateString};

    struct Etc {
        dir: TempDir,
    }

    impl Etc {
        /// An etc directory containing `bob` with the uid of the test process.
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let uid = nix::unistd::geteuid().as_raw();
            let gid = nix::unistd::getegid().as_raw();
            let home = dir.path().join("home");
            std::fs::create_dir(&home).unwrap();
            std::fs::write(
                dir.path().join("passwd"),
                format!("bob:x:{uid}:{gid}:Bob:{}:/bin/sh\n", home.display()),
            )
            .unwrap();
            std::fs::write(dir.path().join("group"), format!("bob:x:{gid}:\n")).unwrap();
            Self { dir }
        }

        fn users(&self) -> user::Repository {
            user::Repository::new(self.dir.path())
        }
    }

    fn conf() -> EnvironmentLocal {
        EnvironmentLocal {
            name: TemplateString::new("{{.authorization.user.name}}").unwrap(),
            banner: TemplateString::new("Welcome {{.authorization.user.name}}").unwrap(),
            port_forwarding_allowed: TemplateBool::of(false),
            ..EnvironmentLocal::default()
        }
    }

    async fn task(auth: &Authorization, kind: TaskKind) -> (Task, crate::environment::TaskPeer) {
        let (io, peer) = TaskIo::pair();
        (
            Task {
                authorization: auth.clone(),
                kind,
                pty: None,
                env: BTreeMap::from([("GREETING".to_string(), "moin".to_string())]),
                io,
                cancel: CancellationToken::new(),
            },
            peer,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> String {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend(chunk);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_token_flags_only_apply_to_managed_users() {
        let user = User {
            name: "bob".into(),
            display_name: String::new(),
            uid: 1000,
            group: user::Group {
                name: "bob".into(),
                gid: 1000,
            },
            shell: "/bin/sh".into(),
            home_dir: "/home/bob".into(),
        };
        let all = DisposeFlags {
            delete_user: true,
            delete_home_dir: true,
            kill_processes: true,
        };

        let unmanaged = LocalToken::new(&user, false, all, true);
        assert!(!unmanaged.user.delete_on_dispose);
        assert!(!unmanaged.user.delete_home_dir_on_dispose);
        assert!(!unmanaged.user.kill_processes_on_dispose);
        assert_eq!(
            String::from_utf8(unmanaged.encode().unwrap()).unwrap(),
            r#"{"user":{"name":"bob","uid":1000},"portForwardingAllowed":true}"#
        );

        let managed = LocalToken::new(
            &user,
            true,
            DisposeFlags {
                delete_user: false,
                ..all
            },
            false,
        );
        assert!(!managed.user.delete_on_dispose);
        assert!(!managed.user.delete_home_dir_on_dispose);
        assert!(managed.user.kill_processes_on_dispose);
        assert_eq!(LocalToken::decode(&managed.encode().unwrap()).unwrap(), managed);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_of("INT"), Signal::SIGINT);
        assert_eq!(signal_of("SIGTERM"), Signal::SIGTERM);
        assert_eq!(signal_of("WHATEVER"), Signal::SIGKILL);
    }

    #[tokio::test]
    async fn test_ensure_existing_user_and_run_exec() {
        let etc = Etc::new();
        let (_dir, sessions) = repository().await;
        let flow = flow("f1");
        let session = sessions.create(&flow, &remote("bob"), None).await.unwrap();
        let identity = Identity::Simple { name: "bob".into() };
        let auth = Authorization::new(identity, &flow, &remote("bob"))
            .with_session(session.clone());

        let repo = LocalRepository::with_users(&flow, &conf(), etc.users());
        let env = repo.ensure(&auth).await.unwrap();
        assert_eq!(env.banner(&auth).await.unwrap(), "Welcome bob");
        assert!(!env.is_port_forwarding_allowed());

        let token = LocalToken::decode(&session.environment_token().await.unwrap()).unwrap();
        assert_eq!(token.user.name, "bob");
        assert!(!token.user.managed);

        let (task, mut peer) = task(
            &auth,
            TaskKind::Shell {
                command: Some(r#"echo "$GREETING $USER"; echo oops >&2; exit 7"#.to_string()),
            },
        )
        .await;
        assert_eq!(env.run(task).await.unwrap(), 7);
        assert_eq!(drain(&mut peer.stdout), "moin bob\n");
        assert_eq!(drain(&mut peer.stderr), "oops\n");
    }

    #[tokio::test]
    async fn test_run_reads_stdin_until_eof() {
        let etc = Etc::new();
        let (_dir, sessions) = repository().await;
        let flow = flow("f1");
        let session = sessions.create(&flow, &remote("bob"), None).await.unwrap();
        let identity = Identity::Simple { name: "bob".into() };
        let auth = Authorization::new(identity, &flow, &remote("bob")).with_session(session);
        let repo = LocalRepository::with_users(&flow, &conf(), etc.users());
        let env = repo.ensure(&auth).await.unwrap();

        let (task, mut peer) = task(
            &auth,
            TaskKind::Shell {
                command: Some("cat".to_string()),
            },
        )
        .await;
        peer.stdin.send(b"ping\n".to_vec()).await.unwrap();
        drop(peer.stdin);
        assert_eq!(env.run(task).await.unwrap(), 0);
        assert_eq!(drain(&mut peer.stdout), "ping\n");
    }

    #[tokio::test]
    async fn test_unknown_user_without_create() {
        let etc = Etc::new();
        let (_dir, sessions) = repository().await;
        let flow = flow("f1");
        let session = sessions.create(&flow, &remote("alice"), None).await.unwrap();
        let identity = Identity::Simple { name: "alice".into() };
        let auth = Authorization::new(identity, &flow, &remote("alice")).with_session(session);
        let repo = LocalRepository::with_users(&flow, &conf(), etc.users());
        let err = repo.ensure(&auth).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_find_by_session_with_vanished_user() {
        let etc = Etc::new();
        let (_dir, sessions) = repository().await;
        let flow = flow("f1");
        let session = sessions.create(&flow, &remote("bob"), None).await.unwrap();
        let token = LocalToken {
            user: LocalTokenUser {
                name: "ghost".into(),
                ..Default::default()
            },
            port_forwarding_allowed: true,
        };
        session.set_environment_token(&token.encode().unwrap()).await.unwrap();
        let repo = LocalRepository::with_users(&flow, &conf(), etc.users());

        let err = repo.find_by_session(&session, FindOpts::default()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Expired);
        assert!(!session.environment_token().await.unwrap().is_empty());

        let err = repo
            .find_by_session(
                &session,
                FindOpts {
                    auto_clean_up_allowed: true,
                },
            )
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(session.environment_token().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_unmanaged_user_keeps_it() {
        let etc = Etc::new();
        let (_dir, sessions) = repository().await;
        let flow = flow("f1");
        let session = sessions.create(&flow, &remote("bob"), None).await.unwrap();
        let identity = Identity::Simple { name: "bob".into() };
        let auth = Authorization::new(identity, &flow, &remote("bob"))
            .with_session(session.clone());
        let repo = LocalRepository::with_users(&flow, &conf(), etc.users());
        let env = repo.ensure(&auth).await.unwrap();

        assert!(!env.dispose().await.unwrap());
        assert!(session.environment_token().await.unwrap().is_empty());
        assert_eq!(
            repo.find_by_session(&session, FindOpts::default()).await.err().unwrap().kind(),
            ErrorKind::NotFound
        );
        assert!(etc.users().lookup("bob").await.unwrap().is_some());
    }
}
