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

//! Environment which only talks to the client; nothing is executed.

use std::sync::Arc;

use async_trait::async_trait;

use super::{
    not_acceptable, no_such_environment, session_of, BoxedStream, Environment, FindOpts, PtyConfig,
    Repository, Task, TaskEvent, TaskKind,
};
use crate::authorization::Authorization;
use crate::config::{EnvironmentDummy, FlowName};
use crate::session::Session;
use crate::shared::error::{Error, Result};

const TOKEN: &[u8] = br#"{"type":"dummy"}"#;

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;

pub struct DummyRepository {
    flow: FlowName,
    conf: Arc<EnvironmentDummy>,
}

impl DummyRepository {
    pub fn new(flow: &FlowName, conf: &EnvironmentDummy) -> Self {
        Self {
            flow: flow.clone(),
            conf: Arc::new(conf.clone()),
        }
    }

    fn environment(&self, session: &Session) -> Arc<dyn Environment> {
        Arc::new(Dummy {
            conf: Arc::clone(&self.conf),
            session: session.clone(),
        })
    }
}

#[async_trait]
impl Repository for DummyRepository {
    async fn will_be_accepted(&self, authorization: &Authorization) -> Result<bool> {
        self.conf
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
        session.set_environment_token(TOKEN).await?;
        tracing::debug!(flow = %self.flow, session = %session, "Dummy environment ensured");
        Ok(self.environment(session))
    }

    async fn find_by_session(
        &self,
        session: &Session,
        _: FindOpts,
    ) -> Result<Arc<dyn Environment>> {
        if session.environment_token().await?.is_empty() {
            return Err(no_such_environment(session));
        }
        Ok(self.environment(session))
    }
}

struct Dummy {
    conf: Arc<EnvironmentDummy>,
    session: Session,
}

#[async_trait]
impl Environment for Dummy {
    fn session(&self) -> &Session {
        &self.session
    }

    async fn banner(&self, authorization: &Authorization) -> Result<String> {
        self.conf
            .banner
            .render(&authorization.render_context())
            .map_err(|e| e.context("cannot render banner"))
    }

    async fn run(&self, mut task: Task) -> Result<i32> {
        if task.kind == TaskKind::Sftp {
            return Err(Error::user("sftp is not supported by the dummy environment").user_facing());
        }

        let introduction = self
            .conf
            .introduction
            .render(&task.authorization.render_context())
            .map_err(|e| e.context("cannot render introduction"))?;
        if !introduction.is_empty() {
            send(&task, format!("{}\r\n", introduction.replace('\n', "\r\n"))).await;
        }

        let exit_code = self.conf.exit_code;
        if task.pty.is_none() || task.kind.command().is_some() {
            return Ok(exit_code);
        }

        send(&task, "Press Ctrl+C or Ctrl+D to exit.\r\n".to_string()).await;
        loop {
            tokio::select! {
                _ = task.cancel.cancelled() => return Ok(-2),
                input = task.io.stdin.recv() => match input {
                    None => break,
                    Some(data) => {
                        if data.iter().any(|b| *b == CTRL_C || *b == CTRL_D) {
                            break;
                        }
                        let _ = task.io.stdout.send(data).await;
                    }
                },
                event = task.io.events.recv() => match event {
                    Some(TaskEvent::WindowChange { cols, rows }) => {
                        send(&task, format!("\r\n[window changed to {cols}x{rows}]\r\n")).await;
                    }
                    Some(TaskEvent::Signal(name)) => {
                        send(&task, format!("\r\n[received signal {name}]\r\n")).await;
                    }
                    None => {}
                },
            }
        }

        send(&task, "\r\nBye!\r\n\r\n".to_string()).await;
        Ok(exit_code)
    }

    fn is_port_forwarding_allowed(&self) -> bool {
        false
    }

    async fn new_destination_connection(&self, _: &str, _: u16) -> Result<BoxedStream> {
        Err(Error::permission("port forwarding not allowed"))
    }

    async fn dispose(&self) -> Result<bool> {
        if self.session.environment_token().await?.is_empty() {
            return Ok(false);
        }
        self.session
            .set_environment_token(&[])
            .await
            .map_err(|e| e.context("cannot dispose environment"))?;
        Ok(true)
    }
}

async fn send(task: &Task, text: String) {
    let _ = task.io.stdout.send(text.into_bytes()).await;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::authorization::testing::{flow, remote, repository};
    use crate::authorization::Identity;
    use crate::environment::TaskIo;
    use crate::shared::error::ErrorKind;
    use crate::template::{TemplateBool, TemplateString};

    fn conf() -> EnvironmentDummy {
        EnvironmentDummy {
            login_allowed: TemplateBool::new(r#"{{ ne .authorization.user.name "mallory" }}"#)
                .unwrap(),
            banner: TemplateString::new("Hello {{.authorization.user.name}}!").unwrap(),
            introduction: TemplateString::literal("Nothing to see here."),
            exit_code: 3,
        }
    }

    #[tokio::test]
    async fn test_ensure_find_dispose() {
        let (_dir, sessions) = repository().await;
        let flow = flow("f1");
        let session = sessions.create(&flow, &remote("bob"), None).await.unwrap();
        let identity = Identity::Simple { name: "bob".into() };
        let auth =
            Authorization::new(identity, &flow, &remote("bob")).with_session(session.clone());

        let repo = DummyRepository::new(&flow, &conf());
        let err = repo.find_by_session(&session, FindOpts::default()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let env = repo.ensure(&auth).await.unwrap();
        assert_eq!(env.banner(&auth).await.unwrap(), "Hello bob!");
        assert!(!env.is_port_forwarding_allowed());
        let err = env.new_destination_connection("10.1.1.1", 80).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Permission);

        let found = repo.find_by_session(&session, FindOpts::default()).await.unwrap();
        assert_eq!(found.session(), &session);

        assert!(env.dispose().await.unwrap());
        assert!(!env.dispose().await.unwrap());
        assert!(repo.find_by_session(&session, FindOpts::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_login_not_allowed() {
        let (_dir, sessions) = repository().await;
        let flow = flow("f1");
        let session = sessions.create(&flow, &remote("mallory"), None).await.unwrap();
        let identity = Identity::Simple {
            name: "mallory".into(),
        };
        let auth = Authorization::new(identity, &flow, &remote("mallory")).with_session(session);
        let repo = DummyRepository::new(&flow, &conf());
        assert!(!repo.will_be_accepted(&auth).await.unwrap());
        assert_eq!(repo.ensure(&auth).await.err().unwrap().kind(), ErrorKind::Permission);
    }

    #[tokio::test]
    async fn test_run_interactive_until_ctrl_d() {
        let (_dir, sessions) = repository().await;
        let flow = flow("f1");
        let session = sessions.create(&flow, &remote("bob"), None).await.unwrap();
        let auth = Authorization::new(Identity::None, &flow, &remote("bob")).with_session(session);
        let repo = DummyRepository::new(&flow, &conf());
        let env = repo.ensure(&auth).await.unwrap();

        let (io, mut peer) = TaskIo::pair();
        let task = Task {
            authorization: auth,
            kind: TaskKind::Shell { command: None },
            pty: Some(PtyConfig::default()),
            env: BTreeMap::new(),
            io,
            cancel: CancellationToken::new(),
        };
        let running = tokio::spawn(async move { env.run(task).await });

        peer.stdin.send(b"hi".to_vec()).await.unwrap();
        peer.events.send(TaskEvent::WindowChange { cols: 100, rows: 30 }).await.unwrap();
        peer.stdin.send(vec![CTRL_D]).await.unwrap();
        assert_eq!(running.await.unwrap().unwrap(), 3);

        let mut output = Vec::new();
        while let Ok(chunk) = peer.stdout.try_recv() {
            output.extend(chunk);
        }
        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("Nothing to see here.\r\n"));
        assert!(output.contains("hi"));
        assert!(output.contains("Bye!"));
    }

    #[tokio::test]
    async fn test_run_sftp_is_rejected() {
        let (_dir, sessions) = repository().await;
        let flow = flow("f1");
        let session = sessions.create(&flow, &remote("bob"), None).await.unwrap();
        let auth = Authorization::new(Identity::None, &flow, &remote("bob")).with_session(session);
        let repo = DummyRepository::new(&flow, &conf());
        let env = repo.ensure(&auth).await.unwrap();
        let (io, _peer) = TaskIo::pair();
        let task = Task {
            authorization: auth,
            kind: TaskKind::Sftp,
            pty: None,
            env: BTreeMap::new(),
            io,
            cancel: CancellationToken::new(),
        };
        assert_eq!(env.run(task).await.err().unwrap().kind(), ErrorKind::User);
    }
}
