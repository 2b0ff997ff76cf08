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

//! Pieces shared by the container based environments.
//!
//! Everything needed to run tasks in an existing container or pod is stored
//! as metadata on the resource itself, so an environment can be restored from
//! nothing but the resource after a restart.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{BoxedStream, TaskKind};
use crate::authorization::Authorization;
use crate::config::FlowName;
use crate::session::{Session, SessionId};
use crate::shared::error::{Error, ErrorKind, Result};
use crate::template::{RenderContext, TemplateBool, TemplateString, TemplateStrings};

pub const LABEL_PREFIX: &str = "org.engity.bifroest/";
pub const LABEL_FLOW: &str = "org.engity.bifroest/flow";
pub const LABEL_SESSION_ID: &str = "org.engity.bifroest/session-id";
pub const LABEL_CREATED_REMOTE_USER: &str = "org.engity.bifroest/created-remote-user";
pub const LABEL_CREATED_REMOTE_HOST: &str = "org.engity.bifroest/created-remote-host";

pub const META_SHELL_COMMAND: &str = "org.engity.bifroest/shellCommand";
pub const META_EXEC_COMMAND: &str = "org.engity.bifroest/execCommand";
pub const META_SFTP_COMMAND: &str = "org.engity.bifroest/sftpCommand";
pub const META_DIRECT_COMMAND: &str = "org.engity.bifroest/directCommand";
pub const META_USER: &str = "org.engity.bifroest/user";
pub const META_GROUP: &str = "org.engity.bifroest/group";
pub const META_DIRECTORY: &str = "org.engity.bifroest/directory";
pub const META_PORT_FORWARDING_ALLOWED: &str = "org.engity.bifroest/portForwardingAllowed";
pub const META_ACCESS_TOKEN: &str = "org.engity.bifroest/accessToken";

/// Where the running binary is mounted inside containers.
pub const BINARY_MOUNT_TARGET: &str = "/usr/bin/bifroest";

pub const ENV_SESSION_ID: &str = "BIFROEST_SESSION_ID";
pub const ENV_TARGET_HOST: &str = "BIFROEST_TARGET_HOST";
pub const ENV_TARGET_PORT: &str = "BIFROEST_TARGET_PORT";

const BRIDGE_BUFFER_SIZE: usize = 64 * 1024;

/// Environment token of container based environments.
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerToken {
    #[serde(default)]
    pub port_forwarding_allowed: bool,
}

impl ContainerToken {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot marshal environment token", e))
    }
}

/// Template sections both container environments render on creation.
pub struct SettingsTemplates<'a> {
    pub shell_command: &'a TemplateStrings,
    pub exec_command: &'a TemplateStrings,
    pub sftp_command: &'a TemplateStrings,
    pub direct_command: &'a TemplateStrings,
    pub user: &'a TemplateString,
    pub group: Option<&'a TemplateString>,
    pub directory: &'a TemplateString,
    pub port_forwarding_allowed: &'a TemplateBool,
}

/// How tasks are run inside one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub flow: FlowName,
    pub session_id: SessionId,
    pub created_remote_user: String,
    pub created_remote_host: String,
    pub shell_command: Vec<String>,
    pub exec_command: Vec<String>,
    pub sftp_command: Vec<String>,
    pub direct_command: Vec<String>,
    pub user: String,
    pub group: String,
    pub directory: String,
    pub port_forwarding_allowed: bool,
    /// Only set by environments that hand a token into the container.
    pub access_token: Vec<u8>,
}

fn render_strings(name: &str, t: &TemplateStrings, ctx: &RenderContext) -> Result<Vec<String>> {
    t.render(ctx)
        .map_err(|e| Error::wrap(ErrorKind::Config, format!("cannot evaluate {name}"), e))
}

fn render_string(name: &str, t: &TemplateString, ctx: &RenderContext) -> Result<String> {
    t.render(ctx)
        .map_err(|e| Error::wrap(ErrorKind::Config, format!("cannot evaluate {name}"), e))
}

impl Settings {
    pub fn resolve(
        flow: &FlowName,
        session: &Session,
        authorization: &Authorization,
        templates: SettingsTemplates<'_>,
    ) -> Result<Self> {
        let ctx = authorization.render_context();
        let mut shell_command = render_strings("shellCommand", templates.shell_command, &ctx)?;
        if shell_command.is_empty() {
            shell_command = vec!["/bin/sh".to_string()];
        }
        let mut exec_command = render_strings("execCommand", templates.exec_command, &ctx)?;
        if exec_command.is_empty() {
            exec_command = vec!["/bin/sh".to_string(), "-c".to_string()];
        }
        let mut sftp_command = render_strings("sftpCommand", templates.sftp_command, &ctx)?;
        if sftp_command.is_empty() {
            sftp_command = vec![BINARY_MOUNT_TARGET.to_string(), "sftp-server".to_string()];
        }

        Ok(Self {
            flow: flow.clone(),
            session_id: session.id(),
            created_remote_user: authorization.remote().user().to_string(),
            created_remote_host: authorization.remote().host().to_string(),
            shell_command,
            exec_command,
            sftp_command,
            direct_command: render_strings("directCommand", templates.direct_command, &ctx)?,
            user: render_string("user", templates.user, &ctx)?,
            group: match templates.group {
                Some(t) => render_string("group", t, &ctx)?,
                None => String::new(),
            },
            directory: render_string("directory", templates.directory, &ctx)?,
            port_forwarding_allowed: templates
                .port_forwarding_allowed
                .render(&ctx)
                .map_err(|e| {
                    Error::wrap(ErrorKind::Config, "cannot evaluate portForwardingAllowed", e)
                })?,
            access_token: Vec::new(),
        })
    }

    /// Values that identify the resource; safe to use as selector labels.
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_FLOW.to_string(), self.flow.to_string()),
            (LABEL_SESSION_ID.to_string(), self.session_id.to_string()),
        ])
    }

    /// Who caused the resource to be created, as `user` and `host:port`.
    pub fn origin(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_CREATED_REMOTE_USER.to_string(), self.created_remote_user.clone()),
            (LABEL_CREATED_REMOTE_HOST.to_string(), self.created_remote_host.clone()),
        ])
    }

    /// Everything else; free-form values.
    pub fn metadata(&self) -> Result<BTreeMap<String, String>> {
        let encode = |v: &Vec<String>| {
            serde_json::to_string(v)
                .map_err(|e| Error::wrap(ErrorKind::System, "cannot encode command", e))
        };
        let mut result = BTreeMap::from([
            (META_SHELL_COMMAND.to_string(), encode(&self.shell_command)?),
            (META_EXEC_COMMAND.to_string(), encode(&self.exec_command)?),
            (META_SFTP_COMMAND.to_string(), encode(&self.sftp_command)?),
            (META_DIRECT_COMMAND.to_string(), encode(&self.direct_command)?),
        ]);
        if !self.user.is_empty() {
            result.insert(META_USER.to_string(), self.user.clone());
        }
        if !self.group.is_empty() {
            result.insert(META_GROUP.to_string(), self.group.clone());
        }
        if !self.directory.is_empty() {
            result.insert(META_DIRECTORY.to_string(), self.directory.clone());
        }
        if self.port_forwarding_allowed {
            result.insert(META_PORT_FORWARDING_ALLOWED.to_string(), "true".to_string());
        }
        if !self.access_token.is_empty() {
            result.insert(META_ACCESS_TOKEN.to_string(), hex::encode(&self.access_token));
        }
        Ok(result)
    }

    /// Inverse of [`Settings::labels`], [`Settings::origin`] and
    /// [`Settings::metadata`] merged into one map.
    pub fn parse(expected_flow: &FlowName, values: &HashMap<String, String>) -> Result<Self> {
        let problem = |msg: String| Error::system(format!("resource contains problems: {msg}"));
        let required = |key: &str| {
            values
                .get(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| problem(format!("missing {key}")))
        };
        let decode = |key: &str| -> Result<Vec<String>> {
            match values.get(key).filter(|v| !v.is_empty()) {
                None => Ok(Vec::new()),
                Some(v) => serde_json::from_str(v)
                    .map_err(|e| problem(format!("cannot decode {key}: {e}"))),
            }
        };

        let flow = required(LABEL_FLOW)?;
        if flow != expected_flow.as_str() {
            return Err(problem(format!("expected flow {expected_flow} but resource has {flow}")));
        }
        let session_id = required(LABEL_SESSION_ID)?
            .parse::<SessionId>()
            .map_err(|e| problem(format!("cannot decode {LABEL_SESSION_ID}: {e}")))?;

        let shell_command = decode(META_SHELL_COMMAND)?;
        if shell_command.is_empty() {
            return Err(problem(format!("missing {META_SHELL_COMMAND}")));
        }
        let exec_command = decode(META_EXEC_COMMAND)?;
        if exec_command.is_empty() {
            return Err(problem(format!("missing {META_EXEC_COMMAND}")));
        }

        let access_token = match values.get(META_ACCESS_TOKEN).filter(|v| !v.is_empty()) {
            None => Vec::new(),
            Some(v) => hex::decode(v)
                .map_err(|e| problem(format!("cannot decode {META_ACCESS_TOKEN}: {e}")))?,
        };

        let get = |key: &str| values.get(key).cloned().unwrap_or_default();
        Ok(Self {
            flow: expected_flow.clone(),
            session_id,
            created_remote_user: get(LABEL_CREATED_REMOTE_USER),
            created_remote_host: get(LABEL_CREATED_REMOTE_HOST),
            shell_command,
            exec_command,
            sftp_command: decode(META_SFTP_COMMAND)?,
            direct_command: decode(META_DIRECT_COMMAND)?,
            user: get(META_USER),
            group: get(META_GROUP),
            directory: get(META_DIRECTORY),
            port_forwarding_allowed: values.get(META_PORT_FORWARDING_ALLOWED).map(String::as_str)
                == Some("true"),
            access_token,
        })
    }

    /// Command line of `kind` inside the container.
    pub fn command_for(&self, kind: &TaskKind) -> Result<Vec<String>> {
        match kind {
            TaskKind::Shell { command: None } => Ok(self.shell_command.clone()),
            TaskKind::Shell { command: Some(line) } => {
                let mut result = self.exec_command.clone();
                result.push(line.clone());
                Ok(result)
            }
            TaskKind::Sftp => {
                if self.sftp_command.is_empty() {
                    Err(Error::user("sftp is not supported by this environment").user_facing())
                } else {
                    Ok(self.sftp_command.clone())
                }
            }
        }
    }

    /// Command and environment to reach `host:port` from inside the container.
    pub fn direct_command_for(&self, host: &str, port: u16) -> Result<(Vec<String>, Vec<String>)> {
        if !self.port_forwarding_allowed {
            return Err(Error::permission("port forwarding not allowed"));
        }
        if self.direct_command.is_empty() {
            return Err(Error::config(
                "directCommand is empty; cannot open connections inside the environment",
            ));
        }
        Ok((
            self.direct_command.clone(),
            vec![format!("{ENV_TARGET_HOST}={host}"), format!("{ENV_TARGET_PORT}={port}")],
        ))
    }
}

/// Turn the output stream and input writer of a remote process into one
/// bidirectional stream.
pub fn bridge<O, W>(output: O, input: W) -> BoxedStream
where
    O: Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (local, remote) = tokio::io::duplex(BRIDGE_BUFFER_SIZE);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    tokio::spawn(async move {
        let mut output = output;
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(data) => {
                    if remote_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Destination output failed");
                    break;
                }
            }
        }
        let _ = remote_write.shutdown().await;
    });

    tokio::spawn(async move {
        let mut input = input;
        let _ = copy_and_close(&mut remote_read, &mut input).await;
    });

    Box::new(local)
}

async fn copy_and_close<R, W>(from: &mut R, to: &mut W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        to.write_all(&buf[..n]).await?;
    }
    to.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::testing::{flow, remote, repository};
    use crate::authorization::Identity;

    fn templates<'a>(
        strings: &'a (TemplateStrings, TemplateStrings, TemplateStrings, TemplateStrings),
        user: &'a TemplateString,
        allowed: &'a TemplateBool,
    ) -> SettingsTemplates<'a> {
        SettingsTemplates {
            shell_command: &strings.0,
            exec_command: &strings.1,
            sftp_command: &strings.2,
            direct_command: &strings.3,
            user,
            group: None,
            directory: user,
            port_forwarding_allowed: allowed,
        }
    }

    #[tokio::test]
    async fn test_settings_survive_labels_and_metadata() {
        let (_dir, sessions) = repository().await;
        let flow = flow("containers");
        let session = sessions.create(&flow, &remote("bob"), None).await.unwrap();
        let identity = Identity::Simple { name: "bob".into() };
        let auth =
            Authorization::new(identity, &flow, &remote("bob")).with_session(session.clone());

        let strings = (
            TemplateStrings::default(),
            TemplateStrings::default(),
            TemplateStrings::of(["/opt/sftp"]),
            TemplateStrings::of(["nc", "$BIFROEST_TARGET_HOST"]),
        );
        let user = TemplateString::new("{{.authorization.user.name}}").unwrap();
        let allowed = TemplateBool::of(true);
        let tmpl = templates(&strings, &user, &allowed);
        let settings = Settings::resolve(&flow, &session, &auth, tmpl).unwrap();
        assert_eq!(settings.shell_command, vec!["/bin/sh"]);
        assert_eq!(settings.exec_command, vec!["/bin/sh", "-c"]);
        assert_eq!(settings.user, "bob");
        assert_eq!(settings.created_remote_host, "10.0.0.5:40000");

        let mut values: HashMap<String, String> = settings.labels().into_iter().collect();
        values.extend(settings.origin());
        values.extend(settings.metadata().unwrap());
        let parsed = Settings::parse(&flow, &values).unwrap();
        assert_eq!(parsed, settings);

        let other = crate::authorization::testing::flow("other");
        let err = Settings::parse(&other, &values).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::System);
    }

    #[tokio::test]
    async fn test_metadata_names() {
        let (_dir, sessions) = repository().await;
        let flow = flow("containers");
        let session = sessions.create(&flow, &remote("bob"), None).await.unwrap();
        let auth =
            Authorization::new(Identity::None, &flow, &remote("bob")).with_session(session.clone());
        let strings = (
            TemplateStrings::default(),
            TemplateStrings::default(),
            TemplateStrings::default(),
            TemplateStrings::of(["nc"]),
        );
        let user = TemplateString::new("root").unwrap();
        let allowed = TemplateBool::of(true);
        let tmpl = templates(&strings, &user, &allowed);
        let mut settings = Settings::resolve(&flow, &session, &auth, tmpl).unwrap();
        settings.access_token = vec![0xde, 0xad, 0xbe, 0xef];

        let metadata = settings.metadata().unwrap();
        let keys: Vec<&str> = metadata.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "org.engity.bifroest/accessToken",
                "org.engity.bifroest/directCommand",
                "org.engity.bifroest/directory",
                "org.engity.bifroest/execCommand",
                "org.engity.bifroest/portForwardingAllowed",
                "org.engity.bifroest/sftpCommand",
                "org.engity.bifroest/shellCommand",
                "org.engity.bifroest/user",
            ]
        );
        assert_eq!(metadata[META_ACCESS_TOKEN], "deadbeef");

        let origin = settings.origin();
        assert_eq!(origin[LABEL_CREATED_REMOTE_USER], "bob");
        assert_eq!(origin[LABEL_CREATED_REMOTE_HOST], "10.0.0.5:40000");

        let mut values: HashMap<String, String> = settings.labels().into_iter().collect();
        values.insert(META_SHELL_COMMAND.to_string(), r#"["/bin/sh"]"#.to_string());
        values.insert(META_EXEC_COMMAND.to_string(), r#"["/bin/sh","-c"]"#.to_string());
        values.insert(META_ACCESS_TOKEN.to_string(), "not-hex".to_string());
        assert_eq!(Settings::parse(&flow, &values).unwrap_err().kind(), ErrorKind::System);
    }

    #[tokio::test]
    async fn test_commands_per_task_kind() {
        let (_dir, sessions) = repository().await;
        let flow = flow("containers");
        let session = sessions.create(&flow, &remote("bob"), None).await.unwrap();
        let auth =
            Authorization::new(Identity::None, &flow, &remote("bob")).with_session(session.clone());
        let strings = (
            TemplateStrings::of(["/bin/bash", "-l"]),
            TemplateStrings::default(),
            TemplateStrings::default(),
            TemplateStrings::default(),
        );
        let empty = TemplateString::default();
        let denied = TemplateBool::of(false);
        let tmpl = templates(&strings, &empty, &denied);
        let settings = Settings::resolve(&flow, &session, &auth, tmpl).unwrap();

        assert_eq!(
            settings.command_for(&TaskKind::Shell { command: None }).unwrap(),
            vec!["/bin/bash", "-l"]
        );
        assert_eq!(
            settings
                .command_for(&TaskKind::Shell {
                    command: Some("id -u".into())
                })
                .unwrap(),
            vec!["/bin/sh", "-c", "id -u"]
        );
        assert_eq!(
            settings.command_for(&TaskKind::Sftp).unwrap(),
            vec![BINARY_MOUNT_TARGET, "sftp-server"]
        );
        assert_eq!(
            settings.direct_command_for("10.1.1.1", 80).unwrap_err().kind(),
            ErrorKind::Permission
        );
    }

    #[tokio::test]
    async fn test_bridge_copies_both_directions() {
        let output = futures::stream::iter(vec![Ok(Bytes::from_static(b"pong"))]);
        let (input, mut input_peer) = tokio::io::duplex(64);
        let mut stream = bridge(output, input);

        stream.write_all(b"ping").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut received = Vec::new();
        input_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        let mut answer = Vec::new();
        stream.read_to_end(&mut answer).await.unwrap();
        assert_eq!(answer, b"pong");
    }
}
