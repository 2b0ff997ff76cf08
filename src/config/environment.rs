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

//! Environment sections of a flow.
//!
//! Most values are templates rendered against the authorization of the
//! connecting user (`{{.authorization.user.name}}`, `{{.session.id}}`, ...).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::duration::Duration;
use crate::template::{TemplateBool, TemplateString, TemplateStrings};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EnvironmentSpec {
    Dummy(EnvironmentDummy),
    Local(EnvironmentLocal),
    Docker(EnvironmentDocker),
    Kubernetes(EnvironmentKubernetes),
}

impl EnvironmentSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            EnvironmentSpec::Dummy(_) => "dummy",
            EnvironmentSpec::Local(_) => "local",
            EnvironmentSpec::Docker(_) => "docker",
            EnvironmentSpec::Kubernetes(_) => "kubernetes",
        }
    }
}

/// Prints a banner and exits; for tests and demos.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvironmentDummy {
    pub login_allowed: TemplateBool,
    pub banner: TemplateString,
    pub introduction: TemplateString,
    pub exit_code: i32,
}

impl Default for EnvironmentDummy {
    fn default() -> Self {
        Self {
            login_allowed: TemplateBool::of(true),
            banner: TemplateString::default(),
            introduction: TemplateString::default(),
            exit_code: 0,
        }
    }
}

/// Runs sessions as a user of the host.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvironmentLocal {
    pub name: TemplateString,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<TemplateString>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<TemplateString>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<TemplateString>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_dir: Option<TemplateString>,

    pub login_allowed: TemplateBool,
    pub create_if_absent: TemplateBool,
    pub update_if_different: TemplateBool,
    pub dispose: LocalDispose,
    pub banner: TemplateString,
    pub port_forwarding_allowed: TemplateBool,
}

impl Default for EnvironmentLocal {
    fn default() -> Self {
        Self {
            name: TemplateString::new("{{.authorization.user.name}}").unwrap_or_default(),
            uid: None,
            group: None,
            shell: None,
            home_dir: None,
            login_allowed: TemplateBool::of(true),
            create_if_absent: TemplateBool::of(false),
            update_if_different: TemplateBool::of(false),
            dispose: LocalDispose::default(),
            banner: TemplateString::default(),
            port_forwarding_allowed: TemplateBool::of(true),
        }
    }
}

/// What happens to a managed user when its environment is disposed.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalDispose {
    pub delete_managed_user: TemplateBool,
    pub delete_managed_user_home_dir: TemplateBool,
    pub kill_managed_user_processes: TemplateBool,
}

impl Default for LocalDispose {
    fn default() -> Self {
        Self {
            delete_managed_user: TemplateBool::of(true),
            delete_managed_user_home_dir: TemplateBool::of(true),
            kill_managed_user_processes: TemplateBool::of(true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PullPolicy {
    #[default]
    IfAbsent,
    Always,
    Never,
}

/// Default command used to reach a forwarding target from inside a container.
pub const DEFAULT_DIRECT_COMMAND: &str = r#"exec nc "$BIFROEST_TARGET_HOST" "$BIFROEST_TARGET_PORT""#;

fn default_direct_command() -> TemplateStrings {
    TemplateStrings::of(["/bin/sh", "-c", DEFAULT_DIRECT_COMMAND])
}

/// One container per session.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvironmentDocker {
    pub login_allowed: TemplateBool,

    /// Daemon address; empty uses the local defaults (`DOCKER_HOST` or the unix socket).
    pub host: TemplateString,

    pub image: TemplateString,
    pub image_pull_policy: PullPolicy,
    pub network: TemplateString,
    pub volumes: TemplateStrings,
    pub capabilities: TemplateStrings,
    pub privileged: TemplateBool,
    pub dns_servers: TemplateStrings,
    pub dns_search: TemplateStrings,

    /// Default: `["/bin/sh"]`
    pub shell_command: TemplateStrings,

    /// Prefix for `exec` requests; the command line is appended. Default: `["/bin/sh", "-c"]`
    pub exec_command: TemplateStrings,

    /// Default: `["/usr/bin/bifroest", "sftp-server"]`
    pub sftp_command: TemplateStrings,

    /// Run for each port forward with `BIFROEST_TARGET_HOST`/`BIFROEST_TARGET_PORT` set.
    pub direct_command: TemplateStrings,

    /// Mount the running bifroest binary at `/usr/bin/bifroest` (read-only).
    pub mount_binary: TemplateBool,

    pub user: TemplateString,
    pub directory: TemplateString,
    pub banner: TemplateString,
    pub port_forwarding_allowed: TemplateBool,

    /// Keep the container process alive while no exec is attached.
    pub block_command: TemplateStrings,

    pub clean_orphan: TemplateBool,
}

impl Default for EnvironmentDocker {
    fn default() -> Self {
        Self {
            login_allowed: TemplateBool::of(true),
            host: TemplateString::default(),
            image: TemplateString::literal("alpine"),
            image_pull_policy: PullPolicy::IfAbsent,
            network: TemplateString::literal("default"),
            volumes: TemplateStrings::default(),
            capabilities: TemplateStrings::default(),
            privileged: TemplateBool::of(false),
            dns_servers: TemplateStrings::default(),
            dns_search: TemplateStrings::default(),
            shell_command: TemplateStrings::of(["/bin/sh"]),
            exec_command: TemplateStrings::of(["/bin/sh", "-c"]),
            sftp_command: TemplateStrings::of(["/usr/bin/bifroest", "sftp-server"]),
            direct_command: default_direct_command(),
            mount_binary: TemplateBool::of(true),
            user: TemplateString::default(),
            directory: TemplateString::default(),
            banner: TemplateString::default(),
            port_forwarding_allowed: TemplateBool::of(true),
            block_command: TemplateStrings::of([
                "/bin/sh",
                "-c",
                "trap 'exit 0' TERM; while true; do sleep 1; done",
            ]),
            clean_orphan: TemplateBool::of(true),
        }
    }
}

/// One pod per session.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvironmentKubernetes {
    pub login_allowed: TemplateBool,

    /// kubeconfig file; empty infers in-cluster or `KUBECONFIG`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    pub name: TemplateString,
    pub namespace: TemplateString,
    pub service_account: TemplateString,
    pub image: TemplateString,
    pub image_pull_policy: PullPolicy,
    pub ready_timeout: Duration,
    pub remove_timeout: Duration,
    pub capabilities: TemplateStrings,
    pub privileged: TemplateBool,
    pub dns_servers: TemplateStrings,
    pub dns_search: TemplateStrings,
    pub shell_command: TemplateStrings,
    pub exec_command: TemplateStrings,
    pub sftp_command: TemplateStrings,
    pub direct_command: TemplateStrings,
    pub block_command: TemplateStrings,
    pub user: TemplateString,
    pub group: TemplateString,
    pub directory: TemplateString,
    pub banner: TemplateString,
    pub port_forwarding_allowed: TemplateBool,
    pub clean_orphan: TemplateBool,
}

impl Default for EnvironmentKubernetes {
    fn default() -> Self {
        Self {
            login_allowed: TemplateBool::of(true),
            config: None,
            context: None,
            name: TemplateString::new("bifroest-{{.session.id}}").unwrap_or_default(),
            namespace: TemplateString::literal("default"),
            service_account: TemplateString::default(),
            image: TemplateString::literal("alpine"),
            image_pull_policy: PullPolicy::IfAbsent,
            ready_timeout: Duration::from_secs(5 * 60),
            remove_timeout: Duration::from_secs(60),
            capabilities: TemplateStrings::default(),
            privileged: TemplateBool::of(false),
            dns_servers: TemplateStrings::default(),
            dns_search: TemplateStrings::default(),
            shell_command: TemplateStrings::of(["/bin/sh"]),
            exec_command: TemplateStrings::of(["/bin/sh", "-c"]),
            sftp_command: TemplateStrings::of(["/usr/bin/bifroest", "sftp-server"]),
            direct_command: default_direct_command(),
            block_command: TemplateStrings::of([
                "/bin/sh",
                "-c",
                "trap 'exit 0' TERM; while true; do sleep 1; done",
            ]),
            user: TemplateString::default(),
            group: TemplateString::default(),
            directory: TemplateString::default(),
            banner: TemplateString::default(),
            port_forwarding_allowed: TemplateBool::of(true),
            clean_orphan: TemplateBool::of(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_defaults_apply() {
        let spec: EnvironmentSpec = serde_yaml::from_str("type: docker\nimage: ubuntu\n").unwrap();
        match spec {
            EnvironmentSpec::Docker(docker) => {
                assert_eq!(docker.image, TemplateString::literal("ubuntu"));
                assert_eq!(docker.shell_command, TemplateStrings::of(["/bin/sh"]));
                assert_eq!(docker.image_pull_policy, PullPolicy::IfAbsent);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_kubernetes_defaults() {
        let spec: EnvironmentSpec = serde_yaml::from_str("type: kubernetes\n").unwrap();
        match spec {
            EnvironmentSpec::Kubernetes(k8s) => {
                assert_eq!(k8s.ready_timeout, Duration::from_secs(300));
                assert_eq!(k8s.remove_timeout, Duration::from_secs(60));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_local_dispose_parse() {
        let spec: EnvironmentSpec = serde_yaml::from_str(
            "type: local\ncreateIfAbsent: true\ndispose:\n  deleteManagedUser: false\n",
        )
        .unwrap();
        assert_eq!(spec.type_name(), "local");
    }
}
