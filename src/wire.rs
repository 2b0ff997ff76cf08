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
//! Assembles the runtime services out of a [`Configuration`].

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::authorization::{
    Authorizer, AuthorizerFacade, HtpasswdAuthorizer, LocalAuthorizer, NoneAuthorizer,
    OidcAuthorizer, SimpleAuthorizer,
};
use crate::config::{AuthorizationSpec, Configuration, EnvironmentSpec, Flow};
use crate::environment::{
    DockerRepository, DummyRepository, EnvironmentFacade, KubernetesRepository, LocalRepository,
    Repository,
};
use crate::server::Services;
use crate::session::FsRepository;

impl Services {
    /// Create the session repository plus one authorizer and one
    /// environment repository for every configured flow.
    pub async fn build(configuration: Configuration) -> Result<Services> {
        let sessions = FsRepository::new(&configuration.session)
            .await
            .context("Cannot create session repository")?;

        let mut authorizers = AuthorizerFacade::new();
        let mut environments = EnvironmentFacade::new();

        for flow in &configuration.flows {
            let authorizer = build_authorizer(flow)
                .with_context(|| format!("Cannot create authorizer of flow {}", flow.name))?;
            let repository = build_environment(flow, &sessions)
                .await
                .with_context(|| format!("Cannot create environment of flow {}", flow.name))?;

            tracing::debug!(
                flow = %flow.name,
                authorization = flow.authorization.type_name(),
                environment = flow.environment.type_name(),
                "Flow configured"
            );

            authorizers.push(flow.name.clone(), flow.requirement.clone(), authorizer);
            environments.push(flow.name.clone(), repository);
        }

        Ok(Services {
            configuration: Arc::new(configuration),
            sessions,
            authorizers,
            environments,
        })
    }
}

fn build_authorizer(flow: &Flow) -> Result<Box<dyn Authorizer>> {
    Ok(match &flow.authorization {
        AuthorizationSpec::None(_) => Box::new(NoneAuthorizer::new(&flow.name)),
        AuthorizationSpec::Htpasswd(conf) => Box::new(HtpasswdAuthorizer::new(&flow.name, conf)?),
        AuthorizationSpec::Simple(conf) => Box::new(SimpleAuthorizer::new(&flow.name, conf)?),
        AuthorizationSpec::Local(conf) => Box::new(LocalAuthorizer::new(&flow.name, conf)),
        AuthorizationSpec::OidcDevice(conf) => Box::new(OidcAuthorizer::new(&flow.name, conf)?),
    })
}

async fn build_environment(flow: &Flow, sessions: &FsRepository) -> Result<Arc<dyn Repository>> {
    Ok(match &flow.environment {
        EnvironmentSpec::Dummy(conf) => Arc::new(DummyRepository::new(&flow.name, conf)),
        EnvironmentSpec::Local(conf) => Arc::new(LocalRepository::new(&flow.name, conf)),
        EnvironmentSpec::Docker(conf) => {
            Arc::new(DockerRepository::new(&flow.name, conf, sessions).await?)
        }
        EnvironmentSpec::Kubernetes(conf) => {
            Arc::new(KubernetesRepository::new(&flow.name, conf, sessions).await?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn configuration(dir: &TempDir) -> Configuration {
        let yaml = r#"
flows:
  - name: demo
    authorization:
      type: none
    environment:
      type: dummy
  - name: users
    requirement:
      includedRequestingName: "^user-.*"
    authorization:
      type: simple
      entries:
        - name: user-alice
          password: "plain:secret"
    environment:
      type: dummy
"#;
        let mut configuration: Configuration = serde_yaml::from_str(yaml).unwrap();
        configuration.session.storage = dir.path().join("sessions");
        configuration
    }

    #[tokio::test]
    async fn test_build_services() {
        let dir = TempDir::new().unwrap();
        let services = Services::build(configuration(&dir)).await.unwrap();

        assert_eq!(services.authorizers.len(), 2);
        assert_eq!(services.environments.len(), 2);
        assert!(services.environments.contains(&"demo".parse().unwrap()));
        assert!(services.environments.contains(&"users".parse().unwrap()));
        assert!(dir.path().join("sessions").is_dir());
        services.close().await;
    }

    #[tokio::test]
    async fn test_build_services_invalid_htpasswd() {
        let dir = TempDir::new().unwrap();
        let mut configuration = configuration(&dir);
        configuration.flows[0].authorization = serde_yaml::from_str(
            "type: htpasswd\n",
        )
        .unwrap();
        let err = Services::build(configuration).await.err().unwrap();
        assert!(format!("{err:#}").contains("flow demo"));
    }
}
