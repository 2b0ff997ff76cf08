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

use std::sync::Arc;

use async_trait::async_trait;

use super::{CleanupOpts, Environment, FindOpts, PtyConfig, Repository};
use crate::authorization::{Authorization, Validator};
use crate::config::FlowName;
use crate::session::Session;
use crate::shared::error::{Error, Result};

/// Routes every call to the repository of the flow it concerns.
#[derive(Default)]
pub struct EnvironmentFacade {
    entries: Vec<(FlowName, Arc<dyn Repository>)>,
}

impl EnvironmentFacade {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, flow: FlowName, repository: Arc<dyn Repository>) {
        self.entries.push((flow, repository));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, flow: &FlowName) -> bool {
        self.entries.iter().any(|(f, _)| f == flow)
    }

    fn repository(&self, flow: &FlowName) -> Result<&Arc<dyn Repository>> {
        self.entries
            .iter()
            .find(|(f, _)| f == flow)
            .map(|(_, r)| r)
            .ok_or_else(|| Error::not_found(format!("flow {flow} does not exist")))
    }

    fn repository_of(&self, authorization: &Authorization) -> Result<&Arc<dyn Repository>> {
        let flow = authorization
            .flow()
            .ok_or_else(|| Error::system("authorization without flow"))?;
        self.repository(flow)
    }

    pub async fn will_be_accepted(&self, authorization: &Authorization) -> Result<bool> {
        self.repository_of(authorization)?
            .will_be_accepted(authorization)
            .await
    }

    pub fn does_support_pty(&self, authorization: &Authorization, pty: &PtyConfig) -> Result<bool> {
        Ok(self.repository_of(authorization)?.does_support_pty(pty))
    }

    pub async fn ensure(&self, authorization: &Authorization) -> Result<Arc<dyn Environment>> {
        self.repository_of(authorization)?.ensure(authorization).await
    }

    pub async fn find_by_session(
        &self,
        session: &Session,
        opts: FindOpts,
    ) -> Result<Arc<dyn Environment>> {
        self.repository(session.flow())?
            .find_by_session(session, opts)
            .await
    }

    /// Runs the cleanup of every flow; failures of one flow do not stop the others.
    pub async fn cleanup(&self, opts: &CleanupOpts<'_>) -> Result<()> {
        let mut first_error = None;
        for (flow, repository) in &self.entries {
            if let Err(e) = repository.cleanup(opts).await {
                tracing::warn!(flow = %flow, error = %e, "Cannot clean up environments of flow");
                first_error.get_or_insert(e.context(format!("[{flow}]")));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn close(&self) -> Result<()> {
        for (flow, repository) in &self.entries {
            if let Err(e) = repository.close().await {
                tracing::warn!(flow = %flow, error = %e, "Cannot close environment repository");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Validator for EnvironmentFacade {
    async fn will_be_accepted(&self, authorization: &Authorization) -> Result<bool> {
        EnvironmentFacade::will_be_accepted(self, authorization).await
    }
}
