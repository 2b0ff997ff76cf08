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

use async_trait::async_trait;
use russh::keys::PublicKey;

use super::{last_remote_of, Authorization, Authorizer, Identity, Prompter, Request, RestoreOpts};
use crate::config::FlowName;
use crate::session::Session;
use crate::shared::error::Result;

/// Accepts everybody.
pub struct NoneAuthorizer {
    flow: FlowName,
}

impl NoneAuthorizer {
    pub fn new(flow: &FlowName) -> Self {
        Self { flow: flow.clone() }
    }

    async fn create(&self, req: &Request<'_>) -> Result<Authorization> {
        let session = req
            .sessions
            .create(&self.flow, req.remote, None)
            .await
            .map_err(|e| e.context(format!("cannot authorize none {:?}", req.remote.user())))?;
        Ok(Authorization::new(Identity::None, &self.flow, req.remote).with_session(session))
    }
}

#[async_trait]
impl Authorizer for NoneAuthorizer {
    async fn authorize_public_key(
        &self,
        req: &Request<'_>,
        key: &PublicKey,
    ) -> Result<Authorization> {
        match req.find_session_by_public_key(key).await? {
            Some(session) => Ok(Authorization::new(Identity::None, &self.flow, req.remote)
                .with_session(session)
                .with_sessions_public_key(key)),
            None => self.create(req).await,
        }
    }

    async fn authorize_password(&self, req: &Request<'_>, _: &str) -> Result<Authorization> {
        self.create(req).await
    }

    async fn authorize_interactive(
        &self,
        req: &Request<'_>,
        _: &dyn Prompter,
    ) -> Result<Authorization> {
        self.create(req).await
    }

    async fn restore_from_session(
        &self,
        session: &Session,
        _: RestoreOpts,
    ) -> Result<Option<Authorization>> {
        if session.flow() != &self.flow {
            return Ok(None);
        }
        let remote = last_remote_of(session).await?;
        Ok(Some(
            Authorization::new(Identity::None, &self.flow, &remote).with_session(session.clone()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::session::State;

    #[tokio::test]
    async fn test_public_key_reuses_session_which_trusts_key() {
        let (_dir, sessions) = repository().await;
        let flow = flow("open");
        let authorizer = NoneAuthorizer::new(&flow);
        let remote = remote("alice");
        let validator = StaticValidator(true);
        let req = Request {
            flow: &flow,
            remote: &remote,
            sessions: &sessions,
            validator: &validator,
        };
        let key = key(KEY_A);

        let first = authorizer.authorize_public_key(&req, &key).await.unwrap();
        assert!(first.is_authorized());
        assert!(first.sessions_public_key().is_none());
        let session = first.session().unwrap().clone();
        session.notify_last_access(&remote, Some(State::Authorized)).await.unwrap();
        session.add_public_key(&key).await.unwrap();

        let second = authorizer.authorize_public_key(&req, &key).await.unwrap();
        assert_eq!(second.session(), Some(&session));
        assert!(second.sessions_public_key().is_some());

        // A different requesting name never reuses it.
        let mallory = crate::authorization::testing::remote("mallory");
        let req = Request {
            remote: &mallory,
            ..req
        };
        let third = authorizer.authorize_public_key(&req, &key).await.unwrap();
        assert_ne!(third.session(), Some(&session));
    }

    #[tokio::test]
    async fn test_restore() {
        let (_dir, sessions) = repository().await;
        let flow = flow("open");
        let authorizer = NoneAuthorizer::new(&flow);
        let remote = remote("alice");
        let validator = StaticValidator(true);
        let req = Request {
            flow: &flow,
            remote: &remote,
            sessions: &sessions,
            validator: &validator,
        };

        let auth = authorizer.authorize_password(&req, "").await.unwrap();
        let session = auth.session().unwrap();
        let restored = authorizer
            .restore_from_session(session, RestoreOpts::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored.remote(), auth.remote());
        assert_eq!(restored.flow(), auth.flow());
        assert_eq!(restored.session(), auth.session());

        let foreign = NoneAuthorizer::new(&crate::authorization::testing::flow("other"));
        assert!(foreign
            .restore_from_session(session, RestoreOpts::default())
            .await
            .unwrap()
            .is_none());
    }
}
