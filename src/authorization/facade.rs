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

use russh::keys::PublicKey;

use super::{Authorization, Authorizer, Prompter, Request, RestoreOpts, Validator};
use crate::config::{FlowName, Requirement};
use crate::session::{FsRepository, Session};
use crate::shared::error::Result;
use crate::shared::net::Remote;

/// Everything an attempt needs besides the flow.
pub struct RequestContext<'a> {
    pub remote: &'a Remote,
    pub sessions: &'a FsRepository,
    pub validator: &'a dyn Validator,
}

struct Entry {
    flow: FlowName,
    requirement: Requirement,
    authorizer: Box<dyn Authorizer>,
}

/// Tries the authorizers of all flows accepting the requested name, in order.
#[derive(Default)]
pub struct AuthorizerFacade {
    entries: Vec<Entry>,
}

impl AuthorizerFacade {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        flow: FlowName,
        requirement: Requirement,
        authorizer: Box<dyn Authorizer>,
    ) {
        self.entries.push(Entry {
            flow,
            requirement,
            authorizer,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn candidates<'a>(
        &'a self,
        ctx: &'a RequestContext<'a>,
    ) -> impl Iterator<Item = (&'a Entry, Request<'a>)> {
        self.entries
            .iter()
            .filter(|entry| entry.requirement.accepts(ctx.remote.user()))
            .map(move |entry| {
                (
                    entry,
                    Request {
                        flow: &entry.flow,
                        remote: ctx.remote,
                        sessions: ctx.sessions,
                        validator: ctx.validator,
                    },
                )
            })
    }

    pub async fn authorize_public_key(
        &self,
        ctx: &RequestContext<'_>,
        key: &PublicKey,
    ) -> Result<Authorization> {
        for (entry, req) in self.candidates(ctx) {
            let auth = entry
                .authorizer
                .authorize_public_key(&req, key)
                .await
                .map_err(|e| e.context(format!("[{}]", entry.flow)))?;
            if auth.is_authorized() {
                return Ok(auth);
            }
            tracing::trace!(
                flow = %entry.flow,
                remote = %ctx.remote,
                "Public key not authorized by flow"
            );
        }
        Ok(Authorization::forbidden(ctx.remote))
    }

    pub async fn authorize_password(
        &self,
        ctx: &RequestContext<'_>,
        password: &str,
    ) -> Result<Authorization> {
        for (entry, req) in self.candidates(ctx) {
            let auth = entry
                .authorizer
                .authorize_password(&req, password)
                .await
                .map_err(|e| e.context(format!("[{}]", entry.flow)))?;
            if auth.is_authorized() {
                return Ok(auth);
            }
            tracing::trace!(
                flow = %entry.flow,
                remote = %ctx.remote,
                "Password not authorized by flow"
            );
        }
        Ok(Authorization::forbidden(ctx.remote))
    }

    pub async fn authorize_interactive(
        &self,
        ctx: &RequestContext<'_>,
        prompter: &dyn Prompter,
    ) -> Result<Authorization> {
        for (entry, req) in self.candidates(ctx) {
            let auth = entry
                .authorizer
                .authorize_interactive(&req, prompter)
                .await
                .map_err(|e| e.context(format!("[{}]", entry.flow)))?;
            if auth.is_authorized() {
                return Ok(auth);
            }
            tracing::trace!(
                flow = %entry.flow,
                remote = %ctx.remote,
                "Interactive not authorized by flow"
            );
        }
        Ok(Authorization::forbidden(ctx.remote))
    }

    /// Restore with the authorizer of the session's flow.
    ///
    /// `Ok(None)` if the flow is unknown or the session holds no authorization.
    pub async fn restore_from_session(
        &self,
        session: &Session,
        opts: RestoreOpts,
    ) -> Result<Option<Authorization>> {
        let Some(entry) = self.entries.iter().find(|e| &e.flow == session.flow()) else {
            return Ok(None);
        };
        entry
            .authorizer
            .restore_from_session(session, opts)
            .await
            .map_err(|e| e.context(format!("[{}]", entry.flow)))
    }

    /// Close every authorizer; the first failure is returned after all were closed.
    pub async fn close(&self) -> Result<()> {
        let mut first = None;
        for entry in &self.entries {
            if let Err(e) = entry.authorizer.close().await {
                tracing::warn!(flow = %entry.flow, error = %e, "Cannot close authorizer");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{HtpasswdAuthorizer, Identity, NoneAuthorizer};
    use super::*;
    use crate::config::{AuthorizationHtpasswd, Pattern};
    use crate::shared::error::{Error, ErrorKind};
    use async_trait::async_trait;

    struct Failing;

    #[async_trait]
    impl Authorizer for Failing {
        async fn authorize_public_key(
            &self,
            _: &Request<'_>,
            _: &PublicKey,
        ) -> Result<Authorization> {
            Err(Error::network("idp unreachable"))
        }
        async fn authorize_password(&self, _: &Request<'_>, _: &str) -> Result<Authorization> {
            Err(Error::network("idp unreachable"))
        }
        async fn authorize_interactive(
            &self,
            _: &Request<'_>,
            _: &dyn Prompter,
        ) -> Result<Authorization> {
            Err(Error::network("idp unreachable"))
        }
        async fn restore_from_session(
            &self,
            _: &Session,
            _: RestoreOpts,
        ) -> Result<Option<Authorization>> {
            Ok(None)
        }
    }

    fn admin_only() -> Requirement {
        Requirement {
            included_requesting_name: Some(Pattern::new("^admin-.*").unwrap()),
            excluded_requesting_name: None,
        }
    }

    fn htpasswd(entries: &str) -> Box<dyn Authorizer> {
        Box::new(
            HtpasswdAuthorizer::new(
                &flow("a"),
                &AuthorizationHtpasswd {
                    file: None,
                    entries: entries.to_string(),
                },
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_falls_through_to_next_flow() {
        let (_dir, sessions) = repository().await;
        let mut facade = AuthorizerFacade::new();
        facade.push(flow("a"), admin_only(), htpasswd("admin-root:plain\n"));
        facade.push(flow("b"), Requirement::default(), Box::new(NoneAuthorizer::new(&flow("b"))));

        let remote = remote("admin-root");
        let validator = StaticValidator(true);
        let ctx = RequestContext {
            remote: &remote,
            sessions: &sessions,
            validator: &validator,
        };

        let auth = facade.authorize_password(&ctx, "wrong").await.unwrap();
        assert!(auth.is_authorized());
        assert_eq!(auth.flow().map(FlowName::as_str), Some("b"));
        assert!(matches!(auth.identity(), Identity::None));
    }

    #[tokio::test]
    async fn test_requirement_skips_flow() {
        let (_dir, sessions) = repository().await;
        let mut facade = AuthorizerFacade::new();
        facade.push(flow("a"), admin_only(), htpasswd("root:plain\n"));

        let remote = remote("root");
        let validator = StaticValidator(true);
        let ctx = RequestContext {
            remote: &remote,
            sessions: &sessions,
            validator: &validator,
        };

        let auth = facade.authorize_password(&ctx, "plain").await.unwrap();
        assert!(!auth.is_authorized());
    }

    #[tokio::test]
    async fn test_error_short_circuits_with_flow_prefix() {
        let (_dir, sessions) = repository().await;
        let mut facade = AuthorizerFacade::new();
        facade.push(flow("a"), Requirement::default(), Box::new(Failing));
        facade.push(flow("b"), Requirement::default(), Box::new(NoneAuthorizer::new(&flow("b"))));

        let remote = remote("alice");
        let validator = StaticValidator(true);
        let ctx = RequestContext {
            remote: &remote,
            sessions: &sessions,
            validator: &validator,
        };

        let err = facade.authorize_password(&ctx, "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.to_string().starts_with("[a]"));
    }

    #[tokio::test]
    async fn test_restore_routes_by_flow() {
        let (_dir, sessions) = repository().await;
        let mut facade = AuthorizerFacade::new();
        facade.push(flow("b"), Requirement::default(), Box::new(NoneAuthorizer::new(&flow("b"))));

        let session = sessions.create(&flow("b"), &remote("alice"), None).await.unwrap();
        let restored = facade
            .restore_from_session(&session, RestoreOpts::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored.remote().user(), "alice");

        let unknown = sessions.create(&flow("zzz"), &remote("alice"), None).await.unwrap();
        assert!(facade
            .restore_from_session(&unknown, RestoreOpts::default())
            .await
            .unwrap()
            .is_none());
    }
}
