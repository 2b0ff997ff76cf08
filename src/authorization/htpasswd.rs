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

use super::{
    last_remote_of, Authorization, Authorizer, Identity, NamedToken, Prompter, Request, RestoreOpts,
};
use crate::config::{AuthorizationHtpasswd, FlowName};
use crate::crypto::Htpasswd;
use crate::session::Session;
use crate::shared::error::{Error, Result};

/// Verifies passwords against htpasswd tables.
///
/// Public keys are only accepted if a still valid session of the same user
/// already trusts them.
pub struct HtpasswdAuthorizer {
    flow: FlowName,
    conf: AuthorizationHtpasswd,
    inline: Htpasswd,
}

impl HtpasswdAuthorizer {
    pub fn new(flow: &FlowName, conf: &AuthorizationHtpasswd) -> Result<Self> {
        if conf.file.is_none() && conf.entries.trim().is_empty() {
            return Err(Error::config("htpasswd authorization requires file or entries"));
        }
        Ok(Self {
            flow: flow.clone(),
            conf: conf.clone(),
            inline: Htpasswd::parse(&conf.entries),
        })
    }

    async fn matches(&self, user: &str, password: &str) -> Result<bool> {
        if let Some(file) = &self.conf.file {
            // Re-read on every attempt so edits apply without a restart.
            if Htpasswd::load(file).await?.verify(user, password) {
                return Ok(true);
            }
        }
        Ok(self.inline.verify(user, password))
    }

    async fn authorize_with_password(
        &self,
        req: &Request<'_>,
        password: &str,
    ) -> Result<Authorization> {
        let user = req.remote.user();
        if !self.matches(user, password).await? {
            tracing::debug!(flow = %self.flow, user, "htpasswd password rejected");
            return Ok(Authorization::forbidden(req.remote));
        }

        let auth = Authorization::new(
            Identity::Htpasswd {
                name: user.to_string(),
            },
            &self.flow,
            req.remote,
        );
        if !req.validate(&auth).await? {
            return Ok(Authorization::forbidden(req.remote));
        }

        let token = NamedToken::new(user).encode()?;
        let session = req.ensure_session_for(&token).await?;
        Ok(auth.with_session(session))
    }
}

#[async_trait]
impl Authorizer for HtpasswdAuthorizer {
    async fn authorize_public_key(
        &self,
        req: &Request<'_>,
        key: &PublicKey,
    ) -> Result<Authorization> {
        let Some(session) = req.find_session_by_public_key(key).await? else {
            return Ok(Authorization::forbidden(req.remote));
        };

        let auth = Authorization::new(
            Identity::Htpasswd {
                name: req.remote.user().to_string(),
            },
            &self.flow,
            req.remote,
        )
        .with_session(session)
        .with_sessions_public_key(key);
        if !req.validate(&auth).await? {
            return Ok(Authorization::forbidden(req.remote));
        }
        Ok(auth)
    }

    async fn authorize_password(&self, req: &Request<'_>, password: &str) -> Result<Authorization> {
        self.authorize_with_password(req, password)
            .await
            .map_err(|e| {
                e.context(format!("cannot authorize htpasswd {:?} via password", req.remote.user()))
            })
    }

    async fn authorize_interactive(
        &self,
        req: &Request<'_>,
        prompter: &dyn Prompter,
    ) -> Result<Authorization> {
        let password = prompter.prompt("Password: ", false).await?;
        self.authorize_with_password(req, &password)
            .await
            .map_err(|e| {
                e.context(format!(
                    "cannot authorize htpasswd {:?} via interactive",
                    req.remote.user()
                ))
            })
    }

    async fn restore_from_session(
        &self,
        session: &Session,
        _: RestoreOpts,
    ) -> Result<Option<Authorization>> {
        if session.flow() != &self.flow {
            return Ok(None);
        }
        let token = session.authorization_token().await?;
        if token.is_empty() {
            return Ok(None);
        }
        let token =
            NamedToken::decode(&token).map_err(|e| e.context(format!("session {session}")))?;
        let remote = last_remote_of(session).await?;

        Ok(Some(
            Authorization::new(Identity::Htpasswd { name: token.user.name }, &self.flow, &remote)
                .with_env_vars(token.env_vars.unwrap_or_default())
                .with_session(session.clone()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use std::io::Write;

    fn authorizer(file: Option<std::path::PathBuf>, entries: &str) -> HtpasswdAuthorizer {
        HtpasswdAuthorizer::new(
            &flow("ht"),
            &AuthorizationHtpasswd {
                file,
                entries: entries.to_string(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_requires_a_source() {
        assert!(HtpasswdAuthorizer::new(&flow("ht"), &AuthorizationHtpasswd::default()).is_err());
    }

    #[tokio::test]
    async fn test_password_creates_then_reuses_session() {
        let (_dir, sessions) = repository().await;
        let authorizer = authorizer(None, "alice:plainpw\n");
        let flow = flow("ht");
        let alice = remote("alice");
        let validator = StaticValidator(true);
        let req = Request {
            flow: &flow,
            remote: &alice,
            sessions: &sessions,
            validator: &validator,
        };

        let denied = authorizer.authorize_password(&req, "wrong").await.unwrap();
        assert!(!denied.is_authorized());

        let first = authorizer.authorize_password(&req, "plainpw").await.unwrap();
        assert!(first.is_authorized());
        let second = authorizer.authorize_password(&req, "plainpw").await.unwrap();
        assert_eq!(first.session(), second.session());

        let token = first.session().unwrap().authorization_token().await.unwrap();
        assert_eq!(token, br#"{"user":{"name":"alice"},"envVars":null}"#);
    }

    #[tokio::test]
    async fn test_validator_rejection_is_forbidden() {
        let (_dir, sessions) = repository().await;
        let authorizer = authorizer(None, "alice:plainpw\n");
        let flow = flow("ht");
        let alice = remote("alice");
        let validator = StaticValidator(false);
        let req = Request {
            flow: &flow,
            remote: &alice,
            sessions: &sessions,
            validator: &validator,
        };
        let auth = authorizer.authorize_password(&req, "plainpw").await.unwrap();
        assert!(!auth.is_authorized());
    }

    #[tokio::test]
    async fn test_file_and_interactive() {
        let (_dir, sessions) = repository().await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bob:{}", bcrypt::hash("hunter2", 4).unwrap()).unwrap();
        let authorizer = authorizer(Some(file.path().to_path_buf()), "");
        let flow = flow("ht");
        let bob = remote("bob");
        let validator = StaticValidator(true);
        let req = Request {
            flow: &flow,
            remote: &bob,
            sessions: &sessions,
            validator: &validator,
        };

        let prompter = ScriptedPrompter::answering(["hunter2"]);
        let auth = authorizer.authorize_interactive(&req, &prompter).await.unwrap();
        assert!(auth.is_authorized());
        assert_eq!(prompter.prompts.lock().unwrap()[0], ("Password: ".to_string(), false));
    }

    #[tokio::test]
    async fn test_public_key_needs_trusting_session() {
        let (_dir, sessions) = repository().await;
        let authorizer = authorizer(None, "alice:plainpw\n");
        let flow = flow("ht");
        let alice = remote("alice");
        let validator = StaticValidator(true);
        let req = Request {
            flow: &flow,
            remote: &alice,
            sessions: &sessions,
            validator: &validator,
        };
        let key = key(KEY_A);

        assert!(!authorizer.authorize_public_key(&req, &key).await.unwrap().is_authorized());

        let auth = authorizer.authorize_password(&req, "plainpw").await.unwrap();
        auth.session().unwrap().add_public_key(&key).await.unwrap();

        let by_key = authorizer.authorize_public_key(&req, &key).await.unwrap();
        assert!(by_key.is_authorized());
        assert_eq!(by_key.session(), auth.session());

        let restored = authorizer
            .restore_from_session(auth.session().unwrap(), RestoreOpts::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored.user_name(), "alice");
        assert_eq!(restored.remote(), auth.remote());
    }
}
