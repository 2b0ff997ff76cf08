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
use serde_json::json;

use super::{
    last_remote_of, remote_value, Authorization, Authorizer, Identity, NamedToken, Prompter,
    Request, RestoreOpts,
};
use crate::config::{AuthorizationLocal, FlowName};
use crate::crypto::authorized_keys::is_key_in_files;
use crate::session::Session;
use crate::shared::error::{Error, Result};
use crate::template::{RenderContext, TemplateBool};
use crate::user::{Repository, User};

/// Authorizes users of the host via their authorized_keys files and the shadow database.
pub struct LocalAuthorizer {
    flow: FlowName,
    conf: AuthorizationLocal,
    users: Repository,
}

impl LocalAuthorizer {
    pub fn new(flow: &FlowName, conf: &AuthorizationLocal) -> Self {
        if let Some(service) = &conf.pam_service {
            tracing::debug!(
                flow = %flow,
                service,
                "PAM is not available; passwords are verified against the shadow database"
            );
        }
        Self {
            flow: flow.clone(),
            conf: conf.clone(),
            users: Repository::default(),
        }
    }

    pub fn with_user_repository(mut self, users: Repository) -> Self {
        self.users = users;
        self
    }

    fn request_context(&self, req: &Request<'_>) -> RenderContext {
        RenderContext::empty()
            .with("flow", json!(self.flow.as_str()))
            .with("remote", remote_value(req.remote))
    }

    fn user_context(&self, req: &Request<'_>, user: &User) -> RenderContext {
        self.request_context(req)
            .with("user", serde_json::to_value(user).unwrap_or_default())
    }

    fn render_flag(&self, flag: &TemplateBool, ctx: &RenderContext, what: &str) -> Result<bool> {
        flag.render(ctx)
            .map_err(|e| e.context(format!("cannot evaluate whether {what}")))
    }

    fn candidate(&self, req: &Request<'_>, user: User) -> Authorization {
        Authorization::new(Identity::Local { user }, &self.flow, req.remote)
    }

    fn token_of(user: &User) -> Result<Vec<u8>> {
        let mut token = NamedToken::new(&user.name);
        token.user.uid = Some(user.uid);
        token.encode()
    }

    async fn is_authorized_via_public_key(
        &self,
        req: &Request<'_>,
        user: &User,
        key: &PublicKey,
    ) -> Result<bool> {
        let files = self
            .conf
            .authorized_keys
            .render(&self.user_context(req, user))
            .map_err(|e| e.context("cannot get authorized keys files of user"))?;
        if files.is_empty() {
            tracing::debug!(user = %user, "Local user does not have any authorized keys file");
            return Ok(false);
        }
        let found = is_key_in_files(key, &files).await?;
        if !found {
            tracing::debug!(
                user = %user,
                "Presented public key does not match any authorized key of local user"
            );
        }
        Ok(found)
    }

    async fn authorize_with_password(
        &self,
        req: &Request<'_>,
        password: &str,
        allowed: &TemplateBool,
    ) -> Result<Authorization> {
        let ctx = self.request_context(req);
        if !self.render_flag(allowed, &ctx, "passwords are allowed")? {
            tracing::debug!(flow = %self.flow, "Passwords are disabled for local users");
            return Ok(Authorization::forbidden(req.remote));
        }
        let empty_allowed = self.render_flag(
            &self.conf.password.empty_allowed,
            &ctx,
            "empty passwords are allowed",
        )?;
        if password.is_empty() && !empty_allowed {
            tracing::debug!(flow = %self.flow, "Empty passwords are disabled for local users");
            return Ok(Authorization::forbidden(req.remote));
        }

        let Some(user) = self.users.lookup(req.remote.user()).await? else {
            tracing::debug!(user = req.remote.user(), "Local user not found");
            return Ok(Authorization::forbidden(req.remote));
        };
        if !self.users.verify_password(&user.name, password, empty_allowed).await? {
            return Ok(Authorization::forbidden(req.remote));
        }

        let token = Self::token_of(&user)?;
        let auth = self.candidate(req, user);
        if !req.validate(&auth).await? {
            return Ok(Authorization::forbidden(req.remote));
        }
        let session = req.ensure_session_for(&token).await?;
        Ok(auth.with_session(session))
    }
}

#[async_trait]
impl Authorizer for LocalAuthorizer {
    async fn authorize_public_key(
        &self,
        req: &Request<'_>,
        key: &PublicKey,
    ) -> Result<Authorization> {
        let fail = |e: Error| {
            e.context(format!("cannot authorize local {:?} via authorized keys", req.remote.user()))
        };

        if self.conf.authorized_keys.is_empty() {
            tracing::debug!(flow = %self.flow, "Authorized keys disabled for local users");
            return Ok(Authorization::forbidden(req.remote));
        }
        let Some(user) = self.users.lookup(req.remote.user()).await.map_err(fail)? else {
            tracing::debug!(user = req.remote.user(), "Local user not found");
            return Ok(Authorization::forbidden(req.remote));
        };

        let candidate = self.candidate(req, user.clone());
        if !req.validate(&candidate).await.map_err(fail)? {
            return Ok(Authorization::forbidden(req.remote));
        }

        if let Some(session) = req.find_session_by_public_key(key).await.map_err(fail)? {
            return Ok(candidate.with_session(session).with_sessions_public_key(key));
        }
        if !self.is_authorized_via_public_key(req, &user, key).await.map_err(fail)? {
            return Ok(Authorization::forbidden(req.remote));
        }
        let session = req.ensure_session_for(&Self::token_of(&user)?).await.map_err(fail)?;
        Ok(candidate.with_session(session))
    }

    async fn authorize_password(&self, req: &Request<'_>, password: &str) -> Result<Authorization> {
        self.authorize_with_password(req, password, &self.conf.password.allowed)
            .await
            .map_err(|e| {
                e.context(format!("cannot authorize local {:?} via password", req.remote.user()))
            })
    }

    async fn authorize_interactive(
        &self,
        req: &Request<'_>,
        prompter: &dyn Prompter,
    ) -> Result<Authorization> {
        let ctx = self.request_context(req);
        if !self.render_flag(
            &self.conf.password.interactive_allowed,
            &ctx,
            "interactive passwords are allowed",
        )? {
            return Ok(Authorization::forbidden(req.remote));
        }
        let password = prompter.prompt("Password: ", false).await?;
        self.authorize_with_password(req, &password, &self.conf.password.interactive_allowed)
            .await
            .map_err(|e| {
                e.context(format!("cannot authorize local {:?} via interactive", req.remote.user()))
            })
    }

    async fn restore_from_session(
        &self,
        session: &Session,
        opts: RestoreOpts,
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

        let user = match token.user.uid {
            Some(uid) => self.users.lookup_uid(uid).await?.filter(|u| u.name == token.user.name),
            None => self.users.lookup(&token.user.name).await?,
        };
        let Some(user) = user else {
            if opts.auto_clean_up_allowed {
                session.set_authorization_token(&[]).await.map_err(|e| {
                    e.context("cannot clear authorization token of session after its user vanished")
                })?;
                tracing::info!(
                    session = %session,
                    user = %token.user.name,
                    "Local user does not exist anymore; authorization token removed from session"
                );
            }
            return Ok(None);
        };

        let remote = last_remote_of(session).await?;
        Ok(Some(
            Authorization::new(Identity::Local { user }, &self.flow, &remote)
                .with_env_vars(token.env_vars.unwrap_or_default())
                .with_session(session.clone()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::template::TemplateStrings;
    use tempfile::TempDir;

    struct Host {
        dir: TempDir,
        users: Repository,
    }

    fn host() -> Host {
        let dir = TempDir::new().unwrap();
        let etc = dir.path().join("etc");
        std::fs::create_dir_all(&etc).unwrap();
        let home = dir.path().join("home/alice");
        std::fs::create_dir_all(home.join(".ssh")).unwrap();
        std::fs::write(
            etc.join("passwd"),
            format!(
                "alice:x:1000:1000:Alice:{}:/bin/sh\nnopw:x:1001:1001::/:/bin/sh\n",
                home.display()
            ),
        )
        .unwrap();
        std::fs::write(etc.join("group"), "alice:x:1000:\n").unwrap();
        let hash = pwhash::sha512_crypt::hash("secret").unwrap();
        std::fs::write(
            etc.join("shadow"),
            format!("alice:{hash}:19000::::::\nnopw::19000::::::\n"),
        )
        .unwrap();
        let keys = home.join(".ssh/authorized_keys");
        std::fs::write(&keys, format!("{KEY_A} alice@laptop\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&keys, std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        let users = Repository::new(&etc);
        Host { dir, users }
    }

    fn authorizer(host: &Host, conf: AuthorizationLocal) -> LocalAuthorizer {
        LocalAuthorizer::new(&flow("local"), &conf).with_user_repository(host.users.clone())
    }

    #[tokio::test]
    async fn test_public_key_from_home_authorized_keys() {
        let host = host();
        let (_dir, sessions) = repository().await;
        let authorizer = authorizer(&host, AuthorizationLocal::default());
        let flow = flow("local");
        let alice = remote("alice");
        let validator = StaticValidator(true);
        let req = Request {
            flow: &flow,
            remote: &alice,
            sessions: &sessions,
            validator: &validator,
        };

        let auth = authorizer.authorize_public_key(&req, &key(KEY_A)).await.unwrap();
        assert!(auth.is_authorized());
        match auth.identity() {
            Identity::Local { user } => assert_eq!(user.uid, 1000),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!authorizer.authorize_public_key(&req, &key(KEY_B)).await.unwrap().is_authorized());

        let token = auth.session().unwrap().authorization_token().await.unwrap();
        assert_eq!(token, br#"{"user":{"name":"alice","uid":1000},"envVars":null}"#);
        assert!(host.dir.path().exists());
    }

    #[tokio::test]
    async fn test_password_and_empty_policy() {
        let host = host();
        let (_dir, sessions) = repository().await;
        let mut conf = AuthorizationLocal {
            authorized_keys: TemplateStrings::default(),
            ..Default::default()
        };
        let flow = flow("local");
        let validator = StaticValidator(true);

        let alice = remote("alice");
        let req = Request {
            flow: &flow,
            remote: &alice,
            sessions: &sessions,
            validator: &validator,
        };
        let a = authorizer(&host, conf.clone());
        assert!(a.authorize_password(&req, "secret").await.unwrap().is_authorized());
        assert!(!a.authorize_password(&req, "wrong").await.unwrap().is_authorized());
        assert!(!a.authorize_public_key(&req, &key(KEY_A)).await.unwrap().is_authorized());

        let nopw = remote("nopw");
        let req = Request {
            remote: &nopw,
            ..req
        };
        assert!(!a.authorize_password(&req, "").await.unwrap().is_authorized());
        conf.password.empty_allowed = TemplateBool::of(true);
        let a = authorizer(&host, conf.clone());
        assert!(a.authorize_password(&req, "").await.unwrap().is_authorized());

        conf.password.allowed = TemplateBool::of(false);
        let a = authorizer(&host, conf);
        assert!(!a.authorize_password(&req, "").await.unwrap().is_authorized());
    }

    #[tokio::test]
    async fn test_restore_and_vanished_user() {
        let host = host();
        let (_dir, sessions) = repository().await;
        let authorizer = authorizer(&host, AuthorizationLocal::default());
        let flow = flow("local");
        let alice = remote("alice");
        let validator = StaticValidator(true);
        let req = Request {
            flow: &flow,
            remote: &alice,
            sessions: &sessions,
            validator: &validator,
        };
        let auth = authorizer.authorize_password(&req, "secret").await.unwrap();
        let session = auth.session().unwrap();

        let restored = authorizer
            .restore_from_session(session, RestoreOpts::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored.user_name(), "alice");

        std::fs::write(host.dir.path().join("etc/passwd"), "root:x:0:0::/root:/bin/sh\n").unwrap();
        let opts = RestoreOpts {
            auto_clean_up_allowed: true,
        };
        assert!(authorizer.restore_from_session(session, opts).await.unwrap().is_none());
        assert!(session.authorization_token().await.unwrap().is_empty());
    }
}
