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

//! Authorization of connecting clients.
//!
//! An [`Authorizer`] turns a public key, a password or a keyboard-interactive
//! conversation into an [`Authorization`]. Successful authorizations are
//! always bound to a [`Session`] which carries an authorizer specific token,
//! so that later connections (and the housekeeper) can restore them with
//! [`Authorizer::restore_from_session`].
//!
//! [`AuthorizerFacade`] holds one authorizer per configured flow and tries
//! them in order.

mod facade;
mod htpasswd;
mod local;
mod none;
mod oidc;
mod simple;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use russh::keys::PublicKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub use facade::{AuthorizerFacade, RequestContext};
pub use htpasswd::HtpasswdAuthorizer;
pub use local::LocalAuthorizer;
pub use none::NoneAuthorizer;
pub use oidc::{OidcAuthorizer, OidcIdentity, OidcToken};
pub use simple::SimpleAuthorizer;

use crate::config::FlowName;
use crate::session::{
    is_flow, is_remote_name, is_still_valid, FindOpts, FsRepository, Predicates, Session,
};
use crate::shared::error::{Error, ErrorKind, Result};
use crate::shared::net::Remote;
use crate::template::RenderContext;
use crate::user::User;

/// Environment variables an authorization contributes to the user's environment.
pub type EnvVars = BTreeMap<String, String>;

/// Who the client turned out to be.
#[derive(Debug, Clone)]
pub enum Identity {
    Forbidden,
    None,
    Htpasswd { name: String },
    Simple { name: String },
    Local { user: User },
    Oidc(Box<OidcIdentity>),
}

impl Identity {
    pub fn type_name(&self) -> &'static str {
        match self {
            Identity::Forbidden => "forbidden",
            Identity::None => "none",
            Identity::Htpasswd { .. } => "htpasswd",
            Identity::Simple { .. } => "simple",
            Identity::Local { .. } => "local",
            Identity::Oidc(_) => "oidc",
        }
    }
}

/// Outcome of an authorization attempt.
#[derive(Debug, Clone)]
pub struct Authorization {
    remote: Remote,
    flow: Option<FlowName>,
    env_vars: EnvVars,
    session: Option<Session>,
    sessions_public_key: Option<PublicKey>,
    identity: Identity,
}

impl Authorization {
    /// The client is not authorized; carries no flow and no session.
    pub fn forbidden(remote: &Remote) -> Self {
        Self {
            remote: remote.clone(),
            flow: None,
            env_vars: EnvVars::new(),
            session: None,
            sessions_public_key: None,
            identity: Identity::Forbidden,
        }
    }

    pub(crate) fn new(identity: Identity, flow: &FlowName, remote: &Remote) -> Self {
        Self {
            remote: remote.clone(),
            flow: Some(flow.clone()),
            env_vars: EnvVars::new(),
            session: None,
            sessions_public_key: None,
            identity,
        }
    }

    pub(crate) fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub(crate) fn with_sessions_public_key(mut self, key: &PublicKey) -> Self {
        self.sessions_public_key = Some(key.clone());
        self
    }

    pub(crate) fn with_env_vars(mut self, env_vars: EnvVars) -> Self {
        self.env_vars = env_vars;
        self
    }

    pub fn is_authorized(&self) -> bool {
        !matches!(self.identity, Identity::Forbidden)
    }

    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    pub fn flow(&self) -> Option<&FlowName> {
        self.flow.as_ref()
    }

    pub fn env_vars(&self) -> &EnvVars {
        &self.env_vars
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// The key which was used to find the session, if any.
    pub fn sessions_public_key(&self) -> Option<&PublicKey> {
        self.sessions_public_key.as_ref()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Name of the authorized principal; falls back to the requested name.
    pub fn user_name(&self) -> &str {
        match &self.identity {
            Identity::Htpasswd { name } | Identity::Simple { name } => name,
            Identity::Local { user } => &user.name,
            Identity::Oidc(oidc) => oidc.name().unwrap_or(self.remote.user()),
            Identity::Forbidden | Identity::None => self.remote.user(),
        }
    }

    /// Value tree exposed to templates as `.authorization`.
    pub fn to_value(&self) -> Value {
        let mut user = match &self.identity {
            Identity::Local { user } => serde_json::to_value(user).unwrap_or(Value::Null),
            _ => json!({}),
        };
        if let Value::Object(map) = &mut user {
            map.entry("name")
                .or_insert_with(|| Value::String(self.user_name().to_string()));
        }

        let mut value = json!({
            "type": self.identity.type_name(),
            "authorized": self.is_authorized(),
            "flow": self.flow.as_ref().map(FlowName::as_str),
            "remote": remote_value(&self.remote),
            "envVars": self.env_vars,
            "user": user,
            "session": self.session.as_ref().map(|s| json!({"id": s.id().to_string()})),
        });
        if let (Identity::Oidc(oidc), Value::Object(map)) = (&self.identity, &mut value) {
            map.insert("token".into(), oidc.token_value());
            map.insert("idToken".into(), oidc.id_token.clone().unwrap_or(Value::Null));
            map.insert("userInfo".into(), oidc.user_info.clone().unwrap_or(Value::Null));
        }
        value
    }

    /// Context environments render their templates against.
    pub fn render_context(&self) -> RenderContext {
        let mut ctx = RenderContext::empty()
            .with("authorization", self.to_value())
            .with("remote", remote_value(&self.remote));
        if let Some(session) = &self.session {
            ctx = ctx.with(
                "session",
                json!({"id": session.id().to_string(), "flow": session.flow().as_str()}),
            );
        }
        if let Identity::Local { user } = &self.identity {
            ctx = ctx.with("user", serde_json::to_value(user).unwrap_or(Value::Null));
        }
        ctx
    }

    /// Remove this authorization from its session.
    ///
    /// Returns `false` if there was no session to remove it from.
    pub async fn dispose(&self) -> Result<bool> {
        let Some(session) = &self.session else {
            return Ok(false);
        };
        if !self.is_authorized() {
            return Ok(false);
        }
        session
            .set_authorization_token(&[])
            .await
            .map_err(|e| e.context(format!("cannot dispose authorization of session {session}")))?;
        Ok(true)
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.flow, &self.session) {
            (_, Some(session)) => write!(f, "{}({})", self.identity.type_name(), session),
            (Some(flow), None) => write!(f, "{}({flow})", self.identity.type_name()),
            (None, None) => write!(f, "{}", self.identity.type_name()),
        }
    }
}

pub(crate) fn remote_value(remote: &Remote) -> Value {
    json!({
        "user": remote.user(),
        "host": remote.host().to_string(),
        "ip": remote.ip().to_string(),
    })
}

/// Decides whether an authorization would be accepted by the flow's environment.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn will_be_accepted(&self, authorization: &Authorization) -> Result<bool>;
}

/// Interaction with the client during keyboard-interactive authentication.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Ask the client a question; `echo` controls whether the answer is shown while typing.
    async fn prompt(&self, message: &str, echo: bool) -> Result<String>;

    async fn send_info(&self, message: &str) -> Result<()>;

    async fn send_error(&self, message: &str) -> Result<()>;
}

/// One authorization attempt against one flow.
pub struct Request<'a> {
    pub flow: &'a FlowName,
    pub remote: &'a Remote,
    pub sessions: &'a FsRepository,
    pub validator: &'a dyn Validator,
}

impl Request<'_> {
    pub async fn validate(&self, authorization: &Authorization) -> Result<bool> {
        self.validator
            .will_be_accepted(authorization)
            .await
            .map_err(|e| e.context("cannot validate request"))
    }

    /// Predicates a reusable session of this request has to fulfill.
    pub fn session_predicates(&self) -> Predicates {
        Predicates::new()
            .and(is_flow(self.flow))
            .and(is_still_valid())
            .and(is_remote_name(self.remote.user()))
    }

    /// Latest still valid session of this flow and remote user trusting `key`.
    pub async fn find_session_by_public_key(&self, key: &PublicKey) -> Result<Option<Session>> {
        self.sessions
            .find_by_public_key(key, &self.session_predicates(), FindOpts::default())
            .await
            .map_err(|e| e.context("cannot find session"))
    }

    /// Reuse the latest session carrying `token` or create a new one.
    pub async fn ensure_session_for(&self, token: &[u8]) -> Result<Session> {
        let predicates = self.session_predicates();
        if let Some(session) = self
            .sessions
            .find_by_access_token(token, &predicates, FindOpts::default())
            .await
            .map_err(|e| e.context("cannot find session"))?
        {
            return Ok(session);
        }
        self.sessions
            .create(self.flow, self.remote, Some(token))
            .await
            .map_err(|e| e.context("cannot create session"))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOpts {
    /// Tokens which cannot be restored anymore are removed from their session.
    pub auto_clean_up_allowed: bool,
}

/// Backend of one flow.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize_public_key(
        &self,
        req: &Request<'_>,
        key: &PublicKey,
    ) -> Result<Authorization>;

    async fn authorize_password(&self, req: &Request<'_>, password: &str) -> Result<Authorization>;

    async fn authorize_interactive(
        &self,
        req: &Request<'_>,
        prompter: &dyn Prompter,
    ) -> Result<Authorization>;

    /// Rebuild the authorization stored in `session`.
    ///
    /// `Ok(None)` means the session holds no authorization of this authorizer.
    async fn restore_from_session(
        &self,
        session: &Session,
        opts: RestoreOpts,
    ) -> Result<Option<Authorization>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Token stored by authorizers which only need a user name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NamedToken {
    pub user: NamedTokenUser,
    #[serde(default)]
    pub env_vars: Option<EnvVars>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct NamedTokenUser {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
}

impl NamedToken {
    pub fn new(name: &str) -> Self {
        Self {
            user: NamedTokenUser {
                name: name.to_string(),
                uid: None,
            },
            env_vars: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot marshal authorization token", e))
    }

    pub fn decode(token: &[u8]) -> Result<Self> {
        serde_json::from_slice(token)
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot decode authorization token", e))
    }
}

/// Remote of the latest access to `session`.
pub(crate) async fn last_remote_of(session: &Session) -> Result<Remote> {
    let info = session
        .info()
        .await
        .map_err(|e| e.context(format!("cannot retrieve info of session {session}")))?;
    Ok(info.last_accessed.remote)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_forbidden_is_not_authorized() {
        let auth = Authorization::forbidden(&remote("alice"));
        assert!(!auth.is_authorized());
        assert!(auth.flow().is_none());
        assert_eq!(auth.user_name(), "alice");
        assert_eq!(auth.to_string(), "forbidden");
    }

    #[tokio::test]
    async fn test_render_context_exposes_session_and_user() {
        let (_dir, sessions) = repository().await;
        let flow = flow("f1");
        let session = sessions.create(&flow, &remote("bob"), None).await.unwrap();
        let identity = Identity::Simple { name: "bob".into() };
        let auth =
            Authorization::new(identity, &flow, &remote("bob")).with_session(session.clone());

        let value = auth.to_value();
        assert_eq!(value["type"], "simple");
        assert_eq!(value["flow"], "f1");
        assert_eq!(value["user"]["name"], "bob");
        assert_eq!(value["remote"]["host"], "10.0.0.5:40000");
        assert_eq!(value["session"]["id"], session.id().to_string());

        let tmpl =
            crate::template::TemplateString::new("{{.authorization.user.name}}-{{.session.id}}")
                .unwrap();
        let rendered = tmpl.render(&auth.render_context()).unwrap();
        assert_eq!(rendered, format!("bob-{}", session.id()));
    }

    #[tokio::test]
    async fn test_dispose_clears_token() {
        let (_dir, sessions) = repository().await;
        let flow = flow("f1");
        let session = sessions.create(&flow, &remote("bob"), Some(b"token")).await.unwrap();
        let auth =
            Authorization::new(Identity::None, &flow, &remote("bob")).with_session(session.clone());

        assert!(auth.dispose().await.unwrap());
        assert!(session.authorization_token().await.unwrap().is_empty());

        let without = Authorization::new(Identity::None, &flow, &remote("bob"));
        assert!(!without.dispose().await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_session_for_reuses_token() {
        let (_dir, sessions) = repository().await;
        let flow = flow("f1");
        let remote = remote("bob");
        let validator = StaticValidator(true);
        let req = Request {
            flow: &flow,
            remote: &remote,
            sessions: &sessions,
            validator: &validator,
        };

        let token = NamedToken::new("bob").encode().unwrap();
        let first = req.ensure_session_for(&token).await.unwrap();
        let second = req.ensure_session_for(&token).await.unwrap();
        assert_eq!(first, second);

        let other = NamedToken::new("alice").encode().unwrap();
        let third = req.ensure_session_for(&other).await.unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn test_named_token_format() {
        let token = NamedToken::new("bob").encode().unwrap();
        assert_eq!(token, br#"{"user":{"name":"bob"},"envVars":null}"#);
        assert_eq!(NamedToken::decode(&token).unwrap(), NamedToken::new("bob"));
    }
}
