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
use crate::config::{AuthorizationSimple, FlowName, SimpleEntry};
use crate::crypto::authorized_keys::{is_key_in_files, parse_authorized_key_line, AuthorizedKey};
use crate::session::Session;
use crate::shared::error::{Error, Result};

struct Entry {
    conf: SimpleEntry,
    keys: Vec<AuthorizedKey>,
}

/// A static table of users configured inline.
pub struct SimpleAuthorizer {
    flow: FlowName,
    entries: Vec<Entry>,
}

impl SimpleAuthorizer {
    pub fn new(flow: &FlowName, conf: &AuthorizationSimple) -> Result<Self> {
        let mut entries = Vec::with_capacity(conf.entries.len());
        for entry in &conf.entries {
            if entry.name.trim().is_empty() {
                return Err(Error::config("simple authorization entry without name"));
            }
            let keys = entry
                .authorized_keys
                .iter()
                .filter(|line| !line.trim().is_empty())
                .map(|line| parse_authorized_key_line(line))
                .collect::<Result<Vec<_>>>()
                .map_err(|e| {
                    e.context(format!("invalid authorized key of simple entry {:?}", entry.name))
                })?;
            entries.push(Entry {
                conf: entry.clone(),
                keys,
            });
        }
        Ok(Self {
            flow: flow.clone(),
            entries,
        })
    }

    fn lookup(&self, name: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.conf.name.eq_ignore_ascii_case(name))
    }

    fn candidate(&self, req: &Request<'_>, entry: &Entry) -> Authorization {
        Authorization::new(
            Identity::Simple {
                name: entry.conf.name.clone(),
            },
            &self.flow,
            req.remote,
        )
    }

    async fn is_key_authorized(&self, entry: &Entry, key: &PublicKey) -> Result<bool> {
        if entry.keys.iter().any(|k| k.matches(key)) {
            return Ok(true);
        }
        match &entry.conf.authorized_keys_file {
            Some(file) => is_key_in_files(key, &[file]).await,
            None => Ok(false),
        }
    }

    async fn authorize_with_password(
        &self,
        req: &Request<'_>,
        password: &str,
    ) -> Result<Authorization> {
        let Some(entry) = self.lookup(req.remote.user()) else {
            return Ok(Authorization::forbidden(req.remote));
        };
        let Some(expected) = &entry.conf.password else {
            tracing::debug!(
                flow = %self.flow,
                user = %entry.conf.name,
                "No password configured for entry"
            );
            return Ok(Authorization::forbidden(req.remote));
        };
        if !expected.verify(password)? {
            return Ok(Authorization::forbidden(req.remote));
        }

        let auth = self.candidate(req, entry);
        if !req.validate(&auth).await? {
            return Ok(Authorization::forbidden(req.remote));
        }

        let token = NamedToken::new(&entry.conf.name).encode()?;
        let session = req.ensure_session_for(&token).await?;
        Ok(auth.with_session(session))
    }
}

#[async_trait]
impl Authorizer for SimpleAuthorizer {
    async fn authorize_public_key(
        &self,
        req: &Request<'_>,
        key: &PublicKey,
    ) -> Result<Authorization> {
        let fail = |e: Error| {
            e.context(format!("cannot authorize simple {:?} via public key", req.remote.user()))
        };

        let Some(entry) = self.lookup(req.remote.user()) else {
            return Ok(Authorization::forbidden(req.remote));
        };
        let auth = self.candidate(req, entry);
        if !req.validate(&auth).await.map_err(fail)? {
            return Ok(Authorization::forbidden(req.remote));
        }

        if let Some(session) = req.find_session_by_public_key(key).await.map_err(fail)? {
            return Ok(auth.with_session(session).with_sessions_public_key(key));
        }

        if !self.is_key_authorized(entry, key).await.map_err(fail)? {
            return Ok(Authorization::forbidden(req.remote));
        }
        let token = NamedToken::new(&entry.conf.name).encode()?;
        let session = req.ensure_session_for(&token).await.map_err(fail)?;
        Ok(auth.with_session(session))
    }

    async fn authorize_password(&self, req: &Request<'_>, password: &str) -> Result<Authorization> {
        self.authorize_with_password(req, password)
            .await
            .map_err(|e| {
                e.context(format!("cannot authorize simple {:?} via password", req.remote.user()))
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
                    "cannot authorize simple {:?} via interactive",
                    req.remote.user()
                ))
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

        let Some(entry) = self.entries.iter().find(|e| e.conf.name == token.user.name) else {
            if opts.auto_clean_up_allowed {
                session.set_authorization_token(&[]).await.map_err(|e| {
                    e.context(
                        "cannot clear authorization token of session after its entry vanished",
                    )
                })?;
                tracing::info!(
                    session = %session,
                    user = %token.user.name,
                    "Simple entry does not exist anymore; authorization token removed from session"
                );
            }
            return Ok(None);
        };

        let remote = last_remote_of(session).await?;
        Ok(Some(
            Authorization::new(
                Identity::Simple {
                    name: entry.conf.name.clone(),
                },
                &self.flow,
                &remote,
            )
            .with_env_vars(token.env_vars.unwrap_or_default())
            .with_session(session.clone()),
        ))
    }
}
