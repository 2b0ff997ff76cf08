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

//! OpenID Connect device authorization grant (RFC 8628).
//!
//! The client is shown a verification URL through the keyboard-interactive
//! conversation while the server polls the token endpoint.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use russh::keys::PublicKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{OnceCell, RwLock};

use super::{Authorization, Authorizer, Identity, Prompter, Request, RestoreOpts};
use crate::config::{AuthorizationOidcDevice, FlowName};
use crate::session::Session;
use crate::shared::error::{Error, ErrorKind, Result};
use crate::template::RenderContext;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_POLL_INTERVAL: StdDuration = StdDuration::from_secs(5);
const SLOW_DOWN_INCREMENT: StdDuration = StdDuration::from_secs(5);

/// Tokens as issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl OidcToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| now >= expiry)
    }
}

/// Identity established via OIDC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcIdentity {
    pub token: OidcToken,
    /// Verified claims of the id token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
}

impl OidcIdentity {
    /// Best human readable name of the principal.
    pub fn name(&self) -> Option<&str> {
        [&self.id_token, &self.user_info]
            .into_iter()
            .flatten()
            .flat_map(|claims| ["preferred_username", "email", "sub"].map(|c| claims.get(c)))
            .flatten()
            .find_map(Value::as_str)
    }

    /// Token fields exposed to templates; the secrets are not part of it.
    pub(crate) fn token_value(&self) -> Value {
        json!({
            "tokenType": self.token.token_type,
            "expiry": self.token.expiry,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Discovery {
    issuer: String,
    device_authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    userinfo_endpoint: Option<String>,
    #[serde(default)]
    jwks_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceAuthorization {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_url")]
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    id_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self, now: DateTime<Utc>) -> (OidcToken, Option<String>) {
        let token = OidcToken {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token: self.refresh_token,
            expiry: self
                .expires_in
                .filter(|s| *s > 0)
                .map(|s| now + chrono::Duration::seconds(s)),
        };
        (token, self.id_token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

enum Poll {
    Done(TokenResponse),
    Pending,
    SlowDown,
}

/// Authorizes users at an OpenID Connect identity provider.
pub struct OidcAuthorizer {
    flow: FlowName,
    issuer: String,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    retrieve_id_token: bool,
    retrieve_user_info: bool,
    timeout: StdDuration,
    poll_floor: StdDuration,
    http: reqwest::Client,
    discovery: OnceCell<Discovery>,
    jwks: RwLock<Option<JwkSet>>,
}

impl OidcAuthorizer {
    pub fn new(flow: &FlowName, conf: &AuthorizationOidcDevice) -> Result<Self> {
        let ctx = RenderContext::empty();
        let render = |name: &str, value: &crate::template::TemplateString| {
            value
                .render(&ctx)
                .map_err(|e| e.context(format!("cannot render {name}")))
        };
        let issuer = render("issuer", &conf.issuer)?;
        let client_id = render("clientId", &conf.client_id)?;
        if issuer.is_empty() || client_id.is_empty() {
            return Err(Error::config("oidc authorization requires issuer and clientId"));
        }
        let scopes = conf
            .scopes
            .render(&ctx)
            .map_err(|e| e.context("cannot render scopes"))?
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let http = reqwest::Client::builder()
            .user_agent("Engity-Bifroest")
            .timeout(StdDuration::from_secs(30))
            .build()
            .map_err(|e| Error::wrap(ErrorKind::Config, "cannot create http client", e))?;

        Ok(Self {
            flow: flow.clone(),
            issuer: issuer.trim_end_matches('/').to_string(),
            client_id,
            client_secret: render("clientSecret", &conf.client_secret)?,
            scopes,
            retrieve_id_token: conf.retrieve_id_token,
            retrieve_user_info: conf.retrieve_user_info,
            timeout: conf.timeout.get(),
            poll_floor: StdDuration::from_secs(1),
            http,
            discovery: OnceCell::new(),
            jwks: RwLock::new(None),
        })
    }

    #[cfg(test)]
    fn with_poll_floor(mut self, floor: StdDuration) -> Self {
        self.poll_floor = floor;
        self
    }

    async fn discovery(&self) -> Result<&Discovery> {
        self.discovery
            .get_or_try_init(|| async {
                let url = format!("{}/.well-known/openid-configuration", self.issuer);
                let discovery: Discovery = self.get_json(&url, None).await?;
                tracing::debug!(
                    flow = %self.flow,
                    issuer = %discovery.issuer,
                    "OIDC provider discovered"
                );
                Ok(discovery)
            })
            .await
            .map_err(|e: Error| e.context(format!("cannot evaluate OIDC issuer {:?}", self.issuer)))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<T> {
        let mut request = self.http.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Network, format!("cannot get {url}"), e))?;
        if !response.status().is_success() {
            return Err(Error::network(format!("{url} responded with {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| {
                Error::wrap(ErrorKind::Network, format!("cannot decode response of {url}"), e)
            })
    }

    fn client_form<'a>(&'a self, mut form: Vec<(&'a str, &'a str)>) -> Vec<(&'a str, &'a str)> {
        form.push(("client_id", &self.client_id));
        if !self.client_secret.is_empty() {
            form.push(("client_secret", &self.client_secret));
        }
        form
    }

    async fn start_device_authorization(&self) -> Result<DeviceAuthorization> {
        let discovery = self.discovery().await?;
        let scope = self.scopes.join(" ");
        let form = self.client_form(vec![("scope", scope.as_str())]);
        let response = self
            .http
            .post(&discovery.device_authorization_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                Error::wrap(ErrorKind::Network, "cannot initiate device authorization", e)
            })?;
        if !response.status().is_success() {
            return Err(Error::network(format!(
                "device authorization endpoint responded with {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Network, "cannot decode device authorization", e))
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<Poll> {
        let discovery = self.discovery().await?;
        let response = self
            .http
            .post(&discovery.token_endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Network, "cannot request token", e))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::wrap(ErrorKind::Network, "cannot read token response", e))?;

        if status.is_success() {
            let token = serde_json::from_slice(&body)
                .map_err(|e| Error::wrap(ErrorKind::Network, "cannot decode token response", e))?;
            return Ok(Poll::Done(token));
        }

        let Ok(err) = serde_json::from_slice::<TokenError>(&body) else {
            return Err(Error::network(format!("token endpoint responded with {status}")));
        };
        match err.error.as_str() {
            "authorization_pending" => Ok(Poll::Pending),
            "slow_down" => Ok(Poll::SlowDown),
            "expired_token" => Err(Error::user("authorize of device timed out").user_facing()),
            "access_denied" => Err(Error::user("authorize canceled by user").user_facing()),
            "invalid_grant" => Err(Error::expired(format!(
                "token was rejected: {}",
                err.error_description.unwrap_or(err.error)
            ))),
            other => Err(Error::network(format!(
                "token endpoint responded with {status}: {other}{}",
                err.error_description.map(|d| format!(" ({d})")).unwrap_or_default()
            ))),
        }
    }

    async fn poll_token(&self, device: &DeviceAuthorization) -> Result<TokenResponse> {
        let mut interval = device
            .interval
            .map(StdDuration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
            .max(self.poll_floor);
        let mut budget = self.timeout;
        if let Some(expires_in) = device.expires_in.filter(|e| *e > 0) {
            budget = budget.min(StdDuration::from_secs(expires_in));
        }
        let deadline = tokio::time::Instant::now() + budget;
        let form = self.client_form(vec![
            ("grant_type", DEVICE_CODE_GRANT),
            ("device_code", device.device_code.as_str()),
        ]);

        loop {
            match self.request_token(&form).await? {
                Poll::Done(token) => return Ok(token),
                Poll::Pending => {}
                Poll::SlowDown => interval += SLOW_DOWN_INCREMENT,
            }
            if tokio::time::Instant::now() + interval >= deadline {
                return Err(Error::user("authorize of device timed out").user_facing());
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn jwks(&self, refresh: bool) -> Result<JwkSet> {
        if !refresh {
            if let Some(set) = self.jwks.read().await.as_ref() {
                return Ok(set.clone());
            }
        }
        let discovery = self.discovery().await?;
        let uri = discovery
            .jwks_uri
            .as_deref()
            .ok_or_else(|| Error::config("OIDC provider does not publish a jwks_uri"))?;
        let set: JwkSet = self.get_json(uri, None).await?;
        *self.jwks.write().await = Some(set.clone());
        Ok(set)
    }

    /// Verify signature, issuer, audience and expiry of `raw`; returns its claims.
    async fn verify_id_token(&self, raw: &str) -> Result<Value> {
        let header = decode_header(raw)
            .map_err(|e| Error::wrap(ErrorKind::Permission, "cannot decode id token", e))?;
        let discovery = self.discovery().await?;

        let mut set = self.jwks(false).await?;
        let mut jwk = find_jwk(&set, header.kid.as_deref()).cloned();
        if jwk.is_none() {
            // Keys may have been rotated since they were cached.
            set = self.jwks(true).await?;
            jwk = find_jwk(&set, header.kid.as_deref()).cloned();
        }
        let jwk = jwk.ok_or_else(|| Error::permission("id token was signed by an unknown key"))?;
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| {
                Error::wrap(ErrorKind::Permission, "cannot use signing key of id token", e)
            })?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.client_id]);
        validation.set_issuer(&[&discovery.issuer]);
        let data = decode::<Value>(raw, &key, &validation)
            .map_err(|e| Error::wrap(ErrorKind::Permission, "cannot verify id token", e))?;
        Ok(data.claims)
    }

    async fn user_info(&self, token: &OidcToken) -> Result<Value> {
        let discovery = self.discovery().await?;
        let uri = discovery
            .userinfo_endpoint
            .as_deref()
            .ok_or_else(|| Error::config("OIDC provider does not publish a userinfo_endpoint"))?;
        self.get_json(uri, Some(&token.access_token))
            .await
            .map_err(|e| e.context("cannot retrieve user info"))
    }

    async fn finalize(
        &self,
        token: OidcToken,
        raw_id_token: Option<String>,
    ) -> Result<OidcIdentity> {
        let id_token = match (self.retrieve_id_token, raw_id_token) {
            (true, Some(raw)) => Some(self.verify_id_token(&raw).await?),
            (true, None) => {
                return Err(Error::permission(
                    "identity provider did not return an id token",
                ))
            }
            (false, _) => None,
        };
        let user_info = if self.retrieve_user_info {
            Some(self.user_info(&token).await?)
        } else {
            None
        };
        Ok(OidcIdentity {
            token,
            id_token,
            user_info,
        })
    }

    async fn refresh(&self, identity: &OidcIdentity) -> Result<OidcIdentity> {
        let Some(refresh_token) = identity.token.refresh_token.as_deref() else {
            return Err(Error::expired("access token expired"));
        };
        let form = self.client_form(vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ]);
        let response = match self.request_token(&form).await? {
            Poll::Done(response) => response,
            Poll::Pending | Poll::SlowDown => {
                return Err(Error::network("unexpected response on token refresh"))
            }
        };
        let (mut token, raw_id_token) = response.into_token(Utc::now());
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        let mut refreshed = match raw_id_token {
            Some(raw) => self.finalize(token, Some(raw)).await?,
            None => OidcIdentity {
                token,
                id_token: identity.id_token.clone(),
                user_info: None,
            },
        };
        if refreshed.user_info.is_none() {
            refreshed.user_info = identity.user_info.clone();
        }
        Ok(refreshed)
    }

    async fn authorize_device(
        &self,
        req: &Request<'_>,
        prompter: &dyn Prompter,
    ) -> Result<Authorization> {
        let device = self.start_device_authorization().await?;
        let message = match &device.verification_uri_complete {
            Some(complete) => {
                format!("Open the following URL in your browser to login: {complete}")
            }
            None => format!(
                "Open the following URL in your browser and provide the code {:?} to login: {}",
                device.user_code, device.verification_uri
            ),
        };
        prompter.send_info(&message).await?;

        let response = self.poll_token(&device).await?;
        let (token, raw_id_token) = response.into_token(Utc::now());
        let identity = self.finalize(token, raw_id_token).await?;

        let auth = Authorization::new(
            Identity::Oidc(Box::new(identity.clone())),
            &self.flow,
            req.remote,
        );
        if !req.validate(&auth).await? {
            return Ok(Authorization::forbidden(req.remote));
        }

        let token = encode_identity(&identity)?;
        let session = req
            .sessions
            .create(&self.flow, req.remote, Some(&token))
            .await
            .map_err(|e| e.context("cannot create session"))?;
        Ok(auth.with_session(session))
    }

    async fn restore(&self, session: &Session, opts: RestoreOpts) -> Result<Option<Authorization>> {
        let token = session.authorization_token().await?;
        if token.is_empty() {
            return Ok(None);
        }
        let identity: OidcIdentity = serde_json::from_slice(&token)
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot decode authorization token", e))?;

        let identity = if identity.token.is_expired_at(Utc::now()) {
            match self.refresh(&identity).await {
                Ok(refreshed) => {
                    session.set_authorization_token(&encode_identity(&refreshed)?).await?;
                    refreshed
                }
                Err(e) if matches!(e.kind(), ErrorKind::Expired | ErrorKind::Permission) => {
                    if opts.auto_clean_up_allowed {
                        session.set_authorization_token(&[]).await.map_err(|e| {
                            e.context(
                                "cannot clear authorization token of session after its oidc \
                                 token expired",
                            )
                        })?;
                        tracing::info!(
                            session = %session,
                            "Session's oidc access token expired; authorization token removed from session"
                        );
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        } else {
            identity
        };

        let remote = super::last_remote_of(session).await?;
        Ok(Some(
            Authorization::new(Identity::Oidc(Box::new(identity)), &self.flow, &remote)
                .with_session(session.clone()),
        ))
    }
}

fn find_jwk<'a>(set: &'a JwkSet, kid: Option<&str>) -> Option<&'a jsonwebtoken::jwk::Jwk> {
    match kid {
        Some(kid) => set.find(kid),
        None => set.keys.first(),
    }
}

fn encode_identity(identity: &OidcIdentity) -> Result<Vec<u8>> {
    serde_json::to_vec(identity)
        .map_err(|e| Error::wrap(ErrorKind::System, "cannot marshal authorization token", e))
}

#[async_trait]
impl Authorizer for OidcAuthorizer {
    async fn authorize_public_key(
        &self,
        req: &Request<'_>,
        key: &PublicKey,
    ) -> Result<Authorization> {
        let Some(session) = req.find_session_by_public_key(key).await? else {
            return Ok(Authorization::forbidden(req.remote));
        };
        let opts = RestoreOpts {
            auto_clean_up_allowed: true,
        };
        let Some(auth) = self
            .restore(&session, opts)
            .await
            .map_err(|e| {
                e.context(format!("cannot authorize oidc {:?} via public key", req.remote.user()))
            })?
        else {
            return Ok(Authorization::forbidden(req.remote));
        };
        let auth = Authorization {
            remote: req.remote.clone(),
            ..auth
        }
        .with_sessions_public_key(key);
        if !req.validate(&auth).await? {
            return Ok(Authorization::forbidden(req.remote));
        }
        Ok(auth)
    }

    async fn authorize_password(&self, req: &Request<'_>, _: &str) -> Result<Authorization> {
        Ok(Authorization::forbidden(req.remote))
    }

    async fn authorize_interactive(
        &self,
        req: &Request<'_>,
        prompter: &dyn Prompter,
    ) -> Result<Authorization> {
        self.authorize_device(req, prompter)
            .await
            .map_err(|e| {
                e.context(format!("cannot authorize oidc {:?} via device code", req.remote.user()))
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
        self.restore(session, opts)
            .await
            .map_err(|e| e.context(format!("cannot restore authorization from session {session}")))
    }
}
