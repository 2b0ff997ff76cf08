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

//! Authorization sections of a flow.
//!
//! The `type` field selects the variant:
//!
//! ```yaml
//! authorization:
//!   type: simple
//!   entries:
//!     - name: bob
//!       password: "bcrypt:$2b$12$..."
//!       authorizedKeys: ["ssh-ed25519 AAAA..."]
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::duration::Duration;
use crate::crypto::Password;
use crate::template::{TemplateBool, TemplateString, TemplateStrings};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthorizationSpec {
    None(AuthorizationNone),
    Htpasswd(AuthorizationHtpasswd),
    Simple(AuthorizationSimple),
    Local(AuthorizationLocal),
    OidcDevice(AuthorizationOidcDevice),
}

impl AuthorizationSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            AuthorizationSpec::None(_) => "none",
            AuthorizationSpec::Htpasswd(_) => "htpasswd",
            AuthorizationSpec::Simple(_) => "simple",
            AuthorizationSpec::Local(_) => "local",
            AuthorizationSpec::OidcDevice(_) => "oidcDevice",
        }
    }
}

/// Accepts everybody.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthorizationNone {}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthorizationHtpasswd {
    /// Path of an htpasswd file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Inline htpasswd content.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub entries: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthorizationSimple {
    pub entries: Vec<SimpleEntry>,
}

/// One user of the simple authorizer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleEntry {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Password>,

    /// Keys in authorized_keys line format.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorized_keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_keys_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthorizationLocal {
    /// authorized_keys locations, rendered against `{user}`.
    pub authorized_keys: TemplateStrings,

    pub password: PasswordProperties,

    /// Accepted for compatibility; passwords are verified against the shadow database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pam_service: Option<String>,
}

impl Default for AuthorizationLocal {
    fn default() -> Self {
        Self {
            authorized_keys: TemplateStrings::new(["{{.user.homeDir}}/.ssh/authorized_keys"])
                .unwrap_or_default(),
            password: PasswordProperties::default(),
            pam_service: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PasswordProperties {
    pub allowed: TemplateBool,
    pub interactive_allowed: TemplateBool,
    pub empty_allowed: TemplateBool,
}

impl Default for PasswordProperties {
    fn default() -> Self {
        Self {
            allowed: TemplateBool::of(true),
            interactive_allowed: TemplateBool::of(true),
            empty_allowed: TemplateBool::of(false),
        }
    }
}

/// OpenID Connect device authorization grant.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthorizationOidcDevice {
    pub issuer: TemplateString,
    pub client_id: TemplateString,
    pub client_secret: TemplateString,

    /// Default: `openid`, `profile`, `email`
    pub scopes: TemplateStrings,

    /// Default: true
    pub retrieve_id_token: bool,

    /// Default: false
    pub retrieve_user_info: bool,

    /// How long the user has to complete the device flow.
    ///
    /// Default: 5m
    pub timeout: Duration,
}

impl Default for AuthorizationOidcDevice {
    fn default() -> Self {
        Self {
            issuer: TemplateString::default(),
            client_id: TemplateString::default(),
            client_secret: TemplateString::default(),
            scopes: TemplateStrings::of(["openid", "profile", "email"]),
            retrieve_id_token: true,
            retrieve_user_info: false,
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_variants() {
        let spec: AuthorizationSpec = serde_yaml::from_str("type: none").unwrap();
        assert_eq!(spec.type_name(), "none");

        let spec: AuthorizationSpec = serde_yaml::from_str(
            "type: simple\nentries:\n  - name: bob\n    password: plain:hunter2\n",
        )
        .unwrap();
        match spec {
            AuthorizationSpec::Simple(simple) => {
                assert_eq!(simple.entries.len(), 1);
                assert!(simple.entries[0].password.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }

        let yaml = "type: oidcDevice\nissuer: https://idp.example\nclientId: c\n";
        let spec: AuthorizationSpec = serde_yaml::from_str(yaml).unwrap();
        match spec {
            AuthorizationSpec::OidcDevice(oidc) => {
                assert!(oidc.retrieve_id_token);
                assert_eq!(oidc.timeout, Duration::from_secs(300));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_yaml::from_str::<AuthorizationSpec>("type: ldap").is_err());
    }
}
