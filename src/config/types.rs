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

//! Configuration types for bifroest.
//!
//! This module defines the configuration schema for the YAML configuration
//! file. All sections carry defaults so a minimal file only needs `flows`.
//!
//! # Example YAML
//!
//! ```yaml
//! ssh:
//!   addresses: [":22"]
//!   keys:
//!     hostKeys: [/var/lib/engity/bifroest/key]
//!   idleTimeout: 10m
//! session:
//!   type: fs
//!   idleTimeout: 30m
//!   storage: /var/lib/engity/bifroest/sessions
//! flows:
//!   - name: local
//!     authorization:
//!       type: local
//!     environment:
//!       type: local
//! housekeeping:
//!   every: 10m
//!   keepExpiredFor: 336h
//! ```

use std::fmt;
use std::path::PathBuf;

use regex::Regex;
use russh::keys::ssh_key::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::authorization::AuthorizationSpec;
use super::duration::Duration;
use super::environment::EnvironmentSpec;
use crate::crypto::{key_bits, KeyFamily, KeyRestriction};
use crate::template::TemplateString;

/// Root of the configuration tree.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Configuration {
    /// SSH listener and key settings.
    pub ssh: Ssh,

    /// Session repository settings.
    pub session: SessionConfig,

    /// Ordered list of flows; the first accepting flow wins.
    pub flows: Vec<Flow>,

    /// Periodic cleanup settings.
    pub housekeeping: HouseKeeping,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            ssh: Ssh::default(),
            session: SessionConfig::default(),
            flows: vec![Flow {
                name: FlowName::new_unchecked("local"),
                requirement: Requirement::default(),
                authorization: AuthorizationSpec::Local(Default::default()),
                environment: EnvironmentSpec::Local(Default::default()),
            }],
            housekeeping: HouseKeeping::default(),
        }
    }
}

impl Configuration {
    pub fn flow(&self, name: &FlowName) -> Option<&Flow> {
        self.flows.iter().find(|f| &f.name == name)
    }
}

/// SSH server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Ssh {
    /// Addresses to bind to; `:22` means all interfaces.
    ///
    /// Default: `[":22"]`
    pub addresses: Vec<String>,

    /// Host keys and client key restrictions.
    pub keys: Keys,

    /// Connection idle timeout; `0` disables it.
    ///
    /// Default: 10m
    pub idle_timeout: Duration,

    /// Maximum connection age regardless of activity; `0` disables it.
    ///
    /// Default: 0
    pub max_timeout: Duration,

    /// Authentication attempts per connection before it is closed.
    ///
    /// Default: 6
    pub max_auth_tries: u8,

    /// Concurrent connections accepted by the whole service.
    ///
    /// Default: 255
    pub max_connections: u32,

    /// Banner shown before authentication.
    pub banner: TemplateString,

    /// Expect a PROXY protocol v1 header on every accepted connection.
    pub proxy_protocol: bool,
}

impl Default for Ssh {
    fn default() -> Self {
        Self {
            addresses: vec![":22".to_string()],
            keys: Keys::default(),
            idle_timeout: Duration::from_secs(10 * 60),
            max_timeout: Duration::ZERO,
            max_auth_tries: 6,
            max_connections: 255,
            banner: default_banner(),
            proxy_protocol: false,
        }
    }
}

fn default_banner() -> TemplateString {
    TemplateString::new(
        r#"{{ "/etc/ssh/sshd-banner" | file "optional" | default "Transcend with Engity's Bifröst\n\n" }}"#,
    )
    .unwrap_or_default()
}

/// Host keys and per-family client key restrictions.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Keys {
    /// Host private keys; a missing file is generated (Ed25519) on start.
    pub host_keys: Vec<PathBuf>,

    /// Default: `at-least-4096-bits`
    pub rsa_restriction: KeyRestriction,

    /// Default: `none`
    pub dsa_restriction: KeyRestriction,

    /// Default: `at-least-384-bits`
    pub ecdsa_restriction: KeyRestriction,

    /// Default: `all`
    pub ed25519_restriction: KeyRestriction,

    /// Shown once a public key was captured for a new session.
    pub remember_me_notification: TemplateString,
}

impl Default for Keys {
    fn default() -> Self {
        Self {
            host_keys: vec![PathBuf::from("/var/lib/engity/bifroest/key")],
            rsa_restriction: KeyRestriction::AtLeastBits(4096),
            dsa_restriction: KeyRestriction::Forbidden,
            ecdsa_restriction: KeyRestriction::AtLeastBits(384),
            ed25519_restriction: KeyRestriction::Allowed,
            remember_me_notification: default_remember_me_notification(),
        }
    }
}

fn default_remember_me_notification() -> TemplateString {
    TemplateString::new(
        "The public key {{ .key.fingerprint }} was remembered for this session.\r\nNext time you can use it to connect without further authentication.\r\n\r\n",
    )
    .unwrap_or_default()
}

impl Keys {
    /// Whether a client key passes the configured restriction of its family.
    pub fn is_allowed(&self, key: &PublicKey) -> bool {
        let restriction = match KeyFamily::of(key) {
            KeyFamily::Rsa => self.rsa_restriction,
            KeyFamily::Dsa => self.dsa_restriction,
            KeyFamily::Ecdsa => self.ecdsa_restriction,
            KeyFamily::Ed25519 => self.ed25519_restriction,
            KeyFamily::Other => KeyRestriction::Forbidden,
        };
        restriction.allows(key_bits(key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionKind {
    #[default]
    Fs,
}

/// Session repository settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(rename = "type")]
    pub kind: SessionKind,

    /// Session expires after this long without any access.
    ///
    /// Default: 30m
    pub idle_timeout: Duration,

    /// Session expires this long after creation; `0` disables it.
    pub max_timeout: Duration,

    /// Concurrent connections per session.
    ///
    /// Default: 10
    pub max_connections: u16,

    /// Root directory of the filesystem repository.
    pub storage: PathBuf,

    /// Mode of the session files.
    ///
    /// Default: `0600`
    pub file_mode: FileMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            kind: SessionKind::Fs,
            idle_timeout: Duration::from_secs(30 * 60),
            max_timeout: Duration::ZERO,
            max_connections: 10,
            storage: PathBuf::from("/var/lib/engity/bifroest/sessions"),
            file_mode: FileMode(0o600),
        }
    }
}

/// Unix permission bits written as an octal string (`"0600"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl FileMode {
    /// Mode for directories: every read bit also grants traverse.
    pub fn dir_mode(&self) -> u32 {
        let mut mode = self.0 | 0o700;
        if mode & 0o040 != 0 {
            mode |= 0o010;
        }
        if mode & 0o004 != 0 {
            mode |= 0o001;
        }
        mode
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

impl Serialize for FileMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FileMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Str(String),
        }
        // YAML integers are read digit by digit as octal: 600 means 0o600.
        let digits = match Raw::deserialize(deserializer)? {
            Raw::Int(v) => v.to_string(),
            Raw::Str(s) => s,
        };
        let digits = digits.trim_start_matches("0o");
        u32::from_str_radix(digits, 8)
            .ok()
            .filter(|m| *m <= 0o7777)
            .map(FileMode)
            .ok_or_else(|| serde::de::Error::custom(format!("illegal file mode {digits:?}")))
    }
}

/// Housekeeping loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HouseKeeping {
    /// Default: 10m
    pub every: Duration,

    /// Default: 0
    pub initial_delay: Duration,

    /// Remove unreadable session records instead of failing.
    ///
    /// Default: true
    pub auto_repair: bool,

    /// Expired sessions are kept this long before being deleted.
    ///
    /// Default: 336h (14 days)
    pub keep_expired_for: Duration,
}

impl Default for HouseKeeping {
    fn default() -> Self {
        Self {
            every: Duration::from_secs(10 * 60),
            initial_delay: Duration::ZERO,
            auto_repair: true,
            keep_expired_for: Duration::from_secs(14 * 24 * 3600),
        }
    }
}

/// Name of a flow over `[A-Za-z0-9.-]+`, not made of dots only.
///
/// Also used as directory name within the session storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FlowName(String);

impl FlowName {
    pub fn new(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        if name.is_empty() {
            return Err("flow name must not be empty".to_string());
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(format!("illegal flow name {name:?}"));
        }
        if name.chars().all(|c| c == '.') {
            return Err(format!("illegal flow name {name:?}"));
        }
        Ok(Self(name))
    }

    pub(crate) fn new_unchecked(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FlowName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FlowName> for String {
    fn from(value: FlowName) -> Self {
        value.0
    }
}

impl fmt::Display for FlowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for FlowName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A regular expression which (de)serializes from its source.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        Regex::new(source).map(Self)
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Pattern::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Restricts which requesting user names a flow accepts.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Requirement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub included_requesting_name: Option<Pattern>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_requesting_name: Option<Pattern>,
}

impl Requirement {
    /// `included` matches (or is absent) and `excluded` does not match.
    pub fn accepts(&self, requesting_name: &str) -> bool {
        if let Some(included) = &self.included_requesting_name {
            if !included.is_match(requesting_name) {
                return false;
            }
        }
        if let Some(excluded) = &self.excluded_requesting_name {
            if excluded.is_match(requesting_name) {
                return false;
            }
        }
        true
    }
}

/// A named policy: who may use it, how they authenticate, where they land.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub name: FlowName,

    #[serde(default)]
    pub requirement: Requirement,

    pub authorization: AuthorizationSpec,

    pub environment: EnvironmentSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_name_validation() {
        assert!(FlowName::new("flow-1.a").is_ok());
        assert!(FlowName::new("").is_err());
        assert!(FlowName::new("with space").is_err());
        assert!(serde_yaml::from_str::<FlowName>("\"a/b\"").is_err());
    }

    #[test]
    fn test_flow_name_rejects_dots_only() {
        assert!(FlowName::new(".").is_err());
        assert!(FlowName::new("..").is_err());
        assert!(FlowName::new("...").is_err());
        assert!(serde_yaml::from_str::<FlowName>("\"..\"").is_err());
        assert!(FlowName::new("a..b").is_ok());
        assert!(FlowName::new(".hidden").is_ok());
    }

    #[test]
    fn test_requirement_accepts() {
        let r = Requirement {
            included_requesting_name: Some(Pattern::new("^admin-.*").unwrap()),
            excluded_requesting_name: Some(Pattern::new("^admin-guest$").unwrap()),
        };
        assert!(r.accepts("admin-root"));
        assert!(!r.accepts("root"));
        assert!(!r.accepts("admin-guest"));
        assert!(Requirement::default().accepts("anyone"));
    }

    #[test]
    fn test_file_mode() {
        let m: FileMode = serde_yaml::from_str("\"0600\"").unwrap();
        assert_eq!(m, FileMode(0o600));
        let m: FileMode = serde_yaml::from_str("640").unwrap();
        assert_eq!(m, FileMode(0o640));
        assert_eq!(m.dir_mode(), 0o750);
        assert!(serde_yaml::from_str::<FileMode>("\"0900\"").is_err());
        assert_eq!(FileMode(0o600).to_string(), "0600");
    }

    #[test]
    fn test_key_restrictions_defaults() {
        let keys = Keys::default();
        let ed = PublicKey::from_openssh(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICutWi6WvYuiWUITFU9MKfR9QVjeDQ4YljkPh93DCO8d",
        )
        .unwrap();
        let ec256 = PublicKey::from_openssh(
            "ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBH9Khkj1Qv6N/tVobRXZGgtXCfM+gnMkAQ+LXVYy/KKQxyIH7nk/OzorJm+8YxALp3NgKIqnExnwlDp/40Zp1mo=",
        )
        .unwrap();
        assert!(keys.is_allowed(&ed));
        assert!(!keys.is_allowed(&ec256));

        let forbidding = Keys {
            ed25519_restriction: KeyRestriction::Forbidden,
            ..Keys::default()
        };
        assert!(!forbidding.is_allowed(&ed));
    }
}
