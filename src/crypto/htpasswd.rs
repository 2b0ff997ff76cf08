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

//! Apache style htpasswd tables.
//!
//! Supported hash formats: bcrypt (`$2a$`, `$2b$`, `$2y$`), `{SHA}`, the Unix
//! crypt family (`$1$`, `$5$`, `$6$`) and plain text. Apache's `$apr1$` MD5
//! variant is not supported and never matches.

use std::collections::HashMap;
use std::path::Path;

use base64::Engine as _;
use sha1::{Digest, Sha1};

use super::password::constant_time_eq;
use crate::shared::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Default)]
pub struct Htpasswd {
    entries: HashMap<String, String>,
}

impl Htpasswd {
    pub fn parse(content: &str) -> Self {
        let mut result = Self::default();
        result.merge(content);
        result
    }

    /// Add entries from `content`; later entries override earlier ones.
    pub fn merge(&mut self, content: &str) {
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(':') {
                Some((user, hash)) if !user.is_empty() => {
                    self.entries.insert(user.to_string(), hash.to_string());
                }
                _ => tracing::warn!(line = line_num + 1, "Ignoring malformed htpasswd line"),
            }
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::wrap(
                ErrorKind::Config,
                format!("cannot read htpasswd file {}", path.display()),
                e,
            )
        })?;
        Ok(Self::parse(&content))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, user: &str) -> bool {
        self.entries.contains_key(user)
    }

    /// Verify `password` for `user`; unknown users never match.
    pub fn verify(&self, user: &str, password: &str) -> bool {
        match self.entries.get(user) {
            Some(hash) => verify_hash(hash, password),
            None => false,
        }
    }
}

fn verify_hash(hash: &str, password: &str) -> bool {
    if hash.starts_with("$2") {
        return bcrypt::verify(password, hash).unwrap_or(false);
    }
    if let Some(expected) = hash.strip_prefix("{SHA}") {
        let digest = Sha1::digest(password.as_bytes());
        let actual = base64::engine::general_purpose::STANDARD.encode(digest);
        return constant_time_eq(expected.as_bytes(), actual.as_bytes());
    }
    if hash.starts_with("$apr1$") {
        tracing::warn!("htpasswd apr1 hashes are not supported");
        return false;
    }
    if hash.starts_with("$1$") || hash.starts_with("$5$") || hash.starts_with("$6$") {
        return pwhash::unix::verify(password, hash);
    }
    constant_time_eq(hash.as_bytes(), password.as_bytes())
}
