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

//! OpenSSH `authorized_keys` parsing.
//!
//! ```text
//! # Comment line
//! ssh-ed25519 AAAAC3NzaC1lZDI1NTE5... user@host
//! no-pty,command="/bin/date" ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABgQ... another@host
//! ```
//!
//! Keys are compared by their canonical wire encoding (see [`super::key_blob`]).

use std::path::Path;

use russh::keys::ssh_key::PublicKey;

use super::key_blob;
use crate::shared::error::{Error, ErrorKind, Result};

/// Options of an authorized_keys entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyOptions {
    pub command: Option<String>,
    pub environment: Vec<String>,
    pub from: Vec<String>,
    pub no_pty: bool,
    pub no_port_forwarding: bool,
}

/// A parsed authorized key entry.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    pub key: PublicKey,
    pub comment: Option<String>,
    pub options: KeyOptions,
}

impl AuthorizedKey {
    pub fn matches(&self, key: &PublicKey) -> bool {
        match (key_blob(&self.key), key_blob(key)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// Parse authorized_keys content. Invalid lines are logged and skipped.
pub fn parse_authorized_keys(content: &str) -> Vec<AuthorizedKey> {
    let mut keys = Vec::new();
    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_authorized_key_line(line) {
            Ok(key) => keys.push(key),
            Err(e) => {
                tracing::warn!(
                    line = line_num + 1,
                    error = %e,
                    "Failed to parse authorized_keys line"
                );
            }
        }
    }
    keys
}

/// Parse a single `[options] key-type base64-key [comment]` line.
pub fn parse_authorized_key_line(line: &str) -> Result<AuthorizedKey> {
    let (options, rest) = split_options(line.trim());
    let parts: Vec<&str> = rest.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(Error::config("missing key data"));
    }
    if !is_key_type(parts[0]) {
        return Err(Error::config(format!("unknown key type {:?}", parts[0])));
    }
    let key = PublicKey::from_openssh(&format!("{} {}", parts[0], parts[1]))
        .map_err(|e| Error::wrap(ErrorKind::Config, format!("cannot parse {} key", parts[0]), e))?;
    let comment = (parts.len() > 2).then(|| parts[2..].join(" "));
    Ok(AuthorizedKey {
        key,
        comment,
        options: options.map(parse_key_options).unwrap_or_default(),
    })
}

/// Load keys from `path`; a missing file yields no keys.
pub async fn load_authorized_keys(path: &Path) -> Result<Vec<AuthorizedKey>> {
    #[cfg(unix)]
    check_file_permissions(path)?;

    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(parse_authorized_keys(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No authorized_keys file found");
            Ok(Vec::new())
        }
        Err(e) => Err(Error::wrap(
            ErrorKind::System,
            format!("cannot read authorized keys file {}", path.display()),
            e,
        )),
    }
}

/// Returns `true` if `key` is listed in any of the given files.
pub async fn is_key_in_files<P: AsRef<Path>>(key: &PublicKey, paths: &[P]) -> Result<bool> {
    for path in paths {
        let keys = load_authorized_keys(path.as_ref()).await?;
        if keys.iter().any(|k| k.matches(key)) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(unix)]
fn check_file_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::wrap(
                ErrorKind::System,
                format!("cannot stat {}", path.display()),
                e,
            ))
        }
    };
    if metadata.is_file() && metadata.mode() & 0o002 != 0 {
        return Err(Error::permission(format!(
            "authorized keys file {} is world-writable (mode {:o})",
            path.display(),
            metadata.mode() & 0o777
        )));
    }
    Ok(())
}

fn is_key_type(s: &str) -> bool {
    matches!(
        s,
        "ssh-rsa"
            | "ssh-dss"
            | "ssh-ed25519"
            | "ecdsa-sha2-nistp256"
            | "ecdsa-sha2-nistp384"
            | "ecdsa-sha2-nistp521"
            | "sk-ssh-ed25519@openssh.com"
            | "sk-ecdsa-sha2-nistp256@openssh.com"
    )
}

/// Split a leading options field off; quotes may contain spaces.
fn split_options(line: &str) -> (Option<&str>, &str) {
    let first = line.split_whitespace().next().unwrap_or_default();
    if first.is_empty() || is_key_type(first) {
        return (None, line);
    }
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                return (Some(&line[..i]), line[i..].trim_start())
            }
            _ => {}
        }
    }
    (Some(line), "")
}

fn parse_key_options(options_str: &str) -> KeyOptions {
    let mut options = KeyOptions::default();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut items = Vec::new();
    for c in options_str.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    items.push(current);

    for option in items.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Some((key, value)) = option.split_once('=') {
            let value = value.trim_matches('"');
            match key {
                "command" => options.command = Some(value.to_string()),
                "environment" => options.environment.push(value.to_string()),
                "from" => options
                    .from
                    .extend(value.split(',').map(|v| v.trim().to_string())),
                _ => tracing::debug!(option = %key, "Unknown authorized_keys option"),
            }
        } else {
            match option {
                "no-pty" => options.no_pty = true,
                "no-port-forwarding" => options.no_port_forwarding = true,
                "restrict" => {
                    options.no_pty = true;
                    options.no_port_forwarding = true;
                }
                _ => tracing::debug!(option = %option, "Unknown authorized_keys option"),
            }
        }
    }
    options
}
