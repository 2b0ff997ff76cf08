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
//! Host keys of the SSH server.
//!
//! Every configured path is loaded; a path which does not exist yet gets a
//! freshly generated Ed25519 key so a new installation works out of the box.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, HashAlg, PrivateKey};

/// Load the key at `path`, generating it first if it is absent.
pub fn load_or_generate(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        tracing::debug!(path = %path.display(), "Loading host key");
        return PrivateKey::read_openssh_file(path)
            .with_context(|| format!("Failed to load host key from {}", path.display()));
    }

    let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .context("Failed to generate Ed25519 host key")?;
    let encoded = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key to OpenSSH format")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    write_private_key(path, encoded.as_bytes())?;

    tracing::info!(
        path = %path.display(),
        fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
        "Generated host key"
    );
    Ok(key)
}

/// Load or generate every key; fails on the first unusable path.
pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<PrivateKey>> {
    if paths.is_empty() {
        anyhow::bail!("No host keys configured. At least one host key is required.");
    }
    paths.iter().map(|p| load_or_generate(p.as_ref())).collect()
}

fn write_private_key(path: &Path, content: &[u8]) -> Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to create host key file: {}", path.display()))?;
    file.write_all(content)
        .with_context(|| format!("Failed to write host key: {}", path.display()))?;
    Ok(())
}
