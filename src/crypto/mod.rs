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

//! Key and password handling.

pub mod authorized_keys;
pub mod htpasswd;
pub mod password;
pub mod restriction;

pub use authorized_keys::{load_authorized_keys, parse_authorized_keys, AuthorizedKey};
pub use htpasswd::Htpasswd;
pub use password::{hash_password, Password};
pub use restriction::{key_bits, KeyFamily, KeyRestriction};

use russh::keys::ssh_key::{HashAlg, PublicKey};

use crate::shared::error::{Error, ErrorKind, Result};

/// Canonical wire encoding of a public key; used for byte-exact comparison and storage.
pub fn key_blob(key: &PublicKey) -> Result<Vec<u8>> {
    key.to_bytes()
        .map_err(|e| Error::wrap(ErrorKind::System, "cannot encode public key", e))
}

/// Inverse of [`key_blob`].
pub fn key_from_blob(blob: &[u8]) -> Result<PublicKey> {
    PublicKey::from_bytes(blob)
        .map_err(|e| Error::wrap(ErrorKind::System, "cannot decode public key", e))
}

/// `SHA256:...` fingerprint for logging.
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_roundtrip_ignores_comment() {
        let a = PublicKey::from_openssh(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICutWi6WvYuiWUITFU9MKfR9QVjeDQ4YljkPh93DCO8d first",
        )
        .unwrap();
        let b = PublicKey::from_openssh(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICutWi6WvYuiWUITFU9MKfR9QVjeDQ4YljkPh93DCO8d second",
        )
        .unwrap();
        let blob = key_blob(&a).unwrap();
        assert_eq!(blob, key_blob(&b).unwrap());
        assert_eq!(key_blob(&key_from_blob(&blob).unwrap()).unwrap(), blob);
        assert!(fingerprint(&a).starts_with("SHA256:"));
    }
}
