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

//! Stored passwords and their verification.
//!
//! A configured password is either plain text or a hash:
//!
//! ```text
//! plain:hunter2
//! bcrypt:$2b$12$...
//! argon2:$argon2id$v=19$m=19456,t=2,p=1$...
//! $2b$12$...                 (bare bcrypt hash)
//! $argon2id$v=19$...         (bare argon2 hash)
//! ```

use std::fmt;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier as _},
    Algorithm, Argon2, Params, Version,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroizing;

use crate::shared::error::{Error, Result};

/// A configured password or password hash.
#[derive(Clone, PartialEq, Eq)]
pub enum Password {
    Plain(Zeroizing<String>),
    Bcrypt(String),
    Argon2(String),
}

impl Password {
    pub fn parse(value: &str) -> Result<Self> {
        if let Some(plain) = value.strip_prefix("plain:") {
            return Ok(Password::Plain(Zeroizing::new(plain.to_string())));
        }
        if let Some(hash) = value.strip_prefix("bcrypt:") {
            return Ok(Password::Bcrypt(hash.to_string()));
        }
        if let Some(hash) = value.strip_prefix("argon2:") {
            PasswordHash::new(hash)
                .map_err(|e| Error::config(format!("invalid argon2 hash: {e}")))?;
            return Ok(Password::Argon2(hash.to_string()));
        }
        if value.starts_with("$2") {
            return Ok(Password::Bcrypt(value.to_string()));
        }
        if value.starts_with("$argon2") {
            PasswordHash::new(value)
                .map_err(|e| Error::config(format!("invalid argon2 hash: {e}")))?;
            return Ok(Password::Argon2(value.to_string()));
        }
        Err(Error::config(
            "password must be prefixed with plain:, bcrypt: or argon2:",
        ))
    }

    /// Returns `true` if no password is configured (empty plain text).
    pub fn is_empty(&self) -> bool {
        matches!(self, Password::Plain(p) if p.is_empty())
    }

    pub fn verify(&self, candidate: &str) -> Result<bool> {
        match self {
            Password::Plain(expected) => Ok(constant_time_eq(
                expected.as_bytes(),
                candidate.as_bytes(),
            )),
            Password::Bcrypt(hash) => match bcrypt::verify(candidate, hash) {
                Ok(verified) => Ok(verified),
                Err(e) => {
                    tracing::warn!(error = %e, "bcrypt verification error");
                    Ok(false)
                }
            },
            Password::Argon2(hash) => verify_argon2(candidate, hash),
        }
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Password::Plain(_) => f.write_str("Password::Plain(***)"),
            Password::Bcrypt(_) => f.write_str("Password::Bcrypt(***)"),
            Password::Argon2(_) => f.write_str("Password::Argon2(***)"),
        }
    }
}

impl fmt::Display for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Password::Plain(p) => write!(f, "plain:{}", p.as_str()),
            Password::Bcrypt(h) => write!(f, "bcrypt:{h}"),
            Password::Argon2(h) => write!(f, "argon2:{h}"),
        }
    }
}

impl Serialize for Password {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Password {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Password::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn verify_argon2(candidate: &str, hash: &str) -> Result<bool> {
    let hash = PasswordHash::new(hash)
        .map_err(|e| Error::config(format!("invalid argon2 hash: {e}")))?;
    match Argon2::default().verify_password(candidate.as_bytes(), &hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(Error::system(format!("argon2 verification error: {e}"))),
    }
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Generate an Argon2id hash, prefixed with `argon2:`.
///
/// Parameters: m=19456 KiB, t=2, p=1.
pub fn hash_password(password: &str) -> Result<String> {
    use argon2::password_hash::SaltString;

    let salt = SaltString::generate(&mut OsRng);
    let params = Params::new(19456, 2, 1, None)
        .map_err(|e| Error::system(format!("invalid argon2 parameters: {e}")))?;
    let hash = Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::system(format!("cannot hash password: {e}")))?;
    Ok(format!("argon2:{hash}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain() {
        let p = Password::parse("plain:hunter2").unwrap();
        assert!(p.verify("hunter2").unwrap());
        assert!(!p.verify("hunter3").unwrap());
        assert!(!p.is_empty());
        assert!(Password::parse("plain:").unwrap().is_empty());
    }

    #[test]
    fn test_bcrypt() {
        let hash = bcrypt::hash("hunter2", 4).unwrap();
        let p = Password::parse(&format!("bcrypt:{hash}")).unwrap();
        assert!(p.verify("hunter2").unwrap());
        assert!(!p.verify("wrong").unwrap());

        let bare = Password::parse(&hash).unwrap();
        assert!(bare.verify("hunter2").unwrap());
    }

    #[test]
    fn test_argon2_roundtrip_through_hash_password() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("argon2:$argon2id$"));
        let p = Password::parse(&hash).unwrap();
        assert!(p.verify("correct horse").unwrap());
        assert!(!p.verify("battery staple").unwrap());
    }

    #[test]
    fn test_unprefixed_plain_is_rejected() {
        assert!(Password::parse("hunter2").is_err());
        assert!(Password::parse("argon2:not-a-hash").is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let p = Password::parse("plain:hunter2").unwrap();
        assert!(!format!("{p:?}").contains("hunter2"));
    }
}
