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

//! Per-algorithm public key restrictions.
//!
//! Each key family (RSA, DSA, ECDSA, Ed25519) carries an independent policy:
//!
//! ```text
//! none | forbidden          -> keys of this family are rejected
//! all | allowed             -> any key of this family is accepted
//! at-least-<n>-bits         -> accepted if the key has at least n bits
//! ```

use std::fmt;
use std::str::FromStr;

use russh::keys::ssh_key::{Algorithm, EcdsaCurve, Mpint, PublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Policy applied to one key family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRestriction {
    Forbidden,
    Allowed,
    AtLeastBits(u32),
}

impl KeyRestriction {
    pub fn allows(&self, bits: Option<u32>) -> bool {
        match self {
            KeyRestriction::Forbidden => false,
            KeyRestriction::Allowed => true,
            KeyRestriction::AtLeastBits(min) => bits.is_some_and(|b| b >= *min),
        }
    }
}

impl FromStr for KeyRestriction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "forbidden" => Ok(KeyRestriction::Forbidden),
            "all" | "allowed" => Ok(KeyRestriction::Allowed),
            other => other
                .strip_prefix("at-least-")
                .and_then(|v| v.strip_suffix("-bits"))
                .and_then(|v| v.parse().ok())
                .map(KeyRestriction::AtLeastBits)
                .ok_or_else(|| format!("illegal key restriction: {s:?}")),
        }
    }
}

impl fmt::Display for KeyRestriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRestriction::Forbidden => f.write_str("none"),
            KeyRestriction::Allowed => f.write_str("all"),
            KeyRestriction::AtLeastBits(n) => write!(f, "at-least-{n}-bits"),
        }
    }
}

impl Serialize for KeyRestriction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for KeyRestriction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Key family a restriction is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Dsa,
    Ecdsa,
    Ed25519,
    /// Security keys and anything else; never accepted.
    Other,
}

impl KeyFamily {
    pub fn of(key: &PublicKey) -> Self {
        match key.algorithm() {
            Algorithm::Rsa { .. } => KeyFamily::Rsa,
            Algorithm::Dsa => KeyFamily::Dsa,
            Algorithm::Ecdsa { .. } => KeyFamily::Ecdsa,
            Algorithm::Ed25519 => KeyFamily::Ed25519,
            _ => KeyFamily::Other,
        }
    }
}

/// Size of the key in bits, where it can be determined.
pub fn key_bits(key: &PublicKey) -> Option<u32> {
    match key.algorithm() {
        Algorithm::Rsa { .. } => key.key_data().rsa().and_then(|k| mpint_bits(&k.n)),
        Algorithm::Dsa => key.key_data().dsa().and_then(|k| mpint_bits(&k.p)),
        Algorithm::Ecdsa { curve } => Some(match curve {
            EcdsaCurve::NistP256 => 256,
            EcdsaCurve::NistP384 => 384,
            EcdsaCurve::NistP521 => 521,
        }),
        Algorithm::Ed25519 => Some(256),
        _ => None,
    }
}

fn mpint_bits(value: &Mpint) -> Option<u32> {
    let bytes = value.as_positive_bytes()?;
    let first = *bytes.first()?;
    Some((bytes.len() as u32 - 1) * 8 + (8 - first.leading_zeros()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSA_2048: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7E/abzeGcrAkI+UxggVqHym/JM47fi0H1vy0RfN59utnrBDF5DLzCVXSIgfXmTNE2Vhp/p1z08e+dZH/ARc+V5mfic0B8rO0WCBBEPSazMbRI1EO4VVqXObwFbJhJY0NJ8a4lVbRyyr5GCSPOEUjnmfM3xQVZIck7LS/y2/03qBqUhw892fmTJZ8lNYVxm+Fs5liGD0bFz17zNOVmz8p89uvnYbJPu6/kFRIJapRYgyI6djput9nQ+XlZqgsFqK86ZgGXs0nzUm/jAd9/M2QNABnCzNbZ2vGMNlwpXHJWY0vTisQZgBX6McIN0bb1/eSYL6VuQ7cmizXKpYLpVFBv";
    const EC_384: &str = "ecdsa-sha2-nistp384 AAAAE2VjZHNhLXNoYTItbmlzdHAzODQAAAAIbmlzdHAzODQAAABhBM62jaxw0Ja013t4rEKsIlLLu6/SxwgYLCzxRTumrJpuvPr2urvhJ/Ar5bpeOBtE6o66aRtHpXvFyr91u41oKbkShf628PEgzbUHJzcmLp5YfeY3SRrEaR+fd4vmqTJ54g==";

    #[test]
    fn test_parse_restrictions() {
        assert_eq!("none".parse::<KeyRestriction>().unwrap(), KeyRestriction::Forbidden);
        assert_eq!("all".parse::<KeyRestriction>().unwrap(), KeyRestriction::Allowed);
        assert_eq!(
            "at-least-4096-bits".parse::<KeyRestriction>().unwrap(),
            KeyRestriction::AtLeastBits(4096)
        );
        assert!("at-least-bits".parse::<KeyRestriction>().is_err());
        assert_eq!(KeyRestriction::AtLeastBits(384).to_string(), "at-least-384-bits");
    }

    #[test]
    fn test_key_bits() {
        let rsa = PublicKey::from_openssh(RSA_2048).unwrap();
        assert_eq!(KeyFamily::of(&rsa), KeyFamily::Rsa);
        assert_eq!(key_bits(&rsa), Some(2048));

        let ec = PublicKey::from_openssh(EC_384).unwrap();
        assert_eq!(KeyFamily::of(&ec), KeyFamily::Ecdsa);
        assert_eq!(key_bits(&ec), Some(384));
    }

    #[test]
    fn test_allows() {
        assert!(!KeyRestriction::Forbidden.allows(Some(8192)));
        assert!(KeyRestriction::Allowed.allows(None));
        assert!(!KeyRestriction::AtLeastBits(4096).allows(Some(2048)));
        assert!(KeyRestriction::AtLeastBits(2048).allows(Some(2048)));
        assert!(!KeyRestriction::AtLeastBits(1).allows(None));
    }
}
