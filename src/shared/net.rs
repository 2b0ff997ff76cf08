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

//! Remote peers and connection identifiers.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The requesting user together with the peer address it connected from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Remote {
    user: String,
    host: SocketAddr,
}

impl Remote {
    pub fn new(user: impl Into<String>, host: SocketAddr) -> Self {
        Self {
            user: user.into(),
            host,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> SocketAddr {
        self.host
    }

    pub fn ip(&self) -> IpAddr {
        self.host.ip()
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

impl Default for Remote {
    fn default() -> Self {
        Self {
            user: String::new(),
            host: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }
}

/// Parse a `host:port` pair, tolerating a bare host (port `0`).
pub fn parse_host_port(value: &str) -> Option<SocketAddr> {
    if let Ok(addr) = SocketAddr::from_str(value) {
        return Some(addr);
    }
    IpAddr::from_str(value.trim_matches(|c| c == '[' || c == ']'))
        .ok()
        .map(|ip| SocketAddr::new(ip, 0))
}

/// Identifies one transport connection; distinct from the session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Listen address accepting the `:22` shorthand for "all interfaces".
pub fn parse_listen_address(value: &str) -> Option<SocketAddr> {
    let value = value.trim();
    if let Some(port) = value.strip_prefix(':') {
        let port = port.parse().ok()?;
        return Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    SocketAddr::from_str(value).ok()
}
