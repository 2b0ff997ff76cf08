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

//! PROXY protocol v1 (text form) header parsing.
//!
//! ```text
//! PROXY TCP4 192.0.2.10 198.51.100.1 56324 22\r\n
//! PROXY UNKNOWN\r\n
//! ```

use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::shared::error::{Error, Result};

/// Longest possible v1 header including the trailing CRLF.
const MAX_HEADER_LEN: usize = 107;

/// Read a v1 header from `stream`.
///
/// Returns the source address announced by the proxy, or `None` for
/// `PROXY UNKNOWN`. Reads byte-wise so nothing after the header is consumed.
pub async fn read_header<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Option<SocketAddr>> {
    let mut line = Vec::with_capacity(MAX_HEADER_LEN);
    loop {
        let b = stream
            .read_u8()
            .await
            .map_err(|e| Error::from(e).context("cannot read proxy protocol header"))?;
        line.push(b);
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() >= MAX_HEADER_LEN {
            return Err(Error::user("proxy protocol header too long"));
        }
    }
    line.truncate(line.len() - 2);
    let line = std::str::from_utf8(&line)
        .map_err(|_| Error::user("proxy protocol header is not ASCII"))?;
    parse_header(line)
}

/// Parse one header line without its CRLF.
pub fn parse_header(line: &str) -> Result<Option<SocketAddr>> {
    let mut parts = line.split(' ');
    if parts.next() != Some("PROXY") {
        return Err(Error::user("missing proxy protocol header"));
    }

    let family = parts.next().unwrap_or_default();
    if family == "UNKNOWN" {
        return Ok(None);
    }

    let fields: Vec<&str> = parts.collect();
    let [source, _destination, source_port, _destination_port] = fields.as_slice() else {
        return Err(Error::user(format!("malformed proxy protocol header: {line:?}")));
    };

    let ip: IpAddr = source
        .parse()
        .map_err(|_| {
            Error::user(format!(
                "illegal source address in proxy protocol header: {source}"
            ))
        })?;
    match (family, ip) {
        ("TCP4", IpAddr::V4(_)) | ("TCP6", IpAddr::V6(_)) => {}
        _ => {
            return Err(Error::user(format!(
                "source address {ip} does not match family {family}"
            )))
        }
    }
    let port: u16 = source_port
        .parse()
        .map_err(|_| {
            Error::user(format!(
                "illegal source port in proxy protocol header: {source_port}"
            ))
        })?;

    Ok(Some(SocketAddr::new(ip, port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_tcp4() {
        let addr = parse_header("PROXY TCP4 192.0.2.10 198.51.100.1 56324 22")
            .unwrap()
            .unwrap();
        assert_eq!(addr, "192.0.2.10:56324".parse().unwrap());
    }

    #[test]
    fn test_parse_tcp6() {
        let addr = parse_header("PROXY TCP6 2001:db8::1 2001:db8::2 4000 22")
            .unwrap()
            .unwrap();
        assert_eq!(addr, "[2001:db8::1]:4000".parse().unwrap());
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(parse_header("PROXY UNKNOWN").unwrap(), None);
        assert_eq!(
            parse_header("PROXY UNKNOWN ffff:f...f:ffff ffff:f...f:ffff 65535 65535").unwrap(),
            None
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_header("SSH-2.0-OpenSSH_9.6").is_err());
        assert!(parse_header("PROXY TCP4 192.0.2.10 198.51.100.1 56324").is_err());
        assert!(parse_header("PROXY TCP6 192.0.2.10 198.51.100.1 56324 22").is_err());
        assert!(parse_header("PROXY TCP4 192.0.2.10 198.51.100.1 99999 22").is_err());
    }

    #[tokio::test]
    async fn test_read_header_leaves_payload() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"PROXY TCP4 10.0.0.5 10.0.0.1 5000 22\r\nSSH-2.0-x\r\n")
            .build();
        let addr = read_header(&mut stream).await.unwrap().unwrap();
        assert_eq!(addr, "10.0.0.5:5000".parse().unwrap());

        let mut rest = [0u8; 11];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"SSH-2.0-x\r\n");
    }

    #[tokio::test]
    async fn test_read_header_too_long() {
        let mut stream = tokio_test::io::Builder::new().read(&[b'A'; MAX_HEADER_LEN]).build();
        assert!(read_header(&mut stream).await.is_err());
    }
}
