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
//! End-to-end tests: a real server on a loopback port, driven by a russh client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bifroest::config::Configuration;
use bifroest::server::{Server, Services};
use bifroest::session::{FindOpts, SessionId};
use russh::client;
use russh::keys::{Algorithm, PrivateKey, PrivateKeyWithHashAlg};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct AcceptAll;

impl client::Handler for AcceptAll {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _: &russh::keys::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct Running {
    _dir: TempDir,
    services: Arc<Services>,
    address: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), self.task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))), "server did not stop cleanly: {result:?}");
    }
}

async fn start_server() -> Running {
    let dir = TempDir::new().unwrap();
    let yaml = format!(
        r#"
ssh:
  addresses: ["127.0.0.1:0"]
  keys:
    hostKeys: ["{key}"]
session:
  storage: "{storage}"
flows:
  - name: demo
    authorization:
      type: simple
      entries:
        - name: alice
          password: "plain:wonderland"
    environment:
      type: dummy
      introduction: "Hello {{{{.authorization.user.name}}}}!"
      exitCode: 3
"#,
        key = dir.path().join("host_key").display(),
        storage = dir.path().join("sessions").display(),
    );
    let configuration: Configuration = serde_yaml::from_str(&yaml).unwrap();

    let services = Arc::new(Services::build(configuration).await.unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let server = Server::new(services.clone());
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { server.serve(vec![listener], shutdown).await }
    });

    Running {
        _dir: dir,
        services,
        address,
        shutdown,
        task,
    }
}

async fn connect(address: SocketAddr) -> client::Handle<AcceptAll> {
    let config = Arc::new(client::Config::default());
    client::connect(config, address, AcceptAll).await.unwrap()
}

/// Run `command` and return stdout and exit status.
async fn exec(handle: &client::Handle<AcceptAll>, command: &str) -> (String, Option<u32>) {
    let mut channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, command).await.unwrap();

    let mut stdout = Vec::new();
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            russh::ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            russh::ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            _ => {}
        }
    }
    (String::from_utf8_lossy(&stdout).into_owned(), exit_status)
}

async fn session_ids(services: &Services) -> Vec<SessionId> {
    let mut result = Vec::new();
    services
        .sessions
        .find_all(FindOpts::default(), |session| {
            result.push(session.id());
            async { Ok(true) }
        })
        .await
        .unwrap();
    result
}

#[tokio::test]
async fn test_exec_with_password() {
    let server = start_server().await;

    let mut handle = connect(server.address).await;
    let auth = handle.authenticate_password("alice", "wonderland").await.unwrap();
    assert!(auth.success());

    let (stdout, exit_status) = exec(&handle, "whoami").await;
    assert_eq!(stdout, "Hello alice!\r\n");
    assert_eq!(exit_status, Some(3));

    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;
    server.stop().await;
}

#[tokio::test]
async fn test_offered_key_is_remembered_for_session() {
    let server = start_server().await;
    let key = Arc::new(PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap());

    // Unknown key first, then the password creates the session.
    let mut handle = connect(server.address).await;
    let auth = handle
        .authenticate_publickey("alice", PrivateKeyWithHashAlg::new(key.clone(), None))
        .await
        .unwrap();
    assert!(!auth.success());
    let auth = handle.authenticate_password("alice", "wonderland").await.unwrap();
    assert!(auth.success());
    assert_eq!(exec(&handle, "true").await, ("Hello alice!\r\n".to_string(), Some(3)));
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;

    let sessions = session_ids(&server.services).await;
    assert_eq!(sessions.len(), 1);

    // The key alone now leads into the same session.
    let mut handle = connect(server.address).await;
    let auth = handle
        .authenticate_publickey("alice", PrivateKeyWithHashAlg::new(key.clone(), None))
        .await
        .unwrap();
    assert!(auth.success());
    assert_eq!(exec(&handle, "true").await, ("Hello alice!\r\n".to_string(), Some(3)));
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;

    assert_eq!(session_ids(&server.services).await, sessions);

    // Another user does not get into that session with the same key.
    let mut handle = connect(server.address).await;
    let auth = handle
        .authenticate_publickey("bob", PrivateKeyWithHashAlg::new(key, None))
        .await
        .unwrap();
    assert!(!auth.success());
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_password_rejected() {
    let server = start_server().await;

    let mut handle = connect(server.address).await;
    let auth = handle.authenticate_password("alice", "looking-glass").await.unwrap();
    assert!(!auth.success());

    let auth = handle.authenticate_password("bob", "wonderland").await.unwrap();
    assert!(!auth.success());

    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;
    server.stop().await;
}
