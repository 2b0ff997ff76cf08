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

//! Filesystem session repository.
//!
//! # Layout
//!
//! ```text
//! <storage>/<flow>/<session-id>/session        msgpack record (state, created, tokens)
//! <storage>/<flow>/<session-id>/last-accessed  msgpack {at, remoteUser, remoteHost}; mtime = at
//! <storage>/<flow>/<session-id>/public-keys    u32-BE length prefixed key blobs
//! ```
//!
//! Files are replaced atomically (write to a temporary sibling, then rename)
//! so readers never observe a torn record and need no lock. Writers are
//! serialised per session by a [`KeyedMutex`].

use std::fmt;
use std::future::Future;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use russh::keys::PublicKey;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::interceptor::{Interceptor, StackKey, Stacks};
use super::{valid_until, Access, Info, Predicates, SessionId, State};
use crate::config::{FlowName, SessionConfig};
use crate::crypto::{key_blob, key_from_blob};
use crate::shared::error::{Error, ErrorKind, Result};
use crate::shared::net::{parse_host_port, Remote};
use crate::shared::sync::KeyedMutex;

const SESSION_FILE: &str = "session";
const LAST_ACCESSED_FILE: &str = "last-accessed";
const PUBLIC_KEYS_FILE: &str = "public-keys";

/// Options of repository scans.
#[derive(Debug, Clone, Copy, Default)]
pub struct FindOpts {
    /// Remove records which cannot be read instead of skipping them.
    pub auto_clean_up: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    state: State,
    created_at: DateTime<Utc>,
    created_by: RecordRemote,
    #[serde(default, with = "bin")]
    authorization_token: Vec<u8>,
    #[serde(default, with = "bin")]
    environment_token: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordRemote {
    remote_user: String,
    remote_host: String,
}

impl From<&Remote> for RecordRemote {
    fn from(value: &Remote) -> Self {
        Self {
            remote_user: value.user().to_string(),
            remote_host: value.host().to_string(),
        }
    }
}

impl From<&RecordRemote> for Remote {
    fn from(value: &RecordRemote) -> Self {
        Remote::new(
            value.remote_user.clone(),
            parse_host_port(&value.remote_host).unwrap_or_else(|| Remote::default().host()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastAccessedRecord {
    at: DateTime<Utc>,
    #[serde(flatten)]
    by: RecordRemote,
}

/// Tokens are written as msgpack `bin` rather than an array of integers.
mod bin {
    use serde::de::{SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(Vec::new())
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_any(BytesVisitor)
    }
}

struct Inner {
    storage: PathBuf,
    file_mode: u32,
    dir_mode: u32,
    idle_timeout: Duration,
    max_timeout: Duration,
    max_connections: u16,
    locks: KeyedMutex<StackKey>,
    stacks: Stacks,
}

/// Session repository storing one directory per session.
#[derive(Clone)]
pub struct FsRepository {
    inner: Arc<Inner>,
}

impl FsRepository {
    /// Open the repository, creating the storage directory if needed.
    pub async fn new(config: &SessionConfig) -> Result<Self> {
        let repository = Self {
            inner: Arc::new(Inner {
                storage: config.storage.clone(),
                file_mode: config.file_mode.0,
                dir_mode: config.file_mode.dir_mode(),
                idle_timeout: config.idle_timeout.get(),
                max_timeout: config.max_timeout.get(),
                max_connections: config.max_connections,
                locks: KeyedMutex::new(),
                stacks: Stacks::default(),
            }),
        };
        repository.create_dir(&repository.inner.storage).await?;
        tracing::debug!(storage = %repository.inner.storage.display(), "Session repository opened");
        Ok(repository)
    }

    pub fn storage(&self) -> &Path {
        &self.inner.storage
    }

    /// Persist a new record in state `new` and return its handle.
    pub async fn create(
        &self,
        flow: &FlowName,
        remote: &Remote,
        authorization_token: Option<&[u8]>,
    ) -> Result<Session> {
        let id = SessionId::new();
        let session = self.handle(flow.clone(), id);
        let _guard = self.inner.locks.lock(session.key()).await;

        let dir = self.session_dir(flow, &id);
        self.create_dir(&dir).await?;

        let now = Utc::now();
        let record = Record {
            state: State::New,
            created_at: now,
            created_by: remote.into(),
            authorization_token: authorization_token.map(<[u8]>::to_vec).unwrap_or_default(),
            environment_token: Vec::new(),
        };
        let result = async {
            self.write_record(&dir, &record).await?;
            self.write_last_accessed(
                &dir,
                &LastAccessedRecord {
                    at: now,
                    by: remote.into(),
                },
            )
            .await
        }
        .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e.context(format!("cannot create session {session}")));
        }

        tracing::debug!(session = %session, remote = %remote, "Session created");
        Ok(session)
    }

    /// Fails with [`ErrorKind::NotFound`] if there is no such record.
    pub async fn find_by_id(&self, flow: &FlowName, id: &SessionId) -> Result<Session> {
        let session = self.handle(flow.clone(), *id);
        self.read_record(&self.session_dir(flow, id)).await?;
        Ok(session)
    }

    /// Most recently accessed session which trusts `key` and matches `predicates`.
    pub async fn find_by_public_key(
        &self,
        key: &PublicKey,
        predicates: &Predicates,
        opts: FindOpts,
    ) -> Result<Option<Session>> {
        let blob = key_blob(key)?;
        self.find_first(predicates, opts, |repository, dir| {
            let blob = blob.clone();
            async move {
                let blobs = repository.read_public_key_blobs(&dir).await?;
                Ok(blobs.iter().any(|candidate| *candidate == blob))
            }
        })
        .await
    }

    /// Most recently accessed session whose authorization token equals `token`.
    pub async fn find_by_access_token(
        &self,
        token: &[u8],
        predicates: &Predicates,
        opts: FindOpts,
    ) -> Result<Option<Session>> {
        if token.is_empty() {
            return Ok(None);
        }
        let token = token.to_vec();
        self.find_first(predicates, opts, |repository, dir| {
            let token = token.clone();
            async move {
                let record = repository.read_record(&dir).await?;
                Ok(record.authorization_token == token)
            }
        })
        .await
    }

    /// Visit every record existing when the scan starts.
    ///
    /// The consumer returns `Ok(false)` to stop early. Records which cannot be
    /// read are skipped, or removed if `opts.auto_clean_up` is set.
    pub async fn find_all<F, Fut>(&self, opts: FindOpts, mut consumer: F) -> Result<()>
    where
        F: FnMut(Session) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        for (flow, id) in self.scan(None, opts).await? {
            let dir = self.session_dir(&flow, &id);
            if let Err(e) = self.read_record(&dir).await {
                if e.kind() != ErrorKind::NotFound {
                    self.on_unreadable(&dir, &e, opts).await;
                }
                continue;
            }
            if !consumer(self.handle(flow, id)).await? {
                break;
            }
        }
        Ok(())
    }

    /// Remove the record and every file belonging to it.
    pub async fn delete(&self, session: &Session) -> Result<()> {
        let key = session.key();
        let _guard = self.inner.locks.lock(key.clone()).await;
        self.inner.stacks.mark_disposed(&key);
        let dir = self.session_dir(&session.flow, &session.id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::from(e).context(format!("cannot delete session {session}")));
            }
        }
        tracing::debug!(session = %session, "Session deleted");
        Ok(())
    }

    fn handle(&self, flow: FlowName, id: SessionId) -> Session {
        Session {
            repository: self.clone(),
            flow,
            id,
        }
    }

    fn session_dir(&self, flow: &FlowName, id: &SessionId) -> PathBuf {
        self.inner.storage.join(flow.as_str()).join(id.to_string())
    }

    async fn find_first<F, Fut>(
        &self,
        predicates: &Predicates,
        opts: FindOpts,
        mut accept: F,
    ) -> Result<Option<Session>>
    where
        F: FnMut(FsRepository, PathBuf) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let now = Utc::now();
        let mut best: Option<(Info, Session)> = None;
        for (flow, id) in self.scan(predicates.flow(), opts).await? {
            let dir = self.session_dir(&flow, &id);
            let accepted = match accept(self.clone(), dir.clone()).await {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::NotFound => false,
                Err(e) => {
                    self.on_unreadable(&dir, &e, opts).await;
                    false
                }
            };
            if !accepted {
                continue;
            }
            let session = self.handle(flow, id);
            let info = match session.info().await {
                Ok(info) => info,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    self.on_unreadable(&dir, &e, opts).await;
                    continue;
                }
            };
            if !predicates.matches(&info, now) {
                continue;
            }
            if best
                .as_ref()
                .map_or(true, |(b, _)| b.last_accessed.at < info.last_accessed.at)
            {
                best = Some((info, session));
            }
        }
        Ok(best.map(|(_, session)| session))
    }

    /// Snapshot of all `(flow, id)` pairs currently on disk.
    async fn scan(
        &self,
        only_flow: Option<&FlowName>,
        opts: FindOpts,
    ) -> Result<Vec<(FlowName, SessionId)>> {
        let mut result = Vec::new();
        let flows = match only_flow {
            Some(flow) => vec![flow.clone()],
            None => self.list_flows(opts).await?,
        };

        for flow in flows {
            let flow_dir = self.inner.storage.join(flow.as_str());
            let mut entries = match tokio::fs::read_dir(&flow_dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::from(e)
                        .context(format!("cannot list sessions in {}", flow_dir.display())))
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let parsed = name.to_str().and_then(|n| n.parse::<SessionId>().ok());
                match parsed {
                    Some(id) if entry.file_type().await?.is_dir() => {
                        result.push((flow.clone(), id))
                    }
                    _ => self.on_unexpected(&entry.path(), opts).await,
                }
            }
        }
        Ok(result)
    }

    async fn list_flows(&self, opts: FindOpts) -> Result<Vec<FlowName>> {
        let mut result = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.inner.storage).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(result),
            Err(e) => return Err(Error::from(e).context("cannot list session storage")),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let parsed = name.to_str().and_then(|n| n.parse::<FlowName>().ok());
            match parsed {
                Some(flow) if entry.file_type().await?.is_dir() => result.push(flow),
                _ => self.on_unexpected(&entry.path(), opts).await,
            }
        }
        result.sort();
        Ok(result)
    }

    async fn on_unreadable(&self, dir: &Path, err: &Error, opts: FindOpts) {
        if opts.auto_clean_up {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => tracing::warn!(
                    path = %dir.display(),
                    error = %err,
                    "Removed unreadable session record"
                ),
                Err(e) => tracing::warn!(
                    path = %dir.display(),
                    error = %e,
                    "Cannot remove unreadable session record"
                ),
            }
        } else {
            tracing::warn!(
                path = %dir.display(),
                error = %err,
                "Skipping unreadable session record"
            );
        }
    }

    async fn on_unexpected(&self, path: &Path, opts: FindOpts) {
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
        {
            return;
        }
        if !opts.auto_clean_up {
            tracing::debug!(path = %path.display(), "Ignoring unexpected entry in session storage");
            return;
        }
        let result = if path.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match result {
            Ok(()) => tracing::info!(
                path = %path.display(),
                "Removed unexpected entry from session storage"
            ),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "Cannot remove unexpected entry"
            ),
        }
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(self.inner.dir_mode);
        builder
            .create(path)
            .await
            .map_err(|e| Error::from(e).context(format!("cannot create {}", path.display())))
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("record");
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));
        let io =
            |e: std::io::Error| Error::from(e).context(format!("cannot write {}", path.display()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(self.inner.file_mode);
        let mut file = options.open(&tmp).await.map_err(io)?;
        file.write_all(data).await.map_err(io)?;
        file.sync_all().await.map_err(io)?;
        drop(file);
        tokio::fs::rename(&tmp, path).await.map_err(io)
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|e| Error::from(e).context(format!("cannot read {}", path.display())))
    }

    async fn read_record(&self, dir: &Path) -> Result<Record> {
        let data = self.read_file(&dir.join(SESSION_FILE)).await?;
        rmp_serde::from_slice(&data).map_err(|e| {
            Error::wrap(
                ErrorKind::System,
                format!("cannot decode {}", dir.join(SESSION_FILE).display()),
                e,
            )
        })
    }

    async fn write_record(&self, dir: &Path, record: &Record) -> Result<()> {
        let data = rmp_serde::to_vec_named(record)
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot encode session record", e))?;
        self.write_file(&dir.join(SESSION_FILE), &data).await
    }

    async fn read_last_accessed(&self, dir: &Path) -> Result<Option<LastAccessedRecord>> {
        let path = dir.join(LAST_ACCESSED_FILE);
        let data = match self.read_file(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        rmp_serde::from_slice(&data)
            .map(Some)
            .map_err(|e| {
                Error::wrap(ErrorKind::System, format!("cannot decode {}", path.display()), e)
            })
    }

    async fn write_last_accessed(&self, dir: &Path, record: &LastAccessedRecord) -> Result<()> {
        let path = dir.join(LAST_ACCESSED_FILE);
        let data = rmp_serde::to_vec_named(record)
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot encode last access", e))?;
        self.write_file(&path, &data).await?;

        let at: std::time::SystemTime = record.at.into();
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await?
            .into_std()
            .await;
        tokio::task::spawn_blocking(move || file.set_modified(at))
            .await
            .map_err(|e| Error::wrap(ErrorKind::System, "cannot set modification time", e))??;
        Ok(())
    }

    async fn read_public_key_blobs(&self, dir: &Path) -> Result<Vec<Vec<u8>>> {
        let path = dir.join(PUBLIC_KEYS_FILE);
        let data = match self.read_file(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        decode_blobs(&data)
            .ok_or_else(|| Error::system(format!("corrupt public keys file {}", path.display())))
    }

    async fn load_info(&self, flow: &FlowName, id: &SessionId) -> Result<Info> {
        let dir = self.session_dir(flow, id);
        let record = self.read_record(&dir).await?;
        let last = self.read_last_accessed(&dir).await?;

        let created = Access {
            at: record.created_at,
            remote: (&record.created_by).into(),
        };
        let last_accessed = match last {
            Some(last) => Access {
                at: last.at.max(record.created_at),
                remote: (&last.by).into(),
            },
            None => created.clone(),
        };
        let valid_until = valid_until(
            created.at,
            last_accessed.at,
            self.inner.idle_timeout,
            self.inner.max_timeout,
        );

        Ok(Info {
            flow: flow.clone(),
            id: *id,
            state: record.state,
            created,
            last_accessed,
            valid_until,
        })
    }
}

impl fmt::Debug for FsRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsRepository")
            .field("storage", &self.inner.storage)
            .finish()
    }
}

fn encode_blobs(blobs: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for blob in blobs {
        out.extend_from_slice(&(blob.len() as u32).to_be_bytes());
        out.extend_from_slice(blob);
    }
    out
}

fn decode_blobs(mut data: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut result = Vec::new();
    while !data.is_empty() {
        if data.len() < 4 {
            return None;
        }
        let (len, rest) = data.split_at(4);
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if rest.len() < len {
            return None;
        }
        let (blob, rest) = rest.split_at(len);
        result.push(blob.to_vec());
        data = rest;
    }
    Some(result)
}

/// Handle to one session record.
///
/// Handles are cheap to clone; every accessor reads the current state from
/// disk and every mutation goes through the repository's per-session lock.
#[derive(Clone)]
pub struct Session {
    repository: FsRepository,
    flow: FlowName,
    id: SessionId,
}

impl Session {
    pub fn flow(&self) -> &FlowName {
        &self.flow
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    fn key(&self) -> StackKey {
        (self.flow.clone(), self.id)
    }

    fn dir(&self) -> PathBuf {
        self.repository.session_dir(&self.flow, &self.id)
    }

    pub async fn info(&self) -> Result<Info> {
        self.repository.load_info(&self.flow, &self.id).await
    }

    pub async fn authorization_token(&self) -> Result<Vec<u8>> {
        Ok(self.repository.read_record(&self.dir()).await?.authorization_token)
    }

    pub async fn environment_token(&self) -> Result<Vec<u8>> {
        Ok(self.repository.read_record(&self.dir()).await?.environment_token)
    }

    /// An empty token clears it.
    pub async fn set_authorization_token(&self, token: &[u8]) -> Result<()> {
        self.update_record(|record| {
            if !token.is_empty() && record.state == State::Disposed {
                return Err(Error::expired("session is disposed"));
            }
            record.authorization_token = token.to_vec();
            Ok(())
        })
        .await
    }

    /// An empty token clears it.
    pub async fn set_environment_token(&self, token: &[u8]) -> Result<()> {
        self.update_record(|record| {
            if !token.is_empty() && record.state == State::Disposed {
                return Err(Error::expired("session is disposed"));
            }
            record.environment_token = token.to_vec();
            Ok(())
        })
        .await
    }

    pub async fn public_keys(&self) -> Result<Vec<PublicKey>> {
        self.repository
            .read_public_key_blobs(&self.dir())
            .await?
            .iter()
            .map(|blob| key_from_blob(blob))
            .collect()
    }

    pub async fn has_public_key(&self, key: &PublicKey) -> Result<bool> {
        let blob = key_blob(key)?;
        Ok(self
            .repository
            .read_public_key_blobs(&self.dir())
            .await?
            .contains(&blob))
    }

    /// Trust `key` for this session. Returns `false` if it already was.
    pub async fn add_public_key(&self, key: &PublicKey) -> Result<bool> {
        let blob = key_blob(key)?;
        let _guard = self.repository.inner.locks.lock(self.key()).await;
        let dir = self.dir();
        let record = self.repository.read_record(&dir).await?;
        if record.state == State::Disposed {
            return Err(Error::expired("session is disposed"));
        }
        let mut blobs = self.repository.read_public_key_blobs(&dir).await?;
        if blobs.contains(&blob) {
            return Ok(false);
        }
        blobs.push(blob);
        self.repository
            .write_file(&dir.join(PUBLIC_KEYS_FILE), &encode_blobs(&blobs))
            .await?;
        tracing::debug!(session = %self, "Public key added to session");
        Ok(true)
    }

    /// Record an access from `remote` and optionally move the state forward.
    ///
    /// Returns the state before the call. The access time never moves
    /// backwards.
    pub async fn notify_last_access(
        &self,
        remote: &Remote,
        new_state: Option<State>,
    ) -> Result<State> {
        let _guard = self.repository.inner.locks.lock(self.key()).await;
        let dir = self.dir();
        let mut record = self.repository.read_record(&dir).await?;
        let old_state = record.state;
        if old_state == State::Disposed {
            return Err(Error::expired(format!("session {self} is disposed")));
        }

        if let Some(state) = new_state {
            if state > record.state {
                record.state = state;
                self.repository.write_record(&dir, &record).await?;
            }
        }

        let previous = self.repository.read_last_accessed(&dir).await?;
        let mut at = Utc::now().max(record.created_at);
        if let Some(previous) = previous {
            at = at.max(previous.at);
        }
        self.repository
            .write_last_accessed(
                &dir,
                &LastAccessedRecord {
                    at,
                    by: remote.into(),
                },
            )
            .await?;
        Ok(old_state)
    }

    /// Mark the session disposed and drop its tokens and keys.
    ///
    /// Returns `false` if it already was disposed.
    pub async fn dispose(&self) -> Result<bool> {
        let key = self.key();
        let _guard = self.repository.inner.locks.lock(key.clone()).await;
        let dir = self.dir();
        let mut record = self.repository.read_record(&dir).await?;
        if record.state == State::Disposed {
            return Ok(false);
        }
        record.state = State::Disposed;
        record.authorization_token.clear();
        record.environment_token.clear();
        self.repository.write_record(&dir, &record).await?;
        match tokio::fs::remove_file(dir.join(PUBLIC_KEYS_FILE)).await {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => return Err(Error::from(e).context("cannot remove public keys")),
        }
        self.repository.inner.stacks.mark_disposed(&key);
        tracing::debug!(session = %self, "Session disposed");
        Ok(true)
    }

    /// Bind one more connection to this session.
    ///
    /// Fails with [`super::MAX_CONNECTIONS_REACHED`] when the session already
    /// has `session.maxConnections` live connections.
    pub async fn connection_interceptor(&self) -> Result<Interceptor> {
        let info = self.info().await?;
        if info.state == State::Disposed {
            return Err(Error::expired(format!("session {self} is disposed")));
        }
        let inner = &self.repository.inner;
        inner.stacks.acquire(
            self.key(),
            info.created.at,
            inner.idle_timeout,
            inner.max_timeout,
            inner.max_connections,
        )
    }

    async fn update_record<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Record) -> Result<()>,
    {
        let _guard = self.repository.inner.locks.lock(self.key()).await;
        let dir = self.dir();
        let mut record = self.repository.read_record(&dir).await?;
        mutate(&mut record)?;
        self.repository.write_record(&dir, &record).await
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.flow == other.flow && self.id == other.id
    }
}

impl Eq for Session {}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flow, self.id)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("flow", &self.flow)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Duration as ConfigDuration;
    use crate::session::{is_flow, is_remote_name, is_still_valid, MAX_CONNECTIONS_REACHED};
    use tempfile::TempDir;

    const KEY_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICutWi6WvYuiWUITFU9MKfR9QVjeDQ4YljkPh93DCO8d";
    const KEY_B: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAILLExqB2ZibfFpkG+0sQILI1I3H80BkKMZONd5RPTuW1";

    fn key(s: &str) -> PublicKey {
        PublicKey::from_openssh(s).unwrap()
    }

    fn remote(user: &str) -> Remote {
        Remote::new(user, "10.0.0.5:4711".parse().unwrap())
    }

    async fn repository(dir: &TempDir) -> FsRepository {
        let config = SessionConfig {
            storage: dir.path().join("sessions"),
            ..SessionConfig::default()
        };
        FsRepository::new(&config).await.unwrap()
    }

    fn flow(name: &str) -> FlowName {
        FlowName::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir).await;

        let session = repo.create(&flow("a"), &remote("alice"), Some(b"token")).await.unwrap();
        let found = repo.find_by_id(&flow("a"), &session.id()).await.unwrap();
        assert_eq!(found, session);

        let info = found.info().await.unwrap();
        assert_eq!(info.state, State::New);
        assert_eq!(info.created.remote, remote("alice"));
        assert!(info.created.at <= info.last_accessed.at);
        assert!(info.valid_until.is_some());
        assert_eq!(found.authorization_token().await.unwrap(), b"token");
        assert!(found.environment_token().await.unwrap().is_empty());

        let missing = repo.find_by_id(&flow("a"), &SessionId::new()).await.unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let repo = repository(&dir).await;
        let session = repo.create(&flow("a"), &remote("alice"), None).await.unwrap();
        let session_dir = session.dir();

        let file_mode = std::fs::metadata(session_dir.join(SESSION_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(&session_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_record_reencodes_identically() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir).await;
        let session = repo.create(&flow("a"), &remote("alice"), Some(b"t")).await.unwrap();

        let raw = std::fs::read(session.dir().join(SESSION_FILE)).unwrap();
        let record: Record = rmp_serde::from_slice(&raw).unwrap();
        assert_eq!(rmp_serde::to_vec_named(&record).unwrap(), raw);
    }

    #[tokio::test]
    async fn test_public_keys() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir).await;
        let first = repo.create(&flow("a"), &remote("bob"), None).await.unwrap();
        let other = repo.create(&flow("b"), &remote("bob"), None).await.unwrap();

        assert!(first.add_public_key(&key(KEY_A)).await.unwrap());
        assert!(!first.add_public_key(&key(KEY_A)).await.unwrap());
        assert!(other.add_public_key(&key(KEY_B)).await.unwrap());

        assert!(first.has_public_key(&key(KEY_A)).await.unwrap());
        assert!(!first.has_public_key(&key(KEY_B)).await.unwrap());
        assert_eq!(first.public_keys().await.unwrap().len(), 1);

        let found = repo
            .find_by_public_key(&key(KEY_A), &Predicates::new(), FindOpts::default())
            .await
            .unwrap();
        assert_eq!(found, Some(first.clone()));

        let restricted = Predicates::from([is_flow(&flow("b"))]);
        let found = repo
            .find_by_public_key(&key(KEY_A), &restricted, FindOpts::default())
            .await
            .unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn test_find_by_public_key_prefers_latest_access() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir).await;
        let older = repo.create(&flow("a"), &remote("bob"), None).await.unwrap();
        let newer = repo.create(&flow("a"), &remote("bob"), None).await.unwrap();
        older.add_public_key(&key(KEY_A)).await.unwrap();
        newer.add_public_key(&key(KEY_A)).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        newer.notify_last_access(&remote("bob"), None).await.unwrap();

        let found = repo
            .find_by_public_key(&key(KEY_A), &Predicates::new(), FindOpts::default())
            .await
            .unwrap();
        assert_eq!(found, Some(newer));
    }

    #[tokio::test]
    async fn test_find_by_access_token() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir).await;
        let session = repo
            .create(&flow("a"), &remote("carol"), Some(b"{\"user\":\"carol\"}"))
            .await
            .unwrap();
        repo.create(&flow("a"), &remote("dave"), Some(b"{\"user\":\"dave\"}"))
            .await
            .unwrap();

        let predicates = Predicates::from([
            is_flow(&flow("a")),
            is_remote_name("carol"),
            is_still_valid(),
        ]);
        let found = repo
            .find_by_access_token(b"{\"user\":\"carol\"}", &predicates, FindOpts::default())
            .await
            .unwrap();
        assert_eq!(found, Some(session));

        let none = repo
            .find_by_access_token(b"{\"user\":\"eve\"}", &predicates, FindOpts::default())
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_notify_last_access_moves_forward() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir).await;
        let session = repo.create(&flow("a"), &remote("bob"), None).await.unwrap();
        let before = session.info().await.unwrap();

        let old = session
            .notify_last_access(&remote("bob2"), Some(State::Authorized))
            .await
            .unwrap();
        assert_eq!(old, State::New);

        let after = session.info().await.unwrap();
        assert_eq!(after.state, State::Authorized);
        assert!(after.last_accessed.at >= before.last_accessed.at);
        assert_eq!(after.last_accessed.remote.user(), "bob2");
        assert_eq!(after.created.remote.user(), "bob");

        let old = session.notify_last_access(&remote("bob"), Some(State::New)).await.unwrap();
        assert_eq!(old, State::Authorized);
        assert_eq!(session.info().await.unwrap().state, State::Authorized);

        let mtime = std::fs::metadata(session.dir().join(LAST_ACCESSED_FILE))
            .unwrap()
            .modified()
            .unwrap();
        let at: DateTime<Utc> = mtime.into();
        let info = session.info().await.unwrap();
        assert!((at - info.last_accessed.at).num_milliseconds().abs() < 1000);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_clears() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir).await;
        let session = repo.create(&flow("a"), &remote("bob"), Some(b"auth")).await.unwrap();
        session.set_environment_token(b"env").await.unwrap();
        session.add_public_key(&key(KEY_A)).await.unwrap();

        assert!(session.dispose().await.unwrap());
        assert!(!session.dispose().await.unwrap());

        let info = session.info().await.unwrap();
        assert_eq!(info.state, State::Disposed);
        assert!(session.authorization_token().await.unwrap().is_empty());
        assert!(session.environment_token().await.unwrap().is_empty());
        assert!(session.public_keys().await.unwrap().is_empty());

        let err = session.notify_last_access(&remote("bob"), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Expired);
        assert!(session.add_public_key(&key(KEY_B)).await.is_err());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir).await;
        let session = repo.create(&flow("a"), &remote("bob"), None).await.unwrap();

        repo.delete(&session).await.unwrap();
        assert!(!session.dir().exists());
        assert_eq!(
            repo.find_by_id(&flow("a"), &session.id()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        repo.delete(&session).await.unwrap();
    }

    #[tokio::test]
    async fn test_find_all_and_auto_clean_up() {
        let dir = TempDir::new().unwrap();
        let repo = repository(&dir).await;
        repo.create(&flow("a"), &remote("x"), None).await.unwrap();
        repo.create(&flow("b"), &remote("y"), None).await.unwrap();

        let broken = repo.storage().join("a").join(SessionId::new().to_string());
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(SESSION_FILE), b"\xc1garbage").unwrap();

        let mut seen = Vec::new();
        repo.find_all(FindOpts::default(), |session| {
            seen.push(session);
            async { Ok(true) }
        })
        .await
        .unwrap();
        assert_eq!(seen.len(), 2);
        assert!(broken.exists());

        repo.find_all(FindOpts { auto_clean_up: true }, |_| async { Ok(true) })
            .await
            .unwrap();
        assert!(!broken.exists());

        let mut count = 0;
        repo.find_all(FindOpts::default(), |_| {
            count += 1;
            async { Ok(false) }
        })
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_expired_session_is_not_still_valid() {
        let dir = TempDir::new().unwrap();
        let config = SessionConfig {
            storage: dir.path().to_path_buf(),
            idle_timeout: ConfigDuration::from_millis(1),
            ..SessionConfig::default()
        };
        let repo = FsRepository::new(&config).await.unwrap();
        let session = repo.create(&flow("a"), &remote("bob"), Some(b"t")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let found = repo
            .find_by_access_token(b"t", &Predicates::from([is_still_valid()]), FindOpts::default())
            .await
            .unwrap();
        assert!(found.is_none());
        assert!(session.info().await.unwrap().is_expired_at(Utc::now()));
    }

    #[tokio::test]
    async fn test_connection_interceptor_limit() {
        let dir = TempDir::new().unwrap();
        let config = SessionConfig {
            storage: dir.path().to_path_buf(),
            max_connections: 1,
            ..SessionConfig::default()
        };
        let repo = FsRepository::new(&config).await.unwrap();
        let session = repo.create(&flow("a"), &remote("bob"), None).await.unwrap();

        let first = session.connection_interceptor().await.unwrap();
        let err = session.connection_interceptor().await.unwrap_err();
        assert_eq!(err.message(), MAX_CONNECTIONS_REACHED);
        drop(first);
        assert!(session.connection_interceptor().await.is_ok());
    }

    #[test]
    fn test_blob_framing() {
        let blobs = vec![b"abc".to_vec(), Vec::new(), b"z".to_vec()];
        assert_eq!(decode_blobs(&encode_blobs(&blobs)), Some(blobs));
        assert_eq!(decode_blobs(&[0, 0, 0, 5, 1]), None);
    }
}
