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
//! SFTP server spoken over stdio.
//!
//! Environments run `bifroest sftp-server` as the session's user inside the
//! session's environment (the local user, the container or the pod) and wire
//! its stdio to the SSH channel. The process therefore needs no access checks
//! of its own: it sees exactly what the user sees. Relative paths resolve
//! against the working directory it was started in.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use russh_sftp::protocol::{
    Attrs, Data, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{oneshot, Mutex};

/// Error type for SFTP operations; converts to the reported `StatusCode`.
#[derive(Debug, Clone)]
pub struct SftpError {
    pub code: StatusCode,
    pub message: String,
}

impl SftpError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_supported() -> Self {
        Self::new(StatusCode::OpUnsupported, "Operation not supported")
    }

    pub fn invalid_handle() -> Self {
        Self::new(StatusCode::Failure, "Invalid handle")
    }

    pub fn eof() -> Self {
        Self::new(StatusCode::Eof, "End of file")
    }
}

impl std::fmt::Display for SftpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for SftpError {}

impl From<io::Error> for SftpError {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => StatusCode::NoSuchFile,
            io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
            io::ErrorKind::UnexpectedEof => StatusCode::Eof,
            _ => StatusCode::Failure,
        };
        Self::new(code, err.to_string())
    }
}

impl From<SftpError> for StatusCode {
    fn from(err: SftpError) -> Self {
        err.code
    }
}

enum OpenHandle {
    File {
        file: File,
        path: PathBuf,
    },
    Dir {
        path: PathBuf,
        entries: Vec<russh_sftp::protocol::File>,
        position: usize,
    },
}

/// Open handles per process.
const MAX_HANDLES: usize = 1000;

/// Largest chunk returned by one read.
const MAX_READ_SIZE: u32 = 65536;

/// Directory entries returned by one readdir.
const READDIR_BATCH: usize = 100;

/// SFTP handler working on the local filesystem with the process' permissions.
pub struct SftpServer {
    cwd: PathBuf,
    handles: Arc<Mutex<HashMap<String, OpenHandle>>>,
    handle_counter: u64,
}

fn ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: String::new(),
        language_tag: "en".to_string(),
    }
}

fn empty_attrs() -> FileAttributes {
    FileAttributes {
        size: None,
        uid: None,
        user: None,
        gid: None,
        group: None,
        permissions: None,
        atime: None,
        mtime: None,
    }
}

impl SftpServer {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            handles: Arc::new(Mutex::new(HashMap::new())),
            handle_counter: 0,
        }
    }

    fn new_handle(&mut self) -> String {
        self.handle_counter += 1;
        format!("h{}", self.handle_counter)
    }

    /// Absolute, lexically normalized form of a client path.
    ///
    /// An empty path or `.` is the working directory. `..` never climbs above `/`.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let joined = if path.is_empty() {
            self.cwd.clone()
        } else {
            self.cwd.join(path)
        };

        let mut resolved = PathBuf::from("/");
        for component in joined.components() {
            match component {
                Component::Normal(c) => resolved.push(c),
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        resolved
    }

    fn metadata_to_attrs(metadata: &std::fs::Metadata) -> FileAttributes {
        let secs = |t: io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0)
        };
        FileAttributes {
            size: Some(metadata.len()),
            uid: Some(metadata.uid()),
            user: None,
            gid: Some(metadata.gid()),
            group: None,
            permissions: Some(metadata.permissions().mode()),
            atime: Some(secs(metadata.accessed())),
            mtime: Some(secs(metadata.modified())),
        }
    }

    /// `ls -l` style line of a directory entry.
    fn build_longname(filename: &str, attrs: &FileAttributes) -> String {
        let perms = attrs.permissions.unwrap_or(0);
        let file_type = match perms & 0o170000 {
            0o120000 => 'l',
            0o040000 => 'd',
            _ => '-',
        };

        let mut mode = String::with_capacity(9);
        for (bit, c) in [
            (0o400, 'r'),
            (0o200, 'w'),
            (0o100, 'x'),
            (0o040, 'r'),
            (0o020, 'w'),
            (0o010, 'x'),
            (0o004, 'r'),
            (0o002, 'w'),
            (0o001, 'x'),
        ] {
            mode.push(if perms & bit != 0 { c } else { '-' });
        }

        let modified = attrs
            .mtime
            .and_then(|t| chrono::DateTime::from_timestamp(i64::from(t), 0))
            .map(|t| t.format("%b %e %H:%M").to_string())
            .unwrap_or_else(|| "Jan  1 00:00".to_string());

        format!(
            "{file_type}{mode}  1 {:5} {:5} {:10} {modified} {filename}",
            attrs.uid.unwrap_or(0),
            attrs.gid.unwrap_or(0),
            attrs.size.unwrap_or(0),
        )
    }

    async fn apply_attrs(path: &Path, attrs: &FileAttributes) -> Result<(), SftpError> {
        if let Some(size) = attrs.size {
            let file = OpenOptions::new().write(true).open(path).await?;
            file.set_len(size).await?;
        }
        if let Some(perms) = attrs.permissions {
            fs::set_permissions(path, std::fs::Permissions::from_mode(perms & 0o7777)).await?;
        }
        if attrs.uid.is_some() || attrs.gid.is_some() {
            std::os::unix::fs::chown(path, attrs.uid, attrs.gid)?;
        }
        Ok(())
    }

    async fn handle_path(&self, handle: &str) -> Result<PathBuf, SftpError> {
        match self.handles.lock().await.get(handle) {
            Some(OpenHandle::File { path, .. }) | Some(OpenHandle::Dir { path, .. }) => {
                Ok(path.clone())
            }
            None => Err(SftpError::invalid_handle()),
        }
    }
}

impl russh_sftp::server::Handler for SftpServer {
    type Error = SftpError;

    fn unimplemented(&self) -> Self::Error {
        SftpError::not_supported()
    }

    fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> impl std::future::Future<Output = Result<Version, Self::Error>> + Send {
        tracing::debug!(version, cwd = %self.cwd.display(), "SFTP session initialized");
        async move { Ok(Version::new()) }
    }

    fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> impl std::future::Future<Output = Result<Handle, Self::Error>> + Send {
        let path = self.resolve_path(&filename);
        let handle_id = self.new_handle();
        let handles = Arc::clone(&self.handles);

        tracing::debug!(
            path = %path.display(),
            flags = ?pflags,
            handle = %handle_id,
            "Opening file"
        );

        async move {
            if handles.lock().await.len() >= MAX_HANDLES {
                return Err(SftpError::new(StatusCode::Failure, "Too many open handles"));
            }

            let mut opts = OpenOptions::new();
            opts.read(pflags.contains(OpenFlags::READ))
                .write(pflags.contains(OpenFlags::WRITE))
                .create(pflags.contains(OpenFlags::CREATE))
                .truncate(pflags.contains(OpenFlags::TRUNCATE))
                .append(pflags.contains(OpenFlags::APPEND));
            if pflags.contains(OpenFlags::EXCLUDE) {
                opts.create_new(true);
            }

            let file = opts.open(&path).await?;
            handles
                .lock()
                .await
                .insert(handle_id.clone(), OpenHandle::File { file, path });

            Ok(Handle {
                id,
                handle: handle_id,
            })
        }
    }

    fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> impl std::future::Future<Output = Result<Data, Self::Error>> + Send {
        let handles = Arc::clone(&self.handles);

        async move {
            let mut handles_guard = handles.lock().await;
            let file = match handles_guard.get_mut(&handle) {
                Some(OpenHandle::File { file, .. }) => file,
                _ => return Err(SftpError::invalid_handle()),
            };

            file.seek(SeekFrom::Start(offset)).await?;
            let mut buffer = vec![0u8; len.min(MAX_READ_SIZE) as usize];
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                return Err(SftpError::eof());
            }
            buffer.truncate(read);

            Ok(Data { id, data: buffer })
        }
    }

    fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let handles = Arc::clone(&self.handles);

        async move {
            let mut handles_guard = handles.lock().await;
            let file = match handles_guard.get_mut(&handle) {
                Some(OpenHandle::File { file, .. }) => file,
                _ => return Err(SftpError::invalid_handle()),
            };

            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&data).await?;

            Ok(ok(id))
        }
    }

    fn close(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let handles = Arc::clone(&self.handles);

        async move {
            let removed = handles.lock().await.remove(&handle);
            match removed {
                Some(OpenHandle::File { mut file, .. }) => {
                    file.flush().await?;
                    Ok(ok(id))
                }
                Some(OpenHandle::Dir { .. }) => Ok(ok(id)),
                None => Err(SftpError::invalid_handle()),
            }
        }
    }

    fn opendir(
        &mut self,
        id: u32,
        path: String,
    ) -> impl std::future::Future<Output = Result<Handle, Self::Error>> + Send {
        let path = self.resolve_path(&path);
        let handle_id = self.new_handle();
        let handles = Arc::clone(&self.handles);

        async move {
            if handles.lock().await.len() >= MAX_HANDLES {
                return Err(SftpError::new(StatusCode::Failure, "Too many open handles"));
            }

            let mut read_dir = fs::read_dir(&path).await?;
            let mut entries = Vec::new();
            let mut push = |filename: String, meta: &std::fs::Metadata| {
                let attrs = SftpServer::metadata_to_attrs(meta);
                entries.push(russh_sftp::protocol::File {
                    longname: SftpServer::build_longname(&filename, &attrs),
                    filename,
                    attrs,
                });
            };

            if let Ok(meta) = fs::symlink_metadata(&path).await {
                push(".".to_string(), &meta);
            }
            let parent = path.parent().unwrap_or(&path);
            if let Ok(meta) = fs::symlink_metadata(parent).await {
                push("..".to_string(), &meta);
            }
            while let Some(entry) = read_dir.next_entry().await? {
                if let Ok(meta) = fs::symlink_metadata(entry.path()).await {
                    push(entry.file_name().to_string_lossy().into_owned(), &meta);
                }
            }

            handles.lock().await.insert(
                handle_id.clone(),
                OpenHandle::Dir {
                    path,
                    entries,
                    position: 0,
                },
            );

            Ok(Handle {
                id,
                handle: handle_id,
            })
        }
    }

    fn readdir(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl std::future::Future<Output = Result<Name, Self::Error>> + Send {
        let handles = Arc::clone(&self.handles);

        async move {
            let mut handles_guard = handles.lock().await;
            let (entries, position) = match handles_guard.get_mut(&handle) {
                Some(OpenHandle::Dir {
                    entries, position, ..
                }) => (entries, position),
                _ => return Err(SftpError::invalid_handle()),
            };

            if *position >= entries.len() {
                return Err(SftpError::eof());
            }
            let end = (*position + READDIR_BATCH).min(entries.len());
            let files = entries[*position..end]
                .iter()
                .map(|e| russh_sftp::protocol::File {
                    filename: e.filename.clone(),
                    longname: e.longname.clone(),
                    attrs: e.attrs.clone(),
                })
                .collect();
            *position = end;

            Ok(Name { id, files })
        }
    }

    fn stat(
        &mut self,
        id: u32,
        path: String,
    ) -> impl std::future::Future<Output = Result<Attrs, Self::Error>> + Send {
        let path = self.resolve_path(&path);
        async move {
            let metadata = fs::metadata(&path).await?;
            Ok(Attrs {
                id,
                attrs: SftpServer::metadata_to_attrs(&metadata),
            })
        }
    }

    fn lstat(
        &mut self,
        id: u32,
        path: String,
    ) -> impl std::future::Future<Output = Result<Attrs, Self::Error>> + Send {
        let path = self.resolve_path(&path);
        async move {
            let metadata = fs::symlink_metadata(&path).await?;
            Ok(Attrs {
                id,
                attrs: SftpServer::metadata_to_attrs(&metadata),
            })
        }
    }

    fn fstat(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl std::future::Future<Output = Result<Attrs, Self::Error>> + Send {
        async move {
            let path = self.handle_path(&handle).await?;
            let metadata = fs::metadata(&path).await?;
            Ok(Attrs {
                id,
                attrs: SftpServer::metadata_to_attrs(&metadata),
            })
        }
    }

    fn realpath(
        &mut self,
        id: u32,
        path: String,
    ) -> impl std::future::Future<Output = Result<Name, Self::Error>> + Send {
        let resolved = self.resolve_path(&path);
        async move {
            let attrs = match fs::metadata(&resolved).await {
                Ok(meta) => SftpServer::metadata_to_attrs(&meta),
                Err(_) => empty_attrs(),
            };
            tracing::trace!(
                requested = %path,
                resolved = %resolved.display(),
                "Resolved real path"
            );
            Ok(Name {
                id,
                files: vec![russh_sftp::protocol::File {
                    filename: resolved.display().to_string(),
                    longname: String::new(),
                    attrs,
                }],
            })
        }
    }

    fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let path = self.resolve_path(&path);
        async move {
            fs::create_dir(&path).await?;
            if let Some(perms) = attrs.permissions {
                fs::set_permissions(&path, std::fs::Permissions::from_mode(perms & 0o7777)).await?;
            }
            tracing::debug!(path = %path.display(), "Created directory");
            Ok(ok(id))
        }
    }

    fn rmdir(
        &mut self,
        id: u32,
        path: String,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let path = self.resolve_path(&path);
        async move {
            fs::remove_dir(&path).await?;
            tracing::debug!(path = %path.display(), "Removed directory");
            Ok(ok(id))
        }
    }

    fn remove(
        &mut self,
        id: u32,
        filename: String,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let path = self.resolve_path(&filename);
        async move {
            fs::remove_file(&path).await?;
            tracing::debug!(path = %path.display(), "Removed file");
            Ok(ok(id))
        }
    }

    fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let from = self.resolve_path(&oldpath);
        let to = self.resolve_path(&newpath);
        async move {
            fs::rename(&from, &to).await?;
            tracing::debug!(from = %from.display(), to = %to.display(), "Renamed");
            Ok(ok(id))
        }
    }

    fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let path = self.resolve_path(&path);
        async move {
            SftpServer::apply_attrs(&path, &attrs).await?;
            Ok(ok(id))
        }
    }

    fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        async move {
            let path = self.handle_path(&handle).await?;
            SftpServer::apply_attrs(&path, &attrs).await?;
            Ok(ok(id))
        }
    }

    fn readlink(
        &mut self,
        id: u32,
        path: String,
    ) -> impl std::future::Future<Output = Result<Name, Self::Error>> + Send {
        let path = self.resolve_path(&path);
        async move {
            let target = fs::read_link(&path).await?;
            Ok(Name {
                id,
                files: vec![russh_sftp::protocol::File {
                    filename: target.display().to_string(),
                    longname: String::new(),
                    attrs: empty_attrs(),
                }],
            })
        }
    }

    fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> impl std::future::Future<Output = Result<Status, Self::Error>> + Send {
        let link = self.resolve_path(&linkpath);
        async move {
            fs::symlink(&targetpath, &link).await?;
            tracing::debug!(link = %link.display(), target = %targetpath, "Created symbolic link");
            Ok(ok(id))
        }
    }
}

/// Process stdio as one duplex stream; fires `done` once dropped.
struct StdioStream {
    stdin: tokio::io::Stdin,
    stdout: tokio::io::Stdout,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for StdioStream {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl AsyncRead for StdioStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}

/// Serve SFTP on stdin/stdout until the client goes away.
pub async fn serve_stdio() -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let (done_tx, done_rx) = oneshot::channel();
    let stream = StdioStream {
        stdin: tokio::io::stdin(),
        stdout: tokio::io::stdout(),
        done: Some(done_tx),
    };

    russh_sftp::server::run(stream, SftpServer::new(cwd)).await;
    let _ = done_rx.await;
    tracing::debug!("SFTP session ended");
    Ok(())
}
