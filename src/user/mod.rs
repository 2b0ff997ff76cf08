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

//! Local OS user database.
//!
//! Lookups read the colon files under `/etc` directly so that the result is
//! the same inside and outside of containers without NSS. Changes are made
//! with the system tools (`useradd`, `usermod`, `userdel`).

mod etc;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;

pub use etc::{parse_group, parse_passwd, parse_shadow, GroupEntry, PasswdEntry, ShadowEntry};

use crate::shared::error::{Error, ErrorKind, Result};

/// Exit code of `userdel` if the user does not exist.
const USERDEL_NO_SUCH_USER: i32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub name: String,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,
    pub display_name: String,
    pub uid: u32,
    pub group: Group,
    pub shell: String,
    pub home_dir: String,
}

impl std::fmt::Display for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.uid, self.name)
    }
}

/// Desired properties of a user; unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub uid: Option<u32>,
    /// Group name or numeric gid.
    pub group: Option<String>,
    pub shell: Option<String>,
    pub home_dir: Option<String>,
}

impl Requirement {
    pub fn is_fulfilled_by(&self, user: &User) -> bool {
        user.name == self.name
            && self.uid.map_or(true, |uid| uid == user.uid)
            && self
                .group
                .as_ref()
                .map_or(true, |g| *g == user.group.name || *g == user.group.gid.to_string())
            && self.shell.as_ref().map_or(true, |s| *s == user.shell)
            && self.home_dir.as_ref().map_or(true, |h| *h == user.home_dir)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnsureOpts {
    pub create_if_absent: bool,
    pub update_if_different: bool,
}

/// Outcome of [`Repository::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured {
    pub user: User,
    /// The user was created by this call.
    pub created: bool,
}

/// Access to the user database rooted at an `etc` directory.
#[derive(Debug, Clone)]
pub struct Repository {
    passwd: PathBuf,
    group: PathBuf,
    shadow: PathBuf,
}

impl Default for Repository {
    fn default() -> Self {
        Self::new("/etc")
    }
}

impl Repository {
    pub fn new(etc: impl AsRef<Path>) -> Self {
        let etc = etc.as_ref();
        Self {
            passwd: etc.join("passwd"),
            group: etc.join("group"),
            shadow: etc.join("shadow"),
        }
    }

    pub async fn lookup(&self, name: &str) -> Result<Option<User>> {
        self.find(|e| e.name == name).await
    }

    pub async fn lookup_uid(&self, uid: u32) -> Result<Option<User>> {
        self.find(|e| e.uid == uid).await
    }

    async fn find<F>(&self, predicate: F) -> Result<Option<User>>
    where
        F: Fn(&PasswdEntry) -> bool,
    {
        let passwd = read(&self.passwd).await?;
        let Some(entry) = parse_passwd(&passwd).into_iter().find(|e| predicate(e)) else {
            return Ok(None);
        };

        let groups = match read(&self.group).await {
            Ok(content) => parse_group(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        let group_name = groups
            .iter()
            .find(|g| g.gid == entry.gid)
            .map(|g| g.name.clone())
            .unwrap_or_else(|| entry.gid.to_string());

        Ok(Some(User {
            display_name: entry.gecos.split(',').next().unwrap_or_default().to_string(),
            name: entry.name,
            uid: entry.uid,
            group: Group {
                name: group_name,
                gid: entry.gid,
            },
            shell: entry.shell,
            home_dir: entry.home_dir,
        }))
    }

    /// Check `password` against the shadow database.
    ///
    /// Locked accounts (`!`/`*` hashes) never match; an empty hash only
    /// matches an empty password and only if `empty_allowed`.
    pub async fn verify_password(
        &self,
        name: &str,
        password: &str,
        empty_allowed: bool,
    ) -> Result<bool> {
        let shadow = read(&self.shadow).await?;
        let Some(entry) = parse_shadow(&shadow).into_iter().find(|e| e.name == name) else {
            return Ok(false);
        };

        if entry.hash.is_empty() {
            return Ok(empty_allowed && password.is_empty());
        }
        if entry.hash.starts_with('!') || entry.hash.starts_with('*') {
            return Ok(false);
        }
        Ok(pwhash::unix::verify(password, &entry.hash))
    }

    /// Make sure a user matching `req` exists.
    ///
    /// Returns `None` if it is absent and may not be created. An existing user
    /// which differs is only modified if `opts.update_if_different`.
    pub async fn ensure(&self, req: &Requirement, opts: EnsureOpts) -> Result<Option<Ensured>> {
        if req.name.is_empty() {
            return Err(Error::config("cannot ensure user without name"));
        }

        let existing = match req.uid {
            Some(uid) => match self.lookup_uid(uid).await? {
                Some(user) => Some(user),
                None => self.lookup(&req.name).await?,
            },
            None => self.lookup(&req.name).await?,
        };

        let Some(existing) = existing else {
            if !opts.create_if_absent {
                return Ok(None);
            }
            let user = self.create(req).await?;
            return Ok(Some(Ensured {
                user,
                created: true,
            }));
        };

        if req.is_fulfilled_by(&existing) || !opts.update_if_different {
            return Ok(Some(Ensured {
                user: existing,
                created: false,
            }));
        }

        let user = self.modify(req, &existing).await?;
        Ok(Some(Ensured {
            user,
            created: false,
        }))
    }

    async fn create(&self, req: &Requirement) -> Result<User> {
        let mut args: Vec<String> = Vec::new();
        if let Some(uid) = req.uid {
            args.extend(["-u".into(), uid.to_string()]);
        }
        if let Some(home) = &req.home_dir {
            args.extend(["-d".into(), home.clone()]);
        }
        if let Some(group) = &req.group {
            args.extend(["-g".into(), group.clone()]);
        }
        if let Some(shell) = &req.shell {
            args.extend(["-s".into(), shell.clone()]);
        }
        args.extend(["-m".into(), req.name.clone()]);

        execute("useradd", &args).await?;
        tracing::info!(user = %req.name, "Local user created");

        self.lookup(&req.name)
            .await?
            .ok_or_else(|| {
                Error::system(format!("user {} cannot be found after it was created", req.name))
            })
    }

    async fn modify(&self, req: &Requirement, existing: &User) -> Result<User> {
        let mut args: Vec<String> = Vec::new();
        if existing.name != req.name {
            args.extend(["-l".into(), req.name.clone()]);
        }
        if let Some(uid) = req.uid.filter(|uid| *uid != existing.uid) {
            args.extend(["-u".into(), uid.to_string()]);
        }
        if let Some(home) = req.home_dir.as_ref().filter(|h| **h != existing.home_dir) {
            args.extend(["-m".into(), "-d".into(), home.clone()]);
        }
        if let Some(group) = &req.group {
            args.extend(["-g".into(), group.clone()]);
        }
        if let Some(shell) = req.shell.as_ref().filter(|s| **s != existing.shell) {
            args.extend(["-s".into(), shell.clone()]);
        }
        args.push(existing.name.clone());

        execute("usermod", &args).await?;
        tracing::info!(user = %existing, "Local user modified");

        self.lookup(&req.name)
            .await?
            .ok_or_else(|| {
                Error::system(format!("user {} cannot be found after it was modified", req.name))
            })
    }

    /// Remove a user; a user which does not exist is not an error.
    pub async fn delete(&self, name: &str, remove_home_dir: bool) -> Result<()> {
        if name.is_empty() {
            return Err(Error::config("cannot delete user with empty name"));
        }
        let mut args = Vec::new();
        if remove_home_dir {
            args.push("-r".to_string());
        }
        args.push(name.to_string());

        match execute("userdel", &args).await {
            Ok(()) => {
                tracing::info!(user = %name, "Local user deleted");
                Ok(())
            }
            Err(CommandError::Exit(USERDEL_NO_SUCH_USER, _)) => Ok(()),
            Err(e) => Err(e.into_error("userdel")),
        }
    }
}

/// Send `SIGKILL` to every process owned by `uid`. Returns how many were signalled.
#[cfg(target_os = "linux")]
pub async fn kill_processes(uid: u32) -> Result<usize> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if uid == 0 {
        return Err(Error::permission("refusing to kill processes of root"));
    }

    let mut killed = 0;
    let mut entries = tokio::fs::read_dir("/proc").await?;
    while let Some(entry) = entries.next_entry().await? {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        let status = match tokio::fs::read_to_string(entry.path().join("status")).await {
            Ok(status) => status,
            Err(_) => continue,
        };
        let owner = status
            .lines()
            .find_map(|l| l.strip_prefix("Uid:"))
            .and_then(|l| l.split_whitespace().next())
            .and_then(|v| v.parse::<u32>().ok());
        if owner == Some(uid) && kill(Pid::from_raw(pid), Signal::SIGKILL).is_ok() {
            killed += 1;
        }
    }
    Ok(killed)
}

#[cfg(not(target_os = "linux"))]
pub async fn kill_processes(uid: u32) -> Result<usize> {
    match execute("pkill", &["-KILL".to_string(), "-U".to_string(), uid.to_string()]).await {
        Ok(()) => Ok(1),
        Err(CommandError::Exit(1, _)) => Ok(0),
        Err(e) => Err(e.into_error("pkill")),
    }
}

async fn read(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::from(e).context(format!("cannot read {}", path.display())))
}

enum CommandError {
    Spawn(std::io::Error),
    Exit(i32, String),
}

impl CommandError {
    fn into_error(self, program: &str) -> Error {
        match self {
            CommandError::Spawn(e) => {
                Error::wrap(ErrorKind::System, format!("cannot run {program}"), e)
            }
            CommandError::Exit(code, stderr) => Error::system(format!(
                "{program} failed with exit code {code}: {}",
                stderr.trim()
            )),
        }
    }
}

impl From<CommandError> for Error {
    fn from(value: CommandError) -> Self {
        value.into_error("command")
    }
}

async fn execute(program: &str, args: &[String]) -> std::result::Result<(), CommandError> {
    tracing::debug!(program, ?args, "Executing user management command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(CommandError::Spawn)?;
    if output.status.success() {
        return Ok(());
    }
    Err(CommandError::Exit(
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn etc() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("passwd"),
            "root:x:0:0:root:/root:/bin/bash\n\
             alice:x:1000:100:Alice,,,:/home/alice:/bin/bash\n\
             nobody:x:65534:65534::/:/usr/sbin/nologin\n\
             ghost:x:1001:1001::/home/ghost:/bin/sh\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("group"), "root:x:0:\nusers:x:100:alice\n").unwrap();
        let hash = pwhash::sha512_crypt::hash("secret").unwrap();
        std::fs::write(
            dir.path().join("shadow"),
            format!("root:!:19000::::::\nalice:{hash}:19000::::::\nnobody::19000::::::\n"),
        )
        .unwrap();
        let repo = Repository::new(dir.path());
        (dir, repo)
    }

    #[tokio::test]
    async fn test_lookup() {
        let (_dir, repo) = etc();
        let alice = repo.lookup("alice").await.unwrap().unwrap();
        assert_eq!(alice.uid, 1000);
        assert_eq!(alice.display_name, "Alice");
        assert_eq!(alice.group.name, "users");
        assert_eq!(alice.home_dir, "/home/alice");

        let ghost = repo.lookup_uid(1001).await.unwrap().unwrap();
        assert_eq!(ghost.group.name, "1001");

        assert!(repo.lookup("mallory").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_verify_password() {
        let (_dir, repo) = etc();
        assert!(repo.verify_password("alice", "secret", false).await.unwrap());
        assert!(!repo.verify_password("alice", "wrong", false).await.unwrap());
        assert!(!repo.verify_password("root", "", true).await.unwrap());
        assert!(!repo.verify_password("nobody", "", false).await.unwrap());
        assert!(repo.verify_password("nobody", "", true).await.unwrap());
        assert!(!repo.verify_password("nobody", "x", true).await.unwrap());
        assert!(!repo.verify_password("mallory", "secret", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_existing_without_changes() {
        let (_dir, repo) = etc();
        let req = Requirement {
            name: "alice".into(),
            shell: Some("/bin/bash".into()),
            ..Default::default()
        };
        let ensured = repo.ensure(&req, EnsureOpts::default()).await.unwrap().unwrap();
        assert!(!ensured.created);
        assert_eq!(ensured.user.uid, 1000);

        // Differences are tolerated unless updates are allowed.
        let req = Requirement {
            name: "alice".into(),
            shell: Some("/bin/zsh".into()),
            ..Default::default()
        };
        assert!(!req.is_fulfilled_by(&ensured.user));
        let ensured = repo.ensure(&req, EnsureOpts::default()).await.unwrap().unwrap();
        assert_eq!(ensured.user.shell, "/bin/bash");
    }

    #[tokio::test]
    async fn test_ensure_absent_without_create() {
        let (_dir, repo) = etc();
        let req = Requirement {
            name: "mallory".into(),
            ..Default::default()
        };
        assert!(repo.ensure(&req, EnsureOpts::default()).await.unwrap().is_none());
    }

    #[test]
    fn test_requirement_group_by_gid() {
        let user = User {
            name: "alice".into(),
            display_name: String::new(),
            uid: 1000,
            group: Group {
                name: "users".into(),
                gid: 100,
            },
            shell: "/bin/sh".into(),
            home_dir: "/home/alice".into(),
        };
        let mut req = Requirement {
            name: "alice".into(),
            group: Some("100".into()),
            ..Default::default()
        };
        assert!(req.is_fulfilled_by(&user));
        req.group = Some("wheel".into());
        assert!(!req.is_fulfilled_by(&user));
    }
}
