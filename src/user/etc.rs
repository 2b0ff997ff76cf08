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

//! Parsers for the colon separated `/etc/passwd`, `/etc/group` and `/etc/shadow` files.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home_dir: String,
    pub shell: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowEntry {
    pub name: String,
    pub hash: String,
}

fn fields(content: &str, min: usize) -> impl Iterator<Item = Vec<&str>> {
    content
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.split(':').collect::<Vec<_>>())
        .filter(move |f| f.len() >= min && !f[0].is_empty())
}

/// Malformed lines are skipped.
pub fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    fields(content, 7)
        .filter_map(|f| {
            Some(PasswdEntry {
                name: f[0].to_string(),
                uid: f[2].parse().ok()?,
                gid: f[3].parse().ok()?,
                gecos: f[4].to_string(),
                home_dir: f[5].to_string(),
                shell: f[6].to_string(),
            })
        })
        .collect()
}

pub fn parse_group(content: &str) -> Vec<GroupEntry> {
    fields(content, 3)
        .filter_map(|f| {
            Some(GroupEntry {
                name: f[0].to_string(),
                gid: f[2].parse().ok()?,
                members: f
                    .get(3)
                    .map(|m| {
                        m.split(',')
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            })
        })
        .collect()
}

pub fn parse_shadow(content: &str) -> Vec<ShadowEntry> {
    fields(content, 2)
        .map(|f| ShadowEntry {
            name: f[0].to_string(),
            hash: f[1].to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_passwd() {
        let entries = parse_passwd(
            "root:x:0:0:root:/root:/bin/bash\n\
             # comment\n\
             broken:x:abc:0::/:/bin/sh\n\
             alice:x:1000:1000:Alice A.:/home/alice:/bin/zsh\n",
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "alice");
        assert_eq!(entries[1].uid, 1000);
        assert_eq!(entries[1].gecos, "Alice A.");
        assert_eq!(entries[1].shell, "/bin/zsh");
    }

    #[test]
    fn test_parse_group() {
        let entries = parse_group("wheel:x:10:alice,bob\nusers:x:100:\n");
        assert_eq!(entries[0].members, vec!["alice", "bob"]);
        assert!(entries[1].members.is_empty());
    }

    #[test]
    fn test_parse_shadow() {
        let entries = parse_shadow("root:!:19000:0:99999:7:::\nalice::19000::::::\n");
        assert_eq!(entries[0].hash, "!");
        assert_eq!(entries[1].hash, "");
    }
}
