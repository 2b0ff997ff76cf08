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

//! Configuration loader for bifroest.
//!
//! This module handles loading configuration from multiple sources with
//! the following precedence (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file (YAML)
//! 3. Default values

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::authorization::AuthorizationSpec;
use super::types::Configuration;
use crate::shared::net::parse_listen_address;

/// Load configuration from file and environment.
///
/// # Default Locations
///
/// If no config path is specified, searches in order:
/// 1. `./bifroest.yaml` (current directory)
/// 2. `/etc/engity/bifroest/configuration.yaml` (system-wide)
/// 3. `$XDG_CONFIG_HOME/bifroest/configuration.yaml` (user-specific)
///
/// If none exists the defaults are used.
///
/// # Environment Variables
///
/// - `BIFROEST_SSH_ADDRESSES` - Comma-separated listen addresses (e.g. ":2222")
/// - `BIFROEST_HOST_KEYS` - Comma-separated host key paths
/// - `BIFROEST_MAX_CONNECTIONS` - Global concurrent connection limit
/// - `BIFROEST_SESSION_STORAGE` - Session repository directory
///
/// # Errors
///
/// Returns an error if:
/// - Configuration file cannot be read or parsed
/// - Environment variables have invalid values
/// - Configuration validation fails
pub fn load_config(config_path: Option<&Path>) -> Result<Configuration> {
    let mut config = Configuration::default();

    if let Some(path) = config_path {
        config = load_config_file(path).context("Failed to load configuration file")?;
        tracing::info!(path = %path.display(), "Loaded configuration from file");
    } else {
        for path in default_config_paths() {
            if path.exists() {
                config = load_config_file(&path).context("Failed to load configuration file")?;
                tracing::info!(path = %path.display(), "Loaded configuration from file");
                break;
            }
        }
    }

    config = apply_env_overrides(config)?;
    validate_config(&config)?;

    Ok(config)
}

/// Render the default configuration as a commented YAML document.
pub fn generate_config_template() -> String {
    let config = Configuration::default();
    let mut yaml = String::new();

    yaml.push_str("# bifroest configuration file\n");
    yaml.push_str("#\n");
    yaml.push_str("# Every section is optional; the values below are the defaults.\n");
    yaml.push_str("# Durations accept 500ms, 10s, 30m, 2h, 14d or combinations like 1h30m;\n");
    yaml.push_str("# 0 means no limit.\n");
    yaml.push_str("#\n");
    yaml.push_str("# Precedence (highest to lowest):\n");
    yaml.push_str("# 1. Environment variables (BIFROEST_* prefix)\n");
    yaml.push_str("# 2. This configuration file\n");
    yaml.push_str("# 3. Default values\n\n");

    yaml.push_str(&serde_yaml::to_string(&config).unwrap_or_default());

    yaml
}

/// Load configuration from a YAML file.
pub fn load_config_file(path: &Path) -> Result<Configuration> {
    let content =
        std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;

    serde_yaml::from_str(&content).context(format!("Failed to parse {}", path.display()))
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("./bifroest.yaml"),
        PathBuf::from("/etc/engity/bifroest/configuration.yaml"),
    ];

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("bifroest/configuration.yaml"));
    }

    paths
}

fn apply_env_overrides(mut config: Configuration) -> Result<Configuration> {
    if let Ok(addresses) = std::env::var("BIFROEST_SSH_ADDRESSES") {
        config.ssh.addresses = addresses
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        tracing::debug!(
            addresses = ?config.ssh.addresses,
            "Applied BIFROEST_SSH_ADDRESSES override"
        );
    }

    if let Ok(keys) = std::env::var("BIFROEST_HOST_KEYS") {
        config.ssh.keys.host_keys = keys.split(',').map(|s| PathBuf::from(s.trim())).collect();
        tracing::debug!(
            key_count = config.ssh.keys.host_keys.len(),
            "Applied BIFROEST_HOST_KEYS override"
        );
    }

    if let Ok(max_str) = std::env::var("BIFROEST_MAX_CONNECTIONS") {
        config.ssh.max_connections = max_str
            .parse()
            .context(format!("Invalid BIFROEST_MAX_CONNECTIONS value: {max_str}"))?;
        tracing::debug!(
            max = config.ssh.max_connections,
            "Applied BIFROEST_MAX_CONNECTIONS override"
        );
    }

    if let Ok(storage) = std::env::var("BIFROEST_SESSION_STORAGE") {
        config.session.storage = PathBuf::from(&storage);
        tracing::debug!(storage = %storage, "Applied BIFROEST_SESSION_STORAGE override");
    }

    Ok(config)
}

/// Validate configuration for correctness.
pub fn validate_config(config: &Configuration) -> Result<()> {
    if config.ssh.addresses.is_empty() {
        anyhow::bail!("At least one listen address must be configured (ssh.addresses)");
    }
    for address in &config.ssh.addresses {
        if parse_listen_address(address).is_none() {
            anyhow::bail!("Invalid listen address in ssh.addresses: {address}");
        }
    }

    if config.ssh.keys.host_keys.is_empty() {
        anyhow::bail!("At least one host key must be configured (ssh.keys.hostKeys)");
    }

    if config.ssh.max_connections == 0 {
        anyhow::bail!("ssh.maxConnections must be greater than 0");
    }

    if config.session.max_connections == 0 {
        anyhow::bail!("session.maxConnections must be greater than 0");
    }

    if config.housekeeping.every.is_zero() {
        anyhow::bail!("housekeeping.every must be greater than 0");
    }

    if config.flows.is_empty() {
        anyhow::bail!("At least one flow must be configured (flows)");
    }

    let mut names = HashSet::new();
    for flow in &config.flows {
        if !names.insert(flow.name.clone()) {
            anyhow::bail!("Duplicate flow name: {}", flow.name);
        }
        validate_authorization(&flow.authorization)
            .with_context(|| format!("Invalid authorization of flow {}", flow.name))?;
    }

    tracing::debug!("Configuration validation passed");
    Ok(())
}

fn validate_authorization(spec: &AuthorizationSpec) -> Result<()> {
    match spec {
        AuthorizationSpec::None(_) | AuthorizationSpec::Local(_) => {}
        AuthorizationSpec::Htpasswd(htpasswd) => {
            if htpasswd.file.is_none() && htpasswd.entries.trim().is_empty() {
                anyhow::bail!("either file or entries must be set");
            }
        }
        AuthorizationSpec::Simple(simple) => {
            let mut names = HashSet::new();
            for entry in &simple.entries {
                if entry.name.trim().is_empty() {
                    anyhow::bail!("entry without name");
                }
                if !names.insert(entry.name.to_lowercase()) {
                    anyhow::bail!("duplicate entry {}", entry.name);
                }
            }
        }
        AuthorizationSpec::OidcDevice(oidc) => {
            if oidc.issuer.is_empty() {
                anyhow::bail!("issuer is required");
            }
            if oidc.client_id.is_empty() {
                anyhow::bail!("clientId is required");
            }
        }
    }
    Ok(())
}
