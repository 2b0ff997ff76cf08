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
//! bifroest binary - SSH front door into local, container and pod environments

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bifroest::config::{generate_config_template, load_config, Configuration};
use bifroest::crypto::hash_password;
use bifroest::server::{Server, Services};
use bifroest::utils::logging;
use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

/// Engity's Bifröst - SSH server that authorizes per flow and hands users
/// over into their environment
#[derive(Parser, Debug)]
#[command(name = "bifroest")]
#[command(version)]
#[command(
    about = "SSH server that authorizes per flow and hands users over into their environment",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE", env = "BIFROEST_CONFIG")]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the SSH server (default)
    Run,

    /// Check configuration file for errors
    CheckConfig,

    /// Generate a configuration file template
    GenConfig {
        /// Output path (stdout if not specified)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Hash a password for htpasswd or simple authorization entries
    HashPassword,

    /// Serve SFTP over stdin/stdout
    SftpServer,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(cli.verbose);

    match cli.command {
        None | Some(Commands::Run) => run_server(&cli).await,
        Some(Commands::CheckConfig) => check_config(&cli),
        Some(Commands::GenConfig { ref output }) => gen_config(output.as_ref()),
        Some(Commands::HashPassword) => hash_password_interactive(),
        Some(Commands::SftpServer) => bifroest::server::sftp::serve_stdio().await,
        Some(Commands::Version) => show_version(),
    }
}

fn load(cli: &Cli) -> Result<Configuration> {
    match &cli.config {
        Some(path) => load_config(Some(path))
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => load_config(None).context("Failed to load configuration"),
    }
}

async fn run_server(cli: &Cli) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting bifroest");

    let configuration = load(cli)?;
    tracing::info!(
        addresses = ?configuration.ssh.addresses,
        flows = configuration.flows.len(),
        "Configuration loaded"
    );

    let services = Services::build(configuration)
        .await
        .context("Failed to set up flows")?;
    let services = Arc::new(services);
    let server = Server::new(services);

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = server.run(shutdown.clone()).await;
    shutdown.cancel();
    signals.abort();

    result.context("Server error")?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    use tokio::signal;

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("Received SIGINT (Ctrl+C)"),
            Err(err) => {
                tracing::warn!(error = %err, "Cannot install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        },
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

fn check_config(cli: &Cli) -> Result<()> {
    let config = load(cli)?;

    println!("✓ Configuration is valid\n");
    println!("SSH:");
    println!("  Addresses: {}", config.ssh.addresses.join(", "));
    println!("  Host keys: {}", config.ssh.keys.host_keys.len());
    for key in &config.ssh.keys.host_keys {
        println!("    - {}", key.display());
    }
    println!("  Max connections: {}", config.ssh.max_connections);
    println!("  Max auth tries: {}", config.ssh.max_auth_tries);
    println!("  Idle timeout: {}", config.ssh.idle_timeout);
    println!("  Max timeout: {}", config.ssh.max_timeout);
    println!("  PROXY protocol: {}", config.ssh.proxy_protocol);

    println!("\nSessions:");
    println!("  Storage: {}", config.session.storage.display());
    println!("  Idle timeout: {}", config.session.idle_timeout);
    println!("  Max timeout: {}", config.session.max_timeout);
    println!("  Max connections: {}", config.session.max_connections);

    println!("\nFlows:");
    for flow in &config.flows {
        println!(
            "  - {} (authorization: {}, environment: {})",
            flow.name,
            flow.authorization.type_name(),
            flow.environment.type_name()
        );
    }

    Ok(())
}

fn gen_config(output: Option<&PathBuf>) -> Result<()> {
    let template = generate_config_template();

    if let Some(path) = output {
        #[cfg(unix)]
        {
            use std::fs::OpenOptions;
            use std::os::unix::fs::OpenOptionsExt;

            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)
                .context("Failed to create configuration file")?;

            file.write_all(template.as_bytes())
                .context("Failed to write configuration file")?;
        }

        #[cfg(not(unix))]
        {
            std::fs::write(path, &template).context("Failed to write configuration file")?;
        }

        println!("Configuration template written to {}", path.display());
    } else {
        print!("{template}");
    }

    Ok(())
}

/// Read one line from stdin with terminal echo disabled if stdin is a TTY.
fn read_password(prompt: &str) -> Result<Zeroizing<String>> {
    eprint!("{prompt}");
    io::stderr().flush()?;

    let stdin = io::stdin();
    let restore = disable_echo(&stdin);

    let mut line = Zeroizing::new(String::new());
    let read = stdin.lock().read_line(&mut line);

    if let Some(original) = restore {
        let _ = nix::sys::termios::tcsetattr(&stdin, nix::sys::termios::SetArg::TCSANOW, &original);
        eprintln!();
    }
    read.context("Failed to read password")?;

    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(line)
}

fn disable_echo(stdin: &io::Stdin) -> Option<nix::sys::termios::Termios> {
    use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};

    let original = tcgetattr(stdin).ok()?;
    let mut silent = original.clone();
    silent.local_flags.remove(LocalFlags::ECHO);
    tcsetattr(stdin, SetArg::TCSANOW, &silent).ok()?;
    Some(original)
}

fn hash_password_interactive() -> Result<()> {
    let password = read_password("Enter password: ")?;
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    if password.len() < 8 {
        eprintln!("Warning: Password is shorter than 8 characters.");
    }

    let confirm = read_password("Confirm password: ")?;
    if *password != *confirm {
        anyhow::bail!("Passwords do not match");
    }

    let hash = hash_password(&password).context("Failed to hash password")?;
    println!("{hash}");

    Ok(())
}

fn show_version() -> Result<()> {
    println!("bifroest {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("{}", env!("CARGO_PKG_DESCRIPTION"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parsing_with_subcommand() {
        let args = Cli::try_parse_from(["bifroest"]).unwrap();
        assert!(args.command.is_none());

        let args = Cli::try_parse_from(["bifroest", "run"]).unwrap();
        assert!(matches!(args.command, Some(Commands::Run)));

        let args = Cli::try_parse_from(["bifroest", "gen-config", "-o", "/tmp/x.yaml"]).unwrap();
        assert!(matches!(
            args.command,
            Some(Commands::GenConfig { output: Some(ref p) }) if p == &PathBuf::from("/tmp/x.yaml")
        ));

        let args = Cli::try_parse_from(["bifroest", "sftp-server"]).unwrap();
        assert!(matches!(args.command, Some(Commands::SftpServer)));

        let args =
            Cli::try_parse_from(["bifroest", "-vv", "check-config", "-c", "/etc/b.yaml"]).unwrap();
        assert!(matches!(args.command, Some(Commands::CheckConfig)));
        assert_eq!(args.verbose, 2);
        assert_eq!(args.config, Some(PathBuf::from("/etc/b.yaml")));
    }

    #[test]
    fn test_gen_config_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bifroest.yaml");
        gen_config(Some(&path)).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("flows:"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
