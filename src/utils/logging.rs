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
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Create an environment filter based on verbosity level
///
/// `BIFROEST_LOG` and then `RUST_LOG` take precedence over the verbosity.
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if let Ok(directives) = std::env::var("BIFROEST_LOG") {
        EnvFilter::new(directives)
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbosity {
            0 => EnvFilter::new("bifroest=info"),
            1 => EnvFilter::new("bifroest=debug"),
            // -vv: Include russh debug logs for SSH troubleshooting
            2 => EnvFilter::new("bifroest=trace,russh=debug"),
            _ => EnvFilter::new(
                "bifroest=trace,russh=trace,russh_sftp=debug,bollard=debug,kube=debug",
            ),
        }
    }
}

/// Initialize logging to stderr.
///
/// Stdout stays untouched so subcommands like `sftp-server` can speak
/// their protocol over it.
pub fn init_logging(verbosity: u8) {
    let filter = create_env_filter(verbosity);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(verbosity > 0))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_create_env_filter() {
        std::env::remove_var("RUST_LOG");
        std::env::remove_var("BIFROEST_LOG");
        assert_eq!(create_env_filter(0).to_string(), "bifroest=info");
        assert_eq!(create_env_filter(1).to_string(), "bifroest=debug");
        let _ = create_env_filter(2);
        let _ = create_env_filter(3);
    }

    #[test]
    #[serial_test::serial]
    fn test_bifroest_log_override() {
        std::env::set_var("BIFROEST_LOG", "bifroest::server=trace");
        assert_eq!(create_env_filter(0).to_string(), "bifroest::server=trace");
        std::env::remove_var("BIFROEST_LOG");
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging(0);
        init_logging(1);
    }
}
