// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

pub const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Pushes the on-disk server file into the running interface. Never retries.
pub trait Applier: Send + Sync + 'static {
    fn apply(&self) -> impl Future<Output = Result<(), ApplyError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyMethod {
    /// `systemctl restart wg-quick@<iface>`; drops established sessions.
    Service,
    /// `wg syncconf <iface> <(wg-quick strip <file>)`; keeps sessions.
    #[default]
    WgQuick,
}

#[derive(Debug, Clone)]
pub struct CommandApplier {
    method: ApplyMethod,
    interface: String,
    config_path: PathBuf,
    timeout: Duration,
}

impl CommandApplier {
    pub fn new(method: ApplyMethod, interface: impl Into<String>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            method,
            interface: interface.into(),
            config_path: config_path.into(),
            timeout: APPLY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> (&'static str, Vec<String>) {
        match self.method {
            ApplyMethod::Service => (
                "systemctl",
                vec!["restart".into(), format!("wg-quick@{}", self.interface)],
            ),
            ApplyMethod::WgQuick => (
                "bash",
                vec![
                    "-c".into(),
                    r#"wg syncconf "$1" <(wg-quick strip "$2")"#.into(),
                    "wiregate-apply".into(),
                    self.interface.clone(),
                    self.config_path.display().to_string(),
                ],
            ),
        }
    }
}

impl Applier for CommandApplier {
    #[tracing::instrument(skip(self), fields(method = ?self.method, interface = %self.interface))]
    async fn apply(&self) -> Result<(), ApplyError> {
        let (program, args) = self.command();
        run_with_timeout(program, &args, self.timeout).await?;
        info!("interface reloaded");
        Ok(())
    }
}

pub async fn run_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<(), ApplyError> {
    debug!(program, ?args, "running command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ApplyError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ApplyError::Timeout {
            program: program.to_string(),
            after: timeout,
        })?
        .map_err(|source| ApplyError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ApplyError::Failed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
