/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Launches the external profile viewer for a finished artifact directory.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use port_allocator::{PortAllocError, PortAllocator};
use tokio::process::Command;

use crate::prefs::{SnapshotKind, ViewerSettings};
use crate::services::artifacts::artifact_glob;

#[derive(Debug)]
pub enum ViewerError {
    Port(PortAllocError),
    Spawn { program: String, reason: String },
}

impl fmt::Display for ViewerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(e) => write!(f, "failed to get available port for viewer: {e}"),
            Self::Spawn { program, reason } => write!(f, "failed to start {program}: {reason}"),
        }
    }
}

impl std::error::Error for ViewerError {}

pub struct ViewerLauncher {
    ports: Arc<PortAllocator>,
    program: String,
    leading_args: Vec<String>,
}

impl ViewerLauncher {
    pub fn new(ports: Arc<PortAllocator>, settings: &ViewerSettings) -> Self {
        Self {
            ports,
            program: settings.program.clone(),
            leading_args: settings.leading_args.clone(),
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// `<leading args…> -http :<port> <dir>/*`
    pub fn command_args(&self, port: u16, artifact_dir: &Path) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.push("-http".to_string());
        args.push(format!(":{port}"));
        args.push(artifact_glob(artifact_dir));
        args
    }

    /// Start a viewer over `artifact_dir` and return the port it serves on.
    ///
    /// Returns as soon as the process has started. The child is awaited on a
    /// background task only so it gets reaped; its exit status is dropped.
    /// Must be called from within a tokio runtime.
    pub fn launch(&self, artifact_dir: &Path, kind: SnapshotKind) -> Result<u16, ViewerError> {
        let port = self.ports.acquire().map_err(|e| {
            log::error!("viewer: failed to get available port for {kind} viewer: {e}");
            ViewerError::Port(e)
        })?;

        let mut child = Command::new(&self.program)
            .args(self.command_args(port, artifact_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                log::error!("viewer: failed to open {kind} profiles with {}: {e}", self.program);
                ViewerError::Spawn {
                    program: self.program.clone(),
                    reason: e.to_string(),
                }
            })?;

        log::info!("viewer: opening {kind} profiles at http://localhost:{port}");

        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(port)
    }
}
