/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Control Panel: starts and supervises the sampling workers.
//!
//! One tokio task per enabled snapshot kind, plus an optional diagnostic
//! server task. Workers never coordinate with each other: a failure in one
//! kind's loop is logged inside that loop and does not reach the others.
//!
//! Sampler tasks live in a [`JoinSet`] so an entry point can wait for them
//! with [`ControlPanel::join_samplers`]. An embedding process that only wants
//! fire-and-forget behaviour calls [`ControlPanel::detach`] instead; dropping
//! the panel without detaching aborts the samplers.

use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use port_allocator::PortAllocator;
use tokio::task::JoinSet;

use crate::prefs::{ConfigError, RunConfig, SnapshotKind};
use crate::runtime::sampler::{SamplerError, SamplerReport, SnapshotSampler};
use crate::runtime::viewer::ViewerLauncher;
use crate::services::snapshot_source::{HttpSnapshotSource, SnapshotSource, SourceSetupError};

/// Result of one sampler task, tagged with its kind.
pub type SamplerOutcome = (SnapshotKind, Result<SamplerReport, SamplerError>);

/// A diagnostic HTTP server run inside the current process.
///
/// Given the address to listen on and the CPU sampling rate to apply. The
/// future runs for as long as the server is up.
pub trait DiagnosticServer: Send + 'static {
    fn serve(
        self,
        addr: SocketAddr,
        sample_rate_hz: u32,
    ) -> impl Future<Output = Result<(), String>> + Send;
}

#[derive(Debug)]
pub enum OrchestratorError {
    InvalidConfig(ConfigError),
    OutputDir { path: PathBuf, reason: String },
    HttpClient(SourceSetupError),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(e) => write!(f, "{e}"),
            Self::OutputDir { path, reason } => {
                write!(f, "failed to create profile directory {}: {reason}", path.display())
            }
            Self::HttpClient(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<ConfigError> for OrchestratorError {
    fn from(e: ConfigError) -> Self {
        Self::InvalidConfig(e)
    }
}

impl From<SourceSetupError> for OrchestratorError {
    fn from(e: SourceSetupError) -> Self {
        Self::HttpClient(e)
    }
}

pub struct ControlPanel {
    config: Arc<RunConfig>,
    /// Shared by every viewer launch for the life of the panel.
    viewer: Arc<ViewerLauncher>,
    workers: JoinSet<SamplerOutcome>,
}

impl ControlPanel {
    /// Validate `config` and set up the shared port allocator. Starts nothing.
    pub fn new(config: RunConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let ports = Arc::new(
            PortAllocator::new(config.viewer.base_port)
                .with_max_attempts(config.viewer.max_attempts),
        );
        let viewer = Arc::new(ViewerLauncher::new(ports, &config.viewer));
        Ok(Self {
            config: Arc::new(config),
            viewer,
            workers: JoinSet::new(),
        })
    }

    /// Attach to a diagnostic server that is already running on
    /// `localhost:<diagnostic_port>` and start sampling.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: RunConfig) -> Result<Self, OrchestratorError> {
        let mut panel = Self::new(config)?;
        panel.prepare_output_dir()?;
        let source = HttpSnapshotSource::new(
            panel.config.diagnostic_port,
            &panel.config.diagnostic_path,
        )?;
        panel.spawn_samplers(Arc::new(source));
        Ok(panel)
    }

    /// Start `server` in this process, then sample it like [`Self::start`].
    pub fn start_with_server<D: DiagnosticServer>(
        config: RunConfig,
        server: D,
    ) -> Result<Self, OrchestratorError> {
        let mut panel = Self::new(config)?;
        panel.prepare_output_dir()?;
        panel.spawn_diagnostic_server(server);
        let source = HttpSnapshotSource::new(
            panel.config.diagnostic_port,
            &panel.config.diagnostic_path,
        )?;
        panel.spawn_samplers(Arc::new(source));
        Ok(panel)
    }

    pub fn config(&self) -> &Arc<RunConfig> {
        &self.config
    }

    pub fn viewer(&self) -> &Arc<ViewerLauncher> {
        &self.viewer
    }

    /// Create the output root. Failure here aborts the whole start.
    pub fn prepare_output_dir(&self) -> Result<(), OrchestratorError> {
        let dir = &self.config.output_dir;
        std::fs::create_dir_all(dir).map_err(|e| {
            log::error!("control_panel: failed to create profile directory {}: {e}", dir.display());
            OrchestratorError::OutputDir {
                path: dir.clone(),
                reason: e.to_string(),
            }
        })?;
        log::info!("control_panel: writing profiles under {}", dir.display());
        Ok(())
    }

    /// Run `server` as a detached task. Its errors are logged, never joined.
    pub fn spawn_diagnostic_server<D: DiagnosticServer>(&self, server: D) {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.diagnostic_port));
        let rate = self.config.sample_rate_hz;
        log::info!("control_panel: starting diagnostic server on {addr}");
        tokio::spawn(async move {
            if let Err(e) = server.serve(addr, rate).await {
                log::error!("control_panel: diagnostic server error: {e}");
            }
        });
    }

    /// Spawn one sampler task per enabled kind, all reading from `source`.
    pub fn spawn_samplers<S: SnapshotSource>(&mut self, source: Arc<S>) {
        let specs: Vec<_> = self.config.samplers().cloned().collect();
        for spec in specs {
            let kind = spec.kind;
            let sampler = SnapshotSampler::new(
                Arc::clone(&self.config),
                spec,
                Arc::clone(&source),
                Arc::clone(&self.viewer),
            );
            self.workers.spawn(async move { (kind, sampler.run().await) });
            log::debug!("control_panel: {kind} sampler spawned");
        }
    }

    /// Number of sampler tasks not yet joined.
    pub fn sampler_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every sampler to finish, in completion order.
    ///
    /// A task that panicked is logged and left out of the result.
    pub async fn join_samplers(&mut self) -> Vec<SamplerOutcome> {
        let mut outcomes = Vec::with_capacity(self.workers.len());
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => log::error!("control_panel: sampler task failed: {e}"),
            }
        }
        outcomes
    }

    /// Let the samplers run to completion on their own.
    pub fn detach(mut self) {
        log::debug!("control_panel: detaching {} samplers", self.workers.len());
        self.workers.detach_all();
    }
}
