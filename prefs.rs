/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Run configuration: built-in defaults, an optional TOML file, and command
//! line flags, merged in that order. A [`RunConfig`] is frozen before any
//! sampler starts and only ever read afterwards.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bpaf::Bpaf;
use serde::Deserialize;

use crate::services::artifacts::capture_timestamp;

pub const DEFAULT_DIAGNOSTIC_PORT: u16 = 6060;
pub const DEFAULT_DIAGNOSTIC_PATH: &str = "/debug/pprof";
pub const DEFAULT_OUTPUT_ROOT: &str = "profile";
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 100;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_HEAP_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CPU_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_SAMPLE_COUNT: u32 = 10;
pub const DEFAULT_VIEWER_BASE_PORT: u16 = 21000;
pub const DEFAULT_VIEWER_PROGRAM: &str = "go";
pub const DEFAULT_VIEWER_ARGS: [&str; 2] = ["tool", "pprof"];

/// Heap snapshots are taken on demand, so the request should be quick.
const HEAP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Added on top of the CPU capture window so the client never gives up
/// before the server has finished capturing.
const CPU_REQUEST_HEADROOM: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SnapshotKind {
    Heap,
    Cpu,
}

impl SnapshotKind {
    /// Subdirectory and file-name prefix for this kind's artifacts.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Heap => "heap",
            Self::Cpu => "cpu",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// How one kind is sampled.
///
/// `timing` is the inter-sample interval for heap snapshots and the
/// server-side capture window for CPU snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingSpec {
    pub kind: SnapshotKind,
    pub sample_count: u32,
    pub timing: Duration,
    pub open_viewer: bool,
}

impl SamplingSpec {
    pub fn heap(interval: Duration, sample_count: u32) -> Self {
        Self {
            kind: SnapshotKind::Heap,
            sample_count,
            timing: interval,
            open_viewer: true,
        }
    }

    pub fn cpu(duration: Duration, sample_count: u32) -> Self {
        Self {
            kind: SnapshotKind::Cpu,
            sample_count,
            timing: duration,
            open_viewer: true,
        }
    }

    pub fn with_viewer(mut self, open_viewer: bool) -> Self {
        self.open_viewer = open_viewer;
        self
    }

    /// Client deadline for one snapshot request.
    pub fn client_timeout(&self) -> Duration {
        match self.kind {
            SnapshotKind::Heap => HEAP_REQUEST_TIMEOUT,
            SnapshotKind::Cpu => self.timing + CPU_REQUEST_HEADROOM,
        }
    }

    /// Wait before the next slot.
    ///
    /// Every slot costs the same wall time whether or not it produced an
    /// artifact: a successful CPU capture already spent `timing` on the
    /// server, so only a failed one waits here.
    pub fn pause_after(&self, captured: bool) -> Duration {
        match (self.kind, captured) {
            (SnapshotKind::Heap, _) => self.timing,
            (SnapshotKind::Cpu, true) => Duration::ZERO,
            (SnapshotKind::Cpu, false) => self.timing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerSettings {
    pub program: String,
    /// Arguments placed before the port flag and the artifact glob.
    pub leading_args: Vec<String>,
    pub base_port: u16,
    pub max_attempts: u16,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_VIEWER_PROGRAM.to_string(),
            leading_args: DEFAULT_VIEWER_ARGS.iter().map(|arg| arg.to_string()).collect(),
            base_port: DEFAULT_VIEWER_BASE_PORT,
            max_attempts: port_allocator::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Port of the diagnostic HTTP server on localhost.
    pub diagnostic_port: u16,
    /// Path prefix the heap and profile endpoints live under.
    pub diagnostic_path: String,
    pub output_dir: PathBuf,
    /// CPU sampling rate handed to an embedded diagnostic server.
    pub sample_rate_hz: u32,
    /// Delay before the first sample of every kind.
    pub grace_period: Duration,
    pub viewer: ViewerSettings,
    pub heap: Option<SamplingSpec>,
    pub cpu: Option<SamplingSpec>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            diagnostic_port: DEFAULT_DIAGNOSTIC_PORT,
            diagnostic_path: DEFAULT_DIAGNOSTIC_PATH.to_string(),
            output_dir: default_output_dir(),
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            grace_period: DEFAULT_GRACE_PERIOD,
            viewer: ViewerSettings::default(),
            heap: Some(SamplingSpec::heap(DEFAULT_HEAP_INTERVAL, DEFAULT_SAMPLE_COUNT)),
            cpu: Some(SamplingSpec::cpu(DEFAULT_CPU_DURATION, DEFAULT_SAMPLE_COUNT)),
        }
    }
}

impl RunConfig {
    /// Enabled sampling specs, heap first.
    pub fn samplers(&self) -> impl Iterator<Item = &SamplingSpec> {
        self.heap.iter().chain(self.cpu.iter())
    }

    pub fn kind_dir(&self, kind: SnapshotKind) -> PathBuf {
        self.output_dir.join(kind.dir_name())
    }

    pub fn set_open_viewers(&mut self, open_viewer: bool) {
        for spec in self.heap.iter_mut().chain(self.cpu.iter_mut()) {
            spec.open_viewer = open_viewer;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.diagnostic_port == 0 {
            return Err(ConfigError::Invalid("diagnostic port must be non-zero".to_string()));
        }
        if self.viewer.base_port == 0 {
            return Err(ConfigError::Invalid("viewer base port must be non-zero".to_string()));
        }
        if self.viewer.program.trim().is_empty() {
            return Err(ConfigError::Invalid("viewer program must not be empty".to_string()));
        }
        if let Some(cpu) = &self.cpu {
            if cpu.timing < Duration::from_secs(1) {
                return Err(ConfigError::Invalid(
                    "cpu capture duration must be at least one second".to_string(),
                ));
            }
        }
        if self.samplers().next().is_none() {
            return Err(ConfigError::Invalid(
                "no snapshot kind enabled; keep heap or cpu sampling on".to_string(),
            ));
        }
        Ok(())
    }

    /// Layer a config file and command line flags over the defaults.
    pub fn from_sources(file: FileConfig, cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        file.apply(&mut config);
        cli.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}

/// `profile/profiles_<timestamp>` relative to the working directory.
pub fn default_output_dir() -> PathBuf {
    Path::new(DEFAULT_OUTPUT_ROOT).join(format!("profiles_{}", capture_timestamp()))
}

#[derive(Debug)]
pub enum ConfigError {
    Read { path: PathBuf, reason: String },
    Parse { path: PathBuf, reason: String },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, reason } => {
                write!(f, "failed to read config {}: {reason}", path.display())
            }
            Self::Parse { path, reason } => {
                write!(f, "failed to parse config {}: {reason}", path.display())
            }
            Self::Invalid(reason) => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ===== Config file =====

/// On-disk TOML shape. Every key is optional; missing keys keep defaults.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub diagnostic_path: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub rate: Option<u32>,
    pub grace_period_secs: Option<u64>,
    pub open_viewers: Option<bool>,
    pub heap: Option<FileHeapConfig>,
    pub cpu: Option<FileCpuConfig>,
    pub viewer: Option<FileViewerConfig>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileHeapConfig {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub samples: Option<u32>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileCpuConfig {
    pub enabled: Option<bool>,
    pub duration_secs: Option<u64>,
    pub samples: Option<u32>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileViewerConfig {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub base_port: Option<u16>,
    pub max_attempts: Option<u16>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn apply(self, config: &mut RunConfig) {
        if let Some(port) = self.port {
            config.diagnostic_port = port;
        }
        if let Some(path) = self.diagnostic_path {
            config.diagnostic_path = path;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(rate) = self.rate.filter(|rate| *rate > 0) {
            config.sample_rate_hz = rate;
        }
        if let Some(secs) = self.grace_period_secs {
            config.grace_period = Duration::from_secs(secs);
        }

        if let Some(heap) = self.heap {
            if heap.enabled == Some(false) {
                config.heap = None;
            } else if let Some(spec) = config.heap.as_mut() {
                if let Some(secs) = heap.interval_secs {
                    spec.timing = Duration::from_secs(secs);
                }
                if let Some(samples) = heap.samples {
                    spec.sample_count = samples;
                }
            }
        }
        if let Some(cpu) = self.cpu {
            if cpu.enabled == Some(false) {
                config.cpu = None;
            } else if let Some(spec) = config.cpu.as_mut() {
                if let Some(secs) = cpu.duration_secs {
                    spec.timing = Duration::from_secs(secs);
                }
                if let Some(samples) = cpu.samples {
                    spec.sample_count = samples;
                }
            }
        }

        if let Some(viewer) = self.viewer {
            if let Some(program) = viewer.program {
                config.viewer.program = program;
            }
            if let Some(args) = viewer.args {
                config.viewer.leading_args = args;
            }
            if let Some(port) = viewer.base_port {
                config.viewer.base_port = port;
            }
            if let Some(attempts) = viewer.max_attempts {
                config.viewer.max_attempts = attempts;
            }
        }
        if let Some(open) = self.open_viewers {
            config.set_open_viewers(open);
        }
    }
}

// ===== Command line =====

/// Capture heap and CPU profiles from a local diagnostic endpoint.
#[derive(Debug, Clone, Default, Bpaf)]
#[bpaf(options, version)]
pub struct CliArgs {
    /// TOML config file; flags override its values
    #[bpaf(long, short('c'), argument("PATH"))]
    pub config: Option<PathBuf>,
    /// Port of the diagnostic HTTP server on localhost
    #[bpaf(long, short('p'), argument("PORT"))]
    pub port: Option<u16>,
    /// Directory that receives heap/ and cpu/ artifact folders
    #[bpaf(long, short('o'), argument("DIR"))]
    pub output_dir: Option<PathBuf>,
    /// CPU sampling rate in Hz handed to an embedded diagnostic server
    #[bpaf(long, argument("HZ"))]
    pub rate: Option<u32>,
    /// Seconds to wait before the first sample
    #[bpaf(long, argument("SECS"))]
    pub grace_secs: Option<u64>,
    /// Number of heap snapshots to take
    #[bpaf(long, argument("N"))]
    pub heap_samples: Option<u32>,
    /// Seconds between heap snapshots
    #[bpaf(long, argument("SECS"))]
    pub heap_interval_secs: Option<u64>,
    /// Number of CPU profiles to take
    #[bpaf(long, argument("N"))]
    pub cpu_samples: Option<u32>,
    /// Length of each CPU profile in seconds
    #[bpaf(long, argument("SECS"))]
    pub cpu_duration_secs: Option<u64>,
    /// Skip heap sampling
    #[bpaf(long, switch)]
    pub no_heap: bool,
    /// Skip CPU sampling
    #[bpaf(long, switch)]
    pub no_cpu: bool,
    /// Do not launch the profile viewer after sampling
    #[bpaf(long, switch)]
    pub no_viewer: bool,
    /// First port tried for viewer UIs
    #[bpaf(long, argument("PORT"))]
    pub viewer_base_port: Option<u16>,
    /// Log filter directive, e.g. `debug` or `pprof_harvest=trace`
    #[bpaf(long, argument("FILTER"))]
    pub log_filter: Option<String>,
}

impl CliArgs {
    fn apply(&self, config: &mut RunConfig) {
        if let Some(port) = self.port {
            config.diagnostic_port = port;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(rate) = self.rate.filter(|rate| *rate > 0) {
            config.sample_rate_hz = rate;
        }
        if let Some(secs) = self.grace_secs {
            config.grace_period = Duration::from_secs(secs);
        }
        if let Some(spec) = config.heap.as_mut() {
            if let Some(samples) = self.heap_samples {
                spec.sample_count = samples;
            }
            if let Some(secs) = self.heap_interval_secs {
                spec.timing = Duration::from_secs(secs);
            }
        }
        if let Some(spec) = config.cpu.as_mut() {
            if let Some(samples) = self.cpu_samples {
                spec.sample_count = samples;
            }
            if let Some(secs) = self.cpu_duration_secs {
                spec.timing = Duration::from_secs(secs);
            }
        }
        if self.no_heap {
            config.heap = None;
        }
        if self.no_cpu {
            config.cpu = None;
        }
        if self.no_viewer {
            config.set_open_viewers(false);
        }
        if let Some(port) = self.viewer_base_port {
            config.viewer.base_port = port;
        }
    }
}

pub enum ArgumentParsingResult {
    Run(CliArgs),
    Exit,
    ErrorParsing,
}

/// Parse process arguments (binary name already stripped). Help and version
/// output are printed here.
pub fn parse_command_line_arguments(args: &[String]) -> ArgumentParsingResult {
    let argv: Vec<&str> = args.iter().map(String::as_str).collect();
    match cli_args().run_inner(argv.as_slice()) {
        Ok(cli) => ArgumentParsingResult::Run(cli),
        Err(failure) => {
            failure.print_message(100);
            if failure.exit_code() == 0 {
                ArgumentParsingResult::Exit
            } else {
                ArgumentParsingResult::ErrorParsing
            }
        }
    }
}

/// Load the config file named on the command line, if any, and merge.
pub fn resolve_run_config(cli: &CliArgs) -> Result<RunConfig, ConfigError> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    RunConfig::from_sources(file, cli)
}
