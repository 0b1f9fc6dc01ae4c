/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Periodic snapshot collection for one snapshot kind.
//!
//! A sampler creates its artifact directory, waits the grace period once,
//! then runs `sample_count` strictly sequential slots. A failed slot is
//! logged and skipped; nothing but a directory failure ends the loop early.
//! When the loop is done the viewer is launched if `open_viewer` is set.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::prefs::{RunConfig, SamplingSpec, SnapshotKind};
use crate::runtime::viewer::ViewerLauncher;
use crate::services::artifacts::{artifact_path, capture_timestamp};
use crate::services::snapshot_source::{SampleError, SnapshotSource};

#[derive(Debug)]
pub enum SamplerError {
    DirectoryCreate { path: PathBuf, reason: String },
}

impl fmt::Display for SamplerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectoryCreate { path, reason } => {
                write!(f, "failed to create profile directory {}: {reason}", path.display())
            }
        }
    }
}

impl std::error::Error for SamplerError {}

/// What one finished loop produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerReport {
    pub kind: SnapshotKind,
    /// Artifacts in capture order.
    pub saved: Vec<PathBuf>,
    pub skipped: u32,
    pub viewer_port: Option<u16>,
}

pub struct SnapshotSampler<S> {
    config: Arc<RunConfig>,
    spec: SamplingSpec,
    source: Arc<S>,
    viewer: Arc<ViewerLauncher>,
}

impl<S: SnapshotSource> SnapshotSampler<S> {
    pub fn new(
        config: Arc<RunConfig>,
        spec: SamplingSpec,
        source: Arc<S>,
        viewer: Arc<ViewerLauncher>,
    ) -> Self {
        Self {
            config,
            spec,
            source,
            viewer,
        }
    }

    pub fn kind(&self) -> SnapshotKind {
        self.spec.kind
    }

    pub async fn run(self) -> Result<SamplerReport, SamplerError> {
        let kind = self.spec.kind;
        let dir = self.config.kind_dir(kind);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            log::error!(
                "sampler: failed to create {kind} profile directory {}: {e}",
                dir.display()
            );
            return Err(SamplerError::DirectoryCreate {
                path: dir,
                reason: e.to_string(),
            });
        }

        tokio::time::sleep(self.config.grace_period).await;

        let mut report = SamplerReport {
            kind,
            saved: Vec::new(),
            skipped: 0,
            viewer_port: None,
        };
        let count = self.spec.sample_count;

        for slot in 0..count {
            let captured = match self.capture(&dir).await {
                Ok(path) => {
                    log::info!("sampler: saved {kind} profile to {}", path.display());
                    report.saved.push(path);
                    true
                }
                Err(e) => {
                    log::error!("sampler: {kind} sample {}/{count} skipped: {e}", slot + 1);
                    report.skipped += 1;
                    false
                }
            };

            let pause = self.spec.pause_after(captured);
            if slot + 1 < count && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        log::info!(
            "sampler: {kind} sampling finished ({} saved, {} skipped)",
            report.saved.len(),
            report.skipped
        );

        if self.spec.open_viewer {
            // Failures are already logged by the launcher.
            report.viewer_port = self.viewer.launch(&dir, kind).ok();
        }
        Ok(report)
    }

    async fn capture(&self, dir: &Path) -> Result<PathBuf, SampleError> {
        let stamp = capture_timestamp();
        let payload = self.source.fetch(&self.spec).await?;
        let path = artifact_path(dir, self.spec.kind, &stamp);
        tokio::fs::write(&path, &payload)
            .await
            .map_err(|e| SampleError::Write {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::ViewerSettings;
    use crate::test_utils::ScriptedSource;
    use port_allocator::PortAllocator;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir, grace: Duration) -> Arc<RunConfig> {
        Arc::new(RunConfig {
            output_dir: dir.path().to_path_buf(),
            grace_period: grace,
            ..RunConfig::default()
        })
    }

    fn viewer(program: &str) -> Arc<ViewerLauncher> {
        let base = {
            let listener = std::net::TcpListener::bind("0.0.0.0:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let settings = ViewerSettings {
            program: program.to_string(),
            leading_args: Vec::new(),
            ..ViewerSettings::default()
        };
        Arc::new(ViewerLauncher::new(
            Arc::new(PortAllocator::new(base).with_max_attempts(64)),
            &settings,
        ))
    }

    fn artifact_sizes(dir: &Path) -> Vec<u64> {
        let mut entries: Vec<_> = fs::read_dir(dir)
            .expect("artifact dir")
            .map(|entry| entry.expect("entry").path())
            .collect();
        entries.sort();
        entries
            .iter()
            .map(|path| fs::metadata(path).expect("metadata").len())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_endpoint_yields_one_artifact_per_slot() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir, Duration::from_secs(1));
        let source = Arc::new(ScriptedSource::healthy(vec![0xAB; 100]));
        let spec = SamplingSpec::heap(Duration::from_secs(10), 3).with_viewer(false);

        let report = SnapshotSampler::new(config.clone(), spec, source.clone(), viewer("true"))
            .run()
            .await
            .expect("directory is writable");

        assert_eq!(report.saved.len(), 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.viewer_port, None);
        assert_eq!(artifact_sizes(&config.kind_dir(SnapshotKind::Heap)), vec![100; 3]);

        let mut sorted = report.saved.clone();
        sorted.sort();
        assert_eq!(sorted, report.saved, "file names follow capture order");
    }

    #[tokio::test(start_paused = true)]
    async fn heap_slots_are_an_interval_apart() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir, Duration::from_secs(1));
        let source = Arc::new(ScriptedSource::healthy(vec![1; 8]));
        let spec = SamplingSpec::heap(Duration::from_secs(10), 3).with_viewer(false);

        let started = tokio::time::Instant::now();
        SnapshotSampler::new(config, spec, source.clone(), viewer("true"))
            .run()
            .await
            .expect("run");

        let times = source.call_times(SnapshotKind::Heap);
        assert_eq!(times.len(), 3);
        assert!(times[0] - started >= Duration::from_secs(1), "grace period first");
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_slots_are_skipped_not_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir, Duration::ZERO);
        let source = Arc::new(ScriptedSource::with_failures(vec![2; 16], |n| n % 2 == 1));
        let spec = SamplingSpec::heap(Duration::from_secs(1), 5).with_viewer(false);

        let report = SnapshotSampler::new(config.clone(), spec, source.clone(), viewer("true"))
            .run()
            .await
            .expect("run");

        assert_eq!(source.call_count(), 5);
        assert_eq!(report.saved.len(), 3);
        assert_eq!(report.skipped, 2);
        assert_eq!(artifact_sizes(&config.kind_dir(SnapshotKind::Heap)).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cpu_waits_only_after_failed_slots() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir, Duration::ZERO);
        // Calls 0 and 2 succeed, call 1 fails.
        let source = Arc::new(ScriptedSource::with_failures(vec![3; 4], |n| n == 1));
        let spec = SamplingSpec::cpu(Duration::from_secs(30), 3).with_viewer(false);

        let report = SnapshotSampler::new(config, spec, source.clone(), viewer("true"))
            .run()
            .await
            .expect("run");

        let times = source.call_times(SnapshotKind::Cpu);
        assert_eq!(times.len(), 3);
        assert!(times[1] - times[0] < Duration::from_secs(1), "no wait after success");
        assert!(times[2] - times[1] >= Duration::from_secs(30), "failure is paced");
        assert_eq!(report.saved.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_bodies_write_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir, Duration::ZERO);
        let source = Arc::new(
            ScriptedSource::with_failures(vec![7; 8], |n| n < 2)
                .failing_with(SampleError::Read("connection reset".to_string())),
        );
        let spec = SamplingSpec::heap(Duration::from_secs(5), 3).with_viewer(false);

        let report = SnapshotSampler::new(config.clone(), spec, source.clone(), viewer("true"))
            .run()
            .await
            .expect("run");

        assert_eq!(source.call_count(), 3);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.saved.len(), 1);
        assert_eq!(artifact_sizes(&config.kind_dir(SnapshotKind::Heap)), vec![8]);
    }

    /// Removes the artifact directory during the first fetch and restores it
    /// during the second, so exactly the first write fails.
    struct VanishingDirSource {
        dir: PathBuf,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl SnapshotSource for VanishingDirSource {
        async fn fetch(&self, _spec: &SamplingSpec) -> Result<Vec<u8>, SampleError> {
            match self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) {
                0 => fs::remove_dir_all(&self.dir).expect("remove artifact dir"),
                1 => fs::create_dir_all(&self.dir).expect("restore artifact dir"),
                _ => {}
            }
            Ok(vec![8; 16])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_is_skipped_and_loop_continues() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir, Duration::ZERO);
        let source = Arc::new(VanishingDirSource {
            dir: config.kind_dir(SnapshotKind::Heap),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let spec = SamplingSpec::heap(Duration::from_secs(5), 3).with_viewer(false);

        let report = SnapshotSampler::new(config.clone(), spec, source.clone(), viewer("true"))
            .run()
            .await
            .expect("run");

        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.saved.len(), 2);
        assert_eq!(artifact_sizes(&config.kind_dir(SnapshotKind::Heap)), vec![16; 2]);
    }

    #[tokio::test]
    async fn directory_failure_aborts_only_this_loop() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir, Duration::ZERO);
        // A regular file where the heap directory should go.
        fs::write(config.kind_dir(SnapshotKind::Heap), b"in the way").expect("blocker");
        let source = Arc::new(ScriptedSource::healthy(vec![4; 4]));

        let err = SnapshotSampler::new(
            config,
            SamplingSpec::heap(Duration::ZERO, 2).with_viewer(false),
            source.clone(),
            viewer("true"),
        )
        .run()
        .await
        .expect_err("heap dir cannot be created");

        assert!(matches!(err, SamplerError::DirectoryCreate { .. }));
        assert_eq!(source.call_count(), 0);
    }

    #[tokio::test]
    async fn zero_samples_still_finishes() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir, Duration::ZERO);
        let source = Arc::new(ScriptedSource::healthy(Vec::new()));

        let report = SnapshotSampler::new(
            config,
            SamplingSpec::cpu(Duration::from_secs(1), 0).with_viewer(false),
            source.clone(),
            viewer("true"),
        )
        .run()
        .await
        .expect("run");

        assert!(report.saved.is_empty());
        assert_eq!(source.call_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn finished_loop_launches_viewer() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir, Duration::ZERO);
        let source = Arc::new(ScriptedSource::healthy(vec![5; 4]));

        let report = SnapshotSampler::new(
            config,
            SamplingSpec::heap(Duration::ZERO, 1),
            source,
            viewer("true"),
        )
        .run()
        .await
        .expect("run");

        assert!(report.viewer_port.is_some());
    }

    #[tokio::test]
    async fn viewer_failure_keeps_collected_artifacts() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir, Duration::ZERO);
        let source = Arc::new(ScriptedSource::healthy(vec![6; 4]));

        let report = SnapshotSampler::new(
            config,
            SamplingSpec::heap(Duration::ZERO, 2),
            source,
            viewer("pprof-harvest-no-such-viewer"),
        )
        .run()
        .await
        .expect("run");

        assert_eq!(report.saved.len(), 2);
        assert_eq!(report.viewer_port, None);
    }
}
