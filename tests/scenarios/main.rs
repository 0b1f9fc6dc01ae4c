use std::fs;
use std::path::Path;
use std::time::Duration;

use pprof_harvest::VERSION;
use pprof_harvest::prefs::{RunConfig, SamplingSpec, SnapshotKind, ViewerSettings};
use pprof_harvest::runtime::control_panel::{ControlPanel, SamplerOutcome};
use pprof_harvest::test_utils::StubDiagnosticServer;
use tempfile::TempDir;

fn config_for(server: &StubDiagnosticServer, dir: &TempDir) -> RunConfig {
    RunConfig {
        diagnostic_port: server.port(),
        output_dir: dir.path().join("profiles"),
        grace_period: Duration::ZERO,
        heap: Some(SamplingSpec::heap(Duration::ZERO, 2).with_viewer(false)),
        cpu: Some(SamplingSpec::cpu(Duration::from_secs(1), 1).with_viewer(false)),
        ..RunConfig::default()
    }
}

fn artifact_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("artifact directory")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn by_kind(mut outcomes: Vec<SamplerOutcome>) -> Vec<SamplerOutcome> {
    outcomes.sort_by_key(|(kind, _)| *kind);
    outcomes
}

#[test]
fn scenarios_binary_smoke_runs() {
    assert!(!VERSION.is_empty());
}

#[tokio::test]
async fn samples_live_endpoint_into_kind_directories() {
    let server = StubDiagnosticServer::start(vec![0x42; 100]);
    let dir = TempDir::new().expect("tempdir");
    let config = config_for(&server, &dir);
    let heap_dir = config.kind_dir(SnapshotKind::Heap);
    let cpu_dir = config.kind_dir(SnapshotKind::Cpu);

    let mut panel = ControlPanel::start(config).expect("panel starts");
    let outcomes = by_kind(panel.join_samplers().await);

    assert_eq!(outcomes.len(), 2);
    let heap_names = artifact_names(&heap_dir);
    let cpu_names = artifact_names(&cpu_dir);
    assert_eq!(heap_names.len(), 2);
    assert_eq!(cpu_names.len(), 1);
    assert!(heap_names.iter().all(|name| name.starts_with("heap_") && name.ends_with(".prof")));
    assert!(cpu_names.iter().all(|name| name.starts_with("cpu_") && name.ends_with(".prof")));
    for name in &heap_names {
        assert_eq!(fs::read(heap_dir.join(name)).expect("artifact").len(), 100);
    }

    let requests = server.requests();
    assert_eq!(
        requests.iter().filter(|path| *path == "/debug/pprof/heap").count(),
        2
    );
    assert!(requests.contains(&"/debug/pprof/profile?seconds=1".to_string()));
}

#[tokio::test]
async fn unreachable_endpoint_still_completes_every_loop() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let dir = TempDir::new().expect("tempdir");
    let config = RunConfig {
        diagnostic_port: port,
        output_dir: dir.path().join("profiles"),
        grace_period: Duration::ZERO,
        heap: Some(SamplingSpec::heap(Duration::ZERO, 3).with_viewer(false)),
        cpu: None,
        ..RunConfig::default()
    };
    let heap_dir = config.kind_dir(SnapshotKind::Heap);

    let mut panel = ControlPanel::start(config).expect("panel starts");
    let outcomes = panel.join_samplers().await;

    let (_, result) = &outcomes[0];
    let report = result.as_ref().expect("loop ran");
    assert_eq!(report.skipped, 3);
    assert!(report.saved.is_empty());
    assert!(artifact_names(&heap_dir).is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn concurrent_viewer_launches_use_distinct_ports() {
    let server = StubDiagnosticServer::start(vec![1; 10]);
    let dir = TempDir::new().expect("tempdir");
    let base_port = {
        let listener = std::net::TcpListener::bind("0.0.0.0:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let mut config = config_for(&server, &dir);
    config.set_open_viewers(true);
    config.viewer = ViewerSettings {
        program: "true".to_string(),
        leading_args: Vec::new(),
        base_port,
        max_attempts: 64,
    };

    let mut panel = ControlPanel::start(config).expect("panel starts");
    let outcomes = by_kind(panel.join_samplers().await);

    let ports: Vec<u16> = outcomes
        .iter()
        .map(|(_, result)| {
            result
                .as_ref()
                .expect("loop ran")
                .viewer_port
                .expect("viewer launched")
        })
        .collect();
    assert_eq!(ports.len(), 2);
    assert_ne!(ports[0], ports[1]);
    assert!(ports.iter().all(|port| *port >= base_port));
}
