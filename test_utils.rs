/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Fakes shared by unit tests and the scenario binary.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::time::Instant;

use crate::prefs::{SamplingSpec, SnapshotKind};
use crate::services::snapshot_source::{SampleError, SnapshotSource};

/// Minimal HTTP/1.1 server standing in for a process's diagnostic endpoint.
///
/// `GET /debug/pprof/heap` and `GET /debug/pprof/profile` answer with the
/// configured payload right away; every other path is a 404. Each request
/// path (with query) is recorded.
pub struct StubDiagnosticServer {
    port: u16,
    requests: Arc<Mutex<Vec<String>>>,
    stop: Arc<AtomicBool>,
}

impl StubDiagnosticServer {
    pub fn start(payload: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub diagnostic server");
        let port = listener.local_addr().expect("stub addr").port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let requests_for_thread = Arc::clone(&requests);
        let stop_for_thread = Arc::clone(&stop);
        thread::spawn(move || {
            for stream in listener.incoming() {
                if stop_for_thread.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(mut stream) = stream else {
                    continue;
                };
                let Some(target) = read_request_target(&mut stream) else {
                    continue;
                };
                requests_for_thread
                    .lock()
                    .expect("stub request log")
                    .push(target.clone());

                let path = target.split('?').next().unwrap_or_default();
                let found = path == "/debug/pprof/heap" || path == "/debug/pprof/profile";
                let _ = if found {
                    write_response(&mut stream, 200, "OK", &payload)
                } else {
                    write_response(&mut stream, 404, "Not Found", b"")
                };
                let _ = stream.shutdown(Shutdown::Both);
            }
        });

        Self {
            port,
            requests,
            stop,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("stub request log").clone()
    }
}

impl Drop for StubDiagnosticServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop so it sees the flag.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
    }
}

fn read_request_target(stream: &mut TcpStream) -> Option<String> {
    let mut buf = [0_u8; 1024];
    let mut request = Vec::new();
    loop {
        let read = stream.read(&mut buf).ok()?;
        if read == 0 {
            break;
        }
        request.extend_from_slice(&buf[..read]);
        if request.windows(4).any(|window| window == b"\r\n\r\n") || request.len() > 64 * 1024 {
            break;
        }
    }
    let head = String::from_utf8_lossy(&request);
    let request_line = head.lines().next()?;
    request_line.split_whitespace().nth(1).map(str::to_string)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &[u8],
) -> std::io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    stream.write_all(body)?;
    stream.flush()
}

/// In-process [`SnapshotSource`] with a scripted failure pattern.
pub struct ScriptedSource {
    payload: Vec<u8>,
    fails: fn(usize) -> bool,
    failure: SampleError,
    calls: Mutex<Vec<(SnapshotKind, Instant)>>,
}

impl ScriptedSource {
    pub fn healthy(payload: Vec<u8>) -> Self {
        Self::with_failures(payload, |_| false)
    }

    /// `fails(n)` decides whether the n-th call (zero based) fails.
    pub fn with_failures(payload: Vec<u8>, fails: fn(usize) -> bool) -> Self {
        Self {
            payload,
            fails,
            failure: SampleError::Unreachable("connection refused".to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Error returned by failing calls. Defaults to `Unreachable`.
    pub fn failing_with(mut self, failure: SampleError) -> Self {
        self.failure = failure;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("scripted call log").len()
    }

    /// Tokio-clock instants of each call for `kind`.
    pub fn call_times(&self, kind: SnapshotKind) -> Vec<Instant> {
        self.calls
            .lock()
            .expect("scripted call log")
            .iter()
            .filter(|(call_kind, _)| *call_kind == kind)
            .map(|(_, at)| *at)
            .collect()
    }
}

impl SnapshotSource for ScriptedSource {
    async fn fetch(&self, spec: &SamplingSpec) -> Result<Vec<u8>, SampleError> {
        let index = {
            let mut calls = self.calls.lock().expect("scripted call log");
            calls.push((spec.kind, Instant::now()));
            calls.len() - 1
        };
        if (self.fails)(index) {
            return Err(self.failure.clone());
        }
        Ok(self.payload.clone())
    }
}
