/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Fetching snapshot payloads from the diagnostic endpoint.
//!
//! Samplers only see the [`SnapshotSource`] trait; [`HttpSnapshotSource`] is
//! the production implementation and talks to `localhost:<port>`.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;

use reqwest::Client;
use url::Url;

use crate::prefs::{SamplingSpec, SnapshotKind};

/// Why a single sample slot produced no artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    /// The request could not be sent or timed out.
    Unreachable(String),
    HttpStatus(u16),
    /// The response arrived but its body could not be read in full.
    Read(String),
    Write { path: PathBuf, reason: String },
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable(e) => write!(f, "endpoint unreachable: {e}"),
            Self::HttpStatus(code) => write!(f, "endpoint answered with status {code}"),
            Self::Read(e) => write!(f, "failed to read profile data: {e}"),
            Self::Write { path, reason } => {
                write!(f, "failed to write profile to {}: {reason}", path.display())
            }
        }
    }
}

impl std::error::Error for SampleError {}

/// Why an [`HttpSnapshotSource`] could not be set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSetupError {
    InvalidEndpoint(String),
    ClientBuild(String),
}

impl fmt::Display for SourceSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEndpoint(e) => write!(f, "invalid diagnostic endpoint: {e}"),
            Self::ClientBuild(e) => write!(f, "failed to build http client: {e}"),
        }
    }
}

impl std::error::Error for SourceSetupError {}

/// Produces one opaque snapshot payload per call.
pub trait SnapshotSource: Send + Sync + 'static {
    fn fetch(&self, spec: &SamplingSpec) -> impl Future<Output = Result<Vec<u8>, SampleError>> + Send;
}

pub struct HttpSnapshotSource {
    client: Client,
    base: Url,
    path_prefix: String,
}

impl HttpSnapshotSource {
    /// The client ignores `HTTP_PROXY` and friends: the endpoint is always
    /// on this host.
    pub fn new(port: u16, path_prefix: &str) -> Result<Self, SourceSetupError> {
        let base = Url::parse(&format!("http://localhost:{port}/"))
            .map_err(|e| SourceSetupError::InvalidEndpoint(e.to_string()))?;
        let client = Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| SourceSetupError::ClientBuild(e.to_string()))?;
        Ok(Self {
            client,
            base,
            path_prefix: path_prefix.trim_end_matches('/').to_string(),
        })
    }

    /// `<prefix>/heap` or `<prefix>/profile?seconds=<N>`.
    pub fn request_url(&self, spec: &SamplingSpec) -> Url {
        let mut url = self.base.clone();
        match spec.kind {
            SnapshotKind::Heap => url.set_path(&format!("{}/heap", self.path_prefix)),
            SnapshotKind::Cpu => {
                url.set_path(&format!("{}/profile", self.path_prefix));
                url.query_pairs_mut()
                    .append_pair("seconds", &spec.timing.as_secs().to_string());
            }
        }
        url
    }
}

impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self, spec: &SamplingSpec) -> Result<Vec<u8>, SampleError> {
        let url = self.request_url(spec);
        log::debug!("snapshot_source: GET {url}");

        let response = self
            .client
            .get(url)
            .timeout(spec.client_timeout())
            .send()
            .await
            .map_err(|e| SampleError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SampleError::HttpStatus(status.as_u16()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| SampleError::Read(e.to_string()))?;
        Ok(body.to_vec())
    }
}
