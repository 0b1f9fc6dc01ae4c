/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Sequential local TCP port allocation.
//!
//! A [`PortAllocator`] hands out ports from a moving base. Each candidate is
//! probed by binding a listener and dropping it straight away; the first
//! candidate that binds is returned and the base moves past it, so the same
//! allocator never returns a port twice.
//!
//! The probe does not reserve anything across processes: another process can
//! still claim the port between the probe and the caller's own bind. Callers
//! treat a returned port as "very likely free", nothing stronger.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};

use parking_lot::Mutex;

/// Retry budget used by [`PortAllocator::new`].
pub const DEFAULT_MAX_ATTEMPTS: u16 = 20;

/// Host the probe binds on. Matches a viewer listening on `:<port>`.
pub const DEFAULT_PROBE_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortAllocError {
    /// Every candidate in `start..start + attempts` failed to bind.
    Exhausted { start: u32, attempts: u16 },
}

impl fmt::Display for PortAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { start, attempts } => write!(
                f,
                "no available ports found after {attempts} attempts starting from port {start}"
            ),
        }
    }
}

impl std::error::Error for PortAllocError {}

pub struct PortAllocator {
    /// Next candidate. Held as `u32` so it can move past `u16::MAX` once the
    /// last port has been handed out.
    base: Mutex<u32>,
    max_attempts: u16,
    probe_host: IpAddr,
}

impl PortAllocator {
    pub fn new(base_port: u16) -> Self {
        Self {
            base: Mutex::new(u32::from(base_port)),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            probe_host: DEFAULT_PROBE_HOST,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_probe_host(mut self, probe_host: IpAddr) -> Self {
        self.probe_host = probe_host;
        self
    }

    pub fn max_attempts(&self) -> u16 {
        self.max_attempts
    }

    /// Where the next search will start.
    pub fn next_base(&self) -> u32 {
        *self.base.lock()
    }

    /// Find and reserve the next bindable port.
    ///
    /// The lock is held for the whole scan, so two concurrent callers can
    /// never both verify and return the same candidate. On exhaustion the
    /// base is left where it was.
    pub fn acquire(&self) -> Result<u16, PortAllocError> {
        let mut base = self.base.lock();

        for attempt in 0..u32::from(self.max_attempts) {
            let Ok(candidate) = u16::try_from(*base + attempt) else {
                break;
            };
            // Port 0 asks the OS for an ephemeral port; never a real candidate.
            if candidate == 0 {
                continue;
            }
            if self.probe(candidate) {
                *base = u32::from(candidate) + 1;
                log::debug!("port_allocator: reserved port {candidate}");
                return Ok(candidate);
            }
        }

        let err = PortAllocError::Exhausted {
            start: *base,
            attempts: self.max_attempts,
        };
        log::warn!("port_allocator: {err}");
        Err(err)
    }

    fn probe(&self, port: u16) -> bool {
        match TcpListener::bind(SocketAddr::new(self.probe_host, port)) {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) => {
                log::trace!("port_allocator: port {port} unavailable ({e})");
                false
            }
        }
    }
}
