/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Artifact naming: `<dir>/<kind>_<YYYY-MM-DD_HH-MM-SS>.prof`.

use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use time::macros::format_description;

use crate::prefs::SnapshotKind;

pub const ARTIFACT_EXTENSION: &str = "prof";

/// Wall-clock capture stamp in local time, or UTC when the local offset
/// cannot be determined.
pub fn capture_timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format_timestamp(now)
}

pub fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(format_description!(
        "[year]-[month]-[day]_[hour]-[minute]-[second]"
    ))
    .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Destination for a capture stamped `stamp`.
///
/// Stamps have one-second resolution, so a second capture within the same
/// second gets a zero-padded `_<nnnn>` suffix instead of overwriting the
/// first. Suffixed names sort after the unsuffixed one and among themselves
/// in creation order.
pub fn artifact_path(dir: &Path, kind: SnapshotKind, stamp: &str) -> PathBuf {
    let base = dir.join(format!("{kind}_{stamp}.{ARTIFACT_EXTENSION}"));
    if !base.exists() {
        return base;
    }
    let mut n = 1_u32;
    loop {
        let candidate = dir.join(format!("{kind}_{stamp}_{n:04}.{ARTIFACT_EXTENSION}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Glob covering every artifact in `dir`, as passed to the viewer.
pub fn artifact_glob(dir: &Path) -> String {
    dir.join("*").display().to_string()
}
