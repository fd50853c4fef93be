// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data directory resolution.

use std::path::PathBuf;

/// Return the scanner data directory, creating it if needed.
///
/// `BALLOTSCAN_DATA_DIR` wins; otherwise the XDG data home is used.
pub fn data_dir() -> PathBuf {
    let dir = match std::env::var_os("BALLOTSCAN_DATA_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => dirs_fallback().join("ballotscan"),
    };
    std::fs::create_dir_all(&dir).ok();
    dir
}

fn dirs_fallback() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    // Last resort
    PathBuf::from("/tmp")
}
