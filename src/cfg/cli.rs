// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolves a config path relative to the current working directory.
///
/// An absolute path in the `NPRPC_CONFIG` environment variable takes
/// precedence so test runs can point the whole suite at one file.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = match std::env::var("NPRPC_CONFIG") {
        Ok(over) if !over.is_empty() => PathBuf::from(over),
        _ => Path::new(rel).to_path_buf(),
    };

    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}
