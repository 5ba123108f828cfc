// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Runtime diagnostics verbosity.
///
/// `Quiet` suppresses everything below warnings, `Critical` adds error
/// reporting for failed dispatches, `InOut` traces session open/close and
/// listener lifecycle, `EveryCall` additionally dumps frame headers and is
/// only meant for debugging wire-level problems.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugLevel {
    #[serde(rename = "quiet", alias = "Quiet", alias = "QUIET")]
    Quiet,
    #[serde(rename = "critical", alias = "Critical")]
    Critical,
    #[serde(rename = "inout", alias = "InOut")]
    InOut,
    #[serde(rename = "everycall", alias = "EveryCall")]
    EveryCall,
}

impl Default for DebugLevel {
    fn default() -> Self {
        DebugLevel::Critical
    }
}

impl fmt::Display for DebugLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DebugLevel::Quiet => "quiet",
            DebugLevel::Critical => "critical",
            DebugLevel::InOut => "inout",
            DebugLevel::EveryCall => "everycall",
        })
    }
}

impl DebugLevel {
    /// Default `EnvFilter` directive for this level.
    pub fn as_filter(self) -> &'static str {
        match self {
            DebugLevel::Quiet => "warn",
            DebugLevel::Critical => "error,nprpc=warn",
            DebugLevel::InOut => "info",
            DebugLevel::EveryCall => "debug",
        }
    }

    #[inline]
    pub fn traces_every_call(self) -> bool {
        self >= DebugLevel::EveryCall
    }
}

/// Where the logger writes to.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    File,
}

/// Rotation policy for file logging.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum RotationFreq {
    Minutely,
    Hourly,
    Daily,
    Never,
}
