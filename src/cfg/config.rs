// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{DebugLevel, LogOutput, RotationFreq};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Hostname advertised inside generated object URLs. Empty means the
    /// runtime falls back to `127.0.0.1` for plain transports; secure
    /// transports refuse to activate without a real hostname.
    pub hostname: String,
    /// Listener ports; a port of 0 disables the corresponding transport.
    pub listen: Listen,
    /// Per-runtime resource caps.
    pub limits: Limits,
    /// Shared-memory transport settings.
    pub shm: Shm,
    /// TLS material for wss/quic endpoint configuration.
    pub tls: Tls,
    /// Diagnostics verbosity.
    pub debug_level: DebugLevel,
    /// Optional logger setup consumed by [`crate::cfg::logger::init_logger`].
    pub log: Option<LogConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct Listen {
    /// TCP listener port (0 disables).
    pub tcp_port: u16,
    /// HTTP/WebSocket listener port (0 disables).
    pub http_port: u16,
    /// UDP listener port (0 disables).
    pub udp_port: u16,
    /// QUIC listener port (0 disables). Only endpoint generation is
    /// affected; no QUIC transport is started.
    pub quic_port: u16,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", default)]
pub struct Limits {
    /// Default slot count for POAs built without an explicit size.
    pub max_poa_objects: u32,
    /// Upper bound on servant references a single peer session may hold.
    pub max_references_per_session: usize,
    /// Per-call timeout applied when the caller does not pass one.
    #[serde(with = "serde_millis")]
    pub default_call_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_poa_objects: 1024,
            max_references_per_session: 1000,
            default_call_timeout: Duration::from_millis(2500),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", default)]
pub struct Shm {
    /// Well-known listener name. `None` disables the shared-memory
    /// listener; objects then cannot be activated with `ALLOW_SHARED_MEMORY`.
    pub listener_name: Option<String>,
    /// Capacity of each per-channel ring in bytes.
    pub ring_capacity: usize,
}

impl Default for Shm {
    fn default() -> Self {
        Self {
            listener_name: None,
            ring_capacity: 64 * 1024,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct Tls {
    pub cert_file: String,
    pub key_file: String,
    pub dhparams_file: String,
    /// Disables client-side certificate verification. Test-only.
    pub client_disable_verification: bool,
    /// Trust anchor for development setups with self-signed certificates.
    pub client_self_signed_cert_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. "info" or "nprpc=debug".
    pub level: String,
    pub output: LogOutput,
    pub is_show_line: bool,
    pub is_show_module_path: bool,
    pub is_show_target: bool,
    pub file: Option<LogFileConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct LogFileConfig {
    pub path: String,
    #[serde(default)]
    pub rotation_frequency: Option<RotationFreq>,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        if self.listen.quic_port != 0 {
            ensure!(
                !self.tls.cert_file.is_empty() && !self.tls.key_file.is_empty(),
                "QUIC listener requires tls.cert-file and tls.key-file"
            );
        }

        ensure!(
            self.limits.max_poa_objects >= 1,
            "max-poa-objects must be >= 1"
        );
        ensure!(
            self.limits.max_references_per_session >= 1,
            "max-references-per-session must be >= 1"
        );

        if let Some(name) = &self.shm.listener_name {
            ensure!(!name.is_empty(), "shm.listener-name must not be empty");
            ensure!(
                !name.contains('/') && !name.contains('\0'),
                "shm.listener-name must not contain '/' or NUL"
            );
            // One page of overhead plus room for at least one full record.
            ensure!(
                self.shm.ring_capacity >= 4096,
                "shm.ring-capacity must be at least 4096 bytes"
            );
        }

        Ok(())
    }

    /// Advertised host for plain (non-TLS) transports.
    pub fn default_host(&self) -> &str {
        if self.hostname.is_empty() {
            "127.0.0.1"
        } else {
            &self.hostname
        }
    }
}

/// Serde helpers for representing `Duration` as milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
