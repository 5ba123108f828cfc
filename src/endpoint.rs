// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Endpoint URLs and the per-proxy endpoint selection algorithm.
//!
//! Object references carry a semicolon-separated URL list:
//!
//! ```text
//! urls := (url ";")+
//! url  := scheme "://" hostport-or-channel
//! scheme := "tcp" | "ws" | "wss" | "udp" | "quic" | "mem"
//! ```
//!
//! For `mem` the body is the shared-memory channel (listener) id; everything
//! else is `host:port`.

use core::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const TCP_PREFIX: &str = "tcp://";
pub const WS_PREFIX: &str = "ws://";
pub const WSS_PREFIX: &str = "wss://";
pub const UDP_PREFIX: &str = "udp://";
pub const QUIC_PREFIX: &str = "quic://";
pub const MEM_PREFIX: &str = "mem://";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("missing scheme separator in url: {0}")]
    MissingScheme(String),
    #[error("unknown scheme: {0}")]
    UnknownScheme(String),
    #[error("missing port in url: {0}")]
    MissingPort(String),
    #[error("invalid port in url: {0}")]
    InvalidPort(String),
    #[error("empty host in url: {0}")]
    EmptyHost(String),
}

/// A parsed endpoint. `TcpTethered` never appears in URL lists: it marks a
/// server-side session whose peer initiated the connection, so proxies
/// reusing it must ride that exact session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    TcpTethered { host: String, port: u16 },
    WebSocket { host: String, port: u16 },
    SecuredWebSocket { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Quic { host: String, port: u16 },
    SharedMemory { channel_id: String },
}

impl Endpoint {
    #[inline]
    pub fn is_shared_memory(&self) -> bool {
        matches!(self, Endpoint::SharedMemory { .. })
    }

    #[inline]
    pub fn is_tethered(&self) -> bool {
        matches!(self, Endpoint::TcpTethered { .. })
    }

    /// Hostname, or the channel id for shared memory.
    pub fn hostname(&self) -> &str {
        match self {
            Endpoint::Tcp { host, .. }
            | Endpoint::TcpTethered { host, .. }
            | Endpoint::WebSocket { host, .. }
            | Endpoint::SecuredWebSocket { host, .. }
            | Endpoint::Udp { host, .. }
            | Endpoint::Quic { host, .. } => host,
            Endpoint::SharedMemory { channel_id } => channel_id,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Tcp { port, .. }
            | Endpoint::TcpTethered { port, .. }
            | Endpoint::WebSocket { port, .. }
            | Endpoint::SecuredWebSocket { port, .. }
            | Endpoint::Udp { port, .. }
            | Endpoint::Quic { port, .. } => *port,
            Endpoint::SharedMemory { .. } => 0,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } | Endpoint::TcpTethered { host, port } => {
                write!(f, "{TCP_PREFIX}{host}:{port}")
            },
            Endpoint::WebSocket { host, port } => write!(f, "{WS_PREFIX}{host}:{port}"),
            Endpoint::SecuredWebSocket { host, port } => {
                write!(f, "{WSS_PREFIX}{host}:{port}")
            },
            Endpoint::Udp { host, port } => write!(f, "{UDP_PREFIX}{host}:{port}"),
            Endpoint::Quic { host, port } => write!(f, "{QUIC_PREFIX}{host}:{port}"),
            Endpoint::SharedMemory { channel_id } => write!(f, "{MEM_PREFIX}{channel_id}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let url = url.trim_end_matches(';');
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| EndpointParseError::MissingScheme(url.to_string()))?;

        if scheme == "mem" {
            if rest.is_empty() {
                return Err(EndpointParseError::EmptyHost(url.to_string()));
            }
            return Ok(Endpoint::SharedMemory {
                channel_id: rest.to_string(),
            });
        }

        let (host, port_str) = rest
            .rsplit_once(':')
            .ok_or_else(|| EndpointParseError::MissingPort(url.to_string()))?;
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(url.to_string()));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| EndpointParseError::InvalidPort(url.to_string()))?;

        let host = host.to_string();
        Ok(match scheme {
            "tcp" => Endpoint::Tcp { host, port },
            "ws" => Endpoint::WebSocket { host, port },
            "wss" => Endpoint::SecuredWebSocket { host, port },
            "udp" => Endpoint::Udp { host, port },
            "quic" => Endpoint::Quic { host, port },
            other => return Err(EndpointParseError::UnknownScheme(other.to_string())),
        })
    }
}

/// Splits an object's URL list into parseable entries, skipping blanks.
pub fn split_url_list(urls: &str) -> impl Iterator<Item = &str> {
    urls.split(';').map(str::trim).filter(|u| !u.is_empty())
}

/// Picks the preferred endpoint out of a URL list.
///
/// Order: shared memory (same host only), then quic, udp, tcp, ws, wss.
/// For udp/tcp/ws a loopback host is rewritten to the remote peer's
/// hostname when the object lives on another machine; quic is never
/// rewritten because the TLS SNI must keep matching the certificate.
pub fn select_endpoint(
    urls: &str,
    same_host: bool,
    remote: Option<&Endpoint>,
) -> Option<Endpoint> {
    let mut quic = None;
    let mut udp = None;
    let mut tcp = None;
    let mut ws = None;
    let mut wss = None;

    for url in split_url_list(urls) {
        let Ok(ep) = url.parse::<Endpoint>() else {
            continue;
        };
        match &ep {
            Endpoint::SharedMemory { .. } if same_host => return Some(ep),
            Endpoint::SharedMemory { .. } => {},
            Endpoint::Quic { .. } => {
                quic.get_or_insert(ep);
            },
            Endpoint::Udp { .. } => {
                udp.get_or_insert(ep);
            },
            Endpoint::Tcp { .. } => {
                tcp.get_or_insert(ep);
            },
            Endpoint::WebSocket { .. } => {
                ws.get_or_insert(ep);
            },
            Endpoint::SecuredWebSocket { .. } => {
                wss.get_or_insert(ep);
            },
            Endpoint::TcpTethered { .. } => {},
        }
    }

    if let Some(ep) = quic {
        return Some(ep);
    }

    let rewrite = |ep: Endpoint| rewrite_loopback(ep, same_host, remote);
    udp.map(rewrite)
        .or_else(|| tcp.map(rewrite))
        .or_else(|| ws.map(rewrite))
        .or(wss)
}

fn rewrite_loopback(ep: Endpoint, same_host: bool, remote: Option<&Endpoint>) -> Endpoint {
    if same_host {
        return ep;
    }
    let Some(remote) = remote else { return ep };

    let is_loopback =
        |h: &str| h == "127.0.0.1" || h.eq_ignore_ascii_case("localhost");

    match ep {
        Endpoint::Tcp { host, port } if is_loopback(&host) => Endpoint::Tcp {
            host: remote.hostname().to_string(),
            port,
        },
        Endpoint::WebSocket { host, port } if is_loopback(&host) => {
            Endpoint::WebSocket {
                host: remote.hostname().to_string(),
                port,
            }
        },
        Endpoint::Udp { host, port } if is_loopback(&host) => Endpoint::Udp {
            host: remote.hostname().to_string(),
            port,
        },
        other => other,
    }
}
