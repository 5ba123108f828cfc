// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nprpc::endpoint::{Endpoint, EndpointParseError, select_endpoint, split_url_list};

#[test]
fn test_parse_display_roundtrip() -> Result<()> {
    for url in [
        "tcp://10.1.2.3:22222",
        "ws://example.org:8080",
        "wss://example.org:443",
        "udp://10.1.2.3:5000",
        "quic://example.org:4433",
        "mem://1f2e3d4c5b6a",
    ] {
        let ep: Endpoint = url.parse()?;
        assert_eq!(ep.to_string(), url);
        let again: Endpoint = ep.to_string().parse()?;
        assert_eq!(again, ep);
    }
    Ok(())
}

#[test]
fn test_parse_errors() {
    assert!(matches!(
        "gopher://x:1".parse::<Endpoint>(),
        Err(EndpointParseError::UnknownScheme(_))
    ));
    assert!(matches!(
        "tcp://hostonly".parse::<Endpoint>(),
        Err(EndpointParseError::MissingPort(_))
    ));
    assert!(matches!(
        "tcp://host:notaport".parse::<Endpoint>(),
        Err(EndpointParseError::InvalidPort(_))
    ));
    assert!(matches!(
        "plainstring".parse::<Endpoint>(),
        Err(EndpointParseError::MissingScheme(_))
    ));
    assert!(matches!(
        "mem://".parse::<Endpoint>(),
        Err(EndpointParseError::EmptyHost(_))
    ));
}

#[test]
fn test_split_url_list() {
    let urls = "tcp://a:1;ws://b:2;;mem://c;";
    let parts: Vec<&str> = split_url_list(urls).collect();
    assert_eq!(parts, vec!["tcp://a:1", "ws://b:2", "mem://c"]);
}

#[test]
fn test_same_host_prefers_shared_memory() {
    let urls = "tcp://127.0.0.1:22222;mem://abc;";
    let ep = select_endpoint(urls, true, None).expect("endpoint selected");
    assert_eq!(ep, Endpoint::SharedMemory {
        channel_id: "abc".into()
    });

    // Different host never picks mem.
    let ep = select_endpoint(urls, false, None).expect("endpoint selected");
    assert!(matches!(ep, Endpoint::Tcp { .. }));
}

#[test]
fn test_preference_order() {
    let urls = "wss://h:1;ws://h:2;tcp://h:3;udp://h:4;quic://h:5;";
    let ep = select_endpoint(urls, false, None).expect("endpoint selected");
    assert!(matches!(ep, Endpoint::Quic { .. }));

    let urls = "wss://h:1;ws://h:2;tcp://h:3;udp://h:4;";
    assert!(matches!(
        select_endpoint(urls, false, None).expect("endpoint selected"),
        Endpoint::Udp { .. }
    ));

    let urls = "wss://h:1;ws://h:2;tcp://h:3;";
    assert!(matches!(
        select_endpoint(urls, false, None).expect("endpoint selected"),
        Endpoint::Tcp { .. }
    ));

    let urls = "wss://h:1;ws://h:2;";
    assert!(matches!(
        select_endpoint(urls, false, None).expect("endpoint selected"),
        Endpoint::WebSocket { .. }
    ));

    let urls = "wss://h:1;";
    assert!(matches!(
        select_endpoint(urls, false, None).expect("endpoint selected"),
        Endpoint::SecuredWebSocket { .. }
    ));
}

#[test]
fn test_loopback_rewrite_for_remote_peer() {
    let remote = Endpoint::Tcp {
        host: "192.168.1.50".into(),
        port: 9999,
    };

    // Object advertised on loopback but received from another machine:
    // rewrite so the dial target is reachable.
    let ep = select_endpoint("tcp://127.0.0.1:22222;", false, Some(&remote))
        .expect("endpoint selected");
    assert_eq!(ep, Endpoint::Tcp {
        host: "192.168.1.50".into(),
        port: 22222
    });

    let ep = select_endpoint("udp://localhost:5000;", false, Some(&remote))
        .expect("endpoint selected");
    assert_eq!(ep, Endpoint::Udp {
        host: "192.168.1.50".into(),
        port: 5000
    });

    // Same machine keeps loopback.
    let ep = select_endpoint("tcp://127.0.0.1:22222;", true, Some(&remote))
        .expect("endpoint selected");
    assert_eq!(ep.hostname(), "127.0.0.1");

    // QUIC is never rewritten (SNI must match the certificate).
    let ep = select_endpoint("quic://127.0.0.1:4433;", false, Some(&remote))
        .expect("endpoint selected");
    assert_eq!(ep.hostname(), "127.0.0.1");
}

#[test]
fn test_no_usable_endpoint() {
    assert!(select_endpoint("", false, None).is_none());
    assert!(select_endpoint("mem://abc;", false, None).is_none());
    assert!(select_endpoint("bogus://x;", false, None).is_none());
}
