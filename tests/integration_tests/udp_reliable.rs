// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use nprpc::{
    buffer::FlatBuffer,
    endpoint::Endpoint,
    runtime::{RpcError, poa::Lifespan, rpc::Rpc},
    wire::{
        frame::begin_frame,
        header::{HEADER_LEN, MessageHeader, MessageId, MessageType},
        object_id::ActivationFlags,
    },
};

use crate::integration_tests::common::{
    Calculator, call_add, client_config, free_udp_port,
};

/// A lossy peer: drops the first datagram, answers the retransmit with a
/// `Success` frame echoing the request id.
async fn run_lossy_echo(socket: tokio::net::UdpSocket) {
    let mut buf = vec![0u8; 65536];
    let mut dropped = false;

    loop {
        let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
            return;
        };
        if !dropped {
            dropped = true;
            continue;
        }

        let Some(header) = MessageHeader::read(&buf[..n]) else {
            continue;
        };
        let request_id = header.request_id.get();

        let mut reply = FlatBuffer::new();
        begin_frame(&mut reply, 0, MessageId::Success, MessageType::Answer, request_id)
            .expect("owned buffer grows");
        let _ = socket.send_to(reply.cdata(), peer).await;
        return;
    }
}

/// S3: the first datagram is lost; the retransmit succeeds and the caller
/// observes its request id exactly once.
#[tokio::test]
async fn test_retransmit_after_one_loss() -> Result<()> {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    let port = socket.local_addr()?.port();
    let echo = tokio::spawn(run_lossy_echo(socket));

    let client = Rpc::start(client_config()).await?;
    let endpoint = Endpoint::Udp {
        host: "127.0.0.1".into(),
        port,
    };

    let mut request = FlatBuffer::new();
    begin_frame(
        &mut request,
        0,
        MessageId::FunctionCall,
        MessageType::Request,
        0,
    )?;

    let started = std::time::Instant::now();
    let reply = client
        .call_udp_reliable(&endpoint, request, Duration::from_millis(200), 3)
        .await
        .expect("reliable call succeeds after retransmit");

    // One timeout had to elapse before the retransmit went out.
    assert!(started.elapsed() >= Duration::from_millis(180));

    let header = MessageHeader::read(reply.cdata()).expect("header present");
    assert_eq!(
        header.message_id().expect("known message id"),
        MessageId::Success
    );
    assert_ne!(header.request_id.get(), 0);

    echo.await?;
    client.shutdown().await;
    Ok(())
}

/// All retransmits exhausted: the handler observes a timeout, once.
#[tokio::test]
async fn test_reliable_call_times_out() -> Result<()> {
    // A bound socket that never answers.
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    let port = socket.local_addr()?.port();

    let client = Rpc::start(client_config()).await?;
    let endpoint = Endpoint::Udp {
        host: "127.0.0.1".into(),
        port,
    };

    let mut request = FlatBuffer::new();
    begin_frame(
        &mut request,
        0,
        MessageId::FunctionCall,
        MessageType::Request,
        0,
    )?;

    let err = client
        .call_udp_reliable(&endpoint, request, Duration::from_millis(50), 2)
        .await
        .expect_err("nobody answers");
    assert_eq!(err, RpcError::TimedOut);

    client.shutdown().await;
    Ok(())
}

/// Full dispatch over the UDP listener: request in one datagram, reply in
/// another.
#[tokio::test]
async fn test_add_over_udp_listener() -> Result<()> {
    let port = free_udp_port();
    let mut server_cfg = client_config();
    server_cfg.listen.udp_port = port;

    let server = Rpc::start(server_cfg).await?;
    let poa = server
        .create_poa()
        .with_lifespan(Lifespan::Persistent)
        .build()?;
    let data = poa.activate_object(Box::new(Calculator), ActivationFlags::ALLOW_UDP, None)?;
    assert!(data.urls.contains("udp://"));

    let client = Rpc::start(client_config()).await?;
    let proxy = nprpc::runtime::proxy::ObjectProxy::from_data(&client, data, None)?;
    assert!(matches!(proxy.endpoint(), Endpoint::Udp { .. }));

    assert_eq!(call_add(&proxy, 20, 22).await?, 42);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

/// Fire-and-forget datagram: no reply expected, nothing blows up.
#[tokio::test]
async fn test_send_unreliable() -> Result<()> {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    let port = socket.local_addr()?.port();

    let client = Rpc::start(client_config()).await?;
    let endpoint = Endpoint::Udp {
        host: "127.0.0.1".into(),
        port,
    };

    let mut frame = FlatBuffer::new();
    begin_frame(
        &mut frame,
        8,
        MessageId::FunctionCall,
        MessageType::Request,
        0,
    )?;
    client.send_unreliable(&endpoint, frame).await?;

    // The datagram actually left: the peer can read it.
    let mut buf = vec![0u8; 1024];
    let (n, _) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
        .await??;
    assert_eq!(n, HEADER_LEN + 8);

    client.shutdown().await;
    Ok(())
}
