// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use nprpc::{
    runtime::{poa::Lifespan, proxy::ObjectProxy, rpc::Rpc},
    stream::StreamEvent,
    wire::object_id::ActivationFlags,
};

use crate::integration_tests::common::{Calculator, client_config, free_tcp_port};

/// S5: the servant yields 1..=5, the reader sees sequences 0..=4 in order,
/// then exactly one completion and nothing after it.
#[tokio::test]
async fn test_stream_of_integers() -> Result<()> {
    let port = free_tcp_port();
    let mut server_cfg = client_config();
    server_cfg.listen.tcp_port = port;

    let server = Rpc::start(server_cfg).await?;
    let poa = server
        .create_poa()
        .with_lifespan(Lifespan::Persistent)
        .build()?;
    let data = poa.activate_object(Box::new(Calculator), ActivationFlags::ALLOW_TCP, None)?;

    let client = Rpc::start(client_config()).await?;
    let proxy = ObjectProxy::from_data(&client, data, None)?;

    let mut reader = proxy.init_stream(0, 1, false).await.expect("stream opens");

    let mut values = Vec::new();
    let mut expected_seq = 0u64;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), reader.next_event())
            .await
            .expect("stream stalled");
        match event {
            Some(StreamEvent::Chunk { sequence, data }) => {
                // Sequences strictly increase; we never reorder.
                assert_eq!(sequence, expected_seq);
                expected_seq += 1;
                values.push(u32::from_le_bytes(data.as_slice().try_into()?));
            },
            Some(StreamEvent::Complete { final_sequence }) => {
                assert_eq!(final_sequence, 4);
                break;
            },
            Some(StreamEvent::Error { code, .. }) => {
                anyhow::bail!("unexpected stream error: {code}");
            },
            None => anyhow::bail!("stream closed before completion"),
        }
    }
    assert_eq!(values, vec![1, 2, 3, 4, 5]);

    // After completion the reader is closed: no further chunks arrive.
    let after = tokio::time::timeout(Duration::from_millis(200), reader.next_event()).await;
    assert!(matches!(after, Ok(None) | Err(_)));

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

/// Unknown streaming function answers `Error_UnknownFunctionIdx` instead of
/// `Success`.
#[tokio::test]
async fn test_stream_init_unknown_function() -> Result<()> {
    let port = free_tcp_port();
    let mut server_cfg = client_config();
    server_cfg.listen.tcp_port = port;

    let server = Rpc::start(server_cfg).await?;
    let poa = server
        .create_poa()
        .with_lifespan(Lifespan::Persistent)
        .build()?;
    let data = poa.activate_object(Box::new(Calculator), ActivationFlags::ALLOW_TCP, None)?;

    let client = Rpc::start(client_config()).await?;
    let proxy = ObjectProxy::from_data(&client, data, None)?;

    let err = proxy
        .init_stream(0, 99, false)
        .await
        .expect_err("no such stream method");
    assert_eq!(err, nprpc::runtime::RpcError::UnknownFunctionIdx);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
