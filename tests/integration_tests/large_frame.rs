// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nprpc::{
    runtime::{RpcError, poa::Lifespan, rpc::Rpc},
    wire::{
        header::{MAX_MESSAGE_SIZE, MessageHeader},
        object_id::ActivationFlags,
    },
};

use crate::integration_tests::common::{Calculator, call_add, client_config, free_tcp_port};

/// A header claiming more than `max_message_size` must close the
/// connection without dispatch; the call fails with a comm-level error.
#[tokio::test]
async fn test_oversized_frame_closes_connection() -> Result<()> {
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
    let proxy = nprpc::runtime::proxy::ObjectProxy::from_data(&client, data, None)?;
    proxy.set_timeout(std::time::Duration::from_millis(500));

    // A sane call first, so the session exists.
    assert_eq!(call_add(&proxy, 1, 2).await?, 3);

    // Craft a frame whose header lies about its size.
    let mut buf = proxy.make_call_frame(0, 0, 8);
    MessageHeader::read_mut(buf.data_mut())
        .expect("header present")
        .size
        .set(MAX_MESSAGE_SIZE + 1);

    let err = proxy.call(buf).await.expect_err("call must fail");
    assert!(
        matches!(err, RpcError::CommFailure(_) | RpcError::TimedOut),
        "unexpected error: {err:?}"
    );

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
