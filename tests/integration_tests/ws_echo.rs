// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nprpc::{
    endpoint::Endpoint,
    runtime::{poa::Lifespan, proxy::ObjectProxy, rpc::Rpc},
    wire::object_id::ActivationFlags,
};

use crate::integration_tests::common::{Calculator, call_add, client_config, free_tcp_port};

/// Same call shape as the TCP echo, framed as WS binary messages.
#[tokio::test]
async fn test_add_over_websocket() -> Result<()> {
    let port = free_tcp_port();
    let mut server_cfg = client_config();
    server_cfg.listen.http_port = port;

    let server = Rpc::start(server_cfg).await?;
    let poa = server
        .create_poa()
        .with_lifespan(Lifespan::Persistent)
        .build()?;
    let data =
        poa.activate_object(Box::new(Calculator), ActivationFlags::ALLOW_WEBSOCKET, None)?;
    assert!(data.urls.starts_with("ws://"));

    let client = Rpc::start(client_config()).await?;
    let proxy = ObjectProxy::from_data(&client, data, None)?;
    assert!(matches!(proxy.endpoint(), Endpoint::WebSocket { .. }));

    assert_eq!(call_add(&proxy, 2, 3).await?, 5);
    assert_eq!(call_add(&proxy, 100, 200).await?, 300);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
