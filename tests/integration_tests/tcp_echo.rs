// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use nprpc::{
    buffer::FlatBuffer,
    runtime::{poa::Lifespan, proxy::ObjectProxy, rpc::Rpc},
    wire::{
        call::{OBJECT_ID_LOCAL_LEN, ObjectIdLocal},
        frame::begin_frame,
        header::{HEADER_LEN, MessageId, MessageType},
        object_id::ActivationFlags,
    },
};
use zerocopy::IntoBytes;

use crate::integration_tests::common::{Calculator, call_add, client_config, free_tcp_port};

#[tokio::test]
async fn test_add_over_tcp() -> Result<()> {
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
    assert_eq!(proxy.endpoint().to_string(), format!("tcp://127.0.0.1:{port}"));

    assert_eq!(call_add(&proxy, 2, 3).await?, 5);
    // Session reuse: a second call rides the same connection.
    assert_eq!(call_add(&proxy, 40, 2).await?, 42);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls_share_one_session() -> Result<()> {
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
    let proxy = std::sync::Arc::new(ObjectProxy::from_data(&client, data, None)?);

    let mut joins = Vec::new();
    for i in 0..32u32 {
        let proxy = std::sync::Arc::clone(&proxy);
        joins.push(tokio::spawn(async move { call_add(&proxy, i, 1000).await }));
    }
    for (i, join) in joins.into_iter().enumerate() {
        assert_eq!(join.await??, i as u32 + 1000);
    }

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

/// AddReference / ReleaseObject bookkeeping over the wire: the serving
/// session's reference list tracks what the peer holds.
#[tokio::test]
async fn test_reference_messages() -> Result<()> {
    let port = free_tcp_port();
    let mut server_cfg = client_config();
    server_cfg.listen.tcp_port = port;

    let server = Rpc::start(server_cfg).await?;
    let poa = server
        .create_poa()
        .with_lifespan(Lifespan::Persistent)
        .build()?;
    let data = poa.activate_object(Box::new(Calculator), ActivationFlags::ALLOW_TCP, None)?;
    let (poa_idx, oid) = (data.poa_idx, data.object_id);

    let client = Rpc::start(client_config()).await?;
    let proxy = ObjectProxy::from_data(&client, data, None)?;
    // Establish the session first.
    assert_eq!(call_add(&proxy, 1, 1).await?, 2);

    let session = proxy.get_session().await.expect("session exists");

    let make_ref_frame = |msg_id: MessageId| {
        let mut buf = FlatBuffer::new();
        begin_frame(
            &mut buf,
            OBJECT_ID_LOCAL_LEN,
            msg_id,
            MessageType::Request,
            0,
        )
        .expect("owned buffer grows");
        let block = ObjectIdLocal::new(poa_idx, oid);
        buf.data_mut()[HEADER_LEN..].copy_from_slice(block.as_bytes());
        buf
    };

    session.send(make_ref_frame(MessageId::AddReference)).await.expect("send");

    // The reference lands asynchronously on the serving connection.
    let entry_refs = || {
        server
            .get_object(poa_idx, oid)
            .and_then(|g| g.get().map(|e| e.ref_count()))
    };
    let mut ok = false;
    for _ in 0..50 {
        if entry_refs() == Some(1) {
            ok = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ok, "AddReference was not applied");

    // Releasing twice is harmless; the list only held one reference, and a
    // persistent object never deactivates.
    session.send(make_ref_frame(MessageId::ReleaseObject)).await.expect("send");
    session.send(make_ref_frame(MessageId::ReleaseObject)).await.expect("send");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.get_object(poa_idx, oid).is_some());

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
