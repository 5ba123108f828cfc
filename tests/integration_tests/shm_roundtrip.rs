// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nprpc::{
    endpoint::Endpoint,
    runtime::{poa::Lifespan, proxy::ObjectProxy, rpc::Rpc},
    wire::object_id::ActivationFlags,
};
use serial_test::serial;

use crate::integration_tests::common::{Calculator, call_add, client_config};

fn shm_config(tag: &str) -> nprpc::cfg::config::Config {
    let mut cfg = client_config();
    cfg.shm.listener_name = Some(format!("test_{}_{tag}", std::process::id()));
    cfg.shm.ring_capacity = 64 * 1024;
    cfg
}

/// S2: request and reply cross the ring pair; the same-host check steers
/// endpoint selection onto `mem://`.
#[tokio::test]
#[serial]
async fn test_zero_copy_roundtrip() -> Result<()> {
    let server = Rpc::start(shm_config("rt")).await?;
    let poa = server
        .create_poa()
        .with_lifespan(Lifespan::Persistent)
        .build()?;
    let mut data = poa.activate_object(
        Box::new(Calculator),
        ActivationFlags::ALLOW_SHARED_MEMORY,
        None,
    )?;
    assert!(data.urls.starts_with("mem://"));

    let client = Rpc::start(client_config()).await?;
    // The reference crossed "the wire" within one process; same-host
    // qualification is what the origin GUID encodes.
    data.origin = *client.guid();

    let proxy = ObjectProxy::from_data(&client, data, None)?;
    assert!(matches!(proxy.endpoint(), Endpoint::SharedMemory { .. }));

    assert_eq!(call_add(&proxy, 2, 3).await?, 5);

    // The rings drained back to empty: more calls keep working at any size
    // the reservation allows.
    for i in 0..100u32 {
        assert_eq!(call_add(&proxy, i, i).await?, 2 * i);
    }

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

/// A second client gets its own channel off the same listener.
#[tokio::test]
#[serial]
async fn test_two_clients_two_channels() -> Result<()> {
    let server = Rpc::start(shm_config("two")).await?;
    let poa = server
        .create_poa()
        .with_lifespan(Lifespan::Persistent)
        .build()?;
    let data = poa.activate_object(
        Box::new(Calculator),
        ActivationFlags::ALLOW_SHARED_MEMORY,
        None,
    )?;

    let client_a = Rpc::start(client_config()).await?;
    let client_b = Rpc::start(client_config()).await?;

    let mut data_a = data.clone();
    data_a.origin = *client_a.guid();
    let mut data_b = data;
    data_b.origin = *client_b.guid();

    let proxy_a = ObjectProxy::from_data(&client_a, data_a, None)?;
    let proxy_b = ObjectProxy::from_data(&client_b, data_b, None)?;

    assert_eq!(call_add(&proxy_a, 1, 2).await?, 3);
    assert_eq!(call_add(&proxy_b, 3, 4).await?, 7);
    assert_eq!(call_add(&proxy_a, 5, 6).await?, 11);

    client_a.shutdown().await;
    client_b.shutdown().await;
    server.shutdown().await;
    Ok(())
}
