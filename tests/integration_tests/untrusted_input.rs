// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nprpc::{
    buffer::access::{pod_at_mut, write_bytes},
    runtime::{
        RpcError,
        poa::Lifespan,
        proxy::ObjectProxy,
        rpc::Rpc,
        servant::{StandardReply, handle_standard_reply},
    },
    wire::{call::ARGS_OFFSET, object_id::ActivationFlags},
};
use zerocopy::{LittleEndian, U32};

use crate::integration_tests::common::{VectorSink, client_config, free_tcp_port};

/// S6: a fabricated vector descriptor pointing at 0xDEADBEEF is answered
/// with `Error_BadInput` and the servant never runs.
#[tokio::test]
async fn test_bad_vector_rejected() -> Result<()> {
    let port = free_tcp_port();
    let mut server_cfg = client_config();
    server_cfg.listen.tcp_port = port;

    let server = Rpc::start(server_cfg).await?;
    let poa = server
        .create_poa()
        .with_lifespan(Lifespan::Persistent)
        .build()?;
    let data = poa.activate_object(Box::new(VectorSink), ActivationFlags::ALLOW_TCP, None)?;

    let client = Rpc::start(client_config()).await?;
    let proxy = ObjectProxy::from_data(&client, data, None)?;

    // A well-formed call passes the validator.
    let mut good = proxy.make_call_frame(0, 0, 8);
    write_bytes(&mut good, ARGS_OFFSET, &[1, 2, 3, 4])?;
    nprpc::wire::frame::finish_frame(&mut good);
    let reply = proxy.call(good).await?;
    assert_eq!(handle_standard_reply(&reply)?, StandardReply::Success);

    // The hostile one: same shape, garbage offset.
    let mut bad = proxy.make_call_frame(0, 0, 8);
    pod_at_mut::<U32<LittleEndian>>(&mut bad, ARGS_OFFSET)?.set(0xDEAD_BEEF);
    pod_at_mut::<U32<LittleEndian>>(&mut bad, ARGS_OFFSET + 4)?.set(4);

    let reply = proxy.call(bad).await?;
    let err = handle_standard_reply(&reply).expect_err("must be rejected");
    assert_eq!(err, RpcError::BadInput);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
