// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nprpc::{
    cfg::config::Config,
    endpoint::Endpoint,
    runtime::{
        object_table::IdPolicy,
        poa::Lifespan,
        rpc::Rpc,
        servant::{Dispatch, ObjectServant},
    },
    session::context::SessionContext,
    wire::{
        header::MessageId,
        object_id::{ActivationFlags, ObjectFlags},
    },
};

struct Noop;

impl ObjectServant for Noop {
    fn class_id(&self) -> &'static str {
        "test/Noop"
    }

    fn dispatch(&self, d: &mut Dispatch<'_>) {
        d.simple_answer(MessageId::Success);
    }
}

fn quiet_config() -> Config {
    // No listeners; the runtime is only an object container here.
    Config::default()
}

#[tokio::test]
async fn test_activate_and_lookup() -> Result<()> {
    let rpc = Rpc::start(quiet_config()).await?;
    let poa = rpc
        .create_poa()
        .with_max_objects(4)
        .with_lifespan(Lifespan::Persistent)
        .build()?;

    let data = poa.activate_object(Box::new(Noop), ActivationFlags::ALLOW_TCP, None)?;
    assert_eq!(data.poa_idx, poa.index());
    assert!(data.flags.contains(ObjectFlags::PERSISTENT));
    assert_eq!(data.class_id, "test/Noop");
    assert!(data.urls.starts_with("tcp://127.0.0.1:"));
    assert_eq!(&data.origin, rpc.guid());

    let guard = poa.get_object(data.object_id).expect("object is live");
    assert_eq!(guard.get().expect("not deleted").servant.class_id(), "test/Noop");

    rpc.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_system_ids_are_sequential_and_bounded() -> Result<()> {
    let rpc = Rpc::start(quiet_config()).await?;
    let poa = rpc
        .create_poa()
        .with_max_objects(2)
        .with_lifespan(Lifespan::Persistent)
        .build()?;

    let a = poa.activate_object(Box::new(Noop), ActivationFlags::ALLOW_TCP, None)?;
    let b = poa.activate_object(Box::new(Noop), ActivationFlags::ALLOW_TCP, None)?;
    assert_eq!(a.object_id, 0);
    assert_eq!(b.object_id, 1);

    // Table is full now.
    assert!(
        poa.activate_object(Box::new(Noop), ActivationFlags::ALLOW_TCP, None)
            .is_err()
    );

    // Deactivating frees the slot for reuse.
    poa.deactivate_object(a.object_id);
    let c = poa.activate_object(Box::new(Noop), ActivationFlags::ALLOW_TCP, None)?;
    assert_eq!(c.object_id, 0);

    rpc.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_user_supplied_ids() -> Result<()> {
    let rpc = Rpc::start(quiet_config()).await?;
    let poa = rpc
        .create_poa()
        .with_max_objects(8)
        .with_lifespan(Lifespan::Persistent)
        .with_id_policy(IdPolicy::UserSupplied)
        .build()?;

    poa.activate_object_with_id(5, Box::new(Noop), ActivationFlags::ALLOW_TCP, None)?;
    assert!(poa.get_object(5).is_some());
    assert!(poa.get_object(4).is_none());

    // Same id twice is an error.
    assert!(
        poa.activate_object_with_id(5, Box::new(Noop), ActivationFlags::ALLOW_TCP, None)
            .is_err()
    );
    // Out of range is an error.
    assert!(
        poa.activate_object_with_id(8, Box::new(Noop), ActivationFlags::ALLOW_TCP, None)
            .is_err()
    );

    // System-style activation is rejected on a user-supplied POA.
    assert!(
        poa.activate_object(Box::new(Noop), ActivationFlags::ALLOW_TCP, None)
            .is_err()
    );

    rpc.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_deactivation_is_deferred_while_guarded() -> Result<()> {
    let rpc = Rpc::start(quiet_config()).await?;
    let poa = rpc
        .create_poa()
        .with_lifespan(Lifespan::Persistent)
        .build()?;

    let data = poa.activate_object(Box::new(Noop), ActivationFlags::ALLOW_TCP, None)?;
    let guard = poa.get_object(data.object_id).expect("object is live");

    poa.deactivate_object(data.object_id);

    // Lookups miss immediately...
    assert!(poa.get_object(data.object_id).is_none());
    // ...and the held guard observes the tombstone.
    assert!(guard.get().is_none());
    // The entry itself survives until the guard drops.
    assert_eq!(guard.entry().in_use_count(), 1);
    drop(guard);

    rpc.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_transient_activation_registers_session_reference() -> Result<()> {
    let rpc = Rpc::start(quiet_config()).await?;
    let poa = rpc
        .create_poa()
        .with_lifespan(Lifespan::Transient)
        .build()?;

    // Transient activation without a session is refused.
    assert!(
        poa.activate_object(Box::new(Noop), ActivationFlags::ALLOW_TCP, None)
            .is_err()
    );

    let ctx = SessionContext::new(&rpc, Endpoint::Tcp {
        host: "127.0.0.1".into(),
        port: 1,
    });
    let data =
        poa.activate_object(Box::new(Noop), ActivationFlags::ALLOW_TCP, Some(&ctx))?;
    assert_eq!(ctx.ref_list.len(), 1);

    {
        let guard = poa.get_object(data.object_id).expect("object is live");
        assert_eq!(guard.entry().ref_count(), 1);
    }

    // Releasing the peer's reference deactivates the transient object.
    assert!(ctx.ref_list.remove_ref(data.poa_idx, data.object_id));
    assert!(poa.get_object(data.object_id).is_none());

    rpc.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_tethered_activation_marks_flags() -> Result<()> {
    let rpc = Rpc::start(quiet_config()).await?;
    let poa = rpc
        .create_poa()
        .with_lifespan(Lifespan::Transient)
        .build()?;

    let ctx = SessionContext::new(&rpc, Endpoint::Tcp {
        host: "127.0.0.1".into(),
        port: 1,
    });
    let data = poa.activate_object(
        Box::new(Noop),
        ActivationFlags::ALLOW_TCP | ActivationFlags::SESSION_SPECIFIC,
        Some(&ctx),
    )?;
    assert!(data.flags.contains(ObjectFlags::TETHERED));

    rpc.shutdown().await;
    Ok(())
}
