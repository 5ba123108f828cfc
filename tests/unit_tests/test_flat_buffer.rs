// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nprpc::buffer::{
    FlatBuffer,
    access::{
        alloc_opt, alloc_vector, pod_at, pod_at_mut, read_bytes, read_opt, read_str,
        set_opt_none, write_bytes, write_str,
    },
};
use zerocopy::{LittleEndian, U32};

#[test]
fn test_prepare_commit_consume() -> Result<()> {
    let mut buf = FlatBuffer::new();
    assert!(buf.is_empty());

    let region = buf.prepare(8)?;
    region.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    buf.commit(8);
    assert_eq!(buf.size(), 8);
    assert_eq!(buf.cdata(), &[1, 2, 3, 4, 5, 6, 7, 8]);

    buf.consume(4);
    assert_eq!(buf.size(), 4);
    assert_eq!(buf.cdata(), &[5, 6, 7, 8]);
    Ok(())
}

#[test]
fn test_alloc_tail_alignment() -> Result<()> {
    let mut buf = FlatBuffer::new();
    buf.prepare(3)?;
    buf.commit(3);

    let off = buf.alloc_tail(8, 8)?;
    assert_eq!(off % 8, 0);
    assert!(off >= 3);
    assert_eq!(buf.size(), off + 8);
    Ok(())
}

#[test]
fn test_string_roundtrip() -> Result<()> {
    let mut buf = FlatBuffer::new();
    // Fixed block: one 8-byte string descriptor.
    buf.prepare(8)?;
    buf.commit(8);

    write_str(&mut buf, 0, "hello nprpc")?;
    assert_eq!(read_str(&buf, 0)?, "hello nprpc");

    // Empty strings stay readable.
    let mut buf2 = FlatBuffer::new();
    buf2.prepare(8)?;
    buf2.commit(8);
    write_str(&mut buf2, 0, "")?;
    assert_eq!(read_str(&buf2, 0)?, "");
    Ok(())
}

#[test]
fn test_vector_roundtrip() -> Result<()> {
    let mut buf = FlatBuffer::new();
    buf.prepare(8)?;
    buf.commit(8);

    let payload = vec![0xA5u8; 300];
    write_bytes(&mut buf, 0, &payload)?;
    assert_eq!(read_bytes(&buf, 0)?, payload.as_slice());
    Ok(())
}

#[test]
fn test_typed_vector_write_in_place() -> Result<()> {
    let mut buf = FlatBuffer::new();
    buf.prepare(8)?;
    buf.commit(8);

    let data_off = alloc_vector(&mut buf, 0, 3, 4, 4)?;
    for (i, v) in [10u32, 20, 30].iter().enumerate() {
        pod_at_mut::<U32<LittleEndian>>(&mut buf, data_off + i * 4)?.set(*v);
    }

    let elems: &[U32<LittleEndian>] =
        nprpc::buffer::access::read_vector(&buf, 0)?;
    assert_eq!(elems.len(), 3);
    assert_eq!(elems[1].get(), 20);
    Ok(())
}

#[test]
fn test_optional_absent_and_present() -> Result<()> {
    let mut buf = FlatBuffer::new();
    buf.prepare(4)?;
    buf.commit(4);

    set_opt_none(&mut buf, 0)?;
    assert!(read_opt(&buf, 0)?.is_none());

    let value_off = alloc_opt(&mut buf, 0, 4, 4)?;
    pod_at_mut::<U32<LittleEndian>>(&mut buf, value_off)?.set(0xDEAD);
    let read_off = read_opt(&buf, 0)?.expect("value present");
    assert_eq!(read_off, value_off);
    assert_eq!(pod_at::<U32<LittleEndian>>(&buf, read_off)?.get(), 0xDEAD);
    Ok(())
}

#[test]
fn test_view_mode_refuses_growth() -> Result<()> {
    let mut backing = [0u8; 64];
    let mut buf = FlatBuffer::new();
    unsafe { buf.set_view(backing.as_mut_ptr(), backing.len(), 9) };

    assert!(buf.is_view());
    assert_eq!(buf.reservation_write_idx(), Some(9));
    assert_eq!(buf.max_size(), Some(64));

    buf.prepare(64)?;
    buf.commit(64);

    // One byte over the reservation must fail, not reallocate.
    let err = buf.prepare(1).expect_err("view must not grow");
    assert_eq!(err.need, 65);
    assert_eq!(err.max, 64);
    // The buffer is unchanged and still usable.
    assert_eq!(buf.size(), 64);
    Ok(())
}

#[test]
fn test_view_to_owned_copy() {
    let mut backing = *b"0123456789abcdef";
    let view = unsafe { FlatBuffer::view_of_record(backing.as_mut_ptr(), 16) };
    let owned = view.to_owned_buffer();
    assert!(!owned.is_view());
    assert_eq!(owned.cdata(), b"0123456789abcdef");
}

#[test]
fn test_encode_decode_identity() -> Result<()> {
    // Flat-encode(decode(bytes)) == bytes: build a message, reparse it,
    // and check every field reads back what was written.
    let mut buf = FlatBuffer::new();
    buf.prepare(16)?;
    buf.commit(16);

    pod_at_mut::<U32<LittleEndian>>(&mut buf, 0)?.set(7);
    write_str(&mut buf, 4, "name")?;
    write_bytes(&mut buf, 12, &[1, 2, 3])?;

    let bytes = buf.cdata().to_vec();
    let reparsed = FlatBuffer::from_vec(bytes.clone());
    assert_eq!(pod_at::<U32<LittleEndian>>(&reparsed, 0)?.get(), 7);
    assert_eq!(read_str(&reparsed, 4)?, "name");
    assert_eq!(read_bytes(&reparsed, 12)?, &[1, 2, 3]);
    assert_eq!(reparsed.cdata(), bytes.as_slice());
    Ok(())
}
