// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nprpc::buffer::{
    FlatBuffer,
    access::{alloc_opt, pod_at_mut, set_opt_none, write_bytes, write_str},
    validate::{ValidationError, check_optional, check_str, check_struct, check_vector},
};
use zerocopy::{LittleEndian, U32};

fn block_of(len: usize) -> FlatBuffer {
    let mut buf = FlatBuffer::new();
    buf.prepare(len).expect("owned buffer grows");
    buf.commit(len);
    buf
}

#[test]
fn test_struct_bounds() {
    let buf = block_of(16);
    assert!(check_struct(&buf, 0, 16).is_ok());
    assert!(check_struct(&buf, 8, 8).is_ok());
    assert!(matches!(
        check_struct(&buf, 8, 9),
        Err(ValidationError::StructOutOfBounds { .. })
    ));
    assert!(check_struct(&buf, usize::MAX, 2).is_err());
}

#[test]
fn test_valid_string_passes() -> Result<()> {
    let mut buf = block_of(8);
    write_str(&mut buf, 0, "ok")?;
    check_str(&buf, 0)?;
    Ok(())
}

#[test]
fn test_string_past_end_rejected() -> Result<()> {
    let mut buf = block_of(8);
    write_str(&mut buf, 0, "ok")?;
    // Corrupt the descriptor: length runs past the buffer.
    pod_at_mut::<U32<LittleEndian>>(&mut buf, 4)?.set(1000);
    assert!(matches!(
        check_str(&buf, 0),
        Err(ValidationError::BadString { at: 0 })
    ));
    Ok(())
}

#[test]
fn test_vector_offset_garbage_rejected() -> Result<()> {
    let mut buf = block_of(8);
    write_bytes(&mut buf, 0, &[1, 2, 3, 4])?;
    assert!(check_vector(&buf, 0, 1).is_ok());

    // The classic hostile input: an offset pointing into nowhere.
    pod_at_mut::<U32<LittleEndian>>(&mut buf, 0)?.set(0xDEAD_BEEF);
    assert!(matches!(
        check_vector(&buf, 0, 1),
        Err(ValidationError::BadVector { at: 0 })
    ));
    Ok(())
}

#[test]
fn test_vector_length_overflow_rejected() -> Result<()> {
    let mut buf = block_of(8);
    write_bytes(&mut buf, 0, &[0; 4])?;
    // len × elem_size overflows usize.
    pod_at_mut::<U32<LittleEndian>>(&mut buf, 4)?.set(u32::MAX);
    assert!(check_vector(&buf, 0, usize::MAX / 2).is_err());
    Ok(())
}

#[test]
fn test_optional_zero_means_absent() -> Result<()> {
    let mut buf = block_of(4);
    set_opt_none(&mut buf, 0)?;
    assert_eq!(check_optional(&buf, 0, 8)?, None);
    Ok(())
}

#[test]
fn test_optional_target_bounds() -> Result<()> {
    let mut buf = block_of(4);
    let value_off = alloc_opt(&mut buf, 0, 4, 4)?;
    assert_eq!(check_optional(&buf, 0, 4)?, Some(value_off));

    // Claim the value is bigger than the committed prefix.
    assert!(matches!(
        check_optional(&buf, 0, 4096),
        Err(ValidationError::BadOptional { at: 0 })
    ));
    Ok(())
}

#[test]
fn test_nested_recursion_composes() -> Result<()> {
    // A vector of 8-byte descriptors whose elements are themselves
    // validated, the way a generated validator walks non-flat fields.
    let mut buf = block_of(8);
    let elem_off = {
        let off = nprpc::buffer::access::alloc_vector(&mut buf, 0, 1, 8, 4)?;
        write_str(&mut buf, off, "inner")?;
        off
    };

    let (data_off, len) = check_vector(&buf, 0, 8)?;
    assert_eq!((data_off, len), (elem_off, 1));
    check_str(&buf, data_off)?;
    Ok(())
}
