// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;
use std::fmt::Write;

use rand::RngExt;

/// Generates a random 16-byte process GUID and returns:
/// - `[u8; 16]` for direct use inside object ids
/// - `String` containing its hexadecimal representation (no prefix)
pub fn generate_guid() -> ([u8; 16], String) {
    let mut guid = [0u8; 16];
    rand::rng().fill(&mut guid);

    let mut hex = String::with_capacity(32);
    for byte in &guid {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }

    (guid, hex)
}

/// Generates a short random identifier suitable for shared-memory channel
/// names (12 hex chars).
pub fn generate_channel_id() -> String {
    let mut raw = [0u8; 6];
    rand::rng().fill(&mut raw);

    let mut hex = String::with_capacity(12);
    for byte in &raw {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }

    hex
}

/// Bounded hex rendering of a byte slice for debug logs.
pub struct HexPreview<'a>(pub &'a [u8]);

impl<'a> fmt::Debug for HexPreview<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX: usize = 128;
        let slice = if self.0.len() > MAX {
            &self.0[..MAX]
        } else {
            self.0
        };
        let mut first = true;
        write!(f, "\"")?;
        for b in slice {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{b:02x}")?;
            first = false;
        }
        if self.0.len() > MAX {
            write!(f, " ... (+{} bytes)", self.0.len() - MAX)?;
        }
        write!(f, "\"")
    }
}
