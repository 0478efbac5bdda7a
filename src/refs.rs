//! Delta/zigzag codec for object-reference-ID arrays.
//!
//! Instance tables and relation records store runs of signed 32-bit object
//! ids as zigzag-encoded successive differences, each raw value a fixed-width
//! big-endian unsigned integer. Consecutive ids cluster tightly, so the
//! deltas stay small in magnitude regardless of sign and the zigzag mapping
//! keeps them in the low bit range.
//!
//! The 64-bit variant is a full-width definition. It deliberately does not
//! route through a 32-bit intermediate, so large-magnitude ids survive the
//! round trip exactly.

use byteorder::{BigEndian, ByteOrder};

use crate::cursor::{Reader, Writer};
use crate::error::{Error, Result};

/// Map a signed value onto the unsigned line, small magnitudes first:
/// `0 -> 0, -1 -> 1, 1 -> 2, -2 -> 3, ...`
pub fn encode_zigzag32(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

/// Inverse of [`encode_zigzag32`]: `(n >> 1)` when even, `-((n >> 1) + 1)` when odd.
pub fn decode_zigzag32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// 64-bit form of [`encode_zigzag32`].
pub fn encode_zigzag64(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// 64-bit form of [`decode_zigzag32`], exact over the whole `i64` range.
pub fn decode_zigzag64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Decode `count` reference ids: read big-endian raw values, zigzag-decode
/// each into a delta, and integrate with a running sum starting at 0.
///
/// The sum is tracked at 64 bits; any id leaving the `i32` range is
/// [`Error::ReferenceOverflow`], never a silent wrap.
pub fn decode_refs(r: &mut Reader, count: usize) -> Result<Vec<i32>> {
    let mut ids = Vec::with_capacity(count);
    let mut acc = 0i64;
    for _ in 0..count {
        let raw = BigEndian::read_u32(r.bytes(4)?);
        acc += i64::from(decode_zigzag32(raw));
        let id = i32::try_from(acc).map_err(|_| Error::ReferenceOverflow { value: acc })?;
        ids.push(id);
    }
    Ok(ids)
}

/// Structural inverse of [`decode_refs`]: successive differences, zigzag,
/// fixed-width big-endian raws.
///
/// A successive difference wider than 32 bits has no raw representation;
/// such a sequence is [`Error::ReferenceOverflow`] here, matching the decode
/// side refusing to produce it.
pub fn encode_refs(w: &mut Writer, ids: &[i32]) -> Result<()> {
    let mut prev = 0i64;
    for &id in ids {
        let wide = i64::from(id) - prev;
        let delta =
            i32::try_from(wide).map_err(|_| Error::ReferenceOverflow { value: wide })?;
        w.write_bytes(&encode_zigzag32(delta).to_be_bytes());
        prev = i64::from(id);
    }
    Ok(())
}

/// 64-bit variant of [`decode_refs`] for wide-id tables.
pub fn decode_refs64(r: &mut Reader, count: usize) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(count);
    let mut acc = 0i64;
    for _ in 0..count {
        let raw = BigEndian::read_u64(r.bytes(8)?);
        acc = acc
            .checked_add(decode_zigzag64(raw))
            .ok_or(Error::ReferenceOverflow { value: acc })?;
        ids.push(acc);
    }
    Ok(ids)
}

/// 64-bit variant of [`encode_refs`].
pub fn encode_refs64(w: &mut Writer, ids: &[i64]) -> Result<()> {
    let mut prev = 0i64;
    for &id in ids {
        let wide = i128::from(id) - i128::from(prev);
        let delta = i64::try_from(wide).map_err(|_| Error::ReferenceOverflow {
            value: prev,
        })?;
        w.write_bytes(&encode_zigzag64(delta).to_be_bytes());
        prev = id;
    }
    Ok(())
}
