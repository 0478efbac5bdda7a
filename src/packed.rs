//! Bit-packed vector codecs for compressed mesh and animation data.
//!
//! Three shapes share one bitstream convention: values are laid down starting
//! at bit 0 of byte 0, least-significant bits first, with a byte index and a
//! sub-byte bit offset advancing identically during pack and unpack, so the
//! two are exact inverses.
//!
//! - [`PackedIntVector`]: fixed-width quantized unsigned integers.
//! - [`PackedFloatVector`]: the same integers mapped through an affine
//!   scale + offset, with optional strided extraction of one interleaved
//!   channel (one UV set out of several sharing a buffer).
//! - [`PackedQuatVector`]: unit quaternions at 32 bits each, largest
//!   component omitted and rebuilt from the other three.

use crate::cursor::{Reader, Writer};
use crate::error::{Error, Result};

/// Bitstream reader over a packed byte buffer.
struct BitReader<'a> {
    data: &'a [u8],
    byte: usize,
    bit: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, byte: 0, bit: 0 }
    }

    /// Reposition to an absolute bit offset.
    fn seek_bits(&mut self, bit_pos: usize) {
        self.byte = bit_pos / 8;
        self.bit = (bit_pos % 8) as u32;
    }

    /// Extract `bit_size` bits (1..=32), OR-ing right-shifted byte fragments
    /// into an accumulator and masking the result.
    fn read(&mut self, bit_size: u32) -> Result<u32> {
        let mut value = 0u32;
        let mut bits = 0u32;
        while bits < bit_size {
            let Some(&byte) = self.data.get(self.byte) else {
                return Err(Error::OutOfRange {
                    offset: self.byte,
                    need: 1,
                    have: 0,
                });
            };
            let take = (bit_size - bits).min(8 - self.bit);
            value |= u32::from(byte >> self.bit).wrapping_shl(bits);
            self.bit += take;
            bits += take;
            if self.bit == 8 {
                self.byte += 1;
                self.bit = 0;
            }
        }
        Ok(value & mask(bit_size))
    }
}

/// Bitstream writer, the exact structural inverse of [`BitReader`].
struct BitWriter {
    data: Vec<u8>,
    byte: usize,
    bit: u32,
}

impl BitWriter {
    fn with_bit_capacity(bits: usize) -> Self {
        Self {
            data: vec![0u8; bits.div_ceil(8)],
            byte: 0,
            bit: 0,
        }
    }

    fn write(&mut self, value: u32, bit_size: u32) {
        let value = value & mask(bit_size);
        let mut bits = 0u32;
        while bits < bit_size {
            let take = (bit_size - bits).min(8 - self.bit);
            self.data[self.byte] |= ((value >> bits) as u8).wrapping_shl(self.bit);
            self.bit += take;
            bits += take;
            if self.bit == 8 {
                self.byte += 1;
                self.bit = 0;
            }
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

fn mask(bit_size: u32) -> u32 {
    (((1u64) << bit_size) - 1) as u32
}

fn check_bit_size(bit_size: u8) -> Result<()> {
    if (1..=32).contains(&bit_size) {
        Ok(())
    } else {
        Err(Error::BadBitSize(bit_size))
    }
}

/// Check the capacity invariant `ceil(bit_size * length / 8) <= data.len()`.
fn check_capacity(length: u32, bit_size: u8, data: &[u8]) -> Result<()> {
    let need = (length as usize * bit_size as usize).div_ceil(8);
    if need > data.len() {
        return Err(Error::OutOfRange {
            offset: 0,
            need,
            have: data.len(),
        });
    }
    Ok(())
}

/// Fixed-width quantized unsigned integers in a packed bitstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedIntVector {
    length: u32,
    bit_size: u8,
    data: Vec<u8>,
}

impl PackedIntVector {
    pub fn new(length: u32, bit_size: u8, data: Vec<u8>) -> Result<Self> {
        check_bit_size(bit_size)?;
        check_capacity(length, bit_size, &data)?;
        Ok(Self {
            length,
            bit_size,
            data,
        })
    }

    /// Pack `values` at `bit_size` bits each. Every value must fit.
    pub fn pack(values: &[u32], bit_size: u8) -> Result<Self> {
        check_bit_size(bit_size)?;
        let width = u32::from(bit_size);
        let mut bits = BitWriter::with_bit_capacity(values.len() * width as usize);
        for &v in values {
            if width < 32 && v > mask(width) {
                return Err(Error::PackedOverflow {
                    value: v,
                    bit_size,
                });
            }
            bits.write(v, width);
        }
        Ok(Self {
            length: values.len() as u32,
            bit_size,
            data: bits.into_bytes(),
        })
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn bit_size(&self) -> u8 {
        self.bit_size
    }

    /// Unpack every value. Cannot overrun: the capacity invariant is checked
    /// at construction.
    pub fn unpack(&self) -> Vec<u32> {
        let width = u32::from(self.bit_size);
        let mut bits = BitReader::new(&self.data);
        (0..self.length)
            .map(|_| bits.read(width).expect("capacity checked on construction"))
            .collect()
    }

    /// Wire form: `u32 length, u8 bit_size, u32 byte count, bytes, align(4)`.
    pub fn read(r: &mut Reader) -> Result<Self> {
        let length = r.read_u32()?;
        let bit_size = r.read_u8()?;
        let byte_count = r.read_u32()? as usize;
        let data = r.bytes(byte_count)?.to_vec();
        r.align(4);
        Self::new(length, bit_size, data)
    }

    pub fn write(&self, w: &mut Writer) {
        w.write_u32(self.length);
        w.write_u8(self.bit_size);
        w.write_u32(self.data.len() as u32);
        w.write_bytes(&self.data);
        w.align(4);
    }
}

/// Quantized floats: packed integers mapped through `raw / (scale * (2^bits - 1)) + start`
/// with `scale = 1 / range`.
#[derive(Clone, Debug, PartialEq)]
pub struct PackedFloatVector {
    length: u32,
    bit_size: u8,
    range: f32,
    start: f32,
    data: Vec<u8>,
}

impl PackedFloatVector {
    pub fn new(length: u32, bit_size: u8, range: f32, start: f32, data: Vec<u8>) -> Result<Self> {
        check_bit_size(bit_size)?;
        check_capacity(length, bit_size, &data)?;
        Ok(Self {
            length,
            bit_size,
            range,
            start,
            data,
        })
    }

    /// Quantize `values` spanning `[start, start + range]` into `bit_size`-bit
    /// integers. Values outside the span saturate at the quantization rails.
    pub fn pack(values: &[f32], bit_size: u8, range: f32, start: f32) -> Result<Self> {
        check_bit_size(bit_size)?;
        let width = u32::from(bit_size);
        let steps = mask(width) as f32;
        let mut bits = BitWriter::with_bit_capacity(values.len() * width as usize);
        for &v in values {
            let scaled = ((v - start) / range * steps).round();
            bits.write(scaled.clamp(0.0, steps) as u32, width);
        }
        Ok(Self {
            length: values.len() as u32,
            bit_size,
            range,
            start,
            data: bits.into_bytes(),
        })
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Unpack the full sequence.
    pub fn unpack(&self) -> Vec<f32> {
        let width = u32::from(self.bit_size);
        let scale = 1.0 / self.range;
        let steps = mask(width) as f32;
        let mut bits = BitReader::new(&self.data);
        (0..self.length)
            .map(|_| {
                let raw = bits.read(width).expect("capacity checked on construction");
                raw as f32 / (scale * steps) + self.start
            })
            .collect()
    }

    /// Extract one interleaved channel.
    ///
    /// The buffer is treated as `chunk_count` groups of `stride_bytes` bytes,
    /// each holding several channels back to back. Within every group,
    /// reading starts at bit `bit_size * first_item` and takes
    /// `items_per_chunk` values. A negative `chunk_count` means
    /// `length / items_per_chunk`.
    pub fn unpack_strided(
        &self,
        items_per_chunk: usize,
        stride_bytes: usize,
        first_item: usize,
        chunk_count: i64,
    ) -> Result<Vec<f32>> {
        let width = u32::from(self.bit_size);
        let scale = 1.0 / self.range;
        let steps = mask(width) as f32;
        let chunks = if chunk_count < 0 {
            if items_per_chunk == 0 {
                0
            } else {
                self.length as usize / items_per_chunk
            }
        } else {
            chunk_count as usize
        };

        let mut out = Vec::with_capacity(chunks * items_per_chunk);
        let mut bits = BitReader::new(&self.data);
        for chunk in 0..chunks {
            bits.seek_bits(chunk * stride_bytes * 8 + width as usize * first_item);
            for _ in 0..items_per_chunk {
                let raw = bits.read(width)?;
                out.push(raw as f32 / (scale * steps) + self.start);
            }
        }
        Ok(out)
    }

    /// Wire form: `u32 length, f32 range, f32 start, u8 bit_size,
    /// u32 byte count, bytes, align(4)`.
    pub fn read(r: &mut Reader) -> Result<Self> {
        let length = r.read_u32()?;
        let range = r.read_f32()?;
        let start = r.read_f32()?;
        let bit_size = r.read_u8()?;
        let byte_count = r.read_u32()? as usize;
        let data = r.bytes(byte_count)?.to_vec();
        r.align(4);
        Self::new(length, bit_size, range, start, data)
    }

    pub fn write(&self, w: &mut Writer) {
        w.write_u32(self.length);
        w.write_f32(self.range);
        w.write_f32(self.start);
        w.write_u8(self.bit_size);
        w.write_u32(self.data.len() as u32);
        w.write_bytes(&self.data);
        w.align(4);
    }
}

/// Unit quaternions at 32 bits each.
///
/// Layout per quaternion: a 3-bit flag (2 bits index of the omitted largest
/// component, 1 bit its sign), then the three kept components. The two
/// components cyclically adjacent to the omitted index get 10 bits, the
/// opposite one 9, each mapped through `x / (0.5 * (2^bits - 1)) - 1`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedQuatVector {
    length: u32,
    data: Vec<u8>,
}

/// Bit width for kept component `i` when component `omitted` is dropped.
fn quat_component_bits(i: usize, omitted: usize) -> u32 {
    if (i + 2) % 4 == omitted {
        9
    } else {
        10
    }
}

impl PackedQuatVector {
    pub fn new(length: u32, data: Vec<u8>) -> Result<Self> {
        // 3 flag bits + 10 + 10 + 9 component bits per quaternion.
        let need = (length as usize * 32).div_ceil(8);
        if need > data.len() {
            return Err(Error::OutOfRange {
                offset: 0,
                need,
                have: data.len(),
            });
        }
        Ok(Self { length, data })
    }

    pub fn pack(quats: &[[f32; 4]]) -> Self {
        let mut bits = BitWriter::with_bit_capacity(quats.len() * 32);
        for q in quats {
            let omitted = q
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.abs().total_cmp(&b.abs()))
                .map(|(i, _)| i)
                .unwrap_or(3);
            let sign = u32::from(q[omitted] < 0.0);
            bits.write(omitted as u32 | (sign << 2), 3);
            for (i, &v) in q.iter().enumerate() {
                if i == omitted {
                    continue;
                }
                let width = quat_component_bits(i, omitted);
                let steps = 0.5 * mask(width) as f32;
                let raw = ((v + 1.0) * steps).round().clamp(0.0, mask(width) as f32);
                bits.write(raw as u32, width);
            }
        }
        Self {
            length: quats.len() as u32,
            data: bits.into_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Unpack every quaternion, rebuilding the omitted component as
    /// `sqrt(max(0, 1 - Σx²))`. A slightly negative radicand from
    /// quantization error clamps to zero rather than failing.
    pub fn unpack(&self) -> Vec<[f32; 4]> {
        let mut bits = BitReader::new(&self.data);
        (0..self.length)
            .map(|_| {
                let flags = bits.read(3).expect("capacity checked on construction");
                let omitted = (flags & 3) as usize;
                let mut q = [0.0f32; 4];
                let mut sum_sq = 0.0f32;
                for i in 0..4 {
                    if i == omitted {
                        continue;
                    }
                    let width = quat_component_bits(i, omitted);
                    let raw = bits.read(width).expect("capacity checked on construction");
                    let v = raw as f32 / (0.5 * mask(width) as f32) - 1.0;
                    q[i] = v;
                    sum_sq += v * v;
                }
                let rebuilt = (1.0 - sum_sq).max(0.0).sqrt();
                q[omitted] = if flags & 4 != 0 { -rebuilt } else { rebuilt };
                q
            })
            .collect()
    }

    /// Wire form: `u32 length, u32 byte count, bytes, align(4)`.
    pub fn read(r: &mut Reader) -> Result<Self> {
        let length = r.read_u32()?;
        let byte_count = r.read_u32()? as usize;
        let data = r.bytes(byte_count)?.to_vec();
        r.align(4);
        Self::new(length, data)
    }

    pub fn write(&self, w: &mut Writer) {
        w.write_u32(self.length);
        w.write_u32(self.data.len() as u32);
        w.write_bytes(&self.data);
        w.align(4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn int_round_trip_every_bit_size() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x9E37);
        for bit_size in 1..=32u8 {
            let limit = mask(u32::from(bit_size));
            let values: Vec<u32> = (0..257).map(|_| rng.gen::<u32>() & limit).collect();
            let packed = PackedIntVector::pack(&values, bit_size).unwrap();
            assert_eq!(packed.unpack(), values, "bit_size {bit_size}");
        }
    }

    #[test]
    fn int_wire_round_trip() {
        let packed = PackedIntVector::pack(&[1, 2, 3, 500, 1023], 10).unwrap();
        let mut w = Writer::new();
        packed.write(&mut w);
        let buf = w.into_bytes();
        assert_eq!(buf.len() % 4, 0);
        let back = PackedIntVector::read(&mut Reader::new(&buf)).unwrap();
        assert_eq!(back, packed);
    }

    #[test]
    fn pack_rejects_wide_values() {
        assert!(matches!(
            PackedIntVector::pack(&[8], 3),
            Err(Error::PackedOverflow { value: 8, bit_size: 3 })
        ));
    }

    #[test]
    fn bit_size_bounds() {
        assert!(matches!(
            PackedIntVector::pack(&[0], 0),
            Err(Error::BadBitSize(0))
        ));
        assert!(matches!(
            PackedIntVector::new(1, 33, vec![0; 8]),
            Err(Error::BadBitSize(33))
        ));
    }

    #[test]
    fn truncated_buffer_rejected() {
        // 10 values * 7 bits = 70 bits = 9 bytes needed.
        assert!(PackedIntVector::new(10, 7, vec![0; 8]).is_err());
        assert!(PackedIntVector::new(10, 7, vec![0; 9]).is_ok());
    }

    #[test]
    fn float_full_scale_hits_endpoints() {
        // One packed raw value of 255 at 8 bits over [-1, 1] must decode to 1.0.
        let v = PackedFloatVector::new(1, 8, 2.0, -1.0, vec![255]).unwrap();
        let out = v.unpack();
        assert!((out[0] - 1.0).abs() < 1e-6);

        let zero = PackedFloatVector::new(1, 8, 2.0, -1.0, vec![0]).unwrap();
        assert!((zero.unpack()[0] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn float_round_trip_within_quantization() {
        let values: Vec<f32> = (0..100).map(|i| (i as f32 / 99.0) * 4.0 - 2.0).collect();
        let packed = PackedFloatVector::pack(&values, 12, 4.0, -2.0).unwrap();
        let out = packed.unpack();
        let step = 4.0 / (mask(12) as f32);
        for (a, b) in values.iter().zip(&out) {
            assert!((a - b).abs() <= step, "{a} vs {b}");
        }
    }

    #[test]
    fn strided_extracts_one_channel() {
        // Two interleaved channels, 3 items each per chunk, 8 bits, 2 chunks.
        // Chunk layout: [u0 u1 u2 v0 v1 v2], stride 6 bytes.
        let raw: Vec<f32> = vec![
            0.0, 0.1, 0.2, 0.5, 0.6, 0.7, // chunk 0
            0.3, 0.4, 0.5, 0.8, 0.9, 1.0, // chunk 1
        ];
        let packed = PackedFloatVector::pack(&raw, 8, 1.0, 0.0).unwrap();
        let step = 1.0 / 255.0;

        let u = packed.unpack_strided(3, 6, 0, 2).unwrap();
        let v = packed.unpack_strided(3, 6, 3, 2).unwrap();
        let expect_u = [0.0, 0.1, 0.2, 0.3, 0.4, 0.5];
        let expect_v = [0.5, 0.6, 0.7, 0.8, 0.9, 1.0];
        for (got, want) in u.iter().zip(expect_u) {
            assert!((got - want).abs() <= step, "{got} vs {want}");
        }
        for (got, want) in v.iter().zip(expect_v) {
            assert!((got - want).abs() <= step, "{got} vs {want}");
        }
    }

    #[test]
    fn strided_default_chunk_count() {
        let raw: Vec<f32> = (0..8).map(|i| i as f32 / 7.0).collect();
        let packed = PackedFloatVector::pack(&raw, 8, 1.0, 0.0).unwrap();
        // 4 items per chunk, stride = 4 bytes, chunks defaulted to 8 / 4 = 2.
        let all = packed.unpack_strided(4, 4, 0, -1).unwrap();
        assert_eq!(all.len(), 8);
    }

    #[test]
    fn quat_round_trip_all_omitted_indices() {
        // One quaternion per dominant axis, both signs.
        let mut cases = Vec::new();
        for axis in 0..4 {
            for sign in [1.0f32, -1.0] {
                let mut q = [0.1f32, -0.2, 0.15, 0.05];
                q[axis] = sign * 0.95;
                let norm = (q.iter().map(|v| v * v).sum::<f32>()).sqrt();
                cases.push([q[0] / norm, q[1] / norm, q[2] / norm, q[3] / norm]);
            }
        }
        let packed = PackedQuatVector::pack(&cases);
        let out = packed.unpack();
        assert_eq!(out.len(), cases.len());
        for (got, want) in out.iter().zip(&cases) {
            for i in 0..4 {
                assert!(
                    (got[i] - want[i]).abs() < 4.0e-3,
                    "{got:?} vs {want:?} at component {i}"
                );
            }
        }
    }

    #[test]
    fn quat_negative_radicand_clamps() {
        // Hand-build one quaternion whose three kept components already sum
        // past 1: flag = omitted 0 / sign set, all component bits high.
        let mut bits = super::BitWriter::with_bit_capacity(32);
        bits.write(0b100, 3); // omit component 0, negative sign
        bits.write(mask(10), 10);
        bits.write(mask(9), 9);
        bits.write(mask(10), 10);
        let packed = PackedQuatVector::new(1, bits.into_bytes()).unwrap();
        let q = packed.unpack()[0];
        assert_eq!(q[0], -0.0);
        assert!(q[0].is_sign_negative());
    }

    #[test]
    fn quat_wire_round_trip() {
        let packed = PackedQuatVector::pack(&[[0.0, 0.0, 0.0, 1.0]]);
        let mut w = Writer::new();
        packed.write(&mut w);
        let buf = w.into_bytes();
        let back = PackedQuatVector::read(&mut Reader::new(&buf)).unwrap();
        assert_eq!(back, packed);
    }
}
