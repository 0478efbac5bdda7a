//! The typed-property table chunk.
//!
//! Records of `class id, name, size, tag byte, value` run back to back until
//! the payload is exhausted. The tag selects one of roughly thirty value
//! shapes, from plain scalars through fixed composites to nested
//! value/presence sub-tables. This is the one place a parse failure does not
//! abort the container: the size field lets the cursor resync past a record
//! whose value cannot be decoded, and that record's value becomes absent.

use crate::cursor::{Reader, Writer};
use crate::error::{Error, Result};
use crate::packed::{PackedFloatVector, PackedIntVector, PackedQuatVector};
use crate::refs;
use crate::services::{Decompile, FetchPayload};
use crate::value::ObjectRef;
use crate::MAX_SCHEMA_DEPTH;

/// A payload stored outside the container, fetched on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalRef {
    pub path: String,
    pub offset: u64,
    pub size: u64,
}

impl ExternalRef {
    /// Pull the payload through the injected fetch service.
    pub async fn fetch(&self, service: &impl FetchPayload) -> Result<Vec<u8>> {
        service.fetch(&self.path, self.offset, self.size).await
    }
}

/// One entry of a nested sub-table: a key with an optional tagged value.
#[derive(Clone, Debug, PartialEq)]
pub struct TableEntry {
    pub key: String,
    pub value: Option<PropValue>,
}

/// A typed property value, tagged on the wire by a single byte.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    Nil,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Quat([f32; 4]),
    Color([u8; 4]),
    Rect([f32; 4]),
    Mat4(Box<[f32; 16]>),
    Ints(Vec<i32>),
    Floats(Vec<f32>),
    Strs(Vec<String>),
    Bools(Vec<bool>),
    Ref(ObjectRef),
    Refs(Vec<i32>),
    PackedInts(Vec<u32>),
    PackedFloats(Vec<f32>),
    PackedQuats(Vec<[f32; 4]>),
    Table(Vec<TableEntry>),
    External(ExternalRef),
    Script(Vec<u8>),
}

impl PropValue {
    /// Run a script value through the injected decompiler. `None` for any
    /// other shape.
    pub fn decompile(&self, service: &impl Decompile) -> Option<Result<String>> {
        match self {
            PropValue::Script(bytecode) => Some(service.decompile(bytecode)),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        use PropValue::*;
        match self {
            Nil => 0,
            Bool(_) => 1,
            I8(_) => 2,
            U8(_) => 3,
            I16(_) => 4,
            U16(_) => 5,
            I32(_) => 6,
            U32(_) => 7,
            I64(_) => 8,
            U64(_) => 9,
            F32(_) => 10,
            F64(_) => 11,
            Str(_) => 12,
            Bytes(_) => 13,
            Vec2(_) => 14,
            Vec3(_) => 15,
            Vec4(_) => 16,
            Quat(_) => 17,
            Color(_) => 18,
            Rect(_) => 19,
            Mat4(_) => 20,
            Ints(_) => 21,
            Floats(_) => 22,
            Strs(_) => 23,
            Bools(_) => 24,
            Ref(_) => 25,
            Refs(_) => 26,
            PackedInts(_) => 27,
            PackedFloats(_) => 28,
            PackedQuats(_) => 29,
            Table(_) => 30,
            External(_) => 31,
            Script(_) => 32,
        }
    }

    /// Read a tag byte and the value it selects.
    pub fn read(r: &mut Reader) -> Result<Self> {
        Self::read_at_depth(r, 0)
    }

    fn read_at_depth(r: &mut Reader, depth: usize) -> Result<Self> {
        if depth >= MAX_SCHEMA_DEPTH {
            return Err(Error::SchemaDepthExceeded {
                limit: MAX_SCHEMA_DEPTH,
            });
        }
        let tag = r.read_u8()?;
        Ok(match tag {
            0 => PropValue::Nil,
            1 => PropValue::Bool(r.read_bool()?),
            2 => PropValue::I8(r.read_i8()?),
            3 => PropValue::U8(r.read_u8()?),
            4 => PropValue::I16(r.read_i16()?),
            5 => PropValue::U16(r.read_u16()?),
            6 => PropValue::I32(r.read_i32()?),
            7 => PropValue::U32(r.read_u32()?),
            8 => PropValue::I64(r.read_i64()?),
            9 => PropValue::U64(r.read_u64()?),
            10 => PropValue::F32(r.read_f32()?),
            11 => PropValue::F64(r.read_f64()?),
            12 => PropValue::Str(r.read_aligned_string()?.to_owned()),
            13 => {
                let len = r.read_u32()? as usize;
                let bytes = r.bytes(len)?.to_vec();
                r.align(4);
                PropValue::Bytes(bytes)
            }
            14 => PropValue::Vec2(read_f32s(r)?),
            15 => PropValue::Vec3(read_f32s(r)?),
            16 => PropValue::Vec4(read_f32s(r)?),
            17 => PropValue::Quat(read_f32s(r)?),
            18 => {
                let raw = r.bytes(4)?;
                PropValue::Color([raw[0], raw[1], raw[2], raw[3]])
            }
            19 => PropValue::Rect(read_f32s(r)?),
            20 => {
                let mut m = [0.0f32; 16];
                for v in &mut m {
                    *v = r.read_f32()?;
                }
                PropValue::Mat4(Box::new(m))
            }
            21 => {
                let count = r.read_u32()? as usize;
                let mut out = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    out.push(r.read_i32()?);
                }
                PropValue::Ints(out)
            }
            22 => {
                let count = r.read_u32()? as usize;
                let mut out = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    out.push(r.read_f32()?);
                }
                PropValue::Floats(out)
            }
            23 => {
                let count = r.read_u32()? as usize;
                let mut out = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    out.push(r.read_aligned_string()?.to_owned());
                }
                PropValue::Strs(out)
            }
            24 => {
                let count = r.read_u32()? as usize;
                let packed = r.bytes(count.div_ceil(8))?;
                let mut out = Vec::with_capacity(count.min(1 << 16));
                for i in 0..count {
                    out.push(packed[i / 8] & (1 << (i % 8)) != 0);
                }
                r.align(4);
                PropValue::Bools(out)
            }
            25 => {
                let file_index = r.read_i32()?;
                let path_id = r.read_i64()?;
                PropValue::Ref(ObjectRef {
                    file_index,
                    path_id,
                })
            }
            26 => {
                let count = r.read_u32()? as usize;
                PropValue::Refs(refs::decode_refs(r, count)?)
            }
            27 => PropValue::PackedInts(PackedIntVector::read(r)?.unpack()),
            28 => PropValue::PackedFloats(PackedFloatVector::read(r)?.unpack()),
            29 => PropValue::PackedQuats(PackedQuatVector::read(r)?.unpack()),
            30 => {
                let count = r.read_u32()? as usize;
                let mut entries = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    let key = r.read_aligned_string()?.to_owned();
                    let value = if r.read_bool()? {
                        Some(Self::read_at_depth(r, depth + 1)?)
                    } else {
                        None
                    };
                    entries.push(TableEntry { key, value });
                }
                PropValue::Table(entries)
            }
            31 => {
                let path = r.read_aligned_string()?.to_owned();
                let offset = r.read_u64()?;
                let size = r.read_u64()?;
                PropValue::External(ExternalRef { path, offset, size })
            }
            32 => {
                let len = r.read_u32()? as usize;
                let bytecode = r.bytes(len)?.to_vec();
                r.align(4);
                PropValue::Script(bytecode)
            }
            other => {
                return Err(Error::UnsupportedFieldType(format!(
                    "property tag {other}"
                )))
            }
        })
    }

    /// Mirror of [`read`](PropValue::read), for encoders and fixtures.
    pub fn write(&self, w: &mut Writer) {
        use PropValue::*;
        w.write_u8(self.tag());
        match self {
            Nil => {}
            Bool(v) => w.write_bool(*v),
            I8(v) => w.write_i8(*v),
            U8(v) => w.write_u8(*v),
            I16(v) => w.write_i16(*v),
            U16(v) => w.write_u16(*v),
            I32(v) => w.write_i32(*v),
            U32(v) => w.write_u32(*v),
            I64(v) => w.write_i64(*v),
            U64(v) => w.write_u64(*v),
            F32(v) => w.write_f32(*v),
            F64(v) => w.write_f64(*v),
            Str(v) => w.write_aligned_string(v),
            Bytes(v) => {
                w.write_u32(v.len() as u32);
                w.write_bytes(v);
                w.align(4);
            }
            Vec2(v) => write_f32s(w, v),
            Vec3(v) => write_f32s(w, v),
            Vec4(v) | Quat(v) | Rect(v) => write_f32s(w, v),
            Color(v) => w.write_bytes(v),
            Mat4(v) => write_f32s(w, v.as_ref()),
            Ints(v) => {
                w.write_u32(v.len() as u32);
                for x in v {
                    w.write_i32(*x);
                }
            }
            Floats(v) => {
                w.write_u32(v.len() as u32);
                for x in v {
                    w.write_f32(*x);
                }
            }
            Strs(v) => {
                w.write_u32(v.len() as u32);
                for s in v {
                    w.write_aligned_string(s);
                }
            }
            Bools(v) => {
                w.write_u32(v.len() as u32);
                let mut packed = vec![0u8; v.len().div_ceil(8)];
                for (i, &b) in v.iter().enumerate() {
                    packed[i / 8] |= u8::from(b) << (i % 8);
                }
                w.write_bytes(&packed);
                w.align(4);
            }
            Ref(v) => {
                w.write_i32(v.file_index);
                w.write_i64(v.path_id);
            }
            Refs(v) => {
                w.write_u32(v.len() as u32);
                // Fixtures and re-encoders hold ids that came from a decode,
                // so their deltas are representable by construction.
                refs::encode_refs(w, v).expect("re-encoding decoded reference ids");
            }
            PackedInts(v) => PackedIntVector::pack(v, 32)
                .expect("32-bit packing accepts any u32")
                .write(w),
            PackedFloats(v) => {
                let (lo, hi) = float_bounds(v);
                PackedFloatVector::pack(v, 16, (hi - lo).max(f32::EPSILON), lo)
                    .expect("16 is a valid bit size")
                    .write(w)
            }
            PackedQuats(v) => PackedQuatVector::pack(v).write(w),
            Table(entries) => {
                w.write_u32(entries.len() as u32);
                for entry in entries {
                    w.write_aligned_string(&entry.key);
                    w.write_bool(entry.value.is_some());
                    if let Some(value) = &entry.value {
                        value.write(w);
                    }
                }
            }
            External(v) => {
                w.write_aligned_string(&v.path);
                w.write_u64(v.offset);
                w.write_u64(v.size);
            }
            Script(v) => {
                w.write_u32(v.len() as u32);
                w.write_bytes(v);
                w.align(4);
            }
        }
    }
}

fn read_f32s<const N: usize>(r: &mut Reader) -> Result<[f32; N]> {
    let mut out = [0.0f32; N];
    for v in &mut out {
        *v = r.read_f32()?;
    }
    Ok(out)
}

fn write_f32s(w: &mut Writer, values: &[f32]) {
    for v in values {
        w.write_f32(*v);
    }
}

fn float_bounds(values: &[f32]) -> (f32, f32) {
    values.iter().fold((0.0f32, 0.0f32), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    })
}

/// One record of the property table.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyRecord {
    pub class_id: i32,
    pub name: String,
    /// `None` when this record's value failed to decode (the sanctioned
    /// partial-failure path) or was written as an intentional placeholder.
    pub value: Option<PropValue>,
}

/// The decoded property table chunk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyTable {
    pub records: Vec<PropertyRecord>,
}

impl PropertyTable {
    /// Decode records until the payload is exhausted.
    ///
    /// Each record is size-framed, so a value that fails to decode (or reads
    /// outside its own lane) is logged with its class id and degraded to
    /// `None` while the table carries on with the next record.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let mut records = Vec::new();
        while !r.is_empty() {
            let class_id = r.read_i32()?;
            let name = r.read_aligned_string()?.to_owned();
            let size = r.read_u32()? as usize;
            let start = r.position();
            let end = start + size;
            if end > r.len() {
                return Err(Error::OutOfRange {
                    offset: start,
                    need: size,
                    have: r.len() - start,
                });
            }

            let value = match PropValue::read(&mut r) {
                Ok(value) if r.position() <= end => Some(value),
                Ok(_) => {
                    log::warn!(
                        "property `{name}` of class {class_id} read past its record; dropping value"
                    );
                    None
                }
                Err(err) => {
                    log::warn!("property `{name}` of class {class_id} failed to decode: {err}");
                    None
                }
            };
            records.push(PropertyRecord {
                class_id,
                name,
                value,
            });
            r.seek(end);
        }
        Ok(Self { records })
    }

    /// Mirror of [`decode`](PropertyTable::decode).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        for record in &self.records {
            w.write_i32(record.class_id);
            w.write_aligned_string(&record.name);
            let size_at = w.position();
            w.write_u32(0);
            let start = w.position();
            if let Some(value) = &record.value {
                value.write(&mut w);
            } else {
                PropValue::Nil.write(&mut w);
            }
            w.patch_u32(size_at, (w.position() - start) as u32);
        }
        w.into_bytes()
    }

    pub fn get(&self, class_id: i32, name: &str) -> Option<&PropValue> {
        self.records
            .iter()
            .find(|rec| rec.class_id == class_id && rec.name == name)
            .and_then(|rec| rec.value.as_ref())
    }
}
