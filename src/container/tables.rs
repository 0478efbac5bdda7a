//! Fixed-sequence chunk bodies: metadata, shared strings, instances,
//! relations, and schema-described objects.
//!
//! Each of these is a hand-written field sequence over the payload cursor,
//! version-gated where the table format grew over time. The one exception is
//! [`ObjectTable`], which routes through the schema compiler instead of a
//! fixed sequence.

use std::sync::Arc;

use crate::cursor::{Reader, Writer};
use crate::error::Result;
use crate::refs;
use crate::schema::{compile_schema, SchemaNode};
use crate::value::Value;

/// Key/value metadata list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let count = r.read_u32()? as usize;
        let mut entries = Vec::with_capacity(count.min(1 << 12));
        for _ in 0..count {
            let key = r.read_aligned_string()?.to_owned();
            let value = r.read_aligned_string()?.to_owned();
            entries.push((key, value));
        }
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(self.entries.len() as u32);
        for (key, value) in &self.entries {
            w.write_aligned_string(key);
            w.write_aligned_string(value);
        }
        w.into_bytes()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// One shared-string entry: a precomputed lookup hash and the text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedString {
    pub hash: u32,
    pub text: String,
}

/// The shared-string table chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StringTable {
    pub strings: Vec<SharedString>,
}

impl StringTable {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let count = r.read_u32()? as usize;
        let mut strings = Vec::with_capacity(count.min(1 << 12));
        for _ in 0..count {
            let hash = r.read_u32()?;
            let text = r.read_aligned_string()?.to_owned();
            strings.push(SharedString { hash, text });
        }
        Ok(Self { strings })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(self.strings.len() as u32);
        for s in &self.strings {
            w.write_u32(s.hash);
            w.write_aligned_string(&s.text);
        }
        w.into_bytes()
    }
}

/// Instance-table format revision, gating fields added over time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstanceTableVersion(pub u16);

impl InstanceTableVersion {
    /// Whether instances carry the trailing per-instance boolean flags.
    pub fn has_instance_flags(self) -> bool {
        self.0 >= 1
    }
}

/// One instance row: a class, its referenced object ids, and optional flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    pub class_id: i32,
    pub class_name: String,
    /// Set when this class is backed by an external service (its payloads
    /// are decompiled or decoded outside the engine).
    pub has_service: bool,
    pub references: Vec<i32>,
    /// One flag per referenced id; absent before table version 1.
    pub flags: Option<Vec<bool>>,
}

/// The instance table chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceTable {
    pub version: InstanceTableVersion,
    pub instances: Vec<Instance>,
}

impl Default for InstanceTableVersion {
    fn default() -> Self {
        Self(1)
    }
}

impl InstanceTable {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let version = InstanceTableVersion(r.read_u16()?);
        r.skip(2)?; // reserved
        let count = r.read_u32()? as usize;
        let mut instances = Vec::with_capacity(count.min(1 << 12));
        for _ in 0..count {
            let class_id = r.read_i32()?;
            let class_name = r.read_aligned_string()?.to_owned();
            let has_service = r.read_bool()?;
            let ref_count = r.read_u32()? as usize;
            let references = refs::decode_refs(&mut r, ref_count)?;
            let flags = if version.has_instance_flags() {
                let packed = r.bytes(ref_count.div_ceil(8))?;
                let mut flags = Vec::with_capacity(ref_count);
                for i in 0..ref_count {
                    flags.push(packed[i / 8] & (1 << (i % 8)) != 0);
                }
                Some(flags)
            } else {
                None
            };
            r.align(4);
            instances.push(Instance {
                class_id,
                class_name,
                has_service,
                references,
                flags,
            });
        }
        Ok(Self { version, instances })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        w.write_u16(self.version.0);
        w.write_u16(0);
        w.write_u32(self.instances.len() as u32);
        for inst in &self.instances {
            w.write_i32(inst.class_id);
            w.write_aligned_string(&inst.class_name);
            w.write_bool(inst.has_service);
            w.write_u32(inst.references.len() as u32);
            refs::encode_refs(&mut w, &inst.references)?;
            if self.version.has_instance_flags() {
                let flags = inst.flags.as_deref().unwrap_or(&[]);
                let mut packed = vec![0u8; inst.references.len().div_ceil(8)];
                for (i, &flag) in flags.iter().enumerate().take(inst.references.len()) {
                    packed[i / 8] |= u8::from(flag) << (i % 8);
                }
                w.write_bytes(&packed);
            }
            w.align(4);
        }
        Ok(w.into_bytes())
    }
}

/// Parent/child relation record: two reference-ID arrays.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelationTable {
    pub parents: Vec<i32>,
    pub children: Vec<i32>,
}

impl RelationTable {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let parent_count = r.read_u32()? as usize;
        let parents = refs::decode_refs(&mut r, parent_count)?;
        let child_count = r.read_u32()? as usize;
        let children = refs::decode_refs(&mut r, child_count)?;
        Ok(Self { parents, children })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        w.write_u32(self.parents.len() as u32);
        refs::encode_refs(&mut w, &self.parents)?;
        w.write_u32(self.children.len() as u32);
        refs::encode_refs(&mut w, &self.children)?;
        Ok(w.into_bytes())
    }
}

/// Schema-described object records: an embedded schema followed by records
/// decoded through the process-wide compiled-schema cache.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectTable {
    /// `None` only for an empty chunk, which carries no schema to embed.
    pub schema: Option<Arc<SchemaNode>>,
    pub objects: Vec<Value>,
}

impl ObjectTable {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let schema = Arc::new(SchemaNode::read_embedded(&mut r)?);
        let decoder = compile_schema(&schema)?;
        let count = r.read_u32()? as usize;
        let mut objects = Vec::with_capacity(count.min(1 << 12));
        for _ in 0..count {
            objects.push(decoder.decode(&mut r)?);
        }
        Ok(Self {
            schema: Some(schema),
            objects,
        })
    }
}
