//! Remote schema loading.
//!
//! Engines strip embedded schemas from shipped files to save space; the
//! schemas are then published per engine version as a single blob holding a
//! flat node table and a string table per type. This module fetches that blob
//! through an external [`FetchSchema`] service, reconstructs the nested
//! [`SchemaNode`] trees, and caches them per `(version, type id)` so every
//! later file of the same version skips both the fetch and the rebuild.
//!
//! Field and type names repeat endlessly across schemas (`data`, `size`,
//! `int`, ...), so name offsets with the top bit set resolve against the
//! built-in [`COMMON_STRINGS`] table instead of the blob-local one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::cursor::Reader;
use crate::error::{Error, Result};
use crate::schema::SchemaNode;

/// External schema-blob fetch service. Implementations template the storage
/// path (or URL) on the version string; the loader never sees the transport.
pub trait FetchSchema {
    fn fetch(&self, version: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Names shared by well-known schemas, NUL-separated. A name offset with the
/// top bit set indexes this table rather than the blob-local one.
pub const COMMON_STRINGS: &[u8] = b"AABB\0AnimationClip\0AnimationCurve\0Array\0Base\0\
BitField\0bool\0char\0ColorRGBA\0Component\0data\0double\0first\0float\0GameObject\0\
Gradient\0GUID\0half\0int\0map\0Matrix4x4f\0Mesh\0Object\0pair\0Quaternionf\0Rectf\0\
second\0size\0SInt16\0SInt32\0SInt64\0SInt8\0string\0TextAsset\0Texture2D\0Transform\0\
TypelessData\0UInt16\0UInt32\0UInt64\0UInt8\0unsigned int\0unsigned short\0value\0\
vector\0Vector2f\0Vector3f\0Vector4f\0m_Name\0m_Enabled\0m_GameObject\0m_Children\0\
m_Father\0m_LocalPosition\0m_LocalRotation\0m_LocalScale\0m_Script\0";

/// Flag bit selecting the shared table for a name offset.
const SHARED_NAME_BIT: u32 = 0x8000_0000;

/// Byte offset of `name` inside [`COMMON_STRINGS`], if it is a well-known name.
pub fn common_string_offset(name: &str) -> Option<u32> {
    let mut offset = 0usize;
    for entry in COMMON_STRINGS.split(|&b| b == 0) {
        if entry == name.as_bytes() {
            return Some(offset as u32);
        }
        offset += entry.len() + 1;
    }
    None
}

/// Read a NUL-terminated name out of `table` at `offset`.
fn table_string(table: &[u8], offset: usize, which: &str) -> Result<String> {
    let tail = table.get(offset..).ok_or_else(|| Error::BadSchemaBlob {
        reason: format!("name offset {offset:#x} outside {which} string table"),
    })?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::BadSchemaBlob {
            reason: format!("unterminated name at {which} table offset {offset:#x}"),
        })?;
    std::str::from_utf8(&tail[..end])
        .map(str::to_owned)
        .map_err(|source| Error::InvalidString { offset, source })
}

/// Resolve a name offset against the local or shared table.
fn resolve_name(local: &[u8], offset: u32) -> Result<String> {
    if offset & SHARED_NAME_BIT != 0 {
        table_string(COMMON_STRINGS, (offset & !SHARED_NAME_BIT) as usize, "shared")
    } else {
        table_string(local, offset as usize, "local")
    }
}

/// One row of the flat node table, 24 bytes on the wire.
#[derive(Debug)]
struct FlatNode {
    version: u16,
    level: u8,
    type_flags: u8,
    type_name_offset: u32,
    field_name_offset: u32,
    size: i32,
    index: i32,
    meta_flags: u32,
}

impl FlatNode {
    fn read(r: &mut Reader) -> Result<Self> {
        Ok(Self {
            version: r.read_u16()?,
            level: r.read_u8()?,
            type_flags: r.read_u8()?,
            type_name_offset: r.read_u32()?,
            field_name_offset: r.read_u32()?,
            size: r.read_i32()?,
            index: r.read_i32()?,
            meta_flags: r.read_u32()?,
        })
    }
}

/// A parsed schema blob: every type tree for one engine version.
#[derive(Debug)]
pub struct SchemaBlob {
    pub version: String,
    pub platform: u32,
    types: HashMap<i32, Arc<SchemaNode>>,
}

impl SchemaBlob {
    /// Parse a fetched blob: 64-byte version string, u32 platform code, u8
    /// has-sizes flag, u32 type count, then per type an i32 type id, a layout
    /// digest (two digests for script types, marked by a negative id), the
    /// flat node table, and the local string table.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let version = r.read_char_array(64)?.to_owned();
        let platform = r.read_u32()?;
        let _has_sizes = r.read_bool()?;
        let type_count = r.read_u32()?;

        let mut types = HashMap::with_capacity(type_count.min(4096) as usize);
        for _ in 0..type_count {
            let type_id = r.read_i32()?;
            // Script types carry a script digest ahead of the layout digest.
            let digest_len = if type_id < 0 { 32 } else { 16 };
            r.skip(digest_len)?;

            let node_count = r.read_u32()? as usize;
            let string_size = r.read_u32()? as usize;
            let mut flat = Vec::with_capacity(node_count.min(1 << 16));
            for _ in 0..node_count {
                flat.push(FlatNode::read(&mut r)?);
            }
            let strings = r.bytes(string_size)?;

            let tree = build_tree(&flat, strings)?;
            types.insert(type_id, Arc::new(tree));
        }

        Ok(Self {
            version,
            platform,
            types,
        })
    }

    pub fn get(&self, type_id: i32) -> Option<&Arc<SchemaNode>> {
        self.types.get(&type_id)
    }

    pub fn type_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.types.keys().copied()
    }
}

/// Rebuild nesting from the flat `level` sequence with a parent stack: pop
/// while the stack top's level is not smaller than the incoming node's, then
/// attach as the last child of the new top.
fn build_tree(flat: &[FlatNode], strings: &[u8]) -> Result<SchemaNode> {
    let mut nodes = flat.iter();
    let first = nodes.next().ok_or_else(|| Error::BadSchemaBlob {
        reason: "type with an empty node table".into(),
    })?;
    let mut root = materialize(first, strings)?;

    // The open chain always runs along last children, so a level stack plus
    // a walk down `children.last_mut()` reproduces the parent stack.
    let mut levels = vec![first.level];
    for raw in nodes {
        let node = materialize(raw, strings)?;
        while levels.last().is_some_and(|&top| top >= raw.level) {
            levels.pop();
        }
        if levels.is_empty() {
            return Err(Error::BadSchemaBlob {
                reason: format!("node `{}` dangles above the root level", node.field_name),
            });
        }
        let mut parent = &mut root;
        for _ in 1..levels.len() {
            parent = parent
                .children
                .last_mut()
                .ok_or_else(|| Error::BadSchemaBlob {
                    reason: "level sequence skips a nesting step".into(),
                })?;
        }
        parent.children.push(node);
        levels.push(raw.level);
    }
    Ok(root)
}

fn materialize(raw: &FlatNode, strings: &[u8]) -> Result<SchemaNode> {
    let _ = (raw.version, raw.index); // carried by the table, not by the tree
    Ok(SchemaNode {
        type_name: resolve_name(strings, raw.type_name_offset)?,
        field_name: resolve_name(strings, raw.field_name_offset)?,
        byte_size: raw.size,
        level: raw.level,
        type_flags: raw.type_flags,
        meta_flags: raw.meta_flags,
        children: Vec::new(),
    })
}

/// Fetching, parsing, caching front end over [`FetchSchema`].
///
/// The cache is process-wide in spirit: append-only, entries immutable, and
/// a racing re-fetch settles on whichever insert lands first.
pub struct RemoteSchemaLoader<F> {
    fetcher: F,
    cache: RwLock<HashMap<(String, i32), Arc<SchemaNode>>>,
}

impl<F: FetchSchema> RemoteSchemaLoader<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load the schema tree for `(version, type_id)`, fetching and parsing
    /// the version's blob only on the first miss. The await is the fetch
    /// boundary; everything else is synchronous.
    pub async fn load(&self, version: &str, type_id: i32) -> Result<Arc<SchemaNode>> {
        let key = (version.to_owned(), type_id);
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(tree) = cache.get(&key) {
                return Ok(tree.clone());
            }
        }

        let data = self.fetcher.fetch(version).await?;
        let blob = SchemaBlob::parse(&data)?;
        log::debug!(
            "fetched schema blob for `{}`: {} types",
            blob.version,
            blob.types.len()
        );

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        for (id, tree) in &blob.types {
            cache
                .entry((version.to_owned(), *id))
                .or_insert_with(|| tree.clone());
        }
        cache
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::UnknownSchemaType {
                version: version.to_owned(),
                type_id,
            })
    }

    /// Number of cached `(version, type id)` trees.
    pub fn cached_trees(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
