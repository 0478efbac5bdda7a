//! Runtime schema model.
//!
//! A [`SchemaNode`] tree describes the field layout of a record the way the
//! container file (or the remote schema service) declares it, resolved at
//! load time rather than compile time. Trees come from two places: an
//! embedded binary form carried inside a container chunk
//! ([`SchemaNode::read_embedded`]) or the flat node tables of a fetched
//! schema blob ([`remote`]). Either way the tree feeds the compiler in
//! [`compile`], which turns it into a reusable decode routine.

mod compile;
pub mod remote;

pub use compile::{
    compile_schema, shared_compiler, CompileObserver, CompiledDecoder, SchemaCompiler,
};

use std::hash::{Hash, Hasher};

use crate::cursor::{Reader, Writer};
use crate::error::{Error, Result};
use crate::MAX_SCHEMA_DEPTH;

/// Meta-flag bit: advance the cursor to the next 4-byte boundary after this
/// node's value has been read.
pub const ALIGN_AFTER: u32 = 0x4000;

/// Type-flag bit: this node is the synthetic array body a wrapper level
/// collapses into (see [`SchemaNode::array_surrogate`]).
pub const TYPE_FLAG_ARRAY: u8 = 0x01;

/// One node of a load-time schema. A node owns its children exclusively.
///
/// A node whose `type_name` is `"Array"` always has exactly two children:
/// the count field and the element type. A node with a single child flagged
/// [`TYPE_FLAG_ARRAY`] is itself an array, with one synthetic wrapper level
/// collapsing away during compilation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaNode {
    pub type_name: String,
    pub field_name: String,
    pub byte_size: i32,
    pub level: u8,
    pub type_flags: u8,
    pub meta_flags: u32,
    pub children: Vec<SchemaNode>,
}

impl SchemaNode {
    /// A leaf node with everything but the names zeroed.
    pub fn leaf(type_name: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            field_name: field_name.into(),
            byte_size: 0,
            level: 0,
            type_flags: 0,
            meta_flags: 0,
            children: Vec::new(),
        }
    }

    /// A composite node over already-built children.
    pub fn composite(
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        children: Vec<SchemaNode>,
    ) -> Self {
        Self {
            children,
            ..Self::leaf(type_name, field_name)
        }
    }

    /// An `"Array"` node from its count field and element type.
    pub fn array(
        field_name: impl Into<String>,
        count: SchemaNode,
        element: SchemaNode,
    ) -> Self {
        Self::composite("Array", field_name, vec![count, element])
    }

    /// Set the align-after meta flag, builder style.
    pub fn aligned(mut self) -> Self {
        self.meta_flags |= ALIGN_AFTER;
        self
    }

    /// Whether the value needs 4-byte alignment after it.
    pub fn align_after(&self) -> bool {
        self.meta_flags & ALIGN_AFTER != 0
    }

    /// The single flagged child this node collapses into, if this node is an
    /// array in surrogate form.
    pub fn array_surrogate(&self) -> Option<&SchemaNode> {
        match self.children.as_slice() {
            [child] if child.type_flags & TYPE_FLAG_ARRAY != 0 => Some(child),
            _ => None,
        }
    }

    /// Structural signature: two trees share a signature exactly when the
    /// compiler would emit the same routine for both. Field names take part
    /// because they name the decoded record fields.
    pub fn signature(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash_structure(&mut hasher);
        hasher.finish()
    }

    fn hash_structure<H: Hasher>(&self, hasher: &mut H) {
        self.type_name.hash(hasher);
        self.field_name.hash(hasher);
        self.type_flags.hash(hasher);
        (self.meta_flags & ALIGN_AFTER).hash(hasher);
        self.children.len().hash(hasher);
        for child in &self.children {
            child.hash_structure(hasher);
        }
    }

    /// Parse the embedded binary form carried inside containers: recursive
    /// records of `string type name, string field name, i32 byte size,
    /// u8 type flags, u32 meta flags, u32 child count`.
    pub fn read_embedded(r: &mut Reader) -> Result<Self> {
        Self::read_embedded_at(r, 0)
    }

    fn read_embedded_at(r: &mut Reader, level: usize) -> Result<Self> {
        if level >= MAX_SCHEMA_DEPTH {
            return Err(Error::SchemaDepthExceeded {
                limit: MAX_SCHEMA_DEPTH,
            });
        }
        let type_name = r.read_string()?.to_owned();
        let field_name = r.read_string()?.to_owned();
        let byte_size = r.read_i32()?;
        let type_flags = r.read_u8()?;
        let meta_flags = r.read_u32()?;
        let child_count = r.read_u32()? as usize;
        let mut children = Vec::new();
        for _ in 0..child_count {
            children.push(Self::read_embedded_at(r, level + 1)?);
        }
        Ok(Self {
            type_name,
            field_name,
            byte_size,
            level: level as u8,
            type_flags,
            meta_flags,
            children,
        })
    }

    /// Mirror of [`read_embedded`](SchemaNode::read_embedded).
    pub fn write_embedded(&self, w: &mut Writer) {
        w.write_string(&self.type_name);
        w.write_string(&self.field_name);
        w.write_i32(self.byte_size);
        w.write_u8(self.type_flags);
        w.write_u32(self.meta_flags);
        w.write_u32(self.children.len() as u32);
        for child in &self.children {
            child.write_embedded(w);
        }
    }
}
