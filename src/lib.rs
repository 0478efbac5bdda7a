//! geode-pack decodes the versioned, self-describing binary containers that
//! game-engine asset pipelines ship, along with the bit-packed numeric codecs
//! their compressed mesh data uses. The format family is chunked: a
//! fingerprinted header, then signature-tagged, independently compressed
//! chunks, each routed to a fixed field sequence or to a schema-driven
//! decoder resolved at load time.
//!
//! The pieces, bottom up:
//!
//! - [`Reader`]/[`Writer`]: an endianness-fixed byte cursor with typed
//!   accessors, variable-length integers, string forms, and alignment.
//! - [`packed`]: bit-stream pack/unpack for quantized integers, affine-scaled
//!   floats, and largest-component-omitted quaternions.
//! - [`refs`]: the delta/zigzag codec behind object-reference-ID arrays.
//! - [`schema`]: the runtime schema model, a memoizing compiler that turns a
//!   schema into a reusable decode routine, and a remote loader that rebuilds
//!   schemas from a fetched flat-table blob.
//! - [`container`]: chunk framing, signature dispatch, and the chunk bodies
//!   themselves.
//! - [`services`]: the narrow traits external collaborators implement
//!   (decompression, payload fetch, script decompilation).
//!
//! Decoding a file takes one call and a decompressor:
//!
//! ```
//! use geode_pack::{decode_container, ZstdDecompressor};
//!
//! # fn main() -> geode_pack::Result<()> {
//! # let bytes = geode_pack::doctest_container();
//! let container = decode_container(&bytes, &ZstdDecompressor)?;
//! for chunk in &container.chunks {
//!     println!("{}: {} bytes", chunk.signature, chunk.uncompressed_size);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Schema-driven records decode to [`Value`] trees that keep their field
//! order, so anything from pretty-printing to full serde export works without
//! per-type code. Reference fields stay unresolved [`ObjectRef`] handles;
//! resolving them against an object registry is a separate pass over the
//! decoded set.

pub mod container;
pub mod cursor;
mod error;
pub mod packed;
pub mod refs;
pub mod schema;
pub mod services;
mod value;

pub use container::{decode_container, Chunk, ChunkValue, Container, Signature};
pub use cursor::{Reader, Writer};
pub use error::{Error, Result};
pub use schema::{compile_schema, CompiledDecoder, SchemaCompiler, SchemaNode};
pub use services::{Decompile, Decompress, FetchPayload, ZstdDecompressor};
pub use value::{ObjectRef, Record, Value};

/// Ceiling on a chunk's declared uncompressed size. A header past this is
/// treated as damage before any allocation happens.
pub const MAX_CHUNK_SIZE: usize = 1 << 26; // 64 MiB

/// Ceiling on schema nesting, shared by the compiler, the embedded schema
/// reader, and nested property sub-tables.
pub const MAX_SCHEMA_DEPTH: usize = 64;

/// Builds the tiny fixture the crate-level example decodes. Hidden from docs;
/// exists so the example exercises the real entry point.
#[doc(hidden)]
pub fn doctest_container() -> Vec<u8> {
    let mut w = Writer::new();
    w.write_bytes(&container::CONTAINER_MAGIC);
    w.write_u16(0x0D0A);
    w.write_u32(0x0A1A_0A0D);
    w.write_u16(0);
    w.write_u32(0);
    w.write_u32(0);
    w.write_u64(0);
    w.write_bytes(b"END\0");
    w.write_u32(0);
    w.write_u32(0);
    w.write_u32(0);
    w.into_bytes()
}
