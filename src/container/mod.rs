//! The chunked container framework.
//!
//! A container is a fingerprinted header followed by signature-tagged,
//! independently compressed chunks. Framing lives here; chunk bodies are
//! decoded by [`tables`] (fixed field sequences and the schema-driven object
//! table) and [`props`] (the typed-property table). Decompression goes
//! through the injected [`Decompress`] service, which is only invoked for
//! chunks that actually carry compressed bytes.

mod props;
mod tables;

pub use props::{ExternalRef, PropValue, PropertyRecord, PropertyTable, TableEntry};
pub use tables::{
    Instance, InstanceTable, InstanceTableVersion, Metadata, ObjectTable, RelationTable,
    SharedString, StringTable,
};

use crate::cursor::Reader;
use crate::error::{Error, Result};
use crate::services::Decompress;
use crate::MAX_CHUNK_SIZE;

/// 8-byte magic token opening every container.
pub const CONTAINER_MAGIC: [u8; 8] = *b"CHNKPACK";

// Fingerprint sentinels after the magic, chosen so newline translation or
// high-bit stripping in transit breaks the match (the PNG trick).
const SENTINEL_CRLF: u16 = 0x0D0A;
const SENTINEL_EOF: u32 = 0x0A1A_0A0D;

/// The single container format version this crate decodes.
pub const SUPPORTED_VERSION: u16 = 0;

/// A 4-byte chunk signature, NUL-padded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 4]);

impl Signature {
    pub const METADATA: Signature = Signature(*b"META");
    pub const STRINGS: Signature = Signature(*b"STBL");
    pub const INSTANCES: Signature = Signature(*b"INST");
    pub const PROPERTIES: Signature = Signature(*b"PROP");
    pub const OBJECTS: Signature = Signature(*b"OBJS");
    pub const LINKS: Signature = Signature(*b"LINK");
    pub const END: Signature = Signature(*b"END\0");

    /// The tag with NUL padding trimmed.
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(4);
        std::str::from_utf8(&self.0[..end]).unwrap_or("????")
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({:?})", self.as_str())
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded chunk body, tagged by signature. The set is closed: a signature
/// outside it fails the container decode.
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkValue {
    Metadata(Metadata),
    Strings(StringTable),
    Instances(InstanceTable),
    Properties(PropertyTable),
    Objects(ObjectTable),
    Links(RelationTable),
}

/// One decoded chunk: header fields, decompressed payload, decoded body.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub signature: Signature,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub payload: Vec<u8>,
    pub value: ChunkValue,
}

/// A fully decoded container. Constructed once from a complete byte buffer
/// and immutable afterwards; the End sentinel never appears in `chunks`.
#[derive(Debug)]
pub struct Container {
    pub version: u16,
    pub class_count: u32,
    pub instance_count: u32,
    pub chunks: Vec<Chunk>,
}

impl Container {
    fn find(&self, signature: Signature) -> Option<&ChunkValue> {
        self.chunks
            .iter()
            .find(|c| c.signature == signature)
            .map(|c| &c.value)
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        match self.find(Signature::METADATA) {
            Some(ChunkValue::Metadata(v)) => Some(v),
            _ => None,
        }
    }

    pub fn strings(&self) -> Option<&StringTable> {
        match self.find(Signature::STRINGS) {
            Some(ChunkValue::Strings(v)) => Some(v),
            _ => None,
        }
    }

    pub fn instances(&self) -> Option<&InstanceTable> {
        match self.find(Signature::INSTANCES) {
            Some(ChunkValue::Instances(v)) => Some(v),
            _ => None,
        }
    }

    pub fn properties(&self) -> Option<&PropertyTable> {
        match self.find(Signature::PROPERTIES) {
            Some(ChunkValue::Properties(v)) => Some(v),
            _ => None,
        }
    }

    pub fn objects(&self) -> Option<&ObjectTable> {
        match self.find(Signature::OBJECTS) {
            Some(ChunkValue::Objects(v)) => Some(v),
            _ => None,
        }
    }

    pub fn links(&self) -> Option<&RelationTable> {
        match self.find(Signature::LINKS) {
            Some(ChunkValue::Links(v)) => Some(v),
            _ => None,
        }
    }
}

/// Decode a complete container buffer.
///
/// Framing failures, unknown signatures, and schema errors abort the decode;
/// only property-record values degrade (see [`PropertyTable::decode`]).
pub fn decode_container(bytes: &[u8], decompress: &impl Decompress) -> Result<Container> {
    let mut r = Reader::new(bytes);

    let magic = r.bytes(8)?;
    if magic != CONTAINER_MAGIC {
        return Err(Error::NotAValidContainer {
            reason: "bad magic token".into(),
            offset: 0,
        });
    }
    let sentinel_offset = r.position();
    if r.read_u16()? != SENTINEL_CRLF || r.read_u32()? != SENTINEL_EOF {
        return Err(Error::NotAValidContainer {
            reason: "fingerprint sentinels damaged (transfer corruption?)".into(),
            offset: sentinel_offset,
        });
    }
    let version = r.read_u16()?;
    if version != SUPPORTED_VERSION {
        return Err(Error::UnsupportedVersion { version });
    }
    let class_count = r.read_u32()?;
    let instance_count = r.read_u32()?;
    r.skip(8)?; // reserved

    let mut chunks = Vec::new();
    loop {
        let header_offset = r.position();
        let mut raw_sig = [0u8; 4];
        raw_sig.copy_from_slice(r.bytes(4)?);
        if !raw_sig
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == 0)
        {
            return Err(Error::NotAValidContainer {
                reason: format!("chunk signature {raw_sig:?} is not a tag"),
                offset: header_offset,
            });
        }
        let signature = Signature(raw_sig);
        let compressed_size = r.read_u32()?;
        let uncompressed_size = r.read_u32()?;
        r.skip(4)?; // reserved

        if signature == Signature::END {
            break;
        }
        if uncompressed_size as usize > MAX_CHUNK_SIZE {
            return Err(Error::NotAValidContainer {
                reason: format!(
                    "chunk {signature} declares {uncompressed_size} bytes, over the {MAX_CHUNK_SIZE} ceiling"
                ),
                offset: header_offset,
            });
        }

        // A zero compressed size means an empty payload; some decompressors
        // reject zero-length input, so the service is not invoked at all.
        let payload = if compressed_size == 0 {
            Vec::new()
        } else {
            let src = r.bytes(compressed_size as usize)?;
            let out = decompress.decompress(src, uncompressed_size as usize)?;
            if out.len() != uncompressed_size as usize {
                return Err(Error::DecompressionSizeMismatch {
                    expected: uncompressed_size as usize,
                    actual: out.len(),
                });
            }
            out
        };

        let value = decode_chunk_value(signature, &payload, header_offset)?;
        chunks.push(Chunk {
            signature,
            compressed_size,
            uncompressed_size,
            payload,
            value,
        });
    }

    Ok(Container {
        version,
        class_count,
        instance_count,
        chunks,
    })
}

fn decode_chunk_value(
    signature: Signature,
    payload: &[u8],
    offset: usize,
) -> Result<ChunkValue> {
    // An empty chunk of a known kind decodes to that kind's empty table.
    if payload.is_empty() {
        return Ok(match signature {
            Signature::METADATA => ChunkValue::Metadata(Metadata::default()),
            Signature::STRINGS => ChunkValue::Strings(StringTable::default()),
            Signature::INSTANCES => ChunkValue::Instances(InstanceTable::default()),
            Signature::PROPERTIES => ChunkValue::Properties(PropertyTable::default()),
            Signature::OBJECTS => ChunkValue::Objects(ObjectTable::default()),
            Signature::LINKS => ChunkValue::Links(RelationTable::default()),
            other => {
                return Err(Error::NotAValidContainer {
                    reason: format!("unknown chunk signature `{other}`"),
                    offset,
                })
            }
        });
    }
    Ok(match signature {
        Signature::METADATA => ChunkValue::Metadata(Metadata::decode(payload)?),
        Signature::STRINGS => ChunkValue::Strings(StringTable::decode(payload)?),
        Signature::INSTANCES => ChunkValue::Instances(InstanceTable::decode(payload)?),
        Signature::PROPERTIES => ChunkValue::Properties(PropertyTable::decode(payload)?),
        Signature::OBJECTS => ChunkValue::Objects(ObjectTable::decode(payload)?),
        Signature::LINKS => ChunkValue::Links(RelationTable::decode(payload)?),
        other => {
            return Err(Error::NotAValidContainer {
                reason: format!("unknown chunk signature `{other}`"),
                offset,
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Writer;
    use crate::schema::SchemaNode;
    use crate::value::Value;
    use std::cell::Cell;

    /// Identity "decompressor" for fixtures that store chunks raw, counting
    /// how often the service is consulted.
    #[derive(Default)]
    struct Stored {
        calls: Cell<usize>,
    }

    impl Decompress for Stored {
        fn decompress(&self, src: &[u8], _expected_size: usize) -> crate::Result<Vec<u8>> {
            self.calls.set(self.calls.get() + 1);
            Ok(src.to_vec())
        }
    }

    /// A decompressor that always produces the wrong number of bytes.
    struct ShortOutput;

    impl Decompress for ShortOutput {
        fn decompress(&self, _src: &[u8], _expected_size: usize) -> crate::Result<Vec<u8>> {
            Ok(vec![0u8; 3])
        }
    }

    fn write_header(w: &mut Writer, class_count: u32, instance_count: u32) {
        w.write_bytes(&CONTAINER_MAGIC);
        w.write_u16(SENTINEL_CRLF);
        w.write_u32(SENTINEL_EOF);
        w.write_u16(SUPPORTED_VERSION);
        w.write_u32(class_count);
        w.write_u32(instance_count);
        w.write_u64(0);
    }

    fn write_chunk(w: &mut Writer, signature: Signature, payload: &[u8]) {
        w.write_bytes(&signature.0);
        w.write_u32(payload.len() as u32);
        w.write_u32(payload.len() as u32);
        w.write_u32(0);
        w.write_bytes(payload);
    }

    fn write_end(w: &mut Writer) {
        w.write_bytes(&Signature::END.0);
        w.write_u32(0);
        w.write_u32(0);
        w.write_u32(0);
    }

    #[test]
    fn minimal_container_is_empty() {
        let mut w = Writer::new();
        write_header(&mut w, 0, 0);
        write_end(&mut w);
        let stored = Stored::default();
        let container = decode_container(&w.into_bytes(), &stored).unwrap();
        assert_eq!(container.version, 0);
        assert_eq!(container.class_count, 0);
        assert_eq!(container.instance_count, 0);
        assert!(container.chunks.is_empty());
        assert_eq!(stored.calls.get(), 0);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut w = Writer::new();
        w.write_bytes(b"NOTAPACK");
        w.write_u16(SENTINEL_CRLF);
        w.write_u32(SENTINEL_EOF);
        assert!(matches!(
            decode_container(&w.into_bytes(), &Stored::default()),
            Err(Error::NotAValidContainer { offset: 0, .. })
        ));
    }

    #[test]
    fn damaged_sentinel_is_rejected() {
        let mut w = Writer::new();
        w.write_bytes(&CONTAINER_MAGIC);
        // A CRLF -> LF translation eats the 0x0D.
        w.write_u16(0x0A0A);
        w.write_u32(SENTINEL_EOF);
        assert!(matches!(
            decode_container(&w.into_bytes(), &Stored::default()),
            Err(Error::NotAValidContainer { .. })
        ));
    }

    #[test]
    fn future_version_is_rejected() {
        let mut w = Writer::new();
        w.write_bytes(&CONTAINER_MAGIC);
        w.write_u16(SENTINEL_CRLF);
        w.write_u32(SENTINEL_EOF);
        w.write_u16(3);
        assert!(matches!(
            decode_container(&w.into_bytes(), &Stored::default()),
            Err(Error::UnsupportedVersion { version: 3 })
        ));
    }

    #[test]
    fn unknown_signature_is_rejected() {
        let mut w = Writer::new();
        write_header(&mut w, 0, 0);
        write_chunk(&mut w, Signature(*b"WHAT"), &[1, 2, 3, 4]);
        write_end(&mut w);
        assert!(matches!(
            decode_container(&w.into_bytes(), &Stored::default()),
            Err(Error::NotAValidContainer { .. })
        ));
    }

    #[test]
    fn zero_compressed_size_skips_the_service() {
        let mut w = Writer::new();
        write_header(&mut w, 1, 0);
        write_chunk(&mut w, Signature::METADATA, &[]);
        write_end(&mut w);
        let stored = Stored::default();
        let container = decode_container(&w.into_bytes(), &stored).unwrap();

        assert_eq!(stored.calls.get(), 0);
        assert_eq!(container.chunks.len(), 1);
        assert!(container.chunks[0].payload.is_empty());
        assert_eq!(container.metadata().unwrap().entries.len(), 0);
    }

    #[test]
    fn size_mismatch_is_fatal() {
        let mut w = Writer::new();
        write_header(&mut w, 0, 0);
        write_chunk(&mut w, Signature::METADATA, &Metadata::default().encode());
        write_end(&mut w);
        assert!(matches!(
            decode_container(&w.into_bytes(), &ShortOutput),
            Err(Error::DecompressionSizeMismatch { .. })
        ));
    }

    #[test]
    fn absurd_declared_size_is_rejected() {
        let mut w = Writer::new();
        write_header(&mut w, 0, 0);
        w.write_bytes(&Signature::METADATA.0);
        w.write_u32(4);
        w.write_u32(u32::MAX);
        w.write_u32(0);
        w.write_u32(0xAAAA_AAAA);
        write_end(&mut w);
        assert!(matches!(
            decode_container(&w.into_bytes(), &Stored::default()),
            Err(Error::NotAValidContainer { .. })
        ));
    }

    #[test]
    fn trailing_bytes_after_end_are_ignored() {
        let mut w = Writer::new();
        write_header(&mut w, 0, 0);
        write_end(&mut w);
        w.write_bytes(b"padding the file out");
        assert!(decode_container(&w.into_bytes(), &Stored::default())
            .unwrap()
            .chunks
            .is_empty());
    }

    #[test]
    fn full_container_round_trip() {
        let meta = Metadata {
            entries: vec![("engine".into(), "2022.3.9f1".into())],
        };
        let instances = InstanceTable {
            version: InstanceTableVersion(1),
            instances: vec![Instance {
                class_id: 23,
                class_name: "MeshRenderer".into(),
                has_service: false,
                references: vec![12, 14, 13],
                flags: Some(vec![true, true, false]),
            }],
        };
        let props = PropertyTable {
            records: vec![PropertyRecord {
                class_id: 23,
                name: "m_CastShadows".into(),
                value: Some(PropValue::Bool(true)),
            }],
        };
        let links = RelationTable {
            parents: vec![1, 1],
            children: vec![12, 14],
        };
        let objects_payload = {
            let schema = SchemaNode::composite(
                "Item",
                "Base",
                vec![
                    SchemaNode::leaf("string", "name"),
                    SchemaNode::leaf("int", "value"),
                ],
            );
            let mut w = Writer::new();
            schema.write_embedded(&mut w);
            w.write_u32(1);
            w.write_string("lamp");
            w.write_i32(3);
            w.into_bytes()
        };

        let mut w = Writer::new();
        write_header(&mut w, 4, 1);
        write_chunk(&mut w, Signature::METADATA, &meta.encode());
        write_chunk(&mut w, Signature::INSTANCES, &instances.encode().unwrap());
        write_chunk(&mut w, Signature::PROPERTIES, &props.encode());
        write_chunk(&mut w, Signature::OBJECTS, &objects_payload);
        write_chunk(&mut w, Signature::LINKS, &links.encode().unwrap());
        write_end(&mut w);

        let stored = Stored::default();
        let container = decode_container(&w.into_bytes(), &stored).unwrap();

        // One service call per non-empty chunk, in encounter order.
        assert_eq!(stored.calls.get(), 5);
        let tags: Vec<&str> = container
            .chunks
            .iter()
            .map(|c| c.signature.as_str())
            .collect();
        assert_eq!(tags, ["META", "INST", "PROP", "OBJS", "LINK"]);

        assert_eq!(
            container.metadata().unwrap().get("engine"),
            Some("2022.3.9f1")
        );
        assert_eq!(container.instances().unwrap().instances[0].class_id, 23);
        assert_eq!(
            container.properties().unwrap().get(23, "m_CastShadows"),
            Some(&PropValue::Bool(true))
        );
        assert_eq!(container.links().unwrap().children, vec![12, 14]);

        let objects = container.objects().unwrap();
        assert_eq!(objects.objects.len(), 1);
        assert_eq!(
            objects.objects[0].field("name").and_then(Value::as_str),
            Some("lamp")
        );
    }
}
