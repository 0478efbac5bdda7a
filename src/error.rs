use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure modes for container and codec decoding.
///
/// Container- and schema-level errors abort the decode of the whole buffer.
/// The one exception is a typed-property record, which degrades to an absent
/// value instead (see [`PropertyTable`][crate::container::PropertyTable]).
#[derive(Debug, Error)]
pub enum Error {
    /// The buffer does not carry the container magic/sentinel fingerprint.
    #[error("not a valid container: {reason} at offset {offset:#x}")]
    NotAValidContainer { reason: String, offset: usize },

    /// The container version field holds a value this crate does not decode.
    #[error("unsupported container version {version}")]
    UnsupportedVersion { version: u16 },

    /// A cursor read would run past the end of the buffer.
    #[error("read of {need} bytes at offset {offset:#x} overruns buffer (have {have})")]
    OutOfRange {
        offset: usize,
        need: usize,
        have: usize,
    },

    /// The schema compiler met a type name it has no decode routine for.
    #[error("unsupported field type `{0}`")]
    UnsupportedFieldType(String),

    /// A chunk payload decompressed to a different size than its header declared.
    #[error("decompressed to {actual} bytes, chunk header declared {expected}")]
    DecompressionSizeMismatch { expected: usize, actual: usize },

    /// A packed vector declared a bit width outside 1..=32.
    #[error("packed bit size {0} outside 1..=32")]
    BadBitSize(u8),

    /// A value handed to the integer packer does not fit its bit width.
    #[error("value {value} does not fit in {bit_size} bits")]
    PackedOverflow { value: u32, bit_size: u8 },

    /// A reference-ID delta sum left the representable range.
    #[error("reference id sum {value} overflows the id range")]
    ReferenceOverflow { value: i64 },

    /// A variable-length integer ran too long or held out-of-range bits.
    #[error("malformed variable-length integer at offset {offset:#x}")]
    BadVarInt { offset: usize },

    /// A string field held bytes that are not UTF-8.
    #[error("string at offset {offset:#x} is not valid UTF-8")]
    InvalidString {
        offset: usize,
        #[source]
        source: std::str::Utf8Error,
    },

    /// A remote schema blob failed structural parsing.
    #[error("bad schema blob: {reason}")]
    BadSchemaBlob { reason: String },

    /// A schema blob parsed fine but holds no entry for the requested type.
    #[error("schema blob for version {version} has no type {type_id}")]
    UnknownSchemaType { version: String, type_id: i32 },

    /// An array count field decoded to a negative value.
    #[error("negative array count {count}")]
    NegativeCount { count: i64 },

    /// Schema nesting passed the depth guard.
    #[error("schema nesting deeper than {limit} levels")]
    SchemaDepthExceeded { limit: usize },

    /// An external collaborator (decompressor, fetcher, decompiler) failed.
    #[error("external service failure: {0}")]
    Service(String),
}
