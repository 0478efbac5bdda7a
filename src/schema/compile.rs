//! Schema compilation: turning a [`SchemaNode`] tree into a reusable decode
//! routine.
//!
//! Compilation walks the tree bottom-up once and emits a small instruction
//! tree (`Op`); decoding then interprets those instructions against a
//! [`Reader`]. The host never generates code at runtime, but the shape of the
//! work is the same: pay the schema walk once per distinct schema, then decode
//! any number of records with the flat routine. [`SchemaCompiler`] memoizes
//! routines by structural signature so files holding thousands of records of
//! the same few shapes compile each shape exactly once.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::cursor::Reader;
use crate::error::{Error, Result};
use crate::packed::{PackedFloatVector, PackedIntVector, PackedQuatVector};
use crate::value::{ObjectRef, Record, Value};
use crate::MAX_SCHEMA_DEPTH;

use super::SchemaNode;

/// Leaf read routines the interpreter knows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PrimitiveKind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F16,
    F32,
    F64,
    Str,
    PackedInts,
    PackedFloats,
    PackedQuats,
}

impl PrimitiveKind {
    fn from_type_name(name: &str) -> Option<Self> {
        use PrimitiveKind::*;
        Some(match name {
            "bool" => Bool,
            "SInt8" => I8,
            "UInt8" | "char" => U8,
            "SInt16" | "short" => I16,
            "UInt16" | "unsigned short" => U16,
            "SInt32" | "int" => I32,
            "UInt32" | "unsigned int" => U32,
            "SInt64" | "long long" => I64,
            "UInt64" | "unsigned long long" => U64,
            "half" => F16,
            "float" => F32,
            "double" => F64,
            "string" => Str,
            "PackedIntVector" => PackedInts,
            "PackedFloatVector" => PackedFloats,
            "PackedQuatVector" => PackedQuats,
            _ => return None,
        })
    }

    /// Whether this kind can serve as an array count.
    fn is_integer(self) -> bool {
        use PrimitiveKind::*;
        matches!(self, I8 | U8 | I16 | U16 | I32 | U32 | I64 | U64)
    }

    fn read(self, r: &mut Reader) -> Result<Value> {
        use PrimitiveKind::*;
        Ok(match self {
            Bool => Value::Bool(r.read_bool()?),
            I8 => Value::Int(i64::from(r.read_i8()?)),
            U8 => Value::UInt(u64::from(r.read_u8()?)),
            I16 => Value::Int(i64::from(r.read_i16()?)),
            U16 => Value::UInt(u64::from(r.read_u16()?)),
            I32 => Value::Int(i64::from(r.read_i32()?)),
            U32 => Value::UInt(u64::from(r.read_u32()?)),
            I64 => Value::Int(r.read_i64()?),
            U64 => Value::UInt(r.read_u64()?),
            F16 => Value::Float(r.read_f16()?),
            F32 => Value::Float(r.read_f32()?),
            F64 => Value::Double(r.read_f64()?),
            Str => Value::String(r.read_string()?.to_owned()),
            PackedInts => Value::UInts(
                PackedIntVector::read(r)?
                    .unpack()
                    .into_iter()
                    .map(u64::from)
                    .collect(),
            ),
            PackedFloats => Value::PackedFloats(PackedFloatVector::read(r)?.unpack()),
            PackedQuats => Value::Quats(PackedQuatVector::read(r)?.unpack()),
        })
    }
}

/// One compiled instruction. The closed set replaces per-type generated code.
#[derive(Debug)]
enum Op {
    Primitive {
        name: String,
        kind: PrimitiveKind,
    },
    Array {
        name: String,
        count: PrimitiveKind,
        count_align: bool,
        elem: Box<Op>,
        elem_align: bool,
    },
    Reference {
        name: String,
    },
    Nested {
        name: String,
        ops: Vec<Op>,
    },
    Align {
        boundary: usize,
    },
}

impl Op {
    fn name(&self) -> &str {
        match self {
            Op::Primitive { name, .. }
            | Op::Array { name, .. }
            | Op::Reference { name }
            | Op::Nested { name, .. } => name,
            Op::Align { .. } => "",
        }
    }

    fn decode(&self, r: &mut Reader) -> Result<Value> {
        match self {
            Op::Primitive { kind, .. } => kind.read(r),
            Op::Reference { .. } => {
                let file_index = r.read_i32()?;
                let path_id = r.read_i64()?;
                Ok(Value::Reference(ObjectRef {
                    file_index,
                    path_id,
                }))
            }
            Op::Nested { ops, .. } => {
                let mut fields = Vec::with_capacity(ops.len());
                for op in ops {
                    if let Op::Align { boundary } = op {
                        r.align(*boundary);
                        continue;
                    }
                    fields.push((op.name().to_owned(), op.decode(r)?));
                }
                Ok(Value::Record(Record::new(fields)))
            }
            Op::Array {
                count,
                count_align,
                elem,
                elem_align,
                ..
            } => {
                let n = match count.read(r)? {
                    Value::Int(v) if v >= 0 => v as usize,
                    Value::Int(v) => return Err(Error::NegativeCount { count: v }),
                    Value::UInt(v) => v as usize,
                    // Count kinds are vetted at compile time.
                    other => {
                        return Err(Error::UnsupportedFieldType(other.kind().to_owned()));
                    }
                };
                if *count_align {
                    r.align(4);
                }
                self.decode_elements(r, n, elem, *elem_align)
            }
            Op::Align { .. } => unreachable!("alignment is handled by the enclosing op"),
        }
    }

    fn decode_elements(
        &self,
        r: &mut Reader,
        n: usize,
        elem: &Op,
        elem_align: bool,
    ) -> Result<Value> {
        use PrimitiveKind::*;

        // Primitive elements collapse into one fixed-width numeric sequence
        // instead of a value per element.
        if let Op::Primitive { kind, .. } = elem {
            match kind {
                I8 | I16 | I32 | I64 => {
                    let mut out = Vec::with_capacity(n.min(1 << 16));
                    for _ in 0..n {
                        match kind.read(r)? {
                            Value::Int(v) => out.push(v),
                            _ => unreachable!(),
                        }
                        if elem_align {
                            r.align(4);
                        }
                    }
                    return Ok(Value::Ints(out));
                }
                Bool | U8 | U16 | U32 | U64 => {
                    let mut out = Vec::with_capacity(n.min(1 << 16));
                    for _ in 0..n {
                        match kind.read(r)? {
                            Value::UInt(v) => out.push(v),
                            Value::Bool(v) => out.push(u64::from(v)),
                            _ => unreachable!(),
                        }
                        if elem_align {
                            r.align(4);
                        }
                    }
                    return Ok(Value::UInts(out));
                }
                F16 | F32 | F64 => {
                    let mut out = Vec::with_capacity(n.min(1 << 16));
                    for _ in 0..n {
                        match kind.read(r)? {
                            Value::Float(v) => out.push(f64::from(v)),
                            Value::Double(v) => out.push(v),
                            _ => unreachable!(),
                        }
                        if elem_align {
                            r.align(4);
                        }
                    }
                    return Ok(Value::Floats(out));
                }
                Str | PackedInts | PackedFloats | PackedQuats => {}
            }
        }

        let mut out = Vec::with_capacity(n.min(1 << 16));
        for _ in 0..n {
            out.push(elem.decode(r)?);
            if elem_align {
                r.align(4);
            }
        }
        Ok(Value::Array(out))
    }
}

/// Whether a 4-byte alignment step follows this node's value. An array in
/// surrogate form carries the flag on the collapsed body as often as on the
/// wrapper, so both are honored.
fn align_after_value(node: &SchemaNode) -> bool {
    node.align_after() || node.array_surrogate().is_some_and(|body| body.align_after())
}

/// A compiled, reusable decode routine for one schema signature.
///
/// Pure: decoding reads only from the cursor it is given and touches no
/// shared state, so one routine may serve any number of buffers.
#[derive(Debug)]
pub struct CompiledDecoder {
    root: Op,
    align_after: bool,
}

impl CompiledDecoder {
    fn build(schema: &SchemaNode) -> Result<Self> {
        Ok(Self {
            root: compile_node(schema, None, 0)?,
            align_after: align_after_value(schema),
        })
    }

    /// Decode one record from the cursor.
    pub fn decode(&self, r: &mut Reader) -> Result<Value> {
        let value = self.root.decode(r)?;
        if self.align_after {
            r.align(4);
        }
        Ok(value)
    }
}

fn compile_node(node: &SchemaNode, rename: Option<&str>, depth: usize) -> Result<Op> {
    if depth >= MAX_SCHEMA_DEPTH {
        return Err(Error::SchemaDepthExceeded {
            limit: MAX_SCHEMA_DEPTH,
        });
    }
    let name = rename.unwrap_or(&node.field_name).to_owned();

    if let Some(kind) = PrimitiveKind::from_type_name(&node.type_name) {
        return Ok(Op::Primitive { name, kind });
    }

    if node.type_name.starts_with("PPtr<") && node.type_name.ends_with('>') {
        return Ok(Op::Reference { name });
    }

    if node.type_name == "Array" {
        let [count_node, elem_node] = node.children.as_slice() else {
            return Err(Error::UnsupportedFieldType(format!(
                "Array `{}` without count and element children",
                node.field_name
            )));
        };
        let count = PrimitiveKind::from_type_name(&count_node.type_name)
            .filter(|kind| kind.is_integer())
            .ok_or_else(|| Error::UnsupportedFieldType(count_node.type_name.clone()))?;
        let elem = compile_node(elem_node, None, depth + 1)?;
        return Ok(Op::Array {
            name,
            count,
            count_align: count_node.align_after(),
            elem: Box::new(elem),
            elem_align: align_after_value(elem_node),
        });
    }

    if let Some(body) = node.array_surrogate() {
        // Collapse the synthetic wrapper: the body decodes under the
        // wrapper's field name.
        return compile_node(body, Some(&node.field_name), depth + 1);
    }

    if node.children.is_empty() {
        return Err(Error::UnsupportedFieldType(node.type_name.clone()));
    }

    let mut ops = Vec::with_capacity(node.children.len());
    for child in &node.children {
        ops.push(compile_node(child, None, depth + 1)?);
        if align_after_value(child) {
            ops.push(Op::Align { boundary: 4 });
        }
    }
    Ok(Op::Nested { name, ops })
}

/// Observer hook for compile events, standing in for global statistics
/// counters. Mostly useful to assert memoization in tests and to feed
/// whatever metrics pipeline the host application runs.
pub trait CompileObserver: Send + Sync {
    fn on_compile(&self, signature: u64);
}

/// Memoizing schema compiler.
///
/// The cache is append-only and safe under concurrent use: entries are
/// immutable once inserted, and a racing recompile produces an equivalent
/// routine whose insert loses harmlessly.
#[derive(Default)]
pub struct SchemaCompiler {
    cache: RwLock<HashMap<u64, Arc<CompiledDecoder>>>,
    observer: Option<Box<dyn CompileObserver>>,
}

impl SchemaCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: Box<dyn CompileObserver>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            observer: Some(observer),
        }
    }

    /// Compile `schema`, reusing the cached routine when one exists for its
    /// structural signature.
    pub fn compile(&self, schema: &SchemaNode) -> Result<Arc<CompiledDecoder>> {
        let signature = schema.signature();
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(decoder) = cache.get(&signature) {
                return Ok(decoder.clone());
            }
        }

        // Emit outside the lock; compilation is deterministic and
        // side-effect-free, so a racing loser is identical and discarded.
        let decoder = Arc::new(CompiledDecoder::build(schema)?);
        log::debug!(
            "compiled schema `{}` (signature {signature:#018x})",
            schema.type_name
        );
        if let Some(observer) = &self.observer {
            observer.on_compile(signature);
        }

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        Ok(cache.entry(signature).or_insert(decoder).clone())
    }

    /// Number of distinct signatures compiled so far.
    pub fn cached_routines(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// The process-wide compiler used by container decoding.
pub fn shared_compiler() -> &'static SchemaCompiler {
    static SHARED: OnceLock<SchemaCompiler> = OnceLock::new();
    SHARED.get_or_init(SchemaCompiler::new)
}

/// Compile against the process-wide cache. See [`SchemaCompiler::compile`].
pub fn compile_schema(schema: &SchemaNode) -> Result<Arc<CompiledDecoder>> {
    shared_compiler().compile(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Writer;
    use crate::schema::TYPE_FLAG_ARRAY;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);

    impl CompileObserver for Counter {
        fn on_compile(&self, _signature: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn name_value_schema() -> SchemaNode {
        SchemaNode::composite(
            "Asset",
            "Base",
            vec![
                SchemaNode::leaf("string", "name"),
                SchemaNode::leaf("int", "value"),
            ],
        )
    }

    #[test]
    fn decodes_name_value_record() {
        let decoder = SchemaCompiler::new().compile(&name_value_schema()).unwrap();
        let mut w = Writer::new();
        w.write_string("abc");
        w.write_i32(42);
        let buf = w.into_bytes();

        let value = decoder.decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(value.field("name").and_then(Value::as_str), Some("abc"));
        assert_eq!(value.field("value").and_then(Value::as_i64), Some(42));
        let names: Vec<&str> = value.as_record().unwrap().field_names().collect();
        assert_eq!(names, ["name", "value"]);
    }

    #[test]
    fn compiles_once_per_signature() {
        let count = Arc::new(AtomicUsize::new(0));
        let compiler = SchemaCompiler::with_observer(Box::new(Counter(count.clone())));

        let first = compiler.compile(&name_value_schema()).unwrap();
        let second = compiler.compile(&name_value_schema()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));

        // A structurally different schema is a fresh compile.
        compiler
            .compile(&SchemaNode::composite(
                "Other",
                "Base",
                vec![SchemaNode::leaf("float", "x")],
            ))
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(compiler.cached_routines(), 2);
    }

    #[test]
    fn cached_decoders_behave_identically() {
        let compiler = SchemaCompiler::new();
        let a = compiler.compile(&name_value_schema()).unwrap();
        let b = compiler.compile(&name_value_schema()).unwrap();

        let mut w = Writer::new();
        w.write_string("xy");
        w.write_i32(-7);
        let buf = w.into_bytes();
        assert_eq!(
            a.decode(&mut Reader::new(&buf)).unwrap(),
            b.decode(&mut Reader::new(&buf)).unwrap()
        );
    }

    #[test]
    fn primitive_array_collapses_to_numeric_sequence() {
        let schema = SchemaNode::array(
            "indices",
            SchemaNode::leaf("int", "size"),
            SchemaNode::leaf("UInt16", "data"),
        );
        let decoder = SchemaCompiler::new().compile(&schema).unwrap();

        let mut w = Writer::new();
        w.write_i32(3);
        for v in [7u16, 8, 9] {
            w.write_u16(v);
        }
        let buf = w.into_bytes();
        assert_eq!(
            decoder.decode(&mut Reader::new(&buf)).unwrap(),
            Value::UInts(vec![7, 8, 9])
        );
    }

    #[test]
    fn record_array_keeps_field_names() {
        let schema = SchemaNode::array(
            "points",
            SchemaNode::leaf("int", "size"),
            SchemaNode::composite(
                "Point",
                "data",
                vec![
                    SchemaNode::leaf("float", "x"),
                    SchemaNode::leaf("float", "y"),
                ],
            ),
        );
        let decoder = SchemaCompiler::new().compile(&schema).unwrap();

        let mut w = Writer::new();
        w.write_i32(2);
        for v in [1.0f32, 2.0, 3.0, 4.0] {
            w.write_f32(v);
        }
        let buf = w.into_bytes();

        let Value::Array(points) = decoder.decode(&mut Reader::new(&buf)).unwrap() else {
            panic!("expected array of records");
        };
        assert_eq!(points.len(), 2);
        let names: Vec<&str> = points[1].as_record().unwrap().field_names().collect();
        assert_eq!(names, ["x", "y"]);
        assert_eq!(points[1].field("y").unwrap(), &Value::Float(4.0));
    }

    #[test]
    fn surrogate_wrapper_collapses() {
        let mut body = SchemaNode::array(
            "data",
            SchemaNode::leaf("int", "size"),
            SchemaNode::leaf("float", "data"),
        );
        body.type_flags |= TYPE_FLAG_ARRAY;
        let schema = SchemaNode::composite(
            "Mesh",
            "Base",
            vec![SchemaNode::composite("vector", "weights", vec![body])],
        );
        let decoder = SchemaCompiler::new().compile(&schema).unwrap();

        let mut w = Writer::new();
        w.write_i32(2);
        w.write_f32(0.25);
        w.write_f32(0.75);
        let buf = w.into_bytes();

        let value = decoder.decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(
            value.field("weights").unwrap(),
            &Value::Floats(vec![0.25, 0.75])
        );
    }

    #[test]
    fn alignment_step_is_emitted() {
        let schema = SchemaNode::composite(
            "Asset",
            "Base",
            vec![
                SchemaNode::leaf("UInt8", "kind").aligned(),
                SchemaNode::leaf("unsigned int", "payload"),
            ],
        );
        let decoder = SchemaCompiler::new().compile(&schema).unwrap();

        let mut w = Writer::new();
        w.write_u8(5);
        w.align(4);
        w.write_u32(0xCAFE);
        let buf = w.into_bytes();

        let value = decoder.decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(value.field("payload").and_then(Value::as_u64), Some(0xCAFE));
    }

    #[test]
    fn references_stay_unresolved() {
        let schema = SchemaNode::composite(
            "Renderer",
            "Base",
            vec![SchemaNode::leaf("PPtr<Material>", "material")],
        );
        let decoder = SchemaCompiler::new().compile(&schema).unwrap();

        let mut w = Writer::new();
        w.write_i32(2);
        w.write_i64(0x1122334455);
        let buf = w.into_bytes();

        let value = decoder.decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(
            value.field("material").and_then(Value::as_reference),
            Some(ObjectRef {
                file_index: 2,
                path_id: 0x1122334455
            })
        );
    }

    #[test]
    fn packed_vector_leaf() {
        let schema = SchemaNode::composite(
            "CompressedMesh",
            "Base",
            vec![SchemaNode::leaf("PackedIntVector", "triangles")],
        );
        let decoder = SchemaCompiler::new().compile(&schema).unwrap();

        let mut w = Writer::new();
        PackedIntVector::pack(&[3, 1, 2], 2).unwrap().write(&mut w);
        let buf = w.into_bytes();

        let value = decoder.decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(
            value.field("triangles").unwrap(),
            &Value::UInts(vec![3, 1, 2])
        );
    }

    #[test]
    fn unknown_type_fails_fast() {
        let schema = SchemaNode::composite(
            "Asset",
            "Base",
            vec![SchemaNode::leaf("Quaternion17", "rotation")],
        );
        match SchemaCompiler::new().compile(&schema) {
            Err(Error::UnsupportedFieldType(name)) => assert_eq!(name, "Quaternion17"),
            other => panic!("expected UnsupportedFieldType, got {other:?}"),
        }
    }

    #[test]
    fn negative_count_is_rejected() {
        let schema = SchemaNode::array(
            "data",
            SchemaNode::leaf("int", "size"),
            SchemaNode::leaf("UInt8", "data"),
        );
        let decoder = SchemaCompiler::new().compile(&schema).unwrap();
        let mut w = Writer::new();
        w.write_i32(-1);
        let buf = w.into_bytes();
        assert!(matches!(
            decoder.decode(&mut Reader::new(&buf)),
            Err(Error::NegativeCount { count: -1 })
        ));
    }

    #[test]
    fn compile_depth_guard() {
        let mut node = SchemaNode::leaf("int", "leaf");
        for i in 0..MAX_SCHEMA_DEPTH {
            node = SchemaNode::composite("Wrap", format!("level{i}"), vec![node]);
        }
        assert!(matches!(
            SchemaCompiler::new().compile(&node),
            Err(Error::SchemaDepthExceeded { .. })
        ));
    }
}
