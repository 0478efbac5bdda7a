//! Dynamic values produced by schema-driven decoding.
//!
//! Records decoded through a compiled schema have no compile-time type, so
//! they land in [`Value`], a closed union of the shapes a schema can express.
//! A [`Record`] keeps its fields in schema order, which is what reflective
//! exporters need; `Value` implements [`serde::Serialize`] so a decoded
//! object can be handed straight to any serde backend without per-type code.

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// A weak, non-owning handle to another record: file table index plus path id.
///
/// Decoding never resolves these. Once a full object registry exists, resolve
/// handles in a second pass with [`ObjectRef::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ObjectRef {
    pub file_index: i32,
    pub path_id: i64,
}

impl ObjectRef {
    /// Whether this is the null reference (no target).
    pub fn is_null(&self) -> bool {
        self.path_id == 0
    }

    /// Look the handle up in a caller-supplied registry. `None` when the
    /// handle is null or the registry has no such object.
    pub fn resolve<'a, T>(
        &self,
        registry: &'a std::collections::HashMap<(i32, i64), T>,
    ) -> Option<&'a T> {
        if self.is_null() {
            return None;
        }
        registry.get(&(self.file_index, self.path_id))
    }
}

/// An ordered set of named values, one per schema field.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new(fields: Vec<(String, Value)>) -> Self {
        Self { fields }
    }

    /// Field values in schema order.
    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    /// Ordered field names, for reflective export.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A decoded dynamic value.
///
/// Primitive arrays keep their own compact variants (`Ints`, `UInts`,
/// `Floats`) instead of boxing every element; `Array` is reserved for
/// sequences of nested records.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Ints(Vec<i64>),
    UInts(Vec<u64>),
    Floats(Vec<f64>),
    PackedFloats(Vec<f32>),
    Quats(Vec<[f32; 4]>),
    Reference(ObjectRef),
    Array(Vec<Value>),
    Record(Record),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Ints(_) => "ints",
            Value::UInts(_) => "uints",
            Value::Floats(_) => "floats",
            Value::PackedFloats(_) => "packed floats",
            Value::Quats(_) => "quats",
            Value::Reference(_) => "reference",
            Value::Array(_) => "array",
            Value::Record(_) => "record",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<ObjectRef> {
        match self {
            Value::Reference(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(v) => Some(v),
            _ => None,
        }
    }

    /// Index into a record field by name, or `None` for any other shape.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.as_record().and_then(|r| r.get(name))
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::UInt(v) => serializer.serialize_u64(*v),
            Value::Float(v) => serializer.serialize_f32(*v),
            Value::Double(v) => serializer.serialize_f64(*v),
            Value::String(v) => serializer.serialize_str(v),
            Value::Bytes(v) => serde_bytes::Bytes::new(v).serialize(serializer),
            Value::Ints(v) => v.serialize(serializer),
            Value::UInts(v) => v.serialize(serializer),
            Value::Floats(v) => v.serialize(serializer),
            Value::PackedFloats(v) => v.serialize(serializer),
            Value::Quats(v) => {
                let mut seq = serializer.serialize_seq(Some(v.len()))?;
                for q in v {
                    seq.serialize_element(q)?;
                }
                seq.end()
            }
            Value::Reference(v) => v.serialize(serializer),
            Value::Array(v) => v.serialize(serializer),
            Value::Record(v) => {
                let mut map = serializer.serialize_map(Some(v.len()))?;
                for (name, value) in v.fields() {
                    map.serialize_entry(name, value)?;
                }
                map.end()
            }
        }
    }
}
