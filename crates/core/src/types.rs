//! Type Descriptors and Forms
//!
//! Every runtime value carries (through its block header) a pointer to the
//! `Form` of its type: the per-type operation table plus a back pointer to
//! the owning `Type`. There is exactly one `Form` per `Type`, chosen at
//! type-construction time; no subtype dispatch is involved.
//!
//! Types are constructed once (basic types and shared singletons in the
//! process-wide `Universe`, program types at program-link time) and are
//! immutable and alive for the rest of the process, so they are handed out
//! as `&'static Type`.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::form::{self, FormOps};
use crate::heap::StaticHeap;
use crate::tagged::Val;
use crate::val;

/// Types live for the process lifetime.
pub type TypeRef = &'static Type;

/// The per-type operation table attached to each heap value.
pub struct Form {
    pub ops: &'static FormOps,
    type_: *const Type,
}

impl Form {
    /// The type this form belongs to.
    #[inline]
    pub fn type_(&self) -> TypeRef {
        // Safety: set once in Type::alloc to the leaked, immortal Type.
        unsafe { &*self.type_ }
    }
}

// Safety: Form and Type are immutable after construction and the back
// pointer targets leaked (immortal) storage.
unsafe impl Send for Form {}
unsafe impl Sync for Form {}

pub struct Type {
    kind: TypeKind,
    form: Form,
}

unsafe impl Send for Type {}
unsafe impl Sync for Type {}

pub enum TypeKind {
    Bool,
    Int,
    UInt,
    Float,
    Time,
    Fingerprint,
    Bytes,
    String,
    Array(ArrayType),
    Map(MapType),
    Tuple(TupleType),
    Function(FunctionType),
}

pub struct ArrayType {
    pub elem: TypeRef,
}

pub struct MapType {
    pub key: TypeRef,
    pub value: TypeRef,
}

pub struct FunctionType {
    pub params: Vec<TypeRef>,
    pub result: Option<TypeRef>,
}

/// Wire-level semantic encoding of a proto field (for array fields, of its
/// elements).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoEncoding {
    Varint,
    ZigZag,
    Fixed32,
    Fixed64,
    Float32,
    Float64,
    Bool,
    Str,
    Bytes,
    Message,
    Group,
}

/// One tuple field. Fields never read by the program receive no slot; the
/// slot count of the tuple counts only referenced fields.
pub struct Field {
    pub name: String,
    pub type_: TypeRef,
    /// Slot index in the tuple value, if the field is referenced.
    pub slot: Option<u32>,
    /// Proto tag, for proto tuples.
    pub tag: Option<u32>,
    pub encoding: ProtoEncoding,
    pub read: bool,
}

pub struct TupleType {
    pub fields: Vec<Field>,
    pub nslots: u32,
    pub is_proto: bool,
    /// Length-delimited message framing; proto tuples not marked message
    /// use group framing.
    pub is_message: bool,
    tag_map: HashMap<u32, usize>,
    default_tuple: OnceLock<Val>,
}

impl TupleType {
    /// Field index for a proto tag, if any.
    pub fn field_for_tag(&self, tag: u32) -> Option<usize> {
        self.tag_map.get(&tag).copied()
    }

    /// Pre-allocated read-only default tuple, once built.
    pub fn default_tuple(&self) -> Option<Val> {
        self.default_tuple.get().copied()
    }

    /// Install the read-only default tuple. May only be done once.
    pub fn set_default_tuple(&self, v: Val) {
        debug_assert!(v.is_readonly());
        let _ = self.default_tuple.set(v);
    }
}

/// Specification of a tuple field, consumed by `Type::tuple`.
pub struct FieldSpec {
    pub name: String,
    pub type_: TypeRef,
    pub tag: Option<u32>,
    pub read: bool,
    pub encoding: Option<ProtoEncoding>,
}

impl FieldSpec {
    pub fn new(name: &str, type_: TypeRef) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            type_,
            tag: None,
            read: true,
            encoding: None,
        }
    }

    pub fn with_tag(mut self, tag: u32) -> FieldSpec {
        self.tag = Some(tag);
        self
    }

    pub fn unread(mut self) -> FieldSpec {
        self.read = false;
        self
    }

    pub fn with_encoding(mut self, e: ProtoEncoding) -> FieldSpec {
        self.encoding = Some(e);
        self
    }
}

fn default_encoding(t: TypeRef) -> ProtoEncoding {
    match t.kind() {
        TypeKind::Bool => ProtoEncoding::Bool,
        TypeKind::Int | TypeKind::UInt | TypeKind::Time | TypeKind::Fingerprint => {
            ProtoEncoding::Varint
        }
        TypeKind::Float => ProtoEncoding::Float64,
        TypeKind::Bytes => ProtoEncoding::Bytes,
        TypeKind::String => ProtoEncoding::Str,
        TypeKind::Array(a) => default_encoding(a.elem),
        TypeKind::Tuple(t) => {
            if t.is_message {
                ProtoEncoding::Message
            } else {
                ProtoEncoding::Group
            }
        }
        TypeKind::Map(_) | TypeKind::Function(_) => ProtoEncoding::Bytes,
    }
}

impl Type {
    /// Construct a type with the form chosen by kind. The type is leaked:
    /// types live for the process lifetime by design.
    fn alloc(kind: TypeKind) -> TypeRef {
        let ops = match &kind {
            TypeKind::Bool => &form::BOOL_OPS,
            TypeKind::Int => &form::INT_OPS,
            TypeKind::UInt => &form::UINT_OPS,
            TypeKind::Float => &form::FLOAT_OPS,
            TypeKind::Time => &form::TIME_OPS,
            TypeKind::Fingerprint => &form::FINGERPRINT_OPS,
            TypeKind::Bytes => &form::BYTES_OPS,
            TypeKind::String => &form::STRING_OPS,
            TypeKind::Array(_) => &form::ARRAY_OPS,
            TypeKind::Map(_) => &form::MAP_OPS,
            TypeKind::Tuple(_) => &form::TUPLE_OPS,
            TypeKind::Function(_) => &form::CLOSURE_OPS,
        };
        let t = Box::leak(Box::new(Type {
            kind,
            form: Form {
                ops,
                type_: std::ptr::null(),
            },
        }));
        t.form.type_ = t as *const Type;
        t
    }

    pub fn array(elem: TypeRef) -> TypeRef {
        Type::alloc(TypeKind::Array(ArrayType { elem }))
    }

    pub fn map(key: TypeRef, value: TypeRef) -> TypeRef {
        Type::alloc(TypeKind::Map(MapType { key, value }))
    }

    pub fn function(params: Vec<TypeRef>, result: Option<TypeRef>) -> TypeRef {
        Type::alloc(TypeKind::Function(FunctionType { params, result }))
    }

    /// Build a tuple type: slots are assigned in declaration order to the
    /// referenced fields (dead fields receive none), the in-proto bit of a
    /// field is its slot index, and the tag map indexes proto fields.
    pub fn tuple(specs: Vec<FieldSpec>, is_proto: bool, is_message: bool) -> TypeRef {
        let mut fields = Vec::with_capacity(specs.len());
        let mut tag_map = HashMap::new();
        let mut nslots = 0u32;
        for (i, spec) in specs.into_iter().enumerate() {
            let slot = if spec.read {
                nslots += 1;
                Some(nslots - 1)
            } else {
                None
            };
            if let Some(tag) = spec.tag {
                tag_map.insert(tag, i);
            }
            let encoding = spec.encoding.unwrap_or_else(|| default_encoding(spec.type_));
            fields.push(Field {
                name: spec.name,
                type_: spec.type_,
                slot,
                tag: spec.tag,
                encoding,
                read: spec.read,
            });
        }
        Type::alloc(TypeKind::Tuple(TupleType {
            fields,
            nslots,
            is_proto,
            is_message,
            tag_map,
            default_tuple: OnceLock::new(),
        }))
    }

    #[inline]
    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    #[inline]
    pub fn form(&self) -> &Form {
        &self.form
    }

    pub fn is_bool(&self) -> bool {
        matches!(self.kind, TypeKind::Bool)
    }
    pub fn is_int(&self) -> bool {
        matches!(self.kind, TypeKind::Int)
    }
    pub fn is_uint(&self) -> bool {
        matches!(self.kind, TypeKind::UInt)
    }
    pub fn is_float(&self) -> bool {
        matches!(self.kind, TypeKind::Float)
    }
    pub fn is_time(&self) -> bool {
        matches!(self.kind, TypeKind::Time)
    }
    pub fn is_fingerprint(&self) -> bool {
        matches!(self.kind, TypeKind::Fingerprint)
    }
    pub fn is_bytes(&self) -> bool {
        matches!(self.kind, TypeKind::Bytes)
    }
    pub fn is_string(&self) -> bool {
        matches!(self.kind, TypeKind::String)
    }
    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array(_))
    }
    pub fn is_map(&self) -> bool {
        matches!(self.kind, TypeKind::Map(_))
    }
    pub fn is_tuple(&self) -> bool {
        matches!(self.kind, TypeKind::Tuple(_))
    }
    pub fn is_function(&self) -> bool {
        matches!(self.kind, TypeKind::Function(_))
    }

    /// Basic 64-bit-payload scalar?
    pub fn is_basic64(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Bool
                | TypeKind::Int
                | TypeKind::UInt
                | TypeKind::Float
                | TypeKind::Time
                | TypeKind::Fingerprint
        )
    }

    /// Indexable (sliceable) container?
    pub fn is_indexable(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Bytes | TypeKind::String | TypeKind::Array(_)
        )
    }

    pub fn as_array(&self) -> &ArrayType {
        match &self.kind {
            TypeKind::Array(a) => a,
            _ => panic!("not an array type"),
        }
    }

    pub fn as_map_type(&self) -> &MapType {
        match &self.kind {
            TypeKind::Map(m) => m,
            _ => panic!("not a map type"),
        }
    }

    pub fn as_tuple(&self) -> &TupleType {
        match &self.kind {
            TypeKind::Tuple(t) => t,
            _ => panic!("not a tuple type"),
        }
    }

    /// Runtime type identity: descriptor identity, or structural identity
    /// for basic kinds and element-wise for arrays and maps. Tuples and
    /// functions are identical only when they share a descriptor.
    pub fn same(a: TypeRef, b: TypeRef) -> bool {
        if std::ptr::eq(a, b) {
            return true;
        }
        match (&a.kind, &b.kind) {
            (TypeKind::Bool, TypeKind::Bool)
            | (TypeKind::Int, TypeKind::Int)
            | (TypeKind::UInt, TypeKind::UInt)
            | (TypeKind::Float, TypeKind::Float)
            | (TypeKind::Time, TypeKind::Time)
            | (TypeKind::Fingerprint, TypeKind::Fingerprint)
            | (TypeKind::Bytes, TypeKind::Bytes)
            | (TypeKind::String, TypeKind::String) => true,
            (TypeKind::Array(x), TypeKind::Array(y)) => Type::same(x.elem, y.elem),
            (TypeKind::Map(x), TypeKind::Map(y)) => {
                Type::same(x.key, y.key) && Type::same(x.value, y.value)
            }
            _ => false,
        }
    }

    /// Short name used in error messages and formatting.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            TypeKind::Bool => "bool",
            TypeKind::Int => "int",
            TypeKind::UInt => "uint",
            TypeKind::Float => "float",
            TypeKind::Time => "time",
            TypeKind::Fingerprint => "fingerprint",
            TypeKind::Bytes => "bytes",
            TypeKind::String => "string",
            TypeKind::Array(_) => "array",
            TypeKind::Map(_) => "map",
            TypeKind::Tuple(_) => "tuple",
            TypeKind::Function(_) => "function",
        }
    }
}

// =============================================================================
// Universe
// =============================================================================

/// The process-wide registry of basic types, standard array types and
/// shared read-only singletons. Built once on first use; read-only
/// afterwards and shared by every Process.
pub struct Universe {
    pub bool_type: TypeRef,
    pub int_type: TypeRef,
    pub uint_type: TypeRef,
    pub float_type: TypeRef,
    pub time_type: TypeRef,
    pub fingerprint_type: TypeRef,
    pub bytes_type: TypeRef,
    pub string_type: TypeRef,

    // Result array types for element-wise conversions.
    pub array_of_bool: TypeRef,
    pub array_of_int: TypeRef,
    pub array_of_uint: TypeRef,
    pub array_of_float: TypeRef,
    pub array_of_time: TypeRef,
    pub array_of_fingerprint: TypeRef,
    pub array_of_bytes: TypeRef,
    pub array_of_string: TypeRef,

    pub true_val: Val,
    pub false_val: Val,
    pub empty_string: Val,
}

static UNIVERSE: OnceLock<Universe> = OnceLock::new();

/// The shared type/singleton registry.
pub fn universe() -> &'static Universe {
    UNIVERSE.get_or_init(|| {
        let bool_type = Type::alloc(TypeKind::Bool);
        let int_type = Type::alloc(TypeKind::Int);
        let uint_type = Type::alloc(TypeKind::UInt);
        let float_type = Type::alloc(TypeKind::Float);
        let time_type = Type::alloc(TypeKind::Time);
        let fingerprint_type = Type::alloc(TypeKind::Fingerprint);
        let bytes_type = Type::alloc(TypeKind::Bytes);
        let string_type = Type::alloc(TypeKind::String);

        // Singletons live in a leaked static heap for the process lifetime.
        let statics: &'static mut StaticHeap = Box::leak(Box::new(StaticHeap::new()));
        let true_val = val::new_bool_in(&mut *statics, bool_type, true);
        let false_val = val::new_bool_in(&mut *statics, bool_type, false);
        let empty_string = val::new_string_in(&mut *statics, string_type, "");

        Universe {
            bool_type,
            int_type,
            uint_type,
            float_type,
            time_type,
            fingerprint_type,
            bytes_type,
            string_type,
            array_of_bool: Type::array(bool_type),
            array_of_int: Type::array(int_type),
            array_of_uint: Type::array(uint_type),
            array_of_float: Type::array(float_type),
            array_of_time: Type::array(time_type),
            array_of_fingerprint: Type::array(fingerprint_type),
            array_of_bytes: Type::array(bytes_type),
            array_of_string: Type::array(string_type),
            true_val,
            false_val,
            empty_string,
        }
    })
}
