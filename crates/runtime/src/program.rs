//! Compiled Programs
//!
//! The surface the engine consumes from the (external) compiler: one
//! contiguous bytecode stream, typed function descriptors, a read-only
//! literal pool, a message-string pool, a type pool, the trap-range
//! table, output table descriptors, and registered native functions.
//!
//! A `Program` is immutable once built and shared read-only by every
//! Process executing it. Its literals (and the pre-built default proto
//! tuples) live in a program-owned static heap: read-only refcounts, no
//! moves, freed wholesale when the program is dropped.

use serde::{Deserialize, Serialize};

use szl_core::types::TypeKind;
use szl_core::{InitMode, StaticHeap, TypeRef, Val, universe, val};

use crate::code::Code;
use crate::process::Process;

/// A registered native (intrinsic) function. Arguments and results travel
/// on the process value stack; an error return raises a trap.
pub type NativeFn = for<'a, 'p> fn(&'a mut Process<'p>) -> Result<(), String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDescr {
    pub name: String,
    pub entry: u32,
    pub params: u16,
    pub locals: u16,
    /// Maximum operand-stack depth below the locals, for overflow checks.
    pub frame_size: u16,
}

/// One statically-registered trap recovery range. A trap at pc `p` with
/// `begin <= p < end` discards operands down to `fp - sp_offset` and
/// resumes at `target`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrapRange {
    pub begin: u32,
    pub end: u32,
    pub target: u32,
    pub sp_offset: u32,
}

impl TrapRange {
    pub fn contains(&self, pc: usize) -> bool {
        (self.begin as usize) <= pc && pc < self.end as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    Collection,
    Sum,
    Maximum,
    Minimum,
    Sample,
    Top,
    Unique,
    Quantile,
    Set,
    Text,
    /// Emit appends rendered values to a file named by the index.
    File,
    /// Emit pipes rendered values to a shell command named by the index.
    Proc,
}

impl TableKind {
    /// File/proc tables bypass the emitter interface.
    pub fn uses_emitter(&self) -> bool {
        !matches!(self, TableKind::File | TableKind::Proc)
    }
}

/// Descriptor for one `table ... of ...` output declaration.
pub struct OutputTable {
    pub name: String,
    pub kind: TableKind,
    pub index_types: Vec<TypeRef>,
    pub elem_type: TypeRef,
    pub weight_type: Option<TypeRef>,
    /// Kind-specific parameter (sample/top size, quantile count).
    pub param: i64,
}

pub struct Program {
    pub code: Code,
    pub functions: Vec<FunctionDescr>,
    pub literals: Vec<Val>,
    pub strings: Vec<String>,
    pub types: Vec<TypeRef>,
    pub natives: Vec<NativeFn>,
    pub trap_ranges: Vec<TrapRange>,
    pub tables: Vec<OutputTable>,
    pub globals_size: u16,
    pub main: u32,
    pub init: Option<u32>,
    #[allow(dead_code)] // owns the literals' storage
    statics: StaticHeap,
}

// Safety: a Program is immutable after ProgramBuilder::finish; the raw
// values in the literal pool are read-only and their storage is owned by
// the program's static heap.
unsafe impl Send for Program {}
unsafe impl Sync for Program {}

impl Program {
    pub fn function(&self, index: u32) -> &FunctionDescr {
        &self.functions[index as usize]
    }

    /// Index of the function whose entry pc is `entry`, if any.
    pub fn function_by_entry(&self, entry: u32) -> Option<u32> {
        self.functions
            .iter()
            .position(|f| f.entry == entry)
            .map(|i| i as u32)
    }

    pub fn type_at(&self, index: u32) -> TypeRef {
        self.types[index as usize]
    }

    pub fn literal_at(&self, index: u32) -> Val {
        self.literals[index as usize]
    }

    pub fn string_at(&self, index: u32) -> &str {
        &self.strings[index as usize]
    }

    /// Innermost trap range covering `pc`.
    pub fn find_trap_range(&self, pc: usize) -> Option<&TrapRange> {
        self.trap_ranges
            .iter()
            .filter(|r| r.contains(pc))
            .min_by_key(|r| r.end - r.begin)
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct ProgramBuilder {
    pub code: crate::code::CodeBuffer,
    functions: Vec<FunctionDescr>,
    literals: Vec<Val>,
    strings: Vec<String>,
    types: Vec<TypeRef>,
    natives: Vec<NativeFn>,
    trap_ranges: Vec<TrapRange>,
    tables: Vec<OutputTable>,
    globals_size: u16,
    main: u32,
    init: Option<u32>,
    statics: StaticHeap,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        ProgramBuilder::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> ProgramBuilder {
        ProgramBuilder {
            code: crate::code::CodeBuffer::new(),
            functions: Vec::new(),
            literals: Vec::new(),
            strings: Vec::new(),
            types: Vec::new(),
            natives: Vec::new(),
            trap_ranges: Vec::new(),
            tables: Vec::new(),
            globals_size: 0,
            main: 0,
            init: None,
            statics: StaticHeap::new(),
        }
    }

    // Literals are allocated in the program's static heap, so they come
    // out read-only.

    pub fn literal_int(&mut self, x: i64) -> u32 {
        let v = val::new_int(&mut self.statics, x);
        self.push_literal(v)
    }

    pub fn literal_uint(&mut self, x: u64) -> u32 {
        let v = val::new_uint(&mut self.statics, x);
        self.push_literal(v)
    }

    pub fn literal_float(&mut self, x: f64) -> u32 {
        let v = val::new_float(&mut self.statics, x);
        self.push_literal(v)
    }

    pub fn literal_bool(&mut self, x: bool) -> u32 {
        let u = universe();
        let v = if x { u.true_val } else { u.false_val };
        self.push_literal(v)
    }

    pub fn literal_time(&mut self, x: u64) -> u32 {
        let v = val::new_time(&mut self.statics, x);
        self.push_literal(v)
    }

    pub fn literal_fingerprint(&mut self, x: u64) -> u32 {
        let v = val::new_fingerprint(&mut self.statics, x);
        self.push_literal(v)
    }

    pub fn literal_string(&mut self, s: &str) -> u32 {
        let v = val::new_string(&mut self.statics, s);
        self.push_literal(v)
    }

    pub fn literal_bytes(&mut self, b: &[u8]) -> u32 {
        let v = val::new_bytes_init(&mut self.statics, b);
        self.push_literal(v)
    }

    fn push_literal(&mut self, v: Val) -> u32 {
        debug_assert!(v.is_readonly());
        self.literals.push(v);
        self.literals.len() as u32 - 1
    }

    /// Message-string pool (trap messages, stop messages).
    pub fn string(&mut self, s: &str) -> u32 {
        if let Some(i) = self.strings.iter().position(|x| x == s) {
            return i as u32;
        }
        self.strings.push(s.to_string());
        self.strings.len() as u32 - 1
    }

    pub fn type_(&mut self, t: TypeRef) -> u32 {
        if let Some(i) = self.types.iter().position(|x| std::ptr::eq(*x, t)) {
            return i as u32;
        }
        self.types.push(t);
        self.types.len() as u32 - 1
    }

    pub fn native(&mut self, f: NativeFn) -> u32 {
        self.natives.push(f);
        self.natives.len() as u32 - 1
    }

    pub fn function(&mut self, name: &str, entry: u32, params: u16, locals: u16) -> u32 {
        self.functions.push(FunctionDescr {
            name: name.to_string(),
            entry,
            params,
            locals,
            frame_size: 256,
        });
        self.functions.len() as u32 - 1
    }

    pub fn trap_range(&mut self, begin: u32, end: u32, target: u32, sp_offset: u32) {
        self.trap_ranges.push(TrapRange {
            begin,
            end,
            target,
            sp_offset,
        });
    }

    pub fn table(&mut self, t: OutputTable) -> u16 {
        self.tables.push(t);
        self.tables.len() as u16 - 1
    }

    pub fn set_globals_size(&mut self, n: u16) {
        self.globals_size = n;
    }

    pub fn set_main(&mut self, f: u32) {
        self.main = f;
    }

    pub fn set_init(&mut self, f: u32) {
        self.init = Some(f);
    }

    /// Seal the program. Pre-builds the read-only default tuple for every
    /// proto tuple type in the pool, so wire decoding can fill defaults
    /// with plain slot copies.
    pub fn finish(mut self) -> Program {
        for t in self.types.clone() {
            build_proto_defaults(&mut self.statics, t);
        }
        Program {
            code: self.code.finish(),
            functions: self.functions,
            literals: self.literals,
            strings: self.strings,
            types: self.types,
            natives: self.natives,
            trap_ranges: self.trap_ranges,
            tables: self.tables,
            globals_size: self.globals_size,
            main: self.main,
            init: self.init,
            statics: self.statics,
        }
    }
}

/// Read-only default value for one field type.
fn default_item(statics: &mut StaticHeap, t: TypeRef) -> Val {
    let u = universe();
    match t.kind() {
        TypeKind::Bool => u.false_val,
        TypeKind::Int => Val::from_smi(0),
        TypeKind::UInt => val::new_uint(statics, 0),
        TypeKind::Float => val::new_float(statics, 0.0),
        TypeKind::Time => val::new_time(statics, 0),
        TypeKind::Fingerprint => val::new_fingerprint(statics, 0),
        TypeKind::String => u.empty_string,
        TypeKind::Bytes => val::new_bytes(statics, 0),
        TypeKind::Array(_) => val::new_array(statics, t, 0),
        TypeKind::Map(_) => val::new_map(statics, t, 0),
        TypeKind::Tuple(_) => {
            build_proto_defaults(statics, t);
            match t.as_tuple().default_tuple() {
                Some(d) => d,
                None => default_tuple_value(statics, t),
            }
        }
        TypeKind::Function(_) => Val::NULL,
    }
}

fn default_tuple_value(statics: &mut StaticHeap, t: TypeRef) -> Val {
    let v = val::new_tuple(statics, t, InitMode::ClearInproto);
    for field in &t.as_tuple().fields {
        if let Some(slot) = field.slot {
            let d = default_item(statics, field.type_);
            val::tuple_set_slot(v, slot as usize, d);
        }
    }
    v
}

/// Build and install the read-only default tuple of a proto tuple type
/// (and, recursively, of its nested proto tuples).
fn build_proto_defaults(statics: &mut StaticHeap, t: TypeRef) {
    if !t.is_tuple() {
        return;
    }
    let tt = t.as_tuple();
    if !tt.is_proto || tt.default_tuple().is_some() {
        return;
    }
    let v = default_tuple_value(statics, t);
    tt.set_default_tuple(v);
}

#[cfg(test)]
mod tests {
    use super::*;
    use szl_core::{FieldSpec, Type};

    #[test]
    fn test_literal_pool_readonly() {
        let mut b = ProgramBuilder::new();
        let i = b.literal_string("hello");
        let j = b.literal_int(1 << 60);
        let p = b.finish();
        assert!(p.literal_at(i).is_readonly());
        assert_eq!(val::string_str(p.literal_at(i)), "hello");
        assert_eq!(p.literal_at(j).as_int(), 1 << 60);
    }

    #[test]
    fn test_string_pool_dedup() {
        let mut b = ProgramBuilder::new();
        let a = b.string("divide by zero");
        let c = b.string("divide by zero");
        assert_eq!(a, c);
    }

    #[test]
    fn test_default_tuple_built_for_proto_types() {
        let u = universe();
        let t = Type::tuple(
            vec![
                FieldSpec::new("n", u.int_type).with_tag(1),
                FieldSpec::new("s", u.string_type).with_tag(2),
            ],
            true,
            false,
        );
        let mut b = ProgramBuilder::new();
        b.type_(t);
        let _p = b.finish();
        let d = t.as_tuple().default_tuple().expect("default tuple built");
        assert!(d.is_readonly());
        assert_eq!(val::tuple_slot_at(d, 0).as_int(), 0);
        assert_eq!(val::string_str(val::tuple_slot_at(d, 1)), "");
    }

    #[test]
    fn test_find_trap_range_innermost() {
        let mut b = ProgramBuilder::new();
        b.trap_range(0, 100, 200, 0);
        b.trap_range(10, 20, 300, 0);
        let p = b.finish();
        assert_eq!(p.find_trap_range(15).unwrap().target, 300);
        assert_eq!(p.find_trap_range(50).unwrap().target, 200);
        assert!(p.find_trap_range(150).is_none());
    }
}
