//! Form Operation Tables
//!
//! One static operation table per value kind. A `Form` (see `types`) pairs
//! one of these tables with its owning type; the table is selected once at
//! type-construction time and dispatched through the form pointer on every
//! value header. There is no subtype dispatch anywhere.
//!
//! Containers combine element digests two different ways on purpose:
//! hashes with the associative-commutative combiner (any traversal order),
//! fingerprints with the order-dependent combiner (structure captured).

use std::cmp::Ordering;
use std::fmt;

use crate::fingerprint::{
    finger_seed, fingerprint_bytes, fingerprint_cat, fingerprint_u64, hash_bytes, hash_u64,
    map_hash_cat,
};
use crate::heap::{Heap, Relocation};
use crate::tagged::Val;
use crate::val::{self, ValEnv};

pub struct FormOps {
    pub name: &'static str,
    pub is_equal: fn(Val, Val) -> bool,
    /// Ternary comparison; absent for non-ordered types (maps).
    pub cmp: Option<fn(Val, Val) -> Ordering>,
    pub format: fn(&mut dyn fmt::Write, Val) -> fmt::Result,
    pub hash: fn(Val) -> u32,
    pub fingerprint: fn(&dyn ValEnv, Val) -> u64,
    pub is_unique: fn(Val) -> bool,
    /// Return an exclusively-owned equivalent, consuming the reference to
    /// the argument.
    pub uniq: fn(&mut Heap, Val) -> Val,
    /// Release contained references and free the block. Only called by the
    /// sweeper (or cascaded from another delete) on zero-ref blocks.
    pub delete: fn(&mut Heap, Val),
    pub adjust_heap_ptrs: fn(Val, &Relocation),
    pub check_heap_ptrs: fn(Val, &dyn Fn(Val) -> bool),
}

// =============================================================================
// Shared helpers
// =============================================================================

fn is_unique_by_ref(v: Val) -> bool {
    !v.is_readonly() && v.ref_() == 1 || v.is_smi()
}

fn delete_plain(heap: &mut Heap, v: Val) {
    heap.free(v);
}

fn adjust_none(_: Val, _: &Relocation) {}

fn check_none(_: Val, _: &dyn Fn(Val) -> bool) {}

fn check_slot(v: Val, valid: &dyn Fn(Val) -> bool, what: &str) {
    if v.is_ptr() && !v.is_null() && !valid(v) {
        panic!("heap corruption: dangling {what} pointer");
    }
}

// =============================================================================
// Basic scalars
// =============================================================================

fn basic_equal(a: Val, b: Val) -> bool {
    a.basic64() == b.basic64()
}

fn basic_hash(v: Val) -> u32 {
    hash_u64(v.basic64())
}

fn basic_fingerprint(_: &dyn ValEnv, v: Val) -> u64 {
    fingerprint_u64(v.basic64())
}

fn basic_uniq(heap: &mut Heap, v: Val) -> Val {
    if is_unique_by_ref(v) {
        return v;
    }
    let copy = val::new_basic64(heap, v.type_(), v.basic64());
    v.dec_ref();
    copy
}

fn cmp_signed(a: Val, b: Val) -> Ordering {
    (a.basic64() as i64).cmp(&(b.basic64() as i64))
}

fn cmp_unsigned(a: Val, b: Val) -> Ordering {
    a.basic64().cmp(&b.basic64())
}

fn cmp_float(a: Val, b: Val) -> Ordering {
    a.as_float().total_cmp(&b.as_float())
}

fn float_equal(a: Val, b: Val) -> bool {
    a.as_float() == b.as_float()
}

fn format_bool(w: &mut dyn fmt::Write, v: Val) -> fmt::Result {
    w.write_str(if v.as_bool() { "true" } else { "false" })
}

fn format_int(w: &mut dyn fmt::Write, v: Val) -> fmt::Result {
    write!(w, "{}", v.as_int())
}

fn format_uint(w: &mut dyn fmt::Write, v: Val) -> fmt::Result {
    write!(w, "{}", v.as_uint())
}

fn format_time(w: &mut dyn fmt::Write, v: Val) -> fmt::Result {
    write!(w, "{}", v.as_time())
}

fn format_fingerprint(w: &mut dyn fmt::Write, v: Val) -> fmt::Result {
    write!(w, "0x{:016x}", v.as_fingerprint())
}

fn format_float(w: &mut dyn fmt::Write, v: Val) -> fmt::Result {
    let x = v.as_float();
    if x.is_nan() {
        w.write_str("nan")
    } else if x.is_infinite() {
        w.write_str(if x > 0.0 { "inf" } else { "-inf" })
    } else {
        write!(w, "{x}")
    }
}

pub static BOOL_OPS: FormOps = FormOps {
    name: "bool",
    is_equal: basic_equal,
    cmp: Some(cmp_unsigned),
    format: format_bool,
    hash: basic_hash,
    fingerprint: basic_fingerprint,
    is_unique: is_unique_by_ref,
    uniq: basic_uniq,
    delete: delete_plain,
    adjust_heap_ptrs: adjust_none,
    check_heap_ptrs: check_none,
};

pub static INT_OPS: FormOps = FormOps {
    name: "int",
    is_equal: basic_equal,
    cmp: Some(cmp_signed),
    format: format_int,
    hash: basic_hash,
    fingerprint: basic_fingerprint,
    is_unique: is_unique_by_ref,
    uniq: basic_uniq,
    delete: delete_plain,
    adjust_heap_ptrs: adjust_none,
    check_heap_ptrs: check_none,
};

pub static UINT_OPS: FormOps = FormOps {
    name: "uint",
    is_equal: basic_equal,
    cmp: Some(cmp_unsigned),
    format: format_uint,
    hash: basic_hash,
    fingerprint: basic_fingerprint,
    is_unique: is_unique_by_ref,
    uniq: basic_uniq,
    delete: delete_plain,
    adjust_heap_ptrs: adjust_none,
    check_heap_ptrs: check_none,
};

pub static FLOAT_OPS: FormOps = FormOps {
    name: "float",
    is_equal: float_equal,
    cmp: Some(cmp_float),
    format: format_float,
    hash: basic_hash,
    fingerprint: basic_fingerprint,
    is_unique: is_unique_by_ref,
    uniq: basic_uniq,
    delete: delete_plain,
    adjust_heap_ptrs: adjust_none,
    check_heap_ptrs: check_none,
};

pub static TIME_OPS: FormOps = FormOps {
    name: "time",
    is_equal: basic_equal,
    cmp: Some(cmp_unsigned),
    format: format_time,
    hash: basic_hash,
    fingerprint: basic_fingerprint,
    is_unique: is_unique_by_ref,
    uniq: basic_uniq,
    delete: delete_plain,
    adjust_heap_ptrs: adjust_none,
    check_heap_ptrs: check_none,
};

pub static FINGERPRINT_OPS: FormOps = FormOps {
    name: "fingerprint",
    is_equal: basic_equal,
    cmp: Some(cmp_unsigned),
    format: format_fingerprint,
    hash: basic_hash,
    fingerprint: basic_fingerprint,
    is_unique: is_unique_by_ref,
    uniq: basic_uniq,
    delete: delete_plain,
    adjust_heap_ptrs: adjust_none,
    check_heap_ptrs: check_none,
};

// =============================================================================
// Bytes
// =============================================================================

fn bytes_equal(a: Val, b: Val) -> bool {
    val::bytes_data(a) == val::bytes_data(b)
}

fn bytes_cmp(a: Val, b: Val) -> Ordering {
    val::bytes_data(a).cmp(val::bytes_data(b))
}

fn bytes_format(w: &mut dyn fmt::Write, v: Val) -> fmt::Result {
    write!(w, "X\"{}\"", hex::encode(val::bytes_data(v)))
}

fn bytes_hash(v: Val) -> u32 {
    hash_bytes(val::bytes_data(v))
}

fn bytes_fingerprint(_: &dyn ValEnv, v: Val) -> u64 {
    fingerprint_bytes(val::bytes_data(v))
}

fn bytes_is_unique(v: Val) -> bool {
    !v.is_readonly() && v.ref_() == 1 && val::bytes_owner(v).ref_() == 1
}

fn bytes_uniq(heap: &mut Heap, v: Val) -> Val {
    if bytes_is_unique(v) {
        return v;
    }
    let copy = val::new_bytes_init(heap, val::bytes_data(v));
    v.dec_ref();
    copy
}

fn bytes_delete(heap: &mut Heap, v: Val) {
    if val::bytes_is_slice(v) {
        val::bytes_owner(v).dec_ref_and_check(heap);
    }
    heap.free(v);
}

fn bytes_adjust(v: Val, reloc: &Relocation) {
    val::bytes_adjust_owner(v, reloc);
}

fn bytes_check(v: Val, valid: &dyn Fn(Val) -> bool) {
    check_slot(val::bytes_owner(v), valid, "bytes owner");
}

pub static BYTES_OPS: FormOps = FormOps {
    name: "bytes",
    is_equal: bytes_equal,
    cmp: Some(bytes_cmp),
    format: bytes_format,
    hash: bytes_hash,
    fingerprint: bytes_fingerprint,
    is_unique: bytes_is_unique,
    uniq: bytes_uniq,
    delete: bytes_delete,
    adjust_heap_ptrs: bytes_adjust,
    check_heap_ptrs: bytes_check,
};

// =============================================================================
// Strings
// =============================================================================

/// C-style quoting for string literals.
pub fn quote_str(w: &mut dyn fmt::Write, s: &str) -> fmt::Result {
    w.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => w.write_str("\\\"")?,
            '\\' => w.write_str("\\\\")?,
            '\n' => w.write_str("\\n")?,
            '\t' => w.write_str("\\t")?,
            '\r' => w.write_str("\\r")?,
            c if (c as u32) < 0x20 => write!(w, "\\x{:02x}", c as u32)?,
            c => w.write_char(c)?,
        }
    }
    w.write_char('"')
}

fn string_equal(a: Val, b: Val) -> bool {
    val::string_data(a) == val::string_data(b)
}

fn string_cmp(a: Val, b: Val) -> Ordering {
    // Byte order on UTF-8 matches code-point order.
    val::string_data(a).cmp(val::string_data(b))
}

fn string_format(w: &mut dyn fmt::Write, v: Val) -> fmt::Result {
    quote_str(w, val::string_str(v))
}

fn string_hash(v: Val) -> u32 {
    hash_bytes(val::string_data(v))
}

fn string_fingerprint(_: &dyn ValEnv, v: Val) -> u64 {
    fingerprint_bytes(val::string_data(v))
}

fn string_is_unique(v: Val) -> bool {
    !v.is_readonly() && v.ref_() == 1 && val::string_owner(v).ref_() == 1
}

fn string_uniq(heap: &mut Heap, v: Val) -> Val {
    if string_is_unique(v) {
        return v;
    }
    let copy = val::new_string(heap, val::string_str(v));
    v.dec_ref();
    copy
}

fn string_delete(heap: &mut Heap, v: Val) {
    if val::string_is_slice(v) {
        val::string_owner(v).dec_ref_and_check(heap);
    }
    heap.free(v);
}

fn string_adjust(v: Val, reloc: &Relocation) {
    val::string_adjust_owner(v, reloc);
}

fn string_check(v: Val, valid: &dyn Fn(Val) -> bool) {
    check_slot(val::string_owner(v), valid, "string owner");
}

pub static STRING_OPS: FormOps = FormOps {
    name: "string",
    is_equal: string_equal,
    cmp: Some(string_cmp),
    format: string_format,
    hash: string_hash,
    fingerprint: string_fingerprint,
    is_unique: string_is_unique,
    uniq: string_uniq,
    delete: string_delete,
    adjust_heap_ptrs: string_adjust,
    check_heap_ptrs: string_check,
};

// =============================================================================
// Arrays
// =============================================================================

fn array_equal(a: Val, b: Val) -> bool {
    let n = val::array_length(a);
    if n != val::array_length(b) {
        return false;
    }
    (0..n).all(|i| val::array_at(a, i).is_equal(val::array_at(b, i)))
}

fn array_cmp(a: Val, b: Val) -> Ordering {
    let (na, nb) = (val::array_length(a), val::array_length(b));
    for i in 0..na.min(nb) {
        let o = val::array_at(a, i)
            .cmp_val(val::array_at(b, i))
            .unwrap_or(Ordering::Equal);
        if o != Ordering::Equal {
            return o;
        }
    }
    na.cmp(&nb)
}

fn array_format(w: &mut dyn fmt::Write, v: Val) -> fmt::Result {
    w.write_char('[')?;
    for i in 0..val::array_length(v) {
        if i > 0 {
            w.write_str(", ")?;
        }
        val::array_at(v, i).format_to(w)?;
    }
    w.write_char(']')
}

fn array_hash(v: Val) -> u32 {
    let mut h = hash_u64(val::array_length(v) as u64);
    for i in 0..val::array_length(v) {
        h = map_hash_cat(h, val::array_at(v, i).hash());
    }
    h
}

fn array_fingerprint(env: &dyn ValEnv, v: Val) -> u64 {
    let mut fp = finger_seed();
    for i in 0..val::array_length(v) {
        fp = fingerprint_cat(fp, val::array_at(v, i).fingerprint(env));
    }
    fp
}

fn array_is_unique(v: Val) -> bool {
    !v.is_readonly() && v.ref_() == 1 && val::array_owner(v).ref_() == 1
}

fn array_uniq(heap: &mut Heap, v: Val) -> Val {
    if array_is_unique(v) {
        return v;
    }
    let n = val::array_length(v);
    let copy = val::new_array(heap, v.type_(), n);
    for i in 0..n {
        let e = val::array_at(v, i);
        e.inc_ref();
        val::array_put(copy, i, e);
    }
    v.dec_ref();
    copy
}

fn array_delete(heap: &mut Heap, v: Val) {
    if val::array_is_slice(v) {
        val::array_owner(v).dec_ref_and_check(heap);
    } else {
        for i in 0..val::array_length(v) {
            val::array_at(v, i).dec_ref_and_check(heap);
        }
    }
    heap.free(v);
}

fn array_adjust(v: Val, reloc: &Relocation) {
    val::array_adjust(v, reloc);
}

fn array_check(v: Val, valid: &dyn Fn(Val) -> bool) {
    check_slot(val::array_owner(v), valid, "array owner");
    if !val::array_is_slice(v) {
        for i in 0..val::array_length(v) {
            check_slot(val::array_at(v, i), valid, "array element");
        }
    }
}

pub static ARRAY_OPS: FormOps = FormOps {
    name: "array",
    is_equal: array_equal,
    cmp: Some(array_cmp),
    format: array_format,
    hash: array_hash,
    fingerprint: array_fingerprint,
    is_unique: array_is_unique,
    uniq: array_uniq,
    delete: array_delete,
    adjust_heap_ptrs: array_adjust,
    check_heap_ptrs: array_check,
};

// =============================================================================
// Maps
// =============================================================================

fn map_equal(a: Val, b: Val) -> bool {
    val::map_ref(a).equal(val::map_ref(b))
}

fn map_format(w: &mut dyn fmt::Write, v: Val) -> fmt::Result {
    let m = val::map_ref(v);
    w.write_str("{ ")?;
    for i in 0..m.occupancy() {
        if i > 0 {
            w.write_str(", ")?;
        }
        m.get_key_by_index(i as i32).format_to(w)?;
        w.write_str(": ")?;
        m.get_value_by_index(i as i32).format_to(w)?;
    }
    w.write_str(" }")
}

fn map_hash(v: Val) -> u32 {
    val::map_ref(v).hash()
}

fn map_fingerprint(env: &dyn ValEnv, v: Val) -> u64 {
    val::map_ref(v).fingerprint(env)
}

fn map_uniq(heap: &mut Heap, v: Val) -> Val {
    if is_unique_by_ref(v) {
        return v;
    }
    let copy = val::new_map(heap, v.type_(), val::map_ref(v).occupancy());
    let cloned = val::map_ref(v).clone_table();
    drop(val::map_take_table(copy));
    val::map_set_table(copy, cloned);
    v.dec_ref();
    copy
}

fn map_delete(heap: &mut Heap, v: Val) {
    let table = val::map_take_table(v);
    table.release_elements(heap);
    drop(table);
    heap.free(v);
}

fn map_adjust(v: Val, reloc: &Relocation) {
    val::map_ref(v).adjust_heap_ptrs(reloc);
}

fn map_check(v: Val, valid: &dyn Fn(Val) -> bool) {
    let m = val::map_ref(v);
    for i in 0..m.occupancy() {
        check_slot(m.get_key_by_index(i as i32), valid, "map key");
        check_slot(m.get_value_by_index(i as i32), valid, "map value");
    }
}

pub static MAP_OPS: FormOps = FormOps {
    name: "map",
    is_equal: map_equal,
    cmp: None, // maps are not ordered
    format: map_format,
    hash: map_hash,
    fingerprint: map_fingerprint,
    is_unique: is_unique_by_ref,
    uniq: map_uniq,
    delete: map_delete,
    adjust_heap_ptrs: map_adjust,
    check_heap_ptrs: map_check,
};

// =============================================================================
// Tuples
// =============================================================================

fn tuple_equal(a: Val, b: Val) -> bool {
    debug_assert!(
        std::ptr::eq(a.type_(), b.type_()),
        "tuple comparison across types"
    );
    // Slot contents are only defined for fields the program reads.
    debug_assert!(
        a.type_().as_tuple().fields.iter().all(|f| f.read),
        "tuple equality requires all fields read"
    );
    let n = val::tuple_nslots(a);
    (0..n).all(|i| val::tuple_slot_at(a, i).is_equal(val::tuple_slot_at(b, i)))
}

fn tuple_cmp(a: Val, b: Val) -> Ordering {
    let n = val::tuple_nslots(a);
    for i in 0..n {
        let o = val::tuple_slot_at(a, i)
            .cmp_val(val::tuple_slot_at(b, i))
            .unwrap_or(Ordering::Equal);
        if o != Ordering::Equal {
            return o;
        }
    }
    Ordering::Equal
}

fn tuple_format(w: &mut dyn fmt::Write, v: Val) -> fmt::Result {
    w.write_str("{ ")?;
    for i in 0..val::tuple_nslots(v) {
        if i > 0 {
            w.write_str(", ")?;
        }
        val::tuple_slot_at(v, i).format_to(w)?;
    }
    w.write_str(" }")
}

fn tuple_hash(v: Val) -> u32 {
    let mut h = hash_u64(val::tuple_nslots(v) as u64);
    for i in 0..val::tuple_nslots(v) {
        h = map_hash_cat(h, val::tuple_slot_at(v, i).hash());
    }
    h
}

fn tuple_fingerprint(env: &dyn ValEnv, v: Val) -> u64 {
    let mut fp = finger_seed();
    for i in 0..val::tuple_nslots(v) {
        fp = fingerprint_cat(fp, val::tuple_slot_at(v, i).fingerprint(env));
    }
    fp
}

fn tuple_uniq(heap: &mut Heap, v: Val) -> Val {
    if is_unique_by_ref(v) {
        return v;
    }
    let n = val::tuple_nslots(v);
    let copy = val::new_tuple(heap, v.type_(), val::InitMode::ClearInproto);
    for i in 0..n {
        let e = val::tuple_slot_at(v, i);
        e.inc_ref();
        val::tuple_set_slot(copy, i, e);
        if val::tuple_bit_at(v, i) {
            val::tuple_set_bit(copy, i);
        }
    }
    v.dec_ref();
    copy
}

fn tuple_delete(heap: &mut Heap, v: Val) {
    for i in 0..val::tuple_nslots(v) {
        val::tuple_slot_at(v, i).dec_ref_and_check(heap);
    }
    heap.free(v);
}

fn tuple_adjust(v: Val, reloc: &Relocation) {
    val::tuple_adjust(v, reloc);
}

fn tuple_check(v: Val, valid: &dyn Fn(Val) -> bool) {
    for i in 0..val::tuple_nslots(v) {
        check_slot(val::tuple_slot_at(v, i), valid, "tuple slot");
    }
}

pub static TUPLE_OPS: FormOps = FormOps {
    name: "tuple",
    is_equal: tuple_equal,
    cmp: Some(tuple_cmp),
    format: tuple_format,
    hash: tuple_hash,
    fingerprint: tuple_fingerprint,
    is_unique: is_unique_by_ref,
    uniq: tuple_uniq,
    delete: tuple_delete,
    adjust_heap_ptrs: tuple_adjust,
    check_heap_ptrs: tuple_check,
};

// =============================================================================
// Closures
// =============================================================================

fn closure_equal(a: Val, b: Val) -> bool {
    val::closure_entry(a) == val::closure_entry(b)
        && val::closure_context(a) == val::closure_context(b)
}

fn closure_cmp(a: Val, b: Val) -> Ordering {
    (val::closure_entry(a), val::closure_context(a))
        .cmp(&(val::closure_entry(b), val::closure_context(b)))
}

fn closure_format(w: &mut dyn fmt::Write, v: Val) -> fmt::Result {
    write!(w, "function@{}", val::closure_entry(v))
}

fn closure_hash(v: Val) -> u32 {
    hash_u64((val::closure_entry(v) as u64) << 32 | val::closure_context(v) as u64)
}

fn closure_fingerprint(env: &dyn ValEnv, v: Val) -> u64 {
    env.closure_fingerprint(val::closure_entry(v), val::closure_context(v))
}

fn closure_uniq(heap: &mut Heap, v: Val) -> Val {
    if is_unique_by_ref(v) {
        return v;
    }
    let copy = val::new_closure(
        heap,
        v.type_(),
        val::closure_entry(v),
        val::closure_context(v),
    );
    v.dec_ref();
    copy
}

pub static CLOSURE_OPS: FormOps = FormOps {
    name: "function",
    is_equal: closure_equal,
    cmp: Some(closure_cmp),
    format: closure_format,
    hash: closure_hash,
    fingerprint: closure_fingerprint,
    is_unique: is_unique_by_ref,
    uniq: closure_uniq,
    delete: delete_plain,
    adjust_heap_ptrs: adjust_none,
    check_heap_ptrs: check_none,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::universe;
    use crate::val::{NullEnv, new_float, new_int, new_string};

    fn heap() -> Heap {
        Heap::new(4096, 1 << 20)
    }

    #[test]
    fn test_equal_implies_same_digests() {
        let mut h = heap();
        let a = new_string(&mut h, "digest me");
        let b = new_string(&mut h, "digest me");
        assert!(a.is_equal(b));
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.fingerprint(&NullEnv), b.fingerprint(&NullEnv));
    }

    #[test]
    fn test_cmp_antisymmetric() {
        let mut h = heap();
        let a = new_int(&mut h, -5);
        let b = new_int(&mut h, 17);
        assert_eq!(a.cmp_val(b), Some(Ordering::Less));
        assert_eq!(b.cmp_val(a), Some(Ordering::Greater));
        assert_eq!(a.cmp_val(a), Some(Ordering::Equal));
    }

    #[test]
    fn test_cross_type_not_comparable() {
        let mut h = heap();
        let a = new_int(&mut h, 1);
        let b = new_float(&mut h, 1.0);
        assert_eq!(a.cmp_val(b), None);
        assert!(!a.is_equal(b));
    }

    #[test]
    fn test_float_format_specials() {
        let mut h = heap();
        assert_eq!(new_float(&mut h, f64::NAN).display_string(), "nan");
        assert_eq!(new_float(&mut h, f64::INFINITY).display_string(), "inf");
        assert_eq!(new_float(&mut h, f64::NEG_INFINITY).display_string(), "-inf");
        assert_eq!(new_float(&mut h, 2.5).display_string(), "2.5");
    }

    #[test]
    fn test_string_format_quotes() {
        let mut h = heap();
        let s = new_string(&mut h, "a\"b\\c\nd");
        assert_eq!(s.display_string(), "\"a\\\"b\\\\c\\nd\"");
    }

    #[test]
    fn test_bytes_format_hex() {
        let mut h = heap();
        let b = crate::val::new_bytes_init(&mut h, &[0xde, 0xad]);
        assert_eq!(b.display_string(), "X\"dead\"");
    }

    #[test]
    fn test_array_fingerprint_structure() {
        let mut h = heap();
        let u = universe();
        let a = crate::val::new_array(&mut h, u.array_of_int, 2);
        crate::val::array_put(a, 0, Val::from_smi(1));
        crate::val::array_put(a, 1, Val::from_smi(2));
        let b = crate::val::new_array(&mut h, u.array_of_int, 2);
        crate::val::array_put(b, 0, Val::from_smi(2));
        crate::val::array_put(b, 1, Val::from_smi(1));
        // Order-dependent: [1,2] and [2,1] differ.
        assert_ne!(a.fingerprint(&NullEnv), b.fingerprint(&NullEnv));
        // Empty containers have a distinct non-zero fingerprint.
        let e = crate::val::new_array(&mut h, u.array_of_int, 0);
        assert_eq!(e.fingerprint(&NullEnv), finger_seed());
        assert_ne!(e.fingerprint(&NullEnv), 0);
    }

    #[test]
    fn test_uniq_copies_shared() {
        let mut h = heap();
        let u = universe();
        let a = crate::val::new_array(&mut h, u.array_of_int, 1);
        crate::val::array_put(a, 0, Val::from_smi(0));
        a.inc_ref(); // simulate a second holder (b = a)
        let a2 = a.uniq(&mut h);
        assert_ne!(a2, a, "shared array must be copied");
        crate::val::array_put(a2, 0, Val::from_smi(1));
        assert_eq!(crate::val::array_at(a, 0).as_int(), 0);
        assert_eq!(crate::val::array_at(a2, 0).as_int(), 1);
    }

    #[test]
    fn test_uniq_keeps_exclusive() {
        let mut h = heap();
        let s = new_string(&mut h, "mine");
        let s2 = s.uniq(&mut h);
        assert_eq!(s, s2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "tuple comparison across types")]
    fn test_tuple_equal_requires_matching_types() {
        use crate::types::{FieldSpec, Type};
        use crate::val::{InitMode, new_tuple};
        let mut h = heap();
        let u = universe();
        let t1 = Type::tuple(vec![FieldSpec::new("a", u.int_type)], false, false);
        let t2 = Type::tuple(vec![FieldSpec::new("b", u.int_type)], false, false);
        let v1 = new_tuple(&mut h, t1, InitMode::ClearInproto);
        let v2 = new_tuple(&mut h, t2, InitMode::ClearInproto);
        tuple_equal(v1, v2);
    }
}
