//! Value Layouts and Factories
//!
//! Concrete heap layouts for every value kind, the factories that build
//! them, and the copy-on-write mutation protocol for the indexable
//! containers (bytes, string, array).
//!
//! All layouts are `#[repr(C)]` and begin with the block `Header`. The
//! indexable owners store their payload inline, immediately after the
//! struct; slices point at an owner value and share its storage:
//!
//! ```text
//! owner:  [header | origin length array=self | data...]
//! slice:  [header | origin length array=owner]
//! ```
//!
//! Strings distinguish owner from slice with a negative `size` field (the
//! allocated data capacity otherwise), carry the rune count, and cache one
//! rune-index→byte-offset pair for amortized O(1) UTF-8 indexing.
//!
//! # Safety
//! Accessors deal in raw pointers into the heap. The returned references
//! are only valid until the next sweep, which can only happen at an
//! interpreter dispatch boundary; callers must not hold them across one.

use std::cmp::Ordering;
use std::fmt;

use crate::heap::{Alloc, HEADER_SIZE, Header, Heap, MINIMUM_READONLY_REF, Relocation};
use crate::map::SzlMap;
use crate::tagged::Val;
use crate::types::{Form, Type, TypeRef, universe};

// =============================================================================
// Header access and reference counting
// =============================================================================

#[inline]
pub(crate) unsafe fn header<'a>(v: Val) -> &'a mut Header {
    unsafe { &mut *(v.as_raw_ptr() as *mut Header) }
}

/// Environment for operations that need program context; today that is
/// only the closure fingerprint (function index, dynamic level).
pub trait ValEnv {
    fn closure_fingerprint(&self, entry: u32, context: u32) -> u64;
}

/// Environment for contexts with no closures in flight (tests, literals).
pub struct NullEnv;

impl ValEnv for NullEnv {
    fn closure_fingerprint(&self, entry: u32, context: u32) -> u64 {
        crate::fingerprint::fingerprint_cat(
            crate::fingerprint::fingerprint_u64(entry as u64),
            context as u64,
        )
    }
}

impl Val {
    /// The form of this value. Smis dispatch through the global integer
    /// form; there is no heap object to consult.
    #[inline]
    pub fn form(self) -> &'static Form {
        if self.is_smi() {
            universe().int_type.form()
        } else {
            debug_assert!(!self.is_null(), "form() on undefined value");
            unsafe {
                let f = header(self).form;
                debug_assert!(!f.is_null(), "form() on freed block");
                &*f
            }
        }
    }

    #[inline]
    pub fn type_(self) -> TypeRef {
        self.form().type_()
    }

    /// Reference count; smis and null report 1.
    pub fn ref_(self) -> i32 {
        if self.is_ptr() && !self.is_null() {
            unsafe { header(self).ref_ }
        } else {
            1
        }
    }

    /// Account a persistent copy of this value. Read-only blocks are left
    /// alone: their sentinel count never changes.
    #[inline]
    pub fn inc_ref(self) {
        if self.is_ptr() && !self.is_null() {
            unsafe {
                let h = header(self);
                if h.ref_ < MINIMUM_READONLY_REF {
                    h.ref_ += 1;
                }
            }
        }
    }

    /// Discard a reference. Does not delete: zero-ref blocks are found and
    /// reclaimed by the next sweep.
    #[inline]
    pub fn dec_ref(self) {
        if self.is_ptr() && !self.is_null() {
            unsafe {
                let h = header(self);
                if h.ref_ < MINIMUM_READONLY_REF {
                    h.ref_ -= 1;
                    debug_assert!(h.ref_ >= 0, "refcount underflow");
                }
            }
        }
    }

    /// Discard a reference from within a `Form::delete`, cascading the
    /// deletion immediately when the count reaches zero.
    pub fn dec_ref_and_check(self, heap: &mut Heap) {
        if self.is_ptr() && !self.is_null() {
            unsafe {
                let h = header(self);
                if h.ref_ >= MINIMUM_READONLY_REF {
                    return;
                }
                h.ref_ -= 1;
                debug_assert!(h.ref_ >= 0, "refcount underflow");
                if h.ref_ == 0 {
                    (self.form().ops.delete)(heap, self);
                }
            }
        }
    }

    /// Pin as read-only: never copied, moved or freed from here on.
    pub fn set_readonly(self) {
        if self.is_ptr() && !self.is_null() {
            unsafe { header(self).ref_ = crate::heap::INITIAL_READONLY_REF }
        }
    }

    /// Smis and null are trivially read-only.
    pub fn is_readonly(self) -> bool {
        if self.is_ptr() && !self.is_null() {
            unsafe { header(self).ref_ > MINIMUM_READONLY_REF }
        } else {
            true
        }
    }

    // =========================================================================
    // Polymorphic operations
    // =========================================================================

    /// Deep equality. Undefined equals only undefined; differently-typed
    /// values are unequal.
    pub fn is_equal(self, other: Val) -> bool {
        if self.is_null() || other.is_null() {
            return self.is_null() && other.is_null();
        }
        if !Type::same(self.type_(), other.type_()) {
            return false;
        }
        (self.form().ops.is_equal)(self, other)
    }

    /// Ternary comparison; None for non-ordered types (maps) and for
    /// differently-typed operands.
    pub fn cmp_val(self, other: Val) -> Option<Ordering> {
        if self.is_null() || other.is_null() || !Type::same(self.type_(), other.type_()) {
            return None;
        }
        self.form().ops.cmp.map(|cmp| cmp(self, other))
    }

    pub fn hash(self) -> u32 {
        (self.form().ops.hash)(self)
    }

    pub fn fingerprint(self, env: &dyn ValEnv) -> u64 {
        (self.form().ops.fingerprint)(env, self)
    }

    /// Exclusively owned (safe to mutate in place)?
    pub fn is_unique(self) -> bool {
        (self.form().ops.is_unique)(self)
    }

    /// Return an exclusively owned equivalent, copying when shared. The
    /// reference to `self` is consumed.
    pub fn uniq(self, heap: &mut Heap) -> Val {
        (self.form().ops.uniq)(heap, self)
    }

    pub fn format_to(self, w: &mut dyn fmt::Write) -> fmt::Result {
        if self.is_null() {
            return w.write_str("undef");
        }
        (self.form().ops.format)(w, self)
    }

    pub fn display_string(self) -> String {
        let mut s = String::new();
        let _ = self.format_to(&mut s);
        s
    }

    // =========================================================================
    // Scalar accessors
    // =========================================================================

    /// The raw 64-bit payload of a basic value.
    pub fn basic64(self) -> u64 {
        if self.is_smi() {
            self.as_smi() as u64
        } else {
            unsafe { *(self.as_raw_ptr().add(HEADER_SIZE) as *const u64) }
        }
    }

    pub fn as_int(self) -> i64 {
        if self.is_smi() {
            self.as_smi()
        } else {
            debug_assert!(self.type_().is_int());
            self.basic64() as i64
        }
    }

    pub fn as_uint(self) -> u64 {
        debug_assert!(self.type_().is_uint());
        self.basic64()
    }

    pub fn as_bool(self) -> bool {
        debug_assert!(self.type_().is_bool());
        self.basic64() != 0
    }

    pub fn as_float(self) -> f64 {
        debug_assert!(self.type_().is_float());
        f64::from_bits(self.basic64())
    }

    pub fn as_time(self) -> u64 {
        debug_assert!(self.type_().is_time());
        self.basic64()
    }

    pub fn as_fingerprint(self) -> u64 {
        debug_assert!(self.type_().is_fingerprint());
        self.basic64()
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "undef")
        } else if self.is_smi() {
            write!(f, "smi({})", self.as_smi())
        } else {
            write!(f, "{}@{:#x}", self.type_().name(), self.raw())
        }
    }
}

// =============================================================================
// Layouts
// =============================================================================

#[repr(C)]
struct BasicVal {
    hdr: Header,
    bits: u64,
}

#[repr(C)]
struct BytesVal {
    hdr: Header,
    origin: i32,
    length: i32,
    array: Val, // self when owner; data follows the struct in the owner
}

#[repr(C)]
struct StringVal {
    hdr: Header,
    size: i32, // allocated data bytes; negative marks a slice
    num_runes: i32,
    length: i32, // bytes
    origin: i32, // byte origin into the owner's data
    cache_rune: i32,
    cache_byte: i32,
    array: Val,
}

#[repr(C)]
struct ArrayVal {
    hdr: Header,
    origin: i32,
    length: i32,
    array: Val, // self when owner; Val slots follow the struct in the owner
}

#[repr(C)]
struct TupleVal {
    hdr: Header,
    // nslots Val slots follow, then the in-proto bit words
}

#[repr(C)]
struct ClosureVal {
    hdr: Header,
    entry: u32,   // instruction address of the function entry
    context: u32, // stack index of the lexically enclosing frame
}

#[repr(C)]
struct MapVal {
    hdr: Header,
    map: *mut SzlMap,
}

#[inline]
unsafe fn basic<'a>(v: Val) -> &'a mut BasicVal {
    unsafe { &mut *(v.as_raw_ptr() as *mut BasicVal) }
}
#[inline]
unsafe fn bytes<'a>(v: Val) -> &'a mut BytesVal {
    unsafe { &mut *(v.as_raw_ptr() as *mut BytesVal) }
}
#[inline]
unsafe fn string<'a>(v: Val) -> &'a mut StringVal {
    unsafe { &mut *(v.as_raw_ptr() as *mut StringVal) }
}
#[inline]
unsafe fn array<'a>(v: Val) -> &'a mut ArrayVal {
    unsafe { &mut *(v.as_raw_ptr() as *mut ArrayVal) }
}
#[inline]
unsafe fn closure<'a>(v: Val) -> &'a mut ClosureVal {
    unsafe { &mut *(v.as_raw_ptr() as *mut ClosureVal) }
}
#[inline]
unsafe fn mapval<'a>(v: Val) -> &'a mut MapVal {
    unsafe { &mut *(v.as_raw_ptr() as *mut MapVal) }
}

fn set_form(v: Val, t: TypeRef) {
    unsafe { header(v).form = t.form() as *const Form }
}

// =============================================================================
// Scalar factories
// =============================================================================

fn new_basic(a: &mut dyn Alloc, t: TypeRef, bits: u64) -> Val {
    let p = a.alloc_block(std::mem::size_of::<BasicVal>());
    let v = Val::from_raw_ptr(p);
    unsafe { basic(v).bits = bits }
    set_form(v, t);
    v
}

pub fn new_bool(a: &mut dyn Alloc, b: bool) -> Val {
    new_bool_in(a, universe().bool_type, b)
}

/// Bool factory with an explicit type, used while the universe itself is
/// being initialized.
pub fn new_bool_in(a: &mut dyn Alloc, t: TypeRef, b: bool) -> Val {
    new_basic(a, t, b as u64)
}

pub fn new_int(a: &mut dyn Alloc, x: i64) -> Val {
    if Val::fits_smi(x) {
        Val::from_smi(x)
    } else {
        new_basic(a, universe().int_type, x as u64)
    }
}

pub fn new_uint(a: &mut dyn Alloc, x: u64) -> Val {
    new_basic(a, universe().uint_type, x)
}

pub fn new_float(a: &mut dyn Alloc, x: f64) -> Val {
    new_basic(a, universe().float_type, x.to_bits())
}

pub fn new_time(a: &mut dyn Alloc, x: u64) -> Val {
    new_basic(a, universe().time_type, x)
}

pub fn new_fingerprint(a: &mut dyn Alloc, x: u64) -> Val {
    new_basic(a, universe().fingerprint_type, x)
}

/// Scalar factory from a raw 64-bit payload, dispatched on the type.
pub fn new_basic64(a: &mut dyn Alloc, t: TypeRef, bits: u64) -> Val {
    if t.is_int() {
        new_int(a, bits as i64)
    } else {
        new_basic(a, t, bits)
    }
}

// =============================================================================
// Bytes
// =============================================================================

const BYTES_HDR: usize = std::mem::size_of::<BytesVal>();

/// New owning bytes value, zero-filled.
pub fn new_bytes(a: &mut dyn Alloc, len: usize) -> Val {
    let p = a.alloc_block(BYTES_HDR + len);
    let v = Val::from_raw_ptr(p);
    unsafe {
        let b = bytes(v);
        b.origin = 0;
        b.length = len as i32;
        b.array = v;
    }
    set_form(v, universe().bytes_type);
    v
}

pub fn new_bytes_init(a: &mut dyn Alloc, data: &[u8]) -> Val {
    let v = new_bytes(a, data.len());
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), bytes_data_mut_ptr(v), data.len());
    }
    v
}

pub fn bytes_length(v: Val) -> usize {
    unsafe { bytes(v).length as usize }
}

pub fn bytes_is_slice(v: Val) -> bool {
    unsafe { bytes(v).array != v }
}

pub fn bytes_owner(v: Val) -> Val {
    unsafe { bytes(v).array }
}

/// Capacity of an owning bytes value, from its block size.
fn bytes_capacity(owner: Val) -> usize {
    unsafe { header(owner).size as usize - BYTES_HDR }
}

fn bytes_data_ptr(v: Val) -> *const u8 {
    unsafe {
        let b = bytes(v);
        let owner = b.array;
        (owner.as_raw_ptr().add(BYTES_HDR)).add(b.origin as usize)
    }
}

fn bytes_data_mut_ptr(v: Val) -> *mut u8 {
    bytes_data_ptr(v) as *mut u8
}

/// The visible byte range. Valid until the next sweep.
pub fn bytes_data<'a>(v: Val) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(bytes_data_ptr(v), bytes_length(v)) }
}

/// Mutable byte range; caller must hold the value unique.
pub fn bytes_data_mut<'a>(v: Val) -> &'a mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(bytes_data_mut_ptr(v), bytes_length(v)) }
}

/// Clamp a slice range into `[0, len]`. An inverted range collapses to
/// the empty slice at the start, not at the clamped begin position.
pub fn intersect_slice(beg: i64, end: i64, len: usize) -> (usize, usize) {
    let len = len as i64;
    let b = beg.clamp(0, len);
    let e = end.clamp(0, len);
    if b > e {
        return (0, 0);
    }
    (b as usize, e as usize)
}

/// New bytes slice over `v[beg..end)`. Consumes the caller's reference to
/// `v`; callers keeping their own reference must inc_ref first.
pub fn new_bytes_slice(a: &mut dyn Alloc, v: Val, beg: i64, end: i64) -> Val {
    let (b, e) = intersect_slice(beg, end, bytes_length(v));
    let owner = bytes_owner(v);
    owner.inc_ref();
    let p = a.alloc_block(BYTES_HDR);
    let s = Val::from_raw_ptr(p);
    unsafe {
        let sb = bytes(s);
        sb.origin = bytes(v).origin + b as i32;
        sb.length = (e - b) as i32;
        sb.array = owner;
    }
    set_form(s, universe().bytes_type);
    v.dec_ref();
    s
}

// =============================================================================
// Strings
// =============================================================================

const STRING_HDR: usize = std::mem::size_of::<StringVal>();

/// New owning string with `cap` data bytes reserved. Content is zeroed
/// (NUL runes), rune and byte lengths set by the caller afterwards.
fn new_string_raw(a: &mut dyn Alloc, cap: usize) -> Val {
    let p = a.alloc_block(STRING_HDR + cap);
    let v = Val::from_raw_ptr(p);
    unsafe {
        let s = string(v);
        s.size = cap as i32;
        s.num_runes = 0;
        s.length = 0;
        s.origin = 0;
        s.cache_rune = 0;
        s.cache_byte = 0;
        s.array = v;
    }
    set_form(v, universe().string_type);
    v
}

pub fn new_string(a: &mut dyn Alloc, s: &str) -> Val {
    new_string_in(a, universe().string_type, s)
}

/// String factory with an explicit type, used while the universe itself is
/// being initialized.
pub fn new_string_in(a: &mut dyn Alloc, t: TypeRef, text: &str) -> Val {
    let p = a.alloc_block(STRING_HDR + text.len());
    let v = Val::from_raw_ptr(p);
    unsafe {
        let s = string(v);
        s.size = text.len() as i32;
        s.num_runes = text.chars().count() as i32;
        s.length = text.len() as i32;
        s.origin = 0;
        s.cache_rune = 0;
        s.cache_byte = 0;
        s.array = v;
        std::ptr::copy_nonoverlapping(text.as_ptr(), p.add(STRING_HDR), text.len());
    }
    set_form(v, t);
    v
}

/// `new(string, n, r)`: n copies of rune r.
pub fn new_string_fill(a: &mut dyn Alloc, n: usize, r: char) -> Val {
    let mut buf = [0u8; 4];
    let enc = r.encode_utf8(&mut buf).as_bytes();
    let v = new_string_raw(a, n * enc.len());
    unsafe {
        let s = string(v);
        s.num_runes = n as i32;
        s.length = (n * enc.len()) as i32;
        let base = v.as_raw_ptr().add(STRING_HDR);
        for i in 0..n {
            std::ptr::copy_nonoverlapping(enc.as_ptr(), base.add(i * enc.len()), enc.len());
        }
    }
    v
}

pub fn string_is_slice(v: Val) -> bool {
    unsafe { string(v).size < 0 }
}

pub fn string_owner(v: Val) -> Val {
    unsafe {
        if string_is_slice(v) { string(v).array } else { v }
    }
}

fn string_capacity(owner: Val) -> usize {
    debug_assert!(!string_is_slice(owner));
    unsafe { string(owner).size as usize }
}

pub fn string_byte_length(v: Val) -> usize {
    unsafe { string(v).length as usize }
}

pub fn string_num_runes(v: Val) -> usize {
    unsafe { string(v).num_runes as usize }
}

pub fn string_is_ascii(v: Val) -> bool {
    unsafe { string(v).num_runes == string(v).length }
}

fn string_data_ptr(v: Val) -> *const u8 {
    unsafe {
        let s = string(v);
        let owner = string_owner(v);
        owner.as_raw_ptr().add(STRING_HDR).add(s.origin as usize)
    }
}

pub fn string_data<'a>(v: Val) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(string_data_ptr(v), string_byte_length(v)) }
}

/// The string content. Valid until the next sweep.
///
/// Invariant: string payloads are always valid UTF-8.
pub fn string_str<'a>(v: Val) -> &'a str {
    unsafe { std::str::from_utf8_unchecked(string_data(v)) }
}

/// Step forward `n` runes from `byte` in UTF-8 data.
fn utf8_forward(data: &[u8], mut byte: usize, mut n: usize) -> usize {
    while n > 0 {
        byte += 1;
        while byte < data.len() && data[byte] & 0xC0 == 0x80 {
            byte += 1;
        }
        n -= 1;
    }
    byte
}

/// Step backward `n` runes from `byte` in UTF-8 data.
fn utf8_backward(data: &[u8], mut byte: usize, mut n: usize) -> usize {
    while n > 0 {
        byte -= 1;
        while byte > 0 && data[byte] & 0xC0 == 0x80 {
            byte -= 1;
        }
        n -= 1;
    }
    byte
}

/// Byte offset of `rune_index` (which may equal the rune count, addressing
/// the end). Walks from the nearest of the start, the cached pair and the
/// end, and refreshes the cache.
pub fn string_byte_offset(v: Val, rune_index: usize) -> usize {
    let num_runes = string_num_runes(v);
    debug_assert!(rune_index <= num_runes);
    if string_is_ascii(v) {
        return rune_index;
    }
    let data = string_data(v);
    let (cr, cb) = unsafe { (string(v).cache_rune as usize, string(v).cache_byte as usize) };
    // Candidate anchors by rune distance.
    let mut anchor = (0usize, 0usize);
    let mut best = rune_index;
    let d_cache = rune_index.abs_diff(cr);
    if d_cache < best {
        best = d_cache;
        anchor = (cr, cb);
    }
    if num_runes - rune_index < best {
        anchor = (num_runes, data.len());
    }
    let byte = if rune_index >= anchor.0 {
        utf8_forward(data, anchor.1, rune_index - anchor.0)
    } else {
        utf8_backward(data, anchor.1, anchor.0 - rune_index)
    };
    unsafe {
        string(v).cache_rune = rune_index as i32;
        string(v).cache_byte = byte as i32;
    }
    byte
}

/// Rune at a rune index.
pub fn string_rune_at(v: Val, rune_index: usize) -> char {
    let off = string_byte_offset(v, rune_index);
    string_str(v)[off..].chars().next().expect("rune index in range")
}

/// New string slice over runes `[beg, end)`. Consumes the caller's
/// reference to `v`.
pub fn new_string_slice(a: &mut dyn Alloc, v: Val, beg: i64, end: i64) -> Val {
    let (b, e) = intersect_slice(beg, end, string_num_runes(v));
    let bb = string_byte_offset(v, b);
    let be = string_byte_offset(v, e);
    let owner = string_owner(v);
    owner.inc_ref();
    let p = a.alloc_block(STRING_HDR);
    let s = Val::from_raw_ptr(p);
    unsafe {
        let sv = string(s);
        sv.size = -1;
        sv.num_runes = (e - b) as i32;
        sv.length = (be - bb) as i32;
        sv.origin = string(v).origin + bb as i32;
        sv.cache_rune = 0;
        sv.cache_byte = 0;
        sv.array = owner;
    }
    set_form(s, universe().string_type);
    v.dec_ref();
    s
}

// =============================================================================
// Arrays
// =============================================================================

const ARRAY_HDR: usize = std::mem::size_of::<ArrayVal>();
const SLOT: usize = std::mem::size_of::<Val>();

/// New owning array with undefined (null) elements.
pub fn new_array(a: &mut dyn Alloc, t: TypeRef, len: usize) -> Val {
    debug_assert!(t.is_array());
    let p = a.alloc_block(ARRAY_HDR + len * SLOT);
    let v = Val::from_raw_ptr(p);
    unsafe {
        let av = array(v);
        av.origin = 0;
        av.length = len as i32;
        av.array = v;
    }
    set_form(v, t);
    v
}

/// `new(array of T, n, init)`: each element is a new reference to `init`.
pub fn new_array_init(a: &mut dyn Alloc, t: TypeRef, len: usize, init: Val) -> Val {
    let v = new_array(a, t, len);
    for i in 0..len {
        init.inc_ref();
        unsafe { *array_slot(v, i) = init }
    }
    v
}

pub fn array_length(v: Val) -> usize {
    unsafe { array(v).length as usize }
}

pub fn array_is_slice(v: Val) -> bool {
    unsafe { array(v).array != v }
}

pub fn array_owner(v: Val) -> Val {
    unsafe { array(v).array }
}

fn array_capacity(owner: Val) -> usize {
    (unsafe { header(owner).size as usize } - ARRAY_HDR) / SLOT
}

unsafe fn array_slot(v: Val, i: usize) -> *mut Val {
    unsafe {
        let av = array(v);
        let owner = av.array;
        (owner.as_raw_ptr().add(ARRAY_HDR) as *mut Val).add(av.origin as usize + i)
    }
}

/// Element at `i` (no reference transfer).
pub fn array_at(v: Val, i: usize) -> Val {
    debug_assert!(i < array_length(v), "array index out of range");
    unsafe { *array_slot(v, i) }
}

/// Store into element `i`: the old element's reference is released, `x`'s
/// is transferred in.
pub fn array_put(v: Val, i: usize, x: Val) {
    debug_assert!(i < array_length(v), "array index out of range");
    unsafe {
        let slot = array_slot(v, i);
        (*slot).dec_ref();
        *slot = x;
    }
}

/// Store into element `i` without releasing the old element, whose
/// reference the caller has already consumed (uniq-loading path).
pub fn array_put_raw(v: Val, i: usize, x: Val) {
    debug_assert!(i < array_length(v), "array index out of range");
    unsafe { *array_slot(v, i) = x }
}

/// New array slice over `v[beg..end)`. Consumes the caller's reference.
pub fn new_array_slice(a: &mut dyn Alloc, v: Val, beg: i64, end: i64) -> Val {
    let (b, e) = intersect_slice(beg, end, array_length(v));
    let owner = array_owner(v);
    owner.inc_ref();
    let t = v.type_();
    let p = a.alloc_block(ARRAY_HDR);
    let s = Val::from_raw_ptr(p);
    unsafe {
        let sv = array(s);
        sv.origin = array(v).origin + b as i32;
        sv.length = (e - b) as i32;
        sv.array = owner;
    }
    set_form(s, t);
    v.dec_ref();
    s
}

// =============================================================================
// Tuples
// =============================================================================

const TUPLE_HDR: usize = std::mem::size_of::<TupleVal>();

/// In-proto bit initialization mode for new tuples.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum InitMode {
    /// All bits cleared (wire decoding starts from nothing).
    ClearInproto,
    /// All bits set (explicit construction defines every field).
    SetInproto,
}

fn tuple_bit_words(nslots: usize) -> usize {
    nslots.div_ceil(64)
}

fn tuple_block_size(nslots: usize) -> usize {
    TUPLE_HDR + nslots * SLOT + tuple_bit_words(nslots) * 8
}

pub fn new_tuple(a: &mut dyn Alloc, t: TypeRef, mode: InitMode) -> Val {
    let nslots = t.as_tuple().nslots as usize;
    let p = a.alloc_block(tuple_block_size(nslots));
    let v = Val::from_raw_ptr(p);
    set_form(v, t);
    if mode == InitMode::SetInproto {
        for i in 0..nslots {
            tuple_set_bit(v, i);
        }
    }
    v
}

pub fn tuple_nslots(v: Val) -> usize {
    v.type_().as_tuple().nslots as usize
}

unsafe fn tuple_slot_ptr(v: Val, i: usize) -> *mut Val {
    unsafe { (v.as_raw_ptr().add(TUPLE_HDR) as *mut Val).add(i) }
}

unsafe fn tuple_bits_ptr(v: Val, nslots: usize) -> *mut u64 {
    unsafe { v.as_raw_ptr().add(TUPLE_HDR + nslots * SLOT) as *mut u64 }
}

pub fn tuple_slot_at(v: Val, i: usize) -> Val {
    debug_assert!(i < tuple_nslots(v), "tuple slot out of range");
    unsafe { *tuple_slot_ptr(v, i) }
}

/// Store into slot `i`: old reference released, `x`'s transferred.
pub fn tuple_set_slot(v: Val, i: usize, x: Val) {
    debug_assert!(i < tuple_nslots(v), "tuple slot out of range");
    unsafe {
        let slot = tuple_slot_ptr(v, i);
        (*slot).dec_ref();
        *slot = x;
    }
}

/// Store into slot `i` without releasing the old slot, whose reference
/// the caller has already consumed (uniq-loading path).
pub fn tuple_set_slot_raw(v: Val, i: usize, x: Val) {
    debug_assert!(i < tuple_nslots(v), "tuple slot out of range");
    unsafe { *tuple_slot_ptr(v, i) = x }
}

pub fn tuple_bit_at(v: Val, i: usize) -> bool {
    let n = tuple_nslots(v);
    debug_assert!(i < n);
    unsafe { *tuple_bits_ptr(v, n).add(i / 64) & (1 << (i % 64)) != 0 }
}

pub fn tuple_set_bit(v: Val, i: usize) {
    let n = tuple_nslots(v);
    debug_assert!(i < n);
    unsafe { *tuple_bits_ptr(v, n).add(i / 64) |= 1 << (i % 64) }
}

pub fn tuple_clear_bit(v: Val, i: usize) {
    let n = tuple_nslots(v);
    debug_assert!(i < n);
    unsafe { *tuple_bits_ptr(v, n).add(i / 64) &= !(1 << (i % 64)) }
}

/// Copy the slot words of a pre-built read-only default tuple into a fresh
/// tuple. The defaults' contained values are read-only, so plain word
/// copies need no reference accounting. In-proto bits are not copied.
pub fn tuple_copy_default_slots(v: Val, default: Val) {
    let n = tuple_nslots(v);
    debug_assert_eq!(n, tuple_nslots(default));
    for i in 0..n {
        let d = tuple_slot_at(default, i);
        debug_assert!(d.is_readonly());
        unsafe { *tuple_slot_ptr(v, i) = d }
    }
}

// =============================================================================
// Closures
// =============================================================================

pub fn new_closure(a: &mut dyn Alloc, t: TypeRef, entry: u32, context: u32) -> Val {
    debug_assert!(t.is_function());
    let p = a.alloc_block(std::mem::size_of::<ClosureVal>());
    let v = Val::from_raw_ptr(p);
    unsafe {
        closure(v).entry = entry;
        closure(v).context = context;
    }
    set_form(v, t);
    v
}

pub fn closure_entry(v: Val) -> u32 {
    unsafe { closure(v).entry }
}

pub fn closure_context(v: Val) -> u32 {
    unsafe { closure(v).context }
}

// =============================================================================
// Maps
// =============================================================================

pub fn new_map(a: &mut dyn Alloc, t: TypeRef, space: usize) -> Val {
    debug_assert!(t.is_map());
    let p = a.alloc_block(std::mem::size_of::<MapVal>());
    let v = Val::from_raw_ptr(p);
    unsafe { mapval(v).map = Box::into_raw(Box::new(SzlMap::new(space))) }
    set_form(v, t);
    v
}

/// The hash table behind a map value. Valid until the value is deleted.
pub fn map_ref<'a>(v: Val) -> &'a mut SzlMap {
    debug_assert!(v.type_().is_map());
    unsafe { &mut *mapval(v).map }
}

/// Replace the table behind a map value (used by uniq). The old table is
/// dropped without touching element refs; the caller has transferred them.
pub(crate) fn map_take_table(v: Val) -> Box<SzlMap> {
    unsafe { Box::from_raw(mapval(v).map) }
}

pub(crate) fn map_set_table(v: Val, table: Box<SzlMap>) {
    unsafe { mapval(v).map = Box::into_raw(table) }
}

// =============================================================================
// Slice assignment (uniq -> bounds -> fit / relocate / reallocate)
// =============================================================================

/// Write `x` over the element range `[beg, end)` of `v` (runes for
/// strings). `v` must already be exclusively owned; the caller keeps its
/// reference to `v` and to `x`.
pub fn put_slice(heap: &mut Heap, v: Val, beg: i64, end: i64, x: Val) -> Result<(), String> {
    let t = v.type_();
    if t.is_bytes() {
        let (b, e) = intersect_slice(beg, end, bytes_length(v));
        bytes_splice(heap, v, b, e, bytes_data(x).to_vec().as_slice());
        Ok(())
    } else if t.is_string() {
        let (b, e) = intersect_slice(beg, end, string_num_runes(v));
        let bb = string_byte_offset(v, b);
        let be = string_byte_offset(v, e);
        let src = string_data(x).to_vec();
        string_splice_bytes(heap, v, bb, be, &src, string_num_runes(x));
        Ok(())
    } else if t.is_array() {
        let (b, e) = intersect_slice(beg, end, array_length(v));
        array_splice(heap, v, b, e, x);
        Ok(())
    } else {
        Err(format!("cannot assign a slice of {}", t.name()))
    }
}

fn bytes_splice(heap: &mut Heap, v: Val, beg: usize, end: usize, src: &[u8]) {
    let old_len = bytes_length(v);
    let new_len = old_len - (end - beg) + src.len();
    let owner = bytes_owner(v);
    let in_place = !bytes_is_slice(v) && bytes_capacity(owner) >= new_len;
    unsafe {
        if in_place {
            let base = bytes_data_mut_ptr(v);
            // Owner origin is 0 by invariant; shift the suffix, then the
            // insertion.
            std::ptr::copy(base.add(end), base.add(beg + src.len()), old_len - end);
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(beg), src.len());
            bytes(v).length = new_len as i32;
        } else {
            let fresh = new_bytes(heap, new_len);
            let dst = bytes_data_mut_ptr(fresh);
            let old = bytes_data_ptr(v);
            std::ptr::copy_nonoverlapping(old, dst, beg);
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst.add(beg), src.len());
            std::ptr::copy_nonoverlapping(old.add(end), dst.add(beg + src.len()), old_len - end);
            let was_slice = bytes_is_slice(v);
            let old_owner = bytes_owner(v);
            bytes(v).array = fresh; // fresh's reference transfers to v
            bytes(v).origin = 0;
            bytes(v).length = new_len as i32;
            if was_slice {
                old_owner.dec_ref();
            }
        }
    }
}

fn string_splice_bytes(
    heap: &mut Heap,
    v: Val,
    byte_beg: usize,
    byte_end: usize,
    src: &[u8],
    src_runes: usize,
) {
    let old_len = string_byte_length(v);
    let old_runes = string_num_runes(v);
    let removed_runes = string_str(v)[byte_beg..byte_end].chars().count();
    let new_len = old_len - (byte_end - byte_beg) + src.len();
    let new_runes = old_runes - removed_runes + src_runes;
    let owner = string_owner(v);
    let in_place = !string_is_slice(v) && string_capacity(owner) >= new_len;
    unsafe {
        if in_place {
            let base = string_data_ptr(v) as *mut u8;
            std::ptr::copy(
                base.add(byte_end),
                base.add(byte_beg + src.len()),
                old_len - byte_end,
            );
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(byte_beg), src.len());
        } else {
            // Reallocate with headroom so repeated appends stay linear.
            let cap = new_len + new_len / 2;
            let fresh = new_string_raw(heap, cap);
            {
                let fs = string(fresh);
                fs.length = new_len as i32;
                fs.num_runes = new_runes as i32;
            }
            let dst = string_data_ptr(fresh) as *mut u8;
            let old = string_data_ptr(v);
            std::ptr::copy_nonoverlapping(old, dst, byte_beg);
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst.add(byte_beg), src.len());
            std::ptr::copy_nonoverlapping(
                old.add(byte_end),
                dst.add(byte_beg + src.len()),
                old_len - byte_end,
            );
            let was_slice = string_is_slice(v);
            let old_owner = string_owner(v);
            let sv = string(v);
            sv.size = -1; // v now views fresh storage
            sv.array = fresh;
            sv.origin = 0;
            if was_slice {
                old_owner.dec_ref();
            }
        }
        let sv = string(v);
        sv.length = new_len as i32;
        sv.num_runes = new_runes as i32;
        sv.cache_rune = 0;
        sv.cache_byte = 0;
    }
}

fn array_splice(heap: &mut Heap, v: Val, beg: usize, end: usize, x: Val) {
    let old_len = array_length(v);
    let nx = array_length(x);
    let new_len = old_len - (end - beg) + nx;
    // Snapshot the insertion elements first: x may alias v's storage.
    let mut inserted = Vec::with_capacity(nx);
    for i in 0..nx {
        let e = array_at(x, i);
        e.inc_ref();
        inserted.push(e);
    }
    let owner = array_owner(v);
    let in_place = !array_is_slice(v) && array_capacity(owner) >= new_len;
    unsafe {
        if in_place {
            for i in beg..end {
                (*array_slot(v, i)).dec_ref();
            }
            let base = array_slot(v, 0);
            std::ptr::copy(base.add(end), base.add(beg + nx), old_len - end);
            for (i, e) in inserted.into_iter().enumerate() {
                *base.add(beg + i) = e;
            }
            // Zero vacated slots so the sweeper never sees stale words.
            for i in new_len..old_len {
                *base.add(i) = Val::NULL;
            }
            array(v).length = new_len as i32;
        } else {
            let t = v.type_();
            let fresh = new_array(heap, t, new_len);
            for i in 0..beg {
                let e = array_at(v, i);
                e.inc_ref();
                *array_slot(fresh, i) = e;
            }
            for (i, e) in inserted.into_iter().enumerate() {
                *array_slot(fresh, beg + i) = e;
            }
            for i in end..old_len {
                let e = array_at(v, i);
                e.inc_ref();
                *array_slot(fresh, beg + nx + (i - end)) = e;
            }
            let was_slice = array_is_slice(v);
            let old_owner = array_owner(v);
            if !was_slice {
                // v owned its elements inline; release them before the
                // inline storage becomes unreachable behind the slice view.
                for i in 0..old_len {
                    let slot = array_slot(v, i);
                    (*slot).dec_ref();
                    *slot = Val::NULL;
                }
            }
            array(v).array = fresh;
            array(v).origin = 0;
            array(v).length = new_len as i32;
            if was_slice {
                old_owner.dec_ref();
            }
        }
    }
}

// =============================================================================
// Compaction support
// =============================================================================

/// Rewrite a bytes value's owner pointer after compaction. An owner's
/// self-pointer maps to its own new address through the same table.
pub fn bytes_adjust_owner(v: Val, reloc: &Relocation) {
    unsafe { reloc.relocate_slot(&mut bytes(v).array) }
}

pub fn string_adjust_owner(v: Val, reloc: &Relocation) {
    unsafe { reloc.relocate_slot(&mut string(v).array) }
}

/// Rewrite an array's owner pointer and, for owners, every element slot.
pub fn array_adjust(v: Val, reloc: &Relocation) {
    unsafe {
        let av = array(v);
        reloc.relocate_slot(&mut av.array);
        if av.array == v {
            for i in 0..av.length as usize {
                reloc.relocate_slot(&mut *array_slot(v, i));
            }
        }
    }
}

pub fn tuple_adjust(v: Val, reloc: &Relocation) {
    for i in 0..tuple_nslots(v) {
        unsafe { reloc.relocate_slot(&mut *tuple_slot_ptr(v, i)) }
    }
}

/// Store rune `r` at rune index `i` of a unique string.
pub fn string_put_rune(heap: &mut Heap, v: Val, i: usize, r: char) {
    let bb = string_byte_offset(v, i);
    let be = string_byte_offset(v, i + 1);
    let mut buf = [0u8; 4];
    let enc = r.encode_utf8(&mut buf).as_bytes().to_vec();
    string_splice_bytes(heap, v, bb, be, &enc, 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::StaticHeap;
    use crate::types::universe;

    fn heap() -> Heap {
        Heap::new(4096, 1 << 20)
    }

    #[test]
    fn test_int_smi_and_boxed() {
        let mut h = heap();
        let small = new_int(&mut h, 42);
        assert!(small.is_smi());
        assert_eq!(small.as_int(), 42);

        let big = new_int(&mut h, i64::MAX);
        assert!(big.is_ptr());
        assert_eq!(big.as_int(), i64::MAX);
        assert!(big.type_().is_int());
    }

    #[test]
    fn test_scalar_roundtrips() {
        let mut h = heap();
        assert!(new_bool(&mut h, true).as_bool());
        assert!(!new_bool(&mut h, false).as_bool());
        assert_eq!(new_uint(&mut h, u64::MAX).as_uint(), u64::MAX);
        assert_eq!(new_float(&mut h, 2.5).as_float(), 2.5);
        assert_eq!(new_time(&mut h, 123456).as_time(), 123456);
        assert_eq!(new_fingerprint(&mut h, 99).as_fingerprint(), 99);
    }

    #[test]
    fn test_ref_counting() {
        let mut h = heap();
        let v = new_uint(&mut h, 7);
        assert_eq!(v.ref_(), 1);
        v.inc_ref();
        assert_eq!(v.ref_(), 2);
        v.dec_ref();
        assert_eq!(v.ref_(), 1);
        assert!(v.is_unique());
    }

    #[test]
    fn test_smi_ref_counting_is_noop() {
        let v = Val::from_smi(5);
        v.inc_ref();
        v.dec_ref();
        v.dec_ref();
        assert_eq!(v.ref_(), 1);
        assert!(v.is_readonly());
    }

    #[test]
    fn test_bytes_owner_and_slice() {
        let mut h = heap();
        let b = new_bytes_init(&mut h, b"hello world");
        assert_eq!(bytes_data(b), b"hello world");
        assert!(!bytes_is_slice(b));

        b.inc_ref(); // keep our reference across the slice transfer
        let s = new_bytes_slice(&mut h, b, 6, 11);
        assert!(bytes_is_slice(s));
        assert_eq!(bytes_data(s), b"world");
        assert_eq!(bytes_owner(s), b);
        assert_eq!(b.ref_(), 2); // ours + the slice's
    }

    #[test]
    fn test_string_runes() {
        let mut h = heap();
        // "café!" is 6 bytes, 5 runes.
        let s = new_string(&mut h, "café!");
        assert_eq!(string_byte_length(s), 6);
        assert_eq!(string_num_runes(s), 5);
        assert!(!string_is_ascii(s));
        assert_eq!(string_byte_offset(s, 3), 3);
        assert_eq!(string_byte_offset(s, 4), 5);
        assert_eq!(string_rune_at(s, 3), 'é');
        assert_eq!(string_rune_at(s, 4), '!');
    }

    #[test]
    fn test_string_slice() {
        let mut h = heap();
        let s = new_string(&mut h, "café!");
        s.inc_ref();
        let t = new_string_slice(&mut h, s, 1, 4);
        assert_eq!(string_str(t), "afé");
        assert_eq!(string_num_runes(t), 3);
        assert!(string_is_slice(t));
    }

    #[test]
    fn test_array_elements() {
        let mut h = heap();
        let u = universe();
        let a = new_array(&mut h, u.array_of_int, 3);
        assert_eq!(array_length(a), 3);
        assert!(array_at(a, 0).is_null());
        array_put(a, 0, new_int(&mut h, 10));
        array_put(a, 2, new_int(&mut h, 30));
        assert_eq!(array_at(a, 0).as_int(), 10);
        assert!(array_at(a, 1).is_null());
        assert_eq!(array_at(a, 2).as_int(), 30);
    }

    #[test]
    fn test_array_init_shares_refs() {
        let mut h = heap();
        let u = universe();
        let init = new_uint(&mut h, 5);
        let a = new_array_init(&mut h, Type::array(u.uint_type), 4, init);
        assert_eq!(init.ref_(), 5); // original + 4 elements
        init.dec_ref();
        for i in 0..4 {
            assert_eq!(array_at(a, i).as_uint(), 5);
        }
    }

    #[test]
    fn test_tuple_slots_and_bits() {
        let mut h = heap();
        let u = universe();
        let t = Type::tuple(
            vec![
                crate::types::FieldSpec::new("a", u.int_type),
                crate::types::FieldSpec::new("b", u.string_type),
            ],
            false,
            false,
        );
        let v = new_tuple(&mut h, t, InitMode::ClearInproto);
        assert_eq!(tuple_nslots(v), 2);
        assert!(!tuple_bit_at(v, 0));
        tuple_set_slot(v, 0, new_int(&mut h, 1));
        tuple_set_bit(v, 0);
        assert!(tuple_bit_at(v, 0));
        assert!(!tuple_bit_at(v, 1));
        tuple_clear_bit(v, 0);
        assert!(!tuple_bit_at(v, 0));
    }

    #[test]
    fn test_intersect_slice_clamps() {
        assert_eq!(intersect_slice(0, 5, 10), (0, 5));
        assert_eq!(intersect_slice(-3, 4, 10), (0, 4));
        assert_eq!(intersect_slice(7, 99, 10), (7, 10));
        // An inverted range is the empty slice at the start, not at beg.
        assert_eq!(intersect_slice(5, 2, 10), (0, 0));
        assert_eq!(intersect_slice(99, 0, 10), (0, 0));
    }

    #[test]
    fn test_put_slice_array() {
        let mut h = heap();
        let u = universe();
        // a = [0,1,2,3,4]; a[1:3] = [9] => [0,9,3,4]
        let a = new_array(&mut h, u.array_of_int, 5);
        for i in 0..5 {
            array_put(a, i, Val::from_smi(i as i64));
        }
        let x = new_array(&mut h, u.array_of_int, 1);
        array_put(x, 0, Val::from_smi(9));
        put_slice(&mut h, a, 1, 3, x).unwrap();
        assert_eq!(array_length(a), 4);
        let got: Vec<i64> = (0..4).map(|i| array_at(a, i).as_int()).collect();
        assert_eq!(got, vec![0, 9, 3, 4]);
    }

    #[test]
    fn test_put_slice_grows() {
        let mut h = heap();
        let u = universe();
        let a = new_array(&mut h, u.array_of_int, 2);
        array_put(a, 0, Val::from_smi(1));
        array_put(a, 1, Val::from_smi(2));
        let x = new_array(&mut h, u.array_of_int, 3);
        for i in 0..3 {
            array_put(x, i, Val::from_smi(7 + i as i64));
        }
        // Replace the empty range [1,1) => insertion.
        put_slice(&mut h, a, 1, 1, x).unwrap();
        assert_eq!(array_length(a), 5);
        let got: Vec<i64> = (0..5).map(|i| array_at(a, i).as_int()).collect();
        assert_eq!(got, vec![1, 7, 8, 9, 2]);
    }

    #[test]
    fn test_put_slice_string() {
        let mut h = heap();
        let s = new_string(&mut h, "hello world");
        let x = new_string(&mut h, "züri");
        put_slice(&mut h, s, 6, 11, x).unwrap();
        assert_eq!(string_str(s), "hello züri");
        assert_eq!(string_num_runes(s), 10);
    }

    #[test]
    fn test_put_slice_prefix_suffix_property() {
        let mut h = heap();
        let old = "abcdefgh";
        let s = new_string(&mut h, old);
        let x = new_string(&mut h, "XYZ");
        let (i, j) = (2usize, 5usize);
        put_slice(&mut h, s, i as i64, j as i64, x).unwrap();
        let got = string_str(s).to_string();
        assert_eq!(got.len(), old.len() - (j - i) + 3);
        assert_eq!(&got[..i], &old[..i]);
        assert_eq!(&got[i..i + 3], "XYZ");
        assert_eq!(&got[i + 3..], &old[j..]);
    }

    #[test]
    fn test_string_put_rune() {
        let mut h = heap();
        let s = new_string(&mut h, "cafe!");
        string_put_rune(&mut h, s, 3, 'é');
        assert_eq!(string_str(s), "café!");
        assert_eq!(string_num_runes(s), 5);
        assert_eq!(string_byte_length(s), 6);
    }

    #[test]
    fn test_readonly_factory() {
        let mut s = StaticHeap::new();
        let v = new_string(&mut s, "static text");
        assert!(v.is_readonly());
        v.dec_ref(); // must stay readonly
        assert!(v.is_readonly());
        assert_eq!(string_str(v), "static text");
    }

    #[test]
    fn test_basic64_dispatch() {
        let mut h = heap();
        assert_eq!(new_basic64(&mut h, universe().int_type, 7).as_int(), 7);
        assert_eq!(
            new_basic64(&mut h, universe().uint_type, u64::MAX).as_uint(),
            u64::MAX
        );
    }
}
