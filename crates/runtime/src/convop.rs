//! Cross-Type Conversions
//!
//! One table, indexed by `ConversionOp`, drives every conversion the
//! instruction set can request: the implementation function, whether the
//! op is legal element-wise inside array-to-array and array-to-map
//! conversions, whether it can fail, the result array type for array
//! conversions, and a description for error messages.
//!
//! Scalar extra arguments (radix, encoding, time zone) are consumed from
//! the stack once per conversion; for array conversions once for the
//! whole array, and defaulted entirely for array-to-map.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use num_enum::TryFromPrimitive;

use szl_core::{Heap, TypeRef, Universe, Val, universe, val};

use crate::process::Process;
use crate::proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ConversionOp {
    Noconv = 0,
    Typecast,
    Str2Bool,
    Fpr2Bytes,
    Str2Bytes,
    Int2Bytes,
    Uint2Bytes,
    Str2Fpr,
    Uint2Fpr,
    Bytes2Fpr,
    Int2Float,
    Str2Float,
    Uint2Float,
    Float2Int,
    Str2Int,
    Uint2Int,
    Bytes2Int,
    Bool2Str,
    Bytes2Str,
    Float2Str,
    Int2Str,
    Time2Str,
    Uint2Str,
    Fpr2Str,
    Array2Str,
    Map2Str,
    Tuple2Str,
    Function2Str,
    Str2Array,
    Str2Time,
    Uint2Time,
    Float2Uint,
    Bits2Uint,
    Str2Uint,
    Bytes2Uint,
    Bytes2Proto,
    Proto2Bytes,
    Tuple2Tuple,
}

/// Recognized string/bytes encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enc {
    Utf8,
    Latin1,
    Hex,
    ArrayLiteral,
    Unicode,
    Empty,
}

/// Checked and defaulted extra conversion arguments.
pub struct CvtArgs {
    pub type_: Option<TypeRef>,
    pub base: i64,
    pub byte_size: usize,
    pub little: bool,
    pub varint: bool,
    pub zigzag: bool,
    pub enc: Enc,
    pub tz: String,
}

impl CvtArgs {
    /// Defaults, used for array-to-map conversions where no stack
    /// arguments are consumed.
    pub fn defaults(op: ConversionOp, type_: Option<TypeRef>) -> CvtArgs {
        let enc = match op {
            ConversionOp::Array2Str
            | ConversionOp::Str2Array
            | ConversionOp::Map2Str
            | ConversionOp::Tuple2Str => Enc::Unicode,
            _ => Enc::Utf8,
        };
        CvtArgs {
            type_,
            base: match op {
                ConversionOp::Int2Str | ConversionOp::Uint2Str => 10,
                _ => 0,
            },
            byte_size: 8,
            little: false, // szl's packed integer default is big endian
            varint: false,
            zigzag: false,
            enc,
            tz: String::new(),
        }
    }
}

/// Everything a conversion function may touch.
pub struct ConvCx<'a> {
    pub heap: &'a mut Heap,
    pub args: CvtArgs,
    pub strict_proto: bool,
    pub proto_read: &'a mut u64,
    pub proto_skipped: &'a mut u64,
}

type ConvFn = fn(&mut ConvCx, Val) -> Result<Val, String>;

struct ConversionAttributes {
    op: ConversionOp,
    func: ConvFn,
    array_to_array: bool,
    array_to_map: bool,
    can_fail: bool,
    /// Result array type for element-wise array conversions; typecast and
    /// the proto ops take theirs from the instruction instead.
    result_array: fn(&'static Universe) -> TypeRef,
    description: &'static str,
}

macro_rules! conv {
    ($op:ident, $func:ident, $arr:expr, $map:expr, $fail:expr, $result:ident, $descr:expr) => {
        ConversionAttributes {
            op: ConversionOp::$op,
            func: $func,
            array_to_array: $arr,
            array_to_map: $map,
            can_fail: $fail,
            result_array: |u| u.$result,
            description: $descr,
        }
    };
}

#[rustfmt::skip]
static CONVERSION_TABLE: &[ConversionAttributes] = &[
    // op          function       array? map?   fail?  result array          description
    conv!(Noconv,      no_conv,      false, true,  false, array_of_int,         "no conversion"),
    conv!(Typecast,    type_cast,    true,  true,  false, array_of_int,         "type cast"),
    conv!(Str2Bool,    str2bool,     true,  true,  false, array_of_bool,        "string to bool"),
    conv!(Fpr2Bytes,   fpr2bytes,    true,  true,  false, array_of_bytes,       "fingerprint to bytes"),
    conv!(Str2Bytes,   str2bytes,    true,  true,  true,  array_of_bytes,       "string to bytes"),
    conv!(Int2Bytes,   int2bytes,    true,  false, true,  array_of_bytes,       "int to bytes"),
    conv!(Uint2Bytes,  uint2bytes,   true,  false, true,  array_of_bytes,       "uint to bytes"),
    conv!(Str2Fpr,     str2fpr,      true,  true,  true,  array_of_fingerprint, "string to fingerprint"),
    conv!(Uint2Fpr,    uint2fpr,     true,  true,  false, array_of_fingerprint, "uint to fingerprint"),
    conv!(Bytes2Fpr,   bytes2fpr,    true,  true,  true,  array_of_fingerprint, "bytes to fingerprint"),
    conv!(Int2Float,   int2float,    true,  true,  false, array_of_float,       "int to float"),
    conv!(Str2Float,   str2float,    true,  true,  true,  array_of_float,       "string to float"),
    conv!(Uint2Float,  uint2float,   true,  true,  false, array_of_float,       "uint to float"),
    conv!(Float2Int,   float2int,    true,  true,  false, array_of_int,         "float to int"),
    conv!(Str2Int,     str2int,      true,  true,  true,  array_of_int,         "string to int"),
    conv!(Uint2Int,    uint2int,     true,  true,  false, array_of_int,         "uint to int"),
    conv!(Bytes2Int,   bytes2int,    true,  false, true,  array_of_int,         "bytes to int"),
    conv!(Bool2Str,    bool2str,     true,  true,  false, array_of_string,      "bool to string"),
    conv!(Bytes2Str,   bytes2str,    true,  true,  true,  array_of_string,      "bytes to string"),
    conv!(Float2Str,   float2str,    true,  true,  false, array_of_string,      "float to string"),
    conv!(Int2Str,     int2str,      true,  true,  true,  array_of_string,      "int to string"),
    conv!(Time2Str,    time2str,     true,  true,  true,  array_of_string,      "time to string"),
    conv!(Uint2Str,    uint2str,     true,  true,  true,  array_of_string,      "uint to string"),
    conv!(Fpr2Str,     fpr2str,      true,  true,  false, array_of_string,      "fingerprint to string"),
    conv!(Array2Str,   val2str,      false, false, true,  array_of_string,      "array to string"),
    conv!(Map2Str,     val2str,      false, false, false, array_of_string,      "map to string"),
    conv!(Tuple2Str,   val2str,      false, false, false, array_of_string,      "tuple to string"),
    conv!(Function2Str, val2str,     false, false, false, array_of_string,      "function to string"),
    conv!(Str2Array,   str2array,    false, false, true,  array_of_int,         "string to array"),
    conv!(Str2Time,    str2time,     true,  true,  true,  array_of_time,        "string to time"),
    conv!(Uint2Time,   uint2time,    true,  true,  false, array_of_time,        "uint to time"),
    conv!(Float2Uint,  float2uint,   true,  true,  false, array_of_uint,        "float to uint"),
    conv!(Bits2Uint,   bits2uint,    true,  true,  false, array_of_uint,        "bits to uint"),
    conv!(Str2Uint,    str2uint,     true,  true,  true,  array_of_uint,        "string to uint"),
    conv!(Bytes2Uint,  bytes2uint,   true,  false, true,  array_of_uint,        "bytes to uint"),
    conv!(Bytes2Proto, bytes2proto,  true,  false, true,  array_of_int,         "bytes to proto tuple"),
    conv!(Proto2Bytes, proto2bytes,  true,  false, true,  array_of_bytes,       "proto tuple to bytes"),
    conv!(Tuple2Tuple, tuple2tuple,  true,  false, false, array_of_int,         "tuple to tuple"),
];

fn attributes(op: ConversionOp) -> &'static ConversionAttributes {
    let a = &CONVERSION_TABLE[op as usize];
    debug_assert_eq!(a.op, op);
    a
}

pub fn conversion_can_fail(op: ConversionOp) -> bool {
    attributes(op).can_fail
}

pub fn implemented_array_to_array(op: ConversionOp) -> bool {
    attributes(op).array_to_array
}

pub fn implemented_array_to_map(op: ConversionOp) -> bool {
    attributes(op).array_to_map
}

pub fn conversion_name(op: ConversionOp) -> &'static str {
    attributes(op).description
}

fn decode_op(byte: u8) -> Result<ConversionOp, String> {
    ConversionOp::try_from_primitive(byte).map_err(|_| format!("bad conversion op {byte}"))
}

/// The ops whose instruction type operand names the conversion target.
fn takes_type_operand(op: ConversionOp) -> bool {
    matches!(
        op,
        ConversionOp::Typecast
            | ConversionOp::Bytes2Proto
            | ConversionOp::Proto2Bytes
            | ConversionOp::Tuple2Tuple
    )
}

// =============================================================================
// Extra-argument parsing
// =============================================================================

fn pop_string_arg(p: &mut Process) -> String {
    let v = p.pop();
    let s = val::string_str(v).to_string();
    v.dec_ref();
    s
}

fn parse_packing(args: &mut CvtArgs, s: &str, what: &str) -> Result<(), String> {
    if s.eq_ignore_ascii_case("varint") {
        args.varint = true;
        args.zigzag = false;
    } else if s.eq_ignore_ascii_case("zigzag") {
        // ZigZag is layered on the varint encoding.
        args.varint = true;
        args.zigzag = true;
    } else if s.eq_ignore_ascii_case("fixed64-little") {
        args.varint = false;
        args.byte_size = 8;
        args.little = true;
    } else if s.eq_ignore_ascii_case("fixed64-big") || s.eq_ignore_ascii_case("szl") || s.is_empty()
    {
        args.varint = false;
        args.byte_size = 8;
        args.little = false;
    } else if s.eq_ignore_ascii_case("fixed32-little") {
        args.varint = false;
        args.byte_size = 4;
        args.little = true;
    } else if s.eq_ignore_ascii_case("fixed32-big") {
        args.varint = false;
        args.byte_size = 4;
        args.little = false;
    } else {
        return Err(format!("unknown encoding \"{s}\" for conversion of {what}"));
    }
    Ok(())
}

/// Pop and validate the scalar extra arguments for `op`.
fn get_extra_args(
    p: &mut Process,
    op: ConversionOp,
    type_: Option<TypeRef>,
) -> Result<CvtArgs, String> {
    let mut args = CvtArgs::defaults(op, type_);
    match op {
        ConversionOp::Str2Fpr | ConversionOp::Str2Int | ConversionOp::Str2Uint => {
            args.base = p.pop_int();
            if args.base != 0 && !(2..=36).contains(&args.base) {
                return Err("illegal base".to_string());
            }
        }
        ConversionOp::Int2Str | ConversionOp::Uint2Str => {
            args.base = p.pop_int();
            if !(2..=36).contains(&args.base) {
                return Err("illegal base".to_string());
            }
        }
        ConversionOp::Str2Bytes => {
            let s = pop_string_arg(p);
            args.enc = if s.eq_ignore_ascii_case("utf-8") {
                Enc::Utf8
            } else if s.eq_ignore_ascii_case("latin-1") {
                Enc::Latin1
            } else if s.eq_ignore_ascii_case("hex") {
                Enc::Hex
            } else {
                return Err("unknown encoding for string to bytes".to_string());
            };
        }
        ConversionOp::Bytes2Str => {
            let s = pop_string_arg(p);
            args.enc = if s.eq_ignore_ascii_case("utf-8") {
                Enc::Utf8
            } else if s.eq_ignore_ascii_case("latin-1") {
                Enc::Latin1
            } else if s.eq_ignore_ascii_case("array-literal") {
                Enc::ArrayLiteral
            } else if s.eq_ignore_ascii_case("hex") {
                Enc::Hex
            } else {
                return Err("unknown encoding for conversion of bytes to string".to_string());
            };
        }
        ConversionOp::Str2Array => {
            let s = pop_string_arg(p);
            if !s.eq_ignore_ascii_case("unicode") {
                return Err("unknown encoding converting from string to array".to_string());
            }
            args.enc = Enc::Unicode;
        }
        ConversionOp::Array2Str => {
            let s = pop_string_arg(p);
            args.enc = if s.eq_ignore_ascii_case("unicode") {
                Enc::Unicode
            } else if s.is_empty() {
                Enc::Empty
            } else {
                return Err(
                    "unknown encoding converting to string from compound value".to_string()
                );
            };
        }
        ConversionOp::Map2Str | ConversionOp::Tuple2Str => {
            let _ = pop_string_arg(p);
            args.enc = Enc::Empty;
        }
        ConversionOp::Int2Bytes
        | ConversionOp::Uint2Bytes
        | ConversionOp::Bytes2Int
        | ConversionOp::Bytes2Uint => {
            let s = pop_string_arg(p);
            parse_packing(&mut args, &s, attributes(op).description)?;
        }
        ConversionOp::Str2Time | ConversionOp::Time2Str => {
            args.tz = pop_string_arg(p);
        }
        _ => {}
    }
    Ok(args)
}

fn make_cx<'a>(p: &'a mut Process, args: CvtArgs) -> ConvCx<'a> {
    let strict = p.config.strict_proto;
    ConvCx {
        heap: &mut p.heap,
        args,
        strict_proto: strict,
        proto_read: &mut p.proto_bytes_read,
        proto_skipped: &mut p.proto_bytes_skipped,
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Scalar conversion: pop the value and the op's extra arguments, push
/// the result.
pub fn convert_basic(p: &mut Process, op_byte: u8, type_: Option<TypeRef>) -> Result<(), String> {
    let op = decode_op(op_byte)?;
    let v = p.pop();
    let args = match get_extra_args(p, op, type_) {
        Ok(a) => a,
        Err(e) => {
            v.dec_ref();
            return Err(e);
        }
    };
    if v.is_null() {
        return Err("undefined value in conversion".to_string());
    }
    let mut cx = make_cx(p, args);
    let result = (attributes(op).func)(&mut cx, v);
    v.dec_ref();
    p.push(result?);
    Ok(())
}

/// Array-to-array conversion: extra arguments once, then the element
/// function applied slot by slot. On the first failure the remaining
/// result slots stay null (a consistent array for the sweeper) and the
/// error propagates.
pub fn convert_array(p: &mut Process, op_byte: u8, type_: Option<TypeRef>) -> Result<(), String> {
    let op = decode_op(op_byte)?;
    let attrs = attributes(op);
    if !attrs.array_to_array {
        return Err(format!(
            "{} not supported as an array conversion",
            attrs.description
        ));
    }
    let src = p.pop();
    // For the type-carrying ops the operand is the result array type; its
    // element type is the per-element conversion target.
    let (result_type, elem_type) = if takes_type_operand(op) {
        match type_ {
            Some(t) if t.is_array() => (t, Some(t.as_array().elem)),
            _ => {
                src.dec_ref();
                return Err(format!("{} requires a result array type", attrs.description));
            }
        }
    } else {
        ((attrs.result_array)(universe()), None)
    };
    let args = match get_extra_args(p, op, elem_type) {
        Ok(a) => a,
        Err(e) => {
            src.dec_ref();
            return Err(e);
        }
    };
    if src.is_null() {
        return Err("undefined array".to_string());
    }
    let n = val::array_length(src);
    let mut cx = make_cx(p, args);
    let out = val::new_array(cx.heap, result_type, n);
    // The first failure is remembered, not returned: every remaining slot
    // is still filled (with null) so the sweeper sees a consistent array.
    let mut error: Option<String> = None;
    for i in 0..n {
        let e = val::array_at(src, i);
        let r = if error.is_some() {
            Ok(Val::NULL)
        } else if e.is_null() {
            Err("undefined array element".to_string())
        } else {
            (attrs.func)(&mut cx, e)
        };
        match r {
            Ok(x) => val::array_put(out, i, x),
            Err(msg) => {
                val::array_put(out, i, Val::NULL);
                error = Some(msg);
            }
        }
    }
    src.dec_ref();
    if let Some(msg) = error {
        out.dec_ref();
        return Err(msg);
    }
    p.push(out);
    Ok(())
}

/// Array-to-map conversion: the source array is key, value, key, value…
/// with per-side conversions using defaulted extra arguments.
pub fn convert_array_to_map(
    p: &mut Process,
    map_type: TypeRef,
    key_op_byte: u8,
    value_op_byte: u8,
) -> Result<(), String> {
    let key_op = decode_op(key_op_byte)?;
    let value_op = decode_op(value_op_byte)?;
    for op in [key_op, value_op] {
        if !attributes(op).array_to_map {
            return Err(format!(
                "{} not supported in a map conversion",
                attributes(op).description
            ));
        }
    }
    let src = p.pop();
    if src.is_null() {
        return Err("undefined array".to_string());
    }
    let n = val::array_length(src);
    if n % 2 != 0 {
        src.dec_ref();
        return Err("map conversion requires an array of even length".to_string());
    }
    fn convert_side(cx: &mut ConvCx, op: ConversionOp, e: Val) -> Result<Val, String> {
        if e.is_null() {
            return Err("undefined array element".to_string());
        }
        cx.args = CvtArgs::defaults(op, None);
        (attributes(op).func)(cx, e)
    }

    let mut cx = make_cx(p, CvtArgs::defaults(key_op, None));
    let out = val::new_map(cx.heap, map_type, n / 2);
    for i in 0..n / 2 {
        let k = match convert_side(&mut cx, key_op, val::array_at(src, 2 * i)) {
            Ok(k) => k,
            Err(msg) => {
                out.dec_ref();
                src.dec_ref();
                return Err(msg);
            }
        };
        let v = match convert_side(&mut cx, value_op, val::array_at(src, 2 * i + 1)) {
            Ok(v) => v,
            Err(msg) => {
                k.dec_ref();
                out.dec_ref();
                src.dec_ref();
                return Err(msg);
            }
        };
        let m = val::map_ref(out);
        let idx = m.insert_key(k);
        m.set_value(idx, v);
    }
    src.dec_ref();
    p.push(out);
    Ok(())
}

// =============================================================================
// Number parsing and packing helpers
// =============================================================================

fn split_base(s: &str, base: i64) -> (u32, &str, bool) {
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if base != 0 {
        return (base as u32, body, neg);
    }
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        (16, hex, neg)
    } else if body.len() > 1 && body.starts_with('0') {
        (8, &body[1..], neg)
    } else {
        (10, body, neg)
    }
}

fn parse_int(s: &str, base: i64) -> Result<i64, String> {
    let (radix, body, neg) = split_base(s.trim(), base);
    let mag = u64::from_str_radix(body, radix)
        .map_err(|_| format!("cannot convert string \"{s}\" to int"))?;
    let v = mag as i64;
    Ok(if neg { v.wrapping_neg() } else { v })
}

fn parse_uint(s: &str, base: i64) -> Result<u64, String> {
    let (radix, body, neg) = split_base(s.trim(), base);
    if neg {
        return Err(format!("cannot convert string \"{s}\" to uint"));
    }
    u64::from_str_radix(body, radix).map_err(|_| format!("cannot convert string \"{s}\" to uint"))
}

fn to_radix_string(mut mag: u64, radix: u32, neg: bool) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if mag == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while mag > 0 {
        buf.push(DIGITS[(mag % radix as u64) as usize]);
        mag /= radix as u64;
    }
    if neg {
        buf.push(b'-');
    }
    buf.reverse();
    String::from_utf8(buf).expect("ascii digits")
}

fn float_str(x: f64) -> String {
    if x.is_nan() {
        "nan".to_string()
    } else if x.is_infinite() {
        (if x > 0.0 { "inf" } else { "-inf" }).to_string()
    } else {
        format!("{x}")
    }
}

fn encode_varint(mut x: u64, out: &mut Vec<u8>) {
    loop {
        let b = (x & 0x7f) as u8;
        x >>= 7;
        if x == 0 {
            out.push(b);
            return;
        }
        out.push(b | 0x80);
    }
}

fn decode_varint(data: &[u8]) -> Result<(u64, usize), String> {
    let mut x = 0u64;
    for (i, &b) in data.iter().enumerate() {
        if i >= 10 {
            break;
        }
        x |= ((b & 0x7f) as u64) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((x, i + 1));
        }
    }
    Err("truncated varint".to_string())
}

fn zigzag_encode(x: i64) -> u64 {
    ((x << 1) ^ (x >> 63)) as u64
}

fn zigzag_decode(x: u64) -> i64 {
    ((x >> 1) as i64) ^ -((x & 1) as i64)
}

fn pack_int(args: &CvtArgs, bits: u64, signed: bool) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    if args.varint {
        let x = if args.zigzag {
            zigzag_encode(bits as i64)
        } else {
            bits
        };
        encode_varint(x, &mut out);
        return Ok(out);
    }
    match args.byte_size {
        8 => {
            out.resize(8, 0);
            if args.little {
                LittleEndian::write_u64(&mut out, bits);
            } else {
                BigEndian::write_u64(&mut out, bits);
            }
        }
        4 => {
            let in_range = if signed {
                i32::try_from(bits as i64).is_ok()
            } else {
                u32::try_from(bits).is_ok()
            };
            if !in_range {
                return Err("value out of range for fixed32 encoding".to_string());
            }
            out.resize(4, 0);
            if args.little {
                LittleEndian::write_u32(&mut out, bits as u32);
            } else {
                BigEndian::write_u32(&mut out, bits as u32);
            }
        }
        _ => unreachable!("packing size is 4 or 8"),
    }
    Ok(out)
}

fn unpack_int(args: &CvtArgs, data: &[u8], signed: bool) -> Result<u64, String> {
    if args.varint {
        let (x, n) = decode_varint(data)?;
        if n != data.len() {
            return Err("trailing bytes after varint".to_string());
        }
        return Ok(if args.zigzag {
            zigzag_decode(x) as u64
        } else {
            x
        });
    }
    if data.len() != args.byte_size {
        return Err(format!(
            "fixed{} decoding requires {} bytes, got {}",
            args.byte_size * 8,
            args.byte_size,
            data.len()
        ));
    }
    Ok(match (args.byte_size, args.little) {
        (8, true) => LittleEndian::read_u64(data),
        (8, false) => BigEndian::read_u64(data),
        (4, true) => {
            let x = LittleEndian::read_u32(data);
            if signed { x as i32 as i64 as u64 } else { x as u64 }
        }
        (4, false) => {
            let x = BigEndian::read_u32(data);
            if signed { x as i32 as i64 as u64 } else { x as u64 }
        }
        _ => unreachable!(),
    })
}

// =============================================================================
// The conversion functions
// =============================================================================

fn no_conv(_cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    v.inc_ref();
    Ok(v)
}

fn type_cast(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let t = cx.args.type_.ok_or("type cast requires a type")?;
    if t.is_basic64() && v.type_().is_basic64() {
        Ok(val::new_basic64(cx.heap, t, v.basic64()))
    } else {
        // Same-representation cast: the value is reused as-is.
        v.inc_ref();
        Ok(v)
    }
}

fn str2bool(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_bool(cx.heap, val::string_str(v) == "true"))
}

fn fpr2bytes(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_bytes_init(
        cx.heap,
        &v.as_fingerprint().to_be_bytes(),
    ))
}

fn str2bytes(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let s = val::string_str(v);
    let data: Vec<u8> = match cx.args.enc {
        Enc::Utf8 => s.as_bytes().to_vec(),
        Enc::Latin1 => {
            let mut out = Vec::with_capacity(s.chars().count());
            for c in s.chars() {
                let x = c as u32;
                if x > 0xff {
                    return Err(format!("rune {x} not representable in latin-1"));
                }
                out.push(x as u8);
            }
            out
        }
        Enc::Hex => hex::decode(s).map_err(|_| "invalid hex string".to_string())?,
        _ => return Err("unknown encoding for string to bytes".to_string()),
    };
    Ok(val::new_bytes_init(cx.heap, &data))
}

fn int2bytes(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let data = pack_int(&cx.args, v.as_int() as u64, true)?;
    Ok(val::new_bytes_init(cx.heap, &data))
}

fn uint2bytes(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let data = pack_int(&cx.args, v.as_uint(), false)?;
    Ok(val::new_bytes_init(cx.heap, &data))
}

fn str2fpr(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let x = parse_uint(val::string_str(v), cx.args.base)
        .map_err(|_| format!("cannot convert string {:?} to fingerprint", val::string_str(v)))?;
    Ok(val::new_fingerprint(cx.heap, x))
}

fn uint2fpr(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_fingerprint(cx.heap, v.as_uint()))
}

fn bytes2fpr(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let data = val::bytes_data(v);
    if data.len() != 8 {
        return Err(format!(
            "bytes to fingerprint conversion requires 8 bytes, got {}",
            data.len()
        ));
    }
    Ok(val::new_fingerprint(cx.heap, BigEndian::read_u64(data)))
}

fn int2float(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_float(cx.heap, v.as_int() as f64))
}

fn str2float(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let s = val::string_str(v);
    let x: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("cannot convert string {s:?} to float"))?;
    Ok(val::new_float(cx.heap, x))
}

fn uint2float(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_float(cx.heap, v.as_uint() as f64))
}

fn float2int(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_int(cx.heap, v.as_float() as i64))
}

fn str2int(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let x = parse_int(val::string_str(v), cx.args.base)?;
    Ok(val::new_int(cx.heap, x))
}

fn uint2int(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_int(cx.heap, v.as_uint() as i64))
}

fn bytes2int(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let x = unpack_int(&cx.args, val::bytes_data(v), true)?;
    Ok(val::new_int(cx.heap, x as i64))
}

fn bool2str(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_string(
        cx.heap,
        if v.as_bool() { "true" } else { "false" },
    ))
}

fn bytes2str(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let data = val::bytes_data(v);
    let s = match cx.args.enc {
        Enc::Utf8 => std::str::from_utf8(data)
            .map_err(|_| "invalid UTF-8 in bytes to string conversion".to_string())?
            .to_string(),
        Enc::Latin1 => data.iter().map(|&b| b as char).collect(),
        Enc::Hex => hex::encode(data),
        Enc::ArrayLiteral => {
            let mut s = String::from("{");
            for (i, b) in data.iter().enumerate() {
                if i > 0 {
                    s.push_str(", ");
                }
                s.push_str(&format!("0x{b:02x}"));
            }
            s.push('}');
            s
        }
        _ => return Err("unknown encoding for conversion of bytes to string".to_string()),
    };
    Ok(val::new_string(cx.heap, &s))
}

fn float2str(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_string(cx.heap, &float_str(v.as_float())))
}

fn int2str(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let x = v.as_int();
    let s = to_radix_string(x.unsigned_abs(), cx.args.base as u32, x < 0);
    Ok(val::new_string(cx.heap, &s))
}

fn time2str(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    // Civil-time rendering is an intrinsic concern; the core renders the
    // raw microsecond count.
    Ok(val::new_string(cx.heap, &v.as_time().to_string()))
}

fn uint2str(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let s = to_radix_string(v.as_uint(), cx.args.base as u32, false);
    Ok(val::new_string(cx.heap, &s))
}

fn fpr2str(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_string(
        cx.heap,
        &format!("0x{:016x}", v.as_fingerprint()),
    ))
}

/// Compound value to string: "unicode" turns an array of runes into a
/// string; the empty encoding pretty-prints through the value's form.
fn val2str(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    if cx.args.enc == Enc::Unicode
        && v.type_().is_array()
        && v.type_().as_array().elem.is_int()
    {
        let n = val::array_length(v);
        let mut s = String::with_capacity(n);
        for i in 0..n {
            let e = val::array_at(v, i);
            if e.is_null() {
                return Err("undefined array element".to_string());
            }
            let x = e.as_int();
            let c = char::from_u32(x as u32)
                .ok_or_else(|| format!("invalid unicode code point {x}"))?;
            s.push(c);
        }
        return Ok(val::new_string(cx.heap, &s));
    }
    Ok(val::new_string(cx.heap, &v.display_string()))
}

fn str2array(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let s = val::string_str(v).to_string();
    let u = universe();
    let n = s.chars().count();
    let out = val::new_array(cx.heap, u.array_of_int, n);
    for (i, c) in s.chars().enumerate() {
        let e = val::new_int(cx.heap, c as i64);
        val::array_put(out, i, e);
    }
    Ok(out)
}

fn str2time(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let s = val::string_str(v);
    let x: u64 = s
        .trim()
        .parse()
        .map_err(|_| format!("cannot convert string {s:?} to time"))?;
    Ok(val::new_time(cx.heap, x))
}

fn uint2time(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_time(cx.heap, v.as_uint()))
}

fn float2uint(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_uint(cx.heap, v.as_float() as u64))
}

fn bits2uint(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    Ok(val::new_uint(cx.heap, v.basic64()))
}

fn str2uint(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let x = parse_uint(val::string_str(v), cx.args.base)?;
    Ok(val::new_uint(cx.heap, x))
}

fn bytes2uint(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let x = unpack_int(&cx.args, val::bytes_data(v), false)?;
    Ok(val::new_uint(cx.heap, x))
}

fn bytes2proto(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let t = cx.args.type_.ok_or("proto conversion requires a type")?;
    let data = val::bytes_data(v).to_vec();
    let mut pcx = proto::ProtoCx {
        heap: cx.heap,
        read: cx.proto_read,
        skipped: cx.proto_skipped,
        strict: cx.strict_proto,
    };
    proto::read_tuple(&mut pcx, t, &data)
}

fn proto2bytes(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let t = cx.args.type_.ok_or("proto conversion requires a type")?;
    let data = proto::write_tuple(t, v)?;
    Ok(val::new_bytes_init(cx.heap, &data))
}

fn tuple2tuple(cx: &mut ConvCx, v: Val) -> Result<Val, String> {
    let t = cx.args.type_.ok_or("tuple conversion requires a type")?;
    let out = val::new_tuple(cx.heap, t, szl_core::InitMode::ClearInproto);
    let n = val::tuple_nslots(v).min(val::tuple_nslots(out));
    for i in 0..n {
        let e = val::tuple_slot_at(v, i);
        e.inc_ref();
        val::tuple_set_slot(out, i, e);
        if val::tuple_bit_at(v, i) {
            val::tuple_set_bit(out, i);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_enum_order() {
        for (i, a) in CONVERSION_TABLE.iter().enumerate() {
            assert_eq!(a.op as usize, i, "conversion table out of order at {i}");
        }
    }

    #[test]
    fn test_attribute_queries() {
        assert!(!conversion_can_fail(ConversionOp::Int2Float));
        assert!(conversion_can_fail(ConversionOp::Str2Int));
        assert!(implemented_array_to_array(ConversionOp::Str2Int));
        assert!(!implemented_array_to_array(ConversionOp::Str2Array));
        assert!(implemented_array_to_map(ConversionOp::Str2Bool));
        assert!(!implemented_array_to_map(ConversionOp::Bytes2Int));
    }

    #[test]
    fn test_parse_int_bases() {
        assert_eq!(parse_int("42", 0).unwrap(), 42);
        assert_eq!(parse_int("-42", 0).unwrap(), -42);
        assert_eq!(parse_int("0x2a", 0).unwrap(), 42);
        assert_eq!(parse_int("052", 0).unwrap(), 42);
        assert_eq!(parse_int("2a", 16).unwrap(), 42);
        assert_eq!(parse_int("101", 2).unwrap(), 5);
        assert!(parse_int("not-a-number", 0).is_err());
        assert!(parse_int("", 0).is_err());
    }

    #[test]
    fn test_parse_uint_rejects_sign() {
        assert_eq!(parse_uint("18446744073709551615", 0).unwrap(), u64::MAX);
        assert!(parse_uint("-1", 0).is_err());
    }

    #[test]
    fn test_radix_strings() {
        assert_eq!(to_radix_string(255, 16, false), "ff");
        assert_eq!(to_radix_string(255, 2, true), "-11111111");
        assert_eq!(to_radix_string(0, 10, false), "0");
    }

    #[test]
    fn test_zigzag() {
        for &x in &[0i64, -1, 1, -2, 2, i64::MAX, i64::MIN] {
            assert_eq!(zigzag_decode(zigzag_encode(x)), x);
        }
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
    }

    #[test]
    fn test_varint_roundtrip() {
        for &x in &[0u64, 1, 127, 128, 300, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(x, &mut buf);
            let (y, n) = decode_varint(&buf).unwrap();
            assert_eq!(x, y);
            assert_eq!(n, buf.len());
        }
        assert!(decode_varint(&[0x80]).is_err());
    }

    #[test]
    fn test_pack_fixed32_range() {
        let mut args = CvtArgs::defaults(ConversionOp::Int2Bytes, None);
        args.byte_size = 4;
        assert!(pack_int(&args, 1u64 << 40, true).is_err());
        assert_eq!(pack_int(&args, 0x01020304, true).unwrap(), vec![1, 2, 3, 4]);
        args.little = true;
        assert_eq!(pack_int(&args, 0x01020304, true).unwrap(), vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_unpack_sign_extension() {
        let mut args = CvtArgs::defaults(ConversionOp::Bytes2Int, None);
        args.byte_size = 4;
        let x = unpack_int(&args, &[0xff, 0xff, 0xff, 0xff], true).unwrap();
        assert_eq!(x as i64, -1);
        let y = unpack_int(&args, &[0xff, 0xff, 0xff, 0xff], false).unwrap();
        assert_eq!(y, u32::MAX as u64);
    }

    use crate::process::{Process, ProcessConfig};
    use crate::program::ProgramBuilder;
    use szl_core::Type;

    fn process_for_tests(program: &crate::program::Program) -> Process<'_> {
        Process::new(program, ProcessConfig::default())
    }

    fn empty_program() -> crate::program::Program {
        let mut b = ProgramBuilder::new();
        b.function("main", 0, 0, 0);
        b.finish()
    }

    #[test]
    fn test_basic_conversion_dispatch() {
        let program = empty_program();
        let mut p = process_for_tests(&program);

        // int -> float is marked cannot-fail.
        p.push(Val::from_smi(7));
        convert_basic(&mut p, ConversionOp::Int2Float as u8, None).unwrap();
        assert_eq!(p.pop_float(), 7.0);

        // string -> int consumes the base argument below the value.
        let s = val::new_string(p.heap(), "2a");
        p.push(Val::from_smi(16));
        p.push(s);
        convert_basic(&mut p, ConversionOp::Str2Int as u8, None).unwrap();
        assert_eq!(p.pop_int(), 42);

        // A bad base is rejected before the conversion runs.
        let s = val::new_string(p.heap(), "1");
        p.push(Val::from_smi(99));
        p.push(s);
        let err = convert_basic(&mut p, ConversionOp::Str2Int as u8, None).unwrap_err();
        assert_eq!(err, "illegal base");

        // fingerprint -> string formats 16 hex digits.
        let f = val::new_fingerprint(p.heap(), 0xabc);
        p.push(f);
        convert_basic(&mut p, ConversionOp::Fpr2Str as u8, None).unwrap();
        let out = p.pop();
        assert_eq!(val::string_str(out), "0x0000000000000abc");
        out.dec_ref();
    }

    #[test]
    fn test_array_conversion_element_wise() {
        let program = empty_program();
        let mut p = process_for_tests(&program);
        let u = universe();

        let a = val::new_array(p.heap(), u.array_of_int, 3);
        for (i, x) in [10i64, 11, 12].into_iter().enumerate() {
            val::array_put(a, i, Val::from_smi(x));
        }
        p.push(Val::from_smi(10)); // int2str base
        p.push(a);
        convert_array(&mut p, ConversionOp::Int2Str as u8, None).unwrap();
        let out = p.pop();
        assert!(std::ptr::eq(out.type_(), u.array_of_string));
        let got: Vec<String> = (0..3)
            .map(|i| val::string_str(val::array_at(out, i)).to_string())
            .collect();
        assert_eq!(got, vec!["10", "11", "12"]);
        out.dec_ref();
    }

    #[test]
    fn test_array_conversion_failure_fills_and_reports() {
        let program = empty_program();
        let mut p = process_for_tests(&program);
        let u = universe();

        // The middle element fails; the conversion still visits every
        // slot and reports the error with nothing pushed.
        let a = val::new_array(p.heap(), u.array_of_string, 3);
        let texts = ["1", "nope", "3"];
        for (i, t) in texts.iter().enumerate() {
            let s = val::new_string(p.heap(), t);
            val::array_put(a, i, s);
        }
        let depth = p.expr_depth();
        p.push(Val::from_smi(10)); // str2int base
        p.push(a);
        let err = convert_array(&mut p, ConversionOp::Str2Int as u8, None).unwrap_err();
        assert!(err.contains("nope"), "{err}");
        assert_eq!(p.expr_depth(), depth, "no result is pushed on failure");
    }

    #[test]
    fn test_array_to_map_conversion() {
        let program = empty_program();
        let mut p = process_for_tests(&program);
        let u = universe();
        let mt = Type::map(u.int_type, u.int_type);

        let a = val::new_array(p.heap(), u.array_of_int, 4);
        for (i, x) in [1i64, 10, 2, 20].into_iter().enumerate() {
            val::array_put(a, i, Val::from_smi(x));
        }
        p.push(a);
        convert_array_to_map(
            &mut p,
            mt,
            ConversionOp::Noconv as u8,
            ConversionOp::Noconv as u8,
        )
        .unwrap();
        let out = p.pop();
        let m = val::map_ref(out);
        assert_eq!(m.occupancy(), 2);
        let i = m.lookup(Val::from_smi(2));
        assert!(i >= 0);
        assert_eq!(m.fetch(i).as_int(), 20);
        out.dec_ref();

        // Odd-length arrays are rejected.
        let a = val::new_array(p.heap(), u.array_of_int, 3);
        for i in 0..3 {
            val::array_put(a, i, Val::from_smi(i as i64));
        }
        p.push(a);
        let err = convert_array_to_map(
            &mut p,
            mt,
            ConversionOp::Noconv as u8,
            ConversionOp::Noconv as u8,
        )
        .unwrap_err();
        assert!(err.contains("even length"), "{err}");
    }
}
