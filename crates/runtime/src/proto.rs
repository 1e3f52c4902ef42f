//! Protocol Buffer Codec
//!
//! Wire-format reads and writes directly against typed tuple values.
//! Decoding drives the tuple type's tag→field map, writes each decoded
//! field into its slot, sets the field's in-proto bit, and finally fills
//! the unread fields with defaults: a plain slot copy from the type's
//! pre-built read-only default tuple when one exists, recursive default
//! construction otherwise.
//!
//! Tuples marked `is_message` frame nested tuples length-delimited;
//! others use the group encoding (start/end tags). Unknown and unreferenced
//! fields are skipped, and the skipped bytes (tag included) accumulate in
//! the process telemetry.

use byteorder::{ByteOrder, LittleEndian};

use szl_core::types::{Field, ProtoEncoding, TypeKind};
use szl_core::{Heap, InitMode, TypeRef, Val, universe, val};

// Wire types.
const WT_VARINT: u32 = 0;
const WT_FIXED64: u32 = 1;
const WT_LEN: u32 = 2;
const WT_START_GROUP: u32 = 3;
const WT_END_GROUP: u32 = 4;
const WT_FIXED32: u32 = 5;

pub struct ProtoCx<'a> {
    pub heap: &'a mut Heap,
    pub read: &'a mut u64,
    pub skipped: &'a mut u64,
    pub strict: bool,
}

// =============================================================================
// Wire reader
// =============================================================================

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn varint(&mut self) -> Result<u64, String> {
        let mut x = 0u64;
        for i in 0..10 {
            let b = *self
                .data
                .get(self.pos)
                .ok_or_else(|| "truncated varint".to_string())?;
            self.pos += 1;
            x |= ((b & 0x7f) as u64) << (7 * i);
            if b & 0x80 == 0 {
                return Ok(x);
            }
        }
        Err("varint too long".to_string())
    }

    /// Tag of the next field; 0 at end of input.
    fn read_tag(&mut self) -> Result<u32, String> {
        if self.at_end() {
            return Ok(0);
        }
        let t = self.varint()?;
        if t == 0 || t > u32::MAX as u64 {
            return Err("invalid field tag".to_string());
        }
        Ok(t as u32)
    }

    fn fixed32(&mut self) -> Result<u32, String> {
        if self.pos + 4 > self.data.len() {
            return Err("truncated fixed32".to_string());
        }
        let x = LittleEndian::read_u32(&self.data[self.pos..]);
        self.pos += 4;
        Ok(x)
    }

    fn fixed64(&mut self) -> Result<u64, String> {
        if self.pos + 8 > self.data.len() {
            return Err("truncated fixed64".to_string());
        }
        let x = LittleEndian::read_u64(&self.data[self.pos..]);
        self.pos += 8;
        Ok(x)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.data.len() {
            return Err("truncated length-delimited field".to_string());
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Skip one field's payload given its tag.
    fn skip_field(&mut self, tag: u32) -> Result<(), String> {
        match tag & 7 {
            WT_VARINT => {
                self.varint()?;
            }
            WT_FIXED64 => {
                self.fixed64()?;
            }
            WT_LEN => {
                let n = self.varint()? as usize;
                self.bytes(n)?;
            }
            WT_START_GROUP => loop {
                let t = self.read_tag()?;
                if t == 0 {
                    return Err("unterminated group while skipping".to_string());
                }
                if t & 7 == WT_END_GROUP {
                    break;
                }
                self.skip_field(t)?;
            },
            WT_FIXED32 => {
                self.fixed32()?;
            }
            _ => return Err(format!("bad wire type {}", tag & 7)),
        }
        Ok(())
    }
}

fn varint_size(mut x: u64) -> usize {
    let mut n = 1;
    while x >= 0x80 {
        x >>= 7;
        n += 1;
    }
    n
}

// =============================================================================
// Reading
// =============================================================================

/// Decode `data` into a new tuple of `tuple_type`. The whole input is
/// charged to the bytes-read counter; skipped fields additionally charge
/// the bytes-skipped counter.
pub fn read_tuple(cx: &mut ProtoCx, tuple_type: TypeRef, data: &[u8]) -> Result<Val, String> {
    if !tuple_type.is_tuple() || !tuple_type.as_tuple().is_proto {
        return Err("type is not a proto tuple".to_string());
    }
    *cx.read += data.len() as u64;
    let mut r = Reader::new(data);
    let (v, end_tag) = read_group(cx, &mut r, tuple_type)?;
    if end_tag != 0 {
        v.dec_ref();
        return Err("unexpected END_GROUP tag".to_string());
    }
    if !r.at_end() {
        v.dec_ref();
        return Err("trailing data after message".to_string());
    }
    Ok(v)
}

/// Read fields until end of input or an END_GROUP tag, which is returned
/// (0 for end of input).
fn read_group(cx: &mut ProtoCx, r: &mut Reader, tuple_type: TypeRef) -> Result<(Val, u32), String> {
    let tt = tuple_type.as_tuple();
    let v = val::new_tuple(cx.heap, tuple_type, InitMode::ClearInproto);
    // Defaults first: decoded fields overwrite them (releasing a read-only
    // default is a no-op), and whatever stays unread is already correct.
    if let Some(d) = tt.default_tuple() {
        val::tuple_copy_default_slots(v, d);
    }

    let mut tag = r.read_tag().inspect_err(|_| v.dec_ref())?;
    while tag != 0 {
        if tag & 7 == WT_END_GROUP {
            finish_defaults(cx, tuple_type, v).inspect_err(|_| v.dec_ref())?;
            return Ok((v, tag));
        }
        let id = tag >> 3;
        let step = match tt.field_for_tag(id) {
            Some(fi) => {
                let field = &tt.fields[fi];
                match field.slot {
                    Some(slot) => read_field(cx, r, field, slot as usize, v, tag),
                    // Declared but unreferenced: skip, with accounting.
                    None => skip_with_accounting(cx, r, tag).and_then(|_| r.read_tag()),
                }
            }
            None if id == 0 || cx.strict => Err(format!(
                "field for tag {id} not found (wrong input format or wrong proto file?)"
            )),
            // Unknown tag in permissive mode: skip, with accounting.
            None => skip_with_accounting(cx, r, tag).and_then(|_| r.read_tag()),
        };
        match step {
            Ok(next) => tag = next,
            Err(e) => {
                v.dec_ref();
                return Err(e);
            }
        }
    }
    finish_defaults(cx, tuple_type, v).inspect_err(|_| v.dec_ref())?;
    Ok((v, 0))
}

fn skip_with_accounting(cx: &mut ProtoCx, r: &mut Reader, tag: u32) -> Result<(), String> {
    let before = r.pos;
    r.skip_field(tag)
        .map_err(|e| format!("field for tag {} could not be skipped: {e}", tag >> 3))?;
    *cx.skipped += (varint_size(tag as u64) + r.pos - before) as u64;
    Ok(())
}

/// Decode one field occurrence into its slot and set the in-proto bit.
/// Returns the next tag (already read, as array decoding must look
/// ahead).
fn read_field(
    cx: &mut ProtoCx,
    r: &mut Reader,
    field: &Field,
    slot: usize,
    tuple: Val,
    tag: u32,
) -> Result<u32, String> {
    let append = val::tuple_bit_at(tuple, slot);
    let mut tag = tag;
    let x = read_item(cx, r, field.type_, field.encoding, &mut tag, {
        if append {
            Some(val::tuple_slot_at(tuple, slot))
        } else {
            None
        }
    })
    .map_err(|e| format!("reading proto field {} failed ({e})", field.name))?;
    if append && field.type_.is_array() {
        // read_item consumed the old slot value.
        val::tuple_set_slot_raw(tuple, slot, x);
    } else {
        val::tuple_set_slot(tuple, slot, x);
    }
    val::tuple_set_bit(tuple, slot);
    Ok(tag)
}

/// Decode one wire value of `t`. On entry the field's tag is in `*tag`;
/// on exit the following tag has been read into `*tag` (0 at end).
///
/// `append` carries the existing array value when a repeated field shows
/// up again later in the message; its reference is consumed.
fn read_item(
    cx: &mut ProtoCx,
    r: &mut Reader,
    t: TypeRef,
    encoding: ProtoEncoding,
    tag: &mut u32,
    append: Option<Val>,
) -> Result<Val, String> {
    if append.is_some() && !t.is_array() {
        return Err("duplicate tag".to_string());
    }
    let wire = *tag & 7;
    match t.kind() {
        TypeKind::Int
        | TypeKind::UInt
        | TypeKind::Bool
        | TypeKind::Fingerprint
        | TypeKind::Time => {
            let bits = match wire {
                WT_VARINT => {
                    let x = r.varint()?;
                    if encoding == ProtoEncoding::ZigZag {
                        (((x >> 1) as i64) ^ -((x & 1) as i64)) as u64
                    } else {
                        x
                    }
                }
                WT_FIXED32 => r.fixed32()? as u64,
                WT_FIXED64 => r.fixed64()?,
                _ => return Err("field type is numeric but data type is not".to_string()),
            };
            let v = match t.kind() {
                TypeKind::Bool => val::new_bool(cx.heap, bits != 0),
                TypeKind::Int => val::new_int(cx.heap, bits as i64),
                _ => val::new_basic64(cx.heap, t, bits),
            };
            *tag = r.read_tag()?;
            Ok(v)
        }

        TypeKind::Float => {
            let x = match wire {
                WT_FIXED32 => f32::from_bits(r.fixed32()?) as f64,
                WT_FIXED64 => f64::from_bits(r.fixed64()?),
                _ => {
                    return Err(
                        "field type is floating-point but data type does not match".to_string()
                    );
                }
            };
            let v = val::new_float(cx.heap, x);
            *tag = r.read_tag()?;
            Ok(v)
        }

        TypeKind::Bytes => {
            if wire != WT_LEN {
                return Err("field type is 'bytes' but data type is not length-delimited".into());
            }
            let n = r.varint()? as usize;
            let data = r.bytes(n)?;
            let v = val::new_bytes_init(cx.heap, data);
            *tag = r.read_tag()?;
            Ok(v)
        }

        TypeKind::String => {
            if wire != WT_LEN {
                return Err("field type is 'string' but data type is not length-delimited".into());
            }
            let n = r.varint()? as usize;
            let data = r.bytes(n)?;
            let s = std::str::from_utf8(data).map_err(|_| "invalid UTF-8 in string field")?;
            let v = val::new_string(cx.heap, s);
            *tag = r.read_tag()?;
            Ok(v)
        }

        TypeKind::Array(a) => {
            // Accumulate successive occurrences of this tag. Elements of
            // one field may arrive under differing wire types; only the
            // field id delimits the run.
            let id = *tag >> 3;
            let mut elements: Vec<Val> = Vec::new();
            loop {
                let e = read_item(cx, r, a.elem, encoding, tag, None).inspect_err(|_| {
                    for e in &elements {
                        e.dec_ref();
                    }
                })?;
                elements.push(e);
                if *tag >> 3 != id {
                    break;
                }
            }
            let prefix_len = append.map_or(0, val::array_length);
            let v = val::new_array(cx.heap, t, prefix_len + elements.len());
            if let Some(prev) = append {
                // The rare case: earlier elements of this field appeared
                // before an interleaved field. Transfer them over.
                for i in 0..prefix_len {
                    let e = val::array_at(prev, i);
                    e.inc_ref();
                    val::array_put(v, i, e);
                }
                prev.dec_ref();
            }
            for (i, e) in elements.into_iter().enumerate() {
                val::array_put(v, prefix_len + i, e);
            }
            Ok(v)
        }

        TypeKind::Tuple(nested) => {
            if !nested.is_proto {
                return Err("nested tuple is not a proto type".to_string());
            }
            match wire {
                WT_LEN => {
                    let n = r.varint()? as usize;
                    let data = r.bytes(n)?;
                    let mut sub = Reader::new(data);
                    let (v, end_tag) = read_group(cx, &mut sub, t)?;
                    if end_tag != 0 || !sub.at_end() {
                        v.dec_ref();
                        return Err("unexpected END_GROUP or invalid tag found".to_string());
                    }
                    *tag = r.read_tag()?;
                    Ok(v)
                }
                WT_START_GROUP => {
                    let (v, end_tag) = read_group(cx, r, t)?;
                    if end_tag == 0 {
                        v.dec_ref();
                        return Err("END_GROUP tag is missing".to_string());
                    }
                    *tag = r.read_tag()?;
                    Ok(v)
                }
                _ => Err("field type is 'tuple' but data type is not a group".to_string()),
            }
        }

        _ => Err(format!("cannot decode a proto field of type {}", t.name())),
    }
}

/// Fill the unread referenced fields with type defaults. With a pre-built
/// default tuple the slots were copied up front and nothing remains to
/// do.
fn finish_defaults(cx: &mut ProtoCx, tuple_type: TypeRef, v: Val) -> Result<(), String> {
    let tt = tuple_type.as_tuple();
    if tt.default_tuple().is_some() {
        return Ok(());
    }
    for field in &tt.fields {
        if let Some(slot) = field.slot {
            if !val::tuple_bit_at(v, slot as usize) && val::tuple_slot_at(v, slot as usize).is_null()
            {
                let d = default_item(cx.heap, field.type_)?;
                val::tuple_set_slot(v, slot as usize, d);
            }
        }
    }
    Ok(())
}

/// Runtime default for one field type (heap-allocated; the read-only
/// path is the pre-built default tuple).
fn default_item(heap: &mut Heap, t: TypeRef) -> Result<Val, String> {
    let u = universe();
    Ok(match t.kind() {
        TypeKind::Bool => u.false_val,
        TypeKind::Int => Val::from_smi(0),
        TypeKind::UInt => val::new_uint(heap, 0),
        TypeKind::Float => val::new_float(heap, 0.0),
        TypeKind::Time => val::new_time(heap, 0),
        TypeKind::Fingerprint => val::new_fingerprint(heap, 0),
        TypeKind::String => u.empty_string,
        TypeKind::Bytes => val::new_bytes(heap, 0),
        TypeKind::Array(_) => val::new_array(heap, t, 0),
        TypeKind::Map(_) => val::new_map(heap, t, 0),
        TypeKind::Tuple(tt) => match tt.default_tuple() {
            Some(d) => d,
            None => {
                let v = val::new_tuple(heap, t, InitMode::ClearInproto);
                for field in &tt.fields {
                    if let Some(slot) = field.slot {
                        let d = default_item(heap, field.type_)?;
                        val::tuple_set_slot(v, slot as usize, d);
                    }
                }
                v
            }
        },
        TypeKind::Function(_) => {
            return Err("function fields have no proto default".to_string());
        }
    })
}

// =============================================================================
// Writing
// =============================================================================

/// Encode `v` (a tuple of `tuple_type`) to the wire. Fields are written
/// in declaration order; only fields whose in-proto bit is set appear.
pub fn write_tuple(tuple_type: TypeRef, v: Val) -> Result<Vec<u8>, String> {
    if !tuple_type.is_tuple() || !tuple_type.as_tuple().is_proto {
        return Err("type is not a proto tuple".to_string());
    }
    if v.is_null() {
        return Err("undefined tuple".to_string());
    }
    let mut out = Vec::new();
    write_fields(tuple_type, v, &mut out)?;
    Ok(out)
}

fn write_fields(tuple_type: TypeRef, v: Val, out: &mut Vec<u8>) -> Result<(), String> {
    let tt = tuple_type.as_tuple();
    for field in &tt.fields {
        let (Some(slot), Some(tag)) = (field.slot, field.tag) else {
            continue;
        };
        if !val::tuple_bit_at(v, slot as usize) {
            continue;
        }
        let x = val::tuple_slot_at(v, slot as usize);
        if x.is_null() {
            return Err(format!("undefined value in proto field {}", field.name));
        }
        write_item(field.type_, field.encoding, tag, x, out)?;
    }
    Ok(())
}

fn put_varint(mut x: u64, out: &mut Vec<u8>) {
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

fn put_tag(id: u32, wire: u32, out: &mut Vec<u8>) {
    put_varint(((id << 3) | wire) as u64, out);
}

fn write_item(
    t: TypeRef,
    encoding: ProtoEncoding,
    tag: u32,
    x: Val,
    out: &mut Vec<u8>,
) -> Result<(), String> {
    match t.kind() {
        TypeKind::Int
        | TypeKind::UInt
        | TypeKind::Bool
        | TypeKind::Fingerprint
        | TypeKind::Time => {
            let bits = x.basic64();
            match encoding {
                ProtoEncoding::Fixed32 => {
                    put_tag(tag, WT_FIXED32, out);
                    out.extend_from_slice(&(bits as u32).to_le_bytes());
                }
                ProtoEncoding::Fixed64 => {
                    put_tag(tag, WT_FIXED64, out);
                    out.extend_from_slice(&bits.to_le_bytes());
                }
                ProtoEncoding::ZigZag => {
                    put_tag(tag, WT_VARINT, out);
                    let z = ((bits as i64) << 1) ^ ((bits as i64) >> 63);
                    put_varint(z as u64, out);
                }
                _ => {
                    put_tag(tag, WT_VARINT, out);
                    put_varint(bits, out);
                }
            }
        }
        TypeKind::Float => match encoding {
            ProtoEncoding::Float32 | ProtoEncoding::Fixed32 => {
                put_tag(tag, WT_FIXED32, out);
                out.extend_from_slice(&(x.as_float() as f32).to_bits().to_le_bytes());
            }
            _ => {
                put_tag(tag, WT_FIXED64, out);
                out.extend_from_slice(&x.as_float().to_bits().to_le_bytes());
            }
        },
        TypeKind::Bytes => {
            put_tag(tag, WT_LEN, out);
            let data = val::bytes_data(x);
            put_varint(data.len() as u64, out);
            out.extend_from_slice(data);
        }
        TypeKind::String => {
            put_tag(tag, WT_LEN, out);
            let data = val::string_data(x);
            put_varint(data.len() as u64, out);
            out.extend_from_slice(data);
        }
        TypeKind::Array(a) => {
            for i in 0..val::array_length(x) {
                let e = val::array_at(x, i);
                if e.is_null() {
                    return Err("undefined array element in proto field".to_string());
                }
                write_item(a.elem, encoding, tag, e, out)?;
            }
        }
        TypeKind::Tuple(nested) => {
            if nested.is_message {
                let mut body = Vec::new();
                write_fields(t, x, &mut body)?;
                put_tag(tag, WT_LEN, out);
                put_varint(body.len() as u64, out);
                out.extend_from_slice(&body);
            } else {
                put_tag(tag, WT_START_GROUP, out);
                write_fields(t, x, out)?;
                put_tag(tag, WT_END_GROUP, out);
            }
        }
        _ => return Err(format!("cannot encode a proto field of type {}", t.name())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use szl_core::FieldSpec;
    use szl_core::Type;

    fn cx<'a>(heap: &'a mut Heap, read: &'a mut u64, skipped: &'a mut u64) -> ProtoCx<'a> {
        ProtoCx {
            heap,
            read,
            skipped,
            strict: false,
        }
    }

    fn simple_type() -> TypeRef {
        let u = universe();
        Type::tuple(
            vec![
                FieldSpec::new("n", u.int_type).with_tag(1),
                FieldSpec::new("s", u.string_type).with_tag(2),
            ],
            true,
            true,
        )
    }

    #[test]
    fn test_read_simple_message() {
        let mut heap = Heap::new(4096, 1 << 24);
        let (mut read, mut skipped) = (0u64, 0u64);
        let t = simple_type();
        // field 1 = varint 150, field 2 = "testing"
        let data = [
            0x08, 0x96, 0x01, 0x12, 0x07, b't', b'e', b's', b't', b'i', b'n', b'g',
        ];
        let mut c = cx(&mut heap, &mut read, &mut skipped);
        let v = read_tuple(&mut c, t, &data).unwrap();
        assert_eq!(val::tuple_slot_at(v, 0).as_int(), 150);
        assert_eq!(val::string_str(val::tuple_slot_at(v, 1)), "testing");
        assert!(val::tuple_bit_at(v, 0));
        assert!(val::tuple_bit_at(v, 1));
        assert_eq!(read, 12);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let mut heap = Heap::new(4096, 1 << 24);
        let (mut read, mut skipped) = (0u64, 0u64);
        let t = simple_type();
        let data = [0x08, 0x05]; // only field 1
        let mut c = cx(&mut heap, &mut read, &mut skipped);
        let v = read_tuple(&mut c, t, &data).unwrap();
        assert_eq!(val::tuple_slot_at(v, 0).as_int(), 5);
        assert!(val::tuple_bit_at(v, 0));
        // Field 2 defaulted: empty string, bit clear.
        assert!(!val::tuple_bit_at(v, 1));
        assert_eq!(val::string_str(val::tuple_slot_at(v, 1)), "");
    }

    #[test]
    fn test_skip_accounting() {
        let mut heap = Heap::new(4096, 1 << 24);
        let (mut read, mut skipped) = (0u64, 0u64);
        let u = universe();
        // Only field 1 is declared; fields 2 and 3 are unknown.
        let t = Type::tuple(
            vec![FieldSpec::new("a", u.bytes_type).with_tag(1)],
            true,
            true,
        );
        let data = hex::decode("0a030896011209120774657374696e671a051a03089601").unwrap();
        assert_eq!(data.len(), 23);
        let mut c = cx(&mut heap, &mut read, &mut skipped);
        let v = read_tuple(&mut c, t, &data).unwrap();
        assert!(val::tuple_bit_at(v, 0));
        assert_eq!(read, 23);
        assert_eq!(skipped, 18);
    }

    #[test]
    fn test_strict_mode_rejects_unknown_tags() {
        let mut heap = Heap::new(4096, 1 << 24);
        let (mut read, mut skipped) = (0u64, 0u64);
        let t = simple_type();
        let data = [0x18, 0x01]; // field 3: unknown
        let mut c = ProtoCx {
            heap: &mut heap,
            read: &mut read,
            skipped: &mut skipped,
            strict: true,
        };
        let err = read_tuple(&mut c, t, &data).unwrap_err();
        assert!(err.contains("not found"), "{err}");
    }

    #[test]
    fn test_truncated_input() {
        let mut heap = Heap::new(4096, 1 << 24);
        let (mut read, mut skipped) = (0u64, 0u64);
        let t = simple_type();
        let data = [0x12, 0x07, b'x']; // length 7 but one byte present
        let mut c = cx(&mut heap, &mut read, &mut skipped);
        assert!(read_tuple(&mut c, t, &data).is_err());
    }

    #[test]
    fn test_roundtrip_preserves_inproto_fields() {
        let mut heap = Heap::new(4096, 1 << 24);
        let (mut read, mut skipped) = (0u64, 0u64);
        let t = simple_type();
        let data = [
            0x08, 0x96, 0x01, 0x12, 0x07, b't', b'e', b's', b't', b'i', b'n', b'g',
        ];
        let mut c = cx(&mut heap, &mut read, &mut skipped);
        let v = read_tuple(&mut c, t, &data).unwrap();
        let encoded = write_tuple(t, v).unwrap();
        assert_eq!(encoded, data);
    }

    #[test]
    fn test_repeated_field_accumulates() {
        let mut heap = Heap::new(4096, 1 << 24);
        let (mut read, mut skipped) = (0u64, 0u64);
        let u = universe();
        let t = Type::tuple(
            vec![FieldSpec::new("xs", u.array_of_int).with_tag(1)],
            true,
            true,
        );
        let data = [0x08, 0x01, 0x08, 0x02, 0x08, 0x03];
        let mut c = cx(&mut heap, &mut read, &mut skipped);
        let v = read_tuple(&mut c, t, &data).unwrap();
        let a = val::tuple_slot_at(v, 0);
        assert_eq!(val::array_length(a), 3);
        for i in 0..3 {
            assert_eq!(val::array_at(a, i).as_int(), i as i64 + 1);
        }
    }

    #[test]
    fn test_interleaved_repeated_field_appends() {
        let mut heap = Heap::new(4096, 1 << 24);
        let (mut read, mut skipped) = (0u64, 0u64);
        let u = universe();
        let t = Type::tuple(
            vec![
                FieldSpec::new("xs", u.array_of_int).with_tag(1),
                FieldSpec::new("n", u.int_type).with_tag(2),
            ],
            true,
            true,
        );
        // xs: 1, 2; n: 9; xs: 3
        let data = [0x08, 0x01, 0x08, 0x02, 0x10, 0x09, 0x08, 0x03];
        let mut c = cx(&mut heap, &mut read, &mut skipped);
        let v = read_tuple(&mut c, t, &data).unwrap();
        let a = val::tuple_slot_at(v, 0);
        assert_eq!(val::array_length(a), 3);
        assert_eq!(val::array_at(a, 2).as_int(), 3);
        assert_eq!(val::tuple_slot_at(v, 1).as_int(), 9);
    }

    #[test]
    fn test_group_encoding_roundtrip() {
        let mut heap = Heap::new(4096, 1 << 24);
        let (mut read, mut skipped) = (0u64, 0u64);
        let u = universe();
        let inner = Type::tuple(
            vec![FieldSpec::new("n", u.int_type).with_tag(1)],
            true,
            false, // group framing
        );
        let outer = Type::tuple(
            vec![FieldSpec::new("g", inner).with_tag(2)],
            true,
            true,
        );
        // group 2 { field 1 = 7 }: START_GROUP(2) 0x13, varint field, END_GROUP(2) 0x14
        let data = [0x13, 0x08, 0x07, 0x14];
        let mut c = cx(&mut heap, &mut read, &mut skipped);
        let v = read_tuple(&mut c, outer, &data).unwrap();
        let g = val::tuple_slot_at(v, 0);
        assert_eq!(val::tuple_slot_at(g, 0).as_int(), 7);
        let encoded = write_tuple(outer, v).unwrap();
        assert_eq!(encoded, data);
    }
}
