//! Output Tables
//!
//! The emit instruction forwards typed values to the external aggregation
//! layer through the narrow `Emitter` interface: scalar puts bracketed by
//! begin/end groups, plus two shortcuts for scalar single-element tables.
//!
//! Two table flavors bypass the emitter: `file` appends rendered values
//! to a file named by the index expression, `proc` pipes them to a shell
//! command. Descriptors are opened lazily and cached per rendered name;
//! both flavors are denied in restricted mode.

use std::collections::HashMap;
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use tracing::debug;

use szl_core::types::TypeKind;
use szl_core::{TypeRef, Val, val};

use crate::process::Process;
use crate::program::{OutputTable, TableKind};

/// Structural bracketing kinds passed to `begin`/`end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Emit,
    Index,
    Element,
    Tuple,
    Array,
    Map,
    Weight,
}

/// The interface the aggregation backend implements. One emitter serves
/// one output table.
pub trait Emitter {
    fn begin(&mut self, kind: GroupKind, n: usize);
    fn end(&mut self, kind: GroupKind, n: usize);
    fn put_bool(&mut self, b: bool);
    fn put_int(&mut self, i: i64);
    fn put_float(&mut self, f: f64);
    fn put_fingerprint(&mut self, fp: u64);
    fn put_time(&mut self, t: u64);
    fn put_string(&mut self, s: &str);
    fn put_bytes(&mut self, b: &[u8]);

    /// Shortcut for scalar int tables without indices or weights.
    fn emit_int(&mut self, i: i64) {
        self.begin(GroupKind::Emit, 1);
        self.put_int(i);
        self.end(GroupKind::Emit, 1);
    }

    /// Shortcut for scalar float tables without indices or weights.
    fn emit_float(&mut self, f: f64) {
        self.begin(GroupKind::Emit, 1);
        self.put_float(f);
        self.end(GroupKind::Emit, 1);
    }
}

/// An emitter that records every call as a line of text. Useful in tests
/// and for debugging table plumbing; the shared handle stays readable
/// after the emitter moves into the process.
#[derive(Default)]
pub struct RecordingEmitter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl RecordingEmitter {
    pub fn new() -> (RecordingEmitter, Arc<Mutex<Vec<String>>>) {
        let em = RecordingEmitter::default();
        let handle = em.events.clone();
        (em, handle)
    }

    fn log(&self, s: String) {
        self.events.lock().expect("emitter events lock").push(s);
    }
}

impl Emitter for RecordingEmitter {
    fn begin(&mut self, kind: GroupKind, n: usize) {
        self.log(format!("begin {kind:?} {n}"));
    }
    fn end(&mut self, kind: GroupKind, n: usize) {
        self.log(format!("end {kind:?} {n}"));
    }
    fn put_bool(&mut self, b: bool) {
        self.log(format!("bool {b}"));
    }
    fn put_int(&mut self, i: i64) {
        self.log(format!("int {i}"));
    }
    fn put_float(&mut self, f: f64) {
        self.log(format!("float {f}"));
    }
    fn put_fingerprint(&mut self, fp: u64) {
        self.log(format!("fingerprint 0x{fp:016x}"));
    }
    fn put_time(&mut self, t: u64) {
        self.log(format!("time {t}"));
    }
    fn put_string(&mut self, s: &str) {
        self.log(format!("string {s}"));
    }
    fn put_bytes(&mut self, b: &[u8]) {
        self.log(format!("bytes {}", hex::encode(b)));
    }
    fn emit_int(&mut self, i: i64) {
        self.log(format!("emit_int {i}"));
    }
    fn emit_float(&mut self, f: f64) {
        self.log(format!("emit_float {f}"));
    }
}

/// Per-table runtime state: the cache of open file/proc descriptors,
/// keyed by rendered name.
pub struct OutputState {
    files: HashMap<String, std::fs::File>,
    procs: HashMap<String, Child>,
}

impl OutputState {
    pub(crate) fn new(_table: &OutputTable) -> OutputState {
        OutputState {
            files: HashMap::new(),
            procs: HashMap::new(),
        }
    }
}

impl Drop for OutputState {
    fn drop(&mut self) {
        // Close each child's stdin and collect it, so piped commands see
        // EOF and finish before the process is torn down.
        for (_, mut child) in self.procs.drain() {
            drop(child.stdin.take());
            let _ = child.wait();
        }
    }
}

/// Execute one emit against table `table`. Stack protocol (pushed in this
/// order by the compiler): index values in declaration order, the
/// element, then the weight when the table is weighted.
pub fn emit(p: &mut Process, table: u16) -> Result<(), String> {
    let descr = &p.program().tables[table as usize];
    let ti = table as usize;

    let weight = descr.weight_type.map(|_| p.pop());
    let elem = p.pop();
    let mut indices = Vec::with_capacity(descr.index_types.len());
    for _ in 0..descr.index_types.len() {
        indices.push(p.pop());
    }
    indices.reverse();

    let release = |indices: &[Val], elem: Val, weight: Option<Val>| {
        for v in indices {
            v.dec_ref();
        }
        elem.dec_ref();
        if let Some(w) = weight {
            w.dec_ref();
        }
    };

    if elem.is_null()
        || indices.iter().any(|v| v.is_null())
        || weight.is_some_and(|w| w.is_null())
    {
        release(&indices, elem, weight);
        return Err(format!("undefined value in emit to {}", descr.name));
    }

    let result = match descr.kind {
        TableKind::File => emit_file(p, ti, &indices, elem, false),
        TableKind::Proc => emit_file(p, ti, &indices, elem, true),
        _ => emit_values(p, ti, &indices, elem, weight),
    };
    release(&indices, elem, weight);
    result
}

/// Render the element for the file/proc flavors: strings and bytes pass
/// through raw, everything else formats through its form.
fn rendered(elem: Val) -> Vec<u8> {
    let t = elem.type_();
    if t.is_string() {
        val::string_data(elem).to_vec()
    } else if t.is_bytes() {
        val::bytes_data(elem).to_vec()
    } else {
        let mut s = elem.display_string();
        s.push('\n');
        s.into_bytes()
    }
}

fn emit_file(
    p: &mut Process,
    ti: usize,
    indices: &[Val],
    elem: Val,
    is_proc: bool,
) -> Result<(), String> {
    let what = if is_proc { "proc" } else { "file" };
    if p.config.restrict_io {
        return Err(format!("{what} output denied in restricted mode"));
    }
    if indices.len() != 1 || !indices[0].type_().is_string() {
        return Err(format!("{what} table requires a single string index"));
    }
    let name = val::string_str(indices[0]).to_string();
    let data = rendered(elem);
    let state = &mut p.outputs[ti];
    if is_proc {
        if !state.procs.contains_key(&name) {
            debug!(command = %name, "starting proc output");
            let child = Command::new("/bin/sh")
                .arg("-c")
                .arg(&name)
                .stdin(Stdio::piped())
                .spawn()
                .map_err(|e| format!("cannot start \"{name}\": {e}"))?;
            state.procs.insert(name.clone(), child);
        }
        let child = state.procs.get_mut(&name).expect("proc just inserted");
        child
            .stdin
            .as_mut()
            .ok_or_else(|| format!("no stdin for \"{name}\""))?
            .write_all(&data)
            .map_err(|e| format!("write to \"{name}\" failed: {e}"))
    } else {
        if !state.files.contains_key(&name) {
            debug!(file = %name, "opening file output");
            let f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&name)
                .map_err(|e| format!("cannot open \"{name}\": {e}"))?;
            state.files.insert(name.clone(), f);
        }
        let f = state.files.get_mut(&name).expect("file just inserted");
        f.write_all(&data)
            .map_err(|e| format!("write to \"{name}\" failed: {e}"))
    }
}

fn emit_values(
    p: &mut Process,
    ti: usize,
    indices: &[Val],
    elem: Val,
    weight: Option<Val>,
) -> Result<(), String> {
    let descr = &p.program().tables[ti];
    if p.emitters[ti].is_none() {
        return Err(format!(
            "no emitter installed for table {}; outputs ignored",
            descr.name
        ));
    }
    let em = p.emitters[ti].as_mut().expect("emitter present").as_mut();

    // Scalar single-element tables take the shortcut.
    if indices.is_empty() && weight.is_none() {
        match descr.elem_type.kind() {
            TypeKind::Int => {
                em.emit_int(elem.as_int());
                return Ok(());
            }
            TypeKind::Float => {
                em.emit_float(elem.as_float());
                return Ok(());
            }
            _ => {}
        }
    }

    let total = 1 + indices.len() + weight.is_some() as usize;
    em.begin(GroupKind::Emit, total);
    for (i, &idx) in indices.iter().enumerate() {
        em.begin(GroupKind::Index, 1);
        put_value(em, descr.index_types[i], idx)?;
        em.end(GroupKind::Index, 1);
    }
    em.begin(GroupKind::Element, 1);
    put_value(em, descr.elem_type, elem)?;
    em.end(GroupKind::Element, 1);
    if let Some(w) = weight {
        em.begin(GroupKind::Weight, 1);
        put_value(em, descr.weight_type.expect("weighted table"), w)?;
        em.end(GroupKind::Weight, 1);
    }
    em.end(GroupKind::Emit, total);
    Ok(())
}

/// Walk one value against its type, driving the emitter puts.
fn put_value(em: &mut dyn Emitter, t: TypeRef, v: Val) -> Result<(), String> {
    if v.is_null() {
        return Err("undefined value in emit".to_string());
    }
    match t.kind() {
        TypeKind::Bool => em.put_bool(v.as_bool()),
        TypeKind::Int => em.put_int(v.as_int()),
        TypeKind::UInt => em.put_int(v.as_uint() as i64),
        TypeKind::Float => em.put_float(v.as_float()),
        TypeKind::Fingerprint => em.put_fingerprint(v.as_fingerprint()),
        TypeKind::Time => em.put_time(v.as_time()),
        TypeKind::String => em.put_string(val::string_str(v)),
        TypeKind::Bytes => em.put_bytes(val::bytes_data(v)),
        TypeKind::Tuple(tt) => {
            let n = tt.nslots as usize;
            em.begin(GroupKind::Tuple, n);
            for field in &tt.fields {
                if let Some(slot) = field.slot {
                    put_value(em, field.type_, val::tuple_slot_at(v, slot as usize))?;
                }
            }
            em.end(GroupKind::Tuple, n);
        }
        TypeKind::Array(a) => {
            let n = val::array_length(v);
            em.begin(GroupKind::Array, n);
            for i in 0..n {
                put_value(em, a.elem, val::array_at(v, i))?;
            }
            em.end(GroupKind::Array, n);
        }
        TypeKind::Map(mt) => {
            let m = val::map_ref(v);
            let n = m.occupancy();
            em.begin(GroupKind::Map, 2 * n);
            for i in 0..n {
                put_value(em, mt.key, m.get_key_by_index(i as i32))?;
                put_value(em, mt.value, m.get_value_by_index(i as i32))?;
            }
            em.end(GroupKind::Map, 2 * n);
        }
        TypeKind::Function(_) => {
            return Err("cannot emit a function value".to_string());
        }
    }
    Ok(())
}
