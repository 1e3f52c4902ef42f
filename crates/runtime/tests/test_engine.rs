//! End-to-end interpreter tests: small programs assembled through the
//! CodeBuffer and executed record-at-a-time, observing results through a
//! recording emitter and the process counters.

use std::sync::{Arc, Mutex};

use szl_runtime::core::fingerprint::fingerprint_bytes;
use szl_runtime::core::{Type, universe, val};
use szl_runtime::{
    ConversionOp, Opcode, OutputTable, Process, ProcessConfig, Program, ProgramBuilder,
    RecordingEmitter, Status, TableKind,
};

fn int_collection(b: &mut ProgramBuilder, name: &str) -> u16 {
    let u = universe();
    b.table(OutputTable {
        name: name.to_string(),
        kind: TableKind::Collection,
        index_types: vec![],
        elem_type: u.int_type,
        weight_type: None,
        param: 0,
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn run_one(program: &Program) -> (Status, Process<'_>, Arc<Mutex<Vec<String>>>) {
    init_tracing();
    let mut p = Process::new(program, ProcessConfig::default());
    let (em, events) = RecordingEmitter::new();
    if !program.tables.is_empty() {
        p.install_emitter(0, Box::new(em));
    }
    let status = p.run_record(b"input", 1_000_000);
    (status, p, events)
}

fn events_of(handle: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    handle.lock().unwrap().clone()
}

#[test]
fn test_arithmetic_record() {
    let mut b = ProgramBuilder::new();
    let table = int_collection(&mut b, "stdout");
    b.code.emit_op(Opcode::Enter).emit_i32(0).emit_i32(64);
    b.code.emit_op(Opcode::Push8).emit_i8(2);
    b.code.emit_op(Opcode::Push8).emit_i8(3);
    b.code.emit_op(Opcode::AddInt);
    b.code.emit_op(Opcode::Emit).emit_u16(table);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 0);
    let program = b.finish();

    let (status, p, events) = run_one(&program);
    assert_eq!(status, Status::Completed);
    assert_eq!(events_of(&events), vec!["emit_int 5"]);
    assert_eq!(p.undef_cnt(), 0);
}

#[test]
fn test_fingerprint_stable_across_processes() {
    // emit stdout <- fingerprintof("abc")
    fn fingerprintof(p: &mut Process) -> Result<(), String> {
        let v = p.pop();
        let fp = v.fingerprint(&*p);
        v.dec_ref();
        let out = val::new_fingerprint(p.heap(), fp);
        p.push(out);
        Ok(())
    }

    let u = universe();
    let mut b = ProgramBuilder::new();
    let table = b.table(OutputTable {
        name: "stdout".to_string(),
        kind: TableKind::Collection,
        index_types: vec![],
        elem_type: u.fingerprint_type,
        weight_type: None,
        param: 0,
    });
    let lit = b.literal_string("abc");
    let native = b.native(fingerprintof);
    b.code.emit_op(Opcode::Enter).emit_i32(0).emit_i32(64);
    b.code.emit_op(Opcode::PushV).emit_u32(lit);
    b.code.emit_op(Opcode::Callc).emit_u32(native);
    b.code.emit_op(Opcode::Emit).emit_u16(table);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 0);
    let program = b.finish();

    let expected = format!("fingerprint 0x{:016x}", fingerprint_bytes(b"abc"));
    for _ in 0..2 {
        let (status, _p, events) = run_one(&program);
        assert_eq!(status, Status::Completed);
        assert!(
            events_of(&events).contains(&expected),
            "fingerprint must be stable across processes"
        );
    }
}

#[test]
fn test_conversion_failure_fails_record() {
    // x: int = int("not-a-number"); no trap range => the record is undef.
    let mut b = ProgramBuilder::new();
    let table = int_collection(&mut b, "stdout");
    let lit = b.literal_string("not-a-number");
    b.code.emit_op(Opcode::Enter).emit_i32(1).emit_i32(64);
    b.code.emit_op(Opcode::Push8).emit_i8(0); // base
    b.code.emit_op(Opcode::PushV).emit_u32(lit);
    b.code
        .emit_op(Opcode::Basicconv)
        .emit_u8(ConversionOp::Str2Int as u8)
        .emit_u32(u32::MAX);
    b.code.emit_op(Opcode::StoreV).emit_i16(0);
    b.code.emit_op(Opcode::LoadV).emit_i16(0);
    b.code.emit_op(Opcode::Emit).emit_u16(table);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 1);
    let program = b.finish();

    let (status, p, events) = run_one(&program);
    assert_eq!(status, Status::Failed);
    assert!(events_of(&events).is_empty(), "the record emits nothing");
    assert_eq!(p.undef_cnt(), 1);
    assert_eq!(p.undef_details().values().sum::<u64>(), 1);
}

#[test]
fn test_trap_range_recovers_record() {
    // Same failing conversion, but inside a trap range whose handler
    // stores a fallback value.
    let mut b = ProgramBuilder::new();
    let table = int_collection(&mut b, "stdout");
    let lit = b.literal_string("not-a-number");
    b.code.emit_op(Opcode::Enter).emit_i32(1).emit_i32(64);
    let begin = b.code.here();
    b.code.emit_op(Opcode::Push8).emit_i8(0);
    b.code.emit_op(Opcode::PushV).emit_u32(lit);
    b.code
        .emit_op(Opcode::Basicconv)
        .emit_u8(ConversionOp::Str2Int as u8)
        .emit_u32(u32::MAX);
    b.code.emit_op(Opcode::StoreV).emit_i16(0);
    let end = b.code.here();
    b.code.emit_op(Opcode::Branch);
    let join = b.code.emit_branch_fwd();
    let handler = b.code.here();
    b.code.emit_op(Opcode::Push8).emit_i8(42);
    b.code.emit_op(Opcode::StoreV).emit_i16(0);
    let done = b.code.here();
    b.code.patch_branch(join, done);
    b.code.emit_op(Opcode::LoadV).emit_i16(0);
    b.code.emit_op(Opcode::Emit).emit_u16(table);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    // Recovery: empty operand stack above one local.
    b.trap_range(begin as u32, end as u32, handler as u32, 3);
    b.function("main", 0, 1, 1);
    let program = b.finish();

    let (status, p, events) = run_one(&program);
    assert_eq!(status, Status::Completed);
    assert_eq!(events_of(&events), vec!["emit_int 42"]);
    assert_eq!(p.undef_cnt(), 0, "handled traps do not fail the record");
}

#[test]
fn test_slice_uniq_on_write() {
    // a = new(array of int, 5, 0); b = a; a[0] = 1
    // => b[0] == 0 and a[0] == 1.
    let u = universe();
    let mut b = ProgramBuilder::new();
    let table = int_collection(&mut b, "stdout");
    let at = b.type_(u.array_of_int);
    b.code.emit_op(Opcode::Enter).emit_i32(2).emit_i32(64);
    b.code.emit_op(Opcode::Push8).emit_i8(5);
    b.code.emit_op(Opcode::Push8).emit_i8(0);
    b.code.emit_op(Opcode::NewA).emit_u32(at);
    b.code.emit_op(Opcode::StoreV).emit_i16(0); // a
    b.code.emit_op(Opcode::LoadV).emit_i16(0);
    b.code.emit_op(Opcode::StoreV).emit_i16(1); // b = a
    b.code.emit_op(Opcode::LoadVu).emit_i16(0); // uniq a for the write
    b.code.emit_op(Opcode::Push8).emit_i8(0);
    b.code.emit_op(Opcode::Push8).emit_i8(1);
    b.code.emit_op(Opcode::XstoreV); // a[0] = 1
    b.code.emit_op(Opcode::LoadV).emit_i16(1);
    b.code.emit_op(Opcode::Push8).emit_i8(0);
    b.code.emit_op(Opcode::XloadV);
    b.code.emit_op(Opcode::Emit).emit_u16(table); // emit b[0]
    b.code.emit_op(Opcode::LoadV).emit_i16(0);
    b.code.emit_op(Opcode::Push8).emit_i8(0);
    b.code.emit_op(Opcode::XloadV);
    b.code.emit_op(Opcode::Emit).emit_u16(table); // emit a[0]
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 2);
    let program = b.finish();

    let (status, _p, events) = run_one(&program);
    assert_eq!(status, Status::Completed);
    assert_eq!(events_of(&events), vec!["emit_int 0", "emit_int 1"]);
}

#[test]
fn test_map_store_and_index() {
    let u = universe();
    let mut b = ProgramBuilder::new();
    let table = int_collection(&mut b, "stdout");
    let mt = b.type_(Type::map(u.int_type, u.int_type));
    b.code.emit_op(Opcode::Enter).emit_i32(1).emit_i32(64);
    b.code.emit_op(Opcode::Push8).emit_i8(8);
    b.code.emit_op(Opcode::NewM).emit_u32(mt);
    b.code.emit_op(Opcode::StoreV).emit_i16(0);
    // m[5] = 50
    b.code.emit_op(Opcode::LoadVu).emit_i16(0);
    b.code.emit_op(Opcode::Push8).emit_i8(5);
    b.code.emit_op(Opcode::MinsertV);
    b.code.emit_op(Opcode::Push8).emit_i8(50);
    b.code.emit_op(Opcode::MstoreV);
    // emit m[5]
    b.code.emit_op(Opcode::LoadV).emit_i16(0);
    b.code.emit_op(Opcode::Push8).emit_i8(5);
    b.code.emit_op(Opcode::MindexV);
    b.code.emit_op(Opcode::Emit).emit_u16(table);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 1);
    let program = b.finish();

    let (status, _p, events) = run_one(&program);
    assert_eq!(status, Status::Completed);
    assert_eq!(events_of(&events), vec!["emit_int 50"]);
}

#[test]
fn test_map_miss_traps() {
    let u = universe();
    let mut b = ProgramBuilder::new();
    let table = int_collection(&mut b, "stdout");
    let mt = b.type_(Type::map(u.int_type, u.int_type));
    b.code.emit_op(Opcode::Enter).emit_i32(1).emit_i32(64);
    b.code.emit_op(Opcode::Push8).emit_i8(8);
    b.code.emit_op(Opcode::NewM).emit_u32(mt);
    b.code.emit_op(Opcode::StoreV).emit_i16(0);
    b.code.emit_op(Opcode::LoadV).emit_i16(0);
    b.code.emit_op(Opcode::Push8).emit_i8(99);
    b.code.emit_op(Opcode::MindexV);
    b.code.emit_op(Opcode::Emit).emit_u16(table);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 1);
    let program = b.finish();

    let (status, p, _events) = run_one(&program);
    assert_eq!(status, Status::Failed);
    assert_eq!(p.undef_cnt(), 1);
    assert!(
        p.undef_details()
            .keys()
            .any(|k| k.contains("undefined map value for key 99")),
        "details: {:?}",
        p.undef_details()
    );
}

#[test]
fn test_closure_call() {
    let u = universe();
    let mut b = ProgramBuilder::new();
    let table = int_collection(&mut b, "stdout");
    let ft = b.type_(Type::function(vec![], Some(u.int_type)));

    // main
    b.code.emit_op(Opcode::Enter).emit_i32(0).emit_i32(64);
    b.code.emit_op(Opcode::CreateC);
    let entry_site = b.code.emit_branch_fwd();
    b.code.emit_i8(0); // lexical level delta
    b.code.emit_u32(ft);
    b.code.emit_op(Opcode::Call);
    b.code.emit_op(Opcode::Emit).emit_u16(table);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    // f: returns 7
    let f_entry = b.code.here();
    b.code.patch_branch(entry_site, f_entry);
    b.code.emit_op(Opcode::Enter).emit_i32(0).emit_i32(64);
    b.code.emit_op(Opcode::Push8).emit_i8(7);
    b.code.emit_op(Opcode::RetV).emit_i16(0);
    b.function("main", 0, 1, 0);
    b.function("f", f_entry as u32, 0, 0);
    let program = b.finish();

    let (status, _p, events) = run_one(&program);
    assert_eq!(status, Status::Completed);
    assert_eq!(events_of(&events), vec!["emit_int 7"]);
}

#[test]
fn test_proto_skip_accounting() {
    // A 23-byte message; the program references only field 1, so 18
    // bytes (tags included) are skipped.
    let u = universe();
    let t = Type::tuple(
        vec![szl_runtime::core::FieldSpec::new("a", u.bytes_type).with_tag(1)],
        true,
        true,
    );
    let msg = hex::decode("0a030896011209120774657374696e671a051a03089601").unwrap();

    let mut b = ProgramBuilder::new();
    let ti = b.type_(t);
    let lit = b.literal_bytes(&msg);
    b.code.emit_op(Opcode::Enter).emit_i32(1).emit_i32(64);
    b.code.emit_op(Opcode::PushV).emit_u32(lit);
    b.code
        .emit_op(Opcode::Basicconv)
        .emit_u8(ConversionOp::Bytes2Proto as u8)
        .emit_u32(ti);
    b.code.emit_op(Opcode::StoreV).emit_i16(0);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 1);
    let program = b.finish();

    let mut p = Process::new(&program, ProcessConfig::default());
    let status = p.run_record(b"", 1_000_000);
    assert_eq!(status, Status::Completed);
    assert_eq!(p.proto_bytes_read(), 23);
    assert_eq!(p.proto_bytes_skipped(), 18);
}

#[test]
fn test_step_limit_suspends_and_resumes() {
    let mut b = ProgramBuilder::new();
    b.code.emit_op(Opcode::Enter).emit_i32(0).emit_i32(64);
    let top = b.code.here();
    b.code.emit_op(Opcode::Nop);
    b.code.emit_op(Opcode::Branch);
    b.code.emit_branch_to(top);
    b.function("main", 0, 1, 0);
    let program = b.finish();

    let mut p = Process::new(&program, ProcessConfig::default());
    assert_eq!(p.run_record(b"", 100), Status::StepLimit);
    assert_eq!(p.resume(100), Status::StepLimit);
    assert!(p.instructions_executed() >= 200);
}

#[test]
fn test_terminate_flag_cancels() {
    let mut b = ProgramBuilder::new();
    b.code.emit_op(Opcode::Enter).emit_i32(0).emit_i32(64);
    let top = b.code.here();
    b.code.emit_op(Opcode::Branch);
    b.code.emit_branch_to(top);
    b.function("main", 0, 1, 0);
    let program = b.finish();

    let mut p = Process::new(&program, ProcessConfig::default());
    assert_eq!(p.run_record(b"", 1000), Status::StepLimit);
    p.terminate_flag().store(true, std::sync::atomic::Ordering::Relaxed);
    assert_eq!(p.resume(1000), Status::Terminated);
}

#[test]
fn test_stop_fails_with_message() {
    let mut b = ProgramBuilder::new();
    let s = b.string("giving up");
    b.code.emit_op(Opcode::Enter).emit_i32(0).emit_i32(64);
    b.code.emit_op(Opcode::Stop).emit_u32(s);
    b.function("main", 0, 1, 0);
    let program = b.finish();

    let mut p = Process::new(&program, ProcessConfig::default());
    assert_eq!(p.run_record(b"", 1000), Status::Failed);
    assert_eq!(p.error_msg(), Some("giving up"));
}

#[test]
fn test_sweep_during_run_preserves_live_values() {
    // Grow a string in a loop while churning garbage; a tiny sweep
    // threshold forces compactions mid-record, which must rewrite the
    // stack roots and owner pointers without corrupting the live string.
    let mut b = ProgramBuilder::new();
    let u = universe();
    let table = b.table(OutputTable {
        name: "stdout".to_string(),
        kind: TableKind::Collection,
        index_types: vec![],
        elem_type: u.string_type,
        weight_type: None,
        param: 0,
    });
    let ab = b.literal_string("ab");
    let cd = b.literal_string("cd");
    b.code.emit_op(Opcode::Enter).emit_i32(2).emit_i32(64);
    b.code.emit_op(Opcode::PushV).emit_u32(ab);
    b.code.emit_op(Opcode::StoreV).emit_i16(0); // s = "ab"
    b.code.emit_op(Opcode::Push8).emit_i8(0);
    b.code.emit_op(Opcode::StoreV).emit_i16(1); // i = 0
    let loop_top = b.code.here();
    b.code.emit_op(Opcode::LoadV).emit_i16(1);
    b.code.emit_op(Opcode::Push8).emit_i8(50);
    b.code.emit_op(Opcode::LssInt);
    b.code.emit_op(Opcode::BranchFalse);
    let out = b.code.emit_branch_fwd();
    // garbage
    b.code.emit_op(Opcode::Push8).emit_i8(100);
    b.code.emit_op(Opcode::Push8).emit_i8(0);
    b.code.emit_op(Opcode::NewB);
    b.code.emit_op(Opcode::PopV);
    // s = s + "cd"
    b.code.emit_op(Opcode::LoadV).emit_i16(0);
    b.code.emit_op(Opcode::PushV).emit_u32(cd);
    b.code.emit_op(Opcode::AddString);
    b.code.emit_op(Opcode::StoreV).emit_i16(0);
    b.code.emit_op(Opcode::Inc64).emit_i16(1).emit_i8(1);
    b.code.emit_op(Opcode::Branch);
    b.code.emit_branch_to(loop_top);
    let end = b.code.here();
    b.code.patch_branch(out, end);
    b.code.emit_op(Opcode::LoadV).emit_i16(0);
    b.code.emit_op(Opcode::Emit).emit_u16(table);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 2);
    let program = b.finish();

    let config = ProcessConfig {
        heap_chunk_size: 1 << 10,
        heap_sweep_threshold: 2 << 10,
        ..ProcessConfig::default()
    };
    let mut p = Process::new(&program, config);
    let (em, events) = RecordingEmitter::new();
    p.install_emitter(0, Box::new(em));
    let status = p.run_record(b"", 1_000_000);
    assert_eq!(status, Status::Completed);
    let expected = format!("string ab{}", "cd".repeat(50));
    assert!(
        events_of(&events).contains(&expected),
        "live string corrupted across sweeps"
    );
    assert!(p.heap_stats().sweeps > 0, "the test must actually sweep");
    p.heap().check();
}

#[test]
fn test_string_conversion_round_trip_through_bytecode() {
    // emit string(int("0x2a", 0) + 1) via int2str base 10
    let u = universe();
    let mut b = ProgramBuilder::new();
    let table = b.table(OutputTable {
        name: "stdout".to_string(),
        kind: TableKind::Collection,
        index_types: vec![],
        elem_type: u.string_type,
        weight_type: None,
        param: 0,
    });
    let lit = b.literal_string("0x2a");
    b.code.emit_op(Opcode::Enter).emit_i32(1).emit_i32(64);
    b.code.emit_op(Opcode::Push8).emit_i8(0);
    b.code.emit_op(Opcode::PushV).emit_u32(lit);
    b.code
        .emit_op(Opcode::Basicconv)
        .emit_u8(ConversionOp::Str2Int as u8)
        .emit_u32(u32::MAX);
    b.code.emit_op(Opcode::Push8).emit_i8(1);
    b.code.emit_op(Opcode::AddInt);
    b.code.emit_op(Opcode::StoreV).emit_i16(0);
    b.code.emit_op(Opcode::Push8).emit_i8(10); // base for int2str
    b.code.emit_op(Opcode::LoadV).emit_i16(0);
    b.code
        .emit_op(Opcode::Basicconv)
        .emit_u8(ConversionOp::Int2Str as u8)
        .emit_u32(u32::MAX);
    b.code.emit_op(Opcode::Emit).emit_u16(table);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 1);
    let program = b.finish();

    let mut p = Process::new(&program, ProcessConfig::default());
    let (em, events) = RecordingEmitter::new();
    p.install_emitter(0, Box::new(em));
    assert_eq!(p.run_record(b"", 1_000_000), Status::Completed);
    assert!(events_of(&events).contains(&"string 43".to_string()));
}

#[test]
fn test_verify_sp_passes_on_correct_depth() {
    let mut b = ProgramBuilder::new();
    b.code.emit_op(Opcode::Enter).emit_i32(1).emit_i32(64);
    b.code.emit_op(Opcode::Push8).emit_i8(1);
    b.code.emit_op(Opcode::Push8).emit_i8(2);
    // one local + frame link slots + two operands
    b.code.emit_op(Opcode::VerifySp).emit_i32(5);
    b.code.emit_op(Opcode::PopV);
    b.code.emit_op(Opcode::PopV);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 1);
    let program = b.finish();
    let mut p = Process::new(&program, ProcessConfig::default());
    assert_eq!(p.run_record(b"", 1000), Status::Completed);
}

#[test]
fn test_records_are_independent() {
    // Failing record then a clean record: counters reflect both, the
    // second is unaffected by the first's trap.
    let mut b = ProgramBuilder::new();
    let table = int_collection(&mut b, "stdout");
    b.code.emit_op(Opcode::Enter).emit_i32(0).emit_i32(64);
    // input[0] as int, traps when the record is empty
    b.code.emit_op(Opcode::LoadV).emit_i16(-1);
    b.code.emit_op(Opcode::Push8).emit_i8(0);
    b.code.emit_op(Opcode::Xload8);
    b.code.emit_op(Opcode::Emit).emit_u16(table);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 0);
    let program = b.finish();

    let mut p = Process::new(&program, ProcessConfig::default());
    let (em, events) = RecordingEmitter::new();
    p.install_emitter(0, Box::new(em));
    assert_eq!(p.run_record(b"", 1000), Status::Failed);
    assert_eq!(p.run_record(&[65], 1000), Status::Completed);
    assert_eq!(p.undef_cnt(), 1);
    assert_eq!(p.records_processed(), 2);
    assert_eq!(p.records_failed(), 1);
    assert_eq!(events_of(&events), vec!["emit_int 65"]);
    p.heap().check();
}

#[test]
fn test_deep_equality_opcodes() {
    // [1,2] == [1,2] and [1,2] != [2,1] through the comparison opcodes.
    let u = universe();
    let mut b = ProgramBuilder::new();
    let table = int_collection(&mut b, "stdout");
    let at = b.type_(u.array_of_int);
    let emit_eq = |b: &mut ProgramBuilder, x: [i8; 2], y: [i8; 2], at: u32, table: u16| {
        for v in x {
            b.code.emit_op(Opcode::Push8).emit_i8(v);
        }
        b.code.emit_op(Opcode::CreateA).emit_i32(2).emit_u32(at);
        for v in y {
            b.code.emit_op(Opcode::Push8).emit_i8(v);
        }
        b.code.emit_op(Opcode::CreateA).emit_i32(2).emit_u32(at);
        b.code.emit_op(Opcode::EqlArray);
        b.code.emit_op(Opcode::GetCc);
        // bool -> int via typecast to make the scalar emit shortcut fire
        let ti = b.type_(universe().int_type);
        b.code
            .emit_op(Opcode::Basicconv)
            .emit_u8(ConversionOp::Typecast as u8)
            .emit_u32(ti);
        b.code.emit_op(Opcode::Emit).emit_u16(table);
    };
    b.code.emit_op(Opcode::Enter).emit_i32(0).emit_i32(64);
    emit_eq(&mut b, [1, 2], [1, 2], at, table);
    emit_eq(&mut b, [1, 2], [2, 1], at, table);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 0);
    let program = b.finish();

    let (status, _p, events) = run_one(&program);
    assert_eq!(status, Status::Completed);
    assert_eq!(events_of(&events), vec!["emit_int 1", "emit_int 0"]);
}
