//! Output-table flavors: file and proc emits, descriptor caching, and
//! the restricted-I/O denial.

use szl_runtime::core::universe;
use szl_runtime::{
    Opcode, OutputTable, Process, ProcessConfig, Program, ProgramBuilder, Status, TableKind,
};

/// Program: emit two string lines to a file table named by a literal.
fn file_program(path: &str, kind: TableKind) -> Program {
    let u = universe();
    let mut b = ProgramBuilder::new();
    let table = b.table(OutputTable {
        name: "log".to_string(),
        kind,
        index_types: vec![u.string_type],
        elem_type: u.string_type,
        weight_type: None,
        param: 0,
    });
    let name = b.literal_string(path);
    let line1 = b.literal_string("first line\n");
    let line2 = b.literal_string("second line\n");
    b.code.emit_op(Opcode::Enter).emit_i32(0).emit_i32(64);
    for line in [line1, line2] {
        b.code.emit_op(Opcode::PushV).emit_u32(name);
        b.code.emit_op(Opcode::PushV).emit_u32(line);
        b.code.emit_op(Opcode::Emit).emit_u16(table);
    }
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 0);
    b.finish()
}

#[test]
fn test_file_table_appends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.log");
    let program = file_program(path.to_str().unwrap(), TableKind::File);

    let mut p = Process::new(&program, ProcessConfig::default());
    assert_eq!(p.run_record(b"", 10_000), Status::Completed);
    // Second record reuses the cached descriptor and keeps appending.
    assert_eq!(p.run_record(b"", 10_000), Status::Completed);

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        text,
        "first line\nsecond line\nfirst line\nsecond line\n"
    );
}

#[test]
fn test_file_table_denied_in_restricted_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("denied.log");
    let program = file_program(path.to_str().unwrap(), TableKind::File);

    let config = ProcessConfig {
        restrict_io: true,
        ..ProcessConfig::default()
    };
    let mut p = Process::new(&program, config);
    assert_eq!(p.run_record(b"", 10_000), Status::Failed);
    assert!(!path.exists(), "restricted mode must not open files");
    assert!(
        p.undef_details()
            .keys()
            .any(|k| k.contains("denied in restricted mode")),
        "details: {:?}",
        p.undef_details()
    );
}

#[test]
fn test_proc_table_pipes_to_command() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("piped.log");
    let cmd = format!("cat > {}", path.display());
    let program = file_program(&cmd, TableKind::Proc);

    let mut p = Process::new(&program, ProcessConfig::default());
    assert_eq!(p.run_record(b"", 10_000), Status::Completed);
    drop(p); // closes the child's stdin and waits for it
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text, "first line\nsecond line\n");
}

#[test]
fn test_missing_emitter_fails_record() {
    let u = universe();
    let mut b = ProgramBuilder::new();
    let table = b.table(OutputTable {
        name: "t".to_string(),
        kind: TableKind::Sum,
        index_types: vec![],
        elem_type: u.int_type,
        weight_type: None,
        param: 0,
    });
    b.code.emit_op(Opcode::Enter).emit_i32(0).emit_i32(64);
    b.code.emit_op(Opcode::Push8).emit_i8(1);
    b.code.emit_op(Opcode::Emit).emit_u16(table);
    b.code.emit_op(Opcode::Ret).emit_i16(1);
    b.function("main", 0, 1, 0);
    let program = b.finish();

    let mut p = Process::new(&program, ProcessConfig::default());
    assert_eq!(p.run_record(b"", 10_000), Status::Failed);
    assert!(
        p.undef_details()
            .keys()
            .any(|k| k.contains("no emitter installed")),
        "details: {:?}",
        p.undef_details()
    );
}
