//! Process State
//!
//! A Process owns everything one executing program instance needs: the
//! heap, the value stack, the interpreter registers, trap state, the
//! terminate flag, counters, and the output plumbing. Processes share
//! nothing with each other; the Program they borrow is read-only.
//!
//! The stack grows toward lower indices. `sp` names the top element (the
//! empty stack has `sp == stack.len()`); the globals frame sits at the
//! high end and survives across records.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use szl_core::fingerprint::{fingerprint_cat, fingerprint_u64};
use szl_core::{Heap, Val, ValEnv, val};

use crate::frame::{self, FRAME_SLOTS, SENTINEL_PC};
use crate::outputter::{Emitter, OutputState};
use crate::program::Program;

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub heap_chunk_size: usize,
    pub heap_sweep_threshold: usize,
    pub stack_slots: usize,
    /// Deny file/proc output tables.
    pub restrict_io: bool,
    /// Fail proto decoding on unknown tags instead of skipping them.
    pub strict_proto: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            heap_chunk_size: 256 << 10,
            heap_sweep_threshold: 4 << 20,
            stack_slots: 16 << 10,
            restrict_io: false,
            strict_proto: false,
        }
    }
}

/// Result of an `execute` slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The record ran to completion.
    Completed,
    /// The step budget expired; state is saved, resume to continue.
    StepLimit,
    /// The driver's terminate flag was observed.
    Terminated,
    /// The record failed on an unhandled trap (or an explicit stop).
    Failed,
}

pub struct Process<'p> {
    pub(crate) program: &'p Program,
    pub(crate) heap: Heap,
    pub(crate) stack: Box<[Val]>,
    pub(crate) pc: usize,
    pub(crate) sp: usize,
    pub(crate) fp: usize,
    pub(crate) bp: usize,
    pub(crate) globals_fp: usize,
    pub(crate) cc: bool,
    pub(crate) config: ProcessConfig,

    trap: Option<String>,
    error_msg: Option<String>,
    terminate: Arc<AtomicBool>,

    // Telemetry.
    pub(crate) steps_total: u64,
    pub(crate) records: u64,
    pub(crate) failed_records: u64,
    pub(crate) undef_cnt: u64,
    pub(crate) undef_details: HashMap<String, u64>,
    pub(crate) proto_bytes_read: u64,
    pub(crate) proto_bytes_skipped: u64,

    pub(crate) emitters: Vec<Option<Box<dyn Emitter>>>,
    pub(crate) outputs: Vec<OutputState>,
}

impl<'p> Process<'p> {
    pub fn new(program: &'p Program, config: ProcessConfig) -> Process<'p> {
        let mut stack = vec![Val::NULL; config.stack_slots].into_boxed_slice();
        let len = stack.len();

        // Globals frame: return pc is the sentinel, both links point at
        // the frame itself.
        let fp = len - 1;
        stack[fp] = Val::from_smi(SENTINEL_PC as i64);
        stack[fp - 1] = Val::from_smi(fp as i64);
        stack[fp - 2] = Val::from_smi(fp as i64);
        let sp = fp - 2 - program.globals_size as usize;

        let emitters = (0..program.tables.len()).map(|_| None).collect();
        let outputs = program.tables.iter().map(OutputState::new).collect();

        Process {
            program,
            heap: Heap::new(config.heap_chunk_size, config.heap_sweep_threshold),
            stack,
            pc: 0,
            sp,
            fp,
            bp: fp,
            globals_fp: fp,
            cc: false,
            config,
            trap: None,
            error_msg: None,
            terminate: Arc::new(AtomicBool::new(false)),
            steps_total: 0,
            records: 0,
            failed_records: 0,
            undef_cnt: 0,
            undef_details: HashMap::new(),
            proto_bytes_read: 0,
            proto_bytes_skipped: 0,
            emitters,
            outputs,
        }
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    pub fn heap(&mut self) -> &mut Heap {
        &mut self.heap
    }

    // =========================================================================
    // Stack
    // =========================================================================

    #[inline]
    pub fn push(&mut self, v: Val) {
        if self.sp == 0 {
            panic!("value stack overflow");
        }
        self.sp -= 1;
        self.stack[self.sp] = v;
    }

    #[inline]
    pub fn pop(&mut self) -> Val {
        debug_assert!(self.sp < self.stack.len(), "value stack underflow");
        let v = self.stack[self.sp];
        self.sp += 1;
        v
    }

    #[inline]
    pub fn top(&self) -> Val {
        self.stack[self.sp]
    }

    /// Expression-stack depth below the current frame's locals.
    pub fn expr_depth(&self) -> usize {
        self.fp - self.sp
    }

    // Convenience poppers: the value's reference is released and the
    // payload returned.

    pub fn pop_int(&mut self) -> i64 {
        let v = self.pop();
        let x = v.as_int();
        v.dec_ref();
        x
    }

    pub fn pop_uint(&mut self) -> u64 {
        let v = self.pop();
        let x = v.as_uint();
        v.dec_ref();
        x
    }

    pub fn pop_float(&mut self) -> f64 {
        let v = self.pop();
        let x = v.as_float();
        v.dec_ref();
        x
    }

    pub fn pop_bool(&mut self) -> bool {
        let v = self.pop();
        let x = v.as_bool();
        v.dec_ref();
        x
    }

    pub fn pop_bits(&mut self) -> u64 {
        let v = self.pop();
        let x = v.basic64();
        v.dec_ref();
        x
    }

    pub fn push_int(&mut self, x: i64) {
        let v = val::new_int(&mut self.heap, x);
        self.push(v);
    }

    pub fn push_uint(&mut self, x: u64) {
        let v = val::new_uint(&mut self.heap, x);
        self.push(v);
    }

    pub fn push_float(&mut self, x: f64) {
        let v = val::new_float(&mut self.heap, x);
        self.push(v);
    }

    pub fn push_bool(&mut self, x: bool) {
        let v = val::new_bool(&mut self.heap, x);
        self.push(v);
    }

    /// Release every reference in stack slots `[self.sp, to)` and drop
    /// down to `to`. Frame words are smis, so they release as no-ops.
    pub(crate) fn release_to(&mut self, to: usize) {
        debug_assert!(to >= self.sp);
        for i in self.sp..to {
            self.stack[i].dec_ref();
            self.stack[i] = Val::NULL;
        }
        self.sp = to;
    }

    // =========================================================================
    // Traps and termination
    // =========================================================================

    /// Raise the undef trap. The first message wins until handled.
    pub fn trap(&mut self, msg: impl Into<String>) {
        if self.trap.is_none() {
            self.trap = Some(msg.into());
        }
    }

    pub fn has_trap(&self) -> bool {
        self.trap.is_some()
    }

    pub(crate) fn take_trap(&mut self) -> Option<String> {
        self.trap.take()
    }

    /// Count one record failed on an unhandled trap.
    pub(crate) fn record_undef(&mut self, msg: &str) {
        self.undef_cnt += 1;
        *self.undef_details.entry(msg.to_string()).or_insert(0) += 1;
        self.error_msg = Some(msg.to_string());
    }

    /// Record a failure message without the undef accounting (explicit
    /// stop).
    pub(crate) fn set_error(&mut self, msg: &str) {
        self.error_msg = Some(msg.to_string());
    }

    /// The message of the most recent failure, if any.
    pub fn error_msg(&self) -> Option<&str> {
        self.error_msg.as_deref()
    }

    /// Handle the driver can set from another thread to cancel execution.
    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        self.terminate.clone()
    }

    pub fn terminated(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Heap integration
    // =========================================================================

    /// Sweep with the live stack (globals included) as the root set. Only
    /// legal at a dispatch boundary.
    pub fn sweep(&mut self) {
        let sp = self.sp;
        self.heap.sweep(&mut self.stack[sp..]);
    }

    pub(crate) fn maybe_sweep(&mut self) {
        if self.heap.needs_sweep() {
            self.sweep();
        }
    }

    // =========================================================================
    // Record setup
    // =========================================================================

    /// Push a frame for function `findex` whose return completes the
    /// record. Parameters must already be on the stack.
    pub(crate) fn push_entry_frame(&mut self, findex: u32) {
        let entry = self.program.function(findex).entry as usize;
        self.push(Val::from_smi(SENTINEL_PC as i64)); // return_pc
        self.push(Val::from_smi(self.globals_fp as i64)); // dynamic_link
        self.push(Val::from_smi(self.globals_fp as i64)); // static_link
        self.fp = self.sp + FRAME_SLOTS - 1;
        self.bp = self.fp;
        self.pc = entry;
    }

    /// Discard everything below the globals frame and clear per-record
    /// state. Transient heap values lose their stack references here and
    /// are reclaimed by the next sweep.
    pub fn reset_record(&mut self) {
        let globals_base = self.globals_fp - 2 - self.program.globals_size as usize;
        self.release_to(globals_base);
        self.fp = self.globals_fp;
        self.bp = self.globals_fp;
        self.trap = None;
        self.cc = false;
    }

    /// Run the static initializers (once, before the first record).
    pub fn initialize(&mut self, max_steps: i32) -> Status {
        match self.program.init {
            Some(f) => {
                self.push_entry_frame(f);
                crate::engine::execute(self, max_steps).0
            }
            None => Status::Completed,
        }
    }

    /// Execute one input record: the record is pushed as the bytes
    /// parameter of the main function.
    pub fn run_record(&mut self, input: &[u8], max_steps: i32) -> Status {
        self.reset_record();
        let rec = val::new_bytes_init(&mut self.heap, input);
        self.push(rec);
        self.push_entry_frame(self.program.main);
        self.records += 1;
        let (status, _) = crate::engine::execute(self, max_steps);
        if status == Status::Failed {
            self.failed_records += 1;
        }
        status
    }

    /// Continue after a StepLimit return.
    pub fn resume(&mut self, max_steps: i32) -> Status {
        let (status, _) = crate::engine::execute(self, max_steps);
        if status == Status::Failed {
            self.failed_records += 1;
        }
        status
    }

    // =========================================================================
    // Output
    // =========================================================================

    /// Install the emitter for an output table index.
    pub fn install_emitter(&mut self, table: usize, emitter: Box<dyn Emitter>) {
        self.emitters[table] = Some(emitter);
    }

    pub fn records_processed(&self) -> u64 {
        self.records
    }

    pub fn records_failed(&self) -> u64 {
        self.failed_records
    }

    pub fn instructions_executed(&self) -> u64 {
        self.steps_total
    }

    pub fn heap_stats(&self) -> szl_core::heap::HeapStats {
        self.heap.stats()
    }

    pub fn undef_cnt(&self) -> u64 {
        self.undef_cnt
    }

    pub fn undef_details(&self) -> &HashMap<String, u64> {
        &self.undef_details
    }

    pub fn proto_bytes_read(&self) -> u64 {
        self.proto_bytes_read
    }

    pub fn proto_bytes_skipped(&self) -> u64 {
        self.proto_bytes_skipped
    }
}

impl ValEnv for Process<'_> {
    /// Closure fingerprints pair the function index with the dynamic
    /// nesting level of the captured frame. Distinct call chains at equal
    /// depth can collide; a known limitation.
    fn closure_fingerprint(&self, entry: u32, context: u32) -> u64 {
        let index = self.program.function_by_entry(entry).unwrap_or(entry);
        let level = frame::static_level(&self.stack, context as usize);
        fingerprint_cat(fingerprint_u64(index as u64), level as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ProgramBuilder;

    fn empty_program() -> Program {
        let mut b = ProgramBuilder::new();
        b.set_globals_size(4);
        b.function("main", 0, 0, 0);
        b.finish()
    }

    #[test]
    fn test_stack_push_pop() {
        let program = empty_program();
        let mut p = Process::new(&program, ProcessConfig::default());
        let base = p.sp;
        p.push(Val::from_smi(1));
        p.push(Val::from_smi(2));
        assert_eq!(p.pop().as_smi(), 2);
        assert_eq!(p.pop().as_smi(), 1);
        assert_eq!(p.sp, base);
    }

    #[test]
    fn test_globals_frame_links_to_itself() {
        let program = empty_program();
        let p = Process::new(&program, ProcessConfig::default());
        assert_eq!(frame::static_link(&p.stack, p.globals_fp), p.globals_fp);
        assert_eq!(frame::return_pc(&p.stack, p.globals_fp), SENTINEL_PC);
    }

    #[test]
    fn test_trap_first_message_wins() {
        let program = empty_program();
        let mut p = Process::new(&program, ProcessConfig::default());
        p.trap("first");
        p.trap("second");
        assert_eq!(p.take_trap().as_deref(), Some("first"));
        assert!(!p.has_trap());
    }

    #[test]
    fn test_terminate_flag_shared() {
        let program = empty_program();
        let p = Process::new(&program, ProcessConfig::default());
        let flag = p.terminate_flag();
        assert!(!p.terminated());
        flag.store(true, Ordering::Relaxed);
        assert!(p.terminated());
    }

    #[test]
    fn test_release_to_clears_slots() {
        let program = empty_program();
        let mut p = Process::new(&program, ProcessConfig::default());
        let base = p.sp;
        p.push_uint(1);
        p.push_uint(2);
        let kept = p.stack[p.sp];
        assert_eq!(kept.ref_(), 1);
        p.release_to(base);
        assert_eq!(p.sp, base);
        assert_eq!(kept.ref_(), 0, "released reference");
    }
}
